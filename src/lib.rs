// ABOUTME: Root library module for the switchyard HTTP gateway
// ABOUTME: Exposes config, the client dialects, the MCP bridge endpoint, and the server

pub mod config;
pub mod dialects;
pub mod mcp;
pub mod server;

// Re-export the platform-agnostic pieces from switchyard-core
pub use switchyard_core::metrics;
pub use switchyard_core::{ConversationManager, Gateway, GatewaySettings};

// Re-export switchyard-agent types for convenience
pub use switchyard_agent::{AgentEvent, AgentHandle, AgentRegistry};
