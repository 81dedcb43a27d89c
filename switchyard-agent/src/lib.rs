// ABOUTME: Agent backend boundary for switchyard.
// ABOUTME: Backends run behind Send+Sync handles and stream canonical events per session.

pub mod config;
pub mod event;
pub mod handle;
pub mod model;
pub mod registry;

pub mod backends;

pub use config::{McpServerConfig, SessionConfig};
pub use event::{AgentEvent, ErrorCode, ToolRequest, Usage};
pub use handle::{AgentHandle, EventReceiver, SessionHandle};
pub use model::ModelInfo;
pub use registry::{AgentRegistry, BackendFactory, ConfigCheck};
