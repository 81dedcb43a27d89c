// ABOUTME: Protocol-agnostic gateway core: conversations, tool bridging, streaming translation.
// ABOUTME: Dialect crates plug in a ProtocolRenderer; everything else is shared.

pub mod bridge;
pub mod conversation;
pub mod exchange;
pub mod lifecycle;
pub mod message;
pub mod metrics;
pub mod reply;
pub mod streaming;
pub mod tool_cache;
pub mod tool_router;

pub use bridge::{BridgeSettings, ToolBridgeState};
pub use conversation::{Conversation, ConversationManager, NewRequestMatch};
pub use exchange::{Exchange, ExchangeKind, ExchangeRequest, Gateway, GatewayError, GatewaySettings};
pub use lifecycle::SessionLifecycle;
pub use message::{ChatMessage, ContentPart, Role};
pub use reply::{DoneSignal, ReplyError, ReplyTracker, Transport, TransportStream, WireFrame};
pub use streaming::{handle_disconnect, watch_disconnect, ProtocolRenderer, StreamingCore, ToolCall, TurnOutcome};
pub use tool_cache::{ToolCache, ToolDefinition};
pub use tool_router::{PendingCall, RejectReason, ResolveOutcome, RouterError, ToolRouter};

// Re-export switchyard-agent types
pub use switchyard_agent::{AgentEvent, AgentHandle, SessionHandle};
