// ABOUTME: Canonical event algebra emitted by agent sessions.
// ABOUTME: Text deltas, turn boundaries carrying tool requests, idle, errors, and usage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted by a backend session while it processes prompts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentEvent {
    /// Streaming text increment
    TextDelta(String),

    /// The backend finished a turn. A non-empty list means it wants tools run
    /// before it can continue.
    TurnBoundary {
        #[serde(default)]
        tool_requests: Vec<ToolRequest>,
    },

    /// The session has nothing left to do for the current prompt
    Idle,

    /// The session failed
    Error {
        /// Typed error code for programmatic handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
    },

    /// Token and cost accounting for the last model call
    Usage(Usage),
}

impl AgentEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        AgentEvent::Error {
            code,
            message: message.into(),
        }
    }
}

/// A tool invocation the backend intends to make
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    /// Backend-assigned call identifier
    pub call_id: String,
    /// Tool name as the backend reports it (may be namespaced or abbreviated)
    pub name: String,
    /// Arguments object
    #[serde(default)]
    pub arguments: Value,
    /// Whether this call is routed through the external tool bridge rather
    /// than executed by one of the backend's built-in tools
    #[serde(default)]
    pub bridged: bool,
}

impl ToolRequest {
    pub fn bridged(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            bridged: true,
        }
    }

    pub fn builtin(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            bridged: false,
            ..Self::bridged(call_id, name, arguments)
        }
    }
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request timed out
    Timeout,
    /// Rate limited by the backend
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// Session no longer exists
    SessionOrphaned,
    /// Prompt was cancelled
    Cancelled,
    /// Backend-specific error
    BackendError,
    /// Unknown error
    Unknown,
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Model that produced the usage, if the backend reports it
    pub model: Option<String>,
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    pub cost_usd: Option<f64>,
}
