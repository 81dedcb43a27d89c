// ABOUTME: Per-conversation tool-bridging state: tool cache, tool router, reply tracker, lifecycle.
// ABOUTME: Everything downstream of a conversation id reaches its state through here.

use crate::lifecycle::SessionLifecycle;
use crate::reply::ReplyTracker;
use crate::tool_cache::{ToolCache, ToolDefinition};
use crate::tool_router::{ToolRouter, DEFAULT_TOOL_TIMEOUT};
use serde_json::Value;
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

/// Settings shared by every conversation's bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Separator between namespace segments in tool names
    pub namespace_separator: String,
    /// How long a bridged tool invocation waits for the client's result
    pub tool_timeout: Duration,
    /// Name the bridge is registered under in backend sessions
    pub server_name: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            namespace_separator: "__".to_string(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            server_name: "switchyard".to_string(),
        }
    }
}

impl BridgeSettings {
    /// How backends spell tools reached through this bridge
    pub fn bridge_prefix(&self) -> String {
        format!("mcp__{}__", self.server_name)
    }
}

pub struct ToolBridgeState {
    tools: RwLock<ToolCache>,
    router: ToolRouter,
    reply: ReplyTracker,
    lifecycle: SessionLifecycle,
}

impl ToolBridgeState {
    pub fn new(settings: &BridgeSettings) -> Self {
        let router = ToolRouter::new(settings.tool_timeout);
        Self {
            tools: RwLock::new(
                ToolCache::new(settings.namespace_separator.clone())
                    .with_bridge_prefix(settings.bridge_prefix()),
            ),
            lifecycle: SessionLifecycle::new(router.clone()),
            router,
            reply: ReplyTracker::new(),
        }
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn reply(&self) -> &ReplyTracker {
        &self.reply
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub fn cache_tools(&self, tools: Vec<ToolDefinition>) {
        let count = tools.len();
        self.tools_write().cache_tools(tools);
        tracing::debug!(count, "Cached client tools");
    }

    /// Bridging is active once the client has supplied tools
    pub fn bridging_active(&self) -> bool {
        !self.tools_read().is_empty()
    }

    pub fn resolve_name(&self, name: &str) -> String {
        self.tools_read().resolve_name(name)
    }

    pub fn normalize_arguments(&self, name: &str, arguments: Value) -> Value {
        self.tools_read().normalize_arguments(name, arguments)
    }

    pub fn listed_tools(&self) -> Vec<ToolDefinition> {
        self.tools_read().listed_tools()
    }

    fn tools_read(&self) -> RwLockReadGuard<'_, ToolCache> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn tools_write(&self) -> std::sync::RwLockWriteGuard<'_, ToolCache> {
        self.tools.write().unwrap_or_else(|e| e.into_inner())
    }
}
