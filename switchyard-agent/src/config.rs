// ABOUTME: Session and backend configuration for switchyard-agent.
// ABOUTME: SessionConfig is per conversation; BackendConfig is the TOML [backend] table.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options for creating one backend session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Model id the session should use
    pub model: Option<String>,
    /// System instructions supplied by the client
    pub system_prompt: Option<String>,
    /// MCP servers the backend should attach to this session
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Working directory override
    pub working_dir: Option<PathBuf>,
}

/// An HTTP MCP server the backend's tool subsystem can call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
}

/// Backend configuration with type discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type: "acp", "mock"
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Remaining fields passed to backend factory
    #[serde(flatten)]
    pub config: toml::Table,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: "acp".to_string(),
            config: toml::Table::new(),
        }
    }
}

impl BackendConfig {
    /// Get backend type name
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    /// Convert config table to serde_json::Value for registry
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_else(|_| serde_json::json!({}))
    }
}
