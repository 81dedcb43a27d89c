// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates fields and turns the result into core/bridge settings
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_agent::config::BackendConfig;
use switchyard_agent::AgentRegistry;
use switchyard_core::{BridgeSettings, GatewaySettings};

/// Config file read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "switchyard.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL backends use to reach the MCP bridge. Defaults to
    /// `http://<host>:<port>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Working directory handed to new backend sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Name the MCP bridge is registered under in backend sessions
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_namespace_separator")]
    pub namespace_separator: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "switchyard".to_string()
}

fn default_namespace_separator() -> String {
    "__".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            working_dir: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            namespace_separator: default_namespace_separator(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration with environment overrides and validation.
    ///
    /// An explicit `path` must exist. Without one, `switchyard.toml` is read
    /// if present and defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override with environment variables if present
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("SWITCHYARD_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("SWITCHYARD_PORT") {
            self.server.port = val.parse().with_context(|| {
                format!("SWITCHYARD_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("SWITCHYARD_PUBLIC_URL") {
            self.server.public_url = Some(val);
        }
        if let Ok(val) = std::env::var("SWITCHYARD_BACKEND") {
            self.backend.backend_type = val;
        }
        if let Ok(val) = std::env::var("SWITCHYARD_AGENT_BINARY") {
            self.backend
                .config
                .insert("binary".to_string(), toml::Value::String(val));
        }
        if let Ok(val) = std::env::var("SWITCHYARD_WORKING_DIR") {
            self.backend
                .config
                .insert("working_dir".to_string(), toml::Value::String(val.clone()));
            self.server.working_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("SWITCHYARD_TOOL_TIMEOUT_SECS") {
            self.bridge.tool_timeout_secs = val.parse().with_context(|| {
                format!(
                    "SWITCHYARD_TOOL_TIMEOUT_SECS must be a number of seconds, got: {}",
                    val
                )
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host is required (set in config or SWITCHYARD_HOST env var)");
        }
        if self.bridge.tool_timeout_secs == 0 {
            anyhow::bail!("bridge.tool_timeout_secs must be greater than zero");
        }
        if self.bridge.namespace_separator.is_empty() {
            anyhow::bail!("bridge.namespace_separator must not be empty");
        }
        if self.bridge.server_name.trim().is_empty() {
            anyhow::bail!("bridge.server_name must not be empty");
        }
        AgentRegistry::default().validate(&self.backend)?;
        if let Some(url) = &self.server.public_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("server.public_url must be an http(s) URL, got: {}", url);
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn public_url(&self) -> String {
        self.server
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr()))
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            namespace_separator: self.bridge.namespace_separator.clone(),
            tool_timeout: Duration::from_secs(self.bridge.tool_timeout_secs),
            server_name: self.bridge.server_name.clone(),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            public_url: self.public_url(),
            mcp_server_name: self.bridge.server_name.clone(),
            working_dir: self.server.working_dir.clone(),
        }
    }
}
