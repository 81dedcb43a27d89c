// ABOUTME: Catalogue of the backends this build can start, keyed by `[backend] type`.
// ABOUTME: Each entry checks its own config table up front, then starts an AgentHandle from it.

use crate::config::BackendConfig;
use crate::handle::AgentHandle;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Starts a backend from its `[backend]` table
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<AgentHandle> + Send + Sync>;

/// Checks a `[backend]` table without starting anything
pub type ConfigCheck = Box<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Backends left out of this build, with the cargo feature that adds them
#[cfg(not(feature = "acp"))]
const FEATURE_GATED: &[(&str, &str)] = &[("acp", "acp")];
#[cfg(feature = "acp")]
const FEATURE_GATED: &[(&str, &str)] = &[];

struct Entry {
    check: ConfigCheck,
    factory: BackendFactory,
}

/// Registry for runtime backend selection
pub struct AgentRegistry {
    entries: BTreeMap<String, Entry>,
}

impl AgentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a backend whose table needs no checking beyond what the
    /// factory does
    pub fn register<F>(self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<AgentHandle> + Send + Sync + 'static,
    {
        self.register_checked(name, |_| Ok(()), factory)
    }

    /// Register a backend with a config check run by [`validate`](Self::validate)
    pub fn register_checked<C, F>(mut self, name: &str, check: C, factory: F) -> Self
    where
        C: Fn(&Value) -> Result<()> + Send + Sync + 'static,
        F: Fn(&Value) -> Result<AgentHandle> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry {
                check: Box::new(check),
                factory: Box::new(factory),
            },
        );
        self
    }

    /// Backend names in this build, sorted
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Check that `config` names a backend in this build and that its
    /// table is usable. Nothing is started.
    pub fn validate(&self, config: &BackendConfig) -> Result<()> {
        let name = config.backend_type();
        let entry = self.entry(name)?;
        (entry.check)(&config.to_json_value())
            .with_context(|| format!("Invalid [backend] table for '{}'", name))
    }

    /// Validate `config` and start the backend it names
    pub fn start(&self, config: &BackendConfig) -> Result<AgentHandle> {
        self.validate(config)?;
        let name = config.backend_type();
        (self.entry(name)?.factory)(&config.to_json_value())
            .with_context(|| format!("Failed to start backend '{}'", name))
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(entry);
        }
        if let Some((_, feature)) = FEATURE_GATED.iter().find(|(gated, _)| *gated == name) {
            bail!(
                "Unknown backend type '{}': this build was compiled without the `{}` feature",
                name,
                feature
            );
        }
        bail!(
            "Unknown backend type '{}' (available: {})",
            name,
            self.names().join(", ")
        )
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        use crate::backends::mock::MockBackend;

        let registry =
            Self::new().register_checked("mock", MockBackend::check_config, MockBackend::factory());

        #[cfg(feature = "acp")]
        let registry = {
            use crate::backends::acp::AcpBackend;
            registry.register_checked("acp", AcpBackend::check_config, AcpBackend::factory())
        };

        registry
    }
}
