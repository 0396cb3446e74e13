//! Orchestrator configuration
//!
//! Timeouts and per-language overrides, loadable from a TOML file. Every
//! field has a default so a missing or partial file is never an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::language::Language;

/// Per-language override of adapter defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LanguageOverride {
    /// Replace the adapter's server executable
    pub command: Option<String>,

    /// Replace the adapter's arguments
    pub args: Option<Vec<String>>,

    /// Extra environment variables for the server process
    pub env: HashMap<String, String>,

    /// Per-language request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Main orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Default timeout for semantic requests (seconds)
    pub request_timeout_secs: u64,

    /// Timeout for the initialize handshake (seconds). Larger than the
    /// request timeout since server startup cost dominates.
    pub initialize_timeout_secs: u64,

    /// Grace period for cooperative shutdown before forcing termination
    /// (seconds)
    pub shutdown_grace_secs: u64,

    /// Per-language overrides, keyed by language identifier
    pub languages: HashMap<String, LanguageOverride>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            initialize_timeout_secs: 120,
            shutdown_grace_secs: 5,
            languages: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override entry for a language, if configured
    pub fn override_for(&self, language: Language) -> Option<&LanguageOverride> {
        self.languages.get(language.id())
    }

    /// Effective request timeout for a language
    pub fn request_timeout(&self, language: Language) -> Duration {
        let secs = self
            .override_for(language)
            .and_then(|o| o.request_timeout_secs)
            .unwrap_or(self.request_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
