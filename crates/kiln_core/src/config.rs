//! Runtime configuration.
//!
//! Settings come from a YAML or TOML file, picked by extension, and may be
//! overridden from the environment:
//!
//! | Variable | Setting |
//! |---|---|
//! | `KILN_STATE_FILE` | `state_file` |
//! | `KILN_LOG` | `log_filter` |

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KilnError, KilnResult};

pub const STATE_FILE_ENV: &str = "KILN_STATE_FILE";
pub const LOG_FILTER_ENV: &str = "KILN_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// JSON document holding component state
    pub state_file: PathBuf,
    /// `tracing` filter directives
    pub log_filter: String,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".kiln").join("state.json"),
            log_filter: "kiln=info".to_string(),
        }
    }
}

impl KilnConfig {
    /// Load a config file. `.toml` files are read as TOML, anything else as
    /// YAML.
    pub fn load(path: impl AsRef<Path>) -> KilnResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_yaml(&content)?,
        };
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> KilnResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| KilnError::configuration(format!("invalid config: {}", e)))
    }

    pub fn from_toml(content: &str) -> KilnResult<Self> {
        toml::from_str(content)
            .map_err(|e| KilnError::configuration(format!("invalid config: {}", e)))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any lookup, e.g. the process environment.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(state_file) = lookup(STATE_FILE_ENV).filter(|v| !v.is_empty()) {
            self.state_file = PathBuf::from(state_file);
        }
        if let Some(filter) = lookup(LOG_FILTER_ENV).filter(|v| !v.is_empty()) {
            self.log_filter = filter;
        }
        self
    }

    pub fn to_yaml(&self) -> KilnResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
