//! Runtime configuration for the workflow core.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//!
//! # Example
//!
//! ```toml
//! [logging]
//! filter = "tether_core=debug,info"
//! format = "json"
//!
//! [checkpoints]
//! max_snapshot_refs = 64
//! verify_digest = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub logging: LoggingConfig,
    pub checkpoints: CheckpointConfig,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` overrides it when set.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `[checkpoints]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Upper bound on distinct entity refs one checkpoint may capture.
    pub max_snapshot_refs: usize,
    /// Recompute the snapshot digest before restoring.
    pub verify_digest: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_snapshot_refs: 256,
            verify_digest: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Functions ─────────────────────────────────────────────────────────────────

impl WorkflowConfig {
    /// Read and parse a TOML config file from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoints.max_snapshot_refs == 0 {
            return Err(ConfigError::Invalid(
                "checkpoints.max_snapshot_refs must be at least 1".into(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter must not be empty".into()));
        }
        Ok(())
    }
}
