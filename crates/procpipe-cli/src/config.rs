//! CLI configuration at `~/.procpipe/config.toml`.
//!
//! Holds session defaults and the log level. CLI flags always override
//! config file values.

use anyhow::{Context, Result};
use procpipe::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings for every session the CLI starts.
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when neither `RUST_LOG` nor `--log-level` is given.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
}

/// `~/.procpipe/config.toml`, or a relative path if there is no home dir.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".procpipe")
        .join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config
            .session
            .validate()
            .with_context(|| format!("invalid [session] in {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
