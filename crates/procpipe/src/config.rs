//! Session tuning: poll interval, stdin-close grace, stderr routing.
//!
//! Every field has a default so a partial `[session]` table (or none at all)
//! deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProcError, ProcResult};

/// Where the child's stderr goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Share the parent's stderr.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Write into the same pipe as stdout, so it lands in the output buffer.
    Merge,
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on how long the drain loop waits before re-checking
    /// liveness and the stop flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long `Termination::CloseStdin` waits for the child to exit after
    /// its stdin is closed. The child is never killed on this path.
    #[serde(default = "default_stdin_close_grace_ms")]
    pub stdin_close_grace_ms: u64,
    /// Size of each read from the stdout pipe.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default)]
    pub stderr: StderrMode,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Directory for JSONL session transcripts. `None` disables them.
    #[serde(default)]
    pub transcript_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stdin_close_grace_ms: default_stdin_close_grace_ms(),
            read_chunk_size: default_read_chunk_size(),
            stderr: StderrMode::default(),
            env: HashMap::new(),
            transcript_dir: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}
fn default_stdin_close_grace_ms() -> u64 {
    5000
}
fn default_read_chunk_size() -> usize {
    8192
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stdin_close_grace(&self) -> Duration {
        Duration::from_millis(self.stdin_close_grace_ms)
    }

    /// Reject settings the drain loop cannot work with.
    pub fn validate(&self) -> ProcResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ProcError::Config("poll_interval_ms must be at least 1".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ProcError::Config("read_chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.stdin_close_grace(), Duration::from_secs(5));
        assert_eq!(cfg.read_chunk_size, 8192);
        assert_eq!(cfg.stderr, StderrMode::Inherit);
        assert!(cfg.transcript_dir.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml() {
        let cfg: SessionConfig = toml::from_str(
            r#"
poll_interval_ms = 25
stderr = "merge"

[env]
LANG = "C"
"#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, 25);
        assert_eq!(cfg.stderr, StderrMode::Merge);
        assert_eq!(cfg.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(cfg.stdin_close_grace_ms, 5000); // default
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let cfg = SessionConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ProcError::Config(_))));
        // Still usable: clamped to 1ms.
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let cfg = SessionConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
