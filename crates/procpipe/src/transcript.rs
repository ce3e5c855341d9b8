//! Session transcripts.
//!
//! Records timestamped session events (launch, stdin writes, drained output,
//! exit, forced stop) as newline-delimited JSON, one file per session, so a
//! run can be attached to a report or replayed later.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error};

use crate::error::{ProcError, ProcResult};
use crate::session::Termination;

/// Event types that can appear in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TranscriptEvent {
    /// Session launched.
    Start {
        program: String,
        args: Vec<String>,
        cwd: Option<String>,
    },
    /// Bytes accepted by the child's stdin.
    Input(Vec<u8>),
    /// Bytes drained from the child's stdout.
    Output(Vec<u8>),
    /// Child exited; `-1` when killed by a signal.
    Exit { code: i32 },
    /// The owner stopped the session before the child exited on its own.
    Stopped { termination: Termination },
}

/// A single timestamped transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Milliseconds since the transcript was opened.
    pub timestamp_ms: u64,
    pub event: TranscriptEvent,
}

/// Appends events for one session to a JSONL file.
#[derive(Debug)]
pub struct SessionTranscript {
    path: PathBuf,
    start_time: Instant,
    active: AtomicBool,
}

impl SessionTranscript {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            start_time: Instant::now(),
            active: AtomicBool::new(true),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Errors are logged and swallowed: a transcript must
    /// never disturb the session it describes.
    pub fn record(&self, event: TranscriptEvent) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let entry = TranscriptEntry {
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            event,
        };

        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = self.append_line(&line) {
                    error!(path = %self.path.display(), error = %e, "failed to write transcript");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize transcript event");
            }
        }
    }

    /// Stop recording; later events are dropped.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!(path = %self.path.display(), "transcript stopped");
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

/// Load a transcript back from disk, skipping malformed lines.
pub fn load_transcript(path: &Path) -> ProcResult<Vec<TranscriptEntry>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProcError::Transcript(format!("cannot read {}: {e}", path.display())))?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed transcript line");
            }
        }
    }
    Ok(entries)
}
