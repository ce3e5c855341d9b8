//! procpipe: managed child-process sessions.
//!
//! A [`ProcessSession`] spawns a child, drains its stdout on a background
//! thread into a locked buffer, accepts stdin writes and stops the child
//! either by killing it or by closing its stdin. [`CommandRunner`] wraps a
//! session into a single blocking "run to completion" call.

pub mod config;
pub mod error;
pub mod launch;
pub mod runner;
pub mod session;
pub mod transcript;

// Re-export commonly used items at crate root.
pub use config::{SessionConfig, StderrMode};
pub use error::{ProcError, ProcResult};
pub use launch::LaunchSpec;
pub use runner::{run_command, CommandOutput, CommandRunner};
pub use session::{ProcessSession, ProcessStatus, Termination};
pub use transcript::{load_transcript, SessionTranscript, TranscriptEntry, TranscriptEvent};
