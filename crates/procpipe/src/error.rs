use thiserror::Error;

/// Errors produced by procpipe.
///
/// Runtime trouble inside a running session (dead process, broken pipe,
/// failed kill) is logged and reported through return values instead.
/// These variants cover setup, configuration and transcript handling.
#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to start background thread: {0}")]
    Thread(std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("transcript error: {0}")]
    Transcript(String),

    #[error("join error: {0}")]
    Join(String),
}

pub type ProcResult<T> = Result<T, ProcError>;
