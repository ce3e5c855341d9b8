//! CLI subcommand implementations.

pub mod attach;
pub mod run;

/// Map a child's exit code to ours: the child's own code when it exited
/// normally, 1 when it was ended by a signal or never started.
pub fn exit_status_for(code: Option<i32>) -> i32 {
    match code {
        Some(code) if code >= 0 => code,
        _ => 1,
    }
}
