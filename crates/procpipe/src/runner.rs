//! Run a command to completion and collect its output.

use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{ProcError, ProcResult};
use crate::launch::LaunchSpec;
use crate::session::ProcessSession;

/// Everything a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout (plus stderr when merged), lossy UTF-8.
    pub output: String,
    /// The same bytes, undecoded.
    pub raw: Vec<u8>,
    /// `None` if the process never started; `-1` if a signal ended it.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Blocking facade over [`ProcessSession`]: spawn, wait, collect, tear down.
///
/// Holds only the session settings; every call gets a fresh session.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    config: SessionConfig,
}

impl CommandRunner {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run `spec` until it exits on its own.
    ///
    /// There is no timeout: a command that never exits blocks forever.
    pub fn run(&self, spec: LaunchSpec) -> ProcResult<CommandOutput> {
        debug!(program = %spec, "running command");
        let session = ProcessSession::spawn(spec, &self.config)?;
        session.wait_for_exit();

        let exit_code = session.exit_code();
        let raw = session.take_output_bytes();
        drop(session);

        info!(?exit_code, bytes = raw.len(), "command finished");
        Ok(CommandOutput {
            output: String::from_utf8_lossy(&raw).into_owned(),
            raw,
            exit_code,
        })
    }

    /// [`Self::run`] on tokio's blocking pool.
    pub async fn run_async(&self, spec: LaunchSpec) -> ProcResult<CommandOutput> {
        let runner = self.clone();
        tokio::task::spawn_blocking(move || runner.run(spec))
            .await
            .map_err(|e| ProcError::Join(e.to_string()))?
    }
}

/// Run `program` with `args` in `cwd` using default settings.
pub fn run_command<I, S>(
    program: impl Into<OsString>,
    args: I,
    cwd: Option<PathBuf>,
) -> ProcResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let mut spec = LaunchSpec::new(program).args(args);
    spec.cwd = cwd;
    CommandRunner::default().run(spec)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn runner() -> CommandRunner {
        CommandRunner::new(SessionConfig {
            poll_interval_ms: 20,
            ..Default::default()
        })
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = runner()
            .run(LaunchSpec::new("sh").args(["-c", "sleep 0.05; echo hello"]))
            .unwrap();
        assert!(out.output.contains("hello"));
        assert_eq!(out.exit_code, Some(0));
        assert!(out.success());
    }

    #[test]
    fn nonzero_exit_code() {
        let out = runner()
            .run(LaunchSpec::new("sh").args(["-c", "echo partial; exit 42"]))
            .unwrap();
        assert_eq!(out.output, "partial\n");
        assert_eq!(out.exit_code, Some(42));
        assert!(!out.success());
    }

    #[test]
    fn missing_program_has_no_exit_code() {
        let out = runner()
            .run(LaunchSpec::new("/nonexistent/procpipe-test-binary"))
            .unwrap();
        assert_eq!(out.output, "");
        assert_eq!(out.exit_code, None);
    }

    #[test]
    fn large_output_is_complete() {
        // Well past a pipe buffer, so the reader has to keep up.
        let script = "i=0; while [ $i -lt 20000 ]; do echo 0123456789; i=$((i+1)); done";
        let out = runner()
            .run(LaunchSpec::new("sh").args(["-c", script]))
            .unwrap();
        assert_eq!(out.output.len(), 20000 * 11);
        assert_eq!(out.exit_code, Some(0));
    }

    #[test]
    fn non_utf8_output_is_kept_raw() {
        let out = runner()
            .run(LaunchSpec::new("printf").arg("\\377ok"))
            .unwrap();
        assert_eq!(out.raw, vec![0xff, b'o', b'k']);
        assert_eq!(out.output, "\u{fffd}ok");
    }

    #[test]
    fn returns_when_a_background_job_keeps_writing() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let spec = LaunchSpec::new("sh").args(["-c", "yes & echo done; exit 0"]);
            let _ = tx.send(runner().run(spec));
        });

        let out = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("run did not return")
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.raw.is_empty());
    }

    #[test]
    fn run_command_uses_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let out = run_command("ls", Vec::<String>::new(), Some(dir.path().to_path_buf())).unwrap();
        assert!(out.output.contains("marker.txt"));
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_async_matches_run() {
        let out = runner()
            .run_async(LaunchSpec::new("echo").arg("async"))
            .await
            .unwrap();
        assert_eq!(out.output, "async\n");
        assert_eq!(out.exit_code, Some(0));
    }
}
