//! Managed child-process session.
//!
//! A [`ProcessSession`] owns one child process, both of its pipes and a
//! background drain thread. The drain thread spawns the child, moves
//! everything the child writes to stdout into a locked buffer, watches for
//! exit, and, when the owner stops the session first, applies the chosen
//! [`Termination`] strategy. Callers write to stdin, take buffered output and
//! probe liveness from any thread.

use serde::{Deserialize, Serialize};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::{SessionConfig, StderrMode};
use crate::error::{ProcError, ProcResult};
use crate::launch::LaunchSpec;
use crate::transcript::{SessionTranscript, TranscriptEvent};

/// Chunks the stdout reader may queue ahead of the drain loop.
const PUMP_QUEUE_DEPTH: usize = 16;

/// Poll intervals the drain loop keeps collecting output after the child
/// exits or is stopped. Bounds the wait when a descendant inherited stdout.
const FINAL_DRAIN_POLLS: u32 = 3;

/// How an owner-initiated stop ends the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Kill the child and reap it.
    #[default]
    Kill,
    /// Close the child's stdin and let it exit on end-of-input.
    CloseStdin,
}

/// Observed state of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The drain thread has not spawned the child yet.
    Starting,
    Running { pid: u32 },
    /// Exit code, or `-1` when the child was ended by a signal.
    Exited { code: i32 },
    /// Pipe setup or spawn failed; the session is inert.
    FailedToStart,
}

enum ChildSlot {
    Pending,
    Running(Child),
    Exited(i32),
    Failed,
}

/// Result of one wait on the stdout channel.
#[derive(Debug, PartialEq, Eq)]
enum Pumped {
    Data,
    Idle,
    Closed,
}

/// State shared between the owner and the drain thread.
struct Shared {
    id: String,
    output: Mutex<Vec<u8>>,
    /// One-way: false to true only.
    stop_requested: AtomicBool,
    termination: OnceLock<Termination>,
    child: Mutex<ChildSlot>,
    /// Our write end of the child's stdin. Writers clone the `Arc` and write
    /// outside this lock, so closing never waits on a blocked write.
    stdin: Mutex<Option<Arc<PipeWriter>>>,
    /// Serializes `write_input` callers.
    write_lock: Mutex<()>,
    transcript: Option<SessionTranscript>,
}

/// Pipe ends handed to the drain thread.
struct ChildPipes {
    stdout_reader: PipeReader,
    stdout_writer: PipeWriter,
    stdin_reader: PipeReader,
}

/// Drain-thread copy of the settings it needs.
struct DrainSettings {
    poll_interval: Duration,
    stdin_close_grace: Duration,
    read_chunk_size: usize,
    stderr: StderrMode,
    env: Vec<(String, String)>,
}

/// One external process plus its pipes, output buffer and drain thread.
///
/// Dropping the session stops it with [`Termination::Kill`], joins the
/// drain thread and closes stdin. A child left running after an expired
/// [`Termination::CloseStdin`] grace period is killed at drop.
pub struct ProcessSession {
    spec: LaunchSpec,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSession {
    /// Create the pipes and start the drain thread, which spawns the child.
    ///
    /// Failing to create the pipes is logged and yields an inert session
    /// whose status is [`ProcessStatus::FailedToStart`]. Failing to start
    /// the drain thread is returned as [`ProcError::Thread`]. Spawn failures
    /// happen on the drain thread and show up through [`Self::status`].
    pub fn spawn(spec: LaunchSpec, config: &SessionConfig) -> ProcResult<Self> {
        let id = generate_session_id();
        let transcript = config
            .transcript_dir
            .as_ref()
            .map(|dir| SessionTranscript::new(dir.join(format!("{id}.jsonl"))));

        let (stdin_writer, pipes) = match open_pipes() {
            Ok(p) => p,
            Err(e) => {
                error!(session_id = %id, program = %spec, error = %e, "failed to create pipes");
                let shared = Shared::new(id, None, ChildSlot::Failed, transcript);
                return Ok(Self {
                    spec,
                    shared: Arc::new(shared),
                    worker: Mutex::new(None),
                });
            }
        };

        let shared = Arc::new(Shared::new(
            id,
            Some(Arc::new(stdin_writer)),
            ChildSlot::Pending,
            transcript,
        ));
        shared.record(|| TranscriptEvent::Start {
            program: spec.program.to_string_lossy().into_owned(),
            args: spec
                .args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            cwd: spec.cwd.as_ref().map(|d| d.display().to_string()),
        });

        let settings = DrainSettings {
            poll_interval: config.poll_interval(),
            stdin_close_grace: config.stdin_close_grace(),
            read_chunk_size: config.read_chunk_size.max(1),
            stderr: config.stderr,
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let worker = thread::Builder::new()
            .name(format!("procpipe-drain-{}", short_id(&shared.id)))
            .spawn({
                let shared = shared.clone();
                let spec = spec.clone();
                move || drain_loop(shared, spec, pipes, settings)
            })
            .map_err(|e| {
                error!(session_id = %shared.id, error = %e, "failed to start drain thread");
                ProcError::Thread(e)
            })?;

        Ok(Self {
            spec,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Random hex identifier, used in logs and transcript file names.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        self.shared.transcript.as_ref().map(|t| t.path())
    }

    /// Write to the child's stdin and return how many bytes it accepted.
    ///
    /// Returns 0 with a warning when the child is not running or stdin has
    /// already been closed. Blocks while the pipe is full; a write in flight
    /// keeps the pipe open until it returns, even across a close.
    pub fn write_input(&self, data: &[u8]) -> usize {
        if !self.is_running() {
            warn!(session_id = %self.shared.id, "process is not running, skipping write");
            return 0;
        }

        let _serial = lock(&self.shared.write_lock);
        let Some(writer) = lock(&self.shared.stdin).clone() else {
            warn!(session_id = %self.shared.id, "stdin is closed, skipping write");
            return 0;
        };
        let mut writer: &PipeWriter = &writer;

        let mut written = 0;
        while written < data.len() {
            match writer.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(session_id = %self.shared.id, error = %e, written, "stdin write failed");
                    break;
                }
            }
        }

        if written > 0 {
            trace!(session_id = %self.shared.id, bytes = written, "wrote to stdin");
            self.shared
                .record(|| TranscriptEvent::Input(data[..written].to_vec()));
        }
        written
    }

    /// Take everything buffered since the last call, decoded as lossy UTF-8.
    pub fn read_and_clear_output(&self) -> String {
        String::from_utf8_lossy(&self.take_output_bytes()).into_owned()
    }

    /// Take everything buffered since the last call as raw bytes.
    pub fn take_output_bytes(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.shared.output))
    }

    /// Stop the session and block until the drain thread has finished.
    ///
    /// Does nothing once the drain thread is gone, so a second call never
    /// kills twice. If the child exits on its own in the same poll cycle
    /// that notices the stop request, the exit counts as graceful and
    /// `how` is not applied.
    pub fn terminate(&self, how: Termination) {
        // Raised before taking the worker lock so a concurrent
        // `wait_for_exit` holding it is released.
        let _ = self.shared.termination.set(how);
        self.shared.stop_requested.store(true, Ordering::Release);

        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.take() {
            info!(session_id = %self.shared.id, program = %self.spec, ?how, "stopping process");
            join_worker(&self.shared.id, handle);
        }
    }

    /// Block until the drain thread finishes on its own, which happens when
    /// the child exits (or fails to spawn). Never requests a stop, so this
    /// blocks for as long as the child runs.
    pub fn wait_for_exit(&self) {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.take() {
            join_worker(&self.shared.id, handle);
        }
    }

    /// Whether the drain thread has stopped. Never blocks: while another
    /// thread is joining the drain thread this reports `false`.
    pub fn is_finished(&self) -> bool {
        match self.worker.try_lock() {
            Ok(worker) => worker.as_ref().is_none_or(JoinHandle::is_finished),
            Err(TryLockError::Poisoned(p)) => {
                p.into_inner().as_ref().is_none_or(JoinHandle::is_finished)
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    /// Non-blocking liveness probe.
    pub fn status(&self) -> ProcessStatus {
        self.shared.probe()
    }

    /// True while the child is starting or running.
    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            ProcessStatus::Starting | ProcessStatus::Running { .. }
        )
    }

    /// Exit code once the child has exited; `None` while it runs or if it
    /// never started.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status() {
            ProcessStatus::Exited { code } => Some(code),
            _ => None,
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.terminate(Termination::Kill);
        if matches!(self.shared.probe(), ProcessStatus::Running { .. }) {
            warn!(session_id = %self.shared.id, "process outlived its session, killing");
            self.shared.kill();
        }
        self.shared.close_stdin();
        if let Some(transcript) = &self.shared.transcript {
            transcript.stop();
        }
    }
}

impl Shared {
    fn new(
        id: String,
        stdin: Option<Arc<PipeWriter>>,
        child: ChildSlot,
        transcript: Option<SessionTranscript>,
    ) -> Self {
        Self {
            id,
            output: Mutex::new(Vec::new()),
            stop_requested: AtomicBool::new(false),
            termination: OnceLock::new(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            write_lock: Mutex::new(()),
            transcript,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn record(&self, event: impl FnOnce() -> TranscriptEvent) {
        if let Some(transcript) = &self.transcript {
            transcript.record(event());
        }
    }

    fn append(&self, chunk: &[u8]) {
        lock(&self.output).extend_from_slice(chunk);
        trace!(session_id = %self.id, bytes = chunk.len(), "buffered output");
        self.record(|| TranscriptEvent::Output(chunk.to_vec()));
    }

    /// Probe the child; the first observed exit is cached and logged.
    fn probe(&self) -> ProcessStatus {
        let mut slot = lock(&self.child);
        let code = match &mut *slot {
            ChildSlot::Pending => return ProcessStatus::Starting,
            ChildSlot::Failed => return ProcessStatus::FailedToStart,
            ChildSlot::Exited(code) => return ProcessStatus::Exited { code: *code },
            ChildSlot::Running(child) => match child.try_wait() {
                Ok(Some(status)) => exit_code_of(status),
                Ok(None) => return ProcessStatus::Running { pid: child.id() },
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "exit probe failed");
                    return ProcessStatus::Running { pid: child.id() };
                }
            },
        };
        *slot = ChildSlot::Exited(code);
        drop(slot);
        self.on_exit(code);
        ProcessStatus::Exited { code }
    }

    /// Kill and reap the child, unless it has already exited.
    fn kill(&self) {
        let mut slot = lock(&self.child);
        let ChildSlot::Running(child) = &mut *slot else {
            return;
        };

        let reaped = match child.try_wait() {
            Ok(Some(status)) => Ok(status),
            _ => {
                if let Err(e) = child.kill() {
                    warn!(session_id = %self.id, error = %e, "kill failed");
                }
                child.wait()
            }
        };

        match reaped {
            Ok(status) => {
                let code = exit_code_of(status);
                *slot = ChildSlot::Exited(code);
                drop(slot);
                self.on_exit(code);
            }
            Err(e) => error!(session_id = %self.id, error = %e, "failed to reap killed process"),
        }
    }

    fn on_exit(&self, code: i32) {
        info!(session_id = %self.id, code, "process exited");
        self.record(|| TranscriptEvent::Exit { code });
    }

    /// Drop our write end of stdin. Closing twice is a no-op.
    fn close_stdin(&self) {
        if lock(&self.stdin).take().is_some() {
            debug!(session_id = %self.id, "stdin closed");
        }
    }
}

/// Body of the drain thread.
fn drain_loop(shared: Arc<Shared>, spec: LaunchSpec, pipes: ChildPipes, settings: DrainSettings) {
    let ChildPipes {
        stdout_reader,
        stdout_writer,
        stdin_reader,
    } = pipes;

    info!(session_id = %shared.id, program = %spec, "starting process");

    let mut cmd = spec.to_command();
    cmd.envs(settings.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let stderr = match settings.stderr {
        StderrMode::Inherit => Stdio::inherit(),
        StderrMode::Null => Stdio::null(),
        StderrMode::Merge => match stdout_writer.try_clone() {
            Ok(w) => Stdio::from(w),
            Err(e) => {
                warn!(session_id = %shared.id, error = %e, "cannot merge stderr, inheriting");
                Stdio::inherit()
            }
        },
    };
    cmd.stdin(Stdio::from(stdin_reader))
        .stdout(Stdio::from(stdout_writer))
        .stderr(stderr);

    let spawned = cmd.spawn();
    // Releases the parent's copies of the child-side pipe ends.
    drop(cmd);

    match spawned {
        Ok(child) => {
            info!(session_id = %shared.id, pid = child.id(), "process spawned");
            *lock(&shared.child) = ChildSlot::Running(child);
        }
        Err(e) => {
            error!(session_id = %shared.id, program = %spec, error = %e, "failed to start process");
            *lock(&shared.child) = ChildSlot::Failed;
            shared.close_stdin();
            return;
        }
    }

    let chunk_size = settings.read_chunk_size;
    let (tx, rx) = mpsc::sync_channel(PUMP_QUEUE_DEPTH);
    let pump = thread::Builder::new()
        .name(format!("procpipe-stdout-{}", short_id(&shared.id)))
        .spawn(move || pump_stdout(stdout_reader, tx, chunk_size))
        .map_err(|e| {
            error!(session_id = %shared.id, error = %e, "failed to start stdout reader");
        })
        .ok();

    let poll = settings.poll_interval;
    let mut open = true;
    let mut exited_gracefully = false;

    while !shared.stop_requested() {
        if open {
            open = pump_output(&shared, &rx, poll) != Pumped::Closed;
        } else {
            thread::sleep(poll);
        }

        if let ProcessStatus::Exited { .. } = shared.probe() {
            exited_gracefully = true;
            shared.stop_requested.store(true, Ordering::Release);
        }
    }

    if !exited_gracefully {
        let how = shared.termination.get().copied().unwrap_or_default();
        shared.record(|| TranscriptEvent::Stopped { termination: how });
        match how {
            Termination::CloseStdin => {
                shared.close_stdin();
                let grace = settings.stdin_close_grace;
                await_exit_after_stdin_close(&shared, &rx, &mut open, poll, grace);
            }
            Termination::Kill => shared.kill(),
        }
        info!(session_id = %shared.id, "process stopped");
    }

    // Output written just before exit may still be in flight. A descendant
    // holding stdout open must not keep this thread alive.
    let deadline = Instant::now() + poll * FINAL_DRAIN_POLLS;
    while open {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match pump_output(&shared, &rx, left.min(poll)) {
            Pumped::Data => {}
            Pumped::Idle => break,
            Pumped::Closed => open = false,
        }
    }

    if let Some(pump) = pump {
        if open {
            // Another process inherited the stdout pipe. The reader exits on
            // its next chunk once `rx` is gone, or on EOF.
            debug!(session_id = %shared.id, "stdout still open after exit, detaching reader");
        } else if pump.join().is_err() {
            error!(session_id = %shared.id, "stdout reader panicked");
        }
    }
}

/// Poll until the child exits after its stdin was closed, or the grace
/// period runs out. The child is left running in the latter case.
fn await_exit_after_stdin_close(
    shared: &Shared,
    rx: &Receiver<Vec<u8>>,
    open: &mut bool,
    poll: Duration,
    grace: Duration,
) {
    let deadline = Instant::now() + grace;
    loop {
        if let ProcessStatus::Exited { .. } = shared.probe() {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                session_id = %shared.id,
                grace_ms = grace.as_millis() as u64,
                "process still running after stdin was closed"
            );
            return;
        }
        if *open {
            *open = pump_output(shared, rx, poll) != Pumped::Closed;
        } else {
            thread::sleep(poll);
        }
    }
}

/// Wait up to `timeout` for stdout data, then take whatever else is queued
/// and append it to the buffer under one lock.
fn pump_output(shared: &Shared, rx: &Receiver<Vec<u8>>, timeout: Duration) -> Pumped {
    let mut batch = match rx.recv_timeout(timeout) {
        Ok(chunk) => chunk,
        Err(RecvTimeoutError::Timeout) => return Pumped::Idle,
        Err(RecvTimeoutError::Disconnected) => return Pumped::Closed,
    };

    let mut closed = false;
    for _ in 0..PUMP_QUEUE_DEPTH {
        match rx.try_recv() {
            Ok(chunk) => batch.extend_from_slice(&chunk),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                closed = true;
                break;
            }
        }
    }

    shared.append(&batch);
    if closed {
        Pumped::Closed
    } else {
        Pumped::Data
    }
}

/// Blocking reads from the stdout pipe, forwarded as chunks until EOF.
fn pump_stdout(mut reader: PipeReader, tx: SyncSender<Vec<u8>>, chunk_size: usize) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "stdout read failed");
                break;
            }
        }
    }
}

/// Returns our stdin write end plus the ends the drain thread needs.
fn open_pipes() -> io::Result<(PipeWriter, ChildPipes)> {
    let (stdout_reader, stdout_writer) = io::pipe()?;
    let (stdin_reader, stdin_writer) = io::pipe()?;
    Ok((
        stdin_writer,
        ChildPipes {
            stdout_reader,
            stdout_writer,
            stdin_reader,
        },
    ))
}

fn join_worker(id: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!(session_id = %id, "drain thread panicked");
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
