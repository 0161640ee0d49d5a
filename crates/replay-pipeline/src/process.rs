//! Supervision of the external encoder process.
//!
//! Each spawned process is owned by one supervising task on the
//! supervisor's runtime. That task waits for either a natural exit or a
//! shutdown request, escalates from a graceful terminate to a kill after the
//! grace period, and reports the outcome on the exit channel. Stdout and
//! stderr are always drained, whether or not anyone wants the data, so the
//! encoder never blocks on a full pipe.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::PipelineError;
use crate::monitor::ProgressLine;
use crate::planner::Invocation;
use crate::{
    PipelineResult, DEFAULT_STOP_GRACE, INPUT_QUEUE_CAPACITY, SIDE_CHANNEL_FRAME_BYTES,
    SIDE_CHANNEL_SAMPLE_RATE, STDERR_TAIL_LINES, STDOUT_READ_SIZE,
};

/// Destination for the process's stdout.
#[derive(Debug, Clone)]
pub enum OutputRoute {
    /// Forward every read to the buffer store.
    Forward(Sender<Bytes>),

    /// Read and drop.
    Discard,
}

/// Report sent when a supervised process has exited.
#[derive(Debug, Clone)]
pub struct PipelineExit {
    /// Generation of the process that exited.
    pub generation: u64,

    /// Operating system process id.
    pub pid: u32,

    /// Exit code, if the process exited normally.
    pub code: Option<i32>,

    /// Whether the exit followed a shutdown request.
    pub requested: bool,

    /// Last stderr lines before exit.
    pub stderr_tail: Vec<String>,
}

impl PipelineExit {
    /// Returns true if the process ended with status zero.
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The input batch was not accepted because the channel is closed or full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputClosed;

/// Writable handle to the process's stdin.
///
/// Cloning is cheap. Writes never block and never fail loudly: once the
/// channel is closed every batch is refused with [`InputClosed`].
#[derive(Debug, Clone)]
pub struct PipelineInput {
    tx: mpsc::Sender<Bytes>,
    writable: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl PipelineInput {
    /// Queue a batch for the process's stdin.
    pub fn try_write(&self, data: Bytes) -> Result<(), InputClosed> {
        if !self.is_writable() {
            return Err(InputClosed);
        }
        self.tx.try_send(data).map_err(|_| InputClosed)
    }

    /// Whether the channel still accepts data.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Queue `duration` of interleaved f32 silence.
    pub fn prime_silence(&self, duration: Duration) -> Result<(), InputClosed> {
        let frames = (duration.as_secs_f64() * SIDE_CHANNEL_SAMPLE_RATE as f64) as usize;
        self.try_write(Bytes::from(vec![0u8; frames * SIDE_CHANNEL_FRAME_BYTES]))
    }

    /// Close stdin (end of stream). Queued data is discarded.
    pub fn close(&self) {
        self.writable.store(false, Ordering::SeqCst);
        self.close.notify_one();
    }
}

/// Owns the runtime that supervises encoder processes.
pub struct PipelineSupervisor {
    runtime: Option<Runtime>,
    exit_tx: Sender<PipelineExit>,
    next_generation: AtomicU64,
}

impl PipelineSupervisor {
    /// Create a supervisor and the channel its exit reports arrive on.
    pub fn new() -> PipelineResult<(Self, Receiver<PipelineExit>)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pipeline-supervisor")
            .enable_all()
            .build()
            .map_err(PipelineError::Runtime)?;

        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();

        Ok((
            Self {
                runtime: Some(runtime),
                exit_tx,
                next_generation: AtomicU64::new(1),
            },
            exit_rx,
        ))
    }

    /// Spawn `invocation` and attach drains, stdin writer and supervising task.
    #[instrument(name = "pipeline_spawn", skip(self, invocation, output), fields(program = %invocation.program))]
    pub fn spawn(
        &self,
        invocation: &Invocation,
        output: OutputRoute,
    ) -> PipelineResult<PipelineProcess> {
        let runtime = self.runtime.as_ref().ok_or(PipelineError::ShutDown)?;
        let _guard = runtime.enter();

        debug!(args = ?invocation.args, "Spawning pipeline");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().ok_or(PipelineError::MissingStdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(PipelineError::MissingStdio("stdout"))?;
        let stderr = child.stderr.take().ok_or(PipelineError::MissingStdio("stderr"))?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let input = PipelineInput {
            tx: input_tx,
            writable: Arc::new(AtomicBool::new(true)),
            close: Arc::new(Notify::new()),
        };

        runtime.spawn(drain_stdout(stdout, output));
        let stderr_done = runtime.spawn(drain_stderr(stderr, Arc::clone(&tail)));
        runtime.spawn(write_stdin(stdin, input_rx, input.clone()));

        let (control_tx, control_rx) = oneshot::channel();
        let supervised = Supervised {
            child,
            generation,
            pid,
            input: input.clone(),
            tail,
            stderr_done,
        };
        runtime.spawn(supervise(supervised, control_rx, self.exit_tx.clone()));

        info!(pid, generation, "Pipeline spawned");

        Ok(PipelineProcess {
            generation,
            pid,
            started_at: Instant::now(),
            input,
            control: Some(control_tx),
        })
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Handle to one running encoder process.
///
/// Dropping the handle requests a graceful shutdown with the default grace.
pub struct PipelineProcess {
    generation: u64,
    pid: u32,
    started_at: Instant,
    input: PipelineInput,
    control: Option<oneshot::Sender<Duration>>,
}

impl PipelineProcess {
    /// Generation number, unique per supervisor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Operating system process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Monotonic spawn time.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Handle to the process's stdin.
    pub fn input(&self) -> PipelineInput {
        self.input.clone()
    }

    /// Close stdin, signal termination, and kill after `grace`.
    ///
    /// Returns immediately; the exit is reported on the supervisor's channel.
    pub fn shutdown(&mut self, grace: Duration) {
        self.input.close();
        if let Some(control) = self.control.take() {
            debug!(pid = self.pid, ?grace, "Requesting pipeline shutdown");
            // The supervising task is gone if the process already exited.
            let _ = control.send(grace);
        }
    }
}

impl Drop for PipelineProcess {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_STOP_GRACE);
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Shutdown(Duration),
}

struct Supervised {
    child: Child,
    generation: u64,
    pid: u32,
    input: PipelineInput,
    tail: Arc<Mutex<VecDeque<String>>>,
    stderr_done: JoinHandle<()>,
}

/// Upper bound on waiting for stderr after exit. Orphaned grandchildren
/// can keep the pipe open indefinitely.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

async fn supervise(
    supervised: Supervised,
    mut control_rx: oneshot::Receiver<Duration>,
    exit_tx: Sender<PipelineExit>,
) {
    let Supervised {
        mut child,
        generation,
        pid,
        input,
        tail,
        stderr_done,
    } = supervised;

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        grace = &mut control_rx => Wake::Shutdown(grace.unwrap_or(DEFAULT_STOP_GRACE)),
    };

    let (status, requested) = match wake {
        Wake::Exited(status) => (status, false),
        Wake::Shutdown(grace) => {
            input.close();
            send_terminate(pid).await;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => (status, true),
                Err(_) => {
                    warn!(pid, ?grace, "Pipeline ignored terminate, killing");
                    if let Err(e) = child.start_kill() {
                        debug!(pid, "Kill failed: {}", e);
                    }
                    (child.wait().await, true)
                }
            }
        }
    };

    input.close();
    let _ = tokio::time::timeout(STDERR_FLUSH_TIMEOUT, stderr_done).await;

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!(pid, "Failed to wait for pipeline: {}", e);
            None
        }
    };

    let stderr_tail: Vec<String> = tail.lock().iter().cloned().collect();
    if !requested && code != Some(0) {
        warn!(pid, ?code, "Pipeline exited unexpectedly");
        for line in &stderr_tail {
            warn!(pid, "  {}", line);
        }
    } else {
        info!(pid, ?code, "Pipeline exited");
    }

    let exit = PipelineExit {
        generation,
        pid,
        code,
        requested,
        stderr_tail,
    };
    if exit_tx.send(exit).is_err() {
        trace!(pid, "Exit receiver gone");
    }
}

#[cfg(unix)]
async fn send_terminate(pid: u32) {
    let result = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, "Failed to send SIGTERM: {}", e);
    }
}

#[cfg(windows)]
async fn send_terminate(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, "Failed to request termination: {}", e);
    }
}

#[cfg(not(any(unix, windows)))]
async fn send_terminate(_pid: u32) {}

async fn drain_stdout(mut stdout: ChildStdout, output: OutputRoute) {
    let mut buf = BytesMut::with_capacity(STDOUT_READ_SIZE);
    let mut forward = match output {
        OutputRoute::Forward(tx) => Some(tx),
        OutputRoute::Discard => None,
    };

    loop {
        buf.reserve(STDOUT_READ_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if let Some(tx) = &forward {
                    if tx.send(chunk).is_err() {
                        debug!("Buffer store gone, discarding pipeline output");
                        forward = None;
                    }
                }
            }
            Err(e) => {
                debug!("Stdout drain ended: {}", e);
                break;
            }
        }
    }
    trace!("Stdout drain finished");
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    let mut last_progress: Option<Instant> = None;

    loop {
        raw.clear();
        // ffmpeg ends progress lines with '\r'
        match read_line_cr_lf(&mut reader, &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Stderr drain ended: {}", e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(progress) = ProgressLine::parse(line) {
            let due = last_progress.map_or(true, |t| t.elapsed() >= Duration::from_secs(5));
            if due {
                debug!("Pipeline progress: {}", progress.summary());
                last_progress = Some(Instant::now());
            }
        } else {
            trace!("ffmpeg: {}", line);
        }

        let mut lines = tail.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }
    trace!("Stderr drain finished");
}

async fn read_line_cr_lf(
    reader: &mut BufReader<ChildStderr>,
    out: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        match available.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(i) => {
                out.extend_from_slice(&available[..i]);
                reader.consume(i + 1);
                return Ok(read + i + 1);
            }
            None => {
                let n = available.len();
                out.extend_from_slice(available);
                reader.consume(n);
                read += n;
            }
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>, input: PipelineInput) {
    loop {
        let data = tokio::select! {
            _ = input.close.notified() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        if let Err(e) = stdin.write_all(&data).await {
            // Broken pipe here is the normal shutdown race.
            debug!("Pipeline input closed: {}", e);
            break;
        }
    }

    input.writable.store(false, Ordering::SeqCst);
    rx.close();
    if let Err(e) = stdin.shutdown().await {
        trace!("Stdin shutdown: {}", e);
    }
    trace!("Stdin writer finished");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::planner::{AudioPlan, OutputSink};
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn invocation(program: String) -> Invocation {
        Invocation {
            program,
            args: vec!["-hide_banner".to_string()],
            audio: AudioPlan::System,
            sink: OutputSink::Stream,
        }
    }

    #[test]
    fn test_stdin_is_forwarded_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, exits) = PipelineSupervisor::new().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut process = supervisor
            .spawn(&invocation(script(&dir, "exec cat")), OutputRoute::Forward(tx))
            .unwrap();
        assert!(process.pid() > 0);

        process.input().prime_silence(Duration::from_millis(10)).unwrap();
        let mut received = 0;
        while received < 480 * SIDE_CHANNEL_FRAME_BYTES {
            received += rx.recv_timeout(Duration::from_secs(5)).unwrap().len();
        }
        assert_eq!(received, 480 * SIDE_CHANNEL_FRAME_BYTES);

        process.shutdown(Duration::from_secs(2));
        let exit = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(exit.requested);
        assert_eq!(exit.generation, process.generation());
        assert!(process.input().try_write(Bytes::from_static(b"late")).is_err());
    }

    #[test]
    fn test_unexpected_exit_is_reported_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, exits) = PipelineSupervisor::new().unwrap();

        let process = supervisor
            .spawn(
                &invocation(script(&dir, "echo 'Unknown input format' >&2\nexit 3")),
                OutputRoute::Discard,
            )
            .unwrap();

        let exit = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.requested);
        assert!(!exit.is_success());
        assert_eq!(exit.stderr_tail, vec!["Unknown input format".to_string()]);
        drop(process);
    }

    #[test]
    fn test_stubborn_process_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, exits) = PipelineSupervisor::new().unwrap();

        let mut process = supervisor
            .spawn(
                &invocation(script(&dir, "trap '' TERM\nwhile true; do sleep 0.1; done")),
                OutputRoute::Discard,
            )
            .unwrap();

        let asked = Instant::now();
        process.shutdown(Duration::from_millis(300));
        let exit = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(exit.requested);
        assert!(asked.elapsed() >= Duration::from_millis(300));
        assert_eq!(exit.code, None);
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let (supervisor, _exits) = PipelineSupervisor::new().unwrap();
        let result = supervisor.spawn(
            &invocation("/nonexistent/ffmpeg".to_string()),
            OutputRoute::Discard,
        );
        assert!(matches!(result, Err(PipelineError::Spawn { .. })));
    }

    #[test]
    fn test_generations_increase() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _exits) = PipelineSupervisor::new().unwrap();
        let program = script(&dir, "exec cat");

        let a = supervisor.spawn(&invocation(program.clone()), OutputRoute::Discard).unwrap();
        let b = supervisor.spawn(&invocation(program), OutputRoute::Discard).unwrap();
        assert!(b.generation() > a.generation());
    }
}
