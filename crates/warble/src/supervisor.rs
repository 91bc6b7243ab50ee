//! Child process supervision.
//!
//! [`Supervisor::start`] spawns the engine with all three standard streams
//! piped and hands back a channel of [`ProcessEvent`]s. Three background
//! tasks service the child:
//!
//! ```text
//! stdout reader ──Output(bytes)──┐
//!                                ├──▶ events (mpsc) ──▶ consumer
//! exit watcher ───Exited(report)─┘      Exited is always last, and only once
//! stderr reader ──▶ tracing
//! ```
//!
//! The exit watcher waits for the stdout reader to drain before reporting the
//! exit, so every byte the engine wrote is delivered before `Exited`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::lock;
use crate::session::ControlSink;

const READ_CHUNK: usize = 64 * 1024;

/// How long the exit watcher waits for stdout to hit EOF after the child exits.
/// A grandchild holding the pipe open would otherwise stall the exit report.
const STDOUT_DRAIN: Duration = Duration::from_millis(500);

/// Upper bound on reaping a force-killed child.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Program, arguments and extra environment for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// True when the supervisor had to kill the process.
    pub killed: bool,
}

impl ExitReport {
    fn from_status(status: ExitStatus, killed: bool) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            killed,
        }
    }

    fn unknown(killed: bool) -> Self {
        Self {
            code: None,
            signal: None,
            killed,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => write!(f, "unknown status")?,
        }
        if self.killed {
            write!(f, ", killed by supervisor")?;
        }
        Ok(())
    }
}

/// Events delivered from the child process, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A raw chunk from stdout. Chunk boundaries carry no meaning.
    Output(Bytes),
    /// The process is gone. Sent exactly once, after the last `Output`.
    Exited(ExitReport),
}

/// Result of a shutdown request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The engine exited on its own after stdin was closed.
    Exited(ExitReport),
    /// The grace period ran out and the engine was killed.
    Killed(Option<ExitReport>),
    /// The engine had already exited before shutdown was requested.
    AlreadyExited(ExitReport),
    /// There was no engine to shut down.
    NotRunning,
}

/// Handle to a running engine process.
pub struct Supervisor {
    label: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl Supervisor {
    /// Spawn the engine. Must be called from within a Tokio runtime.
    ///
    /// Spawn failures are returned here rather than reported as an exit.
    pub fn start(
        command: &EngineCommand,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), EngineError> {
        let program = command.program.display().to_string();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                program: program.clone(),
                source: Arc::new(e),
            })?;

        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("engine[{}]", pid),
            None => "engine".to_string(),
        };
        info!("{}: spawned {} {:?}", label, program, command.args);

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(EngineError::Spawn {
                    program,
                    source: Arc::new(std::io::Error::other("child stdio was not captured")),
                })
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        let reader = tokio::spawn(read_stdout(stdout, event_tx.clone(), label.clone()));
        tokio::spawn(log_stderr(stderr, label.clone()));
        tokio::spawn(watch_exit(child, kill_rx, reader, event_tx, exit_tx, label.clone()));

        let supervisor = Self {
            label,
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        };
        Ok((supervisor, event_rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.borrow().clone()
    }

    /// Write raw bytes to the engine's stdin and flush.
    pub async fn write_line(&self, line: &[u8]) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(EngineError::NotRunning)?;

        let result = match stdin.write_all(line).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                EngineError::NotRunning
            } else {
                e.into()
            }
        })
    }

    /// Wait for the process to exit. `None` if the watcher went away.
    pub async fn wait(&self) -> Option<ExitReport> {
        let mut rx = self.exit_rx.clone();
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => (*report).clone(),
            Err(_) => None,
        };
        report
    }

    /// Ask the exit watcher to kill the process. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }

    /// Close stdin, give the engine `grace` to exit, then kill it.
    ///
    /// Always resolves: the wait after a kill is bounded as well.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        if let Some(report) = self.exit_report() {
            return ShutdownOutcome::AlreadyExited(report);
        }

        let deadline = Instant::now() + grace;
        info!("{}: shutting down (grace {:?})", self.label, grace);

        // stdin EOF is the engine's cue to finish up
        match timeout_at(deadline, self.stdin.lock()).await {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => warn!("{}: stdin is blocked, cannot close it", self.label),
        }

        match timeout_at(deadline, self.wait()).await {
            Ok(Some(report)) => {
                info!("{}: exited cleanly ({})", self.label, report);
                ShutdownOutcome::Exited(report)
            }
            Ok(None) => ShutdownOutcome::Killed(None),
            Err(_) => {
                warn!(
                    "{}: still running after {:?}, killing",
                    self.label, grace
                );
                self.kill();
                let report = timeout(KILL_WAIT, self.wait()).await.ok().flatten();
                if report.is_none() {
                    warn!("{}: no exit status within {:?} of kill", self.label, KILL_WAIT);
                }
                ShutdownOutcome::Killed(report)
            }
        }
    }
}

#[async_trait]
impl ControlSink for Supervisor {
    async fn write_line(&self, line: Bytes) -> Result<(), EngineError> {
        Supervisor::write_line(self, &line).await
    }
}

async fn read_stdout(
    mut stdout: ChildStdout,
    events: mpsc::UnboundedSender<ProcessEvent>,
    label: String,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("{}: stdout closed", label);
                break;
            }
            Ok(_) => {
                if events.send(ProcessEvent::Output(buf.split().freeze())).is_err() {
                    debug!("{}: output consumer gone, stopping reader", label);
                    break;
                }
            }
            Err(e) => {
                warn!("{}: stdout read failed: {}", label, e);
                break;
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr, label: String) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(target: "warble::engine_stderr", "{}: {}", label, text);
                }
            }
            Err(e) => {
                debug!("{}: stderr read failed: {}", label, e);
                break;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    label: String,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        // Also fires when the Supervisor is dropped without a shutdown
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("{}: kill failed: {}", label, e);
            }
            (child.wait().await, true)
        }
    };

    let report = match status {
        Ok(status) => ExitReport::from_status(status, killed),
        Err(e) => {
            warn!("{}: failed to collect exit status: {}", label, e);
            ExitReport::unknown(killed)
        }
    };

    if timeout(STDOUT_DRAIN, reader).await.is_err() {
        warn!("{}: stdout still open after exit, not waiting for it", label);
    }

    if report.success() {
        info!("{}: exited ({})", label, report);
    } else {
        warn!("{}: exited ({})", label, report);
    }
    exit_tx.send_replace(Some(report.clone()));
    let _ = events.send(ProcessEvent::Exited(report));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn next_exit(events: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (Vec<u8>, ExitReport) {
        let mut output = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.extend_from_slice(&chunk),
                ProcessEvent::Exited(report) => return (output, report),
            }
        }
        panic!("event channel closed without an exit");
    }

    #[tokio::test]
    async fn spawn_failure_is_immediate() {
        let err = Supervisor::start(&EngineCommand::new("/definitely/not/an/engine")).unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn output_arrives_before_exit() {
        let command = EngineCommand::new("/bin/sh")
            .arg("-c")
            .arg("printf 'abc'; printf 'oops' >&2; exit 3");
        let (supervisor, mut events) = Supervisor::start(&command).unwrap();

        let (output, report) = next_exit(&mut events).await;
        assert_eq!(output, b"abc");
        assert_eq!(report.code, Some(3));
        assert!(!report.killed);
        assert!(events.recv().await.is_none());

        assert!(!supervisor.is_running());
        assert!(matches!(
            supervisor.write_line(b"hello\n").await,
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let command = EngineCommand::new("/bin/sh")
            .args(["-c", "printf '%s' \"$WARBLE_TEST_VALUE\""])
            .env("WARBLE_TEST_VALUE", "from-env");
        let (_supervisor, mut events) = Supervisor::start(&command).unwrap();
        let (output, _) = next_exit(&mut events).await;
        assert_eq!(output, b"from-env");
    }

    #[tokio::test]
    async fn stdin_reaches_child() {
        let command = EngineCommand::new("/bin/cat");
        let (supervisor, mut events) = Supervisor::start(&command).unwrap();

        supervisor.write_line(b"line one\n").await.unwrap();
        let outcome = supervisor.shutdown(Duration::from_secs(2)).await;
        assert!(matches!(outcome, ShutdownOutcome::Exited(ref r) if r.success()));

        let (output, _) = next_exit(&mut events).await;
        assert_eq!(output, b"line one\n");
    }

    #[tokio::test]
    async fn shutdown_kills_after_grace() {
        let command = EngineCommand::new("/bin/sh").args(["-c", "trap '' TERM; exec sleep 30"]);
        let (supervisor, mut events) = Supervisor::start(&command).unwrap();

        let started = std::time::Instant::now();
        let outcome = supervisor.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        match outcome {
            ShutdownOutcome::Killed(Some(report)) => assert!(report.killed),
            other => panic!("expected kill, got {:?}", other),
        }
        let (_, report) = next_exit(&mut events).await;
        assert!(report.killed);

        assert!(matches!(
            supervisor.shutdown(Duration::from_millis(10)).await,
            ShutdownOutcome::AlreadyExited(_)
        ));
    }
}
