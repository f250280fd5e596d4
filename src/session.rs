//! Persistent srvrmgr session: spawn the interactive shell, attach its three
//! pipes, run one reader task per output stream, and drive the connection
//! status through `SessionState`.

use crate::config::{BackoffConfig, ConnectionConfig, ExporterConfig, HeartbeatConfig, SessionConfig};
use crate::status::{ConnectionStatus, SessionState, TransitionError};
use crate::watchdog::ReconnectStats;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines buffered per output stream before the reader task waits for the consumer.
const QUEUE_CAPACITY: usize = 4096;

/// Startup stderr fragments that mean the shell could not log in.
static STARTUP_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)error|failed|cannot connect|connection refused|unknown host|timeout|authentication failed|access denied|invalid credentials|server not found",
    )
    .unwrap()
});

/// Errors produced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The executable could not be started.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The child came up without one of its standard streams.
    #[error("failed to attach {stream} pipe")]
    MissingPipe { stream: &'static str },
    /// Writing to the shell failed.
    #[error("connection to srvrmgr lost: {source}")]
    Pipe { source: std::io::Error },
    /// The shell closed its output mid-exchange.
    #[error("srvrmgr output stream closed")]
    StreamClosed,
    /// Startup stderr matched a known failure message.
    #[error("connection refused by remote: {line}")]
    Refused { line: String },
    #[error("srvrmgr exited during startup ({status})")]
    ExitedDuringStartup { status: String },
    /// No prompt or terminator before the deadline. Carries what was read.
    #[error("timeout waiting for prompt after `{command}` ({} lines received)", partial.len())]
    Timeout {
        command: String,
        partial: Vec<String>,
    },
    #[error("cannot send command: not connected (status: {status})")]
    NotConnected { status: ConnectionStatus },
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Everything a session needs to (re)connect and supervise itself.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    pub heartbeat: HeartbeatConfig,
}

impl From<&ExporterConfig> for SessionSettings {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            connection: config.connection.clone(),
            session: config.session.clone(),
            backoff: config.backoff.clone(),
            heartbeat: config.heartbeat.clone(),
        }
    }
}

/// Handle to one srvrmgr session. Clones share the same process.
#[derive(Clone)]
pub struct ProcessSession {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) settings: SessionSettings,
    state: Mutex<SessionState>,
    /// Held for the whole of a command exchange, so one command is in flight at a time.
    pub(crate) pipes: tokio::sync::Mutex<Option<Pipes>>,
    supervision: Mutex<Supervision>,
    pub(crate) stats: ReconnectStats,
}

/// Stop signal and background tasks owned by the supervisor.
pub(crate) struct Supervision {
    pub(crate) stop: CancellationToken,
    pub(crate) heartbeat: Option<JoinHandle<()>>,
    pub(crate) reconnect_delay: Duration,
}

/// A running child with its input writer and per-stream line queues.
pub(crate) struct Pipes {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    pub(crate) stdout: mpsc::Receiver<String>,
    pub(crate) stderr: mpsc::Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl Pipes {
    /// Drop anything left over from a previous exchange.
    pub(crate) fn clear_queues(&mut self) {
        while self.stdout.try_recv().is_ok() {}
        while self.stderr.try_recv().is_ok() {}
    }

    pub(crate) async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }
}

impl ProcessSession {
    /// Disconnected session; nothing is spawned until `connect`.
    pub fn new(settings: SessionSettings) -> Self {
        tracing::debug!(
            gateway = %settings.connection.gateway,
            enterprise = %settings.connection.enterprise,
            server = %settings.connection.server,
            path = %settings.connection.srvrmgr_path.display(),
            auto_reconnect = settings.session.auto_reconnect,
            "creating srvrmgr session"
        );
        let supervision = Supervision {
            stop: CancellationToken::new(),
            heartbeat: None,
            reconnect_delay: settings.session.reconnect_delay(),
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::new(settings.session.auto_reconnect)),
                pipes: tokio::sync::Mutex::new(None),
                supervision: Mutex::new(supervision),
                stats: ReconnectStats::default(),
                settings,
            }),
        }
    }

    /// Settings the session was created with.
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Whether the session is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Whether a reconnection loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.state().is_reconnecting()
    }

    /// Whether failures start the reconnection loop.
    pub fn auto_reconnect(&self) -> bool {
        self.state().auto_reconnect()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn supervision(&self) -> MutexGuard<'_, Supervision> {
        self.inner
            .supervision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.supervision().stop.clone()
    }

    /// Cancel the reconnection loop and heartbeat, and arm a fresh stop signal.
    pub(crate) fn reset_stop(&self) {
        let mut sup = self.supervision();
        sup.stop.cancel();
        sup.stop = CancellationToken::new();
        if let Some(heartbeat) = sup.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Start srvrmgr and wait for it to settle.
    ///
    /// Only valid from `Disconnected`. On success the status is `Connected`
    /// and, with auto-reconnect enabled, the heartbeat is running.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.state().begin_connect()?;
        let stop = self.stop_token();

        tracing::info!(
            gateway = %self.inner.settings.connection.gateway,
            enterprise = %self.inner.settings.connection.enterprise,
            server = %self.inner.settings.connection.server,
            "connecting to srvrmgr"
        );

        match self.establish(&stop).await {
            Ok(()) => {
                self.state().connected()?;
                self.start_heartbeat();
                tracing::info!("connected to srvrmgr");
                Ok(())
            }
            Err(e) => {
                let _ = self.state().connection_failed();
                tracing::error!(error = %e, "failed to connect to srvrmgr");
                Err(e)
            }
        }
    }

    /// Build the argument vector passed to srvrmgr.
    pub(crate) fn build_args(connection: &ConnectionConfig) -> Vec<String> {
        vec![
            "-g".to_string(),
            connection.gateway.clone(),
            "-e".to_string(),
            connection.enterprise.clone(),
            "-s".to_string(),
            connection.server.clone(),
            "-u".to_string(),
            connection.user.clone(),
            "-p".to_string(),
            connection.password.clone(),
        ]
    }

    /// Spawn, attach pipes, settle, and install the new process.
    ///
    /// Leaves the status untouched; callers own the transition.
    pub(crate) async fn establish(&self, stop: &CancellationToken) -> Result<(), SessionError> {
        let connection = &self.inner.settings.connection;
        let mut child = Command::new(&connection.srvrmgr_path)
            .args(Self::build_args(connection))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn {
                path: connection.srvrmgr_path.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, "srvrmgr process started");

        let stdin = child
            .stdin
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stderr" })?;

        let (stdout_tx, stdout_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(QUEUE_CAPACITY);
        let readers = vec![
            spawn_reader(stdout, stdout_tx, "stdout"),
            spawn_reader(stderr, stderr_tx, "stderr"),
        ];

        let mut pipes = Pipes {
            child,
            stdin: BufWriter::new(stdin),
            stdout: stdout_rx,
            stderr: stderr_rx,
            readers,
        };

        tokio::select! {
            _ = stop.cancelled() => {
                shutdown_pipes(pipes, &self.inner.settings.session).await;
                return Err(SessionError::Cancelled);
            }
            _ = tokio::time::sleep(self.inner.settings.session.settle_window()) => {}
        }

        if let Err(e) = inspect_startup(&mut pipes) {
            shutdown_pipes(pipes, &self.inner.settings.session).await;
            return Err(e);
        }

        let mut slot = self.inner.pipes.lock().await;
        if stop.is_cancelled() {
            drop(slot);
            shutdown_pipes(pipes, &self.inner.settings.session).await;
            return Err(SessionError::Cancelled);
        }
        if let Some(stale) = slot.replace(pipes) {
            tracing::warn!("replacing a process that was still attached");
            drop(slot);
            shutdown_pipes(stale, &self.inner.settings.session).await;
        }
        Ok(())
    }

    /// Stop srvrmgr: cancel supervision, ask the shell to exit, then force it.
    ///
    /// A no-op when already `Disconnected`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.reset_stop();
        {
            let mut state = self.state();
            if state.status() == ConnectionStatus::Disconnected {
                return Ok(());
            }
            state.begin_disconnect()?;
        }

        tracing::debug!("disconnecting from srvrmgr");
        let session_config = &self.inner.settings.session;
        let pipes = self.inner.pipes.lock().await.take();
        if let Some(mut pipes) = pipes {
            let exit_timeout = session_config.exit_timeout();
            match tokio::time::timeout(exit_timeout, pipes.write_line("exit")).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "exit command not delivered"),
                Err(_) => tracing::debug!("exit command timed out"),
            }
            match tokio::time::timeout(exit_timeout, pipes.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(status = %status, "srvrmgr exited");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "failed waiting for srvrmgr to exit"),
                Err(_) => tracing::warn!("srvrmgr did not exit gracefully, terminating"),
            }
            shutdown_pipes(pipes, session_config).await;
        }

        self.state().disconnected()?;
        tracing::info!("disconnected from srvrmgr");
        Ok(())
    }

    /// Kill the current process (if any) without touching the status.
    pub(crate) async fn teardown_process(&self) {
        let pipes = self.inner.pipes.lock().await.take();
        if let Some(pipes) = pipes {
            tracing::debug!("cleaning up srvrmgr process");
            shutdown_pipes(pipes, &self.inner.settings.session).await;
        }
    }

    /// Drop the process and mark the session failed, leaving recovery to the next caller.
    pub async fn abandon(&self) {
        self.reset_stop();
        self.teardown_process().await;
        if let Err(e) = self.state().connection_failed() {
            tracing::debug!(error = %e, "session not marked failed");
        }
    }
}

/// Check early stderr output and process liveness after the settle window.
fn inspect_startup(pipes: &mut Pipes) -> Result<(), SessionError> {
    let mut early_stderr = Vec::new();
    while let Ok(line) = pipes.stderr.try_recv() {
        early_stderr.push(line);
    }
    for line in &early_stderr {
        tracing::debug!(line = %line, "startup stderr");
        if STARTUP_FAILURE.is_match(line) {
            tracing::error!(line = %line, "connection error detected in stderr output");
            return Err(SessionError::Refused { line: line.clone() });
        }
    }

    match pipes.child.try_wait() {
        Ok(Some(status)) => Err(SessionError::ExitedDuringStartup {
            status: status.to_string(),
        }),
        Ok(None) => Ok(()),
        Err(e) => Err(SessionError::Pipe { source: e }),
    }
}

/// Terminate the child and wait, bounded, for it and both readers to finish.
async fn shutdown_pipes(pipes: Pipes, config: &SessionConfig) {
    let Pipes {
        mut child,
        stdin,
        stdout,
        stderr,
        readers,
    } = pipes;
    drop(stdin);
    drop(stdout);
    drop(stderr);

    let exit_timeout = config.process_exit_timeout();
    if let Ok(None) = child.try_wait() {
        if let Some(pid) = child.id() {
            let pgid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(exit_timeout, child.wait()).await.is_err() {
            tracing::warn!("timed out waiting for srvrmgr to exit, forcing kill");
            let killed = child.id().map(|pid| {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL)
            });
            if !matches!(killed, Some(Ok(()))) {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill failed");
                }
            }
            let _ = tokio::time::timeout(exit_timeout, child.wait()).await;
        }
    }

    let drain = join_readers(readers);
    if tokio::time::timeout(config.reader_drain_timeout(), drain)
        .await
        .is_err()
    {
        tracing::warn!("timed out waiting for output readers to complete");
    } else {
        tracing::debug!("output readers completed");
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = reader.await;
    }
}

/// Forward trimmed lines from one output stream into its queue until EOF.
fn spawn_reader<R>(stream: R, tx: mpsc::Sender<String>, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tracing::trace!(stream = name, line = %line, "read output line");
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = name, error = %e, "output reader error");
                    break;
                }
            }
        }
        tracing::debug!(stream = name, "output reader finished");
    })
}
