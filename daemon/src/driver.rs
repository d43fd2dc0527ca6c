//! Daemon process lifecycle and request dispatch.
//!
//! One daemon process serves many queued requests. Requests are written in
//! issue order and answered in the same order, so the driver pairs each
//! response batch with the oldest pending request.
//!
//! ```text
//! Stopped ──start──▶ Starting ──spawned──▶ Running
//!    ▲                                      │ exit 0 ──▶ Stopped
//!    │ not installed                        │ crash  ──▶ Crashed ──delay──▶ Starting
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anvil_config::DaemonConfig;
use anvil_process::LineReader;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::{self, MatchItem, PendingQueue, Request, ResponseAssembler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    /// Exited unexpectedly; a restart is scheduled.
    Crashed,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The executable does not exist. Terminal until started again explicitly.
    #[error("`{program}` is not installed or not on PATH")]
    NotInstalled { program: String },
    #[error("completion daemon is not running")]
    NotRunning,
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send request to the completion daemon")]
    Write,
}

struct Session {
    generation: u64,
    pending: PendingQueue,
    writer: mpsc::UnboundedSender<String>,
    stop_tx: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

struct DriverState {
    status: DaemonState,
    generation: u64,
    session: Option<Session>,
}

struct Inner {
    config: DaemonConfig,
    state: Mutex<DriverState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, generation: u64, batch: Vec<String>) {
        let mut state = self.state();
        let Some(session) = state
            .session
            .as_mut()
            .filter(|session| session.generation == generation)
        else {
            return;
        };
        if !session.pending.resolve_next(batch) {
            tracing::warn!("Completion daemon sent a response nobody asked for; dropping it");
        }
    }

    fn on_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<std::process::ExitStatus>) {
        let mut state = self.state();
        let Some(mut session) = state
            .session
            .take_if(|session| session.generation == generation)
        else {
            // Stopped on request; `stop` already cleaned up.
            return;
        };

        match status {
            Ok(status) if status.success() => {
                tracing::info!("Completion daemon exited");
                state.status = DaemonState::Stopped;
            }
            Ok(status) => {
                tracing::warn!(code = ?status.code(), "Completion daemon crashed");
                state.status = DaemonState::Crashed;
                self.schedule_restart(generation);
            }
            Err(e) => {
                tracing::warn!("Lost track of completion daemon: {e}");
                state.status = DaemonState::Crashed;
                self.schedule_restart(generation);
            }
        }

        let dropped = session.pending.drain_empty();
        if dropped > 0 {
            tracing::debug!(dropped, "Resolved pending requests empty");
        }
    }

    fn schedule_restart(self: &Arc<Self>, generation: u64) {
        let inner = Arc::clone(self);
        let delay = self.config.restart_delay();
        tracing::info!("Restarting completion daemon in {delay:?}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let state = inner.state();
                if state.status != DaemonState::Crashed || state.generation != generation {
                    return;
                }
            }
            if let Err(e) = (DaemonRpcDriver { inner }).start() {
                tracing::warn!("Completion daemon restart failed: {e}");
            }
        });
    }
}

/// Drives a completion daemon subprocess. Cheap to clone; clones share the
/// same process.
#[derive(Clone)]
pub struct DaemonRpcDriver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DaemonRpcDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonRpcDriver")
            .field("program", &self.inner.config.program)
            .field("state", &self.state())
            .finish()
    }
}

impl DaemonRpcDriver {
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(DriverState {
                    status: DaemonState::Stopped,
                    generation: 0,
                    session: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> DaemonState {
        self.inner.state().status
    }

    /// Requests written but not yet answered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .state()
            .session
            .as_ref()
            .map_or(0, |session| session.pending.len())
    }

    /// Spawn the daemon. Does nothing if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInstalled`] when the executable is missing (no
    /// restart follows); [`DaemonError::Spawn`] for any other spawn failure,
    /// in which case a restart is scheduled.
    pub fn start(&self) -> Result<(), DaemonError> {
        let config = &self.inner.config;
        let mut state = self.inner.state();
        if matches!(state.status, DaemonState::Starting | DaemonState::Running) {
            return Ok(());
        }
        state.status = DaemonState::Starting;
        state.generation += 1;
        let generation = state.generation;

        let mut child = match spawn_daemon(config) {
            Ok(child) => child,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!("Completion daemon `{}` is not installed", config.program);
                state.status = DaemonState::Stopped;
                return Err(DaemonError::NotInstalled {
                    program: config.program.clone(),
                });
            }
            Err(source) => {
                tracing::warn!("Failed to spawn `{}`: {source}", config.program);
                state.status = DaemonState::Crashed;
                self.inner.schedule_restart(generation);
                return Err(DaemonError::Spawn {
                    program: config.program.clone(),
                    source,
                });
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Pipes were requested; a spawn without them is a broken child.
            state.status = DaemonState::Crashed;
            self.inner.schedule_restart(generation);
            return Err(DaemonError::Spawn {
                program: config.program.clone(),
                source: std::io::Error::other("daemon spawned without stdio pipes"),
            });
        };

        let pid = child.id();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(write_requests(stdin, writer_rx));
        tokio::spawn(read_responses(Arc::clone(&self.inner), generation, stdout));
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            generation,
            child,
            stop_rx,
            config.stop_grace(),
        ));

        state.session = Some(Session {
            generation,
            pending: PendingQueue::new(),
            writer,
            stop_tx,
            supervisor,
        });
        state.status = DaemonState::Running;
        tracing::info!(?pid, "Started completion daemon `{}`", config.program);
        Ok(())
    }

    /// Stop the daemon and wait for it to exit. Pending requests resolve
    /// with empty results. Does nothing when already stopped.
    pub async fn stop(&self) {
        let session = {
            let mut state = self.inner.state();
            state.status = DaemonState::Stopped;
            state.session.take()
        };
        let Some(Session {
            mut pending,
            writer,
            stop_tx,
            supervisor,
            ..
        }) = session
        else {
            return;
        };

        pending.drain_empty();
        // Closing stdin lets the daemon exit on its own.
        drop(writer);
        let _ = stop_tx.send(());
        if let Err(e) = supervisor.await {
            tracing::warn!("Completion daemon supervisor failed: {e}");
        }
        tracing::info!("Stopped completion daemon");
    }

    /// Send one raw request and wait for its response lines.
    ///
    /// Resolves with an empty batch if the daemon stops or crashes first.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotRunning`] when no daemon process is up;
    /// [`DaemonError::Write`] when its input has already closed.
    pub async fn run_command<S: AsRef<str>>(&self, fields: &[S]) -> Result<Vec<String>, DaemonError> {
        let response = {
            let mut state = self.inner.state();
            if state.status != DaemonState::Running {
                return Err(DaemonError::NotRunning);
            }
            let session = state.session.as_mut().ok_or(DaemonError::NotRunning)?;
            let (tx, rx) = oneshot::channel();
            // Write and enqueue under one lock so queue order is wire order.
            session
                .writer
                .send(protocol::encode_request(fields))
                .map_err(|_| DaemonError::Write)?;
            session.pending.enqueue(tx);
            rx
        };
        Ok(response.await.unwrap_or_default())
    }

    async fn request_matches(&self, request: &Request) -> Result<Vec<MatchItem>, DaemonError> {
        let batch = self.run_command(&request.fields()).await?;
        Ok(protocol::parse_matches(&batch))
    }

    /// Completions (with snippets) at a 1-based line and 0-based column.
    pub async fn complete_with_snippet(
        &self,
        file: &Path,
        line: u32,
        column: u32,
    ) -> Result<Vec<MatchItem>, DaemonError> {
        self.request_matches(&Request::complete_with_snippet(file, line, column))
            .await
    }

    pub async fn complete(
        &self,
        file: &Path,
        line: u32,
        column: u32,
    ) -> Result<Vec<MatchItem>, DaemonError> {
        self.request_matches(&Request::complete(file, line, column))
            .await
    }

    /// Definition site of the symbol under the cursor, if the daemon found one.
    pub async fn find_definition(
        &self,
        file: &Path,
        line: u32,
        column: u32,
    ) -> Result<Option<MatchItem>, DaemonError> {
        let matches = self
            .request_matches(&Request::find_definition(file, line, column))
            .await?;
        Ok(matches.into_iter().next())
    }
}

fn spawn_daemon(config: &DaemonConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .envs(config.env_overrides())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    anvil_process::group::set_new_session(&mut cmd);
    cmd.spawn()
}

async fn write_requests(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        tracing::trace!(request = line.trim_end(), "Daemon request");
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!("Completion daemon write error: {e}");
            break;
        }
    }
}

async fn read_responses(inner: Arc<Inner>, generation: u64, stdout: ChildStdout) {
    let mut reader = LineReader::new(stdout);
    let mut assembler = ResponseAssembler::new();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if let Some(batch) = assembler.push_line(line) {
                    inner.resolve(generation, batch);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Completion daemon read error: {e}");
                break;
            }
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!("Completion daemon ignored stop for {grace:?}; killing");
                    kill(&mut child);
                    child.wait().await
                }
            }
        }
    };
    inner.on_exit(generation, status);
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use anvil_process::group::{GroupSignal, signal_process_group};
        if signal_process_group(pid, GroupSignal::Kill).is_ok() {
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill completion daemon: {e}");
    }
}
