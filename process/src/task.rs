//! Single-use subprocess task with streamed output and cancellation.
//!
//! A [`ProcessTask`] runs one external command to completion. Output from
//! stdout and stderr is reassembled into lines by one reader task per stream
//! and handed to a single consumer loop, which is the only place observer
//! callbacks run. Lines of one stream keep their order; lines of different
//! streams may interleave.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc, watch};

use crate::group;
use crate::lines::LineReader;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to keep draining output after the process exited. A forked
/// descendant can hold the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl TaskCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Environment overrides merged over the inherited environment.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn working_dir(&self) -> Option<&std::path::Path> {
        self.cwd.as_deref()
    }

    /// Program and arguments joined by spaces, for display.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        group::set_new_session(&mut cmd);
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed { code: Option<i32> },
    Interrupted,
    Failed,
}

/// How a task that did start came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Exited on its own. `code` is `None` when it died from a signal.
    Completed { code: Option<i32> },
    /// Ended after [`KillHandle::kill`] was requested, however it exited.
    Interrupted,
}

impl TaskOutcome {
    #[must_use]
    pub fn success(self) -> bool {
        matches!(self, Self::Completed { code: Some(0) })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task has already been started")]
    AlreadyStarted,
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("waiting for `{program}` failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    /// The executable could not be found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Receives task output. All callbacks run on the task's consumer loop.
pub trait TaskObserver: Send {
    /// Fires once, before the process is spawned.
    fn on_start(&mut self) {}

    fn on_stdout_line(&mut self, line: &str);

    fn on_stderr_line(&mut self, line: &str);

    /// Fires once, after all output has been delivered.
    fn on_exit(&mut self, _outcome: TaskOutcome) {}
}

enum TaskEvent {
    Stdout(String),
    Stderr(String),
}

struct Control {
    state: TaskState,
    pid: Option<u32>,
    interrupted: bool,
}

struct Shared {
    control: Mutex<Control>,
    force_kill: Notify,
    exited: watch::Sender<bool>,
    grace: Duration,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, state: TaskState) {
        {
            let mut control = self.control();
            control.state = state;
            control.pid = None;
        }
        self.exited.send_replace(true);
    }

    /// Record how the process ended. The interrupt flag is read under the
    /// same lock that leaves `Running`, so every accepted kill is reported.
    fn settle(
        &self,
        status: std::io::Result<std::process::ExitStatus>,
    ) -> std::io::Result<TaskOutcome> {
        let outcome = {
            let mut control = self.control();
            let outcome = if control.interrupted {
                Ok(TaskOutcome::Interrupted)
            } else {
                status.map(|status| TaskOutcome::Completed {
                    code: status.code(),
                })
            };
            control.state = match &outcome {
                Ok(TaskOutcome::Completed { code }) => TaskState::Completed { code: *code },
                Ok(TaskOutcome::Interrupted) => TaskState::Interrupted,
                Err(_) => TaskState::Failed,
            };
            control.pid = None;
            outcome
        };
        self.exited.send_replace(true);
        outcome
    }
}

/// A single-use external command.
pub struct ProcessTask {
    command: TaskCommand,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTask")
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessTask {
    #[must_use]
    pub fn new(command: TaskCommand) -> Self {
        Self::with_grace(command, DEFAULT_INTERRUPT_GRACE)
    }

    /// `grace` bounds how long [`KillHandle::kill`] waits after the
    /// interrupt before killing outright.
    #[must_use]
    pub fn with_grace(command: TaskCommand, grace: Duration) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            command,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: TaskState::Idle,
                    pid: None,
                    interrupted: false,
                }),
                force_kill: Notify::new(),
                exited,
                grace,
            }),
        }
    }

    #[must_use]
    pub fn command(&self) -> &TaskCommand {
        &self.command
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.shared.control().state
    }

    #[must_use]
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the command to completion, streaming output to `observer`.
    ///
    /// A task runs at most once; later calls fail with
    /// [`TaskError::AlreadyStarted`]. Spawn failures are returned as
    /// [`TaskError::Spawn`] and leave the task `Failed`.
    pub async fn execute<O: TaskObserver>(&self, observer: &mut O) -> Result<TaskOutcome, TaskError> {
        {
            let mut control = self.shared.control();
            if control.state != TaskState::Idle {
                return Err(TaskError::AlreadyStarted);
            }
            control.state = TaskState::Running;
        }

        observer.on_start();

        let mut child = match self.command.to_command().spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::warn!("Failed to spawn `{}`: {source}", self.command.program);
                self.shared.finish(TaskState::Failed);
                return Err(TaskError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        self.shared.control().pid = pid;
        tracing::debug!(?pid, "Started `{}`", self.command.display());

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (None, _) => return Err(self.abandon(child, "stdout").await),
            (_, None) => return Err(self.abandon(child, "stderr").await),
        };

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        spawn_line_reader(stdout, TaskEvent::Stdout, event_tx.clone());
        spawn_line_reader(stderr, TaskEvent::Stderr, event_tx);

        let wait_result = loop {
            tokio::select! {
                Some(event) = event_rx.recv() => dispatch(observer, event),
                result = child.wait() => break result,
                () = self.shared.force_kill.notified() => force_kill(&mut child, pid),
            }
        };

        // Descendants that ignored the interrupt would otherwise keep the
        // pipes open; the group id stays reserved while any member lives.
        #[cfg(unix)]
        {
            let interrupted = self.shared.control().interrupted;
            if let (true, Some(pid)) = (interrupted, pid) {
                let _ = group::signal_process_group(pid, group::GroupSignal::Kill);
            }
        }

        // The task stays `Running` until settled, so a kill can still land
        // here; it reaches whatever holds the pipes open.
        let drain = async {
            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => dispatch(observer, event),
                        None => break,
                    },
                    () = self.shared.force_kill.notified() => force_kill(&mut child, pid),
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(
                "Output of `{}` still open after exit; dropping the rest",
                self.command.program
            );
        }

        let outcome = self
            .shared
            .settle(wait_result)
            .map_err(|source| TaskError::Wait {
                program: self.command.program.clone(),
                source,
            })?;
        tracing::debug!(?outcome, "`{}` finished", self.command.program);
        observer.on_exit(outcome);
        Ok(outcome)
    }

    async fn abandon(&self, mut child: Child, pipe: &'static str) -> TaskError {
        let pid = child.id();
        force_kill(&mut child, pid);
        let _ = child.wait().await;
        self.shared.finish(TaskState::Failed);
        TaskError::MissingPipe(pipe)
    }
}

fn dispatch<O: TaskObserver>(observer: &mut O, event: TaskEvent) {
    match event {
        TaskEvent::Stdout(line) => observer.on_stdout_line(&line),
        TaskEvent::Stderr(line) => observer.on_stderr_line(&line),
    }
}

fn spawn_line_reader<R>(reader: R, wrap: fn(String) -> TaskEvent, tx: mpsc::Sender<TaskEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Task output read error: {e}");
                    break;
                }
            }
        }
    });
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        match group::signal_process_group(pid, group::GroupSignal::Kill) {
            Ok(_) => return,
            Err(e) => tracing::warn!(pid, "Failed to kill process group: {e}"),
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill child: {e}");
    }
}

/// Requests cancellation of a running [`ProcessTask`]. Cheap to clone.
#[derive(Clone)]
pub struct KillHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for KillHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillHandle").finish_non_exhaustive()
    }
}

impl KillHandle {
    /// Interrupt the task and wait for it to exit.
    ///
    /// The process group first gets an interrupt; if it is still alive after
    /// the grace period it is killed. Does nothing when the task is not
    /// running or a cancellation is already in flight.
    pub async fn kill(&self) {
        let mut exited = self.shared.exited.subscribe();
        let pid = {
            let mut control = self.shared.control();
            if control.state != TaskState::Running || control.interrupted {
                return;
            }
            control.interrupted = true;
            control.pid
        };

        tracing::info!(?pid, "Interrupting task");
        match pid {
            #[cfg(unix)]
            Some(pid) => {
                if let Err(e) = group::signal_process_group(pid, group::GroupSignal::Interrupt) {
                    tracing::warn!(pid, "Failed to interrupt process group: {e}");
                    self.shared.force_kill.notify_one();
                }
            }
            // Not spawned yet, or no cooperative interrupt on this platform.
            _ => self.shared.force_kill.notify_one(),
        }

        let grace = self.shared.grace;
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::warn!("Task ignored interrupt for {grace:?}; killing");
            self.shared.force_kill.notify_one();
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    /// Whether the task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.control().state == TaskState::Running
    }

    /// Whether the task has run and ended, in any way.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(
            self.shared.control().state,
            TaskState::Idle | TaskState::Running
        )
    }
}
