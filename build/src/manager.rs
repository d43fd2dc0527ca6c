//! TaskManager: single-flight build runs feeding the diagnostic publisher.
//!
//! Each run clears the previous diagnostics, then publishes records as the
//! tool reports them. Raw output and status changes go out as
//! [`BuildEvent`]s on an unbounded channel owned by the caller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anvil_config::{BuildConfig, BusyPolicy};
use anvil_diagnostics::json::{self, ToolMessage};
use anvil_diagnostics::{DiagnosticParser, DiagnosticPublisher, DiagnosticSink, DiagnosticsSnapshot};
use anvil_process::{KillHandle, ProcessTask, TaskCommand, TaskObserver, TaskOutcome};
use anvil_types::{DiagnosticRecord, OutputMode};
use tokio::sync::mpsc;

use crate::args::{manifest_override, synthesize_args};
use crate::events::{BuildEvent, BuildStatus, OutputStream};

/// One requested run of the build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocation {
    subcommand: String,
    args: Vec<String>,
    cwd: PathBuf,
}

impl BuildInvocation {
    #[must_use]
    pub fn new(subcommand: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            subcommand: subcommand.into(),
            args: Vec::new(),
            cwd: cwd.into(),
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
    pub fn subcommand(&self) -> &str {
        &self.subcommand
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(BuildStatus),
    /// Another run was active and the busy policy is `ignore`.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Another run was active and the busy policy is `ask`; the caller decides.
    #[error("a build is already running: {command_line}")]
    Busy { command_line: String },
}

#[derive(Clone)]
struct ActiveTask {
    id: u64,
    command_line: String,
    kill: KillHandle,
}

/// Runs build tool invocations one at a time.
///
/// Shareable behind an `Arc`: `run` and `stop` may be called from different
/// tasks.
pub struct TaskManager {
    config: BuildConfig,
    publisher: Arc<Mutex<DiagnosticPublisher>>,
    active: Mutex<Option<ActiveTask>>,
    next_id: AtomicU64,
    tool_missing_reported: AtomicBool,
    events: mpsc::UnboundedSender<BuildEvent>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tool", &self.config.tool)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Create a manager publishing to `sink`. Returns the event stream.
    #[must_use]
    pub fn new(
        config: BuildConfig,
        sink: Box<dyn DiagnosticSink>,
    ) -> (Self, mpsc::UnboundedReceiver<BuildEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            publisher: Arc::new(Mutex::new(DiagnosticPublisher::new(sink))),
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            tool_missing_reported: AtomicBool::new(false),
            events,
        };
        (manager, event_rx)
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveTask>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active()
            .as_ref()
            .is_some_and(|task| !task.kill.is_finished())
    }

    /// Current diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        lock_publisher(&self.publisher).snapshot()
    }

    /// The command that would run for `invocation`, and its working directory.
    #[must_use]
    pub fn command_for(&self, invocation: &BuildInvocation) -> TaskCommand {
        let project_dir = self
            .config
            .project_dir
            .clone()
            .unwrap_or_else(|| invocation.cwd.clone());
        let manifest = manifest_override(self.config.project_dir.as_deref(), &invocation.cwd);
        let args = synthesize_args(
            &invocation.subcommand,
            &invocation.args,
            self.config.output_mode.is_structured(),
            manifest.as_deref(),
        );
        TaskCommand::new(&self.config.tool)
            .args(args)
            .cwd(project_dir)
            .envs(self.config.env_overrides())
    }

    /// Run `invocation` to completion under the busy policy.
    ///
    /// # Errors
    ///
    /// [`BuildError::Busy`] when a run is active and the policy is `ask`.
    pub async fn run(&self, invocation: BuildInvocation) -> Result<RunOutcome, BuildError> {
        let command = self.command_for(&invocation);
        let command_line = command.display();
        let working_dir = command
            .working_dir()
            .map_or_else(|| invocation.cwd.clone(), Path::to_path_buf);
        let task = ProcessTask::with_grace(command, self.config.interrupt_grace());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        loop {
            let current = {
                let mut active = self.active();
                match active.as_ref() {
                    Some(current) if !current.kill.is_finished() => current.clone(),
                    _ => {
                        *active = Some(ActiveTask {
                            id,
                            command_line: command_line.clone(),
                            kill: task.kill_handle(),
                        });
                        break;
                    }
                }
            };

            match self.config.on_busy {
                BusyPolicy::Ignore => {
                    tracing::info!(
                        "Ignoring `{command_line}`: `{}` is still running",
                        current.command_line
                    );
                    return Ok(RunOutcome::Skipped);
                }
                BusyPolicy::Ask => {
                    return Err(BuildError::Busy {
                        command_line: current.command_line,
                    });
                }
                BusyPolicy::Stop => {
                    tracing::info!("Stopping `{}` to run `{command_line}`", current.command_line);
                    current.kill.kill().await;
                    tokio::task::yield_now().await;
                }
            }
        }

        let _guard = ActiveGuard { manager: self, id };
        tracing::info!("Running `{command_line}`");

        let mut observer = BuildObserver {
            parser: DiagnosticParser::new(self.config.output_mode),
            publisher: Arc::clone(&self.publisher),
            events: self.events.clone(),
            working_dir,
            command_line,
            pending_stdout: String::new(),
            pending_stderr: String::new(),
        };

        let status = match task.execute(&mut observer).await {
            Ok(TaskOutcome::Completed { code: Some(0) }) => BuildStatus::Success,
            Ok(TaskOutcome::Completed { code }) => BuildStatus::Failed { code },
            Ok(TaskOutcome::Interrupted) => BuildStatus::Interrupted,
            Err(e) if e.is_not_found() => {
                let program = self.config.tool.clone();
                if !self.tool_missing_reported.swap(true, Ordering::Relaxed) {
                    self.emit(BuildEvent::ToolMissing {
                        program: program.clone(),
                    });
                }
                BuildStatus::ToolMissing { program }
            }
            Err(e) => BuildStatus::SpawnFailed {
                message: e.to_string(),
            },
        };

        tracing::info!("Build {}", status.describe());
        self.emit(BuildEvent::Finished {
            status: status.clone(),
        });
        Ok(RunOutcome::Finished(status))
    }

    /// Interrupt the active run, if any, and wait for it to end.
    pub async fn stop(&self) {
        let current = self.active().clone();
        if let Some(current) = current {
            current.kill.kill().await;
        }
    }

    fn emit(&self, event: BuildEvent) {
        let _ = self.events.send(event);
    }
}

/// Clears the active-task slot when a run ends, however it ends.
struct ActiveGuard<'a> {
    manager: &'a TaskManager,
    id: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.manager.active();
        if active.as_ref().is_some_and(|task| task.id == self.id) {
            *active = None;
        }
    }
}

fn lock_publisher(publisher: &Mutex<DiagnosticPublisher>) -> MutexGuard<'_, DiagnosticPublisher> {
    publisher.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BuildObserver {
    parser: DiagnosticParser,
    publisher: Arc<Mutex<DiagnosticPublisher>>,
    events: mpsc::UnboundedSender<BuildEvent>,
    working_dir: PathBuf,
    command_line: String,
    /// Human-format text not yet parsed, one buffer per stream so blocks
    /// are never split by the other stream's lines. Flushed at blank lines
    /// and exit.
    pending_stdout: String,
    pending_stderr: String,
}

impl BuildObserver {
    fn emit(&self, event: BuildEvent) {
        let _ = self.events.send(event);
    }

    fn forward(&self, line: &str, stream: OutputStream) {
        self.emit(BuildEvent::Output {
            line: line.to_string(),
            stream,
        });
    }

    fn publish(&self, records: Vec<DiagnosticRecord>) {
        if records.is_empty() {
            return;
        }
        let added = lock_publisher(&self.publisher).publish_all(records, &self.working_dir);
        tracing::trace!(added, "Published diagnostics");
    }

    fn handle_line(&mut self, line: &str, stream: OutputStream) {
        match self.parser.mode() {
            OutputMode::Json => self.handle_structured(line, stream),
            OutputMode::Legacy => {
                self.forward(line, stream);
                self.publish(self.parser.parse_line(line));
            }
            OutputMode::Human => {
                self.forward(line, stream);
                if line.trim().is_empty() {
                    self.flush_human(stream);
                } else {
                    let pending = self.pending_mut(stream);
                    pending.push_str(line);
                    pending.push('\n');
                }
            }
        }
    }

    fn handle_structured(&mut self, line: &str, stream: OutputStream) {
        match json::decode_line(line) {
            Some(ToolMessage::Diagnostic { record, rendered }) => {
                if let Some(record) = record {
                    self.publish(vec![record]);
                }
                for rendered_line in rendered.as_deref().unwrap_or_default().lines() {
                    self.forward(rendered_line, stream);
                }
            }
            Some(ToolMessage::BuildFinished { success }) => {
                tracing::info!(success, "Build tool reported completion");
            }
            Some(ToolMessage::Other { reason }) => {
                tracing::trace!(%reason, "Skipping tool message");
            }
            None => self.forward(line, stream),
        }
    }

    fn pending_mut(&mut self, stream: OutputStream) -> &mut String {
        match stream {
            OutputStream::Stdout => &mut self.pending_stdout,
            OutputStream::Stderr => &mut self.pending_stderr,
        }
    }

    fn flush_human(&mut self, stream: OutputStream) {
        let text = std::mem::take(self.pending_mut(stream));
        if text.is_empty() {
            return;
        }
        self.publish(self.parser.parse_output(&text));
    }
}

impl TaskObserver for BuildObserver {
    fn on_start(&mut self) {
        lock_publisher(&self.publisher).clear();
        self.emit(BuildEvent::Started {
            command_line: self.command_line.clone(),
        });
    }

    fn on_stdout_line(&mut self, line: &str) {
        self.handle_line(line, OutputStream::Stdout);
    }

    fn on_stderr_line(&mut self, line: &str) {
        self.handle_line(line, OutputStream::Stderr);
    }

    fn on_exit(&mut self, _outcome: TaskOutcome) {
        self.flush_human(OutputStream::Stdout);
        self.flush_human(OutputStream::Stderr);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anvil_diagnostics::PublishedDiagnostic;
    use anvil_types::{Severity, SourceRange};
    use std::time::Duration;

    fn config(mode: OutputMode, on_busy: BusyPolicy) -> BuildConfig {
        BuildConfig {
            tool: "sh".to_string(),
            output_mode: mode,
            on_busy,
            interrupt_grace_ms: 2_000,
            ..BuildConfig::default()
        }
    }

    fn script(dir: &Path, body: &str) -> BuildInvocation {
        BuildInvocation::new("-c", dir).args([body])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BuildEvent>) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_output(rx: &mut mpsc::UnboundedReceiver<BuildEvent>, wanted: &str) {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if matches!(&event, BuildEvent::Output { line, .. } if line == wanted) {
                    return;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "never saw output line {wanted:?}");
    }

    fn compiler_message(file: &str, line: u32, message: &str) -> String {
        serde_json::json!({
            "reason": "compiler-message",
            "message": {
                "message": message,
                "code": { "code": "E0308" },
                "level": "error",
                "spans": [{
                    "file_name": file,
                    "line_start": line, "line_end": line,
                    "column_start": 5, "column_end": 10,
                    "is_primary": true
                }],
                "children": [],
                "rendered": format!("error[E0308]: {message}\n --> {file}:{line}:5\n")
            }
        })
        .to_string()
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<(PathBuf, Vec<PublishedDiagnostic>)>>>);

    impl DiagnosticSink for SharedSink {
        fn set_file(&mut self, path: &Path, diagnostics: Vec<PublishedDiagnostic>) {
            self.0.lock().unwrap().push((path.to_path_buf(), diagnostics));
        }

        fn clear(&mut self) {
            self.0.lock().unwrap().clear();
        }
    }

    #[tokio::test]
    async fn test_structured_run_publishes_and_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let line = compiler_message("src/main.rs", 3, "mismatched types");
        let body = format!(
            "echo '   Compiling demo v0.1.0' >&2; printf '%s\\n' '{line}' '{line}' '{{\"reason\":\"build-finished\",\"success\":false}}'; exit 101"
        );
        let sink = SharedSink::default();
        let (manager, mut rx) =
            TaskManager::new(config(OutputMode::Json, BusyPolicy::Ignore), Box::new(sink.clone()));

        let outcome = manager.run(script(dir.path(), &body)).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Finished(BuildStatus::Failed { code: Some(101) })
        );

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.total_count(), 1);
        let (path, records) = &snapshot.files()[0];
        assert_eq!(path, &dir.path().join("src/main.rs"));
        assert_eq!(records[0].range(), SourceRange::new(3, 5, 3, 10));
        assert_eq!(records[0].code(), Some("E0308"));

        let published = sink.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1[0].range.start_line, 2);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], BuildEvent::Started { command_line } if command_line.starts_with("sh -c")));
        assert!(events.contains(&BuildEvent::Output {
            line: "   Compiling demo v0.1.0".to_string(),
            stream: OutputStream::Stderr,
        }));
        assert!(events.contains(&BuildEvent::Output {
            line: "error[E0308]: mismatched types".to_string(),
            stream: OutputStream::Stdout,
        }));
        assert!(!events.iter().any(
            |e| matches!(e, BuildEvent::Output { line, .. } if line.starts_with('{'))
        ));
        assert_eq!(
            events.last(),
            Some(&BuildEvent::Finished {
                status: BuildStatus::Failed { code: Some(101) }
            })
        );
    }

    #[tokio::test]
    async fn test_legacy_run_parses_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = TaskManager::new(
            config(OutputMode::Legacy, BusyPolicy::Ignore),
            Box::new(anvil_diagnostics::NullSink),
        );
        let body = "echo 'src/main.rs:3:5: 3:10 error: mismatched types' >&2; echo 'src/lib.rs:1:1: 1:2 warning: unused' >&2";
        let outcome = manager.run(script(dir.path(), body)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(BuildStatus::Success));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.error_count(), 1);
        assert_eq!(snapshot.warning_count(), 1);
        assert_eq!(snapshot.files()[0].0, dir.path().join("src/main.rs"));
    }

    #[tokio::test]
    async fn test_human_run_flushes_at_blank_lines_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = TaskManager::new(
            config(OutputMode::Human, BusyPolicy::Ignore),
            Box::new(anvil_diagnostics::NullSink),
        );
        let body = "printf 'warning: unused variable: `y`\\n --> src/main.rs:4:9\\n  |\\n4 |     let y = 1;\\n  |         ^\\n\\nerror[E0308]: mismatched types\\n --> src/main.rs:3:18\\n  |\\n3 |     let x: i32 = 1.0;\\n  |                  ^^^\\n' >&2; exit 1";
        let outcome = manager.run(script(dir.path(), body)).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Finished(BuildStatus::Failed { code: Some(1) })
        );

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.total_count(), 2);
        let records = snapshot.for_file(&dir.path().join("src/main.rs"));
        assert_eq!(records[0].range(), SourceRange::new(3, 18, 3, 21));
        assert_eq!(records[1].severity(), Severity::Warning);
        assert_eq!(records[1].range(), SourceRange::new(4, 9, 4, 10));
    }

    #[test]
    fn test_human_blocks_survive_interleaved_streams() {
        let publisher = Arc::new(Mutex::new(DiagnosticPublisher::default()));
        let (events, _rx) = mpsc::unbounded_channel();
        let mut observer = BuildObserver {
            parser: DiagnosticParser::new(OutputMode::Human),
            publisher: Arc::clone(&publisher),
            events,
            working_dir: PathBuf::from("/work/demo"),
            command_line: "cargo build".to_string(),
            pending_stdout: String::new(),
            pending_stderr: String::new(),
        };

        observer.on_stderr_line("error[E0425]: cannot find value `z` in this scope");
        observer.on_stdout_line("   Compiling demo v0.1.0 (/work/demo)");
        observer.on_stderr_line(" --> src/main.rs:2:13");
        observer.on_stdout_line("");
        observer.on_stderr_line("  |");
        observer.on_stderr_line("2 |     let y = z;");
        observer.on_stdout_line("running 0 tests");
        observer.on_stderr_line("  |             ^ not found in this scope");
        observer.on_exit(TaskOutcome::Completed { code: Some(101) });

        let snapshot = lock_publisher(&publisher).snapshot();
        assert_eq!(snapshot.total_count(), 1);
        let record = &snapshot.for_file(Path::new("/work/demo/src/main.rs"))[0];
        assert_eq!(record.code(), Some("E0425"));
        assert_eq!(record.range(), SourceRange::new(2, 13, 2, 14));
    }

    #[tokio::test]
    async fn test_next_run_clears_previous_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = TaskManager::new(
            config(OutputMode::Legacy, BusyPolicy::Ignore),
            Box::new(anvil_diagnostics::NullSink),
        );
        manager
            .run(script(dir.path(), "echo 'a.rs:1:1: 1:2 error: boom'"))
            .await
            .unwrap();
        assert_eq!(manager.snapshot().total_count(), 1);

        manager.run(script(dir.path(), "true")).await.unwrap();
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_missing_tool_reported_once_and_not_left_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(OutputMode::Json, BusyPolicy::Ignore);
        cfg.tool = "anvil-no-such-build-tool".to_string();
        let (manager, mut rx) = TaskManager::new(cfg, Box::new(anvil_diagnostics::NullSink));

        for _ in 0..2 {
            let outcome = manager
                .run(BuildInvocation::new("build", dir.path()))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                RunOutcome::Finished(BuildStatus::ToolMissing {
                    program: "anvil-no-such-build-tool".to_string()
                })
            );
            assert!(!manager.is_busy());
        }

        let missing = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, BuildEvent::ToolMissing { .. }))
            .count();
        assert_eq!(missing, 1);
    }

    #[tokio::test]
    async fn test_busy_ignore_skips_and_stop_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut rx) = TaskManager::new(
            config(OutputMode::Legacy, BusyPolicy::Ignore),
            Box::new(anvil_diagnostics::NullSink),
        );
        let manager = Arc::new(manager);

        let first = {
            let manager = Arc::clone(&manager);
            let invocation = script(dir.path(), "echo ready; sleep 30");
            tokio::spawn(async move { manager.run(invocation).await })
        };
        wait_for_output(&mut rx, "ready").await;
        assert!(manager.is_busy());

        let second = manager.run(script(dir.path(), "true")).await.unwrap();
        assert_eq!(second, RunOutcome::Skipped);

        manager.stop().await;
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, RunOutcome::Finished(BuildStatus::Interrupted));
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn test_busy_ask_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut rx) = TaskManager::new(
            config(OutputMode::Legacy, BusyPolicy::Ask),
            Box::new(anvil_diagnostics::NullSink),
        );
        let manager = Arc::new(manager);

        let first = {
            let manager = Arc::clone(&manager);
            let invocation = script(dir.path(), "echo ready; sleep 30");
            tokio::spawn(async move { manager.run(invocation).await })
        };
        wait_for_output(&mut rx, "ready").await;

        let err = manager.run(script(dir.path(), "true")).await.unwrap_err();
        assert!(matches!(err, BuildError::Busy { command_line } if command_line.contains("sleep 30")));

        manager.stop().await;
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_busy_stop_replaces_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut rx) = TaskManager::new(
            config(OutputMode::Legacy, BusyPolicy::Stop),
            Box::new(anvil_diagnostics::NullSink),
        );
        let manager = Arc::new(manager);

        let first = {
            let manager = Arc::clone(&manager);
            let invocation = script(dir.path(), "echo ready; sleep 30");
            tokio::spawn(async move { manager.run(invocation).await })
        };
        wait_for_output(&mut rx, "ready").await;

        let second = manager.run(script(dir.path(), "echo second")).await.unwrap();
        assert_eq!(second, RunOutcome::Finished(BuildStatus::Success));
        assert_eq!(
            first.await.unwrap().unwrap(),
            RunOutcome::Finished(BuildStatus::Interrupted)
        );
        assert!(!manager.is_busy());
    }

    #[test]
    fn test_command_for_applies_project_dir_and_env() {
        let mut cfg = BuildConfig {
            project_dir: Some(PathBuf::from("/work/demo")),
            ..BuildConfig::default()
        };
        cfg.env.insert("RUSTFLAGS".to_string(), "-Dwarnings".to_string());
        let (manager, _rx) = TaskManager::new(cfg, Box::new(anvil_diagnostics::NullSink));

        let command = manager.command_for(&BuildInvocation::new("check", "/work/demo/src"));
        assert_eq!(command.program(), "cargo");
        assert_eq!(command.working_dir(), Some(Path::new("/work/demo")));
        assert_eq!(
            command.display(),
            "cargo check --manifest-path /work/demo/Cargo.toml --message-format json"
        );
    }
}
