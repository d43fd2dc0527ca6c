use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use anvil_build::{BuildEvent, BuildInvocation, BuildStatus, OutputStream, RunOutcome, TaskManager};
use anvil_config::{BuildConfig, DaemonConfig};
use anvil_daemon::{DaemonRpcDriver, MatchItem};
use anvil_diagnostics::{DiagnosticsSnapshot, NullSink};

/// Exit code for a run stopped with Ctrl-C, as a shell would report it.
const INTERRUPTED_EXIT: u8 = 130;

pub async fn build(config: BuildConfig, subcommand: String, args: Vec<String>) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let (manager, mut events) = TaskManager::new(config, Box::new(NullSink));
    let manager = Arc::new(manager);
    let invocation = BuildInvocation::new(subcommand, cwd).args(args);

    let run = manager.run(invocation);
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome?,
            Some(event) = events.recv() => print_event(&event),
            Ok(()) = tokio::signal::ctrl_c() => {
                // `stop` waits on the run this loop is polling; drive it separately.
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.stop().await });
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    print_diagnostics(&manager.snapshot());

    let code = match outcome {
        RunOutcome::Finished(BuildStatus::Success) => ExitCode::SUCCESS,
        RunOutcome::Finished(BuildStatus::Failed { code: Some(code) }) => {
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        RunOutcome::Finished(BuildStatus::Interrupted) => ExitCode::from(INTERRUPTED_EXIT),
        RunOutcome::Finished(_) | RunOutcome::Skipped => ExitCode::FAILURE,
    };
    Ok(code)
}

fn print_event(event: &BuildEvent) {
    match event {
        BuildEvent::Started { command_line } => eprintln!("> {command_line}"),
        BuildEvent::Output {
            line,
            stream: OutputStream::Stdout,
        } => println!("{line}"),
        BuildEvent::Output {
            line,
            stream: OutputStream::Stderr,
        } => eprintln!("{line}"),
        BuildEvent::Finished { status } => eprintln!("> build {}", status.describe()),
        BuildEvent::ToolMissing { program } => eprintln!(
            "`{program}` was not found. Install it or set `build.tool` in ~/.anvil/config.toml."
        ),
    }
}

fn print_diagnostics(snapshot: &DiagnosticsSnapshot) {
    if snapshot.is_empty() {
        return;
    }
    println!();
    for record in snapshot.records() {
        println!("{}", record.display());
    }
    println!("{}", snapshot.status_string());
}

async fn with_daemon<T, F, Fut>(config: DaemonConfig, query: F) -> Result<T>
where
    F: FnOnce(DaemonRpcDriver) -> Fut,
    Fut: std::future::Future<Output = Result<T, anvil_daemon::DaemonError>>,
{
    let driver = DaemonRpcDriver::new(config);
    driver.start().context("starting completion daemon")?;
    let result = query(driver.clone()).await;
    driver.stop().await;
    Ok(result?)
}

fn absolute(file: &Path) -> Result<PathBuf> {
    std::path::absolute(file).with_context(|| format!("resolving {}", file.display()))
}

fn print_match(item: &MatchItem) {
    println!(
        "{}\t{}\t{}:{}:{}\t{}",
        item.name,
        item.kind,
        item.path.display(),
        item.line,
        item.column,
        item.snippet.as_deref().unwrap_or(&item.context),
    );
}

pub async fn complete(config: DaemonConfig, file: PathBuf, line: u32, column: u32) -> Result<ExitCode> {
    let file = absolute(&file)?;
    let items = with_daemon(config, |driver| async move {
        driver.complete_with_snippet(&file, line, column).await
    })
    .await?;

    for item in &items {
        print_match(item);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn definition(config: DaemonConfig, file: PathBuf, line: u32, column: u32) -> Result<ExitCode> {
    let file = absolute(&file)?;
    let found = with_daemon(config, |driver| async move {
        driver.find_definition(&file, line, column).await
    })
    .await?;

    match found {
        Some(item) => {
            print_match(&item);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No definition found");
            Ok(ExitCode::FAILURE)
        }
    }
}
