//! Anvil CLI - runs build tool invocations and queries the completion daemon.
//!
//! ```text
//! anvil build <subcommand> [args...]   -> TaskManager -> diagnostics on stdout
//! anvil complete <file> <line> <col>   -> DaemonRpcDriver -> MATCH items
//! anvil definition <file> <line> <col> -> DaemonRpcDriver -> definition site
//! ```
//!
//! Terminal output is reserved for build output and results; logs go to
//! `~/.anvil/logs/anvil.log`.

mod commands;

use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result};
use anvil_config::AnvilConfig;
use anvil_types::OutputMode;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "anvil")]
#[command(about = "Run Rust build tools and query a completion daemon")]
struct Cli {
    /// Configuration file (default: ~/.anvil/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build tool subcommand and report its diagnostics
    Build {
        /// Diagnostic output format to request and parse
        #[arg(long)]
        mode: Option<OutputMode>,
        /// Project directory holding Cargo.toml
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Tool subcommand, e.g. `check`
        subcommand: String,
        /// Arguments passed through to the tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List completions at a position
    Complete {
        file: PathBuf,
        /// 1-based line
        line: u32,
        /// 0-based column
        column: u32,
    },
    /// Find where the symbol at a position is defined
    Definition {
        file: PathBuf,
        /// 1-based line
        line: u32,
        /// 0-based column
        column: u32,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_anvil_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_anvil_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in anvil_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn anvil_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.anvil/logs/anvil.log
    if let Some(config_path) = AnvilConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("anvil.log"));
    }

    // Fallback: ./.anvil/logs/anvil.log
    candidates.push(PathBuf::from(".anvil").join("logs").join("anvil.log"));

    candidates
}

fn load_config(explicit: Option<&PathBuf>) -> Result<AnvilConfig> {
    if let Some(path) = explicit {
        return AnvilConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    match AnvilConfig::load() {
        Ok(config) => Ok(config.unwrap_or_default()),
        Err(e) => {
            tracing::warn!("Ignoring unreadable config: {e}");
            Ok(AnvilConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Build {
            mode,
            project_dir,
            subcommand,
            args,
        } => {
            let mut build = config.build;
            if let Some(mode) = mode {
                build.output_mode = mode;
            }
            if project_dir.is_some() {
                build.project_dir = project_dir;
            }
            commands::build(build, subcommand, args).await
        }
        Commands::Complete { file, line, column } => {
            commands::complete(config.daemon, file, line, column).await
        }
        Commands::Definition { file, line, column } => {
            commands::definition(config.daemon, file, line, column).await
        }
    }
}
