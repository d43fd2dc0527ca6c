//! Configuration provider for anvil.
//!
//! ```toml
//! [build]
//! tool = "cargo"
//! output_mode = "json"
//! on_busy = "stop"
//! env = { RUSTFLAGS = "-D warnings" }
//!
//! [daemon]
//! program = "racer"
//! args = ["daemon"]
//! restart_delay_ms = 3000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anvil_types::OutputMode;
use serde::Deserialize;

const DEFAULT_TOOL: &str = "cargo";
const DEFAULT_DAEMON: &str = "racer";
const DEFAULT_INTERRUPT_GRACE_MS: u64 = 2_000;
const DEFAULT_RESTART_DELAY_MS: u64 = 3_000;
const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

fn default_tool() -> String {
    DEFAULT_TOOL.to_string()
}

fn default_daemon_program() -> String {
    DEFAULT_DAEMON.to_string()
}

fn default_daemon_args() -> Vec<String> {
    vec!["daemon".to_string()]
}

const fn default_interrupt_grace_ms() -> u64 {
    DEFAULT_INTERRUPT_GRACE_MS
}

const fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

const fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnvilConfig {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// What the task manager does when a build is requested while one runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Interrupt the running task, then start the new one.
    Stop,
    /// Drop the new request.
    #[default]
    Ignore,
    /// Refuse and let the caller decide.
    Ask,
}

/// Build tool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Executable to invoke (e.g. "cargo" or an absolute path).
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Directory holding the project manifest. Defaults to the invocation directory.
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub on_busy: BusyPolicy,
    /// Extra environment for the build process; `${VAR}` is expanded.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Time between the interrupt signal and a hard kill.
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            project_dir: None,
            output_mode: OutputMode::default(),
            on_busy: BusyPolicy::default(),
            env: BTreeMap::new(),
            interrupt_grace_ms: DEFAULT_INTERRUPT_GRACE_MS,
        }
    }
}

impl BuildConfig {
    #[must_use]
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        expand_env_map(&self.env)
    }

    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Completion daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_program")]
    pub program: String,
    #[serde(default = "default_daemon_args")]
    pub args: Vec<String>,
    /// Working directory for the daemon process.
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Fixed delay before restarting a crashed daemon.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Time to wait for the daemon to exit on stop before killing it.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            program: default_daemon_program(),
            args: default_daemon_args(),
            cwd: None,
            env: BTreeMap::new(),
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        expand_env_map(&self.env)
    }

    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn expand_env_map(env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    env.iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Replace `${VAR}` with the value of `VAR` (empty when unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&std::env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }

    out.push_str(rest);
    out
}

impl AnvilConfig {
    /// Load from the default location. `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = match config_path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        Self::from_toml_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".anvil").join("config.toml"))
}
