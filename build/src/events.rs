/// Which stream a line of build output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Final status of one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    /// Non-zero exit, or death by signal (`code: None`).
    Failed { code: Option<i32> },
    /// Stopped on request. Never reported as a completion.
    Interrupted,
    /// The build tool is not installed.
    ToolMissing { program: String },
    SpawnFailed { message: String },
}

impl BuildStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// One-line human summary.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Success => "finished successfully".to_string(),
            Self::Failed { code: Some(code) } => format!("failed with exit code {code}"),
            Self::Failed { code: None } => "terminated by signal".to_string(),
            Self::Interrupted => "interrupted".to_string(),
            Self::ToolMissing { program } => {
                format!("`{program}` is not installed or not on PATH")
            }
            Self::SpawnFailed { message } => message.clone(),
        }
    }
}

/// Output/status surface of the task manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// A run started; prior output and diagnostics were cleared.
    Started { command_line: String },
    /// A raw line to show verbatim.
    Output { line: String, stream: OutputStream },
    Finished { status: BuildStatus },
    /// Emitted once per manager the first time the tool cannot be found.
    ToolMissing { program: String },
}
