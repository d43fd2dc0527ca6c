//! Build-task orchestration: runs one build tool invocation at a time,
//! streams its output, and publishes the diagnostics it reports.

mod args;
mod events;
mod manager;

pub use args::{DIAGNOSTIC_SUBCOMMANDS, manifest_override, synthesize_args};
pub use events::{BuildEvent, BuildStatus, OutputStream};
pub use manager::{BuildError, BuildInvocation, RunOutcome, TaskManager};
