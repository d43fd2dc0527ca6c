//! Build tool argument synthesis.

use std::path::{Path, PathBuf};

use anvil_types::normalize_path;

/// Subcommands that emit compiler diagnostics and accept `--message-format`.
pub const DIAGNOSTIC_SUBCOMMANDS: &[&str] = &[
    "build", "check", "clippy", "test", "bench", "run", "rustc", "doc",
];

/// Full argument vector for the build tool.
///
/// Built by prepending, in order: the structured-output flag (only for
/// diagnostic subcommands when `structured`), the manifest override, and
/// finally the subcommand itself, so every flag lands before the user's
/// positional arguments.
#[must_use]
pub fn synthesize_args(
    subcommand: &str,
    user_args: &[String],
    structured: bool,
    manifest: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = user_args.to_vec();

    if structured && DIAGNOSTIC_SUBCOMMANDS.contains(&subcommand) {
        args.splice(0..0, ["--message-format".to_string(), "json".to_string()]);
    }
    if let Some(manifest) = manifest {
        args.splice(
            0..0,
            [
                "--manifest-path".to_string(),
                manifest.display().to_string(),
            ],
        );
    }
    args.insert(0, subcommand.to_string());
    args
}

/// Manifest to pass explicitly when the configured project directory is not
/// the directory the build was invoked from.
#[must_use]
pub fn manifest_override(project_dir: Option<&Path>, invocation_dir: &Path) -> Option<PathBuf> {
    let project_dir = project_dir?;
    let project = normalize_path(project_dir);
    if project == normalize_path(invocation_dir) {
        return None;
    }
    Some(project.join("Cargo.toml"))
}
