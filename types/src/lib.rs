//! Diagnostic model shared by every anvil crate.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Parsers produce [`DiagnosticRecord`]s, the publisher stores
//! them, and the editor boundary converts them to 0-based [`EditorRange`]s.

#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Severity
// ============================================================================

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Info = 3,
    Hint = 4,
}

impl Severity {
    /// Map a compiler level label (`error`, `warning`, `note`, `help`, ...).
    ///
    /// Returns `None` for labels the compiler does not use for diagnostics.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "error" | "error: internal compiler error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "note" | "failure-note" | "info" => Some(Self::Info),
            "help" | "hint" => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Hint => "hint",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Ranges
// ============================================================================

/// A source range as reported by the tool: 1-based lines and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl SourceRange {
    #[must_use]
    pub const fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// A zero-width range at a single 1-based position.
    #[must_use]
    pub const fn point(line: u32, col: u32) -> Self {
        Self::new(line, col, line, col)
    }

    /// Convert to the editor's 0-based convention.
    ///
    /// Tools occasionally report line or column 0 for whole-file
    /// diagnostics; those saturate at 0 instead of wrapping.
    #[must_use]
    pub fn to_editor(self) -> EditorRange {
        EditorRange {
            start_line: self.start_line.saturating_sub(1),
            start_col: self.start_col.saturating_sub(1),
            end_line: self.end_line.saturating_sub(1),
            end_col: self.end_col.saturating_sub(1),
        }
    }
}

/// A 0-based range, used only at the editor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EditorRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

// ============================================================================
// DiagnosticRecord
// ============================================================================

/// One compiler diagnostic, normalized from any of the output encodings.
///
/// Fields are private; the only mutation after construction is path
/// resolution against a working directory ([`DiagnosticRecord::resolved`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    file_path: PathBuf,
    range: SourceRange,
    severity: Severity,
    message: String,
    /// Compiler code such as `E0308` or `unused_variables`.
    code: Option<String>,
}

impl DiagnosticRecord {
    #[must_use]
    pub fn new(
        file_path: impl Into<PathBuf>,
        range: SourceRange,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            range,
            severity,
            message: message.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code.filter(|c| !c.is_empty());
        self
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// 1-based range as reported by the tool.
    #[must_use]
    pub fn range(&self) -> SourceRange {
        self.range
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Identity for deduplication within one file: range and message only.
    ///
    /// Severity and code are deliberately excluded.
    #[must_use]
    pub fn is_duplicate_of(&self, other: &Self) -> bool {
        self.range == other.range && self.message == other.message
    }

    /// Resolve the file path against `working_dir` when it is relative.
    #[must_use]
    pub fn resolved(mut self, working_dir: &Path) -> Self {
        let joined = if self.file_path.is_absolute() {
            self.file_path
        } else {
            working_dir.join(&self.file_path)
        };
        self.file_path = normalize_path(&joined);
        self
    }

    /// Format as `path:line:col: severity: message` (1-based for display).
    #[must_use]
    pub fn display(&self) -> String {
        let code = self
            .code
            .as_deref()
            .map(|c| format!("[{c}] "))
            .unwrap_or_default();
        format!(
            "{}:{}:{}: {}: {code}{}",
            self.file_path.display(),
            self.range.start_line,
            self.range.start_col,
            self.severity,
            self.message,
        )
    }
}

/// Lexically remove `.` and `..` components without touching the filesystem.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(c),
            },
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

// ============================================================================
// OutputMode
// ============================================================================

/// Which diagnostic encoding the build tool is expected to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// `path:line:col: endLine:endCol severity: message`, one per line.
    Legacy,
    /// Multi-line `error[E0308]: ...\n --> file:line:col` blocks.
    Human,
    /// One JSON record per line (`--message-format json`).
    #[default]
    Json,
}

impl OutputMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Human => "human",
            Self::Json => "json",
        }
    }

    /// Whether the tool must be asked for structured output.
    #[must_use]
    pub const fn is_structured(self) -> bool {
        matches!(self, Self::Json)
    }
}

#[derive(Debug, Error)]
#[error("unknown output mode `{0}` (expected legacy, human or json)")]
pub struct UnknownOutputMode(String);

impl FromStr for OutputMode {
    type Err = UnknownOutputMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            _ => Err(UnknownOutputMode(s.to_string())),
        }
    }
}
