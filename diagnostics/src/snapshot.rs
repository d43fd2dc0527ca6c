//! Point-in-time copy of the published diagnostics, in reading order.
//!
//! The publisher keeps records in arrival order, which follows the build
//! tool's scheduling rather than the source. A snapshot reorders them for
//! display: files holding errors first, then by path; within a file by
//! start position, ties keeping arrival order.

use std::fmt;
use std::path::{Path, PathBuf};

use anvil_types::{DiagnosticRecord, Severity};

/// Totals per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
    pub hints: usize,
}

impl SeverityCounts {
    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Info => self.infos += 1,
            Severity::Hint => self.hints += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.infos + self.hints
    }
}

/// `E:3 W:5`
impl fmt::Display for SeverityCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E:{} W:{}", self.errors, self.warnings)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    files: Vec<(PathBuf, Vec<DiagnosticRecord>)>,
    counts: SeverityCounts,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: impl IntoIterator<Item = (PathBuf, Vec<DiagnosticRecord>)>) -> Self {
        let mut counts = SeverityCounts::default();
        let mut files: Vec<_> = files
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(path, mut records)| {
                records.sort_by_key(|record| {
                    let range = record.range();
                    (range.start_line, range.start_col)
                });
                for record in &records {
                    counts.record(record.severity());
                }
                (path, records)
            })
            .collect();

        files.sort_by(|(a_path, a), (b_path, b)| {
            has_errors(b)
                .cmp(&has_errors(a))
                .then_with(|| a_path.cmp(b_path))
        });
        Self { files, counts }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<DiagnosticRecord>)] {
        &self.files
    }

    /// Records for one file, by start position.
    #[must_use]
    pub fn for_file(&self, path: &Path) -> &[DiagnosticRecord] {
        self.files
            .iter()
            .find(|(file, _)| file == path)
            .map_or(&[], |(_, records)| records.as_slice())
    }

    /// Every record in reading order.
    pub fn records(&self) -> impl Iterator<Item = &DiagnosticRecord> {
        self.files.iter().flat_map(|(_, records)| records)
    }

    /// Where to jump first: the earliest error of the first erroring file.
    #[must_use]
    pub fn first_error(&self) -> Option<&DiagnosticRecord> {
        self.records().find(|record| record.severity().is_error())
    }

    #[must_use]
    pub fn counts(&self) -> SeverityCounts {
        self.counts
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.counts.total()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.counts.errors
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.counts.warnings
    }

    /// Empty when there is nothing to report.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        self.counts.to_string()
    }
}

fn has_errors(records: &[DiagnosticRecord]) -> bool {
    records.iter().any(|record| record.severity().is_error())
}
