//! Diagnostic publisher: deduplicates records into a per-file collection and
//! mirrors every change to the editor surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anvil_types::{DiagnosticRecord, EditorRange, Severity};

use crate::snapshot::DiagnosticsSnapshot;

/// A diagnostic as the editor sees it: 0-based range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDiagnostic {
    pub range: EditorRange,
    pub severity: Severity,
    pub message: String,
    pub code: Option<String>,
}

impl From<&DiagnosticRecord> for PublishedDiagnostic {
    fn from(record: &DiagnosticRecord) -> Self {
        Self {
            range: record.range().to_editor(),
            severity: record.severity(),
            message: record.message().to_string(),
            code: record.code().map(str::to_string),
        }
    }
}

/// The editor's problem surface. Updated synchronously on every mutation.
pub trait DiagnosticSink: Send {
    /// Replace the diagnostics shown for `path`.
    fn set_file(&mut self, path: &Path, diagnostics: Vec<PublishedDiagnostic>);

    /// Remove every diagnostic.
    fn clear(&mut self);
}

/// Sink that discards updates.
#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn set_file(&mut self, _path: &Path, _diagnostics: Vec<PublishedDiagnostic>) {}

    fn clear(&mut self) {}
}

/// Owns the diagnostic collection.
///
/// Within one file no two records share (range, message). The duplicate
/// check is a linear scan per publish; per-file counts stay small, so no
/// index is kept.
pub struct DiagnosticPublisher {
    data: HashMap<PathBuf, Vec<DiagnosticRecord>>,
    sink: Box<dyn DiagnosticSink>,
}

impl std::fmt::Debug for DiagnosticPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticPublisher")
            .field("files", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Default for DiagnosticPublisher {
    fn default() -> Self {
        Self::new(Box::new(NullSink))
    }
}

impl DiagnosticPublisher {
    #[must_use]
    pub fn new(sink: Box<dyn DiagnosticSink>) -> Self {
        Self {
            data: HashMap::new(),
            sink,
        }
    }

    /// Resolve the record's path against `working_dir` and append it unless
    /// an identical (range, message) record already exists for that file.
    ///
    /// Returns whether the record was appended.
    pub fn publish(&mut self, record: DiagnosticRecord, working_dir: &Path) -> bool {
        let record = record.resolved(working_dir);
        let path = record.file_path().to_path_buf();

        let items = self.data.entry(path.clone()).or_default();
        if items.iter().any(|existing| existing.is_duplicate_of(&record)) {
            tracing::trace!(path = %path.display(), "Skipping duplicate diagnostic");
            return false;
        }
        items.push(record);

        let published = items.iter().map(PublishedDiagnostic::from).collect();
        self.sink.set_file(&path, published);
        true
    }

    /// Publish many records; returns how many were new.
    pub fn publish_all(
        &mut self,
        records: impl IntoIterator<Item = DiagnosticRecord>,
        working_dir: &Path,
    ) -> usize {
        records
            .into_iter()
            .map(|record| self.publish(record, working_dir))
            .filter(|appended| *appended)
            .count()
    }

    /// Empty the whole collection.
    pub fn clear(&mut self) {
        self.data.clear();
        self.sink.clear();
    }

    #[must_use]
    pub fn records_for(&self, path: &Path) -> &[DiagnosticRecord] {
        self.data.get(path).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot::new(
            self.data
                .iter()
                .map(|(path, items)| (path.clone(), items.clone())),
        )
    }
}
