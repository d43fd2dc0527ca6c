//! Compiler diagnostic parsing and publishing.
//!
//! Three output encodings are understood, each as a pure `text -> records`
//! function: [`legacy`] (one line per diagnostic), [`human`] (multi-line
//! blocks) and [`json`] (one record per line). [`DiagnosticParser`] selects
//! one by [`OutputMode`](anvil_types::OutputMode); [`DiagnosticPublisher`]
//! deduplicates records into the per-file collection the editor sees.

pub mod human;
pub mod json;
pub mod legacy;

mod parser;
mod publisher;
mod snapshot;

pub use json::ToolMessage;
pub use parser::DiagnosticParser;
pub use publisher::{DiagnosticPublisher, DiagnosticSink, NullSink, PublishedDiagnostic};
pub use snapshot::{DiagnosticsSnapshot, SeverityCounts};
