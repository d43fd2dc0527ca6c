//! Machine-readable format: one JSON record per line.
//!
//! Lines are either cargo envelopes (`{"reason": "compiler-message",
//! "message": {...}}`) or bare compiler diagnostics. Only the primary span of
//! a diagnostic is surfaced; macro expansions are followed to the outermost
//! call site, and child notes are flattened into the message.

use anvil_types::{DiagnosticRecord, Severity, SourceRange};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CompilerDiagnostic {
    message: String,
    #[serde(default)]
    code: Option<DiagnosticCode>,
    level: String,
    #[serde(default)]
    spans: Vec<DiagnosticSpan>,
    #[serde(default)]
    children: Vec<CompilerDiagnostic>,
    #[serde(default)]
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiagnosticCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct DiagnosticSpan {
    file_name: String,
    line_start: u32,
    line_end: u32,
    column_start: u32,
    column_end: u32,
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    expansion: Option<Box<SpanExpansion>>,
}

#[derive(Debug, Deserialize)]
struct SpanExpansion {
    span: DiagnosticSpan,
}

/// A decoded machine-readable line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolMessage {
    /// A compiler diagnostic. `record` is `None` when it has no primary span
    /// (e.g. "aborting due to previous error").
    Diagnostic {
        record: Option<DiagnosticRecord>,
        rendered: Option<String>,
    },
    /// Cargo's final `build-finished` envelope.
    BuildFinished { success: bool },
    /// Any other cargo envelope (`compiler-artifact`, `build-script-executed`, ...).
    Other { reason: String },
}

/// Cheap pre-filter: only lines starting with `{` are candidate records.
#[must_use]
pub fn is_record_line(line: &str) -> bool {
    line.trim_start().starts_with('{')
}

/// Decode one line. `None` means the line is not a structured record and
/// should be treated as plain output.
#[must_use]
pub fn decode_line(line: &str) -> Option<ToolMessage> {
    if !is_record_line(line) {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(e) => {
            tracing::trace!("Ignoring non-JSON record line: {e}");
            return None;
        }
    };

    match value.get("reason").and_then(serde_json::Value::as_str) {
        Some("compiler-message") => {
            let diag = value
                .get("message")
                .cloned()
                .and_then(|m| serde_json::from_value::<CompilerDiagnostic>(m).ok())?;
            Some(diagnostic_message(diag))
        }
        Some("build-finished") => Some(ToolMessage::BuildFinished {
            success: value
                .get("success")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        }),
        Some(reason) => Some(ToolMessage::Other {
            reason: reason.to_string(),
        }),
        None => {
            let diag = serde_json::from_value::<CompilerDiagnostic>(value).ok()?;
            Some(diagnostic_message(diag))
        }
    }
}

/// Parse one line into records (zero or one).
#[must_use]
pub fn parse_line(line: &str) -> Vec<DiagnosticRecord> {
    match decode_line(line) {
        Some(ToolMessage::Diagnostic {
            record: Some(record),
            ..
        }) => vec![record],
        _ => Vec::new(),
    }
}

fn diagnostic_message(diag: CompilerDiagnostic) -> ToolMessage {
    let record = to_record(&diag);
    ToolMessage::Diagnostic {
        record,
        rendered: diag.rendered,
    }
}

fn to_record(diag: &CompilerDiagnostic) -> Option<DiagnosticRecord> {
    let primary = diag.spans.iter().find(|s| s.is_primary)?;
    let span = outermost_span(primary);

    let mut message = diag.message.clone();
    append_children(&mut message, &diag.children, 1);

    let severity = Severity::from_label(&diag.level).unwrap_or(Severity::Info);
    let range = SourceRange::new(
        span.line_start,
        span.column_start,
        span.line_end,
        span.column_end,
    );
    Some(
        DiagnosticRecord::new(&span.file_name, range, severity, message)
            .with_code(diag.code.as_ref().map(|c| c.code.clone())),
    )
}

/// Follow the expansion chain to the concrete source location.
fn outermost_span(span: &DiagnosticSpan) -> &DiagnosticSpan {
    let mut current = span;
    while let Some(expansion) = &current.expansion {
        current = &expansion.span;
    }
    current
}

fn append_children(out: &mut String, children: &[CompilerDiagnostic], depth: usize) {
    for child in children {
        out.push('\n');
        out.push_str(&"  ".repeat(depth));
        out.push_str(&child.level);
        out.push_str(": ");
        out.push_str(&child.message);
        if !child.spans.is_empty() {
            let refs = child
                .spans
                .iter()
                .map(|s| format!("{}({})", s.file_name, s.line_start))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(" [");
            out.push_str(&refs);
            out.push(']');
        }
        append_children(out, &child.children, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn span(file: &str, line: u32, col: u32, primary: bool) -> serde_json::Value {
        serde_json::json!({
            "file_name": file,
            "line_start": line,
            "line_end": line,
            "column_start": col,
            "column_end": col + 3,
            "is_primary": primary,
            "expansion": null
        })
    }

    fn diag(spans: Vec<serde_json::Value>, children: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "message": "mismatched types",
            "code": { "code": "E0308", "explanation": "..." },
            "level": "error",
            "spans": spans,
            "children": children,
            "rendered": "error[E0308]: mismatched types\n"
        })
    }

    fn envelope(message: serde_json::Value) -> String {
        serde_json::json!({
            "reason": "compiler-message",
            "package_id": "demo 0.1.0",
            "message": message
        })
        .to_string()
    }

    #[test]
    fn test_primary_span_wins() {
        let line = envelope(diag(
            vec![span("src/b.rs", 1, 1, false), span("src/a.rs", 7, 4, true)],
            serde_json::json!([]),
        ));
        let records = parse_line(&line);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_path(), Path::new("src/a.rs"));
        assert_eq!(records[0].range(), SourceRange::new(7, 4, 7, 7));
        assert_eq!(records[0].severity(), Severity::Error);
        assert_eq!(records[0].code(), Some("E0308"));
    }

    #[test]
    fn test_expansion_chain_is_followed() {
        let mut primary = span("/rustlib/macros.rs", 100, 1, true);
        let mut inner = span("src/macros.rs", 20, 5, false);
        inner["expansion"] = serde_json::json!({
            "span": span("src/main.rs", 3, 9, false),
            "macro_decl_name": "outer!"
        });
        primary["expansion"] = serde_json::json!({
            "span": inner,
            "macro_decl_name": "inner!"
        });
        let records = parse_line(&envelope(diag(vec![primary], serde_json::json!([]))));
        assert_eq!(records[0].file_path(), Path::new("src/main.rs"));
        assert_eq!(records[0].range().start_line, 3);
        assert_eq!(records[0].range().start_col, 9);
    }

    #[test]
    fn test_single_expansion_resolves_to_expansion_span() {
        let mut primary = span("src/gen.rs", 50, 1, true);
        primary["expansion"] = serde_json::json!({ "span": span("src/lib.rs", 2, 2, false) });
        let records = parse_line(&envelope(diag(vec![primary], serde_json::json!([]))));
        assert_eq!(records[0].file_path(), Path::new("src/lib.rs"));
        assert_eq!(records[0].range(), SourceRange::new(2, 2, 2, 5));
    }

    #[test]
    fn test_children_flattened_with_indent_and_refs() {
        let children = serde_json::json!([
            {
                "message": "expected due to this",
                "level": "note",
                "spans": [span("src/a.rs", 2, 1, true), span("src/c.rs", 9, 1, false)],
                "children": [
                    { "message": "nested detail", "level": "help", "spans": [], "children": [] }
                ]
            },
            { "message": "for more information", "level": "help", "spans": [], "children": [] }
        ]);
        let records = parse_line(&envelope(diag(vec![span("src/a.rs", 7, 4, true)], children)));
        assert_eq!(
            records[0].message(),
            "mismatched types\n  note: expected due to this [src/a.rs(2), src/c.rs(9)]\n    help: nested detail\n  help: for more information"
        );
    }

    #[test]
    fn test_bare_compiler_diagnostic() {
        let line = diag(vec![span("src/a.rs", 1, 1, true)], serde_json::json!([])).to_string();
        assert_eq!(parse_line(&line).len(), 1);
    }

    #[test]
    fn test_no_primary_span_yields_no_record() {
        let line = envelope(serde_json::json!({
            "message": "aborting due to 1 previous error",
            "code": null,
            "level": "error",
            "spans": [],
            "children": [],
            "rendered": "error: aborting due to 1 previous error\n"
        }));
        match decode_line(&line) {
            Some(ToolMessage::Diagnostic { record, rendered }) => {
                assert!(record.is_none());
                assert_eq!(
                    rendered.as_deref(),
                    Some("error: aborting due to 1 previous error\n")
                );
            }
            other => panic!("expected Diagnostic, got {other:?}"),
        }
        assert!(parse_line(&line).is_empty());
    }

    #[test]
    fn test_other_envelopes() {
        assert_eq!(
            decode_line(r#"{"reason":"compiler-artifact","package_id":"x"}"#),
            Some(ToolMessage::Other {
                reason: "compiler-artifact".to_string()
            })
        );
        assert_eq!(
            decode_line(r#"{"reason":"build-finished","success":false}"#),
            Some(ToolMessage::BuildFinished { success: false })
        );
    }

    #[test]
    fn test_plain_and_malformed_lines() {
        assert!(decode_line("   Compiling demo v0.1.0").is_none());
        assert!(decode_line("{not json").is_none());
        assert!(decode_line(r#"{"unrelated": true}"#).is_none());
        assert!(parse_line("warning: build failed").is_empty());
    }

    #[test]
    fn test_unknown_level_maps_to_info() {
        let mut d = diag(vec![span("src/a.rs", 1, 1, true)], serde_json::json!([]));
        d["level"] = serde_json::json!("something-new");
        let records = parse_line(&d.to_string());
        assert_eq!(records[0].severity(), Severity::Info);
    }
}
