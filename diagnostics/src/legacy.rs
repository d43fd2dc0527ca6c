//! Legacy single-line format: `path:line:col: endLine:endCol severity: message`.

use std::sync::LazyLock;

use anvil_types::{DiagnosticRecord, Severity, SourceRange};
use regex::Regex;

static LEGACY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?):(\d+):(\d+):\s+(\d+):(\d+)\s+(error|warning|note|help):\s+(.*)$")
        .expect("valid legacy diagnostic regex")
});

/// Parse one line. Lines that are not diagnostics (compiler narration such
/// as `Compiling foo v0.1.0`) yield `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<DiagnosticRecord> {
    let caps = LEGACY_LINE.captures(line.trim_end_matches('\r'))?;
    let num = |i: usize| caps[i].parse::<u32>().ok();

    let range = SourceRange::new(num(2)?, num(3)?, num(4)?, num(5)?);
    let severity = Severity::from_label(&caps[6])?;
    Some(DiagnosticRecord::new(
        &caps[1],
        range,
        severity,
        caps[7].trim_end(),
    ))
}

/// Parse every line of `text`.
#[must_use]
pub fn parse_output(text: &str) -> Vec<DiagnosticRecord> {
    text.lines().filter_map(parse_line).collect()
}
