//! Human-readable multi-line block format.
//!
//! ```text
//! error[E0308]: mismatched types
//!  --> src/main.rs:3:18
//!   |
//! 3 |     let x: i32 = "a";
//!   |                  ^^^ expected `i32`, found `&str`
//!   |
//!   = note: expected type `i32`
//! ```
//!
//! One diagnostic spans several lines, so blocks are matched against
//! accumulated output rather than single lines. The end column is the start
//! column plus the width of the first `^` run under the source line, or of
//! the first `-`/`~` run when there is no `^` marker.

use std::sync::LazyLock;

use anvil_types::{DiagnosticRecord, Severity, SourceRange};
use regex::Regex;

static BLOCK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(error|warning|note|help)(?:\[([^\]\n]+)\]|\(([^)\n]+)\))?: ([^\n]+)\n[ \t]*--> ([^\n]+?):(\d+):(\d+)[ \t]*$",
    )
    .expect("valid block header regex")
});

static GUTTER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(\d+)?[ \t]*\|(.*)$").expect("valid gutter regex")
});

static NOTE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*= ([a-z]+): (.*)$").expect("valid note regex"));

/// Parse every complete block in `text`.
#[must_use]
pub fn parse_output(text: &str) -> Vec<DiagnosticRecord> {
    let mut records = Vec::new();

    for caps in BLOCK_HEADER.captures_iter(text) {
        let Some(severity) = Severity::from_label(&caps[1]) else {
            continue;
        };
        let (Ok(line), Ok(col)) = (caps[6].parse::<u32>(), caps[7].parse::<u32>()) else {
            continue;
        };
        let code = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string());

        let end = caps.get(0).map_or(text.len(), |m| m.end());
        let body = scan_body(&text[end..]);

        let mut message = caps[4].trim_end().to_string();
        for (kind, note) in &body.notes {
            message.push_str("\n  ");
            message.push_str(kind);
            message.push_str(": ");
            message.push_str(note);
        }

        let end_col = body
            .primary_width
            .or(body.secondary_width)
            .map_or(col, |w| col.saturating_add(w));
        records.push(
            DiagnosticRecord::new(
                caps[5].trim(),
                SourceRange::new(line, col, line, end_col),
                severity,
                message,
            )
            .with_code(code),
        );
    }

    records
}

#[derive(Default)]
struct BlockBody {
    primary_width: Option<u32>,
    secondary_width: Option<u32>,
    notes: Vec<(String, String)>,
}

/// Walk the context lines following a block header until a blank line or
/// anything that is not part of the block.
fn scan_body(rest: &str) -> BlockBody {
    let mut body = BlockBody::default();

    for line in rest.strip_prefix('\n').unwrap_or(rest).lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(caps) = NOTE_LINE.captures(line) {
            body.notes.push((caps[1].to_string(), caps[2].trim_end().to_string()));
            continue;
        }
        if let Some(caps) = GUTTER_LINE.captures(line) {
            // Numbered lines are source text; only bare gutters carry markers.
            if caps.get(1).is_none() {
                match underline(&caps[2]) {
                    Some(('^', width)) if body.primary_width.is_none() => {
                        body.primary_width = Some(width);
                    }
                    Some((_, width)) if body.secondary_width.is_none() => {
                        body.secondary_width = Some(width);
                    }
                    _ => {}
                }
            }
            continue;
        }
        let trimmed = line.trim_start();
        if trimmed == "..." || trimmed.starts_with("::: ") {
            continue;
        }
        break;
    }

    body
}

/// Leading underline run on a marker line: its character and width.
fn underline(gutter_content: &str) -> Option<(char, u32)> {
    let trimmed = gutter_content.trim_start();
    let marker = trimmed
        .chars()
        .next()
        .filter(|c| matches!(c, '^' | '-' | '~'))?;
    let width = trimmed.chars().take_while(|&c| c == marker).count();
    Some((marker, u32::try_from(width).ok()?))
}
