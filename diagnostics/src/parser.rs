use anvil_types::{DiagnosticRecord, OutputMode};

use crate::{human, json, legacy};

/// Selects a parsing strategy by output mode.
///
/// Holds no state beyond the mode; every strategy is a pure function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticParser {
    mode: OutputMode,
}

impl DiagnosticParser {
    #[must_use]
    pub const fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub const fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Parse a single line. Human-readable blocks span several lines and
    /// never match here; use [`parse_output`](Self::parse_output) for them.
    #[must_use]
    pub fn parse_line(&self, line: &str) -> Vec<DiagnosticRecord> {
        match self.mode {
            OutputMode::Json => json::parse_line(line),
            OutputMode::Legacy => legacy::parse_line(line).into_iter().collect(),
            OutputMode::Human => Vec::new(),
        }
    }

    /// Parse accumulated output text.
    #[must_use]
    pub fn parse_output(&self, text: &str) -> Vec<DiagnosticRecord> {
        match self.mode {
            OutputMode::Human => human::parse_output(text),
            OutputMode::Legacy => legacy::parse_output(text),
            OutputMode::Json => text.lines().flat_map(json::parse_line).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "src/main.rs:3:5: 3:10 error: mismatched types";
    const HUMAN: &str = "error: mismatched types\n --> src/main.rs:3:5\n";

    fn json_line() -> String {
        serde_json::json!({
            "message": "mismatched types",
            "level": "error",
            "spans": [{
                "file_name": "src/main.rs",
                "line_start": 3, "line_end": 3,
                "column_start": 5, "column_end": 10,
                "is_primary": true
            }],
            "children": []
        })
        .to_string()
    }

    #[test]
    fn test_modes_only_parse_their_own_format() {
        let legacy = DiagnosticParser::new(OutputMode::Legacy);
        let json = DiagnosticParser::new(OutputMode::Json);
        let human = DiagnosticParser::new(OutputMode::Human);

        assert_eq!(legacy.parse_line(LEGACY).len(), 1);
        assert!(legacy.parse_line(&json_line()).is_empty());

        assert_eq!(json.parse_line(&json_line()).len(), 1);
        assert!(json.parse_line(LEGACY).is_empty());

        assert!(human.parse_line(HUMAN).is_empty());
        assert_eq!(human.parse_output(HUMAN).len(), 1);
    }

    #[test]
    fn test_all_modes_agree_on_location() {
        let from_legacy = DiagnosticParser::new(OutputMode::Legacy).parse_output(LEGACY);
        let from_json = DiagnosticParser::new(OutputMode::Json).parse_output(&json_line());
        assert_eq!(from_legacy[0].range(), from_json[0].range());
        assert_eq!(from_legacy[0].message(), from_json[0].message());
    }

    #[test]
    fn test_default_mode_is_json() {
        assert_eq!(DiagnosticParser::default().mode(), OutputMode::Json);
    }
}
