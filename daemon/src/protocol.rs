//! Wire protocol.
//!
//! A request is its fields joined by tabs plus one newline. The daemon
//! answers with any number of lines followed by a line starting with `END`.
//! Responses carry no request id: the n-th batch answers the n-th request.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anvil_process::LineReassembler;
use tokio::sync::oneshot;

/// Prefix of the line that terminates a response batch.
pub const END_SENTINEL: &str = "END";

/// Serialize request fields for the wire.
#[must_use]
pub fn encode_request<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}

/// A typed daemon request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: &'static str,
    line: u32,
    column: u32,
    file: PathBuf,
    substitute: Option<PathBuf>,
}

impl Request {
    fn at(command: &'static str, file: &Path, line: u32, column: u32) -> Self {
        Self {
            command,
            line,
            column,
            file: file.to_path_buf(),
            substitute: None,
        }
    }

    /// Completions with call snippets at a 1-based line and 0-based column.
    #[must_use]
    pub fn complete_with_snippet(file: &Path, line: u32, column: u32) -> Self {
        Self::at("complete-with-snippet", file, line, column)
    }

    #[must_use]
    pub fn complete(file: &Path, line: u32, column: u32) -> Self {
        Self::at("complete", file, line, column)
    }

    #[must_use]
    pub fn find_definition(file: &Path, line: u32, column: u32) -> Self {
        Self::at("find-definition", file, line, column)
    }

    /// Read the source from `path` instead of `file` (unsaved buffers).
    #[must_use]
    pub fn with_substitute(mut self, path: impl Into<PathBuf>) -> Self {
        self.substitute = Some(path.into());
        self
    }

    #[must_use]
    pub fn command(&self) -> &'static str {
        self.command
    }

    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.command.to_string(),
            self.line.to_string(),
            self.column.to_string(),
            self.file.display().to_string(),
        ];
        if let Some(substitute) = &self.substitute {
            fields.push(substitute.display().to_string());
        }
        fields
    }
}

/// One `MATCH` line of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchItem {
    pub name: String,
    /// Call snippet; only `complete-with-snippet` responses carry one.
    pub snippet: Option<String>,
    pub line: u32,
    pub column: u32,
    pub path: PathBuf,
    pub kind: String,
    pub context: String,
    pub docs: Option<String>,
}

/// Parse a `MATCH` line. Other lines (`PREFIX`, blank) yield `None`.
///
/// With snippets: `MATCH name snippet line col path kind context docs`;
/// without: `MATCH name line col path kind context`, all tab-separated.
#[must_use]
pub fn parse_match(line: &str) -> Option<MatchItem> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.first() != Some(&"MATCH") {
        return None;
    }
    match fields.as_slice() {
        [_, name, snippet, line, column, path, kind, context, docs @ ..] => Some(MatchItem {
            name: (*name).to_string(),
            snippet: Some((*snippet).to_string()),
            line: line.parse().ok()?,
            column: column.parse().ok()?,
            path: PathBuf::from(path),
            kind: (*kind).to_string(),
            context: (*context).to_string(),
            docs: (!docs.is_empty()).then(|| docs.join("\t")),
        }),
        [_, name, line, column, path, kind, context] => Some(MatchItem {
            name: (*name).to_string(),
            snippet: None,
            line: line.parse().ok()?,
            column: column.parse().ok()?,
            path: PathBuf::from(path),
            kind: (*kind).to_string(),
            context: (*context).to_string(),
            docs: None,
        }),
        _ => {
            tracing::debug!("Malformed MATCH line: {line}");
            None
        }
    }
}

#[must_use]
pub fn parse_matches(batch: &[String]) -> Vec<MatchItem> {
    batch.iter().filter_map(|line| parse_match(line)).collect()
}

/// Groups response lines into batches at `END` sentinels.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    lines: LineReassembler,
    current: Vec<String>,
}

impl ResponseAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw output; returns every batch it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<String>> {
        self.lines
            .feed(chunk)
            .into_iter()
            .filter_map(|line| self.push_line(line))
            .collect()
    }

    /// Feed one complete line; returns the batch when it was a sentinel.
    pub fn push_line(&mut self, line: String) -> Option<Vec<String>> {
        if line.starts_with(END_SENTINEL) {
            return Some(std::mem::take(&mut self.current));
        }
        self.current.push(line);
        None
    }
}

/// Outstanding requests in issue order. Position is the only key: a batch
/// always goes to the oldest waiter.
#[derive(Debug, Default)]
pub struct PendingQueue {
    waiters: VecDeque<oneshot::Sender<Vec<String>>>,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, waiter: oneshot::Sender<Vec<String>>) {
        self.waiters.push_back(waiter);
    }

    /// Deliver `batch` to the oldest waiter. Returns `false` when nothing
    /// was waiting; the batch is dropped.
    pub fn resolve_next(&mut self, batch: Vec<String>) -> bool {
        let Some(waiter) = self.waiters.pop_front() else {
            return false;
        };
        // A caller that stopped waiting still consumes its batch.
        let _ = waiter.send(batch);
        true
    }

    /// Resolve every waiter with an empty batch. Returns how many there were.
    pub fn drain_empty(&mut self) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Vec::new());
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        assert_eq!(
            encode_request(&["complete", "3", "10", "/src/main.rs"]),
            "complete\t3\t10\t/src/main.rs\n"
        );
    }

    #[test]
    fn test_request_fields() {
        let request = Request::find_definition(Path::new("/p/src/lib.rs"), 12, 4)
            .with_substitute("/tmp/anvil-buffer.rs");
        assert_eq!(
            request.fields(),
            vec!["find-definition", "12", "4", "/p/src/lib.rs", "/tmp/anvil-buffer.rs"]
        );
        assert_eq!(
            Request::complete(Path::new("a.rs"), 1, 0).fields(),
            vec!["complete", "1", "0", "a.rs"]
        );
    }

    #[test]
    fn test_batches_survive_chunk_splits() {
        let mut assembler = ResponseAssembler::new();
        assert!(assembler.feed(b"MATCH\ta\nEN").is_empty());
        assert_eq!(
            assembler.feed(b"D\nMATCH\tb\r\nMATCH\tc\nE"),
            vec![vec!["MATCH\ta".to_string()]]
        );
        assert_eq!(
            assembler.feed(b"ND\nEND\n"),
            vec![
                vec!["MATCH\tb".to_string(), "MATCH\tc".to_string()],
                Vec::new()
            ]
        );
    }

    #[test]
    fn test_sentinel_is_a_prefix_match() {
        let mut assembler = ResponseAssembler::new();
        assert!(assembler.push_line("PREFIX\t0\t3\tfoo".to_string()).is_none());
        assert_eq!(
            assembler.push_line("END\t".to_string()),
            Some(vec!["PREFIX\t0\t3\tfoo".to_string()])
        );
    }

    #[test]
    fn test_pending_queue_is_fifo() {
        let mut queue = PendingQueue::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        queue.enqueue(tx1);
        queue.enqueue(tx2);

        assert!(queue.resolve_next(vec!["first".to_string()]));
        assert!(queue.resolve_next(vec!["second".to_string()]));
        assert_eq!(rx1.try_recv().unwrap(), vec!["first"]);
        assert_eq!(rx2.try_recv().unwrap(), vec!["second"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unsolicited_batch_is_dropped() {
        let mut queue = PendingQueue::new();
        assert!(!queue.resolve_next(vec!["stray".to_string()]));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_drain_resolves_empty() {
        let mut queue = PendingQueue::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queue.enqueue(tx1);
        queue.enqueue(tx2);
        drop(rx2);

        assert_eq!(queue.drain_empty(), 2);
        assert_eq!(rx1.try_recv().unwrap(), Vec::<String>::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_parse_match_with_snippet() {
        let item = parse_match(
            "MATCH\tpush\tpush(${1:value})\t1023\t11\t/rust/src/vec.rs\tFunction\tpub fn push(&mut self, value: T)\t\"Appends an element\"",
        )
        .unwrap();
        assert_eq!(item.name, "push");
        assert_eq!(item.snippet.as_deref(), Some("push(${1:value})"));
        assert_eq!(item.line, 1023);
        assert_eq!(item.column, 11);
        assert_eq!(item.path, PathBuf::from("/rust/src/vec.rs"));
        assert_eq!(item.kind, "Function");
        assert_eq!(item.docs.as_deref(), Some("\"Appends an element\""));
    }

    #[test]
    fn test_parse_match_without_snippet() {
        let item =
            parse_match("MATCH\tVec\t300\t11\t/rust/src/vec.rs\tStruct\tpub struct Vec<T>").unwrap();
        assert_eq!(item.snippet, None);
        assert_eq!(item.docs, None);
        assert_eq!(item.context, "pub struct Vec<T>");
    }

    #[test]
    fn test_non_match_lines() {
        assert!(parse_match("PREFIX\t4\t6\tpu").is_none());
        assert!(parse_match("MATCH\tbroken").is_none());
        assert!(parse_match("MATCH\tx\tnot-a-number\t1\tp\tk\tc").is_none());
        let batch = vec![
            "PREFIX\t0\t1\tV".to_string(),
            "MATCH\tVec\t300\t11\t/v.rs\tStruct\tpub struct Vec<T>".to_string(),
        ];
        assert_eq!(parse_matches(&batch).len(), 1);
    }
}
