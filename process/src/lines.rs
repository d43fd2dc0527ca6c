//! Line reassembly for subprocess streams.
//!
//! Pipes deliver arbitrary chunks; a write may be split mid-line (or
//! mid-character). [`LineReassembler`] buffers raw bytes and yields only
//! terminator-delimited lines, so the output is the same however the stream
//! was chunked. `\n` and `\r\n` are both accepted.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Default)]
pub struct LineReassembler {
    buf: Vec<u8>,
}

impl LineReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut search_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + pos;
            lines.push(decode_line(&self.buf[consumed..end]));
            consumed = end + 1;
            search_from = consumed;
        }
        self.buf.drain(..consumed);
        lines
    }

    /// Flush the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = decode_line(&self.buf);
        self.buf.clear();
        Some(tail)
    }

    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Reads complete lines from an async reader.
pub struct LineReader<R> {
    reader: R,
    reassembler: LineReassembler,
    ready: VecDeque<String>,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            reassembler: LineReassembler::new(),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
            eof: false,
        }
    }

    /// Next complete line, or `Ok(None)` at end of stream.
    ///
    /// A final line without a terminator is returned before `None`.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                return Ok(self.reassembler.finish());
            }
            self.ready.extend(self.reassembler.feed(&self.chunk[..n]));
        }
    }
}
