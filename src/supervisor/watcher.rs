//! Readiness detection over a live output stream.
//!
//! Output arrives in arbitrary chunks. [`LineReader`] reassembles them into
//! lines (a line split across two reads is joined before matching) and
//! [`watch`] tests each completed line against a [`WatchRule`] until the first
//! match, the end of the stream, or cancellation.

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::process::OutputStream;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("stream closed without a match")]
    StreamClosedWithoutMatch,
    #[error("watch cancelled")]
    Cancelled,
}

/// Pattern plus the capture group that carries the endpoint.
/// `capture_index` uses regex numbering: 0 is the whole match, 1 the first group.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub pattern: Regex,
    pub capture_index: usize,
}

/// Result of the first matching line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The full line that matched (escape sequences removed).
    pub raw: String,
    /// Text of the whole match.
    pub matched: String,
    /// Capture groups 1..=n; `groups[0]` is the first group. Groups that did
    /// not participate are empty strings.
    pub groups: Vec<String>,
}

impl WatchRule {
    pub fn new(pattern: &str, capture_index: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            capture_index,
        })
    }

    pub fn match_line(&self, line: &str) -> Option<Match> {
        let caps = self.pattern.captures(line)?;
        let groups = (1..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();
        Some(Match {
            raw: line.to_string(),
            matched: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            groups,
        })
    }
}

impl Match {
    /// The capture selected by `rule.capture_index`.
    pub fn captured(&self, rule: &WatchRule) -> Option<&str> {
        match rule.capture_index {
            0 => Some(self.matched.as_str()),
            n => self.groups.get(n - 1).map(String::as_str),
        }
    }
}

// ─── Line assembly ───────────────────────────────────────────

/// Longest line kept in one piece; longer runs are emitted in slices.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines. `\n`, `\r\n` and a bare `\r`
/// (progress-bar redraw) all end a line. Bytes are buffered until a
/// terminator arrives, so multi-byte characters and lines may straddle chunks.
/// A line longer than the cap is cut into slices of at most the cap.
#[derive(Debug)]
pub struct LineAssembler {
    partial: Vec<u8>,
    after_cr: bool,
    max_line: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            partial: Vec::new(),
            after_cr: false,
            max_line: max_line.max(1),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            match b {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    self.after_cr = b == b'\r';
                    lines.push(self.take_line());
                }
                _ => {
                    self.after_cr = false;
                    if self.partial.len() >= self.max_line {
                        lines.push(self.take_line());
                    }
                    self.partial.push(b);
                }
            }
        }
        lines
    }

    /// Unterminated tail left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.partial);
        strip_ansi(&String::from_utf8_lossy(&bytes))
    }
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]")
            .expect("static ANSI pattern")
    })
}

/// Remove terminal escape sequences (colours, cursor moves, titles).
pub fn strip_ansi(s: &str) -> String {
    if !s.contains('\x1b') {
        return s.to_string();
    }
    ansi_regex().replace_all(s, "").into_owned()
}

// ─── Line reader ─────────────────────────────────────────────

type LineTap = Box<dyn FnMut(&str) + Send>;

/// Line-oriented view over an [`OutputStream`]. An optional tap sees every
/// line before it is returned (console capture).
pub struct LineReader {
    stream: OutputStream,
    assembler: LineAssembler,
    pending: VecDeque<String>,
    tap: Option<LineTap>,
    closed: bool,
}

impl LineReader {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            assembler: LineAssembler::new(),
            pending: VecDeque::new(),
            tap: None,
            closed: false,
        }
    }

    pub fn with_tap(mut self, tap: impl FnMut(&str) + Send + 'static) -> Self {
        self.tap = Some(Box::new(tap));
        self
    }

    /// Next complete line, or `None` once the stream has ended.
    /// Cancel-safe: no data is lost if the future is dropped while waiting.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                if let Some(tap) = self.tap.as_mut() {
                    tap(&line);
                }
                return Some(line);
            }
            if self.closed {
                return None;
            }
            match self.stream.next_chunk().await {
                Some(chunk) => self.pending.extend(self.assembler.feed(&chunk)),
                None => {
                    self.closed = true;
                    self.pending.extend(self.assembler.finish());
                }
            }
        }
    }

    /// Read to the end of the stream, returning the number of lines seen.
    pub async fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.next_line().await.is_some() {
            count += 1;
        }
        count
    }
}

/// Wait for the first line matching `rule`.
///
/// Resolves exactly once: with the match, with
/// [`WatchError::StreamClosedWithoutMatch`] when the stream ends first, or with
/// [`WatchError::Cancelled`] when `cancel` fires. Lines after the match stay in
/// `lines` for the caller to drain.
pub async fn watch(
    lines: &mut LineReader,
    rule: &WatchRule,
    cancel: &CancellationToken,
) -> Result<Match, WatchError> {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
            line = lines.next_line() => line,
        };
        let Some(line) = line else {
            tracing::debug!("Output stream closed before readiness pattern matched");
            return Err(WatchError::StreamClosedWithoutMatch);
        };
        if let Some(found) = rule.match_line(&line) {
            tracing::info!("Readiness pattern matched: {}", found.raw);
            return Ok(found);
        }
    }
}
