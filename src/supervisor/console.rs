//! Console buffer backing the "Terminal" view.
//!
//! Output lines are tapped off the runner's stream as they are read and kept
//! in a bounded ring with sequential ids, so a front end can poll
//! `GET /api/console?since=<id>`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONSOLE_BUFFER: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Sequential id, starting at 1.
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LineSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    /// Output of the supervised command.
    Output,
    /// Messages from the launcher itself.
    System,
}

struct Ring {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl Ring {
    fn push(&mut self, source: LineSource, content: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(ConsoleLine {
            id,
            timestamp: current_timestamp(),
            source,
            content,
        });
        id
    }
}

/// Shared, cheaply cloneable console ring.
#[derive(Clone)]
pub struct ConsoleBuffer {
    inner: Arc<Mutex<Ring>>,
}

impl ConsoleBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(Mutex::new(Ring {
                lines: VecDeque::with_capacity(max_size.min(1024)),
                next_id: 1,
                max_size,
            })),
        }
    }

    // A panic while holding the lock cannot leave the ring inconsistent,
    // so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_output(&self, line: &str) -> u64 {
        tracing::debug!(target: "launchkit::console", "{}", line);
        self.lock().push(LineSource::Output, line.to_string())
    }

    pub fn push_system(&self, message: impl Into<String>) -> u64 {
        self.lock().push(LineSource::System, message.into())
    }

    /// Lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        let ring = self.lock();
        let skip = ring.lines.len().saturating_sub(count);
        ring.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CONSOLE_BUFFER)
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_query() {
        let console = ConsoleBuffer::default();
        console.push_system("Started 'python app.py'");
        console.push_output("line 1");
        console.push_output("line 2");

        assert_eq!(console.len(), 3);
        assert_eq!(console.since(0).len(), 3);
        assert_eq!(console.since(1).len(), 2);
        assert_eq!(console.recent(1)[0].content, "line 2");
        assert_eq!(console.recent(100).len(), 3);
        assert_eq!(console.since(0)[0].source, LineSource::System);
    }

    #[test]
    fn ring_evicts_oldest() {
        let console = ConsoleBuffer::with_capacity(10);
        for i in 0..25 {
            console.push_output(&format!("line {}", i));
        }
        assert_eq!(console.len(), 10);
        let lines = console.since(0);
        assert_eq!(lines.first().unwrap().content, "line 15");
        assert_eq!(lines.last().unwrap().id, 25);
    }

    #[test]
    fn clones_share_the_ring() {
        let console = ConsoleBuffer::with_capacity(4);
        let tap = console.clone();
        tap.push_output("from tap");
        assert_eq!(console.recent(1)[0].content, "from tap");
    }
}
