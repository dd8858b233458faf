//! Bounded ring buffer of recent service log lines.
//!
//! Appended by the lifecycle controller, read on demand by the bridge
//! (`recent_logs`) and pushed incrementally to registered listeners.

use std::collections::VecDeque;

/// Retained line count before the oldest entry is evicted.
pub const LOG_CAPACITY: usize = 300;

#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Materialize the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_lines_in_arrival_order() {
        let mut buf = LogBuffer::new();
        for i in 0..301 {
            buf.push(format!("line-{i}"));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 300);
        assert_eq!(snap.first().map(String::as_str), Some("line-1"));
        assert_eq!(snap.last().map(String::as_str), Some("line-300"));
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buf = LogBuffer::with_capacity(4);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.len(), 2);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
