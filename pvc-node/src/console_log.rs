//! Bounded per-VM console log ring.
//!
//! Console output drained from the hypervisor accumulates here and is
//! flushed to the KV store in batches, so a chatty guest cannot turn its
//! console into a KV hot-spot. The ring keeps at most `capacity` lines;
//! a flush is due after `flush_threshold` new lines or on a VM state
//! change.

use std::collections::VecDeque;

/// Lines accumulated before a flush is due.
const DEFAULT_FLUSH_THRESHOLD: usize = 10;

pub struct ConsoleRing {
    ring: VecDeque<String>,
    capacity: usize,
    flush_threshold: usize,
    /// Lines appended since the last flush.
    pending: usize,
}

impl ConsoleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            pending: 0,
        }
    }

    /// Append drained console lines, trimming the oldest past capacity.
    pub fn push_lines(&mut self, lines: Vec<String>) {
        for line in lines {
            if self.ring.len() == self.capacity {
                self.ring.pop_front();
            }
            self.ring.push_back(line);
            self.pending += 1;
        }
    }

    /// Whether enough has accumulated to warrant a KV write.
    pub fn flush_due(&self) -> bool {
        self.pending >= self.flush_threshold
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    /// Snapshot the ring for publication and reset the pending counter.
    pub fn flush(&mut self) -> Vec<String> {
        self.pending = 0;
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize, prefix: &str) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_capacity_trims_oldest() {
        let mut ring = ConsoleRing::new(5);
        ring.push_lines(lines(8, "l"));
        assert_eq!(ring.len(), 5);
        let snapshot = ring.flush();
        assert_eq!(snapshot.first().unwrap(), "l3");
        assert_eq!(snapshot.last().unwrap(), "l7");
    }

    #[test]
    fn test_flush_coalesces() {
        let mut ring = ConsoleRing::new(100);
        ring.push_lines(lines(3, "a"));
        assert!(!ring.flush_due());
        assert!(ring.has_pending());

        ring.push_lines(lines(9, "b"));
        assert!(ring.flush_due());

        ring.flush();
        assert!(!ring.flush_due());
        assert!(!ring.has_pending());
        // The ring itself survives the flush.
        assert_eq!(ring.len(), 12);
    }
}
