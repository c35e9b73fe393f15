//! Bounded operation history, and the error value produced when a caller
//! breaks one of the invariants of this crate.
//!
//! Both the buffer groups and the slot sets record the operations applied to
//! them into a `History`. The history is only a debugging aid: when a
//! contract violation is detected, it is dumped alongside the current state so
//! the sequence of events leading to the violation can be reconstructed.
use std::collections::VecDeque;
use std::fmt::{self, Display, Write};

use log::error;
use thiserror::Error;

/// Ring buffer of the last `capacity` records pushed into it.
#[derive(Debug, Clone)]
pub struct History<R> {
    records: VecDeque<R>,
    capacity: usize,
    /// Number of records ever pushed, including evicted ones.
    total: u64,
}

impl<R> History<R> {
    /// Create a history keeping up to `capacity` records. A capacity of zero
    /// disables recording.
    pub fn new(capacity: usize) -> Self {
        History {
            records: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, record: R) {
        if self.capacity == 0 {
            return;
        }

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.total += 1;
    }

    /// Forget all the records, e.g. when a new stream configuration starts.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over the retained records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.iter()
    }
}

impl<R: Display> History<R> {
    /// Append a human-readable form of the retained records to `out`.
    pub fn dump(&self, out: &mut String) {
        let first = self.total - self.records.len() as u64;
        for (i, record) in self.records.iter().enumerate() {
            let _ = writeln!(out, "  #{:<6} {}", first + i as u64, record);
        }
    }
}

/// A caller broke an invariant it was responsible for. The state of the
/// object at the time of the violation is captured in `dump`.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct InvariantViolation {
    pub reason: String,
    pub dump: String,
}

impl InvariantViolation {
    /// Build a violation report, and log it at error level since the caller
    /// may well decide to exit right away.
    pub fn new<S: Into<String>>(reason: S, dump: String) -> Self {
        let reason = reason.into();
        error!("{}", reason);
        for line in dump.lines() {
            error!("{}", line);
        }

        InvariantViolation { reason, dump }
    }

    /// Returns a displayable form including the full dump.
    pub fn report(&self) -> Report<'_> {
        Report(self)
    }
}

/// Displays both the reason and the dump of a violation.
pub struct Report<'a>(&'a InvariantViolation);

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.0.reason, self.0.dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_eviction() {
        let mut history = History::new(3);
        assert!(history.is_empty());

        for i in 0..5u32 {
            history.push(i);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);

        // Record numbers keep counting through evictions.
        let mut out = String::new();
        history.dump(&mut out);
        assert!(out.starts_with("  #2 "));
        assert_eq!(out.lines().count(), 3);

        history.clear();
        assert!(history.is_empty());
        history.push(7);
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_history_disabled() {
        let mut history = History::new(0);
        history.push("ignored");
        assert!(history.is_empty());
        assert_eq!(history.capacity(), 0);
    }

    #[test]
    fn test_violation_report() {
        let violation = InvariantViolation::new("bad things", "state: broken".into());
        assert_eq!(violation.to_string(), "bad things");
        assert_eq!(violation.report().to_string(), "bad things\nstate: broken");
    }
}
