//! Bounded, order-preserving history of recent error reports.
//!
//! The buffer keeps the newest [`HISTORY_CAPACITY`] records, oldest first.
//! Each accepted insertion past capacity evicts exactly one record from the
//! head. Readers get an owned copy; the inner sequence never escapes the lock.
//!
//! Both operations hold the lock only for one push or one clone, so report
//! ingestion and queries never wait on each other for longer than that.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::record::ErrorRecord;

/// Number of records retained.
pub const HISTORY_CAPACITY: usize = 20;

struct Inner {
    records: VecDeque<ErrorRecord>,
    total_recorded: u64,
    total_evicted: u64,
}

/// Process-wide error history shared between the listener and query surfaces.
pub struct HistoryBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl HistoryBuffer {
    /// Buffer with the standard capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity + 1),
                total_recorded: 0,
                total_evicted: 0,
            }),
        }
    }

    /// Append a record, evicting the oldest one when over capacity.
    ///
    /// Returns the evicted record, if any.
    pub fn record(&self, record: ErrorRecord) -> Option<ErrorRecord> {
        let mut inner = self.inner.lock();
        inner.records.push_back(record);
        inner.total_recorded += 1;
        if inner.records.len() > self.capacity {
            inner.total_evicted += 1;
            inner.records.pop_front()
        } else {
            None
        }
    }

    /// Independent copy of the current history, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        let inner = self.inner.lock();
        inner.records.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        let inner = self.inner.lock();
        HistoryStats {
            capacity: self.capacity,
            len: inner.records.len(),
            total_recorded: inner.total_recorded,
            total_evicted: inner.total_evicted,
        }
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HistoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("HistoryBuffer")
            .field("capacity", &stats.capacity)
            .field("len", &stats.len)
            .field("total_recorded", &stats.total_recorded)
            .finish()
    }
}

/// Serializable counters for the history buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub capacity: usize,
    pub len: usize,
    /// Records ever accepted
    pub total_recorded: u64,
    /// Records pushed out of the head
    pub total_evicted: u64,
}
