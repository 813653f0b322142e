//! Bounded diagnostics log for self-describing failures.
//!
//! Entries are stamped with both the virtual instant (what the engine
//! measured) and the wall-clock instant (when it really happened). Only the
//! virtual stamp takes part in any timing decision; the wall stamp is for
//! humans correlating with external logs.
//!
//! The log is a FIFO ring: once `capacity` is reached, each new entry evicts
//! the oldest one. Mutation goes through a single mutex, so concurrent
//! waiters sharing a log never interleave a partial write.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsEntry {
    /// Sequential id; survives eviction, so gaps reveal dropped entries.
    pub sequence: u64,
    pub virtual_time: DateTime<Utc>,
    pub wall_time: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug)]
struct LogState {
    entries: VecDeque<DiagnosticsEntry>,
    next_sequence: u64,
}

/// Append-only ring buffer of diagnostics entries.
#[derive(Debug)]
pub struct DiagnosticsLog {
    state: Mutex<LogState>,
    capacity: usize,
}

impl DiagnosticsLog {
    /// Creates a log holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(LogState {
                entries: VecDeque::with_capacity(capacity),
                next_sequence: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an entry stamped with `virtual_time` and the wall clock.
    pub fn record(&self, virtual_time: DateTime<Utc>, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(virtual_time = %virtual_time, "{message}");

        let mut state = self.lock();
        let entry = DiagnosticsEntry {
            sequence: state.next_sequence,
            virtual_time,
            wall_time: Utc::now(),
            message,
        };
        state.next_sequence += 1;
        state.entries.push_back(entry);

        // Evict old entries past capacity
        while state.entries.len() > self.capacity {
            state.entries.pop_front();
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Entries recorded since creation or last clear, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.lock().next_sequence
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<DiagnosticsEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Renders the last `last_n` entries (all if `None`) as timestamped lines.
    pub fn dump(&self, last_n: Option<usize>) -> String {
        let state = self.lock();
        let retained = state.entries.len();
        let take = last_n.map_or(retained, |n| n.min(retained));
        let omitted = state.next_sequence - take as u64;

        let mut out = String::new();
        if omitted > 0 {
            let _ = writeln!(out, "... {omitted} earlier entries omitted");
        }
        for entry in state.entries.iter().skip(retained - take) {
            let _ = writeln!(
                out,
                "#{:<4} [{}] (wall {}) {}",
                entry.sequence,
                entry.virtual_time.format("%H:%M:%S%.3f"),
                entry.wall_time.format("%H:%M:%S%.3f"),
                entry.message
            );
        }
        out
    }

    /// Drops every entry and restarts sequence numbering.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.next_sequence = 0;
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
