//! Journal contract for the background flusher
//!
//! The flusher only requires monotonic, contiguous indices and a crash-safe
//! starting index; everything else about the layout is the persistency
//! layer's business. The in-memory implementation below is the default;
//! durable deployments plug in their own.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Position of an entry in the journal.
pub type ItemIndex = u64;

/// Storage backend for the write-behind queue.
///
/// Invariants the implementation must keep:
/// - indices are contiguous: `record` is only ever called with the current
///   ending index;
/// - entries are removed strictly in order, from the front;
/// - an entry at `index < starting_index()` has been acknowledged.
pub trait PersistencyLayer: Send + Sync {
    /// Append an entry at the given index (always the current ending index).
    fn record(&self, index: ItemIndex, command: &[String]);

    /// Drop the front entry, advancing the starting index.
    fn pop_front(&self);

    /// Lowest unacknowledged index.
    fn starting_index(&self) -> ItemIndex;

    /// Index the next entry will be assigned.
    fn ending_index(&self) -> ItemIndex;

    /// Fetch the entry at `index`, if it is still in the journal.
    fn retrieve(&self, index: ItemIndex) -> Option<Vec<String>>;
}

struct MemoryJournal {
    start: ItemIndex,
    entries: VecDeque<Vec<String>>,
}

/// Volatile journal; loses its contents on process restart.
pub struct MemoryPersistency {
    inner: Mutex<MemoryJournal>,
}

impl MemoryPersistency {
    /// Create an empty journal starting at index 0
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryJournal {
                start: 0,
                entries: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryJournal> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryPersistency {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistencyLayer for MemoryPersistency {
    fn record(&self, index: ItemIndex, command: &[String]) {
        let mut journal = self.lock();
        debug_assert_eq!(index, journal.start + journal.entries.len() as u64);
        journal.entries.push_back(command.to_vec());
    }

    fn pop_front(&self) {
        let mut journal = self.lock();
        if journal.entries.pop_front().is_some() {
            journal.start += 1;
        }
    }

    fn starting_index(&self) -> ItemIndex {
        self.lock().start
    }

    fn ending_index(&self) -> ItemIndex {
        let journal = self.lock();
        journal.start + journal.entries.len() as u64
    }

    fn retrieve(&self, index: ItemIndex) -> Option<Vec<String>> {
        let journal = self.lock();
        if index < journal.start {
            return None;
        }
        journal.entries.get((index - journal.start) as usize).cloned()
    }
}
