//! Due-time queue for processes
//!
//! A min-heap keyed by `(time, path)`. Entries are never removed eagerly:
//! when a process is dropped, frozen or re-instantiated its old entries go
//! stale and are discarded lazily on the next peek or pop.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::path::Path;
use crate::types::Time;

/// A scheduled firing of one process instance.
#[derive(Debug, Clone)]
pub struct DueEntry {
    pub time: Time,
    pub path: Path,
    /// Generation of the instance this entry was scheduled for.
    pub generation: u64,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<DueEntry>>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DueEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Time of the earliest live entry.
    pub fn next_time(&mut self, is_live: impl Fn(&DueEntry) -> bool) -> Option<Time> {
        loop {
            let Reverse(entry) = self.heap.peek()?;
            if is_live(entry) {
                return Some(entry.time);
            }
            self.heap.pop();
        }
    }

    /// Pop every live entry due at or before `now`, in `(time, path)` order.
    pub fn pop_due(&mut self, now: Time, is_live: impl Fn(&DueEntry) -> bool) -> Vec<DueEntry> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.time > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop()
                && is_live(&entry)
            {
                due.push(entry);
            }
        }
        due
    }
}
