//! Binary min-heap of pending jobs keyed by next execution time.
//!
//! Entries are ordered by `(due, seq)` where `seq` is a per-heap insertion
//! counter, so jobs due at the same instant pop in insertion order. An
//! auxiliary id → slot map supports removal of arbitrary jobs in O(log n).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::Job;

/// A job waiting in the heap.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapEntry {
    /// When the job should fire.
    pub due: DateTime<Utc>,
    /// Insertion sequence used to break ties between equal `due` values.
    pub seq: u64,
    /// Snapshot of the job at insertion time.
    pub job: Job,
}

impl HeapEntry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.due, self.seq)
    }

    /// The job's id.
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Min-heap of [`HeapEntry`] with id-indexed removal.
#[derive(Debug, Default)]
pub struct TimerHeap {
    entries: Vec<HeapEntry>,
    index: HashMap<String, usize>,
    next_seq: u64,
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}

fn left_child(i: usize) -> usize {
    2 * i + 1
}

fn right_child(i: usize) -> usize {
    2 * i + 2
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The earliest due time, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.peek().map(|e| e.due)
    }

    /// Insert `job` to fire at `due`.
    ///
    /// A job already in the heap under the same id is replaced and returned;
    /// the replacement gets a fresh sequence number.
    pub fn insert(&mut self, job: Job, due: DateTime<Utc>) -> Option<HeapEntry> {
        let replaced = self.remove(&job.id);

        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = self.entries.len();
        self.index.insert(job.id.clone(), slot);
        self.entries.push(HeapEntry { due, seq, job });
        self.sift_up(slot);

        replaced
    }

    /// The minimum entry without removing it.
    pub fn peek(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    /// Remove and return the minimum entry.
    pub fn pop(&mut self) -> Option<HeapEntry> {
        self.remove_at(0)
    }

    /// Pop the minimum only if it is due at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<HeapEntry> {
        match self.peek() {
            Some(entry) if entry.due <= now => self.pop(),
            _ => None,
        }
    }

    /// Remove the job with `id`, wherever it sits.
    pub fn remove(&mut self, id: &str) -> Option<HeapEntry> {
        let slot = *self.index.get(id)?;
        self.remove_at(slot)
    }

    fn remove_at(&mut self, slot: usize) -> Option<HeapEntry> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(slot, last);

        let removed = self.entries.pop()?;
        self.index.remove(removed.id());

        if slot < self.entries.len() {
            // The displaced last entry may belong above or below this slot.
            if self.sift_down(slot) == slot {
                self.sift_up(slot);
            }
        }
        Some(removed)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index.insert(self.entries[a].job.id.clone(), a);
        self.index.insert(self.entries[b].job.id.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let up = parent(slot);
            if self.entries[slot].key() >= self.entries[up].key() {
                break;
            }
            self.swap(slot, up);
            slot = up;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        let len = self.entries.len();
        loop {
            let (l, r) = (left_child(slot), right_child(slot));
            let mut smallest = slot;
            if l < len && self.entries[l].key() < self.entries[smallest].key() {
                smallest = l;
            }
            if r < len && self.entries[r].key() < self.entries[smallest].key() {
                smallest = r;
            }
            if smallest == slot {
                return slot;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.entries.len(), self.index.len(), "index size mismatch");
        for (slot, entry) in self.entries.iter().enumerate() {
            assert_eq!(
                self.index.get(entry.id()),
                Some(&slot),
                "stale index for {}",
                entry.id()
            );
            if slot > 0 {
                assert!(
                    self.entries[parent(slot)].key() <= entry.key(),
                    "heap order violated at slot {slot}"
                );
            }
        }
    }
}
