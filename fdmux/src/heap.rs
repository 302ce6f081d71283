//! Timeout Heap
//!
//! Array-backed binary min-heap of per-descriptor deadlines. Every entry
//! remembers its own position through a [`HeapIndex`] back-reference so an
//! arbitrary entry can be removed in O(log n) when its descriptor is re-armed,
//! unset or delivered.
//!
//! Back-references are plain indices, so the owner of the keys is free to
//! reallocate its storage.

use std::time::Instant;

/// Storage for heap back-references, keyed by the heap entry's key.
pub trait HeapIndex {
    /// Record the current heap position of `key`, or `None` once removed.
    fn set_heap_index(&mut self, key: usize, index: Option<usize>);
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    key: usize,
}

impl HeapEntry {
    fn precedes(&self, other: &HeapEntry) -> bool {
        (self.deadline, self.seq) < (other.deadline, other.seq)
    }
}

/// Min-heap of `(deadline, key)` ordered by deadline, then insertion order.
#[derive(Debug, Default)]
pub struct TimeoutHeap {
    entries: Vec<HeapEntry>,
    next_seq: u64,
}

impl TimeoutHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending deadlines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no deadline is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest entry without removing it.
    pub fn peek(&self) -> Option<(usize, Instant)> {
        self.entries.first().map(|e| (e.key, e.deadline))
    }

    /// Key stored at `position`, if any.
    pub fn key_at(&self, position: usize) -> Option<usize> {
        self.entries.get(position).map(|e| e.key)
    }

    /// Insert `key` with `deadline`.
    pub fn push<I: HeapIndex>(&mut self, key: usize, deadline: Instant, index: &mut I) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.push(HeapEntry { deadline, seq, key });
        let pos = self.entries.len() - 1;
        index.set_heap_index(key, Some(pos));
        self.sift_up(pos, index);
    }

    /// Remove the entry at `position` and return its key.
    ///
    /// The removed key's back-reference is cleared; every entry that moved has
    /// its back-reference updated.
    pub fn remove_at<I: HeapIndex>(&mut self, position: usize, index: &mut I) -> Option<usize> {
        if position >= self.entries.len() {
            return None;
        }
        let removed = self.entries.swap_remove(position);
        index.set_heap_index(removed.key, None);

        if position < self.entries.len() {
            let moved = self.entries[position].key;
            index.set_heap_index(moved, Some(position));
            // The entry taken from the tail may belong above or below the hole.
            if position > 0 && self.entries[position].precedes(&self.entries[(position - 1) / 2]) {
                self.sift_up(position, index);
            } else {
                self.sift_down(position, index);
            }
        }
        Some(removed.key)
    }

    /// Remove the earliest entry.
    pub fn pop<I: HeapIndex>(&mut self, index: &mut I) -> Option<(usize, Instant)> {
        let deadline = self.entries.first()?.deadline;
        self.remove_at(0, index).map(|key| (key, deadline))
    }

    /// Remove every entry, clearing all back-references.
    pub fn clear<I: HeapIndex>(&mut self, index: &mut I) {
        for entry in self.entries.drain(..) {
            index.set_heap_index(entry.key, None);
        }
    }

    fn sift_up<I: HeapIndex>(&mut self, mut pos: usize, index: &mut I) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.entries[pos].precedes(&self.entries[parent]) {
                break;
            }
            self.swap(pos, parent, index);
            pos = parent;
        }
    }

    fn sift_down<I: HeapIndex>(&mut self, mut pos: usize, index: &mut I) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && self.entries[right].precedes(&self.entries[left]) {
                child = right;
            }
            if !self.entries[child].precedes(&self.entries[pos]) {
                break;
            }
            self.swap(pos, child, index);
            pos = child;
        }
    }

    fn swap<I: HeapIndex>(&mut self, a: usize, b: usize, index: &mut I) {
        self.entries.swap(a, b);
        index.set_heap_index(self.entries[a].key, Some(a));
        index.set_heap_index(self.entries[b].key, Some(b));
    }

    /// Verify the heap property and every back-reference.
    #[cfg(test)]
    pub(crate) fn check<F: Fn(usize) -> Option<usize>>(&self, index_of: F) -> bool {
        self.entries.iter().enumerate().all(|(pos, entry)| {
            let ordered = pos == 0 || !entry.precedes(&self.entries[(pos - 1) / 2]);
            ordered && index_of(entry.key) == Some(pos)
        })
    }
}
