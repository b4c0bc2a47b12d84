//! A multiset of sequences ordered by their current sort key.
//!
//! The queue is an indexed binary max-heap: a position map keyed by sequence
//! token gives O(log n) removal by identity and in-place reheapify when a
//! sequence's sort key changes externally. A secondary per-priority count
//! serves observability and best-effort accounting.

use super::lock::{CheckedLock, CheckedLockGuard, LockId};
use super::sequence::{Sequence, SequenceSortKey, SequenceTransaction};
use super::task_traits::TaskPriority;
use std::collections::HashMap;
use std::sync::Arc;

struct HeapEntry {
    key: SequenceSortKey,
    sequence: Arc<Sequence>,
}

#[derive(Default)]
struct QueueState {
    heap: Vec<HeapEntry>,
    positions: HashMap<u64, usize>,
    num_per_priority: [usize; 3],
}

impl QueueState {
    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions
            .insert(self.heap[a].sequence.token().as_u64(), a);
        self.positions
            .insert(self.heap[b].sequence.token().as_u64(), b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].key <= self.heap[parent].key {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut largest = index;
            if left < self.heap.len() && self.heap[left].key > self.heap[largest].key {
                largest = left;
            }
            if right < self.heap.len() && self.heap[right].key > self.heap[largest].key {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.swap(index, largest);
            index = largest;
        }
    }

    fn push(&mut self, sequence: Arc<Sequence>, key: SequenceSortKey) {
        let token = sequence.token().as_u64();
        debug_assert!(
            !self.positions.contains_key(&token),
            "sequence pushed twice into priority queue"
        );
        self.num_per_priority[key.priority().index()] += 1;
        let index = self.heap.len();
        self.heap.push(HeapEntry { key, sequence });
        self.positions.insert(token, index);
        self.sift_up(index);
    }

    fn remove_at(&mut self, index: usize) -> HeapEntry {
        let last = self.heap.len() - 1;
        self.swap(index, last);
        let entry = self.heap.pop().unwrap();
        self.positions.remove(&entry.sequence.token().as_u64());
        self.num_per_priority[entry.key.priority().index()] -= 1;
        if index < self.heap.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
        entry
    }
}

/// Shared ready queue of a worker pool.
pub struct PriorityQueue {
    lock: CheckedLock<QueueState>,
}

impl PriorityQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            lock: CheckedLock::new(QueueState::default()),
        }
    }

    /// Identity of the queue's lock; declared predecessor of the pool lock.
    pub fn lock_id(&self) -> LockId {
        self.lock.id()
    }

    /// Acquires the queue lock for a span of operations.
    pub fn begin_transaction(&self) -> PriorityQueueTransaction<'_> {
        PriorityQueueTransaction {
            state: self.lock.lock(),
        }
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped exclusive access to a [`PriorityQueue`].
pub struct PriorityQueueTransaction<'a> {
    state: CheckedLockGuard<'a, QueueState>,
}

impl PriorityQueueTransaction<'_> {
    /// Inserts `sequence` with `sort_key`.
    pub fn push(&mut self, sequence: Arc<Sequence>, sort_key: SequenceSortKey) {
        self.state.push(sequence, sort_key);
    }

    /// Removes and returns the sequence with the greatest sort key.
    ///
    /// Panics on an empty queue; callers check [`Self::is_empty`] first.
    pub fn pop_highest(&mut self) -> Arc<Sequence> {
        assert!(!self.state.heap.is_empty(), "pop on empty priority queue");
        self.state.remove_at(0).sequence
    }

    /// Returns the top sort key without removal.
    ///
    /// Panics on an empty queue.
    pub fn peek_sort_key(&self) -> SequenceSortKey {
        self.state.heap.first().expect("peek on empty queue").key
    }

    /// Removes `sequence` by identity; returns whether it was present.
    pub fn remove(&mut self, sequence: &Sequence) -> bool {
        let token = sequence.token().as_u64();
        match self.state.positions.get(&token).copied() {
            Some(index) => {
                self.state.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Recomputes `sequence`'s sort key from `txn` and repositions it.
    /// No-op if the sequence is not in the queue.
    pub fn update(&mut self, sequence: &Sequence, txn: &SequenceTransaction<'_>) {
        let token = sequence.token().as_u64();
        if let Some(index) = self.state.positions.get(&token).copied() {
            let new_key = txn.sort_key();
            let old_key = self.state.heap[index].key;
            self.state.num_per_priority[old_key.priority().index()] -= 1;
            self.state.num_per_priority[new_key.priority().index()] += 1;
            self.state.heap[index].key = new_key;
            self.state.sift_up(index);
            self.state.sift_down(index);
        }
    }

    /// Number of queued sequences whose sort key has priority `priority`.
    pub fn num_with_priority(&self, priority: TaskPriority) -> usize {
        self.state.num_per_priority[priority.index()]
    }

    /// Whether the queue holds no sequences.
    pub fn is_empty(&self) -> bool {
        self.state.heap.is_empty()
    }

    /// Number of queued sequences.
    pub fn len(&self) -> usize {
        self.state.heap.len()
    }

    /// Removes and returns every queued sequence, unordered. Used at join.
    pub fn take_all(&mut self) -> Vec<Arc<Sequence>> {
        self.state.positions.clear();
        self.state.num_per_priority = [0; 3];
        self.state.heap.drain(..).map(|entry| entry.sequence).collect()
    }
}
