//! LIFO stack of idle workers.
//!
//! The most recently used worker is woken first, keeping its stack warm and
//! letting the least recently used workers age toward reclamation.

use super::worker::Worker;
use std::sync::Arc;

/// A LIFO of idle workers. Guarded externally by the pool lock.
#[derive(Default)]
pub struct WorkerStack {
    stack: Vec<Arc<Worker>>,
}

impl WorkerStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Pushes `worker` on top. Panics if it is already on the stack.
    pub fn push(&mut self, worker: Arc<Worker>) {
        assert!(
            !self.contains(&worker),
            "worker pushed twice onto idle stack"
        );
        self.stack.push(worker);
    }

    /// Pops the most recently pushed worker.
    pub fn pop(&mut self) -> Option<Arc<Worker>> {
        self.stack.pop()
    }

    /// The worker that would be popped next, without removal.
    pub fn peek(&self) -> Option<&Arc<Worker>> {
        self.stack.last()
    }

    /// Whether `worker` is on the stack.
    pub fn contains(&self, worker: &Arc<Worker>) -> bool {
        self.stack.iter().any(|w| Arc::ptr_eq(w, worker))
    }

    /// Removes `worker` regardless of position.
    pub fn remove(&mut self, worker: &Arc<Worker>) {
        self.stack.retain(|w| !Arc::ptr_eq(w, worker));
    }

    /// Number of idle workers.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}
