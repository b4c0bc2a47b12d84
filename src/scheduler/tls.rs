//! Thread-local context for worker threads.
//!
//! Workers publish which pool they belong to; the task tracker publishes the
//! sequence token and priority of the task being run. Runner handles read
//! these slots to answer `runs_tasks_in_current_sequence` and to propagate
//! priorities to nested posts.

use super::task_traits::TaskPriority;
use std::cell::Cell;

thread_local! {
    static CURRENT_POOL_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static CURRENT_SEQUENCE_TOKEN: Cell<Option<u64>> = const { Cell::new(None) };
    static CURRENT_PRIORITY: Cell<Option<TaskPriority>> = const { Cell::new(None) };
}

/// Binds the current thread to `pool_id` for its lifetime as a worker.
pub fn set_current_pool(pool_id: Option<u64>) {
    CURRENT_POOL_ID.with(|cell| cell.set(pool_id));
}

/// Pool the current thread belongs to, if it is a pool worker.
pub fn current_pool() -> Option<u64> {
    CURRENT_POOL_ID.with(|cell| cell.get())
}

/// Sequence token of the task currently running on this thread.
pub fn current_sequence_token() -> Option<u64> {
    CURRENT_SEQUENCE_TOKEN.with(|cell| cell.get())
}

/// Priority of the task currently running on this thread.
pub fn current_task_priority() -> Option<TaskPriority> {
    CURRENT_PRIORITY.with(|cell| cell.get())
}

/// RAII scope publishing the sequence token and priority of a running task.
pub struct ScopedTaskContext {
    previous_token: Option<u64>,
    previous_priority: Option<TaskPriority>,
}

impl ScopedTaskContext {
    /// Publishes `token` and `priority` until the scope is dropped.
    pub fn new(token: u64, priority: TaskPriority) -> Self {
        let previous_token =
            CURRENT_SEQUENCE_TOKEN.with(|cell| cell.replace(Some(token)));
        let previous_priority = CURRENT_PRIORITY.with(|cell| cell.replace(Some(priority)));
        Self {
            previous_token,
            previous_priority,
        }
    }
}

impl Drop for ScopedTaskContext {
    fn drop(&mut self) {
        CURRENT_SEQUENCE_TOKEN.with(|cell| cell.set(self.previous_token));
        CURRENT_PRIORITY.with(|cell| cell.set(self.previous_priority));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_task_context_restores() {
        assert_eq!(current_sequence_token(), None);
        {
            let _outer = ScopedTaskContext::new(7, TaskPriority::UserVisible);
            assert_eq!(current_sequence_token(), Some(7));
            assert_eq!(current_task_priority(), Some(TaskPriority::UserVisible));
            {
                let _inner = ScopedTaskContext::new(9, TaskPriority::BestEffort);
                assert_eq!(current_sequence_token(), Some(9));
            }
            assert_eq!(current_sequence_token(), Some(7));
        }
        assert_eq!(current_sequence_token(), None);
        assert_eq!(current_task_priority(), None);
    }

    #[test]
    fn test_current_pool_binding() {
        assert_eq!(current_pool(), None);
        set_current_pool(Some(3));
        assert_eq!(current_pool(), Some(3));
        set_current_pool(None);
        assert_eq!(current_pool(), None);
    }
}
