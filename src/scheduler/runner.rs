//! Task-runner handles: the posting surface over the pools.
//!
//! A runner captures traits and a weak handle to its pool; posts fail softly
//! once the scheduler is gone. Parallel runners wrap every task in a fresh
//! single-task sequence; sequenced runners share one sequence, which is what
//! serializes their tasks.

use super::sequence::Sequence;
use super::task::{Task, TaskClosure};
use super::task_traits::TaskTraits;
use super::tls;
use super::worker_pool::WorkerPool;
use std::panic::Location;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Captures the caller's source location for task attribution.
#[macro_export]
macro_rules! from_here {
    () => {
        ::std::panic::Location::caller()
    };
}

/// Source location attached to every posted task.
pub type PostedFrom = &'static Location<'static>;

/// Common posting contract of all runner kinds.
pub trait TaskRunner: Send + Sync {
    /// Posts `closure` to run after `delay`. Returns true on admission.
    fn post_delayed(&self, from: PostedFrom, closure: TaskClosure, delay: Duration) -> bool;

    /// Posts `closure` to run as soon as possible. Returns true on admission.
    fn post(&self, from: PostedFrom, closure: TaskClosure) -> bool {
        self.post_delayed(from, closure, Duration::ZERO)
    }

    /// As [`TaskRunner::post_delayed`]. Nesting does not exist at the pool
    /// level, so the semantics are identical; the method is kept for callers
    /// written against message-loop style runners.
    fn post_non_nestable_delayed(
        &self,
        from: PostedFrom,
        closure: TaskClosure,
        delay: Duration,
    ) -> bool {
        self.post_delayed(from, closure, delay)
    }

    /// Whether the calling context runs tasks of this runner: same pool for
    /// parallel runners, same sequence for sequenced runners, same OS thread
    /// for single-thread runners.
    fn runs_tasks_in_current_sequence(&self) -> bool;
}

/// Runner whose tasks may run in parallel and in any order.
pub struct ParallelTaskRunner {
    traits: TaskTraits,
    pool: Weak<WorkerPool>,
}

impl ParallelTaskRunner {
    /// Creates a parallel runner posting to `pool` with `traits`.
    pub fn new(traits: TaskTraits, pool: &Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            traits,
            pool: Arc::downgrade(pool),
        })
    }
}

impl TaskRunner for ParallelTaskRunner {
    fn post_delayed(&self, from: PostedFrom, closure: TaskClosure, delay: Duration) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        let task = Task::new(from, closure, self.traits, delay);
        // Each parallel task gets its own single-task sequence.
        let sequence = Arc::new(Sequence::new(self.traits));
        pool.post_task_with_sequence(task, sequence)
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        self.pool
            .upgrade()
            .is_some_and(|pool| pool.runs_tasks_on_current_thread())
    }
}

/// Runner whose tasks run one at a time, in posting order.
pub struct SequencedTaskRunner {
    traits: TaskTraits,
    pool: Weak<WorkerPool>,
    sequence: Arc<Sequence>,
    self_weak: Weak<SequencedTaskRunner>,
}

impl SequencedTaskRunner {
    /// Creates a sequenced runner with a fresh sequence on `pool`.
    pub fn new(traits: TaskTraits, pool: &Arc<WorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            traits,
            pool: Arc::downgrade(pool),
            sequence: Arc::new(Sequence::new(traits)),
            self_weak: self_weak.clone(),
        })
    }

    /// Token of the runner's sequence.
    pub fn sequence_token(&self) -> u64 {
        self.sequence.token().as_u64()
    }
}

impl TaskRunner for SequencedTaskRunner {
    fn post_delayed(&self, from: PostedFrom, closure: TaskClosure, delay: Duration) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        let mut task = Task::new(from, closure, self.traits, delay);
        // The queued task keeps the runner (and thus the sequence) alive.
        if let Some(keepalive) = self.self_weak.upgrade() {
            task.set_runner_keepalive(keepalive as Arc<dyn TaskRunner>);
        }
        pool.post_task_with_sequence(task, Arc::clone(&self.sequence))
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        tls::current_sequence_token() == Some(self.sequence.token().as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posts_fail_once_pool_is_gone() {
        let (parallel, sequenced) = {
            let tracker = Arc::new(crate::scheduler::task_tracker::TaskTracker::new("GonePool"));
            let delayed = Arc::new(crate::scheduler::delayed::DelayedTaskManager::new());
            let pool = WorkerPool::new(
                "GonePool",
                crate::scheduler::environment::ENVIRONMENT_PARAMS[0],
                tracker,
                delayed,
                Arc::new(std::sync::RwLock::new(None)),
            );
            (
                ParallelTaskRunner::new(TaskTraits::new(), &pool),
                SequencedTaskRunner::new(TaskTraits::new(), &pool),
            )
        };
        assert!(!parallel.post(crate::from_here!(), Box::new(|| {})));
        assert!(!sequenced.post(crate::from_here!(), Box::new(|| {})));
        assert!(!parallel.runs_tasks_in_current_sequence());
        assert!(!sequenced.runs_tasks_in_current_sequence());
    }
}
