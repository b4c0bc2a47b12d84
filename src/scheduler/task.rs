//! The unit of work: a closure plus scheduling metadata.

use super::runner::TaskRunner;
use super::task_traits::{ShutdownBehavior, TaskTraits};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The closure type accepted by all posting APIs.
pub type TaskClosure = Box<dyn FnOnce() + Send + 'static>;

/// A posted closure and its bookkeeping metadata.
///
/// Tasks are move-only; once executed or skipped they are destroyed. A task
/// optionally holds a reference to the runner it was posted through so the
/// runner (and its sequence) outlive all queued work; that reference is
/// dropped with the task after execution, breaking the
/// sequence -> task -> runner -> sequence cycle for that iteration.
pub struct Task {
    closure: Option<TaskClosure>,
    posted_from: &'static Location<'static>,
    traits: TaskTraits,
    delay: Duration,
    posted_time: Option<Instant>,
    sequenced_time: Option<Instant>,
    tasks_run_at_post: u64,
    runner_keepalive: Option<Arc<dyn TaskRunner>>,
}

impl Task {
    /// Creates a new task.
    ///
    /// A non-zero delay demotes `BLOCK_SHUTDOWN` to `SKIP_ON_SHUTDOWN` so
    /// that delayed tasks cannot hold shutdown indefinitely. The demotion is
    /// fixed here, at post time.
    pub fn new(
        posted_from: &'static Location<'static>,
        closure: TaskClosure,
        traits: TaskTraits,
        delay: Duration,
    ) -> Self {
        let traits = if !delay.is_zero()
            && traits.shutdown_behavior() == ShutdownBehavior::BlockShutdown
        {
            traits.with_shutdown_behavior(ShutdownBehavior::SkipOnShutdown)
        } else {
            traits
        };
        Self {
            closure: Some(closure),
            posted_from,
            traits,
            delay,
            posted_time: None,
            sequenced_time: None,
            tasks_run_at_post: 0,
            runner_keepalive: None,
        }
    }

    /// Source location of the post call.
    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// The task's traits, with the effective (possibly demoted) shutdown
    /// behavior.
    pub fn traits(&self) -> TaskTraits {
        self.traits
    }

    /// The effective shutdown behavior.
    pub fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.traits.shutdown_behavior()
    }

    /// Requested delay before the task becomes eligible to run.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Time at which admission succeeded, set by the task tracker.
    pub fn posted_time(&self) -> Option<Instant> {
        self.posted_time
    }

    /// Stamps the admission time.
    pub fn set_posted_time(&mut self, time: Instant) {
        self.posted_time = Some(time);
    }

    /// Time at which the task was pushed into its sequence.
    pub fn sequenced_time(&self) -> Option<Instant> {
        self.sequenced_time
    }

    /// Stamps the sequence insertion time.
    pub fn set_sequenced_time(&mut self, time: Instant) {
        self.sequenced_time = Some(time);
    }

    /// Snapshot of the tracker's run counter at post time, for the
    /// tasks-run-while-queuing metric.
    pub fn tasks_run_at_post(&self) -> u64 {
        self.tasks_run_at_post
    }

    /// Stores the run-counter snapshot.
    pub fn set_tasks_run_at_post(&mut self, count: u64) {
        self.tasks_run_at_post = count;
    }

    /// Keeps `runner` alive until this task is destroyed.
    pub fn set_runner_keepalive(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runner_keepalive = Some(runner);
    }

    /// Extracts the closure for execution. Returns `None` if already taken.
    pub fn take_closure(&mut self) -> Option<TaskClosure> {
        self.closure.take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("traits", &self.traits)
            .field("delay", &self.delay)
            .field("posted_time", &self.posted_time)
            .field("sequenced_time", &self.sequenced_time)
            .field("closure", &"<closure>")
            .finish()
    }
}
