//! Task traits: the metadata callers attach to posted work.

use std::fmt;

/// Priority of a posted task.
///
/// Priorities order the shared ready queue: a pool always prefers the
/// highest-priority sequence with the oldest front task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Work that the user will not notice for a while; may be throttled
    BestEffort = 0,
    /// Work visible to the user but not blocking interaction
    UserVisible = 1,
    /// Work the user is actively waiting on
    UserBlocking = 2,
}

impl TaskPriority {
    /// All priorities, lowest first.
    pub const ALL: [TaskPriority; 3] = [
        TaskPriority::BestEffort,
        TaskPriority::UserVisible,
        TaskPriority::UserBlocking,
    ];

    /// Metric-name suffix for this priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::BestEffort => "BestEffort",
            TaskPriority::UserVisible => "UserVisible",
            TaskPriority::UserBlocking => "UserBlocking",
        }
    }

    /// Index into per-priority counter arrays.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a task when shutdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownBehavior {
    /// The task may keep running during shutdown but is never awaited
    ContinueOnShutdown = 0,
    /// The task is skipped if it has not started when shutdown begins
    SkipOnShutdown = 1,
    /// Shutdown waits for the task to complete
    BlockShutdown = 2,
}

/// Immutable record of the traits attached to a task or runner.
///
/// Built with chained `with_*` methods:
///
/// ```
/// use taskloom::{TaskTraits, TaskPriority, ShutdownBehavior};
///
/// let traits = TaskTraits::new()
///     .with_priority(TaskPriority::BestEffort)
///     .with_shutdown_behavior(ShutdownBehavior::BlockShutdown)
///     .with_may_block();
/// assert!(traits.priority_set_explicitly());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskTraits {
    priority: TaskPriority,
    priority_set_explicitly: bool,
    shutdown_behavior: ShutdownBehavior,
    shutdown_behavior_set_explicitly: bool,
    may_block: bool,
    with_base_sync_primitives: bool,
}

impl TaskTraits {
    /// Creates traits with defaults: `UserVisible`, `SkipOnShutdown`, not
    /// blocking.
    pub fn new() -> Self {
        Self {
            priority: TaskPriority::UserVisible,
            priority_set_explicitly: false,
            shutdown_behavior: ShutdownBehavior::SkipOnShutdown,
            shutdown_behavior_set_explicitly: false,
            may_block: false,
            with_base_sync_primitives: false,
        }
    }

    /// Sets the priority explicitly.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self.priority_set_explicitly = true;
        self
    }

    /// Sets the shutdown behavior explicitly.
    pub fn with_shutdown_behavior(mut self, behavior: ShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self.shutdown_behavior_set_explicitly = true;
        self
    }

    /// Marks the task as likely to enter a blocking call.
    pub fn with_may_block(mut self) -> Self {
        self.may_block = true;
        self
    }

    /// Marks the task as using low-level synchronization primitives that can
    /// block the thread.
    pub fn with_base_sync_primitives(mut self) -> Self {
        self.with_base_sync_primitives = true;
        self
    }

    /// The task priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Whether [`TaskTraits::with_priority`] was called.
    pub fn priority_set_explicitly(&self) -> bool {
        self.priority_set_explicitly
    }

    /// The shutdown behavior.
    pub fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.shutdown_behavior
    }

    /// Whether [`TaskTraits::with_shutdown_behavior`] was called.
    pub fn shutdown_behavior_set_explicitly(&self) -> bool {
        self.shutdown_behavior_set_explicitly
    }

    /// Whether the task may enter a blocking call.
    pub fn may_block(&self) -> bool {
        self.may_block
    }

    /// Whether the task uses blocking synchronization primitives.
    pub fn with_base_sync_primitives_set(&self) -> bool {
        self.with_base_sync_primitives
    }

    /// Returns a copy with the priority forced to `priority` unless the
    /// original priority was set explicitly. Used by the process-wide
    /// "all tasks user-blocking" override.
    pub fn with_priority_override(mut self, priority: TaskPriority) -> Self {
        if !self.priority_set_explicitly {
            self.priority = priority;
        }
        self
    }
}

impl Default for TaskTraits {
    fn default() -> Self {
        Self::new()
    }
}
