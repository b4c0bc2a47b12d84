//! The taskloom scheduler core.
//!
//! This module contains everything between a posted closure and the OS thread
//! that eventually runs it:
//! - Task runners (parallel, sequenced, single-thread) and task traits
//! - Sequences and the shared priority queue
//! - The task tracker (admission, shutdown gates, best-effort preemption)
//! - Worker pools with adaptive capacity and idle-worker reclamation
//! - The delayed-task manager and the internal service thread
//! - The scheduler façade tying the pieces together

pub mod blocking;
pub mod delayed;
pub mod environment;
pub mod lock;
pub mod priority_queue;
pub mod runner;
pub mod scheduler_impl;
pub mod sequence;
pub mod service_thread;
pub mod single_thread;
pub mod task;
pub mod task_tracker;
pub mod task_traits;
pub mod tls;
pub mod worker;
pub mod worker_pool;
pub mod worker_stack;

#[cfg(test)]
mod tests;

use crate::diagnostics::Error;

/// Error types specific to scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler was started more than once
    #[error("Scheduler already started")]
    AlreadyStarted,

    /// An operation required a started scheduler
    #[error("Scheduler not started")]
    NotStarted,

    /// Shutdown was initiated more than once
    #[error("Shutdown already requested")]
    ShutdownRequested,

    /// Joining requires a prior shutdown or an idle scheduler
    #[error("Join called before workers could be stopped")]
    JoinBeforeStop,

    /// An invalid combination of task traits was supplied
    #[error("Invalid task traits: {0}")]
    InvalidTraits(String),

    /// A worker's OS thread could not be spawned
    #[error("Worker thread spawn failed: {0}")]
    WorkerSpawn(String),
}

impl From<SchedulerError> for Error {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::AlreadyStarted
            | SchedulerError::NotStarted
            | SchedulerError::InvalidTraits(_) => Error::configuration_error(err.to_string()),
            SchedulerError::ShutdownRequested | SchedulerError::JoinBeforeStop => {
                Error::shutdown_error(err.to_string())
            }
            SchedulerError::WorkerSpawn(_) => Error::worker_spawn_error(err.to_string()),
        }
    }
}

impl From<SchedulerError> for Box<Error> {
    fn from(err: SchedulerError) -> Self {
        Box::new(Error::from(err))
    }
}

impl SchedulerError {
    /// Converts this SchedulerError into a boxed [`Error`].
    pub fn boxed(self) -> Box<Error> {
        Box::new(Error::from(self))
    }
}
