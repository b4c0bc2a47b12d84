//! # Taskloom Task Scheduler
//!
//! Taskloom is a general-purpose in-process task scheduler that multiplexes
//! application work onto a small, adaptive pool of OS threads. Callers submit
//! closures tagged with traits (priority, shutdown behavior, blocking hints)
//! through typed task-runner handles; the scheduler chooses a worker-pool
//! environment, enforces ordering and shutdown contracts, scales worker count
//! in response to blocked threads, and eventually executes each closure on an
//! appropriate thread.
//!
//! ## Features
//!
//! - **Typed runners**: parallel, sequenced, and single-thread task runners
//!   over a shared pool of workers
//! - **Adaptive capacity**: worker pools grow while tasks sit in blocking
//!   regions and shrink again when they leave
//! - **Shutdown contracts**: per-task policies (continue, skip, block) with a
//!   two-phase quiescence protocol
//! - **Best-effort throttling**: low-priority sequences are rate-limited and
//!   preempted in favor of older or more urgent work
//! - **Delayed tasks**: a single service thread forwards ripe tasks back to
//!   their pool
//!
//! ## Example
//!
//! ```no_run
//! use taskloom::{Scheduler, InitParams, TaskTraits, TaskRunner, from_here};
//!
//! let scheduler = Scheduler::create("Example");
//! scheduler.start(InitParams::recommended()).unwrap();
//!
//! let runner = scheduler.create_sequenced_task_runner(TaskTraits::new());
//! runner.post(from_here!(), Box::new(|| println!("hello from a worker")));
//!
//! scheduler.shutdown();
//! ```

#![warn(missing_docs, rust_2018_idioms)]
#![allow(clippy::module_inception)]

/// Error handling, diagnostics, and result types.
pub mod diagnostics;
/// The scheduler core: task runners, worker pools, tracking, and dispatch.
pub mod scheduler;
/// Utility functions and data structures.
pub mod utils;

// Re-exports for convenience
pub use diagnostics::{Error, Result};
pub use scheduler::blocking::{BlockingType, ScopedBlockingCall};
pub use scheduler::environment::{InitParams, SharedEnvironment, WorkerPoolParams};
pub use scheduler::runner::{ParallelTaskRunner, PostedFrom, SequencedTaskRunner, TaskRunner};
pub use scheduler::scheduler_impl::{Scheduler, SingleThreadMode, WorkerObserver};
pub use scheduler::single_thread::SingleThreadTaskRunner;
pub use scheduler::task_traits::{ShutdownBehavior, TaskPriority, TaskTraits};
