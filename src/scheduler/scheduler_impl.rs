//! The scheduler façade.
//!
//! Owns the task tracker, the service thread, the delayed-task manager, the
//! four worker pools, and the single-thread runner manager, and hands out
//! task runners. Pools are keyed by environment index:
//! `(is_background ? 2 : 0) + (blocking ? 1 : 0)`.

use super::delayed::DelayedTaskManager;
use super::environment::{
    ENVIRONMENT_COUNT, ENVIRONMENT_PARAMS, InitParams, environment_index,
};
use super::runner::{ParallelTaskRunner, SequencedTaskRunner};
use super::sequence::Sequence;
use super::service_thread::{ServiceThread, ServiceThreadRunner};
pub use super::single_thread::SingleThreadMode;
use super::single_thread::{SingleThreadRunnerManager, SingleThreadTaskRunner};
use super::task::Task;
use super::task_traits::{ShutdownBehavior, TaskPriority, TaskTraits};
use super::task_tracker::TaskTracker;
use super::worker_pool::{DEFAULT_MAY_BLOCK_THRESHOLD, WorkerPool};
use crate::diagnostics::{Error, Result};
use crate::utils::histogram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

/// Notified at every worker main entry and exit. Entries and exits are
/// symmetric per worker. Register before [`Scheduler::start`].
pub trait WorkerObserver: Send + Sync {
    /// A worker's OS thread started.
    fn on_worker_main_entry(&self);
    /// A worker's OS thread is about to exit.
    fn on_worker_main_exit(&self);
}

/// Shared slot read by worker delegates at entry/exit.
pub(crate) type WorkerObserverSlot = RwLock<Option<Arc<dyn WorkerObserver>>>;

struct SchedulerInner {
    label: String,
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    pools: [Arc<WorkerPool>; ENVIRONMENT_COUNT],
    single_thread_manager: SingleThreadRunnerManager,
    service_thread: Mutex<Option<ServiceThread>>,
    worker_observer: Arc<WorkerObserverSlot>,
    started: AtomicBool,
    all_tasks_user_blocking: AtomicBool,
}

/// The in-process task scheduler.
///
/// Created once, started once, and in production intentionally kept alive
/// for the life of the process. `shutdown` + `join_for_testing` give tests a
/// clean teardown.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates an unstarted scheduler. `label` prefixes metric names and
    /// thread names.
    pub fn create(label: &str) -> Self {
        let task_tracker = Arc::new(TaskTracker::new(label));
        let delayed_task_manager = Arc::new(DelayedTaskManager::new());
        let worker_observer: Arc<WorkerObserverSlot> = Arc::new(RwLock::new(None));
        let pools = std::array::from_fn(|index| {
            WorkerPool::new(
                label,
                ENVIRONMENT_PARAMS[index],
                Arc::clone(&task_tracker),
                Arc::clone(&delayed_task_manager),
                Arc::clone(&worker_observer),
            )
        });
        let single_thread_manager = SingleThreadRunnerManager::new(
            Arc::clone(&task_tracker),
            Arc::clone(&delayed_task_manager),
            Arc::clone(&worker_observer),
        );
        Self {
            inner: Arc::new(SchedulerInner {
                label: label.to_string(),
                task_tracker,
                delayed_task_manager,
                pools,
                single_thread_manager,
                service_thread: Mutex::new(None),
                worker_observer,
                started: AtomicBool::new(false),
                all_tasks_user_blocking: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a worker observer. Must happen before start so entry/exit
    /// pairs stay symmetric.
    pub fn set_worker_observer(&self, observer: Arc<dyn WorkerObserver>) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::configuration_error(
                "worker observer must be registered before start",
            )
            .boxed());
        }
        *self.inner.worker_observer.write().unwrap() = Some(observer);
        Ok(())
    }

    /// Starts the service thread, the delayed-task manager, the
    /// single-thread manager, and the four pools.
    pub fn start(&self, init_params: InitParams) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::configuration_error("scheduler started twice").boxed());
        }

        let service_thread = ServiceThread::start(&self.inner.label)
            .map_err(|err| Error::worker_spawn_error(err.to_string()).boxed())?;
        let service_runner = service_thread.task_runner();
        *self.inner.service_thread.lock().unwrap() = Some(service_thread);

        self.inner
            .delayed_task_manager
            .start(service_runner.clone());
        self.inner.single_thread_manager.start();

        if init_params.shared_env == super::environment::SharedEnvironment::ComMta
            && !cfg!(windows)
        {
            log::warn!("COM_MTA shared environment is Windows-only; using default workers");
        }

        // Best-effort work must not crowd out foreground work.
        let best_effort_cap = init_params
            .best_effort_pool
            .max_threads
            .min(init_params.foreground_pool.max_threads / 2)
            .max(1);
        self.inner
            .task_tracker
            .set_max_scheduled_best_effort_sequences(best_effort_cap);

        for (index, pool) in self.inner.pools.iter().enumerate() {
            pool.start(
                init_params.pool_params(index),
                service_runner.clone(),
                DEFAULT_MAY_BLOCK_THRESHOLD,
            )?;
        }

        if let Some(interval) = init_params.heartbeat_interval {
            schedule_heartbeat(Arc::downgrade(&self.inner), service_runner, interval);
        }
        log::info!(
            "scheduler {} started (best-effort cap {best_effort_cap})",
            self.inner.label
        );
        Ok(())
    }

    /// Creates a runner whose tasks may run in parallel, in any order.
    pub fn create_parallel_task_runner(&self, traits: TaskTraits) -> Arc<ParallelTaskRunner> {
        let traits = self.normalize_traits(traits);
        ParallelTaskRunner::new(traits, self.pool_for_traits(&traits))
    }

    /// Creates a runner whose tasks run one at a time, in posting order.
    pub fn create_sequenced_task_runner(&self, traits: TaskTraits) -> Arc<SequencedTaskRunner> {
        let traits = self.normalize_traits(traits);
        SequencedTaskRunner::new(traits, self.pool_for_traits(&traits))
    }

    /// Creates a runner whose tasks all run on one dedicated or shared OS
    /// thread.
    pub fn create_single_thread_task_runner(
        &self,
        traits: TaskTraits,
        mode: SingleThreadMode,
    ) -> Result<Arc<SingleThreadTaskRunner>> {
        let traits = self.normalize_traits(traits);
        self.inner
            .single_thread_manager
            .create_single_thread_task_runner(traits, mode)
    }

    /// Forces the priority of all tasks without an explicit priority to
    /// `UserBlocking`. Consulted on every runner creation.
    pub fn set_all_tasks_user_blocking(&self, enabled: bool) {
        self.inner
            .all_tasks_user_blocking
            .store(enabled, Ordering::SeqCst);
    }

    /// Starts shutdown and waits for every BLOCK_SHUTDOWN task.
    pub fn shutdown(&self) {
        self.inner.task_tracker.shutdown();
    }

    /// Blocks until all undelayed tasks posted so far have completed, or
    /// shutdown completes.
    pub fn flush_for_testing(&self) {
        self.inner.task_tracker.flush_for_testing();
    }

    /// Invokes `callback` once all undelayed tasks posted so far have
    /// completed, or shutdown completes.
    pub fn flush_async_for_testing(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.task_tracker.flush_async_for_testing(callback);
    }

    /// Joins every thread owned by the scheduler. The service thread stops
    /// first so the delayed-task manager cannot post to a joined pool.
    pub fn join_for_testing(&self) {
        if let Some(mut service_thread) = self.inner.service_thread.lock().unwrap().take() {
            service_thread.stop();
        }
        self.inner.single_thread_manager.join_for_testing();
        for pool in &self.inner.pools {
            pool.join_for_testing();
        }
        log::debug!("scheduler {} joined", self.inner.label);
    }

    /// The tracker, for components and tests that observe admission state.
    pub fn task_tracker(&self) -> &Arc<TaskTracker> {
        &self.inner.task_tracker
    }

    /// The pool serving `traits` (tests observe capacity through this).
    pub fn pool_for_traits(&self, traits: &TaskTraits) -> &Arc<WorkerPool> {
        &self.inner.pools[environment_index(traits)]
    }

    fn normalize_traits(&self, traits: TaskTraits) -> TaskTraits {
        if self.inner.all_tasks_user_blocking.load(Ordering::SeqCst) {
            traits.with_priority_override(TaskPriority::UserBlocking)
        } else {
            traits
        }
    }
}

// Posts one probe task per (priority, may-block) combination and samples the
// worker-count metrics, then re-arms itself until shutdown.
fn schedule_heartbeat(
    inner: Weak<SchedulerInner>,
    service_runner: ServiceThreadRunner,
    interval: Duration,
) {
    let runner_clone = service_runner.clone();
    service_runner.post_delayed_task(
        interval,
        Box::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.task_tracker.has_shutdown_started() {
                return;
            }
            perform_heartbeat(&inner);
            schedule_heartbeat(Arc::downgrade(&inner), runner_clone, interval);
        }),
    );
}

fn perform_heartbeat(inner: &Arc<SchedulerInner>) {
    for pool in &inner.pools {
        pool.record_worker_metrics();
    }
    for priority in TaskPriority::ALL {
        for may_block in [false, true] {
            let mut traits = TaskTraits::new()
                .with_priority(priority)
                .with_shutdown_behavior(ShutdownBehavior::ContinueOnShutdown);
            if may_block {
                traits = traits.with_may_block();
            }
            let name = format!(
                "HeartbeatLatency.{}.{}{}",
                inner.label,
                priority,
                if may_block { ".MayBlock" } else { "" }
            );
            let posted = Instant::now();
            let task = Task::new(
                crate::from_here!(),
                Box::new(move || histogram::record_time(&name, posted.elapsed())),
                traits,
                Duration::ZERO,
            );
            let pool = &inner.pools[environment_index(&traits)];
            let sequence = Arc::new(Sequence::new(traits));
            pool.post_task_with_sequence(task, sequence);
        }
    }
}
