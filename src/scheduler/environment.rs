//! Pool environments and scheduler configuration.

use super::task_traits::TaskTraits;
use super::worker::ThreadPriority;
use std::time::Duration;

/// Number of worker-pool environments.
pub const ENVIRONMENT_COUNT: usize = 4;

/// One worker-pool environment: a label suffix and a priority hint.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentParams {
    /// Suffix appended to metric names
    pub name_suffix: &'static str,
    /// OS thread name for the environment's workers
    pub worker_name: &'static str,
    /// Priority hint adopted by the environment's workers
    pub priority_hint: ThreadPriority,
}

/// The four environments, indexed by [`environment_index`].
pub const ENVIRONMENT_PARAMS: [EnvironmentParams; ENVIRONMENT_COUNT] = [
    EnvironmentParams {
        name_suffix: "Foreground",
        worker_name: "TaskloomForegroundWorker",
        priority_hint: ThreadPriority::Normal,
    },
    EnvironmentParams {
        name_suffix: "ForegroundBlocking",
        worker_name: "TaskloomForegroundBlockingWorker",
        priority_hint: ThreadPriority::Normal,
    },
    EnvironmentParams {
        name_suffix: "Background",
        worker_name: "TaskloomBackgroundWorker",
        priority_hint: ThreadPriority::Background,
    },
    EnvironmentParams {
        name_suffix: "BackgroundBlocking",
        worker_name: "TaskloomBackgroundBlockingWorker",
        priority_hint: ThreadPriority::Background,
    },
];

/// Whether workers can actually run at a background priority tier. When
/// false, best-effort work is routed to the foreground pools.
pub const CAN_USE_BACKGROUND_PRIORITY: bool = true;

/// Maps traits to the index of the pool that should run them.
pub fn environment_index(traits: &TaskTraits) -> usize {
    use super::task_traits::TaskPriority;

    let is_background =
        traits.priority() == TaskPriority::BestEffort && CAN_USE_BACKGROUND_PRIORITY;
    let is_blocking = traits.may_block() || traits.with_base_sync_primitives_set();
    (if is_background { 2 } else { 0 }) + (if is_blocking { 1 } else { 0 })
}

/// Sizing of one worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolParams {
    /// Target number of concurrently runnable, non-blocked tasks
    pub max_threads: usize,
    /// How long a worker may stay idle before it is reclaimed
    pub reclaim_time: Duration,
}

impl WorkerPoolParams {
    /// Creates pool params.
    pub fn new(max_threads: usize, reclaim_time: Duration) -> Self {
        Self {
            max_threads: max_threads.max(1),
            reclaim_time,
        }
    }
}

impl Default for WorkerPoolParams {
    fn default() -> Self {
        Self::new(num_cpus::get(), Duration::from_secs(30))
    }
}

/// Per-worker environment shared by the single-thread manager's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedEnvironment {
    /// Plain worker threads
    #[default]
    Default,
    /// COM multi-threaded apartment workers; only meaningful on Windows,
    /// treated as [`SharedEnvironment::Default`] elsewhere
    ComMta,
}

/// Scheduler start-up options.
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Sizing of the best-effort pool
    pub best_effort_pool: WorkerPoolParams,
    /// Sizing of the best-effort blocking pool
    pub best_effort_blocking_pool: WorkerPoolParams,
    /// Sizing of the foreground pool
    pub foreground_pool: WorkerPoolParams,
    /// Sizing of the foreground blocking pool
    pub foreground_blocking_pool: WorkerPoolParams,
    /// Environment for shared single-thread workers
    pub shared_env: SharedEnvironment,
    /// Interval between heartbeat latency probes; `None` disables them
    pub heartbeat_interval: Option<Duration>,
}

impl InitParams {
    /// Creates params from the four pool sizings.
    pub fn new(
        best_effort_pool: WorkerPoolParams,
        best_effort_blocking_pool: WorkerPoolParams,
        foreground_pool: WorkerPoolParams,
        foreground_blocking_pool: WorkerPoolParams,
    ) -> Self {
        Self {
            best_effort_pool,
            best_effort_blocking_pool,
            foreground_pool,
            foreground_blocking_pool,
            shared_env: SharedEnvironment::Default,
            heartbeat_interval: Some(Duration::from_secs(5)),
        }
    }

    /// Recommended sizing for the current machine: foreground pools scale
    /// with CPU count, best-effort pools stay small.
    pub fn recommended() -> Self {
        let cores = num_cpus::get();
        let reclaim = Duration::from_secs(30);
        Self::new(
            WorkerPoolParams::new((cores / 2).max(2), reclaim),
            WorkerPoolParams::new((cores / 2).max(2), reclaim),
            WorkerPoolParams::new(cores.max(2), reclaim),
            WorkerPoolParams::new(cores.max(2), reclaim),
        )
    }

    /// Sets the shared single-thread environment.
    pub fn with_shared_env(mut self, shared_env: SharedEnvironment) -> Self {
        self.shared_env = shared_env;
        self
    }

    /// Sets (or disables) the heartbeat probe interval.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The pool params for environment `index`.
    pub fn pool_params(&self, index: usize) -> WorkerPoolParams {
        match index {
            0 => self.foreground_pool,
            1 => self.foreground_blocking_pool,
            2 => self.best_effort_pool,
            3 => self.best_effort_blocking_pool,
            _ => unreachable!("invalid environment index {index}"),
        }
    }
}

impl Default for InitParams {
    fn default() -> Self {
        Self::recommended()
    }
}
