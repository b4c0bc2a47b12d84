//! The generic worker pool.
//!
//! A pool owns a set of workers, an idle-worker LIFO stack, and the shared
//! priority queue of ready sequences. `max_tasks` is the target number of
//! concurrently runnable, non-blocked tasks; it grows while workers sit in
//! blocking regions (immediately for WILL_BLOCK, after a threshold for
//! MAY_BLOCK) and shrinks again when they leave. Workers that idle past the
//! suggested reclaim time clean themselves up.
//!
//! Lock order: the priority-queue lock is a declared predecessor of the pool
//! lock. Worker state (wake event, last-used time) is lock-free or leaf.

use super::blocking::{BlockingObserver, BlockingType};
use super::delayed::DelayedTaskManager;
use super::environment::EnvironmentParams;
use super::lock::CheckedLock;
use super::priority_queue::PriorityQueue;
use super::scheduler_impl::WorkerObserverSlot;
use super::sequence::Sequence;
use super::service_thread::ServiceThreadRunner;
use super::task::Task;
use super::task_tracker::{CanScheduleSequenceObserver, TaskTracker};
use super::tls;
use super::worker::{Worker, WorkerDelegate};
use super::worker_stack::WorkerStack;
use super::environment::WorkerPoolParams;
use crate::diagnostics::{Error, Result};
use crate::utils::histogram;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Poll period for accounting workers stuck in MAY_BLOCK regions.
pub const BLOCKED_WORKERS_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Default time a worker must stay in MAY_BLOCK before capacity grows. Kept
/// below the poll period so the first poll can already account it.
pub const DEFAULT_MAY_BLOCK_THRESHOLD: Duration = Duration::from_millis(10);

struct BlockedWorker {
    // Set while the worker is inside an unaccounted MAY_BLOCK region.
    may_block_start_time: Option<Instant>,
    incremented_max_tasks: bool,
}

struct PoolState {
    started: bool,
    join_started: bool,
    max_tasks: usize,
    initial_max_tasks: usize,
    suggested_reclaim_time: Duration,
    may_block_threshold: Duration,
    service_runner: Option<ServiceThreadRunner>,
    workers: Vec<Arc<Worker>>,
    idle_stack: WorkerStack,
    num_wake_ups_before_start: usize,
    num_pending_may_block_workers: usize,
    blocked: HashMap<u64, BlockedWorker>,
    polling_max_tasks: bool,
    worker_cleanup_disallowed: bool,
    last_cleanup_time: Option<Instant>,
    next_worker_id: u64,
}

/// A pool of workers sharing one priority queue and capacity policy.
pub struct WorkerPool {
    pool_id: u64,
    pool_label: String,
    env: EnvironmentParams,
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    worker_observer: Arc<WorkerObserverSlot>,
    priority_queue: PriorityQueue,
    lock: CheckedLock<PoolState>,
    self_weak: Weak<WorkerPool>,
}

enum GetWorkOutcome {
    Run(Arc<Sequence>),
    BecameIdle,
    StillIdle,
    CleanedUp,
    Exiting,
}

impl WorkerPool {
    /// Creates an unstarted pool for `env`, labeled
    /// `<scheduler_label>.<env suffix>` in metrics.
    pub fn new(
        scheduler_label: &str,
        env: EnvironmentParams,
        task_tracker: Arc<TaskTracker>,
        delayed_task_manager: Arc<DelayedTaskManager>,
        worker_observer: Arc<WorkerObserverSlot>,
    ) -> Arc<Self> {
        static POOL_IDS: AtomicU64 = AtomicU64::new(1);
        let priority_queue = PriorityQueue::new();
        let pool_lock_predecessor = priority_queue.lock_id();
        Arc::new_cyclic(|self_weak| Self {
            pool_id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            pool_label: format!("{scheduler_label}.{}", env.name_suffix),
            env,
            task_tracker,
            delayed_task_manager,
            worker_observer,
            priority_queue,
            lock: CheckedLock::with_predecessor(
                PoolState {
                    started: false,
                    join_started: false,
                    max_tasks: 0,
                    initial_max_tasks: 0,
                    suggested_reclaim_time: Duration::from_secs(30),
                    may_block_threshold: DEFAULT_MAY_BLOCK_THRESHOLD,
                    service_runner: None,
                    workers: Vec::new(),
                    idle_stack: WorkerStack::new(),
                    num_wake_ups_before_start: 0,
                    num_pending_may_block_workers: 0,
                    blocked: HashMap::new(),
                    polling_max_tasks: false,
                    worker_cleanup_disallowed: false,
                    last_cleanup_time: None,
                    next_worker_id: 1,
                },
                pool_lock_predecessor,
            ),
            self_weak: self_weak.clone(),
        })
    }

    /// Identifier used for the thread-local current-pool binding.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Label used in this pool's metric names.
    pub fn pool_label(&self) -> &str {
        &self.pool_label
    }

    /// Starts the pool: records parameters and creates the initial workers.
    /// Wake-ups requested before start are honored now.
    pub fn start(
        self: &Arc<Self>,
        params: WorkerPoolParams,
        service_runner: ServiceThreadRunner,
        may_block_threshold: Duration,
    ) -> Result<()> {
        let mut state = self.lock.lock();
        if state.started {
            return Err(Error::configuration_error(format!(
                "pool {} started twice",
                self.pool_label
            ))
            .boxed());
        }
        state.started = true;
        state.max_tasks = params.max_threads;
        state.initial_max_tasks = params.max_threads;
        state.suggested_reclaim_time = params.reclaim_time;
        state.may_block_threshold = may_block_threshold;
        state.service_runner = Some(service_runner);

        let num_initial_workers = (state.num_wake_ups_before_start + 1).min(state.max_tasks);
        let num_wake_ups = state.num_wake_ups_before_start;
        for i in 0..num_initial_workers {
            match self.create_and_register_worker_locked(&mut state) {
                Some(worker) => {
                    if i < num_wake_ups {
                        worker.wake_up();
                    } else {
                        state.idle_stack.push(worker);
                    }
                }
                None => break,
            }
        }
        log::info!(
            "pool {} started: max_tasks={}, initial workers={}",
            self.pool_label,
            state.max_tasks,
            state.workers.len()
        );
        Ok(())
    }

    /// Admits `task` and routes it to `sequence`, either now or through the
    /// delayed-task manager. Returns false when admission was refused.
    pub fn post_task_with_sequence(
        self: &Arc<Self>,
        mut task: Task,
        sequence: Arc<Sequence>,
    ) -> bool {
        if !self.task_tracker.will_post_task(&mut task) {
            return false;
        }
        if task.delay().is_zero() {
            self.post_task_with_sequence_now(task, sequence);
        } else {
            let pool = Arc::clone(self);
            self.delayed_task_manager.add_delayed_task(
                task,
                Box::new(move |task| pool.post_task_with_sequence_now(task, sequence)),
            );
        }
        true
    }

    /// Pushes an already-admitted task into `sequence` and schedules the
    /// sequence if it just became non-empty.
    pub fn post_task_with_sequence_now(self: &Arc<Self>, task: Task, sequence: Arc<Sequence>) {
        let schedule = {
            let mut txn = sequence.begin_transaction();
            if txn.push_task(task) {
                let observer: Arc<dyn CanScheduleSequenceObserver> =
                    Arc::clone(self) as Arc<dyn CanScheduleSequenceObserver>;
                self.task_tracker
                    .will_schedule_sequence(txn.sort_key(), &sequence, &observer)
            } else {
                false
            }
        };
        if schedule {
            self.schedule_sequence(Arc::clone(&sequence));
        }
    }

    /// Pushes a ready sequence into the priority queue and wakes one worker.
    pub fn schedule_sequence(self: &Arc<Self>, sequence: Arc<Sequence>) {
        {
            let txn = sequence.begin_transaction();
            let sort_key = txn.sort_key();
            let mut queue = self.priority_queue.begin_transaction();
            queue.push(Arc::clone(&sequence), sort_key);
        }
        self.wake_one_worker();
    }

    /// Re-enqueues a sequence that still has work. A wake-up is only needed
    /// when the sequence arrives from another pool; within the pool the
    /// running worker's own next `get_work` picks it up.
    pub fn re_enqueue_sequence(self: &Arc<Self>, sequence: Arc<Sequence>, is_changing_pools: bool) {
        {
            let txn = sequence.begin_transaction();
            let sort_key = txn.sort_key();
            let mut queue = self.priority_queue.begin_transaction();
            queue.push(Arc::clone(&sequence), sort_key);
        }
        if is_changing_pools {
            self.wake_one_worker();
        }
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        tls::current_pool() == Some(self.pool_id)
    }

    /// Records the periodic worker-count metrics.
    pub fn record_worker_metrics(&self) {
        let state = self.lock.lock();
        histogram::record_count(
            &format!("NumWorkers.{}", self.pool_label),
            state.workers.len() as u64,
        );
        histogram::record_count(
            &format!("NumActiveWorkers.{}", self.pool_label),
            (state.workers.len() - state.idle_stack.len()) as u64,
        );
    }

    /// Prevents idle workers from cleaning themselves up; tests use this to
    /// keep worker counts observable.
    pub fn disallow_worker_cleanup_for_testing(&self) {
        self.lock.lock().worker_cleanup_disallowed = true;
    }

    /// Current `max_tasks` (tests only).
    pub fn max_tasks_for_testing(&self) -> usize {
        self.lock.lock().max_tasks
    }

    /// Current number of workers (tests only).
    pub fn num_workers_for_testing(&self) -> usize {
        self.lock.lock().workers.len()
    }

    /// Current number of idle workers (tests only).
    pub fn num_idle_workers_for_testing(&self) -> usize {
        self.lock.lock().idle_stack.len()
    }

    /// Stops and joins every worker, then drains leftover sequences so no
    /// task -> runner reference cycle survives teardown.
    pub fn join_for_testing(&self) {
        let workers = {
            let mut state = self.lock.lock();
            state.join_started = true;
            state.workers.clone()
        };
        for worker in &workers {
            worker.join_for_testing();
        }
        let sequences = self.priority_queue.begin_transaction().take_all();
        for sequence in sequences {
            let dropped = sequence.begin_transaction().clear();
            if dropped > 0 {
                log::debug!(
                    "pool {}: dropped {dropped} queued tasks at join",
                    self.pool_label
                );
            }
        }
        let mut state = self.lock.lock();
        state.workers.clear();
        while state.idle_stack.pop().is_some() {}
    }

    // Wakes one idle worker, creating one first if the pool is under
    // capacity and none is idle. Before start, wake-ups are counted and
    // replayed at start.
    fn wake_one_worker(self: &Arc<Self>) {
        let mut state = self.lock.lock();
        self.wake_one_worker_locked(&mut state);
    }

    fn wake_one_worker_locked(self: &Arc<Self>, state: &mut PoolState) {
        if !state.started {
            state.num_wake_ups_before_start += 1;
            return;
        }
        self.maintain_at_least_one_idle_worker_locked(state);
        // Over-capacity workers stay asleep; they are reclaimed or released
        // by a later capacity increase.
        let active = state.workers.len() - state.idle_stack.len();
        if active >= state.max_tasks {
            return;
        }
        if let Some(worker) = state.idle_stack.pop() {
            worker.wake_up();
        }
    }

    fn maintain_at_least_one_idle_worker_locked(self: &Arc<Self>, state: &mut PoolState) {
        if state.join_started {
            return;
        }
        if state.idle_stack.is_empty() && state.workers.len() < state.max_tasks {
            if let Some(worker) = self.create_and_register_worker_locked(state) {
                state.idle_stack.push(worker);
            }
        }
    }

    // Creates a worker and its OS thread. Failure to spawn the first worker
    // of the pool is fatal; later failures degrade capacity.
    fn create_and_register_worker_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) -> Option<Arc<Worker>> {
        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;
        let observer: Arc<dyn CanScheduleSequenceObserver> =
            Arc::clone(self) as Arc<dyn CanScheduleSequenceObserver>;
        let worker = Worker::new(
            self.env.priority_hint,
            Arc::clone(&self.task_tracker),
            observer,
        );
        let delegate = Box::new(PoolWorkerDelegate {
            pool: Arc::clone(self),
            worker_id,
            num_tasks_since_last_wait: 0,
            num_tasks_since_last_detach: 0,
        });
        if !worker.start(delegate) {
            assert!(
                !state.workers.is_empty(),
                "failed to spawn the first worker of pool {}",
                self.pool_label
            );
            log::warn!(
                "pool {}: worker spawn failed, continuing with {} workers",
                self.pool_label,
                state.workers.len()
            );
            return None;
        }
        worker.set_last_used_time();
        state.workers.push(Arc::clone(&worker));
        log::trace!("pool {}: created worker {worker_id}", self.pool_label);
        Some(worker)
    }

    fn get_work(&self, worker: &Arc<Worker>, _worker_id: u64) -> GetWorkOutcome {
        let mut queue = self.priority_queue.begin_transaction();
        let mut state = self.lock.lock();

        if state.join_started || worker.should_exit() {
            return GetWorkOutcome::Exiting;
        }

        if state.idle_stack.contains(worker) {
            // Woken by the sleep timeout while still idle.
            if self.can_cleanup_locked(&state, worker) {
                self.cleanup_worker_locked(&mut state, worker);
                return GetWorkOutcome::CleanedUp;
            }
            return GetWorkOutcome::StillIdle;
        }

        // Excess workers beyond the idle stack go idle instead of taking
        // work, bringing active count back toward max_tasks.
        let num_excess = state.workers.len().saturating_sub(state.max_tasks);
        if num_excess > state.idle_stack.len() {
            self.worker_becomes_idle_locked(&mut state, worker);
            return GetWorkOutcome::BecameIdle;
        }

        if queue.is_empty() {
            self.worker_becomes_idle_locked(&mut state, worker);
            return GetWorkOutcome::BecameIdle;
        }
        GetWorkOutcome::Run(queue.pop_highest())
    }

    fn can_cleanup_locked(&self, state: &PoolState, worker: &Arc<Worker>) -> bool {
        if state.worker_cleanup_disallowed || state.workers.len() <= 1 {
            return false;
        }
        worker
            .idle_duration()
            .is_some_and(|idle| idle >= state.suggested_reclaim_time)
    }

    fn cleanup_worker_locked(&self, state: &mut PoolState, worker: &Arc<Worker>) {
        worker.cleanup();
        state.idle_stack.remove(worker);
        state.workers.retain(|w| !Arc::ptr_eq(w, worker));
        let now = Instant::now();
        if let Some(last) = state.last_cleanup_time {
            histogram::record_time(&format!("DetachDuration.{}", self.pool_label), now - last);
        }
        state.last_cleanup_time = Some(now);
        log::debug!(
            "pool {}: reclaimed idle worker, {} remain",
            self.pool_label,
            state.workers.len()
        );
    }

    fn worker_becomes_idle_locked(&self, state: &mut PoolState, worker: &Arc<Worker>) {
        worker.set_last_used_time();
        state.idle_stack.push(Arc::clone(worker));
    }

    fn sleep_timeout(&self) -> Duration {
        self.lock.lock().suggested_reclaim_time
    }

    // MAY_BLOCK entered: count the worker as pending and start the periodic
    // capacity adjustment if it is not already running.
    fn may_block_entered(self: &Arc<Self>, worker_id: u64) {
        let mut state = self.lock.lock();
        state.num_pending_may_block_workers += 1;
        state.blocked.insert(
            worker_id,
            BlockedWorker {
                may_block_start_time: Some(Instant::now()),
                incremented_max_tasks: false,
            },
        );
        self.schedule_adjust_max_tasks_if_needed_locked(&mut state);
    }

    // WILL_BLOCK entered: capacity grows immediately.
    fn will_block_entered(self: &Arc<Self>, worker_id: u64) {
        let queue = self.priority_queue.begin_transaction();
        let mut state = self.lock.lock();
        state.blocked.insert(
            worker_id,
            BlockedWorker {
                may_block_start_time: None,
                incremented_max_tasks: true,
            },
        );
        state.max_tasks += 1;
        if queue.is_empty() {
            self.maintain_at_least_one_idle_worker_locked(&mut state);
        } else {
            self.wake_one_worker_locked(&mut state);
        }
    }

    fn blocking_upgraded(self: &Arc<Self>, worker_id: u64) {
        let queue = self.priority_queue.begin_transaction();
        let mut state = self.lock.lock();
        let Some(entry) = state.blocked.get_mut(&worker_id) else {
            return;
        };
        entry.may_block_start_time = None;
        if !entry.incremented_max_tasks {
            entry.incremented_max_tasks = true;
            state.num_pending_may_block_workers -= 1;
            state.max_tasks += 1;
            if queue.is_empty() {
                self.maintain_at_least_one_idle_worker_locked(&mut state);
            } else {
                self.wake_one_worker_locked(&mut state);
            }
        }
    }

    fn blocking_ended(&self, worker_id: u64) {
        let mut state = self.lock.lock();
        if let Some(entry) = state.blocked.remove(&worker_id) {
            if entry.incremented_max_tasks {
                state.max_tasks -= 1;
            } else {
                state.num_pending_may_block_workers -= 1;
            }
        }
    }

    fn schedule_adjust_max_tasks_if_needed_locked(self: &Arc<Self>, state: &mut PoolState) {
        if state.polling_max_tasks {
            return;
        }
        state.polling_max_tasks = true;
        self.post_adjust_max_tasks_tick_locked(state);
    }

    fn post_adjust_max_tasks_tick_locked(&self, state: &mut PoolState) {
        let Some(service_runner) = state.service_runner.clone() else {
            state.polling_max_tasks = false;
            return;
        };
        let pool = self.self_weak.clone();
        service_runner.post_delayed_task(
            BLOCKED_WORKERS_POLL_PERIOD,
            Box::new(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.adjust_max_tasks();
                }
            }),
        );
    }

    // Runs on the service thread every BLOCKED_WORKERS_POLL_PERIOD while any
    // MAY_BLOCK worker is unaccounted: workers past the threshold raise
    // max_tasks, and freed capacity drains pending sequences.
    fn adjust_max_tasks(self: &Arc<Self>) {
        let queue = self.priority_queue.begin_transaction();
        let mut state = self.lock.lock();
        let threshold = state.may_block_threshold;
        let original_max_tasks = state.max_tasks;

        let mut newly_accounted = 0;
        for entry in state.blocked.values_mut() {
            if !entry.incremented_max_tasks
                && entry
                    .may_block_start_time
                    .is_some_and(|start| start.elapsed() >= threshold)
            {
                entry.incremented_max_tasks = true;
                newly_accounted += 1;
            }
        }
        state.num_pending_may_block_workers -= newly_accounted;
        state.max_tasks += newly_accounted;

        let num_wake_ups = (state.max_tasks - original_max_tasks).min(queue.len());
        for _ in 0..num_wake_ups {
            self.wake_one_worker_locked(&mut state);
        }
        self.maintain_at_least_one_idle_worker_locked(&mut state);

        if state.num_pending_may_block_workers > 0 {
            self.post_adjust_max_tasks_tick_locked(&mut state);
        } else {
            state.polling_max_tasks = false;
        }
    }
}

impl CanScheduleSequenceObserver for WorkerPool {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
        if let Some(pool) = self.self_weak.upgrade() {
            pool.schedule_sequence(sequence);
        }
    }
}

// Per-worker blocking observer; transitions funnel into the owning pool.
struct PoolBlockingObserver {
    pool: Weak<WorkerPool>,
    worker_id: u64,
}

impl BlockingObserver for PoolBlockingObserver {
    fn blocking_started(&self, blocking_type: BlockingType) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        match blocking_type {
            BlockingType::MayBlock => pool.may_block_entered(self.worker_id),
            BlockingType::WillBlock => pool.will_block_entered(self.worker_id),
        }
    }

    fn blocking_type_upgraded(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.blocking_upgraded(self.worker_id);
        }
    }

    fn blocking_ended(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.blocking_ended(self.worker_id);
        }
    }
}

struct PoolWorkerDelegate {
    pool: Arc<WorkerPool>,
    worker_id: u64,
    num_tasks_since_last_wait: u64,
    num_tasks_since_last_detach: u64,
}

impl WorkerDelegate for PoolWorkerDelegate {
    fn thread_label(&self) -> &'static str {
        self.pool.env.worker_name
    }

    fn on_main_entry(&mut self, worker: &Arc<Worker>) {
        tls::set_current_pool(Some(self.pool.pool_id));
        super::blocking::set_blocking_observer(Some(Arc::new(PoolBlockingObserver {
            pool: Arc::downgrade(&self.pool),
            worker_id: self.worker_id,
        })));
        if let Some(observer) = self.pool.worker_observer.read().unwrap().as_ref() {
            observer.on_worker_main_entry();
        }
        let _ = worker;
    }

    fn get_work(&mut self, worker: &Arc<Worker>) -> Option<Arc<Sequence>> {
        match self.pool.get_work(worker, self.worker_id) {
            GetWorkOutcome::Run(sequence) => Some(sequence),
            GetWorkOutcome::BecameIdle => {
                histogram::record_count(
                    &format!("NumTasksBetweenWaits.{}", self.pool.pool_label),
                    self.num_tasks_since_last_wait,
                );
                self.num_tasks_since_last_wait = 0;
                None
            }
            GetWorkOutcome::CleanedUp => {
                histogram::record_count(
                    &format!("NumTasksBeforeDetach.{}", self.pool.pool_label),
                    self.num_tasks_since_last_detach,
                );
                None
            }
            GetWorkOutcome::StillIdle | GetWorkOutcome::Exiting => None,
        }
    }

    fn did_run_task(&mut self) {
        self.num_tasks_since_last_wait += 1;
        self.num_tasks_since_last_detach += 1;
    }

    fn re_enqueue_sequence(&mut self, sequence: Arc<Sequence>) {
        self.pool.re_enqueue_sequence(sequence, false);
    }

    fn sleep_timeout(&self) -> Option<Duration> {
        Some(self.pool.sleep_timeout())
    }

    fn on_main_exit(&mut self, worker: &Arc<Worker>) {
        if let Some(observer) = self.pool.worker_observer.read().unwrap().as_ref() {
            observer.on_worker_main_exit();
        }
        super::blocking::set_blocking_observer(None);
        tls::set_current_pool(None);
        let _ = worker;
    }
}
