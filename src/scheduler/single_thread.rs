//! Dedicated and shared single-thread task runners.
//!
//! A single-thread runner guarantees that all its tasks run on one specific
//! OS thread. The backing worker carries a private sequence; posting bypasses
//! the pool priority queue entirely but still passes the task tracker's
//! admission and scheduling gates. DEDICATED runners own their worker and
//! release it with the last runner reference; SHARED runners reuse one
//! worker per (environment, continue-on-shutdown) combination, joined at
//! teardown.

use super::delayed::DelayedTaskManager;
use super::environment::{ENVIRONMENT_COUNT, ENVIRONMENT_PARAMS, environment_index};
use super::runner::{PostedFrom, TaskRunner};
use super::scheduler_impl::WorkerObserverSlot;
use super::sequence::Sequence;
use super::task::{Task, TaskClosure};
use super::task_traits::{ShutdownBehavior, TaskTraits};
use super::task_tracker::{CanScheduleSequenceObserver, TaskTracker};
use super::worker::{Worker, WorkerDelegate};
use crate::diagnostics::Result;
use crate::scheduler::SchedulerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

/// Ownership mode of a single-thread runner's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleThreadMode {
    /// The runner owns its worker; it is released with the last runner ref
    Dedicated,
    /// One worker per environment, reused across runners with equal traits
    Shared,
}

fn dedicated_worker_name(env_index: usize) -> &'static str {
    match env_index {
        0 => "TaskloomSingleThreadForegroundWorker",
        1 => "TaskloomSingleThreadForegroundBlockingWorker",
        2 => "TaskloomSingleThreadBackgroundWorker",
        _ => "TaskloomSingleThreadBackgroundBlockingWorker",
    }
}

fn shared_worker_name(env_index: usize) -> &'static str {
    match env_index {
        0 => "TaskloomSingleThreadSharedForegroundWorker",
        1 => "TaskloomSingleThreadSharedForegroundBlockingWorker",
        2 => "TaskloomSingleThreadSharedBackgroundWorker",
        _ => "TaskloomSingleThreadSharedBackgroundBlockingWorker",
    }
}

// State shared by a single-thread worker's delegate and its runner(s).
struct WorkerState {
    sequence: Arc<Sequence>,
    worker: OnceLock<Arc<Worker>>,
    has_work: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
    worker_name: &'static str,
}

impl WorkerState {
    fn new(traits: TaskTraits, worker_name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            sequence: Arc::new(Sequence::new(traits)),
            worker: OnceLock::new(),
            has_work: AtomicBool::new(false),
            thread_id: Mutex::new(None),
            worker_name,
        })
    }

    fn runs_on_current_thread(&self) -> bool {
        *self.thread_id.lock().unwrap() == Some(std::thread::current().id())
    }
}

impl CanScheduleSequenceObserver for WorkerState {
    fn on_can_schedule_sequence(&self, _sequence: Arc<Sequence>) {
        self.has_work.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.get() {
            worker.wake_up();
        }
    }
}

struct SingleThreadDelegate {
    state: Arc<WorkerState>,
    worker_observer: Arc<WorkerObserverSlot>,
}

impl WorkerDelegate for SingleThreadDelegate {
    fn thread_label(&self) -> &'static str {
        self.state.worker_name
    }

    fn on_main_entry(&mut self, _worker: &Arc<Worker>) {
        *self.state.thread_id.lock().unwrap() = Some(std::thread::current().id());
        if let Some(observer) = self.worker_observer.read().unwrap().as_ref() {
            observer.on_worker_main_entry();
        }
    }

    fn get_work(&mut self, _worker: &Arc<Worker>) -> Option<Arc<Sequence>> {
        if !self.state.has_work.swap(false, Ordering::SeqCst) {
            return None;
        }
        if self.state.sequence.begin_transaction().is_empty() {
            return None;
        }
        Some(Arc::clone(&self.state.sequence))
    }

    fn did_run_task(&mut self) {}

    fn re_enqueue_sequence(&mut self, sequence: Arc<Sequence>) {
        debug_assert!(Arc::ptr_eq(&sequence, &self.state.sequence));
        // The worker's own next get_work picks the sequence back up.
        self.state.has_work.store(true, Ordering::SeqCst);
    }

    fn sleep_timeout(&self) -> Option<Duration> {
        // Single-thread workers are never reclaimed while referenced.
        None
    }

    fn on_main_exit(&mut self, _worker: &Arc<Worker>) {
        if let Some(observer) = self.worker_observer.read().unwrap().as_ref() {
            observer.on_worker_main_exit();
        }
    }
}

struct ManagerState {
    started: bool,
    workers: Vec<Arc<Worker>>,
    // Worker/delegate pairs created before start; threads spawn at start.
    pending_starts: Vec<(Arc<Worker>, Box<dyn WorkerDelegate>)>,
    shared: [[Option<Arc<WorkerState>>; 2]; ENVIRONMENT_COUNT],
}

struct ManagerCore {
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    worker_observer: Arc<WorkerObserverSlot>,
    state: Mutex<ManagerState>,
}

/// Creates and owns the workers behind single-thread runners.
pub struct SingleThreadRunnerManager {
    core: Arc<ManagerCore>,
}

impl SingleThreadRunnerManager {
    /// Creates the manager.
    pub fn new(
        task_tracker: Arc<TaskTracker>,
        delayed_task_manager: Arc<DelayedTaskManager>,
        worker_observer: Arc<WorkerObserverSlot>,
    ) -> Self {
        Self {
            core: Arc::new(ManagerCore {
                task_tracker,
                delayed_task_manager,
                worker_observer,
                state: Mutex::new(ManagerState {
                    started: false,
                    workers: Vec::new(),
                    pending_starts: Vec::new(),
                    shared: Default::default(),
                }),
            }),
        }
    }

    /// Starts worker threads created before start and admits new ones.
    pub fn start(&self) {
        let pending = {
            let mut state = self.core.state.lock().unwrap();
            state.started = true;
            std::mem::take(&mut state.pending_starts)
        };
        for (worker, delegate) in pending {
            worker.start(delegate);
        }
    }

    /// Creates a runner whose tasks all run on one OS thread.
    ///
    /// SHARED mode cannot host traits that block the thread outright; such
    /// runners must be DEDICATED.
    pub fn create_single_thread_task_runner(
        &self,
        traits: TaskTraits,
        mode: SingleThreadMode,
    ) -> Result<Arc<SingleThreadTaskRunner>> {
        if mode == SingleThreadMode::Shared && traits.with_base_sync_primitives_set() {
            debug_assert!(
                false,
                "a shared single-thread runner cannot use base sync primitives"
            );
            return Err(SchedulerError::InvalidTraits(
                "with_base_sync_primitives requires a dedicated single-thread runner".into(),
            )
            .boxed());
        }

        let env = environment_index(&traits);
        let state = match mode {
            SingleThreadMode::Dedicated => {
                let (worker_state, worker, delegate) =
                    self.build_worker_state(traits, dedicated_worker_name(env));
                self.register_worker(self.core.state.lock().unwrap(), worker, delegate);
                worker_state
            }
            SingleThreadMode::Shared => {
                let continue_on_shutdown = traits.shutdown_behavior()
                    == ShutdownBehavior::ContinueOnShutdown;
                let slot_index = usize::from(continue_on_shutdown);
                let mut manager_state = self.core.state.lock().unwrap();
                match manager_state.shared[env][slot_index].clone() {
                    Some(state) => state,
                    None => {
                        let (worker_state, worker, delegate) =
                            self.build_worker_state(traits, shared_worker_name(env));
                        manager_state.shared[env][slot_index] = Some(Arc::clone(&worker_state));
                        self.register_worker(manager_state, worker, delegate);
                        worker_state
                    }
                }
            }
        };

        Ok(Arc::new_cyclic(|self_weak| SingleThreadTaskRunner {
            traits,
            mode,
            state,
            core: Arc::downgrade(&self.core),
            self_weak: self_weak.clone(),
        }))
    }

    /// Joins every worker the manager ever started.
    pub fn join_for_testing(&self) {
        let workers = {
            let mut state = self.core.state.lock().unwrap();
            // Shared workers are released only here.
            state.shared = Default::default();
            state.workers.clone()
        };
        for worker in &workers {
            worker.join_for_testing();
        }
        let mut state = self.core.state.lock().unwrap();
        state.workers.clear();
    }

    fn build_worker_state(
        &self,
        traits: TaskTraits,
        worker_name: &'static str,
    ) -> (Arc<WorkerState>, Arc<Worker>, Box<dyn WorkerDelegate>) {
        let worker_state = WorkerState::new(traits, worker_name);
        let env = ENVIRONMENT_PARAMS[environment_index(&traits)];
        let observer: Arc<dyn CanScheduleSequenceObserver> =
            Arc::clone(&worker_state) as Arc<dyn CanScheduleSequenceObserver>;
        let worker = Worker::new(
            env.priority_hint,
            Arc::clone(&self.core.task_tracker),
            observer,
        );
        let delegate = Box::new(SingleThreadDelegate {
            state: Arc::clone(&worker_state),
            worker_observer: Arc::clone(&self.core.worker_observer),
        });
        worker_state
            .worker
            .set(Arc::clone(&worker))
            .unwrap_or_else(|_| unreachable!("worker slot set twice"));
        (worker_state, worker, delegate)
    }

    fn register_worker(
        &self,
        mut manager_state: std::sync::MutexGuard<'_, ManagerState>,
        worker: Arc<Worker>,
        delegate: Box<dyn WorkerDelegate>,
    ) {
        manager_state.workers.push(Arc::clone(&worker));
        if manager_state.started {
            drop(manager_state);
            worker.start(delegate);
        } else {
            manager_state.pending_starts.push((worker, delegate));
        }
    }
}

/// Runner bound to one specific OS thread.
pub struct SingleThreadTaskRunner {
    traits: TaskTraits,
    mode: SingleThreadMode,
    state: Arc<WorkerState>,
    core: Weak<ManagerCore>,
    self_weak: Weak<SingleThreadTaskRunner>,
}

impl SingleThreadTaskRunner {
    /// The runner's worker ownership mode.
    pub fn mode(&self) -> SingleThreadMode {
        self.mode
    }

    fn post_task_now(
        state: &Arc<WorkerState>,
        tracker: &Arc<TaskTracker>,
        task: Task,
    ) {
        let schedule = {
            let mut txn = state.sequence.begin_transaction();
            if txn.push_task(task) {
                let observer: Arc<dyn CanScheduleSequenceObserver> =
                    Arc::clone(state) as Arc<dyn CanScheduleSequenceObserver>;
                tracker.will_schedule_sequence(txn.sort_key(), &state.sequence, &observer)
            } else {
                false
            }
        };
        if schedule {
            state.on_can_schedule_sequence(Arc::clone(&state.sequence));
        }
    }
}

impl TaskRunner for SingleThreadTaskRunner {
    fn post_delayed(&self, from: PostedFrom, closure: TaskClosure, delay: Duration) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut task = Task::new(from, closure, self.traits, delay);
        if let Some(keepalive) = self.self_weak.upgrade() {
            task.set_runner_keepalive(keepalive as Arc<dyn TaskRunner>);
        }
        if !core.task_tracker.will_post_task(&mut task) {
            return false;
        }
        if task.delay().is_zero() {
            Self::post_task_now(&self.state, &core.task_tracker, task);
        } else {
            let state = Arc::clone(&self.state);
            let tracker = Arc::clone(&core.task_tracker);
            core.delayed_task_manager.add_delayed_task(
                task,
                Box::new(move |task| Self::post_task_now(&state, &tracker, task)),
            );
        }
        true
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        self.state.runs_on_current_thread()
    }
}

impl Drop for SingleThreadTaskRunner {
    fn drop(&mut self) {
        if self.mode != SingleThreadMode::Dedicated {
            return;
        }
        // The last reference to a dedicated runner releases its worker.
        if let Some(worker) = self.state.worker.get() {
            worker.cleanup();
            if let Some(core) = self.core.upgrade() {
                let mut state = core.state.lock().unwrap();
                state.workers.retain(|w| !Arc::ptr_eq(w, worker));
            }
        }
    }
}
