//! A worker: one OS thread executing sequences handed out by a delegate.
//!
//! The worker owns the main loop; pool and single-thread variants plug in
//! through [`WorkerDelegate`]. A worker sleeps on an auto-reset event with a
//! timeout chosen by its delegate and keeps itself alive through a self
//! reference captured by the OS thread.

use super::task_tracker::{CanScheduleSequenceObserver, TaskTracker};
use super::sequence::Sequence;
use crate::utils::monotonic_micros;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// An auto-reset event: a successful wait consumes the signal.
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitableEvent {
    /// Creates an unsignaled event.
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signals the event, waking at most one waiter.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Clears a pending signal.
    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    /// Waits until signaled or until `timeout` elapses (`None` waits
    /// forever). Returns whether the event was signaled.
    pub fn timed_wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        match timeout {
            None => {
                while !*signaled {
                    signaled = self.condvar.wait(signaled).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .condvar
                        .wait_timeout(signaled, deadline - now)
                        .unwrap();
                    signaled = guard;
                }
            }
        }
        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }
}

impl Default for WaitableEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread priority hint for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Low-priority tier for best-effort pools
    Background,
    /// Default tier
    Normal,
}

/// Hooks implemented by pool and single-thread worker variants.
///
/// All methods run on the worker's own thread.
pub trait WorkerDelegate: Send + 'static {
    /// Static label used in the worker's thread name.
    fn thread_label(&self) -> &'static str;

    /// Called once when the OS thread starts.
    fn on_main_entry(&mut self, worker: &Arc<Worker>);

    /// Returns the next sequence to run, or `None` if the worker should go
    /// back to sleep (or exit, if its exit flag was set).
    fn get_work(&mut self, worker: &Arc<Worker>) -> Option<Arc<Sequence>>;

    /// Called after each executed (or skipped) task.
    fn did_run_task(&mut self);

    /// Puts a still non-empty sequence back into the ready queue.
    fn re_enqueue_sequence(&mut self, sequence: Arc<Sequence>);

    /// Sleep timeout for idle waits; `None` sleeps until woken.
    fn sleep_timeout(&self) -> Option<Duration>;

    /// Parks the worker until there is (possibly) work. The default is a
    /// timed wait on the wake event.
    fn wait_for_work(&mut self, event: &WaitableEvent) {
        event.timed_wait(self.sleep_timeout());
    }

    /// Called once before the OS thread exits.
    fn on_main_exit(&mut self, worker: &Arc<Worker>);
}

struct ThreadState {
    join_handle: Option<JoinHandle<()>>,
}

/// Handle for one worker thread.
pub struct Worker {
    priority_hint: ThreadPriority,
    current_priority: Mutex<ThreadPriority>,
    wake_event: WaitableEvent,
    should_exit: AtomicBool,
    // Microseconds since the process epoch; zero while the worker is active.
    last_used_time_micros: AtomicU64,
    thread: Mutex<ThreadState>,
    task_tracker: Arc<TaskTracker>,
    observer: Arc<dyn CanScheduleSequenceObserver>,
}

impl Worker {
    /// Creates a worker. The OS thread is created by [`Worker::start`].
    pub fn new(
        priority_hint: ThreadPriority,
        task_tracker: Arc<TaskTracker>,
        observer: Arc<dyn CanScheduleSequenceObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            priority_hint,
            current_priority: Mutex::new(priority_hint),
            wake_event: WaitableEvent::new(),
            should_exit: AtomicBool::new(false),
            last_used_time_micros: AtomicU64::new(0),
            thread: Mutex::new(ThreadState { join_handle: None }),
            task_tracker,
            observer,
        })
    }

    /// Creates the OS thread. No-op if already started or exiting. Returns
    /// false when thread creation failed; the caller decides whether that is
    /// fatal.
    pub fn start(self: &Arc<Self>, delegate: Box<dyn WorkerDelegate>) -> bool {
        let mut thread = self.thread.lock().unwrap();
        if thread.join_handle.is_some() || self.should_exit.load(Ordering::SeqCst) {
            return true;
        }
        let worker = Arc::clone(self);
        let spawn_result = std::thread::Builder::new()
            .name(delegate.thread_label().to_string())
            .spawn(move || worker.run_worker(delegate));
        match spawn_result {
            Ok(handle) => {
                thread.join_handle = Some(handle);
                true
            }
            Err(err) => {
                log::error!("failed to spawn worker thread: {err}");
                false
            }
        }
    }

    /// Signals the wake event.
    pub fn wake_up(&self) {
        self.wake_event.signal();
    }

    /// Asks the worker to exit and wakes it. Called with the pool lock held;
    /// never joins.
    pub fn cleanup(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
        self.wake_event.signal();
    }

    /// Whether the worker was asked to exit.
    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    /// Signals exit and joins the OS thread.
    pub fn join_for_testing(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
        self.wake_event.signal();
        let handle = self.thread.lock().unwrap().join_handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Marks the worker idle as of now.
    pub fn set_last_used_time(&self) {
        self.last_used_time_micros
            .store(monotonic_micros(), Ordering::SeqCst);
    }

    /// How long the worker has been idle, if it is.
    pub fn idle_duration(&self) -> Option<Duration> {
        match self.last_used_time_micros.load(Ordering::SeqCst) {
            0 => None,
            micros => Some(Duration::from_micros(
                monotonic_micros().saturating_sub(micros),
            )),
        }
    }

    /// The pool-assigned priority hint.
    pub fn priority_hint(&self) -> ThreadPriority {
        self.priority_hint
    }

    /// The priority the worker currently runs at.
    pub fn current_priority(&self) -> ThreadPriority {
        *self.current_priority.lock().unwrap()
    }

    // Adjusts the recorded priority. A BACKGROUND worker is bumped to NORMAL
    // once shutdown starts so it cannot invert priorities around the
    // shutdown wait.
    fn update_thread_priority(&self) {
        let desired = if self.priority_hint == ThreadPriority::Background
            && self.task_tracker.has_shutdown_started()
        {
            ThreadPriority::Normal
        } else {
            self.priority_hint
        };
        let mut current = self.current_priority.lock().unwrap();
        if *current != desired {
            log::trace!("worker priority change: {:?} -> {:?}", *current, desired);
            *current = desired;
        }
    }

    fn run_worker(self: Arc<Self>, mut delegate: Box<dyn WorkerDelegate>) {
        delegate.on_main_entry(&self);
        delegate.wait_for_work(&self.wake_event);
        loop {
            if self.should_exit() {
                break;
            }
            self.update_thread_priority();
            match delegate.get_work(&self) {
                Some(sequence) => {
                    if let Some(reenqueue) = self
                        .task_tracker
                        .run_and_pop_next_task(sequence, &self.observer)
                    {
                        delegate.re_enqueue_sequence(reenqueue);
                    }
                    delegate.did_run_task();
                    // Guard against a wake that arrived mid-task causing a
                    // spurious extra loop after the next idle push.
                    self.wake_event.reset();
                }
                None => {
                    if self.should_exit() {
                        break;
                    }
                    delegate.wait_for_work(&self.wake_event);
                }
            }
        }
        delegate.on_main_exit(&self);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("priority_hint", &self.priority_hint)
            .field("should_exit", &self.should_exit.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signal_then_wait() {
        let event = WaitableEvent::new();
        event.signal();
        assert!(event.timed_wait(Some(Duration::from_millis(1))));
        // Auto-reset: the signal was consumed.
        assert!(!event.timed_wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_event_reset_clears_signal() {
        let event = WaitableEvent::new();
        event.signal();
        event.reset();
        assert!(!event.timed_wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(WaitableEvent::new());
        let event_clone = Arc::clone(&event);
        let waiter = std::thread::spawn(move || event_clone.timed_wait(None));
        std::thread::sleep(Duration::from_millis(10));
        event.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_idle_duration_tracking() {
        let tracker = Arc::new(TaskTracker::new("IdleDuration"));
        struct NullObserver;
        impl CanScheduleSequenceObserver for NullObserver {
            fn on_can_schedule_sequence(&self, _sequence: Arc<Sequence>) {}
        }
        let worker = Worker::new(ThreadPriority::Normal, tracker, Arc::new(NullObserver));
        assert!(worker.idle_duration().is_none());
        worker.set_last_used_time();
        std::thread::sleep(Duration::from_millis(5));
        assert!(worker.idle_duration().unwrap() >= Duration::from_millis(4));
    }
}
