//! Forwarding of delayed tasks.
//!
//! Admitted tasks with a delay wait in a ready-time min-heap. A single
//! pending timer on the service thread fires at the heap top's ready time;
//! when it fires, every ripe task is handed to its dispatch callback, which
//! re-enters the posting path past admission (admission already happened at
//! the initial post).

use super::service_thread::ServiceThreadRunner;
use super::task::Task;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Receives a ripe task; typically a worker-pool post-now closure.
pub type DispatchCallback = Box<dyn FnOnce(Task) + Send + 'static>;

struct DelayedEntry {
    ready_time: Instant,
    // Posting order breaks ready-time ties.
    order: u64,
    task: Task,
    dispatch: DispatchCallback,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_time == other.ready_time && self.order == other.order
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_time
            .cmp(&other.ready_time)
            .then(self.order.cmp(&other.order))
    }
}

struct DelayedState {
    service_runner: Option<ServiceThreadRunner>,
    heap: BinaryHeap<Reverse<DelayedEntry>>,
    next_order: u64,
    // Earliest wake-up currently armed on the service thread.
    scheduled_wake: Option<Instant>,
}

/// Holds delayed tasks until they ripen.
pub struct DelayedTaskManager {
    state: Mutex<DelayedState>,
}

impl DelayedTaskManager {
    /// Creates an unstarted manager. Tasks may be added before start; their
    /// timers are armed once the service thread is known.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DelayedState {
                service_runner: None,
                heap: BinaryHeap::new(),
                next_order: 0,
                scheduled_wake: None,
            }),
        }
    }

    /// Records the service-thread runner and arms a timer for anything that
    /// was added before start.
    pub fn start(self: &Arc<Self>, service_runner: ServiceThreadRunner) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.service_runner.is_none(), "manager started twice");
        state.service_runner = Some(service_runner);
        self.schedule_wake_locked(&mut state);
    }

    /// Queues `task` until `now + task.delay()`, then hands it to `dispatch`.
    pub fn add_delayed_task(self: &Arc<Self>, task: Task, dispatch: DispatchCallback) {
        debug_assert!(!task.delay().is_zero());
        let ready_time = Instant::now() + task.delay();
        let mut state = self.state.lock().unwrap();
        let order = state.next_order;
        state.next_order += 1;
        state.heap.push(Reverse(DelayedEntry {
            ready_time,
            order,
            task,
            dispatch,
        }));
        self.schedule_wake_locked(&mut state);
    }

    /// Number of tasks still waiting to ripen (tests only).
    pub fn num_pending_for_testing(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    // Arms a service-thread timer for the heap top unless one at least as
    // early is already pending.
    fn schedule_wake_locked(self: &Arc<Self>, state: &mut DelayedState) {
        let Some(Reverse(top)) = state.heap.peek() else {
            return;
        };
        let Some(service_runner) = state.service_runner.clone() else {
            return;
        };
        let top_time = top.ready_time;
        if state.scheduled_wake.is_some_and(|wake| wake <= top_time) {
            return;
        }
        state.scheduled_wake = Some(top_time);
        let manager = Arc::clone(self);
        service_runner.post_delayed_task(
            top_time.saturating_duration_since(Instant::now()),
            Box::new(move || manager.process_ripe_tasks()),
        );
    }

    // Runs on the service thread when a timer fires.
    fn process_ripe_tasks(self: &Arc<Self>) {
        let ripe = {
            let mut state = self.state.lock().unwrap();
            state.scheduled_wake = None;
            let now = Instant::now();
            let mut ripe = Vec::new();
            while state
                .heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.ready_time <= now)
            {
                let Reverse(entry) = state.heap.pop().unwrap();
                ripe.push((entry.task, entry.dispatch));
            }
            self.schedule_wake_locked(&mut state);
            ripe
        };
        for (task, dispatch) in ripe {
            dispatch(task);
        }
    }
}

impl Default for DelayedTaskManager {
    fn default() -> Self {
        Self::new()
    }
}
