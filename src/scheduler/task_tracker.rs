//! Task admission, shutdown gates, and best-effort preemption.
//!
//! The tracker owns the global shutdown state machine. Every post passes
//! through [`TaskTracker::will_post_task`], every scheduling decision through
//! [`TaskTracker::will_schedule_sequence`], and every execution through
//! [`TaskTracker::run_and_pop_next_task`]. The packed atomic state counts
//! shutdown-blocking tasks next to the shutdown bit so both update together.

use super::lock::{CheckedCondvar, CheckedLock};
use super::sequence::{Sequence, SequenceSortKey};
use super::task::Task;
use super::task_traits::{ShutdownBehavior, TaskPriority};
use super::tls::ScopedTaskContext;
use crate::utils::histogram;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Notified when a sequence that was previously held back may be scheduled.
pub trait CanScheduleSequenceObserver: Send + Sync {
    /// `sequence` may now be pushed into a ready queue.
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>);
}

// Bit 0: shutdown has started. Remaining bits: number of tasks blocking
// shutdown. Packing both into one atomic makes the post/shutdown race
// well-defined without a lock on the post path.
struct TrackerState {
    bits: AtomicUsize,
}

const SHUTDOWN_STARTED_MASK: usize = 1;
const BLOCKING_TASK_UNIT: usize = 2;

impl TrackerState {
    fn new() -> Self {
        Self {
            bits: AtomicUsize::new(0),
        }
    }

    fn start_shutdown(&self) {
        self.bits.fetch_or(SHUTDOWN_STARTED_MASK, Ordering::SeqCst);
    }

    fn has_shutdown_started(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & SHUTDOWN_STARTED_MASK != 0
    }

    fn num_tasks_blocking_shutdown(&self) -> usize {
        self.bits.load(Ordering::SeqCst) / BLOCKING_TASK_UNIT
    }

    // Returns whether shutdown had started before the increment.
    fn increment_num_tasks_blocking_shutdown(&self) -> bool {
        let prev = self.bits.fetch_add(BLOCKING_TASK_UNIT, Ordering::SeqCst);
        prev & SHUTDOWN_STARTED_MASK != 0
    }

    // Returns (shutdown started, count after the decrement).
    fn decrement_num_tasks_blocking_shutdown(&self) -> (bool, usize) {
        let prev = self.bits.fetch_sub(BLOCKING_TASK_UNIT, Ordering::SeqCst);
        debug_assert!(prev / BLOCKING_TASK_UNIT > 0, "blocking-task underflow");
        (
            prev & SHUTDOWN_STARTED_MASK != 0,
            prev / BLOCKING_TASK_UNIT - 1,
        )
    }
}

struct ShutdownControl {
    shutdown_requested: bool,
}

struct FlushState {
    flush_callback: Option<Box<dyn FnOnce() + Send>>,
}

struct PreemptedSequence {
    sort_key: SequenceSortKey,
    sequence: Arc<Sequence>,
    observer: Arc<dyn CanScheduleSequenceObserver>,
}

impl PartialEq for PreemptedSequence {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key == other.sort_key
    }
}

impl Eq for PreemptedSequence {}

impl PartialOrd for PreemptedSequence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PreemptedSequence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key.cmp(&other.sort_key)
    }
}

struct BestEffortState {
    max_scheduled: usize,
    num_scheduled: usize,
    preempted: BinaryHeap<PreemptedSequence>,
}

/// Global task accounting shared by every pool and runner of a scheduler.
pub struct TaskTracker {
    label: String,
    state: TrackerState,
    shutdown_complete: AtomicBool,
    num_incomplete_undelayed_tasks: AtomicUsize,
    num_tasks_run: AtomicU64,
    num_block_shutdown_tasks_posted_during_shutdown: AtomicU64,
    shutdown_lock: CheckedLock<ShutdownControl>,
    shutdown_cv: CheckedCondvar,
    flush_lock: CheckedLock<FlushState>,
    flush_cv: CheckedCondvar,
    best_effort_lock: CheckedLock<BestEffortState>,
}

impl TaskTracker {
    /// Creates a tracker for a scheduler labeled `label`.
    pub fn new(label: impl Into<String>) -> Self {
        let shutdown_lock = CheckedLock::new(ShutdownControl {
            shutdown_requested: false,
        });
        let flush_lock = CheckedLock::with_predecessor(
            FlushState {
                flush_callback: None,
            },
            shutdown_lock.id(),
        );
        Self {
            label: label.into(),
            state: TrackerState::new(),
            shutdown_complete: AtomicBool::new(false),
            num_incomplete_undelayed_tasks: AtomicUsize::new(0),
            num_tasks_run: AtomicU64::new(0),
            num_block_shutdown_tasks_posted_during_shutdown: AtomicU64::new(0),
            shutdown_lock,
            shutdown_cv: CheckedCondvar::new(),
            flush_lock,
            flush_cv: CheckedCondvar::new(),
            best_effort_lock: CheckedLock::new(BestEffortState {
                max_scheduled: usize::MAX,
                num_scheduled: 0,
                preempted: BinaryHeap::new(),
            }),
        }
    }

    /// Scheduler label used in metric names.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Caps the number of best-effort sequences scheduled at once. Called
    /// before any pool starts.
    pub fn set_max_scheduled_best_effort_sequences(&self, max: usize) {
        self.best_effort_lock.lock().max_scheduled = max.max(1);
    }

    /// Admission gate. On success stamps the task's posted time and run
    /// counter snapshot and returns true; the task must then be scheduled or
    /// handed to the delayed-task manager.
    pub fn will_post_task(&self, task: &mut Task) -> bool {
        if !self.before_post_task(task.shutdown_behavior()) {
            return false;
        }
        task.set_posted_time(Instant::now());
        task.set_tasks_run_at_post(self.num_tasks_run.load(Ordering::Relaxed));
        if task.delay().is_zero() {
            self.num_incomplete_undelayed_tasks
                .fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    /// Scheduling gate for a sequence that just became non-empty.
    ///
    /// Non-best-effort sequences may always be scheduled immediately.
    /// Best-effort sequences count against the scheduled cap; past the cap
    /// they are parked in the preempted heap and `observer` is invoked once
    /// room opens.
    pub fn will_schedule_sequence(
        &self,
        sort_key: SequenceSortKey,
        sequence: &Arc<Sequence>,
        observer: &Arc<dyn CanScheduleSequenceObserver>,
    ) -> bool {
        if sort_key.priority() != TaskPriority::BestEffort {
            return true;
        }
        let mut best_effort = self.best_effort_lock.lock();
        if best_effort.num_scheduled < best_effort.max_scheduled {
            best_effort.num_scheduled += 1;
            true
        } else {
            best_effort.preempted.push(PreemptedSequence {
                sort_key,
                sequence: Arc::clone(sequence),
                observer: Arc::clone(observer),
            });
            false
        }
    }

    /// Runs (or skips) the front task of `sequence`, pops the executed slot,
    /// and returns the sequence if the caller should re-enqueue it
    /// immediately. Returns `None` when the sequence emptied or was preempted
    /// in favor of an older best-effort sequence.
    pub fn run_and_pop_next_task(
        &self,
        sequence: Arc<Sequence>,
        observer: &Arc<dyn CanScheduleSequenceObserver>,
    ) -> Option<Arc<Sequence>> {
        let mut task = sequence.begin_transaction().take_front_task();
        let shutdown_behavior = task.shutdown_behavior();
        let priority = task.traits().priority();
        let undelayed = task.delay().is_zero();

        let can_run = self.before_run_task(shutdown_behavior);
        self.run_or_skip_task(&mut task, &sequence, can_run);
        drop(task);
        if can_run {
            self.after_run_task(shutdown_behavior);
        }
        if undelayed {
            self.decrement_num_incomplete_undelayed_tasks();
        }

        let (result, to_schedule) = {
            let mut txn = sequence.begin_transaction();
            let now_empty = txn.pop_front_slot();
            if priority != TaskPriority::BestEffort {
                if now_empty {
                    (None, None)
                } else {
                    (Some(Arc::clone(&sequence)), None)
                }
            } else if now_empty {
                let mut best_effort = self.best_effort_lock.lock();
                match best_effort.preempted.pop() {
                    // The freed slot transfers to the preempted sequence.
                    Some(top) => (None, Some(top)),
                    None => {
                        best_effort.num_scheduled -= 1;
                        (None, None)
                    }
                }
            } else {
                let sort_key = txn.sort_key();
                let mut best_effort = self.best_effort_lock.lock();
                let top_is_more_deserving = best_effort
                    .preempted
                    .peek()
                    .is_some_and(|top| top.sort_key > sort_key);
                if top_is_more_deserving {
                    let top = best_effort.preempted.pop().unwrap();
                    best_effort.preempted.push(PreemptedSequence {
                        sort_key,
                        sequence: Arc::clone(&sequence),
                        observer: Arc::clone(observer),
                    });
                    (None, Some(top))
                } else {
                    (Some(Arc::clone(&sequence)), None)
                }
            }
        };

        if let Some(preempted) = to_schedule {
            preempted
                .observer
                .on_can_schedule_sequence(preempted.sequence);
        }
        result
    }

    /// Starts shutdown and blocks until every shutdown-blocking task posted
    /// before (or admitted during) shutdown has completed. Single-use.
    pub fn shutdown(&self) {
        {
            let mut control = self.shutdown_lock.lock();
            assert!(
                !control.shutdown_requested,
                "TaskTracker::shutdown called twice"
            );
            control.shutdown_requested = true;
            self.state.start_shutdown();
        }
        log::debug!("scheduler {}: shutdown started", self.label);

        // The best-effort cap no longer applies: preempted sequences must be
        // able to drain so queued BLOCK_SHUTDOWN work cannot stall shutdown.
        let parked = {
            let mut best_effort = self.best_effort_lock.lock();
            let parked: Vec<PreemptedSequence> = best_effort.preempted.drain().collect();
            best_effort.num_scheduled += parked.len();
            parked
        };
        for preempted in parked {
            preempted
                .observer
                .on_can_schedule_sequence(preempted.sequence);
        }

        {
            let mut control = self.shutdown_lock.lock();
            while self.state.num_tasks_blocking_shutdown() > 0 {
                control = self.shutdown_cv.wait(&self.shutdown_lock, control);
            }
            // Set while the lock is held so a concurrent BLOCK_SHUTDOWN post
            // cannot be admitted past the completed gate.
            self.shutdown_complete.store(true, Ordering::SeqCst);
        }

        histogram::record_count(
            "NumBlockShutdownTasksPostedDuringShutdown",
            self.num_block_shutdown_tasks_posted_during_shutdown
                .load(Ordering::Relaxed),
        );
        log::debug!("scheduler {}: shutdown complete", self.label);

        // Flush waiters give up once shutdown completes.
        let callback = {
            let mut flush = self.flush_lock.lock();
            self.flush_cv.notify_all();
            flush.flush_callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Blocks until all undelayed tasks have completed or shutdown completes.
    pub fn flush_for_testing(&self) {
        let mut flush = self.flush_lock.lock();
        while self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst) != 0
            && !self.is_shutdown_complete()
        {
            flush = self.flush_cv.wait(&self.flush_lock, flush);
        }
    }

    /// Invokes `callback` once all undelayed tasks have completed or shutdown
    /// completes. Only one async flush may be in flight.
    pub fn flush_async_for_testing(&self, callback: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut flush = self.flush_lock.lock();
            if self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst) == 0
                || self.is_shutdown_complete()
            {
                true
            } else {
                assert!(
                    flush.flush_callback.is_none(),
                    "only one async flush may be in flight"
                );
                flush.flush_callback = Some(callback);
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Whether shutdown has started.
    pub fn has_shutdown_started(&self) -> bool {
        self.state.has_shutdown_started()
    }

    /// Whether shutdown has completed.
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::SeqCst)
    }

    /// Current number of tasks blocking shutdown (tests only).
    pub fn num_tasks_blocking_shutdown_for_testing(&self) -> usize {
        self.state.num_tasks_blocking_shutdown()
    }

    /// Current number of incomplete undelayed tasks (tests only).
    pub fn num_incomplete_undelayed_tasks_for_testing(&self) -> usize {
        self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst)
    }

    fn before_post_task(&self, shutdown_behavior: ShutdownBehavior) -> bool {
        if shutdown_behavior == ShutdownBehavior::BlockShutdown {
            let shutdown_started = self.state.increment_num_tasks_blocking_shutdown();
            if shutdown_started {
                // A BLOCK_SHUTDOWN task posted while shutdown is in progress
                // is admitted unless shutdown already completed.
                let control = self.shutdown_lock.lock();
                debug_assert!(control.shutdown_requested);
                if self.is_shutdown_complete() {
                    drop(control);
                    let (started, count) =
                        self.state.decrement_num_tasks_blocking_shutdown();
                    debug_assert!(started);
                    let _ = count;
                    return false;
                }
                self.num_block_shutdown_tasks_posted_during_shutdown
                    .fetch_add(1, Ordering::Relaxed);
            }
            return true;
        }
        !self.state.has_shutdown_started()
    }

    fn before_run_task(&self, shutdown_behavior: ShutdownBehavior) -> bool {
        match shutdown_behavior {
            ShutdownBehavior::BlockShutdown => {
                debug_assert!(self.state.num_tasks_blocking_shutdown() > 0);
                true
            }
            ShutdownBehavior::SkipOnShutdown => {
                // A running SKIP_ON_SHUTDOWN task blocks shutdown for its
                // duration; one that has not started when shutdown begins is
                // skipped.
                let shutdown_started = self.state.increment_num_tasks_blocking_shutdown();
                if shutdown_started {
                    let (started, count) =
                        self.state.decrement_num_tasks_blocking_shutdown();
                    if started && count == 0 {
                        self.on_blocking_shutdown_tasks_complete();
                    }
                    return false;
                }
                true
            }
            ShutdownBehavior::ContinueOnShutdown => !self.is_shutdown_complete(),
        }
    }

    fn after_run_task(&self, shutdown_behavior: ShutdownBehavior) {
        match shutdown_behavior {
            ShutdownBehavior::BlockShutdown | ShutdownBehavior::SkipOnShutdown => {
                let (started, count) = self.state.decrement_num_tasks_blocking_shutdown();
                if started && count == 0 {
                    self.on_blocking_shutdown_tasks_complete();
                }
            }
            ShutdownBehavior::ContinueOnShutdown => {}
        }
    }

    fn on_blocking_shutdown_tasks_complete(&self) {
        let _control = self.shutdown_lock.lock();
        self.shutdown_cv.notify_all();
    }

    fn run_or_skip_task(&self, task: &mut Task, sequence: &Sequence, can_run: bool) {
        if !can_run {
            return;
        }
        let traits = task.traits();
        let _context =
            ScopedTaskContext::new(sequence.token().as_u64(), traits.priority());

        let suffix = if traits.may_block() { ".MayBlock" } else { "" };
        if let Some(posted_time) = task.posted_time() {
            histogram::record_time(
                &format!(
                    "TaskLatency.{}.{}{}",
                    self.label,
                    traits.priority(),
                    suffix
                ),
                posted_time.elapsed(),
            );
        }
        let tasks_run_now = self.num_tasks_run.load(Ordering::Relaxed);
        histogram::record_count(
            &format!(
                "NumTasksRunWhileQueuing.{}.{}{}",
                self.label,
                traits.priority(),
                suffix
            ),
            tasks_run_now.saturating_sub(task.tasks_run_at_post()),
        );

        let closure = task.take_closure().expect("task closure already taken");
        let posted_from = task.posted_from();
        if panic::catch_unwind(AssertUnwindSafe(closure)).is_err() {
            log::error!("task posted from {posted_from} panicked");
        }
        self.num_tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_num_incomplete_undelayed_tasks(&self) {
        let prev = self
            .num_incomplete_undelayed_tasks
            .fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "undelayed-task underflow");
        if prev == 1 {
            let callback = {
                let mut flush = self.flush_lock.lock();
                self.flush_cv.notify_all();
                flush.flush_callback.take()
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task_traits::TaskTraits;
    use std::panic::Location;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingObserver {
        scheduled: Mutex<Vec<Arc<Sequence>>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scheduled: Mutex::new(Vec::new()),
            })
        }

        fn scheduled_count(&self) -> usize {
            self.scheduled.lock().unwrap().len()
        }
    }

    impl CanScheduleSequenceObserver for RecordingObserver {
        fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
            self.scheduled.lock().unwrap().push(sequence);
        }
    }

    fn observer_arc(observer: &Arc<RecordingObserver>) -> Arc<dyn CanScheduleSequenceObserver> {
        Arc::clone(observer) as Arc<dyn CanScheduleSequenceObserver>
    }

    fn make_task(behavior: ShutdownBehavior, delay: Duration) -> Task {
        Task::new(
            Location::caller(),
            Box::new(|| {}),
            TaskTraits::new().with_shutdown_behavior(behavior),
            delay,
        )
    }

    fn best_effort_sequence_with_task(tracker: &TaskTracker) -> Arc<Sequence> {
        let traits = TaskTraits::new().with_priority(TaskPriority::BestEffort);
        let sequence = Arc::new(Sequence::new(traits));
        let mut task = Task::new(Location::caller(), Box::new(|| {}), traits, Duration::ZERO);
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);
        sequence
    }

    #[test]
    fn test_will_post_task_stamps_metadata() {
        let tracker = TaskTracker::new("PostStamps");
        let mut task = make_task(ShutdownBehavior::SkipOnShutdown, Duration::ZERO);
        assert!(tracker.will_post_task(&mut task));
        assert!(task.posted_time().is_some());
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 1);
    }

    #[test]
    fn test_delayed_task_not_counted_for_flush() {
        let tracker = TaskTracker::new("DelayedFlush");
        let mut task = make_task(ShutdownBehavior::SkipOnShutdown, Duration::from_secs(1));
        assert!(tracker.will_post_task(&mut task));
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 0);
    }

    #[test]
    fn test_block_shutdown_post_increments_counter() {
        let tracker = TaskTracker::new("BlockCounter");
        let mut task = make_task(ShutdownBehavior::BlockShutdown, Duration::ZERO);
        assert!(tracker.will_post_task(&mut task));
        assert_eq!(tracker.num_tasks_blocking_shutdown_for_testing(), 1);
    }

    #[test]
    fn test_post_after_shutdown_started() {
        let tracker = Arc::new(TaskTracker::new("PostAfterShutdown"));
        tracker.shutdown();

        let mut skip = make_task(ShutdownBehavior::SkipOnShutdown, Duration::ZERO);
        assert!(!tracker.will_post_task(&mut skip));
        let mut cont = make_task(ShutdownBehavior::ContinueOnShutdown, Duration::ZERO);
        assert!(!tracker.will_post_task(&mut cont));
        // BLOCK_SHUTDOWN is refused only once shutdown has *completed*,
        // which it has here (no tasks were in flight).
        let mut block = make_task(ShutdownBehavior::BlockShutdown, Duration::ZERO);
        assert!(!tracker.will_post_task(&mut block));
    }

    #[test]
    fn test_run_and_pop_leaves_remaining_tasks() {
        let tracker = TaskTracker::new("RunAndPop");
        let observer = RecordingObserver::new();
        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        for _ in 0..3 {
            let mut task = make_task(ShutdownBehavior::SkipOnShutdown, Duration::ZERO);
            assert!(tracker.will_post_task(&mut task));
            sequence.begin_transaction().push_task(task);
        }

        let returned =
            tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        assert!(returned.is_some());
        assert_eq!(sequence.begin_transaction().len(), 2);

        tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        let last =
            tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        assert!(last.is_none());
        assert!(sequence.begin_transaction().is_empty());
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 0);
    }

    #[test]
    fn test_skipped_task_does_not_run_but_is_popped() {
        let tracker = TaskTracker::new("SkipPops");
        let observer = RecordingObserver::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        let mut task = Task::new(
            Location::caller(),
            Box::new(move || ran_clone.store(true, Ordering::SeqCst)),
            TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::SkipOnShutdown),
            Duration::ZERO,
        );
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);

        tracker.shutdown();
        let result =
            tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        assert!(result.is_none());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(sequence.begin_transaction().is_empty());
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 0);
    }

    #[test]
    fn test_panicking_task_keeps_counters_balanced() {
        let tracker = TaskTracker::new("PanicBalance");
        let observer = RecordingObserver::new();
        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        let mut task = Task::new(
            Location::caller(),
            Box::new(|| panic!("task failure")),
            TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown),
            Duration::ZERO,
        );
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);

        tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        assert_eq!(tracker.num_tasks_blocking_shutdown_for_testing(), 0);
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 0);
        // Shutdown must not hang on the balanced counter.
        tracker.shutdown();
    }

    #[test]
    fn test_best_effort_cap_parks_excess_sequences() {
        let tracker = TaskTracker::new("BestEffortCap");
        tracker.set_max_scheduled_best_effort_sequences(1);
        let observer = RecordingObserver::new();

        let first = best_effort_sequence_with_task(&tracker);
        let second = best_effort_sequence_with_task(&tracker);

        let first_key = first.begin_transaction().sort_key();
        let second_key = second.begin_transaction().sort_key();
        assert!(tracker.will_schedule_sequence(first_key, &first, &observer_arc(&observer)));
        assert!(!tracker.will_schedule_sequence(second_key, &second, &observer_arc(&observer)));
        assert_eq!(observer.scheduled_count(), 0);

        // Draining the first sequence hands its slot to the parked one.
        let result = tracker.run_and_pop_next_task(Arc::clone(&first), &observer_arc(&observer));
        assert!(result.is_none());
        assert_eq!(observer.scheduled_count(), 1);
        assert!(Arc::ptr_eq(
            &observer.scheduled.lock().unwrap()[0],
            &second
        ));
    }

    #[test]
    fn test_older_preempted_sequence_wins_over_rescheduling() {
        let tracker = TaskTracker::new("PreemptionOrder");
        tracker.set_max_scheduled_best_effort_sequences(1);
        let observer = RecordingObserver::new();

        // `running` is scheduled and has two tasks; `parked` arrives later
        // than the front of `running` but earlier than its second task.
        let running = best_effort_sequence_with_task(&tracker);
        std::thread::sleep(Duration::from_millis(2));
        let parked = best_effort_sequence_with_task(&tracker);
        std::thread::sleep(Duration::from_millis(2));
        {
            let traits = TaskTraits::new().with_priority(TaskPriority::BestEffort);
            let mut task =
                Task::new(Location::caller(), Box::new(|| {}), traits, Duration::ZERO);
            assert!(tracker.will_post_task(&mut task));
            running.begin_transaction().push_task(task);
        }

        let running_key = running.begin_transaction().sort_key();
        assert!(tracker.will_schedule_sequence(running_key, &running, &observer_arc(&observer)));
        let parked_key = parked.begin_transaction().sort_key();
        assert!(!tracker.will_schedule_sequence(parked_key, &parked, &observer_arc(&observer)));

        // After running the front task, the parked sequence is older than
        // the second task, so it preempts the running sequence.
        let result =
            tracker.run_and_pop_next_task(Arc::clone(&running), &observer_arc(&observer));
        assert!(result.is_none());
        assert_eq!(observer.scheduled_count(), 1);
        assert!(Arc::ptr_eq(&observer.scheduled.lock().unwrap()[0], &parked));

        // Running the parked sequence to empty hands the slot back.
        let result =
            tracker.run_and_pop_next_task(Arc::clone(&parked), &observer_arc(&observer));
        assert!(result.is_none());
        assert_eq!(observer.scheduled_count(), 2);
        assert!(Arc::ptr_eq(&observer.scheduled.lock().unwrap()[1], &running));
    }

    #[test]
    fn test_shutdown_waits_for_block_shutdown_task() {
        let tracker = Arc::new(TaskTracker::new("ShutdownWaits"));
        let observer = RecordingObserver::new();
        let sequence = Arc::new(Sequence::new(TaskTraits::new()));

        let mut task = Task::new(
            Location::caller(),
            Box::new(|| std::thread::sleep(Duration::from_millis(100))),
            TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown),
            Duration::ZERO,
        );
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);

        let tracker_clone = Arc::clone(&tracker);
        let seq_clone = Arc::clone(&sequence);
        let obs = observer_arc(&observer);
        let runner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tracker_clone.run_and_pop_next_task(seq_clone, &obs);
        });

        let start = Instant::now();
        tracker.shutdown();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(tracker.is_shutdown_complete());
        runner.join().unwrap();
    }

    #[test]
    fn test_flush_returns_when_tasks_complete() {
        let tracker = Arc::new(TaskTracker::new("FlushWaits"));
        let observer = RecordingObserver::new();
        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        let mut task = make_task(ShutdownBehavior::SkipOnShutdown, Duration::ZERO);
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);

        let tracker_clone = Arc::clone(&tracker);
        let seq_clone = Arc::clone(&sequence);
        let obs = observer_arc(&observer);
        let runner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            tracker_clone.run_and_pop_next_task(seq_clone, &obs);
        });

        tracker.flush_for_testing();
        assert_eq!(tracker.num_incomplete_undelayed_tasks_for_testing(), 0);
        runner.join().unwrap();
    }

    #[test]
    fn test_flush_async_fires_on_completion() {
        let tracker = Arc::new(TaskTracker::new("FlushAsync"));
        let observer = RecordingObserver::new();
        let fired = Arc::new(AtomicBool::new(false));

        // With nothing pending the callback fires immediately.
        let fired_clone = Arc::clone(&fired);
        tracker.flush_async_for_testing(Box::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        assert!(fired.load(Ordering::SeqCst));

        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        let mut task = make_task(ShutdownBehavior::SkipOnShutdown, Duration::ZERO);
        assert!(tracker.will_post_task(&mut task));
        sequence.begin_transaction().push_task(task);

        fired.store(false, Ordering::SeqCst);
        let fired_clone = Arc::clone(&fired);
        tracker.flush_async_for_testing(Box::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        assert!(!fired.load(Ordering::SeqCst));

        tracker.run_and_pop_next_task(Arc::clone(&sequence), &observer_arc(&observer));
        assert!(fired.load(Ordering::SeqCst));
    }
}
