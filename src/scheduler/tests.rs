//! Pool-level tests exercising real workers.

use super::blocking::{BlockingType, ScopedBlockingCall};
use super::delayed::DelayedTaskManager;
use super::environment::{ENVIRONMENT_PARAMS, WorkerPoolParams};
use super::runner::{ParallelTaskRunner, SequencedTaskRunner, TaskRunner};
use super::service_thread::ServiceThread;
use super::task_tracker::TaskTracker;
use super::worker_pool::WorkerPool;
use crate::from_here;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::time::{Duration, Instant};

struct PoolFixture {
    tracker: Arc<TaskTracker>,
    pool: Arc<WorkerPool>,
    service_thread: ServiceThread,
}

impl PoolFixture {
    fn new(label: &str, max_threads: usize) -> Self {
        Self::with_options(label, max_threads, Duration::from_secs(30), Duration::from_millis(10))
    }

    fn with_options(
        label: &str,
        max_threads: usize,
        reclaim_time: Duration,
        may_block_threshold: Duration,
    ) -> Self {
        let tracker = Arc::new(TaskTracker::new(label));
        let delayed = Arc::new(DelayedTaskManager::new());
        let service_thread = ServiceThread::start(label).unwrap();
        delayed.start(service_thread.task_runner());
        let pool = WorkerPool::new(
            label,
            ENVIRONMENT_PARAMS[0],
            Arc::clone(&tracker),
            delayed,
            Arc::new(RwLock::new(None)),
        );
        pool.start(
            WorkerPoolParams::new(max_threads, reclaim_time),
            service_thread.task_runner(),
            may_block_threshold,
        )
        .unwrap();
        Self {
            tracker,
            pool,
            service_thread,
        }
    }

    fn join(mut self) {
        self.service_thread.stop();
        self.pool.join_for_testing();
    }
}

#[test]
fn test_pool_runs_posted_tasks() {
    let fixture = PoolFixture::new("RunsPosted", 4);
    let runner = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let count = Arc::clone(&count);
        assert!(runner.post(
            from_here!(),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        ));
    }
    fixture.tracker.flush_for_testing();
    assert_eq!(count.load(Ordering::SeqCst), 32);
    fixture.join();
}

#[test]
fn test_sequenced_tasks_run_in_post_order() {
    let fixture = PoolFixture::new("SequencedOrder", 4);
    let runner = SequencedTaskRunner::new(Default::default(), &fixture.pool);
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let log = Arc::clone(&log);
        assert!(runner.post(
            from_here!(),
            Box::new(move || {
                log.lock().unwrap().push(i);
            })
        ));
    }
    fixture.tracker.flush_for_testing();
    let log = log.lock().unwrap();
    assert_eq!(*log, (0..100).collect::<Vec<_>>());
    fixture.join();
}

#[test]
fn test_parallel_tasks_can_overlap() {
    let fixture = PoolFixture::new("ParallelOverlap", 4);
    let runner = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let barrier = Arc::new(Barrier::new(4));

    // All four tasks must be in flight at once to pass the barrier.
    for _ in 0..4 {
        let barrier = Arc::clone(&barrier);
        assert!(runner.post(
            from_here!(),
            Box::new(move || {
                barrier.wait();
            })
        ));
    }
    fixture.tracker.flush_for_testing();
    fixture.join();
}

#[test]
fn test_runs_tasks_in_current_sequence_from_worker() {
    let fixture = PoolFixture::new("CurrentSequence", 2);
    let runner = SequencedTaskRunner::new(Default::default(), &fixture.pool);
    let parallel = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let results = Arc::new(Mutex::new(Vec::new()));

    assert!(!runner.runs_tasks_in_current_sequence());

    let results_clone = Arc::clone(&results);
    let runner_clone = Arc::clone(&runner);
    let parallel_clone = Arc::clone(&parallel);
    runner.post(
        from_here!(),
        Box::new(move || {
            results_clone.lock().unwrap().push((
                runner_clone.runs_tasks_in_current_sequence(),
                parallel_clone.runs_tasks_in_current_sequence(),
            ));
        }),
    );
    fixture.tracker.flush_for_testing();

    // Inside the task: same sequence and same pool.
    assert_eq!(*results.lock().unwrap(), vec![(true, true)]);
    fixture.join();
}

#[test]
fn test_will_block_scope_grows_and_shrinks_max_tasks() {
    let fixture = PoolFixture::new("WillBlockGrows", 2);
    let runner = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let pool = Arc::clone(&fixture.pool);
    let observed = Arc::new(Mutex::new((0usize, 0usize)));

    let observed_clone = Arc::clone(&observed);
    runner.post(
        from_here!(),
        Box::new(move || {
            let during = {
                let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
                pool.max_tasks_for_testing()
            };
            let after = pool.max_tasks_for_testing();
            *observed_clone.lock().unwrap() = (during, after);
        }),
    );
    fixture.tracker.flush_for_testing();

    let (during, after) = *observed.lock().unwrap();
    assert_eq!(during, 3);
    assert_eq!(after, 2);
    fixture.join();
}

#[test]
fn test_may_block_grows_capacity_past_saturation() {
    // max_threads=2, but four tasks sit in MAY_BLOCK regions waiting on one
    // barrier: the pool must grow to let all four in.
    let fixture = PoolFixture::with_options(
        "MayBlockGrows",
        2,
        Duration::from_secs(30),
        Duration::from_millis(1),
    );
    let runner = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let barrier = Arc::new(Barrier::new(4));

    for _ in 0..4 {
        let barrier = Arc::clone(&barrier);
        assert!(runner.post(
            from_here!(),
            Box::new(move || {
                let _blocking = ScopedBlockingCall::new(BlockingType::MayBlock);
                barrier.wait();
            })
        ));
    }
    fixture.tracker.flush_for_testing();

    // Capacity returned to its initial value once the scopes ended.
    assert_eq!(fixture.pool.max_tasks_for_testing(), 2);
    fixture.join();
}

#[test]
fn test_idle_workers_are_reclaimed() {
    let fixture = PoolFixture::with_options(
        "IdleReclaim",
        4,
        Duration::from_millis(50),
        Duration::from_millis(10),
    );
    let runner = ParallelTaskRunner::new(Default::default(), &fixture.pool);
    let barrier = Arc::new(Barrier::new(4));

    for _ in 0..4 {
        let barrier = Arc::clone(&barrier);
        runner.post(
            from_here!(),
            Box::new(move || {
                barrier.wait();
            }),
        );
    }
    fixture.tracker.flush_for_testing();
    assert!(fixture.pool.num_workers_for_testing() >= 2);

    // Workers idling past the reclaim time clean up down to one.
    let deadline = Instant::now() + Duration::from_secs(10);
    while fixture.pool.num_workers_for_testing() > 1 {
        assert!(
            Instant::now() < deadline,
            "idle workers were not reclaimed: {} left",
            fixture.pool.num_workers_for_testing()
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    fixture.join();
}

#[test]
fn test_posts_before_start_run_at_start() {
    let tracker = Arc::new(TaskTracker::new("PostBeforeStart"));
    let delayed = Arc::new(DelayedTaskManager::new());
    let pool = WorkerPool::new(
        "PostBeforeStart",
        ENVIRONMENT_PARAMS[0],
        Arc::clone(&tracker),
        Arc::clone(&delayed),
        Arc::new(RwLock::new(None)),
    );
    let runner = ParallelTaskRunner::new(Default::default(), &pool);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let count = Arc::clone(&count);
        assert!(runner.post(
            from_here!(),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        ));
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let mut service_thread = ServiceThread::start("PostBeforeStart").unwrap();
    delayed.start(service_thread.task_runner());
    pool.start(
        WorkerPoolParams::new(4, Duration::from_secs(30)),
        service_thread.task_runner(),
        Duration::from_millis(10),
    )
    .unwrap();

    tracker.flush_for_testing();
    assert_eq!(count.load(Ordering::SeqCst), 3);
    service_thread.stop();
    pool.join_for_testing();
}

#[test]
fn test_pool_start_twice_is_rejected() {
    let fixture = PoolFixture::new("StartTwice", 2);
    let err = fixture
        .pool
        .start(
            WorkerPoolParams::new(2, Duration::from_secs(30)),
            fixture.service_thread.task_runner(),
            Duration::from_millis(10),
        )
        .unwrap_err();
    assert!(err.to_string().contains("started twice"));
    fixture.join();
}

#[test]
fn test_join_drains_unrun_sequences() {
    // A pool that never starts keeps posted work queued; join must drop it
    // without leaking the task -> runner cycle.
    let tracker = Arc::new(TaskTracker::new("JoinDrains"));
    let delayed = Arc::new(DelayedTaskManager::new());
    let pool = WorkerPool::new(
        "JoinDrains",
        ENVIRONMENT_PARAMS[0],
        tracker,
        delayed,
        Arc::new(RwLock::new(None)),
    );
    let runner = SequencedTaskRunner::new(Default::default(), &pool);
    assert!(runner.post(from_here!(), Box::new(|| {})));
    pool.join_for_testing();
}
