//! Metric emission and delayed-task behavior over the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use taskloom::utils::histogram;
use taskloom::{
    InitParams, Scheduler, ShutdownBehavior, TaskRunner, TaskTraits, WorkerPoolParams, from_here,
};

fn params_without_heartbeat() -> InitParams {
    let reclaim = Duration::from_secs(30);
    InitParams::new(
        WorkerPoolParams::new(2, reclaim),
        WorkerPoolParams::new(2, reclaim),
        WorkerPoolParams::new(4, reclaim),
        WorkerPoolParams::new(4, reclaim),
    )
    .with_heartbeat_interval(None)
}

#[test]
fn test_task_latency_histogram_is_recorded() {
    let scheduler = Scheduler::create("LatencyMetrics");
    scheduler.start(params_without_heartbeat()).unwrap();

    let runner = scheduler.create_sequenced_task_runner(TaskTraits::new());
    let (tx, rx) = mpsc::channel();
    runner.post(
        from_here!(),
        Box::new(move || {
            tx.send(()).unwrap();
        }),
    );
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    scheduler.flush_for_testing();

    let latency = histogram::snapshot("TaskLatency.LatencyMetrics.UserVisible").unwrap();
    assert!(latency.count >= 1);
    let queuing =
        histogram::snapshot("NumTasksRunWhileQueuing.LatencyMetrics.UserVisible").unwrap();
    assert!(queuing.count >= 1);

    scheduler.shutdown();
    scheduler.join_for_testing();
}

#[test]
fn test_may_block_metric_suffix() {
    let scheduler = Scheduler::create("MayBlockMetrics");
    scheduler.start(params_without_heartbeat()).unwrap();

    let runner = scheduler.create_parallel_task_runner(TaskTraits::new().with_may_block());
    let (tx, rx) = mpsc::channel();
    runner.post(
        from_here!(),
        Box::new(move || {
            tx.send(()).unwrap();
        }),
    );
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    scheduler.flush_for_testing();

    let latency =
        histogram::snapshot("TaskLatency.MayBlockMetrics.UserVisible.MayBlock").unwrap();
    assert!(latency.count >= 1);

    scheduler.shutdown();
    scheduler.join_for_testing();
}

#[test]
fn test_heartbeat_probes_record_latency_and_worker_counts() {
    let scheduler = Scheduler::create("HeartbeatMetrics");
    scheduler
        .start(
            params_without_heartbeat().with_heartbeat_interval(Some(Duration::from_millis(50))),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let beat = histogram::snapshot("HeartbeatLatency.HeartbeatMetrics.UserVisible");
        let workers = histogram::snapshot("NumWorkers.HeartbeatMetrics.Foreground");
        if beat.is_some_and(|data| data.count >= 1)
            && workers.is_some_and(|data| data.count >= 1)
        {
            break;
        }
        assert!(Instant::now() < deadline, "heartbeat metrics never showed up");
        std::thread::sleep(Duration::from_millis(20));
    }

    scheduler.shutdown();
    scheduler.join_for_testing();
}

#[test]
fn test_delayed_tasks_preserve_post_order_at_equal_ready_time() {
    let scheduler = Scheduler::create("DelayedOrder");
    scheduler.start(params_without_heartbeat()).unwrap();

    // Same sequence, same delay: ready together, must run in post order.
    let runner = scheduler.create_sequenced_task_runner(TaskTraits::new());
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let log = Arc::clone(&log);
        let tx = tx.clone();
        assert!(runner.post_delayed(
            from_here!(),
            Box::new(move || {
                log.lock().unwrap().push(i);
                tx.send(()).unwrap();
            }),
            Duration::from_millis(30),
        ));
    }
    for _ in 0..5 {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    scheduler.shutdown();
    scheduler.join_for_testing();
}

#[test]
fn test_delayed_block_shutdown_does_not_block_shutdown() {
    let scheduler = Scheduler::create("DelayedDemotion");
    scheduler.start(params_without_heartbeat()).unwrap();

    let runner = scheduler.create_parallel_task_runner(
        TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown),
    );
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    assert!(runner.post_delayed(
        from_here!(),
        Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }),
        Duration::from_secs(30),
    ));

    // The delayed task was demoted to SKIP_ON_SHUTDOWN at post time, so
    // shutdown returns without waiting out the 30 s delay.
    let before = Instant::now();
    scheduler.shutdown();
    assert!(before.elapsed() < Duration::from_secs(5));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    scheduler.join_for_testing();
}

#[test]
fn test_undelayed_block_shutdown_posted_during_shutdown_is_admitted() {
    let scheduler = Scheduler::create("PostDuringShutdown");
    scheduler.start(params_without_heartbeat()).unwrap();

    let runner = scheduler.create_parallel_task_runner(
        TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown),
    );
    let nested_ran = Arc::new(AtomicUsize::new(0));

    // The outer task runs while shutdown waits; its nested BLOCK_SHUTDOWN
    // post must be admitted and completed before shutdown returns.
    let nested_clone = Arc::clone(&nested_ran);
    let runner_clone = Arc::clone(&runner);
    assert!(runner.post(
        from_here!(),
        Box::new(move || {
            std::thread::sleep(Duration::from_millis(100));
            let nested = Arc::clone(&nested_clone);
            assert!(runner_clone.post(
                from_here!(),
                Box::new(move || {
                    nested.fetch_add(1, Ordering::SeqCst);
                })
            ));
        })
    ));

    std::thread::sleep(Duration::from_millis(20));
    scheduler.shutdown();
    assert_eq!(nested_ran.load(Ordering::SeqCst), 1);

    scheduler.join_for_testing();
}
