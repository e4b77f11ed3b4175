//! End-to-end scheduler behavior: dispatch order, thread pinning, and the
//! caller-as-worker stop protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use weft::{Fiber, FiberState, Schedule, ScheduleTask, Scheduler};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Two fibers interleave on a single worker: each increments, reschedules
/// itself, yields, and increments again.
#[test]
fn two_fibers_share_one_worker() {
    init_tracing();
    let scheduler = Scheduler::new(1, false, "pair");
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let spawn = |counter: Arc<AtomicUsize>| {
        Fiber::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let me = Fiber::current();
                Scheduler::current()
                    .expect("running on a worker")
                    .schedule_task(ScheduleTask::fiber(me));
                Fiber::yield_now();
                counter.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
    };
    let a = spawn(counter.clone());
    let b = spawn(counter.clone());
    scheduler.schedule_task(ScheduleTask::fiber(a.clone()));
    scheduler.schedule_task(ScheduleTask::fiber(b.clone()));

    wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 4);
    wait_until(Duration::from_secs(5), || {
        a.state() == FiberState::Term && b.state() == FiberState::Term
    });
    scheduler.stop();
}

/// A pinned task only runs on its worker; unpinned tasks flow around it.
#[test]
fn pinned_task_runs_on_its_thread() {
    init_tracing();
    let scheduler = Scheduler::new(3, false, "pinned");
    scheduler.start();
    let workers = scheduler.thread_ids();
    assert_eq!(workers.len(), 3);
    let target = workers[2];

    let observed: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    let seen = observed.clone();
    scheduler.schedule_task(
        ScheduleTask::call(move || {
            *seen.lock().unwrap() = Some(thread::current().id());
        })
        .pinned_to(target),
    );

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let done = done.clone();
        scheduler.schedule_fn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 20);
    wait_until(Duration::from_secs(5), || observed.lock().unwrap().is_some());
    assert_eq!(observed.lock().unwrap().expect("pinned task ran"), target);
    scheduler.stop();
}

/// Tasks queued before `start` run once the pool comes up.
#[test]
fn schedule_before_start() {
    init_tracing();
    let scheduler = Scheduler::new(2, false, "early");
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let counter = counter.clone();
        scheduler.schedule_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.start();
    wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 4);
    scheduler.stop();
}

/// With `use_caller`, `stop` drains remaining tasks on the constructing
/// thread before joining the pool.
#[test]
fn use_caller_drains_on_stop() {
    init_tracing();
    let scheduler = Scheduler::new(2, true, "caller");
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let counter = counter.clone();
        scheduler.schedule_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

/// A caller-only scheduler (no spawned threads) runs everything during the
/// stop drain.
#[test]
fn caller_only_scheduler() {
    init_tracing();
    let scheduler = Scheduler::new(1, true, "solo");
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..3u32 {
        let counter = counter.clone();
        let order = order.clone();
        scheduler.schedule_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            order.lock().unwrap().push(tag);
        });
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    scheduler.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    // Single worker: FIFO dispatch is observable as program order.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

/// A fiber that terminated while queued is dropped, not resumed.
#[test]
fn term_fiber_task_is_dropped() {
    init_tracing();
    let scheduler = Scheduler::new(1, false, "term");
    scheduler.start();

    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    let fiber = Fiber::new(
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        0,
        true,
    );
    // Run it to completion outside the queue first.
    scheduler.schedule_task(ScheduleTask::fiber(fiber.clone()));
    wait_until(Duration::from_secs(5), || fiber.state() == FiberState::Term);

    // Re-queueing the terminated fiber is a silent no-op.
    scheduler.schedule_task(ScheduleTask::fiber(fiber.clone()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    scheduler.stop();
}
