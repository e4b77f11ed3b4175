//! The fiber scheduler: a worker pool draining a shared FIFO task queue.
//!
//! A [`Scheduler`] owns `worker_count` workers, each an OS thread (or, with
//! `use_caller`, the constructing thread acting through a dedicated
//! scheduler fiber). Workers pull [`ScheduleTask`]s in FIFO order, resume
//! their fibers, and fall back to the `idle` hook when the queue is empty.
//!
//! The [`Schedule`] trait carries the overridable hooks (`tickle`, `idle`,
//! `stopping`); the I/O reactor overrides them to park workers on the OS
//! readiness interface instead of a nap.

mod worker;

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;

use crate::fiber::{Fiber, FiberState};

/// A boxed callable schedulable as a task.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// How long the base `idle` hook naps between queue checks.
const IDLE_NAP: Duration = Duration::from_millis(10);

pub(crate) enum TaskPayload {
    /// An existing fiber to resume.
    Fiber(Arc<Fiber>),
    /// A callable to wrap in a fresh fiber at dispatch time.
    Call(TaskFn),
}

/// A unit of work waiting in the scheduler queue.
///
/// Consumed exactly once by one worker. An unpinned task (`target: None`)
/// runs on whichever worker dequeues it first; a pinned task is skipped by
/// non-matching workers but keeps its place in the FIFO.
pub struct ScheduleTask {
    pub(crate) payload: TaskPayload,
    pub(crate) target: Option<ThreadId>,
}

impl ScheduleTask {
    /// A task resuming an existing fiber.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        ScheduleTask { payload: TaskPayload::Fiber(fiber), target: None }
    }

    /// A task running a callable inside a fresh fiber.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        ScheduleTask { payload: TaskPayload::Call(Box::new(f)), target: None }
    }

    /// Restricts the task to the worker with the given thread id.
    pub fn pinned_to(mut self, thread: ThreadId) -> Self {
        self.target = Some(thread);
        self
    }
}

impl From<Arc<Fiber>> for ScheduleTask {
    fn from(fiber: Arc<Fiber>) -> Self {
        ScheduleTask::fiber(fiber)
    }
}

thread_local! {
    /// The scheduler driving the current thread, set for the lifetime of a
    /// worker loop (and on the caller thread of a `use_caller` scheduler).
    static CURRENT_SCHEDULER: RefCell<Option<Arc<dyn Schedule>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(s: Option<Arc<dyn Schedule>>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = s);
}

/// Shared scheduler state: the queue, the pool, and the counters the
/// stop protocol reads.
pub struct Scheduler {
    name: String,
    /// OS threads this scheduler spawns; excludes the caller slot.
    spawn_count: usize,
    use_caller: bool,
    queue: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<ThreadId>>,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    stop_flag: AtomicBool,
    caller_thread: OnceLock<ThreadId>,
    /// The caller thread's scheduler fiber; resumed by `stop` to drain.
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Creates a scheduler with `worker_count` workers.
    ///
    /// With `use_caller`, one worker slot is the constructing thread: a
    /// scheduler fiber is set up on it now and resumed during
    /// [`Schedule::stop`] to drain the queue. Call [`Schedule::start`] to
    /// spawn the pool.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero, or if `use_caller` is set on a
    /// thread that already hosts a scheduler.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let this = Arc::new(Scheduler::build(worker_count, use_caller, name));
        if use_caller {
            caller_init(&(this.clone() as Arc<dyn Schedule>));
        }
        this
    }

    pub(crate) fn build(worker_count: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(worker_count > 0, "scheduler needs at least one worker");
        let spawn_count = if use_caller { worker_count - 1 } else { worker_count };
        Scheduler {
            name: name.to_owned(),
            spawn_count,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            caller_thread: OnceLock::new(),
            caller_fiber: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread ids of every worker, including the caller when `use_caller`.
    /// Usable as pin targets for [`ScheduleTask::pinned_to`].
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    /// The scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<dyn Schedule>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
            && self.active_workers.load(Ordering::Acquire) == 0
            && self.queue.lock().is_empty()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }
}

/// The scheduler interface with its overridable hooks.
///
/// `tickle`, `idle`, and `stopping` are the three points a composed runtime
/// replaces: the base scheduler has no parked workers so `tickle` is a
/// no-op and `idle` naps; the I/O reactor parks workers on readiness and
/// wakes them through its self-pipe.
pub trait Schedule: Send + Sync + 'static {
    /// The shared scheduler state.
    fn base(&self) -> &Scheduler;

    /// Wakes a sleeping worker. No-op in the base scheduler.
    fn tickle(&self) {}

    /// Runs on each worker's idle fiber whenever the queue is empty.
    /// Must yield regularly and return once `stopping()` holds.
    fn idle(&self) {
        while !self.stopping() {
            thread::sleep(IDLE_NAP);
            Fiber::yield_now();
        }
    }

    /// Whether workers may shut down: stop requested, queue drained, and
    /// no worker mid-task.
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Upcast for thread-local recovery of the concrete scheduler type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Enqueues a task; wakes a worker if the queue was empty.
    fn schedule_task(&self, task: ScheduleTask) {
        counter!("weft_tasks_scheduled_total").increment(1);
        let was_empty = {
            let mut queue = self.base().queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            gauge!("weft_task_queue_depth").set(queue.len() as f64);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Enqueues a fiber or prebuilt task.
    fn schedule(&self, task: impl Into<ScheduleTask>)
    where
        Self: Sized,
    {
        self.schedule_task(task.into());
    }

    /// Enqueues a callable to run inside a fresh fiber.
    fn schedule_fn(&self, f: impl FnOnce() + Send + 'static)
    where
        Self: Sized,
    {
        self.schedule_task(ScheduleTask::call(f));
    }

    /// Spawns the worker threads. Does nothing if already started; logs an
    /// error if the scheduler is already stopping.
    fn start(self: &Arc<Self>)
    where
        Self: Sized,
    {
        start_workers(self.clone() as Arc<dyn Schedule>);
    }

    /// Stops the pool: raises the stop flag, tickles every worker, drains
    /// on the caller thread when `use_caller`, and joins all workers.
    ///
    /// # Panics
    ///
    /// A `use_caller` scheduler must be stopped from its constructing
    /// thread.
    fn stop(self: &Arc<Self>)
    where
        Self: Sized,
    {
        stop_scheduler(self.clone() as Arc<dyn Schedule>);
    }
}

impl Schedule for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Sets up the constructing thread as a worker: thread-local scheduler,
/// root fiber, and the scheduler fiber that `stop` resumes to drain.
pub(crate) fn caller_init(this: &Arc<dyn Schedule>) {
    assert!(
        Scheduler::current().is_none(),
        "this thread already hosts a scheduler"
    );
    set_current(Some(this.clone()));
    Fiber::current();

    let weak = Arc::downgrade(this);
    let drain = Fiber::new(
        move || {
            if let Some(scheduler) = weak.upgrade() {
                worker::run_loop(&scheduler);
            }
        },
        0,
        false,
    );
    Fiber::set_scheduler_fiber(&drain);

    let base = this.base();
    base.caller_thread
        .set(thread::current().id())
        .expect("caller slot already initialized");
    base.thread_ids.lock().push(thread::current().id());
    *base.caller_fiber.lock() = Some(drain);
}

pub(crate) fn start_workers(this: Arc<dyn Schedule>) {
    let base = this.base();
    if base.stop_requested() {
        tracing::error!(scheduler = %base.name, "start() called on a stopping scheduler");
        return;
    }
    let mut threads = base.threads.lock();
    if !threads.is_empty() {
        return;
    }
    for i in 0..base.spawn_count {
        let worker = this.clone();
        let handle = thread::Builder::new()
            .name(format!("{}_{}", base.name, i))
            .spawn(move || worker::worker_main(worker))
            .expect("failed to spawn worker thread");
        base.thread_ids.lock().push(handle.thread().id());
        threads.push(handle);
    }
    tracing::debug!(scheduler = %base.name, workers = base.spawn_count, "scheduler started");
}

pub(crate) fn stop_scheduler(this: Arc<dyn Schedule>) {
    if this.stopping() {
        return;
    }
    let base = this.base();
    base.stop_flag.store(true, Ordering::Release);

    if base.use_caller {
        assert_eq!(
            base.caller_thread.get(),
            Some(&thread::current().id()),
            "a use_caller scheduler must be stopped from its constructing thread"
        );
        let current = Scheduler::current()
            .expect("a use_caller scheduler must be stopped from its constructing thread");
        assert!(
            std::ptr::addr_eq(Arc::as_ptr(&current), Arc::as_ptr(&this)),
            "stop() called under a different scheduler"
        );
    }

    for _ in 0..base.spawn_count {
        this.tickle();
    }

    let drain = base.caller_fiber.lock().take();
    if drain.is_some() {
        this.tickle();
    }
    if let Some(fiber) = drain {
        fiber.resume();
        debug_assert_eq!(fiber.state(), FiberState::Term);
    }

    let handles: Vec<JoinHandle<()>> = mem::take(&mut *base.threads.lock());
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!(scheduler = %base.name, "worker thread panicked");
        }
    }

    if base.use_caller {
        set_current(None);
    }
    tracing::debug!(scheduler = %base.name, "scheduler stopped");
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stop_flag.load(Ordering::Acquire) {
            tracing::warn!(scheduler = %self.name, "scheduler dropped without stop()");
        }
    }
}
