use std::any::Any;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::{Mutex, RwLock};

use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{self, Schedule, ScheduleTask, Scheduler, TaskFn};
use crate::timer::{Timer, TimerManager};

/// Token of the wake-pipe read end; file descriptors use their own value.
const WAKE: Token = Token(usize::MAX);

/// Upper bound on a single readiness wait, so a worker re-checks the stop
/// protocol even with no timer armed.
const MAX_IDLE_WAIT_MS: u64 = 5_000;

/// Tighter wait bound once a stop has been requested. A tickle sent while
/// a worker was still busy reaches nobody; the short re-check keeps
/// shutdown prompt anyway.
const SHUTDOWN_WAIT_MS: u64 = 50;

/// Readiness interests, encoded like the epoll bits they mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0x0);
    /// Read readiness (`EPOLLIN`).
    pub const READ: Event = Event(0x1);
    /// Write readiness (`EPOLLOUT`).
    pub const WRITE: Event = Event(0x4);

    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Event) -> Event {
        Event(self.0 | other.0)
    }

    pub fn intersect(self, other: Event) -> Event {
        Event(self.0 & other.0)
    }

    pub fn without(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        self.union(rhs)
    }
}

/// Who to wake when an event triggers.
enum Waiter {
    /// A fiber suspended until readiness; rescheduled as-is.
    Fiber(Arc<Fiber>),
    /// A callback to run inside a fresh fiber.
    Callback(TaskFn),
}

/// The (scheduler, fiber-or-callback) pair registered for one direction of
/// one fd. The scheduler is the one current on the registering thread, so
/// the wakeup lands back on the waiter's home pool.
struct EventContext {
    scheduler: Weak<dyn Schedule>,
    waiter: Waiter,
}

struct FdInner {
    /// Currently registered interests.
    events: Event,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

impl FdInner {
    fn slot_mut(&mut self, event: Event) -> &mut Option<EventContext> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

/// Per-fd registration state. Lives at index `fd` in the context table and
/// survives cancellation; only the table growing allocates.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::NONE,
                read: None,
                write: None,
            }),
        })
    }
}

fn interests_for(events: Event) -> Option<Interest> {
    let mut interests = None;
    if events.contains(Event::READ) {
        interests = Some(Interest::READABLE);
    }
    if events.contains(Event::WRITE) {
        interests = Some(match interests {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interests
}

/// The I/O reactor: a [`Scheduler`] whose idle workers park on OS
/// readiness, composed with a [`TimerManager`] bounding each wait.
///
/// Worker fibers register `(fd, event)` interest, yield, and are
/// re-enqueued as tasks once the fd turns ready, a timer fires, or the
/// registration is cancelled. Wakeups cross threads through a self-pipe
/// registered edge-triggered with the poller.
pub struct IoManager {
    base: Scheduler,
    timers: TimerManager,
    /// Readiness waits happen under this lock; one worker polls at a time
    /// while the rest queue behind it, which is equivalent to parking.
    poll: Mutex<Poll>,
    /// Clone of the poll registry; registration is thread-safe.
    registry: Registry,
    wake_tx: Mutex<pipe::Sender>,
    wake_rx: Mutex<pipe::Receiver>,
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    weak_self: Weak<IoManager>,
}

impl IoManager {
    /// Creates the reactor and starts its worker pool.
    ///
    /// With `use_caller`, the constructing thread fills one worker slot and
    /// drains the runtime when [`Schedule::stop`] is called from it.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> io::Result<Arc<IoManager>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let (wake_tx, mut wake_rx) = pipe::new()?;
        registry.register(&mut wake_rx, WAKE, Interest::READABLE)?;

        let this = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let hook = weak.clone();
            IoManager {
                base: Scheduler::build(worker_count, use_caller, name),
                timers: TimerManager::with_front_hook(Box::new(move || {
                    if let Some(manager) = hook.upgrade() {
                        manager.tickle();
                    }
                })),
                poll: Mutex::new(poll),
                registry,
                wake_tx: Mutex::new(wake_tx),
                wake_rx: Mutex::new(wake_rx),
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
                weak_self: weak.clone(),
            }
        });

        this.grow_contexts(32);
        if use_caller {
            scheduler::caller_init(&(this.clone() as Arc<dyn Schedule>));
        }
        this.start();
        Ok(this)
    }

    /// The reactor driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|s| s.into_any().downcast::<IoManager>().ok())
    }

    /// Registers interest in `event` on `fd`.
    ///
    /// With a callback, the callback runs (in a fresh fiber) once the event
    /// triggers. Without one, the currently running fiber is suspended on
    /// the event: callers are expected to [`Fiber::yield_now`] right after.
    ///
    /// Fails if `event` is already registered on `fd`, or if the OS
    /// rejects the registration.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<TaskFn>) -> io::Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one of READ or WRITE"
        );
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();

        if inner.events.contains(event) {
            tracing::error!(fd, ?event, "event already registered");
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "event already registered for this fd",
            ));
        }

        let combined = inner.events.union(event);
        let interests = interests_for(combined).expect("combined interest set is non-empty");
        let result = if inner.events.is_none() {
            self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interests)
        } else {
            self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interests)
        };
        if let Err(e) = result {
            tracing::error!(fd, ?event, error = %e, "reactor registration failed");
            return Err(e);
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        gauge!("weft_pending_io_events").increment(1.0);
        inner.events = combined;

        let scheduler: Weak<dyn Schedule> = match Scheduler::current() {
            Some(s) => Arc::downgrade(&s),
            None => self.weak_self.clone(),
        };
        let waiter = match callback {
            Some(f) => Waiter::Callback(f),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_event without a callback must run inside a running fiber"
                );
                Waiter::Fiber(fiber)
            }
        };
        let slot = inner.slot_mut(event);
        debug_assert!(slot.is_none(), "interest bit clear but slot occupied");
        *slot = Some(EventContext { scheduler, waiter });
        Ok(())
    }

    /// Removes interest in `event` on `fd`, discarding the registered
    /// fiber/callback without firing it. Returns `false` if nothing was
    /// registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events.without(event);
        self.update_registration(fd, remaining);
        inner.events = remaining;
        *inner.slot_mut(event) = None;
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        gauge!("weft_pending_io_events").decrement(1.0);
        true
    }

    /// Removes interest in `event` on `fd`, firing the registered
    /// fiber/callback once as if the event had triggered. Returns `false`
    /// if nothing was registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events.without(event);
        self.update_registration(fd, remaining);
        self.trigger_event(&mut inner, event);
        true
    }

    /// Fires and removes every registered interest on `fd`. Returns
    /// `false` if the fd had none.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock();
        if inner.events.is_none() {
            return false;
        }

        self.update_registration(fd, Event::NONE);
        if inner.events.contains(Event::READ) {
            self.trigger_event(&mut inner, Event::READ);
        }
        if inner.events.contains(Event::WRITE) {
            self.trigger_event(&mut inner, Event::WRITE);
        }
        debug_assert!(inner.events.is_none());
        true
    }

    /// Arms a timer on this reactor's timer manager.
    pub fn add_timer(
        &self,
        period_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(period_ms, callback, recurring)
    }

    /// Arms a timer whose callback only runs while `guard` is alive.
    pub fn add_conditional_timer<T: ?Sized + Send + Sync + 'static>(
        &self,
        period_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        guard: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_conditional_timer(period_ms, callback, guard, recurring)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Number of `(fd, event)` registrations awaiting a trigger.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Moves the registered context for `event` into a scheduler task,
    /// clearing the interest bit and the slot.
    fn trigger_event(&self, inner: &mut FdInner, event: Event) {
        debug_assert!(inner.events.contains(event));
        inner.events = inner.events.without(event);
        let Some(EventContext { scheduler, waiter }) = inner.slot_mut(event).take() else {
            return;
        };

        let task = match waiter {
            Waiter::Fiber(fiber) => ScheduleTask::fiber(fiber),
            Waiter::Callback(f) => ScheduleTask::call(f),
        };
        match scheduler.upgrade() {
            Some(s) => s.schedule_task(task),
            None => tracing::warn!("scheduler gone before event dispatch"),
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        gauge!("weft_pending_io_events").decrement(1.0);
    }

    /// Converts one poller event into scheduler tasks.
    fn dispatch_ready(&self, event: &mio::event::Event) {
        let fd = event.token().0 as RawFd;
        let Some(ctx) = self.lookup(fd) else { return };
        let mut inner = ctx.inner.lock();

        let mut ready = Event::NONE;
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ready = ready.union(Event::READ);
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            ready = ready.union(Event::WRITE);
        }

        let triggered = ready.intersect(inner.events);
        if triggered.is_none() {
            return;
        }

        let remaining = inner.events.without(triggered);
        self.update_registration(ctx.fd, remaining);
        if triggered.contains(Event::READ) {
            self.trigger_event(&mut inner, Event::READ);
        }
        if triggered.contains(Event::WRITE) {
            self.trigger_event(&mut inner, Event::WRITE);
        }
    }

    /// Re-issues the fd's registration to match `remaining`, deregistering
    /// when no interest is left. Failures are reported, not propagated;
    /// teardown paths stay best-effort.
    fn update_registration(&self, fd: RawFd, remaining: Event) {
        let result = match interests_for(remaining) {
            Some(interests) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interests)
            }
            None => self.registry.deregister(&mut SourceFd(&fd)),
        };
        if let Err(e) = result {
            tracing::warn!(fd, error = %e, "reactor update failed");
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.fd_contexts.read().get(fd as usize).cloned()
    }

    /// The context for `fd`, growing the table (doubling, power of two) if
    /// the fd is beyond it.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read();
            if let Some(ctx) = table.get(idx) {
                return ctx.clone();
            }
        }
        self.grow_contexts((idx + 1).next_power_of_two().max(32));
        self.fd_contexts.read()[idx].clone()
    }

    fn grow_contexts(&self, len: usize) {
        let mut table = self.fd_contexts.write();
        for fd in table.len()..len {
            table.push(FdContext::new(fd as RawFd));
        }
    }

    fn write_wake_byte(&self) {
        if let Err(e) = self.wake_tx.lock().write(&[b'T']) {
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %e, "wake pipe write failed");
            }
        }
    }

    /// Discards everything buffered in the wake pipe. The pipe is
    /// registered edge-triggered, so a partial drain would lose wakeups.
    fn drain_wake_pipe(&self) {
        let mut rx = self.wake_rx.lock();
        let mut buf = [0u8; 256];
        loop {
            match rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "wake pipe drain failed");
                    break;
                }
            }
        }
    }
}

impl Schedule for IoManager {
    fn base(&self) -> &Scheduler {
        &self.base
    }

    /// Wakes one parked poller through the self-pipe. Skipped when no
    /// worker is idle; a busy pool re-checks the queue on its own.
    fn tickle(&self) {
        if !self.base.has_idle_workers() {
            return;
        }
        counter!("weft_tickles_total").increment(1);
        self.write_wake_byte();
    }

    /// The reactor idle loop: wait on readiness bounded by the next timer
    /// deadline, convert ready events and due timers into tasks, then
    /// yield so the worker picks them up.
    fn idle(&self) {
        let mut events = Events::with_capacity(256);
        loop {
            if self.stopping() {
                tracing::debug!(scheduler = %self.base.name(), "reactor idle exiting");
                break;
            }

            let mut timeout = self.timers.next_deadline_ms().min(MAX_IDLE_WAIT_MS);
            if self.base.stop_requested() {
                timeout = timeout.min(SHUTDOWN_WAIT_MS);
            }
            let poll_result = {
                let mut poll = self.poll.lock();
                poll.poll(&mut events, Some(Duration::from_millis(timeout)))
            };
            if let Err(e) = poll_result {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "reactor wait failed");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKE {
                    self.drain_wake_pipe();
                    continue;
                }
                self.dispatch_ready(event);
            }

            let mut due = Vec::new();
            self.timers.drain_due(&mut due);
            for callback in due {
                self.schedule_task(ScheduleTask::call(move || callback()));
            }

            if self.base.stop_requested() {
                // One poller drains the pipe for everyone; re-arm it so the
                // next parked worker falls through promptly during shutdown.
                self.write_wake_byte();
            }
            Fiber::yield_now();
        }
    }

    /// Shutdown additionally requires every registration triggered or
    /// cancelled and every timer fired or cancelled.
    fn stopping(&self) -> bool {
        self.base.base_stopping()
            && self.pending_events.load(Ordering::Acquire) == 0
            && !self.timers.has_timers()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Parks the current fiber on a one-shot timer, yielding until it fires.
///
/// # Panics
///
/// Must be called from a fiber running on an [`IoManager`] worker.
pub fn sleep(duration: Duration) {
    let manager = IoManager::current().expect("sleep requires an IoManager worker context");
    let scheduler = Scheduler::current().expect("sleep requires a scheduler context");
    let fiber = Fiber::current();
    assert_eq!(
        fiber.state(),
        FiberState::Running,
        "sleep must be called from a running fiber"
    );

    let target = Arc::downgrade(&scheduler);
    manager.add_timer(
        duration.as_millis() as u64,
        move || {
            if let Some(s) = target.upgrade() {
                s.schedule_task(ScheduleTask::fiber(fiber.clone()));
            }
        },
        false,
    );
    Fiber::yield_now();
}
