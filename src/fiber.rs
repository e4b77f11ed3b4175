//! Stackful fibers: cooperative user-mode coroutines with owned stacks.
//!
//! A [`Fiber`] owns a stack buffer and a saved machine context. `resume`
//! switches the calling thread onto the fiber's stack; [`Fiber::yield_now`]
//! switches back. Exactly one fiber per thread is `Running` at any instant;
//! the thread's original execution is represented by a stackless "root"
//! fiber created lazily by [`Fiber::current`].

use std::cell::RefCell;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use metrics::gauge;
use parking_lot::Mutex;

/// Default stack size for user fibers, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

/// The callable a fiber executes on its first resume.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

type FiberCoroutine = Coroutine<(), (), (), &'static mut DefaultStack>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

const READY: u8 = 0;
const RUNNING: u8 = 1;
const TERM: u8 = 2;

/// Fiber lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or yielded; eligible for `resume`.
    Ready,
    /// Currently executing on some thread.
    Running,
    /// Entry returned; may be `reset` with a new entry.
    Term,
}

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber representing this thread's original execution.
    static ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The yield target for fibers spawned with `run_in_scheduler`.
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The saved context of a suspended fiber.
///
/// Field order is load-bearing: the coroutine borrows the stack and must be
/// dropped first.
struct StackedContext {
    co: Option<FiberCoroutine>,
    stack: Box<DefaultStack>,
}

/// A stackful coroutine.
///
/// Shared as `Arc<Fiber>`; the scheduler's task queue holds the owning
/// handle while a fiber is suspended. All mutable state is behind the
/// context mutex or atomics, so a fiber may be resumed from any thread,
/// though only one thread may resume it at a time, enforced by the
/// `Ready -> Running` transition.
pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    /// `None` for a root fiber, which runs on the OS-provided stack.
    /// Declared before `entry` and `yielder`: dropping a suspended context
    /// unwinds the fiber's stack, and the trampoline's tail still reads
    /// those fields.
    ctx: Mutex<Option<StackedContext>>,
    /// Present while the fiber has not yet run; consumed by the trampoline.
    entry: Mutex<Option<Entry>>,
    /// Published by the trampoline while the fiber is live on its stack;
    /// null otherwise. Read only by the thread currently running the fiber.
    yielder: AtomicPtr<Yielder<(), ()>>,
}

// SAFETY: the coroutine and entry are only touched while holding the
// respective mutex, and the yielder pointer is only dereferenced by the
// thread that currently has the fiber in its CURRENT slot. The stack is
// heap-allocated and never moves for the fiber's lifetime.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber in `Ready` state. `stack_size == 0` selects
    /// [`DEFAULT_STACK_SIZE`].
    ///
    /// When `run_in_scheduler` is true the fiber yields back to the
    /// thread's scheduler fiber; otherwise to the thread's root fiber.
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be allocated. A fiber without a stack
    /// cannot exist, and the callers of this runtime treat context-creation
    /// failure as fatal.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Arc<Fiber> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let mut stack = Box::new(DefaultStack::new(size).unwrap_or_else(|e| {
            tracing::error!(error = %e, size, "fiber stack allocation failed");
            panic!("fiber stack allocation failed: {e}");
        }));
        let co = build_trampoline(extend_stack_lifetime(&mut stack));

        gauge!("weft_fibers_alive").increment(1.0);
        Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler,
            state: AtomicU8::new(READY),
            entry: Mutex::new(Some(Box::new(entry))),
            ctx: Mutex::new(Some(StackedContext { co: Some(co), stack })),
            yielder: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// The fiber standing in for a thread's original execution.
    fn new_root() -> Arc<Fiber> {
        gauge!("weft_fibers_alive").increment(1.0);
        Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(RUNNING),
            entry: Mutex::new(None),
            ctx: Mutex::new(None),
            yielder: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        match self.state.load(Ordering::Acquire) {
            READY => FiberState::Ready,
            RUNNING => FiberState::Running,
            _ => FiberState::Term,
        }
    }

    /// Switches the calling thread onto this fiber's stack until it yields
    /// or its entry returns.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not `Ready`, or if called on a root fiber.
    pub fn resume(self: &Arc<Self>) {
        self.state
            .compare_exchange(READY, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_or_else(|s| panic!("resume requires a Ready fiber (state {s})"));

        let prev = CURRENT.with(|c| c.replace(Some(self.clone())));
        #[cfg(debug_assertions)]
        self.assert_resumer(&prev);

        let result = {
            let mut guard = self.ctx.lock();
            let ctx = guard.as_mut().expect("cannot resume a root fiber");
            let co = ctx.co.as_mut().expect("fiber context missing");
            co.resume(())
        };

        CURRENT.with(|c| *c.borrow_mut() = prev);
        if let CoroutineResult::Return(()) = result {
            debug_assert_eq!(self.state(), FiberState::Term);
        }
    }

    /// Suspends the currently running fiber, switching back to the
    /// scheduler fiber (if the fiber was spawned with `run_in_scheduler`)
    /// or the thread's root fiber. The fiber returns to `Ready` and may be
    /// resumed again later, possibly from another thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber, or on a thread whose current
    /// fiber is the root fiber (there is nothing to switch back to).
    pub fn yield_now() {
        let fiber = CURRENT
            .with(|c| c.borrow().clone())
            .expect("yield_now called outside a fiber");
        let yielder = fiber.yielder.load(Ordering::Acquire);
        assert!(!yielder.is_null(), "cannot yield a thread's root fiber");

        let state = fiber.state.load(Ordering::Acquire);
        assert_ne!(state, READY, "yield_now on a fiber that is not running");
        if state == RUNNING {
            fiber.state.store(READY, Ordering::Release);
        }

        // The suspended fiber must not own itself, or an unresumed fiber
        // could never be freed.
        drop(fiber);
        unsafe { (*yielder).suspend(()) };
    }

    /// Rebuilds a terminated fiber around a new entry, reusing its stack.
    ///
    /// # Panics
    ///
    /// Panics unless the fiber is `Term` and has a stack.
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) {
        assert_eq!(self.state(), FiberState::Term, "reset requires a Term fiber");
        let mut guard = self.ctx.lock();
        let ctx = guard.as_mut().expect("a root fiber cannot be reset");
        // Release the finished context before re-making one on the same stack.
        ctx.co = None;
        ctx.co = Some(build_trampoline(extend_stack_lifetime(&mut ctx.stack)));
        *self.entry.lock() = Some(Box::new(entry));
        self.state.store(READY, Ordering::Release);
    }

    /// Returns the fiber currently running on this thread.
    ///
    /// On the first call per thread this creates the root fiber and, until
    /// [`Fiber::set_scheduler_fiber`] overrides it, designates it as the
    /// thread's scheduler fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let root = Fiber::new_root();
        ROOT.with(|r| *r.borrow_mut() = Some(root.clone()));
        SCHEDULER.with(|s| *s.borrow_mut() = Some(root.clone()));
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        root
    }

    /// Id of the current fiber, or 0 if the thread has none yet.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
    }

    /// Marks `f` as this thread's scheduler fiber: the yield target for
    /// fibers spawned with `run_in_scheduler`.
    pub fn set_scheduler_fiber(f: &Arc<Fiber>) {
        SCHEDULER.with(|s| *s.borrow_mut() = Some(f.clone()));
    }

    #[cfg(debug_assertions)]
    fn assert_resumer(&self, prev: &Option<Arc<Fiber>>) {
        let expected = if self.run_in_scheduler {
            SCHEDULER.with(|s| s.borrow().clone())
        } else {
            ROOT.with(|r| r.borrow().clone())
        };
        if let (Some(prev), Some(expected)) = (prev, &expected) {
            debug_assert!(
                Arc::ptr_eq(prev, expected),
                "fiber {} resumed from fiber {}, expected its return target {}",
                self.id,
                prev.id,
                expected.id,
            );
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        gauge!("weft_fibers_alive").decrement(1.0);
        tracing::trace!(fiber = self.id, "fiber dropped");
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

/// Extends a stack borrow to `'static` so it can parameterize the coroutine.
///
/// SAFETY: callers keep the owning `Box<DefaultStack>` alive in the same
/// `StackedContext` as the coroutine, and the coroutine is dropped first.
fn extend_stack_lifetime(stack: &mut DefaultStack) -> &'static mut DefaultStack {
    unsafe { mem::transmute::<&mut DefaultStack, &'static mut DefaultStack>(stack) }
}

/// Builds the context a new or reset fiber starts from.
///
/// The closure is the trampoline: it publishes the suspension handle, runs
/// the entry, then marks the fiber `Term`. The final switch back to the
/// resumer happens when the closure returns. Panics from the entry are
/// caught here; unwinding must not cross the context-switch boundary.
fn build_trampoline(stack: &'static mut DefaultStack) -> FiberCoroutine {
    Coroutine::with_stack(stack, |yielder, ()| {
        // Keep only a raw handle across the entry: the trampoline must not
        // own the fiber while it is suspended, and if the suspended fiber
        // is dropped (stack unwound from the dropping thread), the
        // thread-local current slot belongs to some other fiber.
        let (raw, id, entry) = {
            let fiber = Fiber::current();
            fiber
                .yielder
                .store(yielder as *const Yielder<(), ()> as *mut _, Ordering::Release);
            let entry = fiber.entry.lock().take();
            (Arc::as_ptr(&fiber), fiber.id, entry)
        };

        if let Some(entry) = entry {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                tracing::error!(
                    fiber = id,
                    "fiber entry panicked: {}",
                    panic_message(payload.as_ref()),
                );
            }
        }

        // SAFETY: in the normal path the resumer's Arc keeps the fiber
        // alive; in the unwind-on-drop path the struct outlives its `ctx`
        // field, and only lock-free fields are touched here.
        let fiber = unsafe { &*raw };
        fiber.yielder.store(ptr::null_mut(), Ordering::Release);
        fiber.state.store(TERM, Ordering::Release);
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn entry_runs_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(fiber.entry.lock().is_none());
    }

    #[test]
    fn yield_round_trip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn current_lazily_creates_root() {
        let root = Fiber::current();
        assert_eq!(root.state(), FiberState::Running);
        // Subsequent calls observe the same fiber.
        assert_eq!(Fiber::current().id(), root.id());
        assert_eq!(Fiber::current_id(), root.id());
    }

    #[test]
    fn ids_are_unique() {
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic(expected = "Ready fiber")]
    fn resume_requires_ready() {
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        fiber.resume();
    }

    #[test]
    fn panic_in_entry_is_contained() {
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            0,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
