//! The per-worker dispatch loop.
//!
//! Each worker scans the shared FIFO for the first task it may run (pinned
//! tasks are skipped by non-matching workers without reordering), resumes
//! the task's fiber, and falls back to the scheduler's idle fiber when the
//! scan comes up empty. The loop exits once the idle fiber terminates,
//! which only happens when `stopping()` holds.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use metrics::gauge;

use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{set_current, Schedule, TaskPayload};

/// Entry point of a spawned worker thread.
pub(crate) fn worker_main(this: Arc<dyn Schedule>) {
    set_current(Some(this.clone()));
    // Establish the root fiber so resumed fibers have a yield target.
    Fiber::current();
    run_loop(&this);
    set_current(None);
}

/// The dispatch loop proper. Also runs inside the caller thread's
/// scheduler fiber when the scheduler was built with `use_caller`.
pub(crate) fn run_loop(this: &Arc<dyn Schedule>) {
    let base = this.base();
    let tid = thread::current().id();

    let hook = Arc::downgrade(this);
    let idle_fiber = Fiber::new(
        move || {
            if let Some(scheduler) = hook.upgrade() {
                scheduler.idle();
            }
        },
        0,
        true,
    );

    tracing::debug!(scheduler = %base.name(), "worker loop entered");
    loop {
        let mut selected = None;
        let mut need_tickle = false;
        {
            let mut queue = base.queue.lock();
            let mut i = 0;
            while i < queue.len() {
                if queue[i].target.is_some_and(|t| t != tid) {
                    // Pinned to another worker; leave it in place and make
                    // sure that worker gets woken.
                    need_tickle = true;
                    i += 1;
                    continue;
                }
                selected = queue.remove(i);
                base.active_workers.fetch_add(1, Ordering::AcqRel);
                break;
            }
            need_tickle = need_tickle || !queue.is_empty();
            gauge!("weft_task_queue_depth").set(queue.len() as f64);
        }
        if need_tickle {
            this.tickle();
        }

        match selected {
            Some(task) => {
                match task.payload {
                    TaskPayload::Fiber(fiber) => {
                        // A fiber that terminated while queued is dropped
                        // silently.
                        if fiber.state() != FiberState::Term {
                            fiber.resume();
                        }
                    }
                    TaskPayload::Call(f) => {
                        Fiber::new(f, 0, true).resume();
                    }
                }
                base.active_workers.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    break;
                }
                base.idle_workers.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                base.idle_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
    tracing::debug!(scheduler = %base.name(), "worker loop exited");
}
