//! An M:N fiber runtime: cooperative stackful coroutines multiplexed over
//! a worker pool, with an I/O reactor and a timer wheel waking them.
//!
//! Four subsystems compose bottom-up:
//!
//! - [`fiber`]: stackful coroutines with `resume`/`yield` and owned stacks
//! - [`scheduler`]: the worker pool draining a shared FIFO of tasks
//! - [`timer`]: the ordered deadline set producing due callbacks
//! - [`reactor`]: the I/O manager parking idle workers on OS readiness and
//!   turning ready fds and due timers back into tasks
//!
//! Blocking-style wrappers live in [`net`]: code on a fiber calls what
//! looks like a blocking `read`, the wrapper registers interest and
//! yields, and the reactor resumes the fiber when the fd turns ready.

pub mod fiber;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use fiber::{Fiber, FiberState, DEFAULT_STACK_SIZE};
pub use reactor::{sleep, Event, IoManager};
pub use scheduler::{Schedule, ScheduleTask, Scheduler, TaskFn};
pub use timer::{Timer, TimerCallback, TimerManager};
