//! The I/O reactor: fd readiness and timer deadlines turned into tasks.
//!
//! [`IoManager`] composes the scheduler with a timer manager and an OS
//! readiness interface. Idle workers block on readiness (bounded by the
//! soonest timer deadline), wake the fibers registered for ready fds, and
//! enqueue due timer callbacks.

mod manager;

pub use manager::{sleep, Event, IoManager};
