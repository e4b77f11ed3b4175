//! Deadline management: an ordered set of timers drained by the reactor.
//!
//! Timers are keyed by `(absolute deadline, insertion sequence)` so equal
//! deadlines fire in a deterministic order. The manager only produces due
//! callbacks; scheduling them is the owner's concern (the I/O reactor
//! drains due timers from its idle loop and enqueues each callback as a
//! task).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::counter;
use parking_lot::{Mutex, RwLock};

/// A wall-clock step-back larger than this is treated as rollover: every
/// timer becomes immediately due for one drain, instead of stalling until
/// the clock catches back up.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Callback fired when a timer expires. Recurring timers fire the same
/// callback on every expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

type ClockFn = dyn Fn() -> u64 + Send + Sync;
type FrontHook = Box<dyn Fn() + Send + Sync>;
type TimerKey = (u64, u64);

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mutable timer state. Locked after the manager's set lock, never before.
struct TimerData {
    /// Absolute deadline in wall-clock milliseconds.
    next_ms: u64,
    period_ms: u64,
    recurring: bool,
    /// `None` once cancelled (or fired, for one-shot timers).
    callback: Option<TimerCallback>,
}

struct TimerShared {
    /// Insertion identity; tie-break for equal deadlines.
    seq: u64,
    data: Mutex<TimerData>,
}

struct TimerCore {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerShared>>>,
    /// Debounces front-insert wakeups: set on the first front insert,
    /// cleared by `next_deadline_ms`.
    tickled: AtomicBool,
    /// Last wall-clock sample, for rollover detection.
    previous_ms: Mutex<u64>,
    front_hook: Option<FrontHook>,
    clock: Option<Box<ClockFn>>,
}

impl TimerCore {
    fn now_ms(&self) -> u64 {
        match &self.clock {
            Some(clock) => clock(),
            None => wall_clock_ms(),
        }
    }

    /// True when `key` landed at the front of the set and no wakeup is
    /// pending yet; marks the wakeup pending in that case.
    fn note_front_insert(&self, timers: &BTreeMap<TimerKey, Arc<TimerShared>>, key: &TimerKey) -> bool {
        timers.keys().next() == Some(key) && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn fire_front_hook(&self) {
        if let Some(hook) = &self.front_hook {
            hook();
        }
    }
}

/// The ordered deadline set.
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::from_parts(None, None)
    }

    /// A manager that invokes `hook` whenever an insert lands a new
    /// soonest deadline (debounced until the next `next_deadline_ms`).
    pub(crate) fn with_front_hook(hook: FrontHook) -> TimerManager {
        TimerManager::from_parts(Some(hook), None)
    }

    fn from_parts(front_hook: Option<FrontHook>, clock: Option<Box<ClockFn>>) -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: Mutex::new(clock.as_ref().map_or_else(wall_clock_ms, |c| c())),
                front_hook,
                clock,
            }),
        }
    }

    /// Arms a timer firing `period_ms` from now, rearming on expiry when
    /// `recurring`.
    pub fn add_timer(
        &self,
        period_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_callback(period_ms, Arc::new(callback), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs
    /// while `guard` still has a live referent; a fired timer whose guard
    /// is gone is discarded silently.
    pub fn add_conditional_timer<T: ?Sized + Send + Sync + 'static>(
        &self,
        period_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        guard: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let wrapped = move || {
            if guard.upgrade().is_some() {
                callback();
            }
        };
        self.add_timer(period_ms, wrapped, recurring)
    }

    fn add_timer_callback(&self, period_ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let shared = Arc::new(TimerShared {
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(TimerData {
                next_ms: self.core.now_ms() + period_ms,
                period_ms,
                recurring,
                callback: Some(callback),
            }),
        });

        let key = (shared.data.lock().next_ms, shared.seq);
        let at_front = {
            let mut timers = self.core.timers.write();
            timers.insert(key, shared.clone());
            self.core.note_front_insert(&timers, &key)
        };
        if at_front {
            self.core.fire_front_hook();
        }

        Timer { core: Arc::downgrade(&self.core), shared }
    }

    /// Milliseconds until the soonest deadline: `0` if already due,
    /// `u64::MAX` if no timer is armed. Clears the front-insert debounce.
    pub fn next_deadline_ms(&self) -> u64 {
        self.core.tickled.store(false, Ordering::Release);
        let timers = self.core.timers.read();
        match timers.first_key_value() {
            Some((&(next, _), _)) => next.saturating_sub(self.core.now_ms()),
            None => u64::MAX,
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.core.timers.read().is_empty()
    }

    /// Pops every due timer, appending its callback to `out`. Recurring
    /// timers are rearmed at `now + period`. A wall-clock rollover (see
    /// [`ROLLOVER_WINDOW_MS`]) makes every timer due for this drain.
    pub fn drain_due(&self, out: &mut Vec<TimerCallback>) {
        let now = self.core.now_ms();
        let mut timers = self.core.timers.write();

        let rollover = {
            let mut previous = self.core.previous_ms.lock();
            let rollover = now < previous.saturating_sub(ROLLOVER_WINDOW_MS);
            *previous = now;
            rollover
        };
        if rollover {
            tracing::warn!(now_ms = now, "wall clock rolled back, firing all armed timers");
        }

        // Collect first, rearm after: a recurring timer reinserted while a
        // rollover drain is still scanning would be popped again.
        let mut due = Vec::new();
        while let Some((&(next, _), _)) = timers.first_key_value() {
            if !rollover && next > now {
                break;
            }
            let Some((_, shared)) = timers.pop_first() else { break };
            due.push(shared);
        }

        for shared in due {
            let mut data = shared.data.lock();
            if data.recurring {
                let callback = data.callback.clone();
                data.next_ms = now + data.period_ms;
                let key = (data.next_ms, shared.seq);
                drop(data);
                timers.insert(key, shared.clone());
                if let Some(callback) = callback {
                    out.push(callback);
                }
            } else if let Some(callback) = data.callback.take() {
                out.push(callback);
            }
            counter!("weft_timers_fired_total").increment(1);
        }
    }

    #[cfg(test)]
    fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> TimerManager {
        TimerManager::from_parts(None, Some(Box::new(clock)))
    }

    #[cfg(test)]
    fn with_clock_and_hook(
        clock: impl Fn() -> u64 + Send + Sync + 'static,
        hook: FrontHook,
    ) -> TimerManager {
        TimerManager::from_parts(Some(hook), Some(Box::new(clock)))
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

/// Handle to an armed timer.
#[derive(Clone)]
pub struct Timer {
    core: Weak<TimerCore>,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Disarms the timer and drops its callback. Returns `false` if it was
    /// already cancelled (or, for a one-shot timer, already fired).
    pub fn cancel(&self) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let mut timers = core.timers.write();
        let mut data = self.shared.data.lock();
        if data.callback.is_none() {
            return false;
        }
        data.callback = None;
        timers.remove(&(data.next_ms, self.shared.seq));
        true
    }

    /// Pushes the deadline forward to `now + period`. Deadlines only move
    /// forward through refresh. Returns `false` if the timer is cancelled
    /// or no longer armed.
    pub fn refresh(&self) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let mut timers = core.timers.write();
        let mut data = self.shared.data.lock();
        if data.callback.is_none() {
            return false;
        }
        if timers.remove(&(data.next_ms, self.shared.seq)).is_none() {
            return false;
        }
        data.next_ms = core.now_ms() + data.period_ms;
        timers.insert((data.next_ms, self.shared.seq), self.shared.clone());
        true
    }

    /// Changes the period. With `from_now` the deadline rebases at
    /// `now + period_ms`; otherwise at the previous trigger time plus the
    /// new period. A same-period `reset` without `from_now` is a no-op.
    /// Returns `false` if the timer is cancelled or no longer armed.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if !from_now && period_ms == self.shared.data.lock().period_ms {
            return true;
        }
        let Some(core) = self.core.upgrade() else { return false };

        let at_front = {
            let mut timers = core.timers.write();
            let mut data = self.shared.data.lock();
            if data.callback.is_none() {
                return false;
            }
            if timers.remove(&(data.next_ms, self.shared.seq)).is_none() {
                return false;
            }
            let start = if from_now {
                core.now_ms()
            } else {
                data.next_ms.saturating_sub(data.period_ms)
            };
            data.period_ms = period_ms;
            data.next_ms = start + period_ms;
            let key = (data.next_ms, self.shared.seq);
            timers.insert(key, self.shared.clone());
            core.note_front_insert(&timers, &key)
        };
        if at_front {
            core.fire_front_hook();
        }
        true
    }
}
