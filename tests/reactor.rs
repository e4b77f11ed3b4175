//! End-to-end reactor behavior: fd wakeups, cancellation semantics, and
//! timers driving fibers.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use weft::{Event, Fiber, IoManager, Schedule};

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

/// A fiber registers read interest, yields, and is resumed once a byte
/// arrives; the registration is consumed by the trigger.
#[test]
fn io_round_trip_wakes_fiber() {
    init_tracing();
    let io = IoManager::new(2, false, "io-rt").expect("reactor");

    let (mut writer, reader) = UnixStream::pair().expect("socketpair");
    reader.set_nonblocking(true).expect("nonblocking");

    let got = Arc::new(AtomicUsize::new(0));
    let g = got.clone();
    io.schedule_fn(move || {
        let manager = IoManager::current().expect("worker context");
        manager
            .add_event(reader.as_raw_fd(), Event::READ, None)
            .expect("register read");
        Fiber::yield_now();

        let mut buf = [0u8; 8];
        let n = (&reader).read(&mut buf).expect("read after wake");
        g.store(n, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(5), || io.pending_event_count() == 1);
    writer.write_all(&[7]).expect("write");

    wait_until(Duration::from_secs(5), || got.load(Ordering::SeqCst) == 1);
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
}

/// `cancel_event` fires the registered callback exactly once; the slot is
/// then free for a fresh registration.
#[test]
fn cancel_fires_exactly_once() {
    init_tracing();
    let io = IoManager::new(1, false, "io-cancel").expect("reactor");

    let (_writer, reader) = UnixStream::pair().expect("socketpair");
    reader.set_nonblocking(true).expect("nonblocking");
    let fd = reader.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .expect("register");
    assert_eq!(io.pending_event_count(), 1);

    // A duplicate registration on the same (fd, event) is rejected.
    assert!(io.add_event(fd, Event::READ, Some(Box::new(|| {}))).is_err());

    assert!(io.cancel_event(fd, Event::READ));
    wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_event_count(), 0);

    // Cancelled means gone: a second cancel finds nothing.
    assert!(!io.cancel_event(fd, Event::READ));

    // And the slot accepts a new registration, which del discards silently.
    let silent = Arc::new(AtomicUsize::new(0));
    let s = silent.clone();
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .expect("re-register");
    assert!(io.del_event(fd, Event::READ));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(silent.load(Ordering::SeqCst), 0);
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
}

/// `cancel_all` fires both directions and clears the fd.
#[test]
fn cancel_all_fires_both_directions() {
    init_tracing();
    let io = IoManager::new(1, false, "io-all").expect("reactor");

    let (_writer, reader) = UnixStream::pair().expect("socketpair");
    reader.set_nonblocking(true).expect("nonblocking");
    let fd = reader.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event(fd, Event::READ, Some(Box::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    })))
    .expect("read interest");
    let f = fired.clone();
    io.add_event(fd, Event::WRITE, Some(Box::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    })))
    .expect("write interest");

    // The socket is immediately writable, so the poller may fire the WRITE
    // side on its own; cancel_all delivers whatever is still registered.
    assert!(io.cancel_all(fd));
    wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 2);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(io.pending_event_count(), 0);
    assert!(!io.cancel_all(fd));
    io.stop();
}

/// A 50 ms timer fires once; a 200 ms timer cancelled at ~75 ms never does.
#[test]
fn timer_fires_then_cancel() {
    init_tracing();
    let io = IoManager::new(1, false, "io-timer").expect("reactor");

    let started = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_after: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));

    let f = fired.clone();
    let at = fired_after.clone();
    io.add_timer(
        50,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
            at.lock().unwrap().get_or_insert(started.elapsed());
        },
        false,
    );

    let late = Arc::new(AtomicUsize::new(0));
    let l = late.clone();
    let t2 = io.add_timer(
        200,
        move || {
            l.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    thread::sleep(Duration::from_millis(75));
    assert!(t2.cancel());

    wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1);
    assert!(fired_after.lock().unwrap().expect("recorded") >= Duration::from_millis(50));
    assert!(!io.timers().has_timers());

    thread::sleep(Duration::from_millis(200));
    assert_eq!(late.load(Ordering::SeqCst), 0);
    io.stop();
}

/// A recurring timer rearms after each fire until cancelled.
#[test]
fn recurring_timer_rearms() {
    init_tracing();
    let io = IoManager::new(1, false, "io-recur").expect("reactor");

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = io.add_timer(
        30,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    thread::sleep(Duration::from_millis(110));
    assert!(timer.cancel());
    let count = fired.load(Ordering::SeqCst);
    assert!((3..=4).contains(&count), "fired {count} times in ~100ms");
    assert!(!io.timers().has_timers());

    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), count);
    io.stop();
}

/// `sleep` parks the calling fiber on the timer wheel.
#[test]
fn sleep_parks_fiber() {
    init_tracing();
    let io = IoManager::new(2, false, "io-sleep").expect("reactor");

    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    io.schedule_fn(move || {
        let started = Instant::now();
        weft::sleep(Duration::from_millis(40));
        assert!(started.elapsed() >= Duration::from_millis(40));
        w.store(true, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(5), || woke.load(Ordering::SeqCst));
    io.stop();
}

/// The caller thread of a `use_caller` reactor drains scheduled work and
/// pending timers during `stop`.
#[test]
fn use_caller_reactor_drains() {
    init_tracing();
    let io = IoManager::new(1, true, "io-caller").expect("reactor");

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let ran = ran.clone();
        io.schedule_fn(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    let r = ran.clone();
    io.add_timer(
        10,
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    io.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 5);
}
