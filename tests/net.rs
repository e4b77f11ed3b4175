//! Blocking-style TCP over the reactor: an echo round trip between two
//! fibers, each suspending on readiness instead of blocking its worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft::net::{TcpListener, TcpStream};
use weft::{IoManager, Schedule};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn tcp_echo_round_trip() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let io = IoManager::new(2, false, "net").expect("reactor");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    io.schedule_fn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0u8; 5];
        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..]).expect("server read");
            assert!(n > 0, "peer closed early");
            total += n;
        }
        stream.write_all(&buf).expect("echo back");
    });

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    io.schedule_fn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(b"hello").expect("client write");

        let mut buf = [0u8; 5];
        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..]).expect("client read");
            assert!(n > 0, "server closed early");
            total += n;
        }
        assert_eq!(&buf, b"hello");
        d.store(true, Ordering::SeqCst);
    });

    wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst));
    io.stop();
}
