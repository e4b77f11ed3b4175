//! Blocking-style TCP primitives built on top of the reactor.
//!
//! These types look synchronous to the calling fiber: `accept`, `read`,
//! and `write` register interest with the current [`IoManager`], suspend
//! the fiber, and retry once the reactor wakes it. There is no function
//! coloring; any code running on a reactor worker can call them at
//! arbitrary depth.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use crate::fiber::Fiber;
use crate::reactor::{Event, IoManager};

/// Parks the calling fiber until `event` triggers on `fd`.
fn wait_for(fd: RawFd, event: Event) -> io::Result<()> {
    let manager = IoManager::current().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "blocking I/O outside an IoManager worker")
    })?;
    manager.add_event(fd, event, None)?;
    Fiber::yield_now();
    Ok(())
}

/// A TCP listener whose `accept` suspends the calling fiber instead of
/// blocking the worker thread.
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
        let inner = net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpListener { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one connection, suspending the calling fiber until a peer
    /// is pending. The returned stream is already nonblocking.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(true)?;
                    return Ok((TcpStream { inner: stream }, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for(self.inner.as_raw_fd(), Event::READ)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A TCP stream with fiber-suspending `read`/`write`.
pub struct TcpStream {
    inner: net::TcpStream,
}

impl TcpStream {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<TcpStream> {
        let inner = net::TcpStream::connect(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpStream { inner })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Reads into `buf`, suspending the calling fiber until data (or EOF)
    /// is available. Returns `Ok(0)` on a closed connection.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for(self.inner.as_raw_fd(), Event::READ)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes from `buf`, suspending the calling fiber while the send
    /// buffer is full.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for(self.inner.as_raw_fd(), Event::WRITE)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the whole buffer, suspending as needed.
    pub fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed mid-write",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}
