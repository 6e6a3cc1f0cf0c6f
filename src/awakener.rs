use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::sys::EventFd;

/// Wakes the readiness wait from outside the poll loop.
///
/// Used for the SIGTERM/SIGINT shutdown signal: the signal handler (which
/// may only call async-signal-safe functions) writes to the eventfd, and
/// the loop thread observes it as ordinary readiness on the next
/// `Epoll::wait`. This keeps cancellation inside the single suspension
/// point the engine already has instead of adding a second blocking
/// primitive.
#[derive(Debug, Clone)]
pub struct Awakener {
    inner: Arc<EventFd>,
}

impl Awakener {
    pub fn new() -> io::Result<Awakener> {
        Ok(Awakener {
            inner: Arc::new(EventFd::new()?),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        self.inner.write(1)
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn register(&self, epoll: &Epoll, token: Token) -> io::Result<()> {
        epoll.add(&*self.inner, token, Ready::readable(), EpollOpt::edge())
    }

    /// Raw fd of the backing eventfd, for arming a signal handler that must
    /// stick to async-signal-safe syscalls.
    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Global flag flipped by the SIGTERM/SIGINT handler, checked once per tick.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}
