// src/event_loop.rs
use std::os::unix::io::RawFd;

use crate::error::ServerResult;
use crate::syscalls::{self, epoll_event, Epoll, EV_HUP, EV_READ, EV_WRITE};

/// Token reserved for the wakeup eventfd.
const WAKEUP_TOKEN: u64 = u64::MAX;

const EVENT_BATCH: usize = 1024;

/// One delivered readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// Epoll wrapper with an eventfd wakeup channel. All registration happens
/// on the loop thread; [`Waker`] is the single cross-thread primitive.
pub struct EventLoop {
    epoll: Epoll,
    wakeup_fd: RawFd,
    events: Vec<epoll_event>,
}

impl EventLoop {
    pub fn new() -> ServerResult<Self> {
        let epoll = Epoll::new()?;
        let wakeup_fd = syscalls::create_eventfd()?;
        epoll.add(wakeup_fd, WAKEUP_TOKEN, EV_READ)?;
        Ok(Self {
            epoll,
            wakeup_fd,
            events: vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, read: bool, write: bool) -> std::io::Result<()> {
        self.epoll.add(fd, token, interests(read, write))
    }

    pub fn modify(&self, fd: RawFd, token: u64, read: bool, write: bool) -> std::io::Result<()> {
        self.epoll.modify(fd, token, interests(read, write))
    }

    pub fn remove(&self, fd: RawFd) -> std::io::Result<()> {
        self.epoll.delete(fd)
    }

    /// Block up to `timeout_ms` and deliver ready events to `dispatch`.
    /// Returns the number of fd events delivered (wakeups excluded).
    pub fn poll<F>(&mut self, timeout_ms: i32, mut dispatch: F) -> std::io::Result<usize>
    where
        F: FnMut(Event),
    {
        let n = self.epoll.wait(&mut self.events, timeout_ms)?;
        let mut delivered = 0;
        for i in 0..n {
            let raw = self.events[i];
            if raw.u64 == WAKEUP_TOKEN {
                syscalls::drain_eventfd(self.wakeup_fd);
                continue;
            }
            delivered += 1;
            dispatch(Event {
                token: raw.u64,
                readable: raw.events & EV_READ != 0,
                writable: raw.events & EV_WRITE != 0,
                hangup: raw.events & EV_HUP != 0,
            });
        }
        Ok(delivered)
    }

    /// Thread-safe handle that interrupts a blocked `poll`.
    pub fn waker(&self) -> Waker {
        Waker { fd: self.wakeup_fd }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        syscalls::close_fd(self.wakeup_fd);
    }
}

fn interests(read: bool, write: bool) -> u32 {
    let mut mask = 0;
    if read {
        mask |= EV_READ;
    }
    if write {
        mask |= EV_WRITE;
    }
    mask
}

/// Cross-thread wakeup handle. Writing the eventfd is async-signal-safe
/// and never blocks.
#[derive(Debug, Clone, Copy)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn wake(&self) {
        syscalls::signal_eventfd(self.fd);
    }
}
