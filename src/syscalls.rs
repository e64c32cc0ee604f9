// src/syscalls.rs
//
// Thin libc wrappers for the Linux engine: listener setup, non-blocking
// socket I/O, eventfd wakeups and the epoll facade. Everything unsafe in
// the crate lives here.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{ServerError, ServerResult};

/// Result of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    /// Orderly EOF from the peer.
    Closed,
}

/// Result of a non-blocking write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Data(usize),
    WouldBlock,
}

/// Create a non-blocking TCP listener.
/// SO_REUSEADDR is set unconditionally; SO_REUSEPORT and TCP_NODELAY per
/// flags (NODELAY on the listener is inherited by accepted sockets).
/// Returns the fd and the effective port (resolves an ephemeral bind).
pub fn create_listen_socket(host: &str, port: u16, reuse_port: bool, tcp_nodelay: bool) -> ServerResult<(c_int, u16)> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|_| ServerError::Config(format!("invalid bind address `{host}:{port}`")))?;

    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        if reuse_port
            && libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        if tcp_nodelay {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let effective_port = if port == 0 {
            match local_port(fd) {
                Ok(p) => p,
                Err(err) => {
                    libc::close(fd);
                    return Err(err);
                }
            }
        } else {
            port
        };

        Ok((fd, effective_port))
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> ServerResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// Port actually bound, for ephemeral-port write-back.
fn local_port(fd: c_int) -> ServerResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(ServerError::Other("unexpected socket family".into())),
        }
    }
}

/// Accept one pending connection; `None` when the queue is drained.
pub fn accept_connection(listen_fd: c_int) -> ServerResult<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                // Already-reset connections in the backlog are not fatal.
                io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(err.into()),
            }
        } else {
            Ok(Some(fd))
        }
    }
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(ReadOutcome::WouldBlock)
            } else if err.kind() == io::ErrorKind::Interrupted {
                Ok(ReadOutcome::WouldBlock)
            } else {
                Err(err)
            }
        } else if res == 0 {
            Ok(ReadOutcome::Closed)
        } else {
            Ok(ReadOutcome::Data(res as usize))
        }
    }
}

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<WriteOutcome> {
    unsafe {
        let res = libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                Ok(WriteOutcome::WouldBlock)
            } else {
                Err(err)
            }
        } else {
            Ok(WriteOutcome::Data(res as usize))
        }
    }
}

/// Begin a non-blocking connect to `addr` (CONNECT tunnels). The socket is
/// writable once the connect resolves; check `take_socket_error` then.
pub fn connect_nonblocking(addr: &SocketAddr) -> ServerResult<c_int> {
    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::connect(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::connect(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                libc::close(fd);
                return Err(err.into());
            }
        }
        Ok(fd)
    }
}

/// SO_ERROR after an async connect resolves: `None` means success.
pub fn take_socket_error(fd: c_int) -> Option<io::Error> {
    unsafe {
        let mut err: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Some(io::Error::last_os_error());
        }
        if err == 0 {
            None
        } else {
            Some(io::Error::from_raw_os_error(err))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- eventfd wakeup ----

pub fn create_eventfd() -> ServerResult<c_int> {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Signal the eventfd. Callable from any thread; errors are ignored
/// because a full counter still wakes the poller.
pub fn signal_eventfd(fd: c_int) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const c_void, 8);
    }
}

/// Drain the eventfd counter after a wakeup.
pub fn drain_eventfd(fd: c_int) {
    let mut counter: u64 = 0;
    unsafe {
        libc::read(fd, &mut counter as *mut u64 as *mut c_void, 8);
    }
}

// ---- epoll ----

pub const EV_READ: u32 = libc::EPOLLIN as u32;
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;
pub const EV_HUP: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub use libc::epoll_event;

/// Level-triggered epoll instance. Level semantics keep the dispatch
/// logic simple: an unread inbound buffer or a non-empty outbound queue
/// re-surfaces on the next wait without drain-until-EAGAIN loops.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, interests: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // The fd may already be gone (closed by an earlier error
                // branch in the same cycle).
                if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
