// src/transport.rs
//
// Byte-stream abstraction between the engine and the socket. The plain
// transport forwards to non-blocking recv/send; the TLS transport (tls.rs)
// drives a rustls session behind the same interface.

use std::io;
use std::os::unix::io::RawFd;

use crate::request::TlsInfo;
use crate::syscalls::{self, ReadOutcome, WriteOutcome};

#[derive(Debug, PartialEq, Eq)]
pub enum TryRead {
    Data(usize),
    WouldBlock,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryWrite {
    Data(usize),
    WouldBlock,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
}

pub trait Transport: Send {
    fn try_read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<TryRead>;
    fn try_write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<TryWrite>;

    /// Whether the session wants socket readability to make progress.
    fn wants_read(&self) -> bool {
        true
    }

    /// Whether the session has buffered bytes of its own to flush.
    fn wants_write(&self) -> bool {
        false
    }

    fn is_handshaking(&self) -> bool {
        false
    }

    /// Pump the handshake; call repeatedly until `Done`.
    fn step_handshake(&mut self, _fd: RawFd) -> io::Result<Handshake> {
        Ok(Handshake::Done)
    }

    /// Session facts for the request view (TLS only).
    fn tls_info(&self) -> Option<TlsInfo> {
        None
    }

    /// Whether the handshake failed for lack of a shared ALPN protocol.
    fn alpn_mismatched(&self) -> bool {
        false
    }
}

/// Cleartext TCP transport.
#[derive(Debug, Default)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    fn try_read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<TryRead> {
        match syscalls::read_nonblocking(fd, buf)? {
            ReadOutcome::Data(n) => Ok(TryRead::Data(n)),
            ReadOutcome::WouldBlock => Ok(TryRead::WouldBlock),
            ReadOutcome::Closed => Ok(TryRead::Closed),
        }
    }

    fn try_write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<TryWrite> {
        match syscalls::write_nonblocking(fd, buf)? {
            WriteOutcome::Data(n) => Ok(TryWrite::Data(n)),
            WriteOutcome::WouldBlock => Ok(TryWrite::WouldBlock),
        }
    }
}
