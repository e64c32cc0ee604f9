// src/conn.rs
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::parser::{ChunkedDecoder, RequestHead};
use crate::request::TlsInfo;
use crate::transport::Transport;

/// Per-connection state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// TLS handshake in progress; no application bytes yet.
    Handshaking,
    ReadingHead,
    ReadingFixedBody,
    ReadingChunkedBody,
    /// Client side of a CONNECT whose upstream connect is still pending;
    /// inbound bytes buffer until the pair is established.
    TunnelPending,
    /// Upstream side of a CONNECT with the async connect in flight.
    TunnelConnecting,
    /// Raw byte forwarding between paired connections.
    Tunneling,
    /// Flush the outbound queue, ignore further input, then close.
    Draining,
    Closing,
}

/// One owned outbound byte chunk; the front of the queue may be
/// partially written.
#[derive(Debug)]
pub struct OutChunk {
    pub data: Vec<u8>,
    pub offset: usize,
}

impl OutChunk {
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// All state for one client connection. Owned exclusively by the engine's
/// loop thread; the slab hands out the box by value so the engine never
/// holds two aliasing borrows.
pub struct Conn {
    pub fd: RawFd,
    pub transport: Box<dyn Transport>,
    pub phase: ConnPhase,

    /// Raw inbound bytes. The current request's head stays in place until
    /// its response has been queued, keeping parsed spans valid.
    pub buf_in: Vec<u8>,
    pub head: Option<Box<RequestHead>>,
    pub chunked: Option<ChunkedDecoder>,

    pub out: VecDeque<OutChunk>,
    pub out_bytes: usize,

    pub requests_served: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,

    pub created_at: Instant,
    pub last_active: Instant,
    /// First byte of the current head, for the slow-header timeout.
    pub head_started_at: Option<Instant>,

    pub close_after_flush: bool,
    /// Peer sent EOF; whatever is buffered is the final input.
    pub peer_eof: bool,
    pub continue_sent: bool,
    /// Peer slab index once a CONNECT tunnel is established.
    pub tunnel_peer: Option<usize>,
    pub tls_info: Option<TlsInfo>,

    /// Whether EPOLLOUT is currently part of the registered interest.
    pub armed_writable: bool,
}

impl Conn {
    pub fn new(fd: RawFd, transport: Box<dyn Transport>, handshaking: bool, now: Instant) -> Self {
        Self {
            fd,
            transport,
            phase: if handshaking { ConnPhase::Handshaking } else { ConnPhase::ReadingHead },
            buf_in: Vec::new(),
            head: None,
            chunked: None,
            out: VecDeque::new(),
            out_bytes: 0,
            requests_served: 0,
            bytes_in: 0,
            bytes_out: 0,
            created_at: now,
            last_active: now,
            head_started_at: None,
            close_after_flush: false,
            peer_eof: false,
            continue_sent: false,
            tunnel_peer: None,
            tls_info: None,
            armed_writable: false,
        }
    }

    pub fn queue_out(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.out_bytes += data.len();
        self.out.push_back(OutChunk { data, offset: 0 });
    }

    pub fn out_is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Drop the front chunk once fully written; returns bytes released.
    pub fn advance_out(&mut self, written: usize) {
        self.out_bytes -= written;
        if let Some(front) = self.out.front_mut() {
            front.offset += written;
            if front.offset >= front.data.len() {
                self.out.pop_front();
            }
        }
    }

    /// Reset request-scoped parser state after a response is queued.
    pub fn reset_for_next_request(&mut self, consumed: usize) {
        self.buf_in.drain(..consumed);
        self.head = None;
        self.chunked = None;
        self.continue_sent = false;
        self.head_started_at = if self.buf_in.is_empty() { None } else { Some(self.last_active) };
        self.phase = ConnPhase::ReadingHead;
    }

    pub fn is_reading(&self) -> bool {
        matches!(
            self.phase,
            ConnPhase::ReadingHead | ConnPhase::ReadingFixedBody | ConnPhase::ReadingChunkedBody
        )
    }
}
