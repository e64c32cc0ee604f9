// src/server.rs
//
// The engine: one epoll loop owning a listener, a connection slab and the
// full request pipeline. Single-threaded by design; scale horizontally by
// running several engines on the same port with SO_REUSEPORT (MultiServer)
// instead of sharing state across threads.

use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::config::{ServerConfig, TraceMethodPolicy, TrailingSlashPolicy};
use crate::conn::{Conn, ConnPhase};
use crate::date::DateCache;
use crate::decoder;
use crate::encoder::{build_encoders, EncoderSet};
use crate::encoding::{Encoding, EncodingSelector, Negotiated};
use crate::error::ServerResult;
use crate::event_loop::{EventLoop, Waker};
use crate::method::{Method, Version};
use crate::middleware::{MiddlewareChain, MiddlewareFlow};
use crate::parser::{parse_head, BodyFraming, ChunkedDecoder, HeadOutcome, ParserLimits};
use crate::request::Request;
use crate::response::{self, Response, SerializeCtx};
use crate::router::{format_allow, Lookup, RouteTarget, Router};
use crate::slab::ConnectionSlab;
use crate::stats::{ServerStats, StatsInternal, TlsStats};
use crate::status::{self, StatusCode};
use crate::syscalls;
use crate::transport::{Handshake, PlainTransport, TryRead, TryWrite};
use crate::writer::{ResponseWriter, WriterCtx, WriterOutcome};

#[cfg(feature = "tls")]
use crate::tls::TlsContext;

/// Epoll token for the listening socket (u64::MAX is the wakeup fd).
const LISTEN_TOKEN: u64 = u64::MAX - 1;

/// Accept backpressure bound, far above any sane fd limit.
const MAX_CONNECTIONS: usize = 100_000;

/// Per-request record handed to the metrics callback.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub status: StatusCode,
    pub method: Method,
    pub path: String,
    pub reused_connection: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration: Duration,
}

pub type MetricsCallback = Box<dyn Fn(&RequestMetrics) + Send>;
pub type ParserErrorCallback = Box<dyn Fn(StatusCode) + Send>;

/// Thread-safe, idempotent stop signal for a running engine.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Waker,
}

impl StopHandle {
    /// Request cooperative termination; `run()` returns within one poll
    /// interval. Safe to call any number of times, from any thread.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }
}

enum RequestFlow {
    KeepAlive { consumed: usize },
    CloseAfterFlush,
    CloseNow,
    Tunnel { consumed: usize },
}

enum Handled {
    /// Buffered response plus the HEAD flag.
    Resp(Response, bool),
    Stream(WriterOutcome),
    Connect(String),
}

struct Dispatched {
    handled: Handled,
    path: String,
    negotiated: Option<Encoding>,
}

/// A single-threaded HTTP/1.x engine bound to one listening socket.
///
/// The engine may be moved freely while stopped; `run()` borrows it
/// mutably for the entire loop, so relocating a running engine is rejected
/// at compile time. TLS state sits behind an `Arc`, keeping any
/// library-held pointers stable across moves of the engine value itself.
pub struct HttpServer {
    config: ServerConfig,
    listen_fd: Option<RawFd>,
    event_loop: EventLoop,
    router: Router,
    middleware: MiddlewareChain,
    slab: ConnectionSlab,
    encoders: EncoderSet,
    selector: EncodingSelector,
    date: DateCache,
    stats: StatsInternal,
    tls_stats: TlsStats,
    limits: ParserLimits,
    stop_flag: Arc<AtomicBool>,
    running: bool,
    draining: bool,
    drain_deadline: Option<Instant>,
    parser_error_cb: Option<ParserErrorCallback>,
    metrics_cb: Option<MetricsCallback>,
    #[cfg(feature = "tls")]
    tls_ctx: Option<Arc<TlsContext>>,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_router(config, Router::new())
    }

    /// Bind and listen immediately. An ephemeral port (0) is resolved and
    /// written back so `port()` is deterministic for tests.
    pub fn with_router(mut config: ServerConfig, router: Router) -> ServerResult<Self> {
        config.validate()?;

        #[cfg(feature = "tls")]
        let tls_ctx = if config.tls.is_configured() {
            Some(Arc::new(TlsContext::new(&config.tls)?))
        } else {
            None
        };

        let event_loop = EventLoop::new()?;
        let (listen_fd, port) = syscalls::create_listen_socket(
            &config.bind_address,
            config.port,
            config.reuse_port,
            config.tcp_nodelay,
        )?;
        config.port = port;
        if let Err(err) = event_loop.add(listen_fd, LISTEN_TOKEN, true, false) {
            syscalls::close_fd(listen_fd);
            return Err(err.into());
        }

        let limits = ParserLimits {
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
            merge_unknown_headers: config.merge_unknown_request_headers,
        };
        let encoders = build_encoders(&config.compression);
        let selector = EncodingSelector::new(&config.compression);

        tracing::debug!(port, reuse_port = config.reuse_port, "listening");

        Ok(Self {
            config,
            listen_fd: Some(listen_fd),
            event_loop,
            router,
            middleware: MiddlewareChain::default(),
            slab: ConnectionSlab::new(MAX_CONNECTIONS),
            encoders,
            selector,
            date: DateCache::new(),
            stats: StatsInternal::default(),
            tls_stats: TlsStats::default(),
            limits,
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: false,
            draining: false,
            drain_deadline: None,
            parser_error_cb: None,
            metrics_cb: None,
            #[cfg(feature = "tls")]
            tls_ctx,
        })
    }

    /// Mutable access to the router. Routes are frozen once `run` starts;
    /// mutating between runs is fine.
    pub fn router(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.slab.len(), self.tls_stats.clone())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop_flag.clone(),
            waker: self.event_loop.waker(),
        }
    }

    /// Invoked on the loop thread just before a parser-error response is
    /// queued; one call per failed request. Panics inside are swallowed.
    pub fn on_parser_error<F>(&mut self, cb: F)
    where
        F: Fn(StatusCode) + Send + 'static,
    {
        self.parser_error_cb = Some(Box::new(cb));
    }

    pub fn on_metrics<F>(&mut self, cb: F)
    where
        F: Fn(&RequestMetrics) + Send + 'static,
    {
        self.metrics_cb = Some(Box::new(cb));
    }

    pub fn use_request_middleware<F>(&mut self, mw: F)
    where
        F: Fn(&Request) -> MiddlewareFlow + Send + Sync + 'static,
    {
        self.middleware.add_request(mw);
    }

    pub fn use_response_middleware<F>(&mut self, mw: F)
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.middleware.add_response(mw);
    }

    /// Stop accepting new connections, mark live ones to close after
    /// their next response, and force-close whatever remains once
    /// `grace` elapses. Idempotent.
    pub fn begin_drain(&mut self, grace: Duration) {
        if !self.draining {
            self.draining = true;
            if let Some(fd) = self.listen_fd.take() {
                let _ = self.event_loop.remove(fd);
                syscalls::close_fd(fd);
            }
            tracing::debug!(grace_ms = grace.as_millis() as u64, "drain started");
        }
        self.drain_deadline = Some(Instant::now() + grace);
    }

    /// Run until `stop()` is signalled (or, when draining, until the last
    /// connection finishes).
    pub fn run(&mut self) -> ServerResult<()> {
        self.run_until(|| false)
    }

    /// Run until the predicate returns true (checked once per loop
    /// iteration) or `stop()` is signalled.
    pub fn run_until<P>(&mut self, mut predicate: P) -> ServerResult<()>
    where
        P: FnMut() -> bool,
    {
        self.running = true;
        self.stop_flag.store(false, Ordering::Release);
        let poll_ms = self.config.poll_interval.as_millis().min(i32::MAX as u128) as i32;

        let result = loop {
            self.date.refresh(SystemTime::now());

            let mut ready: Vec<(u64, bool, bool, bool)> = Vec::new();
            match self.event_loop.poll(poll_ms, |ev| {
                ready.push((ev.token, ev.readable, ev.writable, ev.hangup));
            }) {
                Ok(_) => {}
                Err(err) => break Err(err.into()),
            }

            for (token, readable, writable, hangup) in ready {
                if token == LISTEN_TOKEN {
                    self.accept_new_connections();
                } else {
                    self.handle_event(token as usize, readable, writable, hangup);
                }
            }

            self.sweep(Instant::now());

            if self.stop_flag.load(Ordering::Acquire) {
                break Ok(());
            }
            if self.draining && self.slab.is_empty() {
                break Ok(());
            }
            if predicate() {
                break Ok(());
            }
        };

        self.running = false;
        result
    }

    // ---- accept path ----

    fn accept_new_connections(&mut self) {
        let Some(listen_fd) = self.listen_fd else { return };
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => {
                    if self.draining || self.stop_flag.load(Ordering::Acquire) {
                        syscalls::close_fd(fd);
                        continue;
                    }
                    self.register_accepted(fd);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    fn register_accepted(&mut self, fd: RawFd) {
        let now = Instant::now();
        #[cfg(feature = "tls")]
        let conn = match &self.tls_ctx {
            Some(ctx) => match ctx.new_transport() {
                Ok(transport) => Box::new(Conn::new(fd, Box::new(transport), true, now)),
                Err(err) => {
                    tracing::error!(%err, "TLS session setup failed");
                    syscalls::close_fd(fd);
                    return;
                }
            },
            None => Box::new(Conn::new(fd, Box::new(PlainTransport), false, now)),
        };
        #[cfg(not(feature = "tls"))]
        let conn = Box::new(Conn::new(fd, Box::new(PlainTransport), false, now));

        let Some(idx) = self.slab.allocate(conn) else {
            // Out of slots: shed load at the door.
            syscalls::close_fd(fd);
            return;
        };
        if let Err(err) = self.event_loop.add(fd, idx as u64, true, false) {
            tracing::warn!(%err, "epoll add failed for accepted connection");
            self.slab.free(idx);
            syscalls::close_fd(fd);
            return;
        }
        self.stats.connections_accepted += 1;
    }

    // ---- event dispatch ----

    fn handle_event(&mut self, idx: usize, readable: bool, writable: bool, hangup: bool) {
        let Some(mut conn) = self.slab.take(idx) else {
            // Stale event for a slot already torn down this cycle.
            return;
        };
        let mut close_now = false;

        if conn.phase == ConnPhase::TunnelConnecting {
            // EPOLLERR is how a refused connect reports; SO_ERROR decides
            // between the 200 and the 502.
            self.finish_tunnel_connect(&mut conn, &mut close_now);
        } else if hangup {
            close_now = true;
        } else {
            match conn.phase {
                ConnPhase::Handshaking => {
                    self.drive_handshake(&mut conn, &mut close_now);
                    if !close_now && conn.phase == ConnPhase::ReadingHead {
                        // The final handshake flight may carry application
                        // data already buffered in the session.
                        self.read_pump(&mut conn, &mut close_now);
                        if !close_now {
                            self.parse_pump(idx, &mut conn, &mut close_now);
                        }
                    }
                }
                ConnPhase::TunnelPending => {
                    if readable {
                        // Optimistic client bytes before the tunnel is up.
                        self.read_pump(&mut conn, &mut close_now);
                    }
                    if !close_now && writable {
                        self.flush_outbound(&mut conn, false, &mut close_now);
                    }
                }
                ConnPhase::Tunneling => {
                    if readable {
                        self.tunnel_read(&mut conn, &mut close_now);
                    }
                    if !close_now && writable {
                        self.flush_outbound(&mut conn, false, &mut close_now);
                    }
                }
                ConnPhase::Draining | ConnPhase::Closing => {
                    if writable {
                        self.flush_outbound(&mut conn, false, &mut close_now);
                    }
                }
                _ => {
                    if readable && conn.is_reading() {
                        self.read_pump(&mut conn, &mut close_now);
                        if !close_now {
                            self.parse_pump(idx, &mut conn, &mut close_now);
                        }
                    }
                    if !close_now && writable {
                        self.flush_outbound(&mut conn, false, &mut close_now);
                    }
                }
            }
        }

        if !close_now && conn.peer_eof && conn.is_reading() {
            // No further input will arrive; flush whatever is queued and go.
            if conn.out_is_empty() {
                close_now = true;
            } else {
                conn.phase = ConnPhase::Draining;
            }
        }
        if !close_now
            && matches!(conn.phase, ConnPhase::Draining | ConnPhase::Closing)
            && conn.out_is_empty()
        {
            close_now = true;
        }
        if close_now {
            self.teardown(idx, conn);
        } else if !self.rearm(idx, &mut conn) {
            self.teardown(idx, conn);
        } else {
            self.slab.put(idx, conn);
        }
    }

    fn drive_handshake(&mut self, conn: &mut Conn, close_now: &mut bool) {
        let started = Instant::now();
        match conn.transport.step_handshake(conn.fd) {
            Ok(Handshake::Done) => {
                conn.phase = ConnPhase::ReadingHead;
                conn.tls_info = conn.transport.tls_info();
                conn.last_active = started;
                if let Some(info) = &conn.tls_info {
                    let duration_ns = started.duration_since(conn.created_at).as_nanos() as u64;
                    self.tls_stats.record_handshake(
                        info.alpn.as_deref(),
                        info.cipher.as_deref(),
                        info.version.as_deref(),
                        info.client_cert_present,
                        duration_ns,
                    );
                    #[cfg(feature = "tls")]
                    if self.tls_ctx.as_ref().is_some_and(|ctx| ctx.log_handshakes) {
                        tracing::info!(
                            alpn = info.alpn.as_deref().unwrap_or("-"),
                            cipher = info.cipher.as_deref().unwrap_or("-"),
                            version = info.version.as_deref().unwrap_or("-"),
                            client_cert = info.client_cert_present,
                            "TLS handshake complete"
                        );
                    }
                }
            }
            Ok(Handshake::WantRead) | Ok(Handshake::WantWrite) => {}
            Err(err) => {
                if conn.transport.alpn_mismatched() {
                    self.tls_stats.alpn_strict_mismatches += 1;
                }
                tracing::debug!(%err, "TLS handshake failed");
                *close_now = true;
            }
        }
    }

    // ---- read / parse ----

    fn read_pump(&mut self, conn: &mut Conn, close_now: &mut bool) {
        let cap = self.config.max_per_event_read_bytes;
        let mut total = 0usize;
        loop {
            let chunk = if conn.phase == ConnPhase::ReadingHead {
                self.config.initial_read_chunk_bytes
            } else {
                self.config.body_read_chunk_bytes
            };
            let old_len = conn.buf_in.len();
            conn.buf_in.resize(old_len + chunk, 0);
            match conn.transport.try_read(conn.fd, &mut conn.buf_in[old_len..]) {
                Ok(TryRead::Data(n)) => {
                    conn.buf_in.truncate(old_len + n);
                    conn.bytes_in += n as u64;
                    total += n;
                    conn.last_active = Instant::now();
                    if conn.phase == ConnPhase::ReadingHead && conn.head_started_at.is_none() {
                        conn.head_started_at = Some(conn.last_active);
                    }
                    if cap != 0 && total >= cap {
                        // Fairness cap: yield back to the loop; level
                        // triggering resurfaces the rest next cycle.
                        break;
                    }
                }
                Ok(TryRead::WouldBlock) => {
                    conn.buf_in.truncate(old_len);
                    break;
                }
                Ok(TryRead::Closed) => {
                    conn.buf_in.truncate(old_len);
                    // Half-close: a complete buffered request still gets
                    // its response before the connection goes away.
                    conn.peer_eof = true;
                    if conn.buf_in.is_empty() && !matches!(conn.phase, ConnPhase::TunnelPending) {
                        *close_now = true;
                    }
                    break;
                }
                Err(err) => {
                    conn.buf_in.truncate(old_len);
                    tracing::debug!(%err, "read failed");
                    *close_now = true;
                    break;
                }
            }
        }
    }

    fn parse_pump(&mut self, idx: usize, conn: &mut Conn, close_now: &mut bool) {
        loop {
            match conn.phase {
                ConnPhase::ReadingHead => {
                    if conn.buf_in.is_empty() {
                        return;
                    }
                    match parse_head(&conn.buf_in, &self.limits) {
                        Ok(HeadOutcome::NeedMore) => return,
                        Ok(HeadOutcome::Parsed(head)) => {
                            if head.expect_continue && !conn.continue_sent {
                                conn.continue_sent = true;
                                self.queue_and_flush(
                                    conn,
                                    vec![b"HTTP/1.1 100 Continue\r\n\r\n".to_vec()],
                                    close_now,
                                );
                                if *close_now {
                                    return;
                                }
                            }
                            let framing = head.framing.clone();
                            conn.head = Some(head);
                            match framing {
                                BodyFraming::None => {}
                                BodyFraming::Fixed(_) => {
                                    conn.phase = ConnPhase::ReadingFixedBody;
                                    continue;
                                }
                                BodyFraming::Chunked => {
                                    conn.chunked = Some(ChunkedDecoder::new());
                                    conn.phase = ConnPhase::ReadingChunkedBody;
                                    continue;
                                }
                            }
                        }
                        Err(code) => {
                            self.emit_parser_error(conn, code, close_now);
                            return;
                        }
                    }
                }
                ConnPhase::ReadingFixedBody => {
                    let (head_len, want) = match conn.head.as_deref() {
                        Some(head) => match head.framing {
                            BodyFraming::Fixed(n) => (head.head_len, n),
                            _ => return,
                        },
                        None => return,
                    };
                    if conn.buf_in.len() < head_len + want {
                        return;
                    }
                }
                ConnPhase::ReadingChunkedBody => {
                    let head_len = match conn.head.as_deref() {
                        Some(head) => head.head_len,
                        None => return,
                    };
                    let decoder = conn.chunked.as_mut().expect("chunked decoder present");
                    let body = &conn.buf_in[head_len..];
                    match decoder.advance(body, self.limits.max_body_bytes) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(code) => {
                            self.emit_parser_error(conn, code, close_now);
                            return;
                        }
                    }
                }
                _ => return,
            }

            // A complete request (head + body) is buffered.
            match self.process_request(idx, conn, close_now) {
                RequestFlow::KeepAlive { consumed } => {
                    conn.reset_for_next_request(consumed);
                    if *close_now {
                        return;
                    }
                    // Loop again: pipelined requests answer in order.
                }
                RequestFlow::CloseAfterFlush => {
                    conn.phase = ConnPhase::Draining;
                    conn.close_after_flush = true;
                    return;
                }
                RequestFlow::CloseNow => {
                    *close_now = true;
                    return;
                }
                RequestFlow::Tunnel { consumed } => {
                    conn.buf_in.drain(..consumed);
                    conn.head = None;
                    conn.chunked = None;
                    conn.phase = ConnPhase::TunnelPending;
                    return;
                }
            }
        }
    }

    // ---- the request pipeline ----

    fn process_request(&mut self, idx: usize, conn: &mut Conn, close_now: &mut bool) -> RequestFlow {
        let started = Instant::now();
        let mut head = conn.head.take().expect("parsed head present");
        let chunked = conn.chunked.take();
        let head_len = head.head_len;

        let (fixed_len, consumed, chunked_decoded) = match (&head.framing, chunked) {
            (BodyFraming::Fixed(n), _) => (Some(*n), head_len + n, None),
            (BodyFraming::Chunked, Some(dec)) => (None, head_len + dec.consumed, Some(dec.decoded)),
            _ => (None, head_len, None),
        };

        // Keep-alive decision: HTTP/1.1 defaults on, HTTP/1.0 requires an
        // explicit opt-in; draining and the per-connection cap veto both.
        let served_after = conn.requests_served + 1;
        let version_allows = match head.version {
            Version::Http11 => !head.connection_close,
            Version::Http10 => head.connection_keep_alive && !head.connection_close,
        };
        let keep_alive = self.config.enable_keep_alive
            && !self.draining
            && version_allows
            && served_after < self.config.max_requests_per_connection;

        conn.requests_served = served_after;
        self.stats.requests_served += 1;

        let head_only = head.method == Method::Head;
        let version = head.version;
        let method = head.method;
        let reused = conn.requests_served > 1;
        let bytes_in_before = conn.bytes_in;
        let bytes_out_before = conn.bytes_out;

        // Trailing-slash policy pre-pass, while the head is still owned
        // mutably: Normalize rewrites the decoded path in place, Redirect
        // records the canonical target.
        let redirect_to = self.apply_trailing_slash_policy(&mut head);

        // Everything that borrows request bytes lives in this scope so the
        // inbound-buffer borrow ends before the response is queued.
        let dispatched: Dispatched = {
            let buf: &[u8] = &conn.buf_in;

            let raw_body: &[u8] = if let Some(decoded) = &chunked_decoded {
                decoded
            } else if let Some(n) = fixed_len {
                &buf[head_len..head_len + n]
            } else {
                &[]
            };

            // Undo non-chunked transfer codings, then the content-coding
            // chain, before anything downstream sees the body.
            let mut body_owned: Option<Vec<u8>> = None;
            if !head.transfer_codings.is_empty() {
                match decoder::decode_chain(&head.transfer_codings, raw_body, &self.config.decompression) {
                    Ok(decoded) => body_owned = Some(decoded),
                    Err(code) => return self.finish_error(conn, code, close_now),
                }
            }
            if self.config.decompression.enable {
                if let Some(ce) = head.headers.find(buf, "Content-Encoding") {
                    let chain = match decoder::parse_content_encoding(ce) {
                        Ok(chain) => chain,
                        Err(code) => return self.finish_error(conn, code, close_now),
                    };
                    let input: &[u8] = body_owned.as_deref().unwrap_or(raw_body);
                    match decoder::decode_chain(&chain, input, &self.config.decompression) {
                        Ok(decoded) => body_owned = Some(decoded),
                        Err(code) => return self.finish_error(conn, code, close_now),
                    }
                }
            }
            let body: &[u8] = body_owned.as_deref().unwrap_or(raw_body);

            let negotiated_result = self
                .selector
                .negotiate(head.headers.find(buf, "Accept-Encoding"));

            let mut req = Request::new(&head, buf, body, conn.tls_info.as_ref());
            let path = req.path().to_string();

            // A rejected negotiation (identity forbidden, no alternative)
            // only matters once routing reaches a real handler: CONNECT,
            // TRACE, OPTIONS *, probes, redirects and 404/405 keep their
            // documented behavior regardless of Accept-Encoding.
            let handled = if let Some(alt) = redirect_to {
                let location = match req.query_raw() {
                    Some(q) => format!("{alt}?{q}"),
                    None => alt,
                };
                Handled::Resp(Response::redirect(location), head_only)
            } else {
                self.dispatch(&mut req, conn, head_len, keep_alive, head_only, negotiated_result)
            };

            Dispatched {
                handled,
                path,
                negotiated: negotiated_result.encoding,
            }
        };

        match dispatched.handled {
            Handled::Resp(resp, head_only) => {
                let code = resp.status_code();
                match self.finalize_with_compression(resp, version, head_only, keep_alive, dispatched.negotiated) {
                    Ok(frames) => {
                        self.queue_and_flush(conn, frames, close_now);
                        self.emit_metrics(
                            code,
                            method,
                            dispatched.path,
                            reused,
                            conn.bytes_in - bytes_in_before,
                            conn.bytes_out - bytes_out_before,
                            started,
                        );
                        if keep_alive {
                            RequestFlow::KeepAlive { consumed }
                        } else {
                            RequestFlow::CloseAfterFlush
                        }
                    }
                    Err(()) => RequestFlow::CloseNow,
                }
            }
            Handled::Stream(outcome) => {
                let ended = outcome.ended;
                let must_close = outcome.must_close;
                let code = outcome.status;
                self.queue_and_flush(conn, outcome.frames, close_now);
                self.emit_metrics(
                    code,
                    method,
                    dispatched.path,
                    reused,
                    conn.bytes_in - bytes_in_before,
                    conn.bytes_out - bytes_out_before,
                    started,
                );
                if !ended {
                    RequestFlow::CloseNow
                } else if keep_alive && !must_close {
                    RequestFlow::KeepAlive { consumed }
                } else {
                    RequestFlow::CloseAfterFlush
                }
            }
            Handled::Connect(target) => self.establish_tunnel(idx, conn, target, consumed, close_now),
        }
    }

    /// Resolve the trailing-slash policy against the router. Returns a
    /// redirect target when policy is `Redirect` and only the slash
    /// differs; rewrites the path in place for `Normalize`.
    fn apply_trailing_slash_policy(&self, head: &mut crate::parser::RequestHead) -> Option<String> {
        if self.config.trailing_slash_policy == TrailingSlashPolicy::Strict {
            return None;
        }
        if head.method == Method::Connect || head.method == Method::Trace {
            return None;
        }
        let path = head.decoded_path.clone();
        if path == "/" || path == "*" {
            return None;
        }
        let lookup_method = if head.method == Method::Head { Method::Get } else { head.method };
        let direct_hit = matches!(self.router.lookup(head.method, &path), Lookup::Found { .. })
            || (head.method == Method::Head
                && matches!(self.router.lookup(Method::Get, &path), Lookup::Found { .. }));
        if direct_hit {
            return None;
        }
        let alt = if path.ends_with('/') {
            path[..path.len() - 1].to_string()
        } else {
            format!("{path}/")
        };
        let alt_hit = matches!(self.router.lookup(lookup_method, &alt), Lookup::Found { .. });
        if !alt_hit {
            return None;
        }
        match self.config.trailing_slash_policy {
            TrailingSlashPolicy::Normalize => {
                head.decoded_path = alt;
                None
            }
            TrailingSlashPolicy::Redirect => Some(alt),
            TrailingSlashPolicy::Strict => None,
        }
    }

    /// Route + handler dispatch. Read-only on the engine; returns what to
    /// send without touching the outbound queue.
    fn dispatch<'a>(
        &'a self,
        req: &mut Request<'a>,
        conn: &Conn,
        head_len: usize,
        keep_alive: bool,
        head_only: bool,
        negotiated: Negotiated,
    ) -> Handled {
        // CONNECT is policy-gated plumbing, not a routable method.
        if req.method() == Method::Connect {
            let target = req.path().to_string();
            let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(&target);
            let allowed = self.config.connect_allowlist.is_empty()
                || self.config.connect_allowlist.iter().any(|h| h == host);
            if !allowed {
                return Handled::Resp(
                    Response::new(status::FORBIDDEN)
                        .content_type("text/plain")
                        .body("CONNECT target not allowed"),
                    false,
                );
            }
            return Handled::Connect(target);
        }

        if req.method() == Method::Trace {
            return self.handle_trace(req, conn, head_len);
        }

        let probes = &self.config.builtin_probes;
        if probes.enabled
            && matches!(req.method(), Method::Get | Method::Head)
            && (req.path() == probes.liveness_path
                || req.path() == probes.readiness_path
                || req.path() == probes.startup_path)
        {
            return Handled::Resp(Response::ok("ok").content_type("text/plain"), head_only);
        }

        if req.method() == Method::Options && req.path() == "*" {
            let mask = self.router.advertised_methods();
            return Handled::Resp(
                Response::new(status::NO_CONTENT).header("Allow", format_allow(mask)),
                false,
            );
        }

        if let Some(short) = self.run_request_middleware(req) {
            return Handled::Resp(short, head_only);
        }

        let mut handled = self.route_and_invoke(req, keep_alive, head_only, negotiated);
        // Response middleware runs on buffered responses only; a stream's
        // headers may already be on the wire when the handler returns.
        if let Handled::Resp(resp, _) = &mut handled {
            self.middleware.run_post(req, resp);
        }
        handled
    }

    fn run_request_middleware(&self, req: &Request<'_>) -> Option<Response> {
        for mw in &self.middleware.pre {
            match catch_unwind(AssertUnwindSafe(|| mw(req))) {
                Ok(MiddlewareFlow::Continue) => {}
                Ok(MiddlewareFlow::ShortCircuit(resp)) => return Some(resp),
                Err(_) => {
                    tracing::error!("request middleware panicked");
                    return Some(Response::internal_error());
                }
            }
        }
        None
    }

    fn handle_trace(&self, req: &Request<'_>, conn: &Conn, head_len: usize) -> Handled {
        let enabled = match self.config.trace_method_policy {
            TraceMethodPolicy::Disabled => false,
            TraceMethodPolicy::EnabledPlainAndTls => true,
            TraceMethodPolicy::EnabledPlainOnly => conn.tls_info.is_none(),
        };
        if !enabled {
            let mask = self.router.allowed_methods(req.path());
            let mut resp = Response::new(status::METHOD_NOT_ALLOWED)
                .content_type("text/plain")
                .body("Method Not Allowed");
            if mask != 0 {
                resp = resp.header("Allow", format_allow(mask));
            }
            return Handled::Resp(resp, false);
        }
        // Echo the request head verbatim.
        let echo = conn.buf_in[..head_len].to_vec();
        Handled::Resp(Response::ok(echo).content_type("message/http"), false)
    }

    fn route_and_invoke<'a>(
        &'a self,
        req: &mut Request<'a>,
        keep_alive: bool,
        head_only: bool,
        negotiated: Negotiated,
    ) -> Handled {
        let path = req.path();
        let mut lookup = self.router.lookup(req.method(), path);
        // HEAD falls back to the GET handler with the body suppressed.
        if head_only && !matches!(lookup, Lookup::Found { .. }) {
            lookup = self.router.lookup(Method::Get, path);
        }

        match lookup {
            Lookup::Found { target, params } => {
                // Negotiation failed outright (identity forbidden, nothing
                // acceptable compiled in): the framing step cannot encode
                // any handler output, so the 406 stands in for invoking the
                // handler. For streams this has to happen up front, before
                // headers could reach the wire.
                if negotiated.reject {
                    return Handled::Resp(not_acceptable(), head_only);
                }
                req.set_params(params);
                match target {
                    RouteTarget::Buffered(handler) => {
                        let handler = handler.clone();
                        match catch_unwind(AssertUnwindSafe(|| handler(req))) {
                            Ok(resp) => Handled::Resp(resp, head_only),
                            Err(_) => {
                                tracing::error!(path = %req.path(), "handler panicked");
                                Handled::Resp(Response::internal_error(), head_only)
                            }
                        }
                    }
                    RouteTarget::Streaming(handler) => {
                        let handler = handler.clone();
                        let ctx = WriterCtx {
                            version: req.version(),
                            head_only,
                            keep_alive,
                            date: self.date.bytes(),
                            global_headers: &self.config.global_headers,
                            max_outbound_bytes: self.config.max_outbound_buffer_bytes,
                            negotiated: negotiated.encoding,
                            compression: &self.config.compression,
                            encoders: &self.encoders,
                        };
                        let mut writer = ResponseWriter::new(ctx);
                        let panicked =
                            catch_unwind(AssertUnwindSafe(|| handler(req, &mut writer))).is_err();
                        if panicked {
                            tracing::error!(path = %req.path(), "streaming handler panicked");
                            if !writer.headers_sent() {
                                return Handled::Resp(Response::internal_error(), head_only);
                            }
                            // Headers already on the wire: nothing sane to
                            // send, surface as an unfinished stream.
                            let mut outcome = writer.into_outcome();
                            outcome.ended = false;
                            return Handled::Stream(outcome);
                        }
                        let _ = writer.end();
                        Handled::Stream(writer.into_outcome())
                    }
                }
            }
            Lookup::MethodMissing(mask) => Handled::Resp(
                Response::new(status::METHOD_NOT_ALLOWED)
                    .content_type("text/plain")
                    .body("Method Not Allowed")
                    .header("Allow", format_allow(mask)),
                head_only,
            ),
            Lookup::NotFound => Handled::Resp(Response::not_found(), head_only),
        }
    }

    // ---- response finalization ----

    fn finalize_with_compression(
        &mut self,
        mut resp: Response,
        version: Version,
        head_only: bool,
        keep_alive: bool,
        negotiated: Option<Encoding>,
    ) -> Result<Vec<Vec<u8>>, ()> {
        if let Err(err) = self.apply_buffered_compression(&mut resp, negotiated) {
            tracing::error!(%err, "response encoding failed");
            return Err(());
        }
        Ok(self.finalize_buffered(resp, version, head_only, keep_alive))
    }

    fn apply_buffered_compression(&self, resp: &mut Response, negotiated: Option<Encoding>) -> ServerResult<()> {
        let codec = match negotiated {
            Some(Encoding::Identity) | None => return Ok(()),
            Some(codec) => codec,
        };
        let cfg = &self.config.compression;
        if resp.body_bytes().len() < cfg.min_bytes {
            return Ok(());
        }
        if resp.header_value("Content-Encoding").is_some() {
            return Ok(());
        }
        if cfg.allow_per_response_disable && resp.compression_disabled() {
            return Ok(());
        }
        let content_type = resp.header_value("Content-Type").unwrap_or("");
        let type_ok = cfg.content_type_allowlist.is_empty()
            || cfg.content_type_allowlist.iter().any(|p| content_type.starts_with(p));
        if !type_ok {
            return Ok(());
        }
        let Some(encoder) = self.encoders[codec as usize].as_ref() else {
            return Ok(());
        };
        let compressed = encoder.encode_full(resp.body_bytes())?;
        resp.replace_body(compressed);
        resp.set_header_unchecked("Content-Encoding", codec.token().to_string());
        if cfg.add_vary_header {
            resp.merge_header_value("Vary", "Accept-Encoding");
        }
        Ok(())
    }

    fn finalize_buffered(&self, resp: Response, version: Version, head_only: bool, keep_alive: bool) -> Vec<Vec<u8>> {
        let ctx = SerializeCtx {
            version,
            head_only,
            keep_alive,
            date: self.date.bytes(),
            global_headers: &self.config.global_headers,
            min_captured_body_size: self.config.min_captured_body_size,
        };
        let out = response::serialize(&resp, &ctx);
        let mut frames = vec![out.head];
        if let Some(body) = out.body {
            frames.push(body);
        }
        frames
    }

    fn emit_metrics(
        &self,
        status: StatusCode,
        method: Method,
        path: String,
        reused_connection: bool,
        bytes_in: u64,
        bytes_out: u64,
        started: Instant,
    ) {
        if let Some(cb) = &self.metrics_cb {
            let record = RequestMetrics {
                status,
                method,
                path,
                reused_connection,
                bytes_in,
                bytes_out,
                duration: started.elapsed(),
            };
            let _ = catch_unwind(AssertUnwindSafe(|| cb(&record)));
        }
    }

    // ---- error responses ----

    fn emit_parser_error(&mut self, conn: &mut Conn, code: StatusCode, close_now: &mut bool) {
        if let Some(cb) = &self.parser_error_cb {
            let _ = catch_unwind(AssertUnwindSafe(|| cb(code)));
        }
        let _ = self.finish_error(conn, code, close_now);
    }

    /// Queue a canonical error response and mark the connection to close
    /// once it flushed.
    fn finish_error(&mut self, conn: &mut Conn, code: StatusCode, close_now: &mut bool) -> RequestFlow {
        let resp = Response::new(code)
            .content_type("text/plain")
            .body(status::reason(code));
        let frames = self.finalize_buffered(resp, Version::Http11, false, false);
        self.queue_and_flush(conn, frames, close_now);
        conn.phase = ConnPhase::Draining;
        conn.close_after_flush = true;
        RequestFlow::CloseAfterFlush
    }

    // ---- outbound ----

    fn queue_and_flush(&mut self, conn: &mut Conn, frames: Vec<Vec<u8>>, close_now: &mut bool) {
        for frame in frames {
            self.stats.bytes_queued_total += frame.len() as u64;
            conn.queue_out(frame);
        }
        if conn.out_bytes > self.stats.max_connection_outbound_buffer {
            self.stats.max_connection_outbound_buffer = conn.out_bytes;
        }
        self.flush_outbound(conn, true, close_now);
    }

    fn flush_outbound(&mut self, conn: &mut Conn, immediate: bool, close_now: &mut bool) {
        if !immediate {
            self.stats.flush_cycles += 1;
        }
        loop {
            let Some(front) = conn.out.front() else { break };
            let slice = &front.data[front.offset..];
            let attempted = slice.len();
            match conn.transport.try_write(conn.fd, slice) {
                Ok(TryWrite::Data(n)) => {
                    conn.advance_out(n);
                    conn.bytes_out += n as u64;
                    if immediate {
                        self.stats.bytes_written_immediate += n as u64;
                    } else {
                        self.stats.bytes_written_flush += n as u64;
                    }
                    if n < attempted {
                        // Socket buffer filled mid-chunk; EPOLLOUT resumes.
                        break;
                    }
                }
                Ok(TryWrite::WouldBlock) => break,
                Err(err) => {
                    tracing::debug!(%err, "write failed");
                    *close_now = true;
                    return;
                }
            }
        }
    }

    // ---- CONNECT tunneling ----

    fn establish_tunnel(
        &mut self,
        client_idx: usize,
        conn: &mut Conn,
        target: String,
        consumed: usize,
        close_now: &mut bool,
    ) -> RequestFlow {
        use std::net::ToSocketAddrs;
        let addr = match target.to_socket_addrs().ok().and_then(|mut it| it.next()) {
            Some(addr) => addr,
            None => {
                tracing::debug!(target = %target, "CONNECT target did not resolve");
                return self.finish_error(conn, status::BAD_GATEWAY, close_now);
            }
        };
        let peer_fd = match syscalls::connect_nonblocking(&addr) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::debug!(%err, "CONNECT connect() failed");
                return self.finish_error(conn, status::BAD_GATEWAY, close_now);
            }
        };

        let mut peer = Box::new(Conn::new(peer_fd, Box::new(PlainTransport), false, Instant::now()));
        peer.phase = ConnPhase::TunnelConnecting;
        peer.tunnel_peer = Some(client_idx);
        let Some(peer_idx) = self.slab.allocate(peer) else {
            syscalls::close_fd(peer_fd);
            return self.finish_error(conn, status::BAD_GATEWAY, close_now);
        };
        if let Err(err) = self.event_loop.add(peer_fd, peer_idx as u64, false, true) {
            tracing::warn!(%err, "epoll add failed for tunnel target");
            self.slab.free(peer_idx);
            syscalls::close_fd(peer_fd);
            return self.finish_error(conn, status::BAD_GATEWAY, close_now);
        }
        conn.tunnel_peer = Some(peer_idx);
        RequestFlow::Tunnel { consumed }
    }

    /// The async connect on the target side resolved; `peer` is the
    /// upstream connection whose writability fired.
    fn finish_tunnel_connect(&mut self, peer: &mut Conn, close_now: &mut bool) {
        let client_idx = match peer.tunnel_peer {
            Some(idx) => idx,
            None => {
                *close_now = true;
                return;
            }
        };
        if let Some(err) = syscalls::take_socket_error(peer.fd) {
            tracing::debug!(%err, "CONNECT target refused");
            *close_now = true;
            if let Some(mut client) = self.slab.take(client_idx) {
                client.tunnel_peer = None;
                let mut client_close = false;
                let _ = self.finish_error(&mut client, status::BAD_GATEWAY, &mut client_close);
                if client_close || client.out_is_empty() || !self.rearm(client_idx, &mut client) {
                    self.teardown(client_idx, client);
                } else {
                    self.slab.put(client_idx, client);
                }
            }
            return;
        }

        peer.phase = ConnPhase::Tunneling;
        if let Some(mut client) = self.slab.take(client_idx) {
            client.phase = ConnPhase::Tunneling;
            let mut client_close = false;
            self.queue_and_flush(&mut client, vec![b"HTTP/1.1 200 OK\r\n\r\n".to_vec()], &mut client_close);
            // Bytes the client sent optimistically before the tunnel came
            // up are forwarded now.
            let early = std::mem::take(&mut client.buf_in);
            if !early.is_empty() {
                peer.queue_out(early);
                self.flush_outbound(peer, true, close_now);
            }
            if client_close || !self.rearm(client_idx, &mut client) {
                self.teardown(client_idx, client);
                *close_now = true;
                return;
            }
            self.slab.put(client_idx, client);
        } else {
            *close_now = true;
        }
    }

    /// Forward bytes from one tunnel side to its peer.
    fn tunnel_read(&mut self, conn: &mut Conn, close_now: &mut bool) {
        let Some(peer_idx) = conn.tunnel_peer else {
            *close_now = true;
            return;
        };
        let mut buf = vec![0u8; self.config.body_read_chunk_bytes];
        loop {
            match conn.transport.try_read(conn.fd, &mut buf) {
                Ok(TryRead::Data(n)) => {
                    conn.bytes_in += n as u64;
                    conn.last_active = Instant::now();
                    let Some(peer) = self.slab.get_mut(peer_idx) else {
                        *close_now = true;
                        return;
                    };
                    peer.queue_out(buf[..n].to_vec());
                    if peer.out_bytes > self.config.max_outbound_buffer_bytes {
                        // Forwarding backpressure: drop the pair rather
                        // than buffer without bound.
                        *close_now = true;
                        return;
                    }
                }
                Ok(TryRead::WouldBlock) => break,
                Ok(TryRead::Closed) | Err(_) => {
                    // EOF tears the pair down, but only after bytes read in
                    // this pass were forwarded below.
                    *close_now = true;
                    break;
                }
            }
        }
        // Flush what was just queued on the peer.
        if let Some(mut peer) = self.slab.take(peer_idx) {
            let mut peer_close = false;
            self.flush_outbound(&mut peer, true, &mut peer_close);
            if peer_close || !self.rearm(peer_idx, &mut peer) {
                self.teardown(peer_idx, peer);
                *close_now = true;
            } else {
                self.slab.put(peer_idx, peer);
            }
        }
    }

    // ---- lifecycle ----

    fn rearm(&mut self, idx: usize, conn: &mut Conn) -> bool {
        let want_read = match conn.phase {
            ConnPhase::Handshaking => conn.transport.wants_read(),
            ConnPhase::ReadingHead | ConnPhase::ReadingFixedBody | ConnPhase::ReadingChunkedBody => true,
            ConnPhase::TunnelPending | ConnPhase::Tunneling => true,
            ConnPhase::TunnelConnecting => false,
            ConnPhase::Draining | ConnPhase::Closing => false,
        };
        let want_write = !conn.out_is_empty()
            || conn.transport.wants_write()
            || conn.phase == ConnPhase::TunnelConnecting;
        if want_write && !conn.armed_writable {
            self.stats.deferred_write_events += 1;
        }
        conn.armed_writable = want_write;

        match self.event_loop.modify(conn.fd, idx as u64, want_read, want_write) {
            Ok(()) => true,
            Err(err) => {
                let benign = matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT));
                if benign {
                    // The fd raced with a close on an earlier error branch.
                    tracing::warn!(%err, "epoll modify raced with close");
                } else {
                    tracing::error!(%err, "epoll modify failed");
                }
                self.stats.epoll_mod_failures += 1;
                false
            }
        }
    }

    fn teardown(&mut self, idx: usize, conn: Box<Conn>) {
        let _ = self.event_loop.remove(conn.fd);
        syscalls::close_fd(conn.fd);
        self.slab.release_taken(idx);
        if let Some(peer_idx) = conn.tunnel_peer {
            if let Some(peer) = self.slab.free(peer_idx) {
                let _ = self.event_loop.remove(peer.fd);
                syscalls::close_fd(peer.fd);
            }
        }
    }

    /// Periodic housekeeping: slow-header 408s, keep-alive idle closes,
    /// TLS handshake deadlines, drain enforcement.
    fn sweep(&mut self, now: Instant) {
        let header_timeout = self.config.header_read_timeout;
        let ka_timeout = self.config.keep_alive_timeout;
        #[cfg(feature = "tls")]
        let hs_timeout = self.config.tls.handshake_timeout;
        let drain_expired = self.drain_deadline.is_some_and(|d| now >= d);

        for idx in self.slab.active_indices() {
            let Some(conn) = self.slab.get(idx) else { continue };

            let mut expire_silently = false;
            let mut expire_408 = false;

            match conn.phase {
                ConnPhase::ReadingHead => {
                    if header_timeout > Duration::ZERO
                        && conn
                            .head_started_at
                            .is_some_and(|t| now.duration_since(t) >= header_timeout)
                    {
                        expire_408 = true;
                    } else if conn.head_started_at.is_none()
                        && ka_timeout > Duration::ZERO
                        && now.duration_since(conn.last_active) >= ka_timeout
                    {
                        expire_silently = true;
                    }
                }
                ConnPhase::ReadingFixedBody | ConnPhase::ReadingChunkedBody => {
                    if ka_timeout > Duration::ZERO
                        && now.duration_since(conn.last_active) >= ka_timeout.max(header_timeout)
                    {
                        expire_silently = true;
                    }
                }
                ConnPhase::Handshaking => {
                    #[cfg(feature = "tls")]
                    if hs_timeout > Duration::ZERO && now.duration_since(conn.created_at) >= hs_timeout {
                        expire_silently = true;
                    }
                }
                _ => {}
            }
            if drain_expired {
                expire_silently = true;
            }
            if !expire_silently && !expire_408 {
                continue;
            }

            let Some(mut conn) = self.slab.take(idx) else { continue };
            if expire_408 && !drain_expired {
                // Best-effort 408 before the close.
                let mut ignored = false;
                let resp = Response::new(status::REQUEST_TIMEOUT)
                    .content_type("text/plain")
                    .body(status::reason(status::REQUEST_TIMEOUT));
                let frames = self.finalize_buffered(resp, Version::Http11, false, false);
                self.queue_and_flush(&mut conn, frames, &mut ignored);
            }
            self.teardown(idx, conn);
        }
    }
}

/// Canonical 406 for a failed content-coding negotiation.
fn not_acceptable() -> Response {
    Response::new(status::NOT_ACCEPTABLE)
        .content_type("text/plain")
        .body("No acceptable content-coding available")
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(fd) = self.listen_fd.take() {
            syscalls::close_fd(fd);
        }
        for idx in self.slab.active_indices() {
            if let Some(conn) = self.slab.free(idx) {
                syscalls::close_fd(conn.fd);
            }
        }
    }
}
