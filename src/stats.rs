// src/stats.rs
//
// Per-engine counters. Everything is owned and mutated by the event-loop
// thread; `snapshot()` copies into the public value type, so readers get
// a coherent view without any locking.

/// Outbound-path counters kept by the engine.
#[derive(Debug, Default, Clone)]
pub(crate) struct StatsInternal {
    pub bytes_queued_total: u64,
    pub bytes_written_immediate: u64,
    pub bytes_written_flush: u64,
    pub deferred_write_events: u64,
    pub flush_cycles: u64,
    pub epoll_mod_failures: u64,
    pub max_connection_outbound_buffer: usize,
    pub requests_served: u64,
    pub connections_accepted: u64,
}

/// TLS counters, populated only when the `tls` feature terminates
/// handshakes in this engine.
#[derive(Debug, Default, Clone)]
pub struct TlsStats {
    pub handshakes_succeeded: u64,
    pub alpn_strict_mismatches: u64,
    /// (protocol, count) pairs in first-seen order.
    pub alpn_distribution: Vec<(String, u64)>,
    pub cipher_counts: Vec<(String, u64)>,
    pub version_counts: Vec<(String, u64)>,
    pub client_cert_present: u64,
    pub handshake_duration_count: u64,
    pub handshake_duration_total_ns: u64,
    pub handshake_duration_max_ns: u64,
}

impl TlsStats {
    pub(crate) fn record_handshake(
        &mut self,
        alpn: Option<&str>,
        cipher: Option<&str>,
        version: Option<&str>,
        client_cert: bool,
        duration_ns: u64,
    ) {
        self.handshakes_succeeded += 1;
        if let Some(proto) = alpn {
            bump(&mut self.alpn_distribution, proto);
        }
        if let Some(cipher) = cipher {
            bump(&mut self.cipher_counts, cipher);
        }
        if let Some(version) = version {
            bump(&mut self.version_counts, version);
        }
        if client_cert {
            self.client_cert_present += 1;
        }
        self.handshake_duration_count += 1;
        self.handshake_duration_total_ns += duration_ns;
        self.handshake_duration_max_ns = self.handshake_duration_max_ns.max(duration_ns);
    }
}

fn bump(entries: &mut Vec<(String, u64)>, key: &str) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some((_, n)) => *n += 1,
        None => entries.push((key.to_string(), 1)),
    }
}

/// Public point-in-time snapshot of an engine's counters.
#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    pub bytes_queued_total: u64,
    pub bytes_written_immediate: u64,
    pub bytes_written_flush: u64,
    pub deferred_write_events: u64,
    pub flush_cycles: u64,
    pub epoll_mod_failures: u64,
    pub max_connection_outbound_buffer: usize,
    pub requests_served: u64,
    pub connections_accepted: u64,
    pub active_connections: usize,
    pub tls: TlsStats,
}

impl StatsInternal {
    pub(crate) fn snapshot(&self, active_connections: usize, tls: TlsStats) -> ServerStats {
        ServerStats {
            bytes_queued_total: self.bytes_queued_total,
            bytes_written_immediate: self.bytes_written_immediate,
            bytes_written_flush: self.bytes_written_flush,
            deferred_write_events: self.deferred_write_events,
            flush_cycles: self.flush_cycles,
            epoll_mod_failures: self.epoll_mod_failures,
            max_connection_outbound_buffer: self.max_connection_outbound_buffer,
            requests_served: self.requests_served,
            connections_accepted: self.connections_accepted,
            active_connections,
            tls,
        }
    }
}
