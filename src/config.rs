// src/config.rs
use std::time::Duration;

use crate::encoding::Encoding;
use crate::error::{ServerError, ServerResult};

/// Trailing-slash handling for router lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingSlashPolicy {
    /// No coercion: `/x` and `/x/` are distinct.
    #[default]
    Strict,
    /// Retry the lookup with the slash toggled when the first match misses.
    Normalize,
    /// Answer 301 with the canonical form when only the slash differs.
    Redirect,
}

/// TRACE is disabled by default; it can leak proxy-injected headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMethodPolicy {
    #[default]
    Disabled,
    EnabledPlainAndTls,
    EnabledPlainOnly,
}

/// Compression activation for streaming responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectCompressionMode {
    /// Activate once cumulative bytes reach `min_bytes` and the
    /// content-type passes the allowlist.
    #[default]
    Auto,
    /// Never compress this stream.
    Off,
    /// Compress from the first byte, skipping size and type gating.
    On,
}

/// Outbound response compression settings.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Preferred negotiation order. Empty means every compiled-in codec in
    /// enumeration order. A non-empty list is the complete advertised set:
    /// codecs absent from it are never selected.
    pub preferred_formats: Vec<Encoding>,
    /// zlib/gzip compression level (flate2 scale 0-9).
    pub zlib_level: u32,
    /// zstd compression level.
    pub zstd_level: i32,
    /// zstd window log; 0 selects the library default.
    pub zstd_window_log: u32,
    /// brotli quality 0-11.
    pub brotli_quality: u32,
    /// brotli lg_window; 0 selects the library default (22).
    pub brotli_window: u32,
    /// Only bodies of at least this many bytes are considered.
    pub min_bytes: usize,
    /// Content-type prefixes eligible for compression. An empty list
    /// means every content-type is eligible.
    pub content_type_allowlist: Vec<String>,
    /// Merge `Vary: Accept-Encoding` into compressed responses.
    pub add_vary_header: bool,
    /// Honor a handler-set `Content-Encoding` as an opt-out.
    pub allow_per_response_disable: bool,
    /// Streaming activation mode.
    pub direct_mode: DirectCompressionMode,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            preferred_formats: Vec::new(),
            zlib_level: 6,
            zstd_level: 3,
            zstd_window_log: 0,
            brotli_quality: 5,
            brotli_window: 0,
            min_bytes: 256,
            content_type_allowlist: Vec::new(),
            add_vary_header: true,
            allow_per_response_disable: true,
            direct_mode: DirectCompressionMode::Auto,
        }
    }
}

/// Inbound request body decompression settings.
#[derive(Debug, Clone)]
pub struct DecompressionConfig {
    /// When false, bodies with `Content-Encoding` pass through verbatim.
    pub enable: bool,
    /// Cap on the compressed payload we are willing to inflate. 0 = only
    /// the global `max_body_bytes` applies.
    pub max_compressed_bytes: usize,
    /// Absolute cap on the decompressed size; exceeding rejects with 413.
    pub max_decompressed_bytes: usize,
    /// Granularity of output buffer growth while inflating.
    pub decoder_chunk_size: usize,
    /// Compressed payloads at or above this size use the incremental
    /// decode path instead of one-shot inflation. 0 = always one-shot.
    pub streaming_threshold_bytes: usize,
    /// Reject when decompressed > compressed * ratio. 0.0 disables.
    pub max_expansion_ratio: f64,
}

impl Default for DecompressionConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_compressed_bytes: 0,
            max_decompressed_bytes: 1 << 32,
            decoder_chunk_size: 32 * 1024,
            streaming_threshold_bytes: 1 << 24,
            max_expansion_ratio: 0.0,
        }
    }
}

/// TLS termination settings. Consumed by the rustls transport when the
/// `tls` feature is enabled; constructing a server with `tls` config but
/// without the feature is a configuration error.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    /// OpenSSL-style cipher preference string. rustls negotiates from its
    /// own vetted set; the list is logged for operator visibility only.
    pub cipher_list: Option<String>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub request_client_cert: bool,
    pub require_client_cert: bool,
    /// PEM bundles of individually trusted client certificates.
    pub trusted_client_certs: Vec<String>,
    /// ALPN preference order, e.g. ["http/1.1"].
    pub alpn_protocols: Vec<String>,
    /// Abort the handshake when no ALPN protocol overlaps.
    pub alpn_must_match: bool,
    pub log_handshakes: bool,
    /// Connections still handshaking after this deadline are closed.
    pub handshake_timeout: Duration,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.cert_file.is_some() || self.cert_pem.is_some()
    }
}

/// Kubernetes-style builtin probe endpoints, answered before routing.
#[derive(Debug, Clone)]
pub struct BuiltinProbesConfig {
    pub enabled: bool,
    pub liveness_path: String,
    pub readiness_path: String,
    pub startup_path: String,
}

impl Default for BuiltinProbesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            liveness_path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
            startup_path: "/startupz".to_string(),
        }
    }
}

/// Immutable server configuration. Built once with the `with_*` methods,
/// validated at server construction, then read-only for the engine's
/// lifetime. `port` is the single field the engine writes back: binding
/// port 0 stores the kernel-chosen ephemeral port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Listener
    pub port: u16,
    pub bind_address: String,
    pub reuse_port: bool,
    pub tcp_nodelay: bool,

    // Keep-alive lifecycle
    pub enable_keep_alive: bool,
    pub max_requests_per_connection: u32,
    pub keep_alive_timeout: Duration,

    // Parsing and body limits
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub min_captured_body_size: usize,

    // Outbound buffering
    pub max_outbound_buffer_bytes: usize,

    // Loop pacing
    pub poll_interval: Duration,
    pub header_read_timeout: Duration,

    // Read pump tuning
    pub initial_read_chunk_bytes: usize,
    pub body_read_chunk_bytes: usize,
    pub max_per_event_read_bytes: usize,

    // Header semantics
    pub merge_unknown_request_headers: bool,

    // Appended to responses when the handler did not set them.
    pub global_headers: Vec<(String, String)>,

    pub trace_method_policy: TraceMethodPolicy,
    pub trailing_slash_policy: TrailingSlashPolicy,

    /// Exact-match CONNECT target hosts. Empty allows any target.
    pub connect_allowlist: Vec<String>,

    pub compression: CompressionConfig,
    pub decompression: DecompressionConfig,
    pub tls: TlsConfig,
    pub builtin_probes: BuiltinProbesConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_address: "0.0.0.0".to_string(),
            reuse_port: false,
            tcp_nodelay: false,
            enable_keep_alive: true,
            max_requests_per_connection: 100,
            keep_alive_timeout: Duration::from_millis(5000),
            max_header_bytes: 8192,
            max_body_bytes: 1 << 28,
            min_captured_body_size: 8192,
            max_outbound_buffer_bytes: 4 << 20,
            poll_interval: Duration::from_millis(500),
            header_read_timeout: Duration::ZERO,
            initial_read_chunk_bytes: 4096,
            body_read_chunk_bytes: 8192,
            max_per_event_read_bytes: 0,
            merge_unknown_request_headers: true,
            global_headers: vec![("Server".to_string(), "aeronet".to_string())],
            trace_method_policy: TraceMethodPolicy::Disabled,
            trailing_slash_policy: TrailingSlashPolicy::Strict,
            connect_allowlist: Vec::new(),
            compression: CompressionConfig::default(),
            decompression: DecompressionConfig::default(),
            tls: TlsConfig::default(),
            builtin_probes: BuiltinProbesConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn with_tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }

    pub fn with_keep_alive(mut self, on: bool) -> Self {
        self.enable_keep_alive = on;
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_min_captured_body_size(mut self, bytes: usize) -> Self {
        self.min_captured_body_size = bytes;
        self
    }

    pub fn with_max_outbound_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_outbound_buffer_bytes = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Slowloris mitigation; zero disables.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn with_read_chunk_strategy(mut self, initial: usize, body: usize) -> Self {
        self.initial_read_chunk_bytes = initial;
        self.body_read_chunk_bytes = body;
        self
    }

    pub fn with_max_per_event_read_bytes(mut self, cap: usize) -> Self {
        self.max_per_event_read_bytes = cap;
        self
    }

    pub fn with_merge_unknown_request_headers(mut self, on: bool) -> Self {
        self.merge_unknown_request_headers = on;
        self
    }

    pub fn with_global_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.global_headers = headers;
        self
    }

    pub fn with_global_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_trace_policy(mut self, policy: TraceMethodPolicy) -> Self {
        self.trace_method_policy = policy;
        self
    }

    pub fn with_trailing_slash_policy(mut self, policy: TrailingSlashPolicy) -> Self {
        self.trailing_slash_policy = policy;
        self
    }

    pub fn with_connect_allowlist<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connect_allowlist = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compression(mut self, cfg: CompressionConfig) -> Self {
        self.compression = cfg;
        self
    }

    pub fn with_decompression(mut self, cfg: DecompressionConfig) -> Self {
        self.decompression = cfg;
        self
    }

    pub fn with_tls_cert_key(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.tls.cert_file = Some(cert_file.into());
        self.tls.key_file = Some(key_file.into());
        self
    }

    pub fn with_tls_cert_key_memory(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.tls.cert_pem = Some(cert_pem.into());
        self.tls.key_pem = Some(key_pem.into());
        self
    }

    pub fn with_tls_alpn_protocols<I, S>(mut self, protos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tls.alpn_protocols = protos.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tls_alpn_must_match(mut self, on: bool) -> Self {
        self.tls.alpn_must_match = on;
        self
    }

    pub fn with_tls_request_client_cert(mut self, on: bool) -> Self {
        self.tls.request_client_cert = on;
        self
    }

    pub fn with_tls_require_client_cert(mut self, on: bool) -> Self {
        self.tls.require_client_cert = on;
        if on {
            self.tls.request_client_cert = true;
        }
        self
    }

    pub fn with_tls_trusted_client_cert(mut self, cert_pem: impl Into<String>) -> Self {
        self.tls.trusted_client_certs.push(cert_pem.into());
        self
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls.handshake_timeout = timeout;
        self
    }

    pub fn with_tls_handshake_logging(mut self, on: bool) -> Self {
        self.tls.log_handshakes = on;
        self
    }

    pub fn with_builtin_probes(mut self, cfg: BuiltinProbesConfig) -> Self {
        self.builtin_probes = cfg;
        self
    }

    pub fn enable_builtin_probes(mut self, on: bool) -> Self {
        self.builtin_probes.enabled = on;
        self
    }

    /// Structural checks that must fail fast; deeper validation of
    /// collaborator objects happens in their own constructors.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_header_bytes == 0 {
            return Err(ServerError::Config("max_header_bytes must be non-zero".into()));
        }
        if self.initial_read_chunk_bytes == 0 || self.body_read_chunk_bytes == 0 {
            return Err(ServerError::Config("read chunk sizes must be non-zero".into()));
        }
        if self.decompression.decoder_chunk_size == 0 {
            return Err(ServerError::Config("decoder_chunk_size must be non-zero".into()));
        }
        let ratio = self.decompression.max_expansion_ratio;
        if ratio != 0.0 && ratio < 1.0 {
            return Err(ServerError::Config(
                "max_expansion_ratio must be 0 (disabled) or >= 1.0".into(),
            ));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(ServerError::Config("TLS cert and key must both be set".into()));
        }
        if self.tls.cert_pem.is_some() != self.tls.key_pem.is_some() {
            return Err(ServerError::Config("TLS cert and key PEM must both be set".into()));
        }
        if self.tls.require_client_cert && !self.tls.request_client_cert {
            return Err(ServerError::Config(
                "require_client_cert implies request_client_cert".into(),
            ));
        }
        #[cfg(not(feature = "tls"))]
        if self.tls.is_configured() {
            return Err(ServerError::Config(
                "TLS configured but the `tls` feature is not compiled in".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ServerConfig::new()
            .with_port(8080)
            .with_reuse_port(true)
            .with_max_requests_per_connection(2)
            .with_trailing_slash_policy(TrailingSlashPolicy::Redirect);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.reuse_port);
        assert_eq!(cfg.max_requests_per_connection, 2);
        assert_eq!(cfg.trailing_slash_policy, TrailingSlashPolicy::Redirect);
    }

    #[test]
    fn test_invalid_expansion_ratio_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.decompression.max_expansion_ratio = 0.5;
        assert!(matches!(cfg.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_mismatched_tls_pair_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.tls.cert_file = Some("cert.pem".into());
        assert!(matches!(cfg.validate(), Err(ServerError::Config(_))));
    }
}
