// src/tls.rs
//
// rustls-backed TLS termination behind the Transport trait. The engine
// owns one TlsContext (an Arc'd rustls ServerConfig: stable address no
// matter where the engine itself moves) and every TLS connection drives
// its own ServerConnection session.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig, ServerConnection};

use crate::config::TlsConfig;
use crate::error::{ServerError, ServerResult};
use crate::request::TlsInfo;
use crate::transport::{Handshake, Transport, TryRead, TryWrite};
use crate::syscalls::{self, ReadOutcome, WriteOutcome};

/// Engine-wide TLS state built once from the config.
pub struct TlsContext {
    server_config: Arc<RustlsServerConfig>,
    pub log_handshakes: bool,
    pub alpn_must_match: bool,
}

impl TlsContext {
    pub fn new(cfg: &TlsConfig) -> ServerResult<Self> {
        let certs = load_certs(cfg)?;
        let key = load_key(cfg)?;

        let versions = protocol_versions(cfg)?;
        let builder = RustlsServerConfig::builder_with_protocol_versions(&versions);

        let builder = if cfg.request_client_cert || cfg.require_client_cert {
            let mut roots = RootCertStore::empty();
            for pem in &cfg.trusted_client_certs {
                for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                    let cert = cert.map_err(|e| ServerError::Tls(format!("bad trusted client cert: {e}")))?;
                    roots
                        .add(cert)
                        .map_err(|e| ServerError::Tls(format!("bad trusted client cert: {e}")))?;
                }
            }
            if roots.is_empty() {
                return Err(ServerError::Tls(
                    "client certificates requested but no trusted client certs configured".into(),
                ));
            }
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if cfg.require_client_cert {
                verifier_builder.build()
            } else {
                verifier_builder.allow_unauthenticated().build()
            }
            .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(format!("certificate/key rejected: {e}")))?;

        server_config.alpn_protocols = cfg
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        if let Some(ciphers) = &cfg.cipher_list {
            // rustls negotiates from its own vetted suite set; a legacy
            // OpenSSL-style preference string is informational only.
            tracing::warn!(cipher_list = %ciphers, "cipher_list is not enforceable with rustls; using library defaults");
        }

        Ok(Self {
            server_config: Arc::new(server_config),
            log_handshakes: cfg.log_handshakes,
            alpn_must_match: cfg.alpn_must_match,
        })
    }

    pub fn new_transport(&self) -> ServerResult<TlsTransport> {
        let session = ServerConnection::new(self.server_config.clone())
            .map_err(|e| ServerError::Tls(format!("session setup: {e}")))?;
        Ok(TlsTransport {
            session,
            info: None,
            alpn_mismatch: false,
        })
    }
}

fn load_certs(cfg: &TlsConfig) -> ServerResult<Vec<CertificateDer<'static>>> {
    let pem = match (&cfg.cert_pem, &cfg.cert_file) {
        (Some(pem), _) => pem.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| ServerError::Tls(format!("reading certificate `{path}`: {e}")))?,
        (None, None) => return Err(ServerError::Tls("no certificate configured".into())),
    };
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("parsing certificate: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("certificate PEM contains no certificates".into()));
    }
    Ok(certs)
}

fn load_key(cfg: &TlsConfig) -> ServerResult<PrivateKeyDer<'static>> {
    let pem = match (&cfg.key_pem, &cfg.key_file) {
        (Some(pem), _) => pem.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| ServerError::Tls(format!("reading key `{path}`: {e}")))?,
        (None, None) => return Err(ServerError::Tls("no private key configured".into())),
    };
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ServerError::Tls(format!("parsing key: {e}")))?
        .ok_or_else(|| ServerError::Tls("key PEM contains no private key".into()))
}

fn protocol_versions(cfg: &TlsConfig) -> ServerResult<Vec<&'static rustls::SupportedProtocolVersion>> {
    fn rank(v: &str) -> ServerResult<u16> {
        match v {
            "1.2" | "TLSv1.2" | "tlsv1.2" => Ok(2),
            "1.3" | "TLSv1.3" | "tlsv1.3" => Ok(3),
            other => Err(ServerError::Tls(format!("unsupported TLS version `{other}`"))),
        }
    }
    let min = cfg.min_version.as_deref().map(rank).transpose()?.unwrap_or(2);
    let max = cfg.max_version.as_deref().map(rank).transpose()?.unwrap_or(3);
    if min > max {
        return Err(ServerError::Tls("TLS min_version exceeds max_version".into()));
    }
    let mut versions = Vec::new();
    if min <= 2 && max >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

/// Non-blocking fd adapter for rustls record I/O.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match syscalls::read_nonblocking(self.0, buf)? {
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            ReadOutcome::Closed => Ok(0),
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match syscalls::write_nonblocking(self.0, buf)? {
            WriteOutcome::Data(n) => Ok(n),
            WriteOutcome::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct TlsTransport {
    session: ServerConnection,
    info: Option<TlsInfo>,
    /// Set when the handshake failed because no ALPN protocol overlapped.
    pub alpn_mismatch: bool,
}

impl TlsTransport {
    fn pump_inbound(&mut self, fd: RawFd) -> io::Result<bool> {
        // Pull TLS records off the socket into the session. Returns true
        // when the peer sent EOF.
        let mut peer_eof = false;
        while self.session.wants_read() {
            match self.session.read_tls(&mut FdIo(fd)) {
                Ok(0) => {
                    peer_eof = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
            self.process_packets()?;
        }
        Ok(peer_eof)
    }

    fn process_packets(&mut self) -> io::Result<()> {
        self.session.process_new_packets().map_err(|e| {
            if matches!(e, rustls::Error::NoApplicationProtocol) {
                self.alpn_mismatch = true;
            }
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;
        Ok(())
    }

    fn flush_outbound(&mut self, fd: RawFd) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut FdIo(fd)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn capture_info(&mut self) {
        if self.info.is_some() {
            return;
        }
        let alpn = self
            .session
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        let cipher = self
            .session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()));
        let version = self.session.protocol_version().map(|v| match v {
            rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
            rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
            other => format!("{other:?}"),
        });
        let client_cert_present = self.session.peer_certificates().is_some();
        self.info = Some(TlsInfo {
            alpn,
            cipher,
            version,
            client_cert_present,
        });
    }
}

impl Transport for TlsTransport {
    fn try_read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<TryRead> {
        let peer_eof = self.pump_inbound(fd)?;
        self.process_packets()?;
        match self.session.reader().read(buf) {
            Ok(0) => Ok(TryRead::Closed),
            Ok(n) => Ok(TryRead::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if peer_eof {
                    Ok(TryRead::Closed)
                } else {
                    Ok(TryRead::WouldBlock)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(TryRead::Closed),
            Err(e) => Err(e),
        }
    }

    fn try_write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<TryWrite> {
        // Plaintext goes into the session buffer; as much of the TLS
        // record output as the socket accepts is flushed immediately, the
        // remainder stays buffered and surfaces through wants_write().
        let n = match self.session.writer().write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TryWrite::WouldBlock),
            Err(e) => return Err(e),
        };
        self.flush_outbound(fd)?;
        Ok(TryWrite::Data(n))
    }

    fn wants_read(&self) -> bool {
        self.session.wants_read()
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    fn step_handshake(&mut self, fd: RawFd) -> io::Result<Handshake> {
        while self.session.is_handshaking() {
            if self.session.wants_write() {
                match self.session.write_tls(&mut FdIo(fd)) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Handshake::WantWrite),
                    Err(e) => return Err(e),
                }
            }
            if self.session.wants_read() {
                match self.session.read_tls(&mut FdIo(fd)) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => self.process_packets()?,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Handshake::WantRead),
                    Err(e) => return Err(e),
                }
            }
        }
        // Flush any tail of the server Finished flight.
        self.flush_outbound(fd)?;
        self.capture_info();
        Ok(Handshake::Done)
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        self.info.clone()
    }

    fn alpn_mismatched(&self) -> bool {
        self.alpn_mismatch
    }
}
