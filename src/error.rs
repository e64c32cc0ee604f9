// src/error.rs
use std::io;

use thiserror::Error;

/// Central error type for the aeronet engine.
///
/// Protocol-level failures (malformed requests, oversized heads, bad
/// content-codings) are not represented here: they travel through the
/// request pipeline as HTTP status codes and become canonical error
/// responses on the wire.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Conflicting or invalid route registration.
    #[error("route registration error: {0}")]
    Route(String),

    /// TLS context construction failure (bad certificate, key, or settings).
    #[error("TLS setup error: {0}")]
    Tls(String),

    /// Operation requires a stopped server (e.g. relocating a running engine).
    #[error("server is running")]
    Running,

    /// Streaming write rejected because the outbound buffer cap was reached.
    #[error("outbound buffer full")]
    OutboundFull,

    /// A background engine thread panicked.
    #[error("engine thread panicked: {0}")]
    EnginePanic(String),

    /// Response body encoder failure.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
