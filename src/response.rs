// src/response.rs
use crate::method::Version;
use crate::status::{self, StatusCode};
use crate::util;

/// Header names the engine owns. Handlers setting these is a programming
/// error; the pipeline computes them from framing and connection state.
pub const RESERVED_HEADERS: [&str; 4] = ["Connection", "Date", "Content-Length", "Transfer-Encoding"];

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
}

/// Owned buffered response built by a handler. Serialization and framing
/// decisions happen later in the pipeline, so a `Response` is pure data:
/// status, headers in first-seen casing, body bytes, optional trailers.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) trailers: Vec<(String, String)>,
    pub(crate) compression_disabled: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
            trailers: Vec::new(),
            compression_disabled: false,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(status::OK).body(body)
    }

    pub fn text(body: impl Into<Vec<u8>>) -> Self {
        Self::new(status::OK).content_type("text/plain").body(body)
    }

    pub fn not_found() -> Self {
        Self::new(status::NOT_FOUND)
            .content_type("text/plain")
            .body("Not Found")
    }

    pub fn internal_error() -> Self {
        Self::new(status::INTERNAL_SERVER_ERROR)
            .content_type("text/plain")
            .body("Internal Server Error")
    }

    pub fn bad_request() -> Self {
        Self::new(status::BAD_REQUEST)
            .content_type("text/plain")
            .body("Bad Request")
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(status::MOVED_PERMANENTLY).location(location)
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set a header. Case-insensitive replace keeping the first-seen
    /// casing. Panics on the engine-owned names listed in
    /// [`RESERVED_HEADERS`]; the pipeline catches handler panics and
    /// converts them to 500s, so misuse fails loudly in development.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.set_header(name.as_ref(), value.into());
        self
    }

    pub fn content_type(self, value: impl Into<String>) -> Self {
        self.header("Content-Type", value)
    }

    pub fn location(self, value: impl Into<String>) -> Self {
        self.header("Location", value)
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a trailer field. Trailers force chunked framing.
    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push((name.into(), value.into()));
        self
    }

    /// Per-response compression opt-out.
    pub fn disable_compression(mut self) -> Self {
        self.compression_disabled = true;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn compression_disabled(&self) -> bool {
        self.compression_disabled
    }

    pub(crate) fn replace_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// In-place header set, for response middleware. Same semantics and
    /// reserved-name guard as the `header` builder.
    pub fn insert_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.set_header(name.as_ref(), value.into());
    }

    /// In-place body replacement, for response middleware.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub(crate) fn set_header(&mut self, name: &str, value: String) {
        assert!(
            !is_reserved_header(name),
            "header `{name}` is managed by the server and cannot be set by handlers"
        );
        self.set_header_unchecked(name, value);
    }

    /// Pipeline-internal variant without the reserved-name guard.
    pub(crate) fn set_header_unchecked(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Merge `value` into a comma-separated header (used for `Vary`).
    pub(crate) fn merge_header_value(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => {
                let already = v
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(value));
                if !already {
                    v.push_str(", ");
                    v.push_str(value);
                }
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub(crate) fn mutate_headers(&mut self) -> &mut Vec<(String, String)> {
        &mut self.headers
    }
}

// ---- Serialization ----

/// Everything the serializer needs from connection and server state.
pub(crate) struct SerializeCtx<'a> {
    pub version: Version,
    pub head_only: bool,
    pub keep_alive: bool,
    pub date: &'a [u8; 29],
    pub global_headers: &'a [(String, String)],
    /// Bodies under this size share the head's buffer; larger captured
    /// bodies become their own outbound chunk to avoid the copy.
    pub min_captured_body_size: usize,
}

pub(crate) struct SerializedResponse {
    pub head: Vec<u8>,
    pub body: Option<Vec<u8>>,
}

pub(crate) fn write_status_line(buf: &mut Vec<u8>, version: Version, code: StatusCode, reason: Option<&str>) {
    buf.extend_from_slice(version.as_str().as_bytes());
    buf.push(b' ');
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(code).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason.unwrap_or_else(|| status::reason(code)).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

pub(crate) fn write_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

pub(crate) fn write_header_bytes(buf: &mut Vec<u8>, name: &str, value: &[u8]) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Serialize a buffered response per the framing rules:
/// known body size => `Content-Length`; trailers force chunked; HEAD
/// keeps the computed headers and drops the payload bytes.
pub(crate) fn serialize(resp: &Response, ctx: &SerializeCtx<'_>) -> SerializedResponse {
    let chunked = !resp.trailers.is_empty();
    let mut head = Vec::with_capacity(256 + resp.headers.len() * 32);

    write_status_line(&mut head, ctx.version, resp.status, resp.reason.as_deref());
    for (name, value) in &resp.headers {
        write_header(&mut head, name, value);
    }
    write_header_bytes(&mut head, "Date", ctx.date);
    for (name, value) in ctx.global_headers {
        if resp.header_value(name).is_none() {
            write_header(&mut head, name, value);
        }
    }

    if chunked {
        write_header(&mut head, "Transfer-Encoding", "chunked");
    } else {
        let mut itoa_buf = itoa::Buffer::new();
        write_header(&mut head, "Content-Length", itoa_buf.format(resp.body.len()));
    }
    write_header(
        &mut head,
        "Connection",
        if ctx.keep_alive { "keep-alive" } else { "close" },
    );
    head.extend_from_slice(b"\r\n");

    if ctx.head_only {
        return SerializedResponse { head, body: None };
    }

    if chunked {
        let mut wire = Vec::with_capacity(resp.body.len() + 64);
        if !resp.body.is_empty() {
            util::write_hex(&mut wire, resp.body.len());
            wire.extend_from_slice(b"\r\n");
            wire.extend_from_slice(&resp.body);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\n");
        for (name, value) in &resp.trailers {
            write_header(&mut wire, name, value);
        }
        wire.extend_from_slice(b"\r\n");
        return if head.len() + wire.len() <= ctx.min_captured_body_size {
            head.extend_from_slice(&wire);
            SerializedResponse { head, body: None }
        } else {
            SerializedResponse { head, body: Some(wire) }
        };
    }

    if resp.body.is_empty() {
        SerializedResponse { head, body: None }
    } else if head.len() + resp.body.len() <= ctx.min_captured_body_size {
        head.extend_from_slice(&resp.body);
        SerializedResponse { head, body: None }
    } else {
        SerializedResponse {
            head,
            body: Some(resp.body.clone()),
        }
    }
}
