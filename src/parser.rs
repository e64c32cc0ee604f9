// src/parser.rs
//
// Incremental HTTP/1.x request parsing. `parse_head` is retried as bytes
// arrive and only commits once the full head terminator is buffered; the
// chunked body decoder resumes from an explicit cursor so a request can
// trickle in across many readiness events.

use memchr::memmem;

use crate::encoding::Encoding;
use crate::headers::{duplicate_policy, DuplicatePolicy, HeaderEntry, HeaderTable, Span};
use crate::method::{Method, Version};
use crate::status::{self, StatusCode};
use crate::util;

/// Limits and knobs the parser needs from the server config.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub merge_unknown_headers: bool,
}

/// How the message body is framed, decided from the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Fixed(usize),
    Chunked,
}

/// A fully parsed request head. All positions index the connection's
/// inbound buffer, which stays untouched until the response is queued.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub version: Version,
    pub raw_target: (usize, usize),
    pub raw_path: (usize, usize),
    pub query: Option<(usize, usize)>,
    /// Percent-decoded path, computed once after head parsing.
    pub decoded_path: String,
    pub headers: HeaderTable,
    pub head_len: usize,
    pub framing: BodyFraming,
    /// Non-chunked transfer codings (e.g. `TE: gzip, chunked`), applied
    /// left-to-right by the sender; undone in reverse after de-chunking.
    pub transfer_codings: Vec<Encoding>,
    pub expect_continue: bool,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
}

#[derive(Debug)]
pub enum HeadOutcome {
    /// Terminator not buffered yet.
    NeedMore,
    Parsed(Box<RequestHead>),
}

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Try to parse a complete request head from `buf`. Errors are terminal
/// for the connection and map directly onto response status codes.
pub fn parse_head(buf: &[u8], limits: &ParserLimits) -> Result<HeadOutcome, StatusCode> {
    let head_end = match memmem::find(buf, HEAD_END) {
        Some(pos) => pos + HEAD_END.len(),
        None => {
            // Everything buffered so far is head material; reject bare-LF
            // line endings and stray CRs without waiting for a terminator
            // that may never come.
            check_line_endings(buf)?;
            if buf.len() > limits.max_header_bytes {
                return Err(status::HEADER_TOO_LARGE);
            }
            return Ok(HeadOutcome::NeedMore);
        }
    };
    if head_end > limits.max_header_bytes {
        return Err(status::HEADER_TOO_LARGE);
    }

    // Line-ending discipline is only enforced on the head: body bytes may
    // legally contain anything.
    check_line_endings(&buf[..head_end])?;

    let head = &buf[..head_end];
    let line_end = memmem::find(head, CRLF).ok_or(status::BAD_REQUEST)?;
    let (method, version, raw_target) = parse_request_line(&head[..line_end])?;

    let mut table = HeaderTable::default();
    let mut cursor = line_end + 2;
    while cursor + 1 < head_end {
        if head[cursor] == b'\r' && head[cursor + 1] == b'\n' {
            cursor += 2;
            break;
        }
        let rel_end = memmem::find(&head[cursor..], CRLF).ok_or(status::BAD_REQUEST)?;
        parse_header_line(buf, cursor, cursor + rel_end, &mut table, limits)?;
        cursor += rel_end + 2;
    }

    let (raw_path, query) = split_target(buf, raw_target);
    let decoded_path = decode_target_path(buf, raw_path, method)?;

    let mut head = RequestHead {
        method,
        version,
        raw_target,
        raw_path,
        query,
        decoded_path,
        headers: table,
        head_len: head_end,
        framing: BodyFraming::None,
        transfer_codings: Vec::new(),
        expect_continue: false,
        connection_close: false,
        connection_keep_alive: false,
    };
    resolve_semantics(buf, &mut head, limits)?;
    Ok(HeadOutcome::Parsed(Box::new(head)))
}

/// Every LF must be preceded by CR; every CR must be followed by LF (or
/// be the last buffered byte, still awaiting its LF).
fn check_line_endings(buf: &[u8]) -> Result<(), StatusCode> {
    let mut pos = 0;
    while let Some(i) = memchr::memchr2(b'\r', b'\n', &buf[pos..]) {
        let at = pos + i;
        match buf[at] {
            b'\n' => {
                if at == 0 || buf[at - 1] != b'\r' {
                    return Err(status::BAD_REQUEST);
                }
            }
            _ => {
                if at + 1 < buf.len() && buf[at + 1] != b'\n' {
                    return Err(status::BAD_REQUEST);
                }
            }
        }
        pos = at + 1;
    }
    Ok(())
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Version, (usize, usize)), StatusCode> {
    let sp1 = memchr::memchr(b' ', line).ok_or(status::BAD_REQUEST)?;
    if sp1 == 0 {
        return Err(status::BAD_REQUEST);
    }
    for &b in &line[..sp1] {
        if !util::is_token_byte(b) {
            return Err(status::BAD_REQUEST);
        }
    }
    let method = Method::from_bytes(&line[..sp1]);

    let rest = &line[sp1 + 1..];
    let sp2 = memchr::memchr(b' ', rest).ok_or(status::BAD_REQUEST)?;
    if sp2 == 0 {
        return Err(status::BAD_REQUEST);
    }
    let target = &rest[..sp2];
    let version_bytes = &rest[sp2 + 1..];
    if memchr::memchr(b' ', version_bytes).is_some() {
        return Err(status::BAD_REQUEST);
    }
    if !version_bytes.starts_with(b"HTTP/") {
        return Err(status::BAD_REQUEST);
    }
    let version = match &version_bytes[5..] {
        b"1.1" => Version::Http11,
        b"1.0" => Version::Http10,
        _ => return Err(status::VERSION_NOT_SUPPORTED),
    };

    // Origin form, asterisk form (OPTIONS), or authority form (CONNECT).
    let target_ok = match method {
        Method::Connect => !target.is_empty() && !target.starts_with(b"/"),
        Method::Options => target == b"*" || target.starts_with(b"/"),
        _ => target.starts_with(b"/"),
    };
    if !target_ok {
        return Err(status::BAD_REQUEST);
    }

    let target_start = sp1 + 1;
    Ok((method, version, (target_start, target_start + sp2)))
}

fn parse_header_line(
    buf: &[u8],
    start: usize,
    end: usize,
    table: &mut HeaderTable,
    limits: &ParserLimits,
) -> Result<(), StatusCode> {
    let line = &buf[start..end];
    let colon = memchr::memchr(b':', line).ok_or(status::BAD_REQUEST)?;
    if colon == 0 {
        return Err(status::BAD_REQUEST);
    }
    for &b in &line[..colon] {
        if !util::is_token_byte(b) {
            return Err(status::BAD_REQUEST);
        }
    }

    let mut val_start = colon + 1;
    while val_start < line.len() && (line[val_start] == b' ' || line[val_start] == b'\t') {
        val_start += 1;
    }
    let mut val_end = line.len();
    while val_end > val_start && (line[val_end - 1] == b' ' || line[val_end - 1] == b'\t') {
        val_end -= 1;
    }
    for &b in &line[val_start..val_end] {
        if !util::is_field_value_byte(b) {
            return Err(status::BAD_REQUEST);
        }
    }
    std::str::from_utf8(&line[val_start..val_end]).map_err(|_| status::BAD_REQUEST)?;

    let name_span = Span::Buf {
        start,
        end: start + colon,
    };
    let value_span = Span::Buf {
        start: start + val_start,
        end: start + val_end,
    };
    let name = name_span.resolve(buf);

    if let Some(existing) = table
        .entries
        .iter_mut()
        .find(|e| e.name.resolve(buf).eq_ignore_ascii_case(name))
    {
        let mergeable = match duplicate_policy(name) {
            DuplicatePolicy::Singleton => false,
            DuplicatePolicy::List => true,
            DuplicatePolicy::Unknown => limits.merge_unknown_headers,
        };
        if !mergeable {
            return Err(status::BAD_REQUEST);
        }
        let merged = format!(
            "{}, {}",
            existing.value.resolve(buf),
            value_span.resolve(buf)
        );
        existing.value = Span::Owned(merged);
        return Ok(());
    }

    table.entries.push(HeaderEntry {
        name: name_span,
        value: value_span,
    });
    Ok(())
}

fn split_target(buf: &[u8], target: (usize, usize)) -> ((usize, usize), Option<(usize, usize)>) {
    let bytes = &buf[target.0..target.1];
    match memchr::memchr(b'?', bytes) {
        Some(q) => (
            (target.0, target.0 + q),
            Some((target.0 + q + 1, target.1)),
        ),
        None => (target, None),
    }
}

fn decode_target_path(buf: &[u8], raw_path: (usize, usize), method: Method) -> Result<String, StatusCode> {
    let raw = std::str::from_utf8(&buf[raw_path.0..raw_path.1]).map_err(|_| status::BAD_REQUEST)?;
    if method == Method::Connect {
        // Authority form is not percent-decoded.
        return Ok(raw.to_string());
    }
    util::percent_decode_path(raw).ok_or(status::BAD_REQUEST)
}

/// Apply field semantics: framing selection, Expect, Connection.
fn resolve_semantics(buf: &[u8], head: &mut RequestHead, limits: &ParserLimits) -> Result<(), StatusCode> {
    let mut content_length: Option<usize> = None;
    let mut transfer_encoding: Option<String> = None;

    for (name, value) in head.headers.iter(buf) {
        if name.eq_ignore_ascii_case("content-length") {
            let v = value.trim();
            if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
                return Err(status::BAD_REQUEST);
            }
            content_length = Some(v.parse::<usize>().map_err(|_| status::BAD_REQUEST)?);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("expect") {
            if value.eq_ignore_ascii_case("100-continue") {
                head.expect_continue = true;
            }
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    head.connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    head.connection_keep_alive = true;
                }
            }
        }
    }

    match (content_length, transfer_encoding) {
        (Some(_), Some(_)) => return Err(status::BAD_REQUEST),
        (None, Some(te)) => {
            if head.version == Version::Http10 {
                return Err(status::BAD_REQUEST);
            }
            let mut codings: Vec<&str> = te.split(',').map(str::trim).collect();
            match codings.pop() {
                Some(last) if last.eq_ignore_ascii_case("chunked") => {}
                _ => return Err(status::NOT_IMPLEMENTED),
            }
            for coding in codings {
                let enc = match coding.to_ascii_lowercase().as_str() {
                    "identity" => continue,
                    "gzip" | "x-gzip" => Encoding::Gzip,
                    "deflate" => Encoding::Deflate,
                    "zstd" => Encoding::Zstd,
                    "br" => Encoding::Brotli,
                    _ => return Err(status::NOT_IMPLEMENTED),
                };
                if !enc.enabled() {
                    return Err(status::NOT_IMPLEMENTED);
                }
                head.transfer_codings.push(enc);
            }
            head.framing = BodyFraming::Chunked;
        }
        (Some(len), None) => {
            if len > limits.max_body_bytes {
                return Err(status::PAYLOAD_TOO_LARGE);
            }
            head.framing = if len == 0 { BodyFraming::None } else { BodyFraming::Fixed(len) };
        }
        (None, None) => head.framing = BodyFraming::None,
    }

    // Expect is an HTTP/1.1 mechanism; 1.0 clients that send it are
    // ignored rather than rejected.
    if head.version == Version::Http10 {
        head.expect_continue = false;
    }
    if head.expect_continue && head.framing == BodyFraming::None {
        head.expect_continue = false;
    }

    if head.version == Version::Http11 && head.headers.find(buf, "Host").is_none() {
        return Err(status::BAD_REQUEST);
    }
    Ok(())
}

// ---- Chunked body decoding ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
    Done,
}

/// Resumable chunked-body decoder. `consumed` indexes the body region
/// (bytes after the head) of the inbound buffer; decoded payload bytes
/// accumulate in `decoded`.
#[derive(Debug)]
pub struct ChunkedDecoder {
    phase: ChunkPhase,
    pub consumed: usize,
    pub decoded: Vec<u8>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            phase: ChunkPhase::Size,
            consumed: 0,
            decoded: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == ChunkPhase::Done
    }

    /// Advance over `body` (the inbound buffer past the head). Returns
    /// true when the terminating chunk and trailers are fully consumed.
    pub fn advance(&mut self, body: &[u8], max_body_bytes: usize) -> Result<bool, StatusCode> {
        loop {
            match self.phase {
                ChunkPhase::Size => {
                    let rest = &body[self.consumed..];
                    let Some(eol) = memmem::find(rest, CRLF) else {
                        // A size line has a small bounded length; anything
                        // longer is garbage, not a slow client.
                        if rest.len() > 1024 {
                            return Err(status::BAD_REQUEST);
                        }
                        return Ok(false);
                    };
                    let line = &rest[..eol];
                    let size_end = memchr::memchr(b';', line).unwrap_or(line.len());
                    let digits = &line[..size_end];
                    if digits.is_empty() || digits.len() > 16 {
                        return Err(status::BAD_REQUEST);
                    }
                    let mut size: usize = 0;
                    for &b in digits {
                        let v = util::hex_value(b).ok_or(status::BAD_REQUEST)? as usize;
                        size = size.checked_mul(16).and_then(|s| s.checked_add(v)).ok_or(status::BAD_REQUEST)?;
                    }
                    self.consumed += eol + 2;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailers;
                    } else {
                        if self.decoded.len() + size > max_body_bytes {
                            return Err(status::PAYLOAD_TOO_LARGE);
                        }
                        self.phase = ChunkPhase::Data { remaining: size };
                    }
                }
                ChunkPhase::Data { remaining } => {
                    let available = body.len().saturating_sub(self.consumed);
                    let take = available.min(remaining);
                    self.decoded
                        .extend_from_slice(&body[self.consumed..self.consumed + take]);
                    self.consumed += take;
                    if take == remaining {
                        self.phase = ChunkPhase::DataCrlf;
                    } else {
                        self.phase = ChunkPhase::Data {
                            remaining: remaining - take,
                        };
                        return Ok(false);
                    }
                }
                ChunkPhase::DataCrlf => {
                    let rest = &body[self.consumed..];
                    if rest.len() < 2 {
                        return Ok(false);
                    }
                    if &rest[..2] != CRLF {
                        return Err(status::BAD_REQUEST);
                    }
                    self.consumed += 2;
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    // Trailer fields are consumed and discarded; an empty
                    // line terminates the body.
                    let rest = &body[self.consumed..];
                    let Some(eol) = memmem::find(rest, CRLF) else {
                        return Ok(false);
                    };
                    let line = &rest[..eol];
                    self.consumed += eol + 2;
                    if line.is_empty() {
                        self.phase = ChunkPhase::Done;
                        return Ok(true);
                    }
                    if memchr::memchr(b':', line).is_none() {
                        return Err(status::BAD_REQUEST);
                    }
                }
                ChunkPhase::Done => return Ok(true),
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}
