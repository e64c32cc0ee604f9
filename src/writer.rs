// src/writer.rs
//
// Streaming response writer. Headers stay buffered until the first body
// byte so the pipeline can retroactively decide content-length, chunked
// framing and compression activation. Small writes coalesce in a staging
// buffer; large slices are framed directly. Both paths must produce wire
// output that de-chunks to the same byte sequence.

use crate::config::{CompressionConfig, DirectCompressionMode};
use crate::encoder::{EncoderSet, StreamEncoder};
use crate::encoding::Encoding;
use crate::error::{ServerError, ServerResult};
use crate::method::Version;
use crate::response::{self, is_reserved_header};
use crate::status::{self, StatusCode};
use crate::util;

/// Writes below this size coalesce into the staging buffer; larger slices
/// bypass it and are framed as their own chunk.
const SMALL_WRITE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Headers not flushed yet; body bytes accumulate in `prelude`.
    Buffering,
    /// Fixed content-length, raw bytes on the wire.
    Fixed,
    /// Chunked framing, optionally through an encoder.
    Chunked,
}

/// What the server needs to know after the handler returns.
pub(crate) struct WriterOutcome {
    pub frames: Vec<Vec<u8>>,
    pub status: StatusCode,
    pub ended: bool,
    /// Framing was corrupted (short fixed-length body) or backpressure
    /// tripped: the connection must close after flushing.
    pub must_close: bool,
    pub bytes_body: u64,
}

/// Server-side context handed to a fresh writer.
pub(crate) struct WriterCtx<'a> {
    pub version: Version,
    pub head_only: bool,
    pub keep_alive: bool,
    pub date: &'a [u8; 29],
    pub global_headers: &'a [(String, String)],
    pub max_outbound_bytes: usize,
    pub negotiated: Option<Encoding>,
    pub compression: &'a CompressionConfig,
    pub encoders: &'a EncoderSet,
}

pub struct ResponseWriter<'a> {
    ctx: WriterCtx<'a>,

    status: StatusCode,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    declared_length: Option<usize>,

    mode: WriteMode,
    prelude: Vec<u8>,
    staging: Vec<u8>,
    frames: Vec<Vec<u8>>,
    queued: usize,
    fixed_remaining: usize,
    body_bytes_in: u64,

    encoder: Option<Box<dyn StreamEncoder>>,
    ended: bool,
    must_close: bool,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(ctx: WriterCtx<'a>) -> Self {
        Self {
            ctx,
            status: status::OK,
            reason: None,
            headers: Vec::new(),
            trailers: Vec::new(),
            declared_length: None,
            mode: WriteMode::Buffering,
            prelude: Vec::new(),
            staging: Vec::new(),
            frames: Vec::new(),
            queued: 0,
            fixed_remaining: 0,
            body_bytes_in: 0,
            encoder: None,
            ended: false,
            must_close: false,
        }
    }

    /// Set the status code. Ignored once headers have flushed.
    pub fn status(&mut self, code: StatusCode) -> &mut Self {
        if self.mode == WriteMode::Buffering {
            self.status = code;
        }
        self
    }

    pub fn reason(&mut self, reason: impl Into<String>) -> &mut Self {
        if self.mode == WriteMode::Buffering {
            self.reason = Some(reason.into());
        }
        self
    }

    /// Set a header before the first body byte. Reserved names panic, as
    /// on buffered responses. Calls after the headers flushed are ignored.
    pub fn header(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        let name = name.as_ref();
        assert!(
            !is_reserved_header(name),
            "header `{name}` is managed by the server and cannot be set by handlers"
        );
        if self.mode != WriteMode::Buffering {
            tracing::debug!(header = name, "streaming header ignored after first body byte");
            return self;
        }
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.into(),
            None => self.headers.push((name.to_string(), value.into())),
        }
        self
    }

    pub fn content_type(&mut self, value: impl Into<String>) -> &mut Self {
        self.header("Content-Type", value)
    }

    /// Declare the body length. Ignored after the first body byte.
    pub fn content_length(&mut self, len: usize) -> &mut Self {
        if self.mode == WriteMode::Buffering && self.prelude.is_empty() {
            self.declared_length = Some(len);
        }
        self
    }

    /// Append a trailer field, emitted after the terminating chunk.
    /// Only honored when the response ends up chunk-framed.
    pub fn trailer(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.trailers.push((name.into(), value.into()));
        self
    }

    pub fn headers_sent(&self) -> bool {
        self.mode != WriteMode::Buffering
    }

    /// Stream body bytes. Fails on backpressure (outbound cap exceeded),
    /// after `end()`, or on encoder errors; once it fails the connection
    /// is marked for closure and further writes keep failing.
    pub fn write(&mut self, data: &[u8]) -> ServerResult<()> {
        if self.ended {
            return Err(ServerError::Other("write after end()".into()));
        }
        if self.must_close {
            return Err(ServerError::OutboundFull);
        }
        self.body_bytes_in += data.len() as u64;

        match self.mode {
            WriteMode::Buffering => {
                self.prelude.extend_from_slice(data);
                // Stay buffered until the compression decision is forced:
                // a declared length decides immediately, Auto mode waits
                // for the threshold, On/Off decide on first byte.
                if self.decision_ready() {
                    self.flush_headers(false)?;
                }
            }
            WriteMode::Fixed => self.write_fixed(data)?,
            WriteMode::Chunked => self.write_chunked(data)?,
        }
        self.check_backpressure()
    }

    /// Finalize the response: flush staging, emit the terminating chunk
    /// and trailers (chunked mode), or close out the fixed body.
    pub fn end(&mut self) -> ServerResult<()> {
        if self.ended {
            return Ok(());
        }
        if self.mode == WriteMode::Buffering {
            self.flush_headers(true)?;
        }
        match self.mode {
            WriteMode::Chunked => {
                self.flush_staging()?;
                if let Some(mut enc) = self.encoder.take() {
                    let tail = enc.finish()?.to_vec();
                    if !tail.is_empty() && !self.ctx.head_only {
                        self.push_chunk_frame(&tail);
                    }
                }
                if !self.ctx.head_only {
                    let mut terminator = Vec::with_capacity(16);
                    terminator.extend_from_slice(b"0\r\n");
                    for (name, value) in &self.trailers {
                        response::write_header(&mut terminator, name, value);
                    }
                    terminator.extend_from_slice(b"\r\n");
                    self.push_frame(terminator);
                }
            }
            WriteMode::Fixed => {
                if self.fixed_remaining > 0 {
                    // Handler under-delivered a declared length; the framing
                    // on this connection is no longer trustworthy.
                    tracing::warn!(missing = self.fixed_remaining, "fixed-length stream ended short");
                    self.must_close = true;
                }
            }
            WriteMode::Buffering => unreachable!("flushed above"),
        }
        self.ended = true;
        Ok(())
    }

    pub(crate) fn into_outcome(mut self) -> WriterOutcome {
        WriterOutcome {
            frames: std::mem::take(&mut self.frames),
            status: self.status,
            ended: self.ended,
            must_close: self.must_close,
            bytes_body: self.body_bytes_in,
        }
    }

    // ---- internals ----

    fn decision_ready(&self) -> bool {
        if self.declared_length.is_some() {
            return true;
        }
        match self.effective_mode() {
            DirectCompressionMode::Auto => {
                // Buffering only buys something while compression may still
                // activate; an ineligible content-type decides immediately.
                !self.content_type_allowed() || self.prelude.len() >= self.ctx.compression.min_bytes
            }
            DirectCompressionMode::On | DirectCompressionMode::Off => true,
        }
    }

    fn effective_mode(&self) -> DirectCompressionMode {
        if self.negotiated_codec().is_none() {
            return DirectCompressionMode::Off;
        }
        if self.ctx.compression.allow_per_response_disable && self.user_content_encoding() {
            return DirectCompressionMode::Off;
        }
        self.ctx.compression.direct_mode
    }

    fn negotiated_codec(&self) -> Option<Encoding> {
        match self.ctx.negotiated {
            Some(Encoding::Identity) | None => None,
            Some(enc) => Some(enc),
        }
    }

    fn user_content_encoding(&self) -> bool {
        self.headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Content-Encoding"))
    }

    fn content_type_allowed(&self) -> bool {
        let content_type = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        let allowlist = &self.ctx.compression.content_type_allowlist;
        allowlist.is_empty() || allowlist.iter().any(|p| content_type.starts_with(p))
    }

    /// Decide compression and framing, then emit the head. `finishing`
    /// means `end()` forced the decision with the complete body in hand,
    /// which allows a plain Content-Length response.
    fn flush_headers(&mut self, finishing: bool) -> ServerResult<()> {
        let activate = match self.effective_mode() {
            DirectCompressionMode::Off => None,
            DirectCompressionMode::On => self.negotiated_codec(),
            DirectCompressionMode::Auto => {
                let size_known = self
                    .declared_length
                    .unwrap_or(self.prelude.len());
                let passes = size_known >= self.ctx.compression.min_bytes && self.content_type_allowed();
                if passes {
                    self.negotiated_codec()
                } else {
                    None
                }
            }
        };

        let mut head = Vec::with_capacity(256);
        response::write_status_line(&mut head, self.ctx.version, self.status, self.reason.as_deref());
        for (name, value) in &self.headers {
            response::write_header(&mut head, name, value);
        }
        response::write_header_bytes(&mut head, "Date", self.ctx.date);
        for (name, value) in self.ctx.global_headers {
            let already = self
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(name));
            if !already {
                response::write_header(&mut head, name, value);
            }
        }

        match activate {
            Some(codec) => {
                let encoder = self.ctx.encoders[codec as usize]
                    .as_ref()
                    .ok_or_else(|| ServerError::Encoder(format!("codec {} unavailable", codec.token())))?;
                response::write_header(&mut head, "Content-Encoding", codec.token());
                if self.ctx.compression.add_vary_header {
                    response::write_header(&mut head, "Vary", "Accept-Encoding");
                }
                if finishing {
                    // Whole body known: aggregate encode, known length.
                    let compressed = encoder.encode_full(&self.prelude)?;
                    let mut itoa_buf = itoa::Buffer::new();
                    response::write_header(&mut head, "Content-Length", itoa_buf.format(compressed.len()));
                    self.write_connection_header(&mut head);
                    head.extend_from_slice(b"\r\n");
                    self.push_frame(head);
                    if !self.ctx.head_only && !compressed.is_empty() {
                        self.push_frame(compressed);
                    }
                    self.mode = WriteMode::Fixed;
                    self.fixed_remaining = 0;
                    self.prelude = Vec::new();
                    return Ok(());
                }
                let streaming = encoder.make_streaming()?;
                response::write_header(&mut head, "Transfer-Encoding", "chunked");
                self.write_connection_header(&mut head);
                head.extend_from_slice(b"\r\n");
                self.push_frame(head);
                self.mode = WriteMode::Chunked;
                self.encoder = Some(streaming);
                let pending = std::mem::take(&mut self.prelude);
                if !pending.is_empty() {
                    self.write_chunked(&pending)?;
                }
            }
            None => {
                let known_length = if finishing {
                    Some(self.declared_length.unwrap_or(self.prelude.len()))
                } else {
                    self.declared_length
                };
                match known_length {
                    Some(len) => {
                        let mut itoa_buf = itoa::Buffer::new();
                        response::write_header(&mut head, "Content-Length", itoa_buf.format(len));
                        self.write_connection_header(&mut head);
                        head.extend_from_slice(b"\r\n");
                        self.push_frame(head);
                        self.mode = WriteMode::Fixed;
                        self.fixed_remaining = len;
                        let pending = std::mem::take(&mut self.prelude);
                        if !pending.is_empty() {
                            self.write_fixed(&pending)?;
                        }
                    }
                    None => {
                        response::write_header(&mut head, "Transfer-Encoding", "chunked");
                        self.write_connection_header(&mut head);
                        head.extend_from_slice(b"\r\n");
                        self.push_frame(head);
                        self.mode = WriteMode::Chunked;
                        let pending = std::mem::take(&mut self.prelude);
                        if !pending.is_empty() {
                            self.write_chunked(&pending)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_connection_header(&self, head: &mut Vec<u8>) {
        response::write_header(
            head,
            "Connection",
            if self.ctx.keep_alive { "keep-alive" } else { "close" },
        );
    }

    fn write_fixed(&mut self, data: &[u8]) -> ServerResult<()> {
        if self.ctx.head_only {
            return Ok(());
        }
        // Excess past the declared length is tolerated but truncated.
        let take = data.len().min(self.fixed_remaining);
        if take < data.len() {
            tracing::debug!(extra = data.len() - take, "fixed-length stream over-delivered; truncating");
        }
        if take > 0 {
            self.push_frame(data[..take].to_vec());
            self.fixed_remaining -= take;
        }
        Ok(())
    }

    fn write_chunked(&mut self, data: &[u8]) -> ServerResult<()> {
        if self.ctx.head_only {
            return Ok(());
        }
        if self.encoder.is_some() {
            let mut enc = self.encoder.take().unwrap();
            let result = enc.encode_chunk(data).map(|out| out.to_vec());
            self.encoder = Some(enc);
            let out = result?;
            self.stage_or_frame(&out);
        } else {
            self.stage_or_frame(data);
        }
        Ok(())
    }

    fn stage_or_frame(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() < SMALL_WRITE_THRESHOLD {
            self.staging.extend_from_slice(data);
            self.queued += data.len();
            if self.staging.len() >= SMALL_WRITE_THRESHOLD {
                let pending = std::mem::take(&mut self.staging);
                self.queued -= pending.len();
                self.push_chunk_frame(&pending);
            }
        } else {
            // Flush staging first to preserve byte order on the wire.
            let pending = std::mem::take(&mut self.staging);
            if !pending.is_empty() {
                self.queued -= pending.len();
                self.push_chunk_frame(&pending);
            }
            self.push_chunk_frame(data);
        }
    }

    fn flush_staging(&mut self) -> ServerResult<()> {
        let pending = std::mem::take(&mut self.staging);
        if !pending.is_empty() {
            self.queued -= pending.len();
            self.push_chunk_frame(&pending);
        }
        Ok(())
    }

    fn push_chunk_frame(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut frame = Vec::with_capacity(payload.len() + 20);
        util::write_hex(&mut frame, payload.len());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.push_frame(frame);
    }

    fn push_frame(&mut self, frame: Vec<u8>) {
        self.queued += frame.len();
        self.frames.push(frame);
    }

    fn check_backpressure(&mut self) -> ServerResult<()> {
        if self.queued + self.prelude.len() > self.ctx.max_outbound_bytes {
            self.must_close = true;
            return Err(ServerError::OutboundFull);
        }
        Ok(())
    }
}
