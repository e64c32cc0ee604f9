// src/request.rs
use std::borrow::Cow;

use crate::headers::HeaderTable;
use crate::method::{Method, Version};
use crate::parser::RequestHead;
use crate::util;

/// TLS session facts captured after the handshake, surfaced on requests
/// arriving over a TLS transport.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub alpn: Option<String>,
    pub cipher: Option<String>,
    pub version: Option<String>,
    pub client_cert_present: bool,
}

/// Borrowed view over one parsed request. Valid only for the duration of
/// handler dispatch: every slice points into the connection's inbound
/// buffer (or the decoded body scratch), which is recycled as soon as the
/// response has been queued.
pub struct Request<'a> {
    head: &'a RequestHead,
    buf: &'a [u8],
    body: &'a [u8],
    params: Vec<(&'a str, &'a str)>,
    tls: Option<&'a TlsInfo>,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        head: &'a RequestHead,
        buf: &'a [u8],
        body: &'a [u8],
        tls: Option<&'a TlsInfo>,
    ) -> Self {
        Self {
            head,
            buf,
            body,
            params: Vec::new(),
            tls,
        }
    }

    pub(crate) fn set_params(&mut self, params: Vec<(&'a str, &'a str)>) {
        self.params = params;
    }

    pub fn method(&self) -> Method {
        self.head.method
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Percent-decoded path. The returned slice borrows the parsed head,
    /// not the `Request` value, so it stays usable for router captures.
    pub fn path(&self) -> &'a str {
        &self.head.decoded_path
    }

    /// Path exactly as it appeared on the request line.
    pub fn raw_path(&self) -> &str {
        let (s, e) = self.head.raw_path;
        std::str::from_utf8(&self.buf[s..e]).unwrap_or("")
    }

    /// Raw query string without the leading `?`.
    pub fn query_raw(&self) -> Option<&str> {
        self.head
            .query
            .map(|(s, e)| std::str::from_utf8(&self.buf[s..e]).unwrap_or(""))
    }

    /// Lazily decoded query parameters in declaration order.
    pub fn query_params(&self) -> QueryIter<'_> {
        QueryIter {
            rest: self.query_raw().unwrap_or(""),
        }
    }

    /// First value of a query parameter, decoded.
    pub fn query_param(&self, name: &str) -> Option<Cow<'_, str>> {
        self.query_params()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Case-insensitive header lookup; first-seen value wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.find(self.buf, name)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.head.headers.iter(self.buf)
    }

    pub fn header_table(&self) -> &HeaderTable {
        &self.head.headers
    }

    /// Body after chunked de-framing and inbound decompression.
    pub fn body(&self) -> &[u8] {
        self.body
    }

    /// Named route parameter captured by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    pub fn params(&self) -> &[(&'a str, &'a str)] {
        &self.params
    }

    pub fn tls(&self) -> Option<&TlsInfo> {
        self.tls
    }

    pub fn alpn(&self) -> Option<&str> {
        self.tls.and_then(|t| t.alpn.as_deref())
    }

    pub(crate) fn head(&self) -> &RequestHead {
        self.head
    }
}

/// Iterator over `k=v` pairs of the raw query. Decoding happens per
/// component: `+` becomes a space, invalid `%` sequences stay literal.
pub struct QueryIter<'a> {
    rest: &'a str,
}

impl<'a> Iterator for QueryIter<'a> {
    type Item = (Cow<'a, str>, Cow<'a, str>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let (pair, rest) = match self.rest.find('&') {
                Some(i) => (&self.rest[..i], &self.rest[i + 1..]),
                None => (self.rest, ""),
            };
            self.rest = rest;
            if pair.is_empty() {
                continue;
            }
            let (k, v) = match pair.find('=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, ""),
            };
            return Some((decode_component(k), decode_component(v)));
        }
    }
}

fn decode_component(raw: &str) -> Cow<'_, str> {
    if raw.bytes().any(|b| b == b'%' || b == b'+') {
        Cow::Owned(util::percent_decode_query(raw))
    } else {
        Cow::Borrowed(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_head, HeadOutcome, ParserLimits};

    fn limits() -> ParserLimits {
        ParserLimits {
            max_header_bytes: 8192,
            max_body_bytes: 1 << 20,
            merge_unknown_headers: true,
        }
    }

    fn request_over<'a>(raw: &'a [u8], head: &'a RequestHead) -> Request<'a> {
        Request::new(head, raw, b"", None)
    }

    #[test]
    fn test_query_iteration_and_decoding() {
        let raw = b"GET /s?q=a+b&lang=en%2DUS&flag&x=%zz HTTP/1.1\r\nHost: h\r\n\r\n";
        let head = match parse_head(raw, &limits()).unwrap() {
            HeadOutcome::Parsed(h) => h,
            _ => unreachable!(),
        };
        let req = request_over(raw, &head);
        let pairs: Vec<(String, String)> = req
            .query_params()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "a b".to_string()),
                ("lang".to_string(), "en-US".to_string()),
                ("flag".to_string(), String::new()),
                ("x".to_string(), "%zz".to_string()),
            ]
        );
        assert_eq!(req.query_param("lang").unwrap(), "en-US");
        assert!(req.query_param("missing").is_none());
    }

    #[test]
    fn test_header_lookup_via_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\nX-Trace: 1\r\n\r\n";
        let head = match parse_head(raw, &limits()).unwrap() {
            HeadOutcome::Parsed(h) => h,
            _ => unreachable!(),
        };
        let req = request_over(raw, &head);
        assert_eq!(req.header("x-trace"), Some("1"));
        assert_eq!(req.path(), "/");
        assert!(req.tls().is_none());
    }
}
