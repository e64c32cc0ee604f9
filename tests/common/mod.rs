// tests/common/mod.rs
//
// Shared plumbing for integration tests: run a real server on an
// ephemeral port on a background thread and talk raw HTTP/1.x to it over
// std TcpStream.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration;

use aeronet::{HttpServer, Router, ServerConfig, StopHandle};

pub struct TestServer {
    pub port: u16,
    stop: StopHandle,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: ServerConfig, router: Router) -> Self {
        // Fast poll so stop() in Drop does not hold tests up.
        let config = config.with_poll_interval(Duration::from_millis(20));
        let mut server = HttpServer::with_router(config, router).expect("server construction");
        let port = server.port();
        let stop = server.stop_handle();
        let handle = std::thread::spawn(move || {
            let _ = server.run();
        });
        Self {
            port,
            stop,
            handle: Some(handle),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// One-shot exchange: send raw bytes, read until the server closes.
    /// The request should carry `Connection: close`.
    pub fn request(&self, raw: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        let mut out = String::new();
        let _ = stream.read_to_string(&mut out);
        out
    }

    pub fn request_bytes(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        out
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read exactly one HTTP response off a keep-alive stream: full head plus
/// a Content-Length or chunked body. Returns (head, body-bytes).
pub fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).expect("read response head");
        assert!(n > 0, "connection closed before a full response head");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut rest = buf[head_end..].to_vec();

    if let Some(len) = header_value(&head, "Content-Length").map(|v| v.parse::<usize>().unwrap()) {
        while rest.len() < len {
            let n = stream.read(&mut tmp).expect("read response body");
            assert!(n > 0, "connection closed mid-body");
            rest.extend_from_slice(&tmp[..n]);
        }
        let extra = rest.split_off(len);
        assert!(extra.is_empty(), "unexpected bytes after body");
        return (head, rest);
    }

    assert!(
        header_value(&head, "Transfer-Encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")),
        "response has neither Content-Length nor chunked framing:\n{head}"
    );
    let mut body = Vec::new();
    loop {
        // Ensure a size line is buffered.
        let eol = loop {
            if let Some(pos) = find(&rest, b"\r\n") {
                break pos;
            }
            let n = stream.read(&mut tmp).expect("read chunk size");
            assert!(n > 0, "connection closed mid-chunk");
            rest.extend_from_slice(&tmp[..n]);
        };
        let size_line = String::from_utf8_lossy(&rest[..eol]).into_owned();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16)
            .expect("chunk size");
        rest.drain(..eol + 2);
        if size == 0 {
            // Consume trailers up to the blank line.
            loop {
                if let Some(pos) = find(&rest, b"\r\n") {
                    let line_empty = pos == 0;
                    rest.drain(..pos + 2);
                    if line_empty {
                        return (head, body);
                    }
                    continue;
                }
                let n = stream.read(&mut tmp).expect("read trailers");
                assert!(n > 0, "connection closed mid-trailers");
                rest.extend_from_slice(&tmp[..n]);
            }
        }
        while rest.len() < size + 2 {
            let n = stream.read(&mut tmp).expect("read chunk data");
            assert!(n > 0, "connection closed mid-chunk");
            rest.extend_from_slice(&tmp[..n]);
        }
        body.extend_from_slice(&rest[..size]);
        assert_eq!(&rest[size..size + 2], b"\r\n");
        rest.drain(..size + 2);
    }
}

/// First value of a header in a raw response head.
pub fn header_value(head: &str, name: &str) -> Option<String> {
    for line in head.split("\r\n").skip(1) {
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Split a raw close-delimited response into (head, body).
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = find(raw, b"\r\n\r\n").expect("response head terminator");
    (
        String::from_utf8_lossy(&raw[..pos + 4]).into_owned(),
        raw[pos + 4..].to_vec(),
    )
}

/// De-chunk a close-delimited chunked body.
pub fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let eol = find(body, b"\r\n").expect("chunk size line");
        let size_str = std::str::from_utf8(&body[..eol]).unwrap();
        let size = usize::from_str_radix(size_str.split(';').next().unwrap().trim(), 16).unwrap();
        body = &body[eol + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}
