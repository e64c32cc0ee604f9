// tests/http_timeouts.rs
mod common;

use aeronet::{Response, Router, ServerConfig};
use common::TestServer;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

fn router() -> Router {
    let mut router = Router::new();
    router.get("/", |_req| Response::ok("root"));
    router
}

#[test]
fn test_slow_header_times_out() {
    let cfg = ServerConfig::new().with_header_read_timeout(Duration::from_millis(50));
    let server = TestServer::start(cfg, router());

    let mut stream = server.connect();
    // Send a partial request line, then stall past the deadline.
    stream.write_all(b"GET / ").unwrap();
    let started = Instant::now();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    // Closed well before the read timeout; never a 200.
    assert!(started.elapsed() < Duration::from_secs(3));
    let text = String::from_utf8_lossy(&out);
    assert!(!text.contains("200 OK"), "got: {text}");
    // A 408 may precede the close.
    if !out.is_empty() {
        assert!(text.starts_with("HTTP/1.1 408 "), "got: {text}");
    }
}

#[test]
fn test_fast_header_is_unaffected() {
    let cfg = ServerConfig::new().with_header_read_timeout(Duration::from_millis(200));
    let server = TestServer::start(cfg, router());
    let res = server.request(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("200 OK"));
}

#[test]
fn test_keep_alive_idle_timeout_closes() {
    let cfg = ServerConfig::new().with_keep_alive_timeout(Duration::from_millis(100));
    let server = TestServer::start(cfg, router());

    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, _) = common::read_response(&mut stream);
    assert!(head.contains("Connection: keep-alive"));

    // Stay idle past the timeout: the server closes silently.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_timeout_disabled_by_default() {
    let server = TestServer::start(ServerConfig::new(), router());
    let mut stream = server.connect();
    stream.write_all(b"GET / ").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    stream.write_all(b"HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert!(out.contains("200 OK"), "got: {out}");
}
