// tests/http_options_trace.rs
mod common;

use aeronet::{Response, Router, ServerConfig, TraceMethodPolicy};
use common::{header_value, split_response, TestServer};

fn router() -> Router {
    let mut router = Router::new();
    router.get("/a", |_req| Response::ok("a"));
    router.post("/b", |_req| Response::ok("b"));
    router.put("/b", |_req| Response::ok("b2"));
    router
}

#[test]
fn test_options_asterisk_advertises_methods() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"OPTIONS * HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 204 "), "head: {head}");
    assert_eq!(header_value(&head, "Allow").unwrap(), "GET, POST, PUT");
}

#[test]
fn test_trace_disabled_by_default() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"TRACE /a HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 "), "res: {res}");
}

#[test]
fn test_trace_enabled_echoes_head() {
    let cfg = ServerConfig::new().with_trace_policy(TraceMethodPolicy::EnabledPlainAndTls);
    let server = TestServer::start(cfg, router());
    let raw = server.request_bytes(b"TRACE /a HTTP/1.1\r\nHost: h\r\nX-Marker: 1\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head, "Content-Type").unwrap(), "message/http");
    let echoed = String::from_utf8_lossy(&body);
    assert!(echoed.starts_with("TRACE /a HTTP/1.1\r\n"), "echo: {echoed}");
    assert!(echoed.contains("X-Marker: 1\r\n"));
}

#[test]
fn test_trace_plain_only_policy_allows_plaintext() {
    let cfg = ServerConfig::new().with_trace_policy(TraceMethodPolicy::EnabledPlainOnly);
    let server = TestServer::start(cfg, router());
    // This connection is plaintext, so the echo is allowed.
    let res = server.request(b"TRACE /a HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK"), "res: {res}");
}

#[test]
fn test_options_asterisk_ignores_unacceptable_encoding() {
    // OPTIONS * is a builtin, not a routed handler: negotiation rejection
    // must not replace it with a 406.
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(
        b"OPTIONS * HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0, snappy;q=0\r\nConnection: close\r\n\r\n",
    );
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 204 "), "head: {head}");
    assert_eq!(header_value(&head, "Allow").unwrap(), "GET, POST, PUT");
}

#[test]
fn test_trace_ignores_unacceptable_encoding() {
    let cfg = ServerConfig::new().with_trace_policy(TraceMethodPolicy::EnabledPlainAndTls);
    let server = TestServer::start(cfg, router());
    let raw = server.request_bytes(
        b"TRACE /a HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0, snappy;q=0\r\nConnection: close\r\n\r\n",
    );
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(header_value(&head, "Content-Type").unwrap(), "message/http");
    assert!(String::from_utf8_lossy(&body).starts_with("TRACE /a HTTP/1.1\r\n"));
}

#[test]
fn test_options_on_path_follows_routing() {
    let server = TestServer::start(ServerConfig::new(), router());
    // No OPTIONS handler registered for /b: 405 with the Allow union.
    let res = server.request(b"OPTIONS /b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 "), "res: {res}");
    assert!(res.contains("Allow: POST, PUT"), "res: {res}");
}
