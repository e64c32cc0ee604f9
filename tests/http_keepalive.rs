// tests/http_keepalive.rs
mod common;

use aeronet::{Response, Router, ServerConfig};
use common::{header_value, read_response, TestServer};
use std::io::Write;

fn router() -> Router {
    let mut router = Router::new();
    router.get("/a", |_req| Response::ok("alpha"));
    router.get("/b", |_req| Response::ok("bravo"));
    router.get("/c", |_req| Response::ok("charlie"));
    router
}

#[test]
fn test_sequential_requests_one_connection() {
    let server = TestServer::start(ServerConfig::new(), router());
    let mut stream = server.connect();

    stream.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(header_value(&head, "Connection").unwrap(), "keep-alive");
    assert_eq!(body, b"alpha");

    stream.write_all(b"GET /b HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"bravo");
}

#[test]
fn test_pipelined_responses_in_order() {
    let server = TestServer::start(ServerConfig::new(), router());
    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\nGET /c HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .unwrap();
    let (_, first) = read_response(&mut stream);
    let (_, second) = read_response(&mut stream);
    let (_, third) = read_response(&mut stream);
    assert_eq!(first, b"alpha");
    assert_eq!(second, b"bravo");
    assert_eq!(third, b"charlie");
}

#[test]
fn test_request_cap_closes_connection() {
    // Scenario: cap 2, three pipelined requests. The first two answer,
    // the second carries Connection: close, the third gets nothing.
    let cfg = ServerConfig::new().with_max_requests_per_connection(2);
    let server = TestServer::start(cfg, router());
    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\nGET /c HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .unwrap();
    let (head1, body1) = read_response(&mut stream);
    assert_eq!(header_value(&head1, "Connection").unwrap(), "keep-alive");
    assert_eq!(body1, b"alpha");

    let (head2, body2) = read_response(&mut stream);
    assert_eq!(header_value(&head2, "Connection").unwrap(), "close");
    assert_eq!(body2, b"bravo");

    // No third response: the server closed after the second.
    use std::io::Read;
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected third response: {rest:?}");
}

#[test]
fn test_connection_close_honored() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /a HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Connection: close"));
    assert!(res.ends_with("alpha"));
}

#[test]
fn test_http10_requires_explicit_keep_alive() {
    let server = TestServer::start(ServerConfig::new(), router());

    // Default 1.0: close.
    let res = server.request(b"GET /a HTTP/1.0\r\n\r\n");
    assert!(res.contains("Connection: close"));

    // Explicit keep-alive: preserved.
    let mut stream = server.connect();
    stream
        .write_all(b"GET /a HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(header_value(&head, "Connection").unwrap(), "keep-alive");
    assert_eq!(body, b"alpha");
    stream
        .write_all(b"GET /b HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"bravo");
}

#[test]
fn test_keep_alive_disabled_globally() {
    let cfg = ServerConfig::new().with_keep_alive(false);
    let server = TestServer::start(cfg, router());
    let res = server.request(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(res.contains("Connection: close"));
    assert!(res.ends_with("alpha"));
}
