// tests/http_errors.rs
mod common;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aeronet::{HttpServer, Response, Router, ServerConfig, StopHandle};
use common::TestServer;

fn router() -> Router {
    let mut router = Router::new();
    router.get("/ok", |_req| Response::ok("fine"));
    router.post("/only-post", |_req| Response::ok("posted"));
    router.delete("/only-post", |_req| Response::ok("deleted"));
    router.get("/panic", |_req| -> Response { panic!("handler exploded") });
    router
}

#[test]
fn test_malformed_request_line_400() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GARBAGE\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 "), "res: {res}");
}

#[test]
fn test_unsupported_version_505() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /ok HTTP/2.0\r\nHost: h\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 505 "), "res: {res}");
}

#[test]
fn test_oversize_head_431() {
    let cfg = ServerConfig::new().with_max_header_bytes(256);
    let server = TestServer::start(cfg, router());
    let mut raw = b"GET /ok HTTP/1.1\r\nHost: h\r\nX-Pad: ".to_vec();
    raw.extend(vec![b'a'; 1024]);
    raw.extend_from_slice(b"\r\n\r\n");
    let res = server.request(&raw);
    assert!(res.starts_with("HTTP/1.1 431 "), "res: {res}");
}

#[test]
fn test_unsupported_transfer_encoding_501() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"POST /only-post HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: snappy\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 501 "), "res: {res}");
}

#[test]
fn test_duplicate_host_400() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /ok HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 "), "res: {res}");
}

#[test]
fn test_cl_te_conflict_400() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(
        b"POST /only-post HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\nabcd",
    );
    assert!(res.starts_with("HTTP/1.1 400 "), "res: {res}");
}

#[test]
fn test_method_not_allowed_405_with_allow() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /only-post HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 "), "res: {res}");
    assert!(res.contains("Allow: POST, DELETE"), "res: {res}");
}

#[test]
fn test_handler_panic_becomes_500() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /panic HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 500 "), "res: {res}");
    // The engine survives the panic.
    let res = server.request(b"GET /ok HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("fine"));
}

#[test]
fn test_parser_error_callback_fires_once() {
    let seen = Arc::new(AtomicU16::new(0));
    let seen_cb = seen.clone();

    let mut server = HttpServer::with_router(
        ServerConfig::new().with_poll_interval(Duration::from_millis(20)),
        router(),
    )
    .unwrap();
    server.on_parser_error(move |code| {
        seen_cb.store(code, Ordering::SeqCst);
    });
    let port = server.port();
    let stop: StopHandle = server.stop_handle();
    let handle = std::thread::spawn(move || {
        let _ = server.run();
    });

    use std::io::{Read, Write};
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"BAD/REQUEST\r\n\r\n").unwrap();
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out);
    assert!(out.starts_with("HTTP/1.1 400 "));
    assert_eq!(seen.load(Ordering::SeqCst), 400);

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_not_found_wins_over_unacceptable_encoding() {
    // 406 belongs to the framing step of a handler response; an unrouted
    // path still answers 404 whatever Accept-Encoding says.
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(
        b"GET /missing HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0, snappy;q=0\r\nConnection: close\r\n\r\n",
    );
    assert!(res.starts_with("HTTP/1.1 404 "), "res: {res}");

    let res = server.request(
        b"GET /only-post HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0, snappy;q=0\r\nConnection: close\r\n\r\n",
    );
    assert!(res.starts_with("HTTP/1.1 405 "), "res: {res}");
    assert!(res.contains("Allow: POST, DELETE"), "res: {res}");
}

#[test]
fn test_error_responses_close_connection() {
    let server = TestServer::start(ServerConfig::new(), router());
    // No Connection: close sent, yet read_to_string returns because the
    // server closes after a 400.
    let res = server.request(b"GET bad-target HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 "), "res: {res}");
    assert!(res.contains("Connection: close"));
}
