// tests/http_basic.rs
mod common;

use aeronet::{Response, Router, ServerConfig};
use common::{header_value, read_response, split_response, TestServer};
use std::io::Write;

fn router() -> Router {
    let mut router = Router::new();
    router.get("/abc", |req| {
        Response::ok(format!("You requested: {}\n", req.path())).content_type("text/plain")
    });
    router.get("/users/{id}", |req| {
        Response::ok(format!("user={}", req.param("id").unwrap_or("?")))
    });
    router.get("/search", |req| {
        let q = req.query_param("q").unwrap_or_default().into_owned();
        let lang = req.query_param("lang").unwrap_or_default().into_owned();
        Response::ok(format!("q={q} lang={lang}"))
    });
    router.get("/headecho", |req| {
        Response::ok("0123456789").header("X-Probe", req.header("X-Probe").unwrap_or("-").to_string())
    });
    router
}

#[test]
fn test_simple_get() {
    let server = TestServer::start(ServerConfig::new(), router());
    let mut stream = server.connect();
    stream.write_all(b"GET /abc HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(body, b"You requested: /abc\n");
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "20");
    assert_eq!(header_value(&head, "Connection").unwrap(), "keep-alive");
    assert!(header_value(&head, "Date").unwrap().ends_with(" GMT"));
    assert_eq!(header_value(&head, "Server").unwrap(), "aeronet");
}

#[test]
fn test_not_found() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /nope HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(res.contains("Not Found"));
}

#[test]
fn test_route_params() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /users/42 HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("user=42"));
}

#[test]
fn test_query_decoding() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res =
        server.request(b"GET /search?q=a+b&lang=en%2DUS HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("q=a b lang=en-US"), "res: {res}");
}

#[test]
fn test_percent_decoded_path_routes() {
    let mut router = Router::new();
    router.get("/a b", |_req| Response::ok("spaced"));
    let server = TestServer::start(ServerConfig::new(), router);
    let res = server.request(b"GET /a%20b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("spaced"));
}

#[test]
fn test_head_suppresses_body_keeps_length() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"HEAD /headecho HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "10");
    assert!(body.is_empty(), "HEAD must not carry a body");
}

#[test]
fn test_case_insensitive_request_headers() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /headecho HTTP/1.1\r\nHost: h\r\nx-pRoBe: zz\r\nConnection: close\r\n\r\n");
    assert!(res.contains("X-Probe: zz"));
}

#[test]
fn test_global_header_overridable() {
    let mut router = Router::new();
    router.get("/custom", |_req| Response::ok("x").header("Server", "special"));
    let cfg = ServerConfig::new();
    let server = TestServer::start(cfg, router);
    let res = server.request(b"GET /custom HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Server: special"));
    assert!(!res.contains("Server: aeronet"));
}

#[test]
fn test_http10_reply_version() {
    let server = TestServer::start(ServerConfig::new(), router());
    let res = server.request(b"GET /abc HTTP/1.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.0 200 OK\r\n"), "res: {res}");
    assert!(res.contains("Connection: close"));
}
