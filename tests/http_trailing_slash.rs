// tests/http_trailing_slash.rs
mod common;

use aeronet::{Response, Router, ServerConfig, TrailingSlashPolicy};
use common::{header_value, split_response, TestServer};

fn router() -> Router {
    let mut router = Router::new();
    router.get("/gamma", |_req| Response::ok("gamma"));
    router.get("/delta/", |_req| Response::ok("delta-slash"));
    router.get("/", |_req| Response::ok("root"));
    router
}

fn server(policy: TrailingSlashPolicy) -> TestServer {
    TestServer::start(
        ServerConfig::new().with_trailing_slash_policy(policy),
        router(),
    )
}

#[test]
fn test_strict_does_not_coerce() {
    let s = server(TrailingSlashPolicy::Strict);
    let res = s.request(b"GET /gamma/ HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 "), "res: {res}");
    let res = s.request(b"GET /gamma HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("gamma"));
}

#[test]
fn test_normalize_retries_both_forms() {
    let s = server(TrailingSlashPolicy::Normalize);
    let res = s.request(b"GET /gamma/ HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("gamma"), "res: {res}");
    let res = s.request(b"GET /delta HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("delta-slash"), "res: {res}");
}

#[test]
fn test_redirect_emits_301_with_canonical_location() {
    let s = server(TrailingSlashPolicy::Redirect);
    let raw = s.request_bytes(b"GET /gamma/ HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 301 "), "head: {head}");
    assert_eq!(header_value(&head, "Location").unwrap(), "/gamma");
}

#[test]
fn test_redirect_preserves_query() {
    let s = server(TrailingSlashPolicy::Redirect);
    let raw = s.request_bytes(b"GET /gamma/?x=1 HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, _) = split_response(&raw);
    assert_eq!(header_value(&head, "Location").unwrap(), "/gamma?x=1");
}

#[test]
fn test_redirect_wins_over_unacceptable_encoding() {
    let s = server(TrailingSlashPolicy::Redirect);
    let raw = s.request_bytes(
        b"GET /gamma/ HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0, snappy;q=0\r\nConnection: close\r\n\r\n",
    );
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 301 "), "head: {head}");
    assert_eq!(header_value(&head, "Location").unwrap(), "/gamma");
}

#[test]
fn test_root_is_exempt_from_redirect() {
    let s = server(TrailingSlashPolicy::Redirect);
    let res = s.request(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("root"), "res: {res}");
}

#[test]
fn test_exact_match_never_redirects() {
    let s = server(TrailingSlashPolicy::Redirect);
    let res = s.request(b"GET /delta/ HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    assert!(res.ends_with("delta-slash"), "res: {res}");
}
