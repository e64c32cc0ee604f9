// tests/http_streaming.rs
mod common;

use aeronet::{CompressionConfig, Method, Response, Router, ServerConfig};
use common::{header_value, read_response, split_response, TestServer};
use std::io::Write;

fn router() -> Router {
    let mut router = Router::new();
    router.route_streaming(Method::Get, "/stream", |_req, w| {
        w.status(200).content_type("text/plain");
        w.write(b"chunk1").unwrap();
        w.write(b"chunk2").unwrap();
        w.end().unwrap();
    });
    router.route_streaming(Method::Get, "/fixed", |_req, w| {
        w.content_length(10).content_type("text/plain");
        w.write(b"0123456789").unwrap();
        w.end().unwrap();
    });
    router.route_streaming(Method::Get, "/trailered", |_req, w| {
        w.write(&vec![b'x'; 5000]).unwrap();
        w.trailer("X-Checksum", "deadbeef");
        w.end().unwrap();
    });
    router.route_streaming(Method::Get, "/implicit-end", |_req, w| {
        w.write(b"no explicit end").unwrap();
    });
    router.get("/buffered", |_req| Response::ok("plain"));
    router
}

#[test]
fn test_chunked_stream_framing() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"GET /stream HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!head.contains("Content-Length"));
    // Small writes coalesce into one staged chunk.
    assert_eq!(common::dechunk(&body), b"chunk1chunk2");
}

#[test]
fn test_fixed_length_stream() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"GET /fixed HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "10");
    assert_eq!(body, b"0123456789");
}

#[test]
fn test_stream_trailers() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"GET /trailered HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("0\r\nX-Checksum: deadbeef\r\n\r\n"), "missing trailer");
}

#[test]
fn test_handler_without_end_is_finalized() {
    let server = TestServer::start(ServerConfig::new(), router());
    let raw = server.request_bytes(b"GET /implicit-end HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    // end() ran implicitly when the handler returned and the terminating
    // chunk went out.
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert_eq!(common::dechunk(&body), b"no explicit end");
}

#[test]
fn test_keep_alive_across_streamed_response() {
    let server = TestServer::start(ServerConfig::new(), router());
    let mut stream = server.connect();
    stream.write_all(b"GET /stream HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(header_value(&head, "Connection").unwrap(), "keep-alive");
    assert_eq!(body, b"chunk1chunk2");

    // The connection is still usable for a buffered request.
    stream.write_all(b"GET /buffered HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"plain");
}

#[test]
fn test_head_on_streaming_route() {
    let mut router = Router::new();
    router.route_streaming(Method::Get, "/s", |_req, w| {
        w.content_length(6).content_type("text/plain");
        w.write(b"sixsix").unwrap();
        w.end().unwrap();
    });
    let server = TestServer::start(ServerConfig::new(), router);
    let raw = server.request_bytes(b"HEAD /s HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let (head, body) = split_response(&raw);
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "6");
    assert!(body.is_empty());
}

#[cfg(feature = "zstd")]
#[test]
fn test_streaming_auto_compression() {
    use aeronet::Encoding;
    let cfg = ServerConfig::new().with_compression(CompressionConfig {
        preferred_formats: vec![Encoding::Zstd],
        min_bytes: 64,
        ..CompressionConfig::default()
    });
    let mut router = Router::new();
    router.route_streaming(Method::Get, "/z", |_req, w| {
        w.content_type("text/plain");
        for _ in 0..8 {
            w.write(&vec![b'Q'; 1000]).unwrap();
        }
        w.end().unwrap();
    });
    let server = TestServer::start(cfg, router);
    let raw = server.request_bytes(
        b"GET /z HTTP/1.1\r\nHost: h\r\nConnection: close\r\nAccept-Encoding: zstd\r\n\r\n",
    );
    let (head, body) = split_response(&raw);
    assert_eq!(header_value(&head, "Content-Encoding").unwrap(), "zstd");
    assert!(head.contains("Transfer-Encoding: chunked"));
    let compressed = common::dechunk(&body);
    let decoded = zstd::stream::decode_all(&compressed[..]).unwrap();
    assert_eq!(decoded, vec![b'Q'; 8000]);
}

#[test]
fn test_backpressure_closes_after_flush() {
    let cfg = ServerConfig::new().with_max_outbound_buffer_bytes(16 * 1024);
    let mut router = Router::new();
    router.route_streaming(Method::Get, "/firehose", |_req, w| {
        let block = vec![b'F'; 8192];
        loop {
            if w.write(&block).is_err() {
                break;
            }
        }
    });
    let server = TestServer::start(cfg, router);
    let raw = server.request_bytes(b"GET /firehose HTTP/1.1\r\nHost: h\r\n\r\n");
    // The cap tripped: the server truncated the stream and closed even
    // though the client never asked for Connection: close.
    assert!(!raw.is_empty());
}
