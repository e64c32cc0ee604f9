// src/decoder.rs
//
// Inbound request-body decompression. The Content-Encoding chain is undone
// right-to-left with byte counters enforcing the compression-bomb guards;
// any codec-level failure maps to 400, unknown codings to 415, guard
// violations to 413.

use std::io::Read;

use crate::config::DecompressionConfig;
use crate::encoding::Encoding;
use crate::status::{self, StatusCode};

/// Parse a request `Content-Encoding` header into the application order
/// (left-to-right as sent). Empty list elements are malformed.
pub fn parse_content_encoding(header: &str) -> Result<Vec<Encoding>, StatusCode> {
    let mut chain = Vec::new();
    for raw in header.split(',') {
        let token = raw.trim_matches(|c| c == ' ' || c == '\t');
        if token.is_empty() {
            return Err(status::BAD_REQUEST);
        }
        let enc = match token.to_ascii_lowercase().as_str() {
            "identity" => Encoding::Identity,
            "gzip" | "x-gzip" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            "zstd" => Encoding::Zstd,
            "br" => Encoding::Brotli,
            _ => return Err(status::UNSUPPORTED_MEDIA_TYPE),
        };
        if enc != Encoding::Identity && !enc.enabled() {
            return Err(status::UNSUPPORTED_MEDIA_TYPE);
        }
        chain.push(enc);
    }
    Ok(chain)
}

/// Undo a full coding chain. `chain` is in application order; decoding
/// walks it in reverse. Returns the decoded body or the rejection status.
pub fn decode_chain(chain: &[Encoding], body: &[u8], cfg: &DecompressionConfig) -> Result<Vec<u8>, StatusCode> {
    let mut view: &[u8] = body;
    let mut scratch: Option<Vec<u8>> = None;

    for &enc in chain.iter().rev() {
        if enc == Encoding::Identity {
            continue;
        }
        if cfg.max_compressed_bytes != 0 && view.len() > cfg.max_compressed_bytes {
            return Err(status::PAYLOAD_TOO_LARGE);
        }
        scratch = Some(decode_one(enc, view, cfg)?);
        view = scratch.as_deref().unwrap();
    }

    Ok(match scratch {
        Some(decoded) => decoded,
        None => body.to_vec(),
    })
}

fn decode_one(enc: Encoding, input: &[u8], cfg: &DecompressionConfig) -> Result<Vec<u8>, StatusCode> {
    match enc {
        Encoding::Identity => Ok(input.to_vec()),
        #[cfg(feature = "zlib")]
        Encoding::Gzip => drain(flate2::read::MultiGzDecoder::new(input), input.len(), cfg),
        #[cfg(feature = "zlib")]
        Encoding::Deflate => drain(flate2::read::ZlibDecoder::new(input), input.len(), cfg),
        #[cfg(feature = "zstd")]
        Encoding::Zstd => {
            let dec = zstd::stream::read::Decoder::new(input).map_err(|_| status::BAD_REQUEST)?;
            drain(dec, input.len(), cfg)
        }
        #[cfg(feature = "brotli")]
        Encoding::Brotli => drain(brotli::Decompressor::new(input, 4096), input.len(), cfg),
        #[allow(unreachable_patterns)]
        _ => Err(status::UNSUPPORTED_MEDIA_TYPE),
    }
}

/// Pull decoded bytes out of `reader` while policing the guards. The
/// incremental loop is what makes mid-stream abortion possible: a bomb is
/// rejected as soon as a counter trips, not after full inflation.
fn drain<R: Read>(mut reader: R, compressed_len: usize, cfg: &DecompressionConfig) -> Result<Vec<u8>, StatusCode> {
    // Small payloads skip incremental growth; the streaming threshold only
    // changes allocation strategy, the guard checks are identical.
    let streaming = cfg.streaming_threshold_bytes != 0 && compressed_len >= cfg.streaming_threshold_bytes;
    let mut out: Vec<u8> = Vec::with_capacity(if streaming {
        cfg.decoder_chunk_size
    } else {
        compressed_len.saturating_mul(2).min(cfg.decoder_chunk_size.max(4096))
    });
    let mut buf = vec![0u8; cfg.decoder_chunk_size];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            // Truncated frame, bad magic, checksum mismatch: protocol error.
            Err(_) => return Err(status::BAD_REQUEST),
        };
        out.extend_from_slice(&buf[..n]);
        if out.len() > cfg.max_decompressed_bytes {
            return Err(status::PAYLOAD_TOO_LARGE);
        }
        if cfg.max_expansion_ratio != 0.0
            && (out.len() as f64) > (compressed_len as f64) * cfg.max_expansion_ratio
        {
            return Err(status::PAYLOAD_TOO_LARGE);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain() {
        assert_eq!(parse_content_encoding("identity").unwrap(), vec![Encoding::Identity]);
        assert_eq!(parse_content_encoding("snappy"), Err(status::UNSUPPORTED_MEDIA_TYPE));
        assert_eq!(parse_content_encoding("gzip,,gzip"), Err(status::BAD_REQUEST));
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_parse_chain_order_preserved() {
        let chain = parse_content_encoding("gzip, deflate").unwrap();
        assert_eq!(chain, vec![Encoding::Gzip, Encoding::Deflate]);
    }

    #[test]
    fn test_identity_chain_is_noop() {
        let cfg = DecompressionConfig::default();
        let body = b"plain".to_vec();
        let out = decode_chain(&[Encoding::Identity], &body, &cfg).unwrap();
        assert_eq!(out, body);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_gzip_decode() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello gzip body").unwrap();
        let compressed = enc.finish().unwrap();
        let cfg = DecompressionConfig::default();
        let out = decode_chain(&[Encoding::Gzip], &compressed, &cfg).unwrap();
        assert_eq!(out, b"hello gzip body");
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_nested_chain_decodes_right_to_left() {
        use std::io::Write;
        // Application order gzip then deflate: wire bytes are
        // deflate(gzip(body)), so the server undoes deflate first.
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(b"nested payload").unwrap();
        let inner = gz.finish().unwrap();
        let mut zl = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        zl.write_all(&inner).unwrap();
        let wire = zl.finish().unwrap();

        let cfg = DecompressionConfig::default();
        let out = decode_chain(&[Encoding::Gzip, Encoding::Deflate], &wire, &cfg).unwrap();
        assert_eq!(out, b"nested payload");
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_truncated_frame_is_bad_request() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&vec![7u8; 4096]).unwrap();
        let mut compressed = enc.finish().unwrap();
        compressed.truncate(compressed.len() / 2);
        let cfg = DecompressionConfig::default();
        assert_eq!(
            decode_chain(&[Encoding::Gzip], &compressed, &cfg),
            Err(status::BAD_REQUEST)
        );
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_decompressed_cap_trips_413() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&vec![0u8; 1 << 20]).unwrap();
        let compressed = enc.finish().unwrap();
        let cfg = DecompressionConfig {
            max_decompressed_bytes: 1024,
            ..DecompressionConfig::default()
        };
        assert_eq!(
            decode_chain(&[Encoding::Gzip], &compressed, &cfg),
            Err(status::PAYLOAD_TOO_LARGE)
        );
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_expansion_ratio_trips_413() {
        use std::io::Write;
        // A megabyte of zeros compresses to ~1 KiB: ratio far above 4.
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&vec![0u8; 1 << 20]).unwrap();
        let compressed = enc.finish().unwrap();
        let cfg = DecompressionConfig {
            max_expansion_ratio: 4.0,
            ..DecompressionConfig::default()
        };
        assert_eq!(
            decode_chain(&[Encoding::Gzip], &compressed, &cfg),
            Err(status::PAYLOAD_TOO_LARGE)
        );
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_compressed_cap_trips_413() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&vec![1u8; 64 * 1024]).unwrap();
        let compressed = enc.finish().unwrap();
        let cfg = DecompressionConfig {
            max_compressed_bytes: 16,
            ..DecompressionConfig::default()
        };
        assert_eq!(
            decode_chain(&[Encoding::Gzip], &compressed, &cfg),
            Err(status::PAYLOAD_TOO_LARGE)
        );
    }
}
