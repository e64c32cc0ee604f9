// src/encoder.rs
//
// Outbound content-coding. One `Encoder` per compiled-in codec is built at
// server construction; aggregated responses go through `encode_full`,
// streaming responses obtain a per-response `StreamEncoder` whose output
// buffer is reused across chunks.

#[cfg(any(feature = "zlib", feature = "zstd", feature = "brotli"))]
use std::io::Write;

use crate::config::CompressionConfig;
use crate::encoding::{Encoding, NB_ENCODINGS};
use crate::error::{ServerError, ServerResult};

pub trait Encoder: Send + Sync {
    fn encoding(&self) -> Encoding;

    /// One-shot encode of a complete body.
    fn encode_full(&self, input: &[u8]) -> ServerResult<Vec<u8>>;

    /// Fresh incremental context for a streaming response.
    fn make_streaming(&self) -> ServerResult<Box<dyn StreamEncoder>>;
}

/// Single-producer incremental encoder. `encode_chunk` may legitimately
/// return an empty slice while the codec buffers input; `finish` flushes
/// whatever remains plus the codec trailer.
pub trait StreamEncoder {
    fn encode_chunk(&mut self, input: &[u8]) -> ServerResult<&[u8]>;
    fn finish(&mut self) -> ServerResult<&[u8]>;
}

pub type EncoderSet = [Option<Box<dyn Encoder>>; NB_ENCODINGS];

/// Instantiate every compiled-in codec with the configured parameters.
pub fn build_encoders(cfg: &CompressionConfig) -> EncoderSet {
    let mut set: EncoderSet = Default::default();
    #[cfg(feature = "zlib")]
    {
        set[Encoding::Gzip as usize] = Some(Box::new(zlib::GzipEncoder { level: cfg.zlib_level }));
        set[Encoding::Deflate as usize] = Some(Box::new(zlib::DeflateEncoder { level: cfg.zlib_level }));
    }
    #[cfg(feature = "zstd")]
    {
        set[Encoding::Zstd as usize] = Some(Box::new(zstd_codec::ZstdEncoder {
            level: cfg.zstd_level,
            window_log: cfg.zstd_window_log,
        }));
    }
    #[cfg(feature = "brotli")]
    {
        set[Encoding::Brotli as usize] = Some(Box::new(brotli_codec::BrotliEncoder {
            quality: cfg.brotli_quality,
            window: cfg.brotli_window,
        }));
    }
    #[cfg(not(any(feature = "zlib", feature = "zstd", feature = "brotli")))]
    let _ = cfg;
    set
}

#[cfg(any(feature = "zlib", feature = "zstd", feature = "brotli"))]
fn enc_err(e: impl std::fmt::Display) -> ServerError {
    ServerError::Encoder(e.to_string())
}

#[cfg(feature = "zlib")]
mod zlib {
    use super::*;
    use flate2::write::{GzEncoder as Gz, ZlibEncoder as Zlib};
    use flate2::Compression;

    pub struct GzipEncoder {
        pub level: u32,
    }

    impl Encoder for GzipEncoder {
        fn encoding(&self) -> Encoding {
            Encoding::Gzip
        }

        fn encode_full(&self, input: &[u8]) -> ServerResult<Vec<u8>> {
            let mut enc = Gz::new(Vec::with_capacity(input.len() / 2 + 64), Compression::new(self.level));
            enc.write_all(input).map_err(enc_err)?;
            enc.finish().map_err(enc_err)
        }

        fn make_streaming(&self) -> ServerResult<Box<dyn StreamEncoder>> {
            Ok(Box::new(GzipStream {
                enc: Some(Gz::new(Vec::new(), Compression::new(self.level))),
                out: Vec::new(),
            }))
        }
    }

    pub struct DeflateEncoder {
        pub level: u32,
    }

    impl Encoder for DeflateEncoder {
        fn encoding(&self) -> Encoding {
            Encoding::Deflate
        }

        fn encode_full(&self, input: &[u8]) -> ServerResult<Vec<u8>> {
            let mut enc = Zlib::new(Vec::with_capacity(input.len() / 2 + 64), Compression::new(self.level));
            enc.write_all(input).map_err(enc_err)?;
            enc.finish().map_err(enc_err)
        }

        fn make_streaming(&self) -> ServerResult<Box<dyn StreamEncoder>> {
            Ok(Box::new(DeflateStream {
                enc: Some(Zlib::new(Vec::new(), Compression::new(self.level))),
                out: Vec::new(),
            }))
        }
    }

    pub struct GzipStream {
        enc: Option<Gz<Vec<u8>>>,
        out: Vec<u8>,
    }

    impl StreamEncoder for GzipStream {
        fn encode_chunk(&mut self, input: &[u8]) -> ServerResult<&[u8]> {
            let enc = self.enc.as_mut().ok_or_else(|| enc_err("stream already finished"))?;
            enc.write_all(input).map_err(enc_err)?;
            enc.flush().map_err(enc_err)?;
            self.out.clear();
            self.out.append(enc.get_mut());
            Ok(&self.out)
        }

        fn finish(&mut self) -> ServerResult<&[u8]> {
            let enc = self.enc.take().ok_or_else(|| enc_err("stream already finished"))?;
            self.out = enc.finish().map_err(enc_err)?;
            Ok(&self.out)
        }
    }

    pub struct DeflateStream {
        enc: Option<Zlib<Vec<u8>>>,
        out: Vec<u8>,
    }

    impl StreamEncoder for DeflateStream {
        fn encode_chunk(&mut self, input: &[u8]) -> ServerResult<&[u8]> {
            let enc = self.enc.as_mut().ok_or_else(|| enc_err("stream already finished"))?;
            enc.write_all(input).map_err(enc_err)?;
            enc.flush().map_err(enc_err)?;
            self.out.clear();
            self.out.append(enc.get_mut());
            Ok(&self.out)
        }

        fn finish(&mut self) -> ServerResult<&[u8]> {
            let enc = self.enc.take().ok_or_else(|| enc_err("stream already finished"))?;
            self.out = enc.finish().map_err(enc_err)?;
            Ok(&self.out)
        }
    }
}

#[cfg(feature = "zstd")]
mod zstd_codec {
    use super::*;
    use zstd::stream::write::Encoder as ZstdWriter;

    pub struct ZstdEncoder {
        pub level: i32,
        pub window_log: u32,
    }

    impl ZstdEncoder {
        fn writer(&self) -> ServerResult<ZstdWriter<'static, Vec<u8>>> {
            let mut enc = ZstdWriter::new(Vec::new(), self.level).map_err(enc_err)?;
            if self.window_log > 0 {
                enc.set_parameter(zstd::zstd_safe::CParameter::WindowLog(self.window_log))
                    .map_err(enc_err)?;
            }
            Ok(enc)
        }
    }

    impl Encoder for ZstdEncoder {
        fn encoding(&self) -> Encoding {
            Encoding::Zstd
        }

        fn encode_full(&self, input: &[u8]) -> ServerResult<Vec<u8>> {
            let mut enc = self.writer()?;
            enc.write_all(input).map_err(enc_err)?;
            enc.finish().map_err(enc_err)
        }

        fn make_streaming(&self) -> ServerResult<Box<dyn StreamEncoder>> {
            Ok(Box::new(ZstdStream {
                enc: Some(self.writer()?),
                out: Vec::new(),
            }))
        }
    }

    pub struct ZstdStream {
        enc: Option<ZstdWriter<'static, Vec<u8>>>,
        out: Vec<u8>,
    }

    impl StreamEncoder for ZstdStream {
        fn encode_chunk(&mut self, input: &[u8]) -> ServerResult<&[u8]> {
            let enc = self.enc.as_mut().ok_or_else(|| enc_err("stream already finished"))?;
            enc.write_all(input).map_err(enc_err)?;
            enc.flush().map_err(enc_err)?;
            self.out.clear();
            self.out.append(enc.get_mut());
            Ok(&self.out)
        }

        fn finish(&mut self) -> ServerResult<&[u8]> {
            let enc = self.enc.take().ok_or_else(|| enc_err("stream already finished"))?;
            self.out = enc.finish().map_err(enc_err)?;
            Ok(&self.out)
        }
    }
}

#[cfg(feature = "brotli")]
mod brotli_codec {
    use super::*;
    use brotli::CompressorWriter;

    const STREAM_BUF: usize = 4096;

    pub struct BrotliEncoder {
        pub quality: u32,
        pub window: u32,
    }

    impl BrotliEncoder {
        fn lgwin(&self) -> u32 {
            if self.window == 0 { 22 } else { self.window }
        }
    }

    impl Encoder for BrotliEncoder {
        fn encoding(&self) -> Encoding {
            Encoding::Brotli
        }

        fn encode_full(&self, input: &[u8]) -> ServerResult<Vec<u8>> {
            let mut enc = CompressorWriter::new(Vec::new(), STREAM_BUF, self.quality, self.lgwin());
            enc.write_all(input).map_err(enc_err)?;
            enc.flush().map_err(enc_err)?;
            Ok(enc.into_inner())
        }

        fn make_streaming(&self) -> ServerResult<Box<dyn StreamEncoder>> {
            Ok(Box::new(BrotliStream {
                enc: Some(CompressorWriter::new(Vec::new(), STREAM_BUF, self.quality, self.lgwin())),
                out: Vec::new(),
            }))
        }
    }

    pub struct BrotliStream {
        enc: Option<CompressorWriter<Vec<u8>>>,
        out: Vec<u8>,
    }

    impl StreamEncoder for BrotliStream {
        fn encode_chunk(&mut self, input: &[u8]) -> ServerResult<&[u8]> {
            let enc = self.enc.as_mut().ok_or_else(|| enc_err("stream already finished"))?;
            enc.write_all(input).map_err(enc_err)?;
            enc.flush().map_err(enc_err)?;
            self.out.clear();
            self.out.append(enc.get_mut());
            Ok(&self.out)
        }

        fn finish(&mut self) -> ServerResult<&[u8]> {
            let enc = self.enc.take().ok_or_else(|| enc_err("stream already finished"))?;
            self.out = enc.into_inner();
            Ok(&self.out)
        }
    }
}
