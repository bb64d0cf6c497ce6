use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

/// Content-Encoding values the codec layer understands. Anything else is
/// treated as `Identity` by the caller (see spec.md §4.1's "unsupported
/// encodings pass through unchanged").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    pub fn from_header_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            "br" => ContentEncoding::Brotli,
            _ => ContentEncoding::Identity,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Brotli => "br",
        }
    }
}

/// Decode a full response body buffered in memory. Mirrors
/// `decode_content_body`: a failure to decompress is non-fatal — the
/// original bytes are handed back so the caller can still forward the
/// response rather than dropping the transaction.
pub fn decode_content_body(data: &[u8], encoding: ContentEncoding) -> Vec<u8> {
    match encoding {
        ContentEncoding::Identity => data.to_vec(),
        ContentEncoding::Gzip => {
            let mut out = Vec::new();
            match GzDecoder::new(data).read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    metrics::counter!("proxy_codec_failures_total", "direction" => "decode", "encoding" => "gzip").increment(1);
                    tracing::warn!(error = %e, "gzip decode failed, passing body through unchanged");
                    data.to_vec()
                }
            }
        }
        ContentEncoding::Deflate => decode_deflate(data),
        ContentEncoding::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(data, 4096);
            match reader.read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    metrics::counter!("proxy_codec_failures_total", "direction" => "decode", "encoding" => "br").increment(1);
                    tracing::warn!(error = %e, "brotli decode failed, passing body through unchanged");
                    data.to_vec()
                }
            }
        }
    }
}

/// `deflate` is ambiguous in the wild: most servers emit zlib-wrapped
/// deflate, some emit raw DEFLATE. Try zlib first, fall back to raw.
fn decode_deflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return out;
    }
    out.clear();
    match DeflateDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => out,
        Err(e) => {
            metrics::counter!("proxy_codec_failures_total", "direction" => "decode", "encoding" => "deflate").increment(1);
            tracing::warn!(error = %e, "deflate decode failed, passing body through unchanged");
            data.to_vec()
        }
    }
}

/// Encode a full response body buffered in memory. Mirrors
/// `encode_content_body`: a compression failure is non-fatal and logs
/// rather than aborting the transaction.
pub fn encode_content_body(data: &[u8], encoding: ContentEncoding) -> Vec<u8> {
    match encoding {
        ContentEncoding::Identity => data.to_vec(),
        ContentEncoding::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            match enc.write_all(data).and_then(|_| enc.finish()) {
                Ok(out) => out,
                Err(e) => {
                    metrics::counter!("proxy_codec_failures_total", "direction" => "encode", "encoding" => "gzip").increment(1);
                    tracing::warn!(error = %e, "gzip encode failed, forwarding body uncompressed");
                    data.to_vec()
                }
            }
        }
        ContentEncoding::Deflate => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            match enc.write_all(data).and_then(|_| enc.finish()) {
                Ok(out) => out,
                Err(e) => {
                    metrics::counter!("proxy_codec_failures_total", "direction" => "encode", "encoding" => "deflate").increment(1);
                    tracing::warn!(error = %e, "deflate encode failed, forwarding body uncompressed");
                    data.to_vec()
                }
            }
        }
        ContentEncoding::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            match brotli::BrotliCompress(&mut &data[..], &mut out, &params) {
                Ok(_) => out,
                Err(e) => {
                    metrics::counter!("proxy_codec_failures_total", "direction" => "encode", "encoding" => "br").increment(1);
                    tracing::warn!(error = %e, "brotli encode failed, forwarding body uncompressed");
                    data.to_vec()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let body = b"hello world, this is gzip compressed content";
        let encoded = encode_content_body(body, ContentEncoding::Gzip);
        assert_ne!(encoded, body);
        let decoded = decode_content_body(&encoded, ContentEncoding::Gzip);
        assert_eq!(decoded, body);
    }

    #[test]
    fn deflate_round_trip_zlib_wrapped() {
        let body = b"deflate via zlib wrapper";
        let encoded = encode_content_body(body, ContentEncoding::Deflate);
        let decoded = decode_content_body(&encoded, ContentEncoding::Deflate);
        assert_eq!(decoded, body);
    }

    #[test]
    fn deflate_decode_accepts_raw_deflate() {
        let body = b"raw deflate without zlib header";
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body).unwrap();
        let raw = enc.finish().unwrap();
        let decoded = decode_content_body(&raw, ContentEncoding::Deflate);
        assert_eq!(decoded, body);
    }

    #[test]
    fn brotli_round_trip() {
        let body = b"brotli compressed payload, repeated repeated repeated";
        let encoded = encode_content_body(body, ContentEncoding::Brotli);
        let decoded = decode_content_body(&encoded, ContentEncoding::Brotli);
        assert_eq!(decoded, body);
    }

    #[test]
    fn identity_is_passthrough() {
        let body = b"unchanged bytes";
        assert_eq!(encode_content_body(body, ContentEncoding::Identity), body);
        assert_eq!(decode_content_body(body, ContentEncoding::Identity), body);
    }

    #[test]
    fn malformed_gzip_returns_original_bytes() {
        let garbage = b"not actually gzip data";
        let decoded = decode_content_body(garbage, ContentEncoding::Gzip);
        assert_eq!(decoded, garbage);
    }

    #[test]
    fn from_header_value_maps_known_tokens() {
        assert_eq!(ContentEncoding::from_header_value("GZIP"), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header_value("x-gzip"), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header_value("deflate"), ContentEncoding::Deflate);
        assert_eq!(ContentEncoding::from_header_value("br"), ContentEncoding::Brotli);
        assert_eq!(ContentEncoding::from_header_value("bogus"), ContentEncoding::Identity);
    }
}
