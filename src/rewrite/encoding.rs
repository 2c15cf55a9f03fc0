use super::RewriteError;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use hyper::header::{HeaderMap, CONTENT_ENCODING};
use std::io::{Read, Write};

/// Body encoding as declared by `Content-Encoding`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Unsupported,
}

impl ContentEncoding {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers.get(CONTENT_ENCODING) else {
            return ContentEncoding::Identity;
        };
        match value.to_str().map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Ok("") | Ok("identity") => ContentEncoding::Identity,
            Ok("gzip") | Ok("x-gzip") => ContentEncoding::Gzip,
            Ok("deflate") => ContentEncoding::Deflate,
            _ => ContentEncoding::Unsupported,
        }
    }
}

/// Concrete framing found while decoding, reused for re-encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Identity,
    Gzip,
    Zlib,
    RawDeflate,
}

impl Codec {
    fn name(&self) -> &'static str {
        match self {
            Codec::Identity => "identity",
            Codec::Gzip => "gzip",
            Codec::Zlib | Codec::RawDeflate => "deflate",
        }
    }
}

/// Decompress `body`. `deflate` accepts zlib-wrapped and raw streams.
pub fn decode(body: &[u8], encoding: ContentEncoding) -> Result<(Vec<u8>, Codec), RewriteError> {
    let codec = match encoding {
        ContentEncoding::Identity | ContentEncoding::Unsupported => return Ok((body.to_vec(), Codec::Identity)),
        ContentEncoding::Gzip => Codec::Gzip,
        ContentEncoding::Deflate if has_zlib_header(body) => Codec::Zlib,
        ContentEncoding::Deflate => Codec::RawDeflate,
    };

    let mut out = Vec::with_capacity(body.len() * 4);
    let result = match codec {
        Codec::Gzip => MultiGzDecoder::new(body).read_to_end(&mut out),
        Codec::Zlib => ZlibDecoder::new(body).read_to_end(&mut out),
        Codec::RawDeflate => DeflateDecoder::new(body).read_to_end(&mut out),
        Codec::Identity => unreachable!("identity returns early"),
    };
    result.map_err(|source| RewriteError::Decode {
        encoding: codec.name(),
        source,
    })?;
    Ok((out, codec))
}

pub fn encode(data: &[u8], codec: Codec) -> Result<Vec<u8>, RewriteError> {
    let wrap = |source| RewriteError::Encode {
        encoding: codec.name(),
        source,
    };
    let out = Vec::with_capacity(data.len() / 2);
    match codec {
        Codec::Identity => Ok(data.to_vec()),
        Codec::Gzip => {
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(data).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        Codec::Zlib => {
            let mut encoder = ZlibEncoder::new(out, Compression::default());
            encoder.write_all(data).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        Codec::RawDeflate => {
            let mut encoder = DeflateEncoder::new(out, Compression::default());
            encoder.write_all(data).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
    }
}

/// RFC 1950 header: CM = 8, CINFO <= 7, FCHECK makes the pair divisible by 31
fn has_zlib_header(body: &[u8]) -> bool {
    match body {
        [cmf, flg, ..] => cmf & 0x0f == 8 && cmf >> 4 <= 7 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}
