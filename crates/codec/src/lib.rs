//! # Codec - record compression
//!
//! Every record stored in a region carries a one-byte **codec tag** naming
//! the compression applied to its payload. The set of codecs is closed:
//!
//! | Tag | Codec          | Format                               |
//! |-----|----------------|--------------------------------------|
//! | `0` | `Uncompressed` | payload stored verbatim              |
//! | `1` | `Gzip`         | RFC 1952 gzip member                 |
//! | `2` | `Zlib`         | RFC 1950 zlib stream (deflate)       |
//!
//! Unknown tags are rejected with [`CodecError::Unsupported`] rather than
//! guessed at.
//!
//! ## Example
//!
//! ```rust
//! use codec::Codec;
//!
//! let packed = Codec::Zlib.compress(b"hello hello hello").unwrap();
//! let codec = Codec::from_tag(Codec::Zlib.tag()).unwrap();
//! assert_eq!(codec.decompress(&packed).unwrap(), b"hello hello hello");
//! ```

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Compression level used when the caller does not pick one.
pub const DEFAULT_LEVEL: u32 = 6;

/// Highest level accepted by the deflate-based codecs.
pub const MAX_LEVEL: u32 = 9;

/// Errors produced while compressing or decompressing a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The tag does not name any known codec.
    #[error("unsupported codec tag {0}")]
    Unsupported(u8),

    /// The codec name (from configuration) is not recognised.
    #[error("unknown codec name {0:?}")]
    UnknownName(String),

    /// The encoder failed.
    #[error("compression failed: {0}")]
    Compress(#[source] io::Error),

    /// The payload is not valid for the codec that tagged it.
    #[error("decompression failed: {0}")]
    Decompress(#[source] io::Error),
}

/// Compression applied to a record payload, identified on disk by its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Codec {
    Uncompressed = 0,
    Gzip = 1,
    Zlib = 2,
}

impl Codec {
    /// All codecs, in tag order.
    pub const ALL: [Codec; 3] = [Codec::Uncompressed, Codec::Gzip, Codec::Zlib];

    /// The on-disk tag byte.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Looks up the codec for an on-disk tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Codec::Uncompressed),
            1 => Ok(Codec::Gzip),
            2 => Ok(Codec::Zlib),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    /// Short lowercase name, as accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Codec::Uncompressed => "none",
            Codec::Gzip => "gzip",
            Codec::Zlib => "zlib",
        }
    }

    /// Compresses `data` at [`DEFAULT_LEVEL`].
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.compress_with_level(data, DEFAULT_LEVEL)
    }

    /// Compresses `data` at `level` (clamped to `0..=9`). The level is
    /// ignored by [`Codec::Uncompressed`].
    pub fn compress_with_level(self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
        let level = Compression::new(level.min(MAX_LEVEL));
        let out = match self {
            Codec::Uncompressed => data.to_vec(),
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(data).map_err(CodecError::Compress)?;
                encoder.finish().map_err(CodecError::Compress)?
            }
            Codec::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data).map_err(CodecError::Compress)?;
                encoder.finish().map_err(CodecError::Compress)?
            }
        };
        trace!(codec = self.name(), raw = data.len(), packed = out.len(), "compressed payload");
        Ok(out)
    }

    /// Reverses [`compress`](Codec::compress).
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let out = match self {
            Codec::Uncompressed => data.to_vec(),
            Codec::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Decompress)?;
                out
            }
            Codec::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Decompress)?;
                out
            }
        };
        trace!(codec = self.name(), packed = data.len(), raw = out.len(), "decompressed payload");
        Ok(out)
    }
}

impl TryFrom<u8> for Codec {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Codec::from_tag(tag)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "uncompressed" | "raw" => Ok(Codec::Uncompressed),
            "gzip" | "gz" => Ok(Codec::Gzip),
            "zlib" | "deflate" => Ok(Codec::Zlib),
            _ => Err(CodecError::UnknownName(s.to_string())),
        }
    }
}

/// Compresses `data` with the codec named by `tag`.
pub fn compress(data: &[u8], tag: u8) -> Result<Vec<u8>, CodecError> {
    Codec::from_tag(tag)?.compress(data)
}

/// Decompresses `data` with the codec named by `tag`.
pub fn decompress(data: &[u8], tag: u8) -> Result<Vec<u8>, CodecError> {
    Codec::from_tag(tag)?.decompress(data)
}
