//! Payload compression for stream messages.
//!
//! The string form of [`Compression`] is the wire tag written into the
//! `comp` field of every stream message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;

/// Default zstd level when none is given.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Errors from compressing or decompressing a payload.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Unknown compression tag.
    #[error("unknown compression '{0}'")]
    Unknown(String),
    /// zstd compression failed.
    #[error("zstd compression failed: {0}")]
    ZstdCompress(std::io::Error),
    /// lz4 decompression failed.
    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(String),
    /// zstd decompression failed.
    #[error("zstd decompression failed: {0}")]
    ZstdDecompress(std::io::Error),
}

/// Compression algorithm applied to serialized payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    /// Bytes are written as-is.
    #[default]
    None,
    /// lz4 block format with a prepended size.
    Lz4,
    /// zstd at the given level.
    Zstd(i32),
}

impl Compression {
    /// Compresses `data`.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Self::Zstd(level) => {
                zstd::bulk::compress(data, level).map_err(CompressionError::ZstdCompress)
            }
        }
    }

    /// Decompresses `data`.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| CompressionError::Lz4Decompress(e.to_string())),
            Self::Zstd(_) => {
                zstd::decode_all(Cursor::new(data)).map_err(CompressionError::ZstdDecompress)
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Lz4 => f.write_str("lz4"),
            Self::Zstd(DEFAULT_ZSTD_LEVEL) => f.write_str("zstd"),
            Self::Zstd(level) => write!(f, "zstd:{level}"),
        }
    }
}

impl FromStr for Compression {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd(DEFAULT_ZSTD_LEVEL)),
            other => other
                .strip_prefix("zstd:")
                .and_then(|level| level.parse::<i32>().ok())
                .map(Self::Zstd)
                .ok_or_else(|| CompressionError::Unknown(s.to_string())),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = CompressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Compression> for String {
    fn from(value: Compression) -> Self {
        value.to_string()
    }
}
