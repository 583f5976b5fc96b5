//! Compression codecs.
//!
//! Every decoder wraps an inner [`std::io::Read`]; every encoder wraps an
//! inner [`std::io::Write`] and has an explicit `finish()` that emits any
//! trailer and hands the inner writer back. Dropping an unfinished encoder
//! loses the trailer, the same contract the deflate/zstd wrappers have.

pub mod bzip2;
pub mod deflate;
pub mod gzip;
pub mod huffman;
pub mod lz4;
pub mod lzma;
pub mod pack200;
pub mod snappy;
pub mod xz;

#[cfg(feature = "brotli")]
pub mod brotli;
#[cfg(feature = "zstd")]
pub mod zstd;

use crate::{Error, Result};

/// A DEFLATE-family compression level: `-1` selects the library default,
/// `0` stores, `1..=9` trade speed for ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(i32);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(-1)
    }
}

impl CompressionLevel {
    /// The library default level.
    pub const DEFAULT: Self = Self(-1);
    /// Fastest compression.
    pub const FASTEST: Self = Self(1);
    /// Best compression.
    pub const BEST: Self = Self(9);

    /// Validates a raw level.
    pub fn new(level: i32) -> Result<Self> {
        if !(-1..=9).contains(&level) {
            return Err(Error::invalid(format!(
                "compression level {level} outside -1..=9"
            )));
        }
        Ok(Self(level))
    }

    /// The raw value.
    pub fn get(&self) -> i32 {
        self.0
    }

    pub(crate) fn to_flate2(self) -> flate2::Compression {
        match self.0 {
            -1 => flate2::Compression::default(),
            level => flate2::Compression::new(level as u32),
        }
    }
}
