//! DEFLATE, with and without the zlib wrapper.
//!
//! Thin shims over `flate2`; raw mode omits the 2-byte zlib header and the
//! Adler-32 trailer. The distinction matters because ZIP and GZIP embed raw
//! deflate streams while standalone `.zz` data carries the wrapper.

use std::io::{BufRead, Read, Write};

use super::CompressionLevel;

/// Decompresses a raw DEFLATE stream.
pub struct DeflateReader<R: BufRead> {
    inner: flate2::bufread::DeflateDecoder<R>,
}

impl<R: BufRead> DeflateReader<R> {
    /// Creates a raw DEFLATE decoder over `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner: flate2::bufread::DeflateDecoder::new(inner),
        }
    }

    /// Returns the inner reader; unconsumed compressed bytes stay buffered in it.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: BufRead> Read for DeflateReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Decompresses a zlib-wrapped DEFLATE stream, verifying the Adler-32 trailer.
pub struct ZlibReader<R: BufRead> {
    inner: flate2::bufread::ZlibDecoder<R>,
}

impl<R: BufRead> ZlibReader<R> {
    /// Creates a zlib decoder over `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner: flate2::bufread::ZlibDecoder::new(inner),
        }
    }
}

impl<R: BufRead> Read for ZlibReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Compresses to a raw DEFLATE stream.
pub struct DeflateWriter<W: Write> {
    inner: flate2::write::DeflateEncoder<W>,
}

impl<W: Write> DeflateWriter<W> {
    /// Creates a raw DEFLATE encoder over `inner`.
    pub fn new(inner: W, level: CompressionLevel) -> Self {
        Self {
            inner: flate2::write::DeflateEncoder::new(inner, level.to_flate2()),
        }
    }

    /// Terminates the stream and returns the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.inner.finish()
    }
}

impl<W: Write> Write for DeflateWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Compresses to a zlib-wrapped DEFLATE stream.
pub struct ZlibWriter<W: Write> {
    inner: flate2::write::ZlibEncoder<W>,
}

impl<W: Write> ZlibWriter<W> {
    /// Creates a zlib encoder over `inner`.
    pub fn new(inner: W, level: CompressionLevel) -> Self {
        Self {
            inner: flate2::write::ZlibEncoder::new(inner, level.to_flate2()),
        }
    }

    /// Terminates the stream, emits the Adler-32 trailer and returns the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.inner.finish()
    }
}

impl<W: Write> Write for ZlibWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn raw_roundtrip() {
        let original = b"deflate me, twice over: deflate me".repeat(20);
        let mut writer = DeflateWriter::new(Vec::new(), CompressionLevel::DEFAULT);
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();
        assert!(compressed.len() < original.len());

        let mut decoded = Vec::new();
        DeflateReader::new(Cursor::new(compressed))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn zlib_roundtrip_and_header() {
        let original = b"zlib wrapped".to_vec();
        let mut writer = ZlibWriter::new(Vec::new(), CompressionLevel::new(6).unwrap());
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();
        // CMF byte: deflate with a 32 KiB window.
        assert_eq!(compressed[0], 0x78);

        let mut decoded = Vec::new();
        ZlibReader::new(Cursor::new(compressed))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn stored_level_zero() {
        let original = vec![7u8; 256];
        let mut writer = DeflateWriter::new(Vec::new(), CompressionLevel::new(0).unwrap());
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();
        // Level 0 emits stored blocks, so output exceeds input.
        assert!(compressed.len() > original.len());
        let mut decoded = Vec::new();
        DeflateReader::new(Cursor::new(compressed))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn invalid_level_rejected() {
        assert!(CompressionLevel::new(10).is_err());
        assert!(CompressionLevel::new(-2).is_err());
    }
}
