//! Brotli, wrapped from the `brotli` crate.

use std::io::{Read, Write};

const BUFFER_SIZE: usize = 4096;

/// Decompresses a Brotli stream.
pub struct BrotliReader<R: Read> {
    inner: brotli::Decompressor<R>,
}

impl<R: Read> BrotliReader<R> {
    /// Creates a decoder over `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner: brotli::Decompressor::new(inner, BUFFER_SIZE),
        }
    }
}

impl<R: Read> Read for BrotliReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Compresses to a Brotli stream. Input is staged and encoded in one pass
/// at `finish`, which is also where the quality/window trade-off applies.
pub struct BrotliWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    quality: u32,
    window: u32,
}

impl<W: Write> BrotliWriter<W> {
    /// Creates an encoder with the given quality (0..=11) and window (10..=24).
    pub fn new(inner: W, quality: u32, window: u32) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            quality: quality.min(11),
            window: window.clamp(10, 24),
        }
    }

    /// Encodes the staged input and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.quality as i32,
            lgwin: self.window as i32,
            ..Default::default()
        };
        let mut input = self.buffer.as_slice();
        brotli::BrotliCompress(&mut input, &mut self.inner, &params)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BrotliWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"brotli wrapped stream".repeat(64);
        let mut writer = BrotliWriter::new(Vec::new(), 5, 22);
        writer.write_all(&data).unwrap();
        let compressed = writer.finish().unwrap();
        assert!(compressed.len() < data.len());

        let mut decoded = Vec::new();
        BrotliReader::new(Cursor::new(compressed))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }
}
