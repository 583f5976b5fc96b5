//! Zstandard, wrapped from the `zstd` crate.

use std::io::{BufRead, Read, Write};

use crate::Result;

/// Decompresses a Zstandard stream.
pub struct ZstdReader<R: BufRead> {
    inner: zstd::Decoder<'static, R>,
}

impl<R: BufRead> ZstdReader<R> {
    /// Creates a decoder over an already-buffered reader.
    pub fn new(inner: R) -> Result<Self> {
        Ok(Self {
            inner: zstd::Decoder::with_buffer(inner)?,
        })
    }
}

impl<R: BufRead> Read for ZstdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Compresses to a Zstandard stream.
pub struct ZstdWriter<W: Write> {
    inner: zstd::Encoder<'static, W>,
}

impl<W: Write> ZstdWriter<W> {
    /// Creates an encoder with the given level (1..=22; 0 selects the
    /// library default).
    pub fn new(inner: W, level: i32) -> Result<Self> {
        Ok(Self {
            inner: zstd::Encoder::new(inner, level)?,
        })
    }

    /// Finishes the stream and returns the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.inner.finish()
    }
}

impl<W: Write> Write for ZstdWriter<W> {
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
    fn roundtrip() {
        let data = b"zstandard wrapped stream".repeat(64);
        let mut writer = ZstdWriter::new(Vec::new(), 3).unwrap();
        writer.write_all(&data).unwrap();
        let compressed = writer.finish().unwrap();
        assert!(compressed.len() < data.len());

        let mut decoded = Vec::new();
        ZstdReader::new(Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }
}
