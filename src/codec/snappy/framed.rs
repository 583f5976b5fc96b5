//! Snappy framing format ("Last revised 2013-10-25").
//!
//! Chunks are a type byte plus a 24-bit little-endian length. Data chunks
//! prepend a masked CRC-32C of the uncompressed payload; the stream starts
//! with the `sNaPpY` identifier chunk, and padding or reserved-skippable
//! chunks are passed over.

use std::io::{Read, Write};

use crate::crc::Crc32C;
use crate::{Error, Result};

use super::{compress_to_vec, decompress_to_vec};

const STREAM_IDENTIFIER: [u8; 10] =
    [0xFF, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_PADDING: u8 = 0xFE;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xFF;

/// Largest uncompressed payload a data chunk may carry.
pub const MAX_CHUNK_PAYLOAD: usize = 65536;

/// The CRC mask the framing format applies to raw CRC-32C values.
#[inline]
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(0xA282_EAD8)
}

/// Inverse of [`mask_crc`].
#[inline]
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(0xA282_EAD8);
    (rot >> 17) | (rot << 15)
}

/// Decompresses a framed snappy stream.
pub struct SnappyFramedReader<R: Read> {
    inner: R,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> SnappyFramedReader<R> {
    /// Verifies the stream identifier chunk.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut header = [0u8; 10];
        inner.read_exact(&mut header)?;
        if header != STREAM_IDENTIFIER {
            return Err(Error::invalid_at(0, "bad snappy framing signature"));
        }
        Ok(Self {
            inner,
            current: Vec::new(),
            pos: 0,
            finished: false,
        })
    }

    /// Reads chunks until one yields data. Returns false at end of stream.
    fn next_chunk(&mut self) -> Result<bool> {
        loop {
            let mut header = [0u8; 4];
            match self.inner.read(&mut header[..1])? {
                0 => return Ok(false),
                _ => {}
            }
            self.inner.read_exact(&mut header[1..])?;
            let kind = header[0];
            let len = u32::from_le_bytes([header[1], header[2], header[3], 0]) as usize;

            match kind {
                CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                    if len < 4 {
                        return Err(Error::invalid("snappy data chunk shorter than its CRC"));
                    }
                    let mut payload = vec![0u8; len];
                    self.inner.read_exact(&mut payload)?;
                    let stored = u32::from_le_bytes(payload[..4].try_into().expect("4 bytes"));
                    let data = if kind == CHUNK_COMPRESSED {
                        decompress_to_vec(&payload[4..])?
                    } else {
                        payload.split_off(4)
                    };
                    if data.len() > MAX_CHUNK_PAYLOAD {
                        return Err(Error::invalid("snappy chunk exceeds 64 KiB payload"));
                    }
                    if mask_crc(Crc32C::hash(&data)) != stored {
                        return Err(Error::invalid("snappy chunk CRC mismatch"));
                    }
                    self.current = data;
                    self.pos = 0;
                    return Ok(true);
                }
                CHUNK_STREAM_IDENTIFIER => {
                    // Identifier chunks may recur mid-stream (concatenation).
                    if len != 6 {
                        return Err(Error::invalid("bad snappy identifier chunk length"));
                    }
                    let mut body = [0u8; 6];
                    self.inner.read_exact(&mut body)?;
                    if body != STREAM_IDENTIFIER[4..] {
                        return Err(Error::invalid("bad snappy identifier chunk"));
                    }
                }
                CHUNK_PADDING | 0x80..=0xFD => {
                    // Skippable; discard the payload.
                    std::io::copy(
                        &mut (&mut self.inner).take(len as u64),
                        &mut std::io::sink(),
                    )?;
                }
                reserved => {
                    return Err(Error::unsupported(format!(
                        "snappy unskippable chunk {reserved:#04x}"
                    )));
                }
            }
        }
    }
}

impl<R: Read> Read for SnappyFramedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.current.len() {
            if self.finished {
                return Ok(0);
            }
            if !self.next_chunk().map_err(Error::into_io)? {
                self.finished = true;
                return Ok(0);
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Compresses to a framed snappy stream.
pub struct SnappyFramedWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> SnappyFramedWriter<W> {
    /// Writes the stream identifier chunk.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&STREAM_IDENTIFIER)?;
        Ok(Self {
            inner,
            buffer: Vec::with_capacity(MAX_CHUNK_PAYLOAD),
        })
    }

    fn emit_chunk(&mut self) -> std::io::Result<()> {
        let data = std::mem::take(&mut self.buffer);
        let crc = mask_crc(Crc32C::hash(&data));
        let compressed = compress_to_vec(&data);

        let (kind, payload) = if compressed.len() < data.len() {
            (CHUNK_COMPRESSED, compressed)
        } else {
            (CHUNK_UNCOMPRESSED, data)
        };
        let len = payload.len() + 4;
        self.inner.write_all(&[
            kind,
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
            ((len >> 16) & 0xFF) as u8,
        ])?;
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.write_all(&payload)?;
        Ok(())
    }

    /// Flushes the pending chunk and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.buffer.is_empty() {
            self.emit_chunk()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SnappyFramedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = MAX_CHUNK_PAYLOAD - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == MAX_CHUNK_PAYLOAD {
                self.emit_chunk()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.emit_chunk()?;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut writer = SnappyFramedWriter::new(Vec::new()).unwrap();
        writer.write_all(data).unwrap();
        let framed = writer.finish().unwrap();
        assert_eq!(&framed[..10], &STREAM_IDENTIFIER);

        let mut reader = SnappyFramedReader::new(Cursor::new(framed)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn mask_is_invertible() {
        for crc in [0u32, 1, 0xDEAD_BEEF, u32::MAX, 0x8000_0000] {
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
        }
    }

    #[test]
    fn empty_stream() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn single_chunk() {
        let data = b"framed snappy payload".repeat(100);
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn payload_over_one_chunk_splits() {
        let mut data = vec![0u8; MAX_CHUNK_PAYLOAD + 1];
        let mut state = 1u32;
        for byte in &mut data {
            state = state.wrapping_mul(0x0001_9660).wrapping_add(0x3C6E_F35F);
            *byte = (state >> 24) as u8;
        }
        let mut writer = SnappyFramedWriter::new(Vec::new()).unwrap();
        writer.write_all(&data).unwrap();
        let framed = writer.finish().unwrap();

        // Count data chunks after the identifier.
        let mut chunks = 0;
        let mut pos = 10;
        while pos < framed.len() {
            let kind = framed[pos];
            let len =
                u32::from_le_bytes([framed[pos + 1], framed[pos + 2], framed[pos + 3], 0]) as usize;
            if kind == CHUNK_COMPRESSED || kind == CHUNK_UNCOMPRESSED {
                chunks += 1;
            }
            pos += 4 + len;
        }
        assert!(chunks >= 2);

        let mut reader = SnappyFramedReader::new(Cursor::new(framed)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn padding_chunks_are_skipped() {
        let mut writer = SnappyFramedWriter::new(Vec::new()).unwrap();
        writer.write_all(b"data").unwrap();
        let mut framed = writer.finish().unwrap();
        framed.extend_from_slice(&[CHUNK_PADDING, 3, 0, 0, 0xAA, 0xBB, 0xCC]);

        let mut reader = SnappyFramedReader::new(Cursor::new(framed)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"data");
    }

    #[test]
    fn corrupt_crc_detected() {
        let mut writer = SnappyFramedWriter::new(Vec::new()).unwrap();
        writer.write_all(b"check me").unwrap();
        let mut framed = writer.finish().unwrap();
        framed[14] ^= 0xFF; // inside the chunk CRC

        let mut reader = SnappyFramedReader::new(Cursor::new(framed)).unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn unskippable_reserved_chunk_fails() {
        let mut framed = STREAM_IDENTIFIER.to_vec();
        framed.extend_from_slice(&[0x33, 1, 0, 0, 0x00]);
        let mut reader = SnappyFramedReader::new(Cursor::new(framed)).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(Error::from(err), Error::Unsupported(_)));
    }
}
