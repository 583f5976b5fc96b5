//! Snappy, raw block format.
//!
//! A raw stream is a little-endian varint of the total uncompressed length
//! followed by tagged ops: literals (6-bit or 1–4 byte extended lengths) and
//! back-references with 1-, 2- or 4-byte offsets. The writer therefore needs
//! the uncompressed size up front; matching happens within 32 KiB blocks.

pub mod framed;

use std::io::{Read, Write};

use crate::{Error, Result};

const TAG_LITERAL: u8 = 0b00;
const TAG_COPY1: u8 = 0b01;
const TAG_COPY2: u8 = 0b10;
const TAG_COPY4: u8 = 0b11;

/// Block size used for matching and sized into the decoder's ring buffer.
pub(crate) const BLOCK_SIZE: usize = 32 * 1024;

/// Decompresses a raw snappy stream.
pub struct SnappyReader<R: Read> {
    inner: R,
    /// Sliding window of decoded bytes; back-references resolve against its
    /// tail. Holds at most three blocks.
    window: Vec<u8>,
    /// Bytes of `window` already handed to the caller.
    delivered: usize,
    declared: u64,
    remaining: u64,
}

impl<R: Read> SnappyReader<R> {
    /// Reads the uncompressed-length varint and prepares decoding.
    pub fn new(mut inner: R) -> Result<Self> {
        let declared = read_varint(&mut inner)?;
        Ok(Self {
            inner,
            window: Vec::with_capacity(3 * BLOCK_SIZE),
            delivered: 0,
            declared,
            remaining: declared,
        })
    }

    /// The total uncompressed length declared by the stream.
    pub fn uncompressed_size(&self) -> u64 {
        self.declared
    }

    fn decode_op(&mut self) -> std::io::Result<()> {
        let mut tag = [0u8];
        self.inner.read_exact(&mut tag)?;
        let tag = tag[0];
        match tag & 0x03 {
            TAG_LITERAL => {
                let selector = tag >> 2;
                let len = if selector < 60 {
                    selector as usize + 1
                } else {
                    let extra = selector as usize - 59;
                    let mut bytes = [0u8; 4];
                    self.inner.read_exact(&mut bytes[..extra])?;
                    u32::from_le_bytes(bytes) as usize + 1
                };
                let start = self.window.len();
                self.window.resize(start + len, 0);
                self.inner.read_exact(&mut self.window[start..])?;
            }
            TAG_COPY1 => {
                let mut byte = [0u8];
                self.inner.read_exact(&mut byte)?;
                let len = ((tag >> 2) & 0x07) as usize + 4;
                let offset = (((tag >> 5) as usize) << 8) | byte[0] as usize;
                self.copy(offset, len)?;
            }
            TAG_COPY2 => {
                let mut bytes = [0u8; 2];
                self.inner.read_exact(&mut bytes)?;
                self.copy(u16::from_le_bytes(bytes) as usize, (tag >> 2) as usize + 1)?;
            }
            _ => {
                let mut bytes = [0u8; 4];
                self.inner.read_exact(&mut bytes)?;
                self.copy(u32::from_le_bytes(bytes) as usize, (tag >> 2) as usize + 1)?;
            }
        }
        Ok(())
    }

    fn copy(&mut self, offset: usize, len: usize) -> std::io::Result<()> {
        if offset == 0 || offset > self.window.len() {
            return Err(Error::invalid("snappy back-reference outside window").into_io());
        }
        // Overlapping copies are legal and replicate the tail.
        let mut src = self.window.len() - offset;
        for _ in 0..len {
            let byte = self.window[src];
            self.window.push(byte);
            src += 1;
        }
        Ok(())
    }

    fn slide(&mut self) {
        // Keep one block of history once the caller has consumed past two.
        if self.delivered > 2 * BLOCK_SIZE {
            let drop = self.delivered - BLOCK_SIZE;
            self.window.drain(..drop);
            self.delivered -= drop;
        }
    }
}

impl<R: Read> Read for SnappyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.delivered == self.window.len() {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.decode_op()?;
            let produced = (self.window.len() - self.delivered) as u64;
            if produced > self.remaining {
                return Err(
                    Error::invalid("snappy stream longer than declared length").into_io()
                );
            }
            self.remaining -= produced;
        }
        let n = (self.window.len() - self.delivered).min(buf.len());
        buf[..n].copy_from_slice(&self.window[self.delivered..self.delivered + n]);
        self.delivered += n;
        self.slide();
        Ok(n)
    }
}

/// Compresses to a raw snappy stream. The total uncompressed size must be
/// declared up front; `finish` fails if the written byte count differs.
pub struct SnappyWriter<W: Write> {
    inner: W,
    declared: u64,
    written: u64,
    block: Vec<u8>,
}

impl<W: Write> SnappyWriter<W> {
    /// Writes the length varint and prepares block buffering.
    pub fn new(mut inner: W, uncompressed_size: u64) -> Result<Self> {
        write_varint(&mut inner, uncompressed_size)?;
        Ok(Self {
            inner,
            declared: uncompressed_size,
            written: 0,
            block: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    /// Compresses any buffered data and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.block.is_empty() {
            let block = std::mem::take(&mut self.block);
            compress_block(&block, &mut self.inner)?;
        }
        if self.written != self.declared {
            return Err(Error::invalid(format!(
                "snappy stream declared {} bytes but received {}",
                self.declared, self.written
            ))
            .into_io());
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SnappyWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = BLOCK_SIZE - self.block.len();
            let take = room.min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == BLOCK_SIZE {
                let block = std::mem::take(&mut self.block);
                compress_block(&block, &mut self.inner)?;
                self.block.reserve(BLOCK_SIZE);
            }
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// One-shot raw compression into a fresh buffer (used by the framing format).
pub(crate) fn compress_to_vec(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    write_varint(&mut out, data.len() as u64).expect("vec write");
    for block in data.chunks(BLOCK_SIZE) {
        compress_block(block, &mut out).expect("vec write");
    }
    out
}

/// One-shot raw decompression (used by the framing format).
pub(crate) fn decompress_to_vec(data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = SnappyReader::new(data)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

const MIN_MATCH: usize = 4;
const HASH_BITS: u32 = 14;

#[inline]
fn hash(word: u32) -> usize {
    (word.wrapping_mul(0x1E35_A7BD) >> (32 - HASH_BITS)) as usize
}

#[inline]
fn load_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes"))
}

/// Greedy hash-table matcher over one block; offsets never leave the block.
fn compress_block<W: Write>(block: &[u8], out: &mut W) -> std::io::Result<()> {
    let len = block.len();
    let mut table = vec![0u32; 1 << HASH_BITS];
    let mut literal_start = 0usize;
    let mut pos = 0usize;

    if len >= MIN_MATCH + 4 {
        while pos + MIN_MATCH + 4 <= len {
            let word = load_u32(block, pos);
            let slot = hash(word);
            let candidate = table[slot] as usize;
            table[slot] = pos as u32;
            if candidate < pos && load_u32(block, candidate) == word {
                let offset = pos - candidate;
                let mut match_len = MIN_MATCH;
                while pos + match_len < len
                    && block[candidate + match_len] == block[pos + match_len]
                {
                    match_len += 1;
                }
                emit_literal(&block[literal_start..pos], out)?;
                emit_copy(offset, match_len, out)?;
                pos += match_len;
                literal_start = pos;
            } else {
                pos += 1;
            }
        }
    }
    emit_literal(&block[literal_start..], out)?;
    Ok(())
}

fn emit_literal<W: Write>(literal: &[u8], out: &mut W) -> std::io::Result<()> {
    if literal.is_empty() {
        return Ok(());
    }
    let n = literal.len() - 1;
    if n < 60 {
        out.write_all(&[(n as u8) << 2 | TAG_LITERAL])?;
    } else if n < 0x100 {
        out.write_all(&[60 << 2 | TAG_LITERAL, n as u8])?;
    } else if n < 0x1_0000 {
        out.write_all(&[61 << 2 | TAG_LITERAL])?;
        out.write_all(&(n as u16).to_le_bytes())?;
    } else if n < 0x100_0000 {
        out.write_all(&[62 << 2 | TAG_LITERAL])?;
        out.write_all(&(n as u32).to_le_bytes()[..3])?;
    } else {
        out.write_all(&[63 << 2 | TAG_LITERAL])?;
        out.write_all(&(n as u32).to_le_bytes())?;
    }
    out.write_all(literal)
}

fn emit_copy<W: Write>(offset: usize, mut len: usize, out: &mut W) -> std::io::Result<()> {
    // Long matches split into 64-byte copies, keeping the tail ≥ 4.
    while len >= 68 {
        emit_copy_upto64(offset, 64, out)?;
        len -= 64;
    }
    if len > 64 {
        emit_copy_upto64(offset, 60, out)?;
        len -= 60;
    }
    emit_copy_upto64(offset, len, out)
}

fn emit_copy_upto64<W: Write>(offset: usize, len: usize, out: &mut W) -> std::io::Result<()> {
    debug_assert!((4..=64).contains(&len));
    if len <= 11 && offset < 2048 {
        let tag =
            TAG_COPY1 | (((len - 4) as u8) << 2) | (((offset >> 8) as u8) << 5);
        out.write_all(&[tag, (offset & 0xFF) as u8])
    } else {
        let tag = TAG_COPY2 | (((len - 1) as u8) << 2);
        out.write_all(&[tag])?;
        out.write_all(&(offset as u16).to_le_bytes())
    }
}

fn read_varint<R: Read>(inner: &mut R) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        let mut byte = [0u8];
        if inner.read(&mut byte)? == 0 {
            return Err(Error::Truncated);
        }
        value |= ((byte[0] & 0x7F) as u64) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::invalid("snappy varint longer than 10 bytes"))
}

fn write_varint<W: Write>(out: &mut W, mut value: u64) -> std::io::Result<()> {
    loop {
        if value < 0x80 {
            return out.write_all(&[value as u8]);
        }
        out.write_all(&[(value as u8 & 0x7F) | 0x80])?;
        value >>= 7;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(data: &[u8]) {
        let mut writer = SnappyWriter::new(Vec::new(), data.len() as u64).unwrap();
        writer.write_all(data).unwrap();
        let compressed = writer.finish().unwrap();

        let mut reader = SnappyReader::new(Cursor::new(compressed)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn empty() {
        roundtrip(b"");
    }

    #[test]
    fn short_literal_only() {
        roundtrip(b"abc");
    }

    #[test]
    fn repetitive_data_uses_copies() {
        let data = b"0123456789".repeat(500);
        let mut writer = SnappyWriter::new(Vec::new(), data.len() as u64).unwrap();
        writer.write_all(&data).unwrap();
        let compressed = writer.finish().unwrap();
        assert!(compressed.len() < data.len() / 4);
        roundtrip(&data);
    }

    #[test]
    fn crosses_block_boundaries() {
        let mut data = Vec::new();
        let mut state = 7u32;
        while data.len() < 3 * BLOCK_SIZE + 17 {
            state = state.wrapping_mul(48271);
            data.push((state >> 13) as u8);
        }
        roundtrip(&data);
    }

    #[test]
    fn declared_size_mismatch_fails() {
        let mut writer = SnappyWriter::new(Vec::new(), 10).unwrap();
        writer.write_all(b"short").unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn overlapping_copy() {
        // A run longer than its offset forces overlapping replication.
        roundtrip(&[b'a'; 1000]);
    }

    #[test]
    fn reference_golden_bytes() {
        // "aaaaaaaaaa" compresses to a 1-byte literal + overlapping copy.
        let compressed = compress_to_vec(b"aaaaaaaaaa");
        assert_eq!(compressed[0], 10); // varint length
        let decoded = decompress_to_vec(&compressed).unwrap();
        assert_eq!(decoded, b"aaaaaaaaaa");
    }

    #[test]
    fn truncated_stream() {
        let compressed = compress_to_vec(&b"hello world hello world".repeat(10));
        let cut = &compressed[..compressed.len() / 2];
        let mut reader = SnappyReader::new(cut).unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }
}
