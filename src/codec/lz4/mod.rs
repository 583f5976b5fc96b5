//! LZ4 block format.
//!
//! A block is a series of sequences: a token byte holding the high nibbles
//! of the literal and match lengths, 255-run length extensions, the literal
//! bytes, a little-endian u16 offset and the match length extension. The
//! final sequence carries literals only. Minimum match length is 4 and
//! offsets stay within 64 KiB.

pub mod framed;

use std::io::{Read, Write};

use crate::{Error, Result};

const MIN_MATCH: usize = 4;
/// Matches must not start within the last 12 bytes of a block.
const MATCH_SAFEGUARD: usize = 12;
/// The final sequence carries at least 5 literal bytes.
const LAST_LITERALS: usize = 5;
const MAX_OFFSET: usize = 65535;

const HASH_BITS: u32 = 14;

#[inline]
fn hash(word: u32) -> usize {
    (word.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

#[inline]
fn load_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes"))
}

fn write_length_ext(out: &mut Vec<u8>, mut rest: usize) {
    while rest >= 255 {
        out.push(255);
        rest -= 255;
    }
    out.push(rest as u8);
}

/// Compresses `src` as a single LZ4 block appended to `out`.
pub fn compress_block(src: &[u8], out: &mut Vec<u8>) {
    let len = src.len();
    let mut table = vec![0u32; 1 << HASH_BITS];
    let mut literal_start = 0usize;
    let mut pos = 0usize;

    let match_limit = len.saturating_sub(MATCH_SAFEGUARD);
    while pos < match_limit {
        let word = load_u32(src, pos);
        let slot = hash(word);
        let candidate = table[slot] as usize;
        table[slot] = pos as u32;

        if candidate < pos && pos - candidate <= MAX_OFFSET && load_u32(src, candidate) == word {
            let mut match_len = MIN_MATCH;
            let extend_limit = len - LAST_LITERALS;
            while pos + match_len < extend_limit
                && src[candidate + match_len] == src[pos + match_len]
            {
                match_len += 1;
            }

            let literals = &src[literal_start..pos];
            emit_sequence(out, literals, Some((pos - candidate, match_len)));
            pos += match_len;
            literal_start = pos;
        } else {
            pos += 1;
        }
    }
    emit_sequence(out, &src[literal_start..], None);
}

fn emit_sequence(out: &mut Vec<u8>, literals: &[u8], matched: Option<(usize, usize)>) {
    let lit_len = literals.len();
    let match_stored = matched.map(|(_, len)| len - MIN_MATCH);

    let token_lit = lit_len.min(15) as u8;
    let token_match = match_stored.map_or(0, |m| m.min(15)) as u8;
    out.push((token_lit << 4) | token_match);
    if lit_len >= 15 {
        write_length_ext(out, lit_len - 15);
    }
    out.extend_from_slice(literals);
    if let Some((offset, _)) = matched {
        out.extend_from_slice(&(offset as u16).to_le_bytes());
        let stored = match_stored.expect("match length present");
        if stored >= 15 {
            write_length_ext(out, stored - 15);
        }
    }
}

/// Decompresses a complete LZ4 block into `out`.
pub fn decompress_block(mut src: &[u8], out: &mut Vec<u8>) -> Result<()> {
    while !src.is_empty() {
        let token = src[0];
        src = &src[1..];

        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            lit_len += read_length_ext(&mut src)?;
        }
        if src.len() < lit_len {
            return Err(Error::Truncated);
        }
        out.extend_from_slice(&src[..lit_len]);
        src = &src[lit_len..];

        if src.is_empty() {
            // Final sequence: literals only.
            return Ok(());
        }
        if src.len() < 2 {
            return Err(Error::Truncated);
        }
        let offset = u16::from_le_bytes([src[0], src[1]]) as usize;
        src = &src[2..];
        let mut match_len = (token & 0x0F) as usize;
        if match_len == 15 {
            match_len += read_length_ext(&mut src)?;
        }
        match_len += MIN_MATCH;

        if offset == 0 || offset > out.len() {
            return Err(Error::invalid("lz4 offset outside decoded data"));
        }
        let mut from = out.len() - offset;
        for _ in 0..match_len {
            let byte = out[from];
            out.push(byte);
            from += 1;
        }
    }
    Ok(())
}

fn read_length_ext(src: &mut &[u8]) -> Result<usize> {
    let mut total = 0usize;
    loop {
        let Some((&byte, rest)) = src.split_first() else {
            return Err(Error::Truncated);
        };
        *src = rest;
        total += byte as usize;
        if byte != 255 {
            return Ok(total);
        }
    }
}

/// Streaming decoder for a single LZ4 block stream.
pub struct Lz4BlockReader<R: Read> {
    inner: R,
    window: Vec<u8>,
    delivered: usize,
    finished: bool,
}

impl<R: Read> Lz4BlockReader<R> {
    /// Creates a block decoder over `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            window: Vec::new(),
            delivered: 0,
            finished: false,
        }
    }

    fn decode_sequence(&mut self) -> std::io::Result<bool> {
        let mut token = [0u8];
        if self.inner.read(&mut token)? == 0 {
            return Ok(false);
        }
        let token = token[0];

        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            lit_len += self.read_ext()?;
        }
        let start = self.window.len();
        self.window.resize(start + lit_len, 0);
        self.inner.read_exact(&mut self.window[start..])?;

        let mut offset_bytes = [0u8; 2];
        match self.inner.read(&mut offset_bytes[..1])? {
            0 => return Ok(false), // literals-only final sequence
            _ => self.inner.read_exact(&mut offset_bytes[1..])?,
        }
        let offset = u16::from_le_bytes(offset_bytes) as usize;
        let mut match_len = (token & 0x0F) as usize;
        if match_len == 15 {
            match_len += self.read_ext()?;
        }
        match_len += MIN_MATCH;

        if offset == 0 || offset > self.window.len() {
            return Err(Error::invalid("lz4 offset outside decoded data").into_io());
        }
        let mut from = self.window.len() - offset;
        for _ in 0..match_len {
            let byte = self.window[from];
            self.window.push(byte);
            from += 1;
        }
        Ok(true)
    }

    fn read_ext(&mut self) -> std::io::Result<usize> {
        let mut total = 0usize;
        loop {
            let mut byte = [0u8];
            self.inner.read_exact(&mut byte)?;
            total += byte[0] as usize;
            if byte[0] != 255 {
                return Ok(total);
            }
        }
    }

    fn slide(&mut self) {
        if self.delivered > 2 * MAX_OFFSET {
            let drop = self.delivered - MAX_OFFSET;
            self.window.drain(..drop);
            self.delivered -= drop;
        }
    }
}

impl<R: Read> Read for Lz4BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.delivered == self.window.len() {
            if self.finished {
                return Ok(0);
            }
            if !self.decode_sequence()? {
                self.finished = true;
            }
        }
        let n = (self.window.len() - self.delivered).min(buf.len());
        buf[..n].copy_from_slice(&self.window[self.delivered..self.delivered + n]);
        self.delivered += n;
        self.slide();
        Ok(n)
    }
}

/// Streaming encoder producing a single LZ4 block.
pub struct Lz4BlockWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> Lz4BlockWriter<W> {
    /// Creates a block encoder over `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Compresses everything written so far and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        let mut out = Vec::with_capacity(self.buffer.len() / 2 + 16);
        compress_block(&self.buffer, &mut out);
        self.inner.write_all(&out)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Lz4BlockWriter<W> {
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

    fn roundtrip(data: &[u8]) {
        let mut compressed = Vec::new();
        compress_block(data, &mut compressed);
        let mut decoded = Vec::new();
        decompress_block(&compressed, &mut decoded).unwrap();
        assert_eq!(decoded, data);

        // Streaming paths agree with the one-shot ones.
        let mut writer = Lz4BlockWriter::new(Vec::new());
        writer.write_all(data).unwrap();
        let streamed = writer.finish().unwrap();
        assert_eq!(streamed, compressed);

        let mut reader = Lz4BlockReader::new(Cursor::new(streamed));
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn empty_block() {
        roundtrip(b"");
    }

    #[test]
    fn literal_only() {
        roundtrip(b"too short to match");
    }

    #[test]
    fn repetitive() {
        let data = b"abcdefgh".repeat(1000);
        let mut compressed = Vec::new();
        compress_block(&data, &mut compressed);
        assert!(compressed.len() < data.len() / 4);
        roundtrip(&data);
    }

    #[test]
    fn long_literal_extension() {
        // Forces the 255-run literal length encoding.
        let mut data = Vec::with_capacity(600);
        let mut state = 3u32;
        for _ in 0..600 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            data.push((state >> 17) as u8);
        }
        roundtrip(&data);
    }

    #[test]
    fn overlapping_match() {
        roundtrip(&[b'z'; 4096]);
    }

    #[test]
    fn bad_offset_rejected() {
        // Token: 1 literal, then a match with offset 9 into 1 byte of output.
        let block = [0x14u8, b'x', 9, 0];
        let mut out = Vec::new();
        assert!(decompress_block(&block, &mut out).is_err());
    }

    #[test]
    fn truncated_literals_rejected() {
        let block = [0xF0u8, 200]; // declares 215 literals, provides none
        let mut out = Vec::new();
        assert!(matches!(
            decompress_block(&block, &mut out),
            Err(Error::Truncated)
        ));
    }
}
