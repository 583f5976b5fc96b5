//! LZ4 frame format (v1.5.1).
//!
//! A frame is the magic, a descriptor (version, block independence and
//! checksum flags, optional content size, block max size, header checksum),
//! length-prefixed blocks with bit 31 marking stored blocks, a zero end
//! mark, and an optional content XXHash32 trailer.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{compress_block, decompress_block};
use crate::crc::XxHash32;
use crate::{Error, Result};

const FRAME_MAGIC: u32 = 0x184D_2204;
const VERSION: u8 = 0b01;

const FLG_BLOCK_INDEPENDENCE: u8 = 1 << 5;
const FLG_BLOCK_CHECKSUM: u8 = 1 << 4;
const FLG_CONTENT_SIZE: u8 = 1 << 3;
const FLG_CONTENT_CHECKSUM: u8 = 1 << 2;

const UNCOMPRESSED_FLAG: u32 = 0x8000_0000;

/// Maximum data per block, encoded in the BD descriptor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMaxSize {
    /// 64 KiB blocks.
    Max64K,
    /// 256 KiB blocks.
    Max256K,
    /// 1 MiB blocks.
    Max1M,
    /// 4 MiB blocks, the format default.
    #[default]
    Max4M,
}

impl BlockMaxSize {
    fn bytes(self) -> usize {
        match self {
            Self::Max64K => 64 * 1024,
            Self::Max256K => 256 * 1024,
            Self::Max1M => 1024 * 1024,
            Self::Max4M => 4 * 1024 * 1024,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Max64K => 4,
            Self::Max256K => 5,
            Self::Max1M => 6,
            Self::Max4M => 7,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            4 => Ok(Self::Max64K),
            5 => Ok(Self::Max256K),
            6 => Ok(Self::Max1M),
            7 => Ok(Self::Max4M),
            other => Err(Error::invalid(format!("lz4 block max size code {other}"))),
        }
    }
}

/// Writer-side frame options.
#[derive(Debug, Clone, Default)]
pub struct Lz4FrameOptions {
    /// Maximum bytes per block.
    pub block_max_size: BlockMaxSize,
    /// Append an XXHash32 after each block.
    pub block_checksum: bool,
    /// Append an XXHash32 of the whole content after the end mark.
    pub content_checksum: bool,
    /// Record the total content size in the descriptor.
    pub content_size: Option<u64>,
}

/// Decompresses an LZ4 frame.
pub struct Lz4FramedReader<R: Read> {
    inner: R,
    block_checksum: bool,
    content_checksum: bool,
    content_size: Option<u64>,
    block_independence: bool,
    /// Decoded history for linked blocks plus the current block's output.
    window: Vec<u8>,
    delivered: usize,
    content_hash: XxHash32,
    produced: u64,
    finished: bool,
}

impl<R: Read> Lz4FramedReader<R> {
    /// Parses the frame descriptor.
    pub fn new(mut inner: R) -> Result<Self> {
        if inner.read_u32::<LittleEndian>()? != FRAME_MAGIC {
            return Err(Error::invalid_at(0, "bad lz4 frame magic"));
        }
        let flg = inner.read_u8()?;
        let bd = inner.read_u8()?;
        if flg >> 6 != VERSION {
            return Err(Error::unsupported(format!("lz4 frame version {}", flg >> 6)));
        }
        if flg & 0b11 != 0 {
            return Err(Error::invalid("reserved lz4 FLG bits set"));
        }
        if bd & 0b1000_1111 != 0 {
            return Err(Error::invalid("reserved lz4 BD bits set"));
        }
        BlockMaxSize::from_code((bd >> 4) & 0x07)?;

        let mut descriptor = vec![flg, bd];
        let content_size = if flg & FLG_CONTENT_SIZE != 0 {
            let size = inner.read_u64::<LittleEndian>()?;
            descriptor.extend_from_slice(&size.to_le_bytes());
            Some(size)
        } else {
            None
        };

        let header_crc = inner.read_u8()?;
        let expected = (XxHash32::hash(0, &descriptor) >> 8) as u8;
        if header_crc != expected {
            return Err(Error::invalid("lz4 frame header checksum mismatch"));
        }

        Ok(Self {
            inner,
            block_checksum: flg & FLG_BLOCK_CHECKSUM != 0,
            content_checksum: flg & FLG_CONTENT_CHECKSUM != 0,
            content_size,
            block_independence: flg & FLG_BLOCK_INDEPENDENCE != 0,
            window: Vec::new(),
            delivered: 0,
            content_hash: XxHash32::new(0),
            produced: 0,
            finished: false,
        })
    }

    /// The content size announced in the descriptor, if any.
    pub fn content_size(&self) -> Option<u64> {
        self.content_size
    }

    fn next_block(&mut self) -> Result<bool> {
        let size_word = self.inner.read_u32::<LittleEndian>()?;
        if size_word == 0 {
            // End mark, then the optional content checksum.
            if self.content_checksum {
                let stored = self.inner.read_u32::<LittleEndian>()?;
                if stored != self.content_hash.value() {
                    return Err(Error::invalid("lz4 content checksum mismatch"));
                }
            }
            if let Some(declared) = self.content_size {
                if declared != self.produced {
                    return Err(Error::invalid("lz4 content size mismatch"));
                }
            }
            return Ok(false);
        }

        let stored_uncompressed = size_word & UNCOMPRESSED_FLAG != 0;
        let len = (size_word & !UNCOMPRESSED_FLAG) as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;

        if self.block_checksum {
            let stored = self.inner.read_u32::<LittleEndian>()?;
            if stored != XxHash32::hash(0, &payload) {
                return Err(Error::invalid("lz4 block checksum mismatch"));
            }
        }

        if !self.block_independence {
            // Linked blocks may reference the previous 64 KiB of history.
            self.slide_keep_history();
        } else {
            self.window.drain(..self.delivered);
            self.delivered = 0;
        }

        let start = self.window.len();
        if stored_uncompressed {
            self.window.extend_from_slice(&payload);
        } else {
            decompress_block(&payload, &mut self.window)?;
        }
        let produced = &self.window[start..];
        self.content_hash.update(produced);
        self.produced += produced.len() as u64;
        Ok(true)
    }

    fn slide_keep_history(&mut self) {
        const HISTORY: usize = 65536;
        if self.delivered > HISTORY {
            let drop = self.delivered - HISTORY;
            self.window.drain(..drop);
            self.delivered -= drop;
        }
    }
}

impl<R: Read> Read for Lz4FramedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.delivered == self.window.len() {
            if self.finished {
                return Ok(0);
            }
            if !self.next_block().map_err(Error::into_io)? {
                self.finished = true;
                return Ok(0);
            }
        }
        let n = (self.window.len() - self.delivered).min(buf.len());
        buf[..n].copy_from_slice(&self.window[self.delivered..self.delivered + n]);
        self.delivered += n;
        Ok(n)
    }
}

/// Compresses to an LZ4 frame with independent blocks.
pub struct Lz4FramedWriter<W: Write> {
    inner: W,
    options: Lz4FrameOptions,
    buffer: Vec<u8>,
    content_hash: XxHash32,
    written: u64,
}

impl<W: Write> Lz4FramedWriter<W> {
    /// Writes the frame header.
    pub fn new(mut inner: W, options: Lz4FrameOptions) -> Result<Self> {
        let mut flg = (VERSION << 6) | FLG_BLOCK_INDEPENDENCE;
        if options.block_checksum {
            flg |= FLG_BLOCK_CHECKSUM;
        }
        if options.content_checksum {
            flg |= FLG_CONTENT_CHECKSUM;
        }
        if options.content_size.is_some() {
            flg |= FLG_CONTENT_SIZE;
        }
        let bd = options.block_max_size.code() << 4;

        let mut descriptor = vec![flg, bd];
        if let Some(size) = options.content_size {
            descriptor.extend_from_slice(&size.to_le_bytes());
        }

        inner.write_u32::<LittleEndian>(FRAME_MAGIC)?;
        inner.write_all(&descriptor)?;
        inner.write_u8((XxHash32::hash(0, &descriptor) >> 8) as u8)?;

        Ok(Self {
            inner,
            buffer: Vec::with_capacity(options.block_max_size.bytes()),
            options,
            content_hash: XxHash32::new(0),
            written: 0,
        })
    }

    fn emit_block(&mut self) -> std::io::Result<()> {
        let data = std::mem::take(&mut self.buffer);
        let mut compressed = Vec::with_capacity(data.len());
        compress_block(&data, &mut compressed);

        let (payload, size_word) = if compressed.len() < data.len() {
            let len = compressed.len() as u32;
            (compressed, len)
        } else {
            let len = data.len() as u32 | UNCOMPRESSED_FLAG;
            (data, len)
        };
        self.inner.write_u32::<LittleEndian>(size_word)?;
        self.inner.write_all(&payload)?;
        if self.options.block_checksum {
            self.inner
                .write_u32::<LittleEndian>(XxHash32::hash(0, &payload))?;
        }
        Ok(())
    }

    /// Flushes buffered data, writes the end mark and optional content
    /// checksum, and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.buffer.is_empty() {
            self.emit_block()?;
        }
        if let Some(declared) = self.options.content_size {
            if declared != self.written {
                return Err(Error::invalid(format!(
                    "lz4 frame declared {declared} bytes but received {}",
                    self.written
                ))
                .into_io());
            }
        }
        self.inner.write_u32::<LittleEndian>(0)?;
        if self.options.content_checksum {
            self.inner
                .write_u32::<LittleEndian>(self.content_hash.value())?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Lz4FramedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let block_size = self.options.block_max_size.bytes();
        let mut rest = buf;
        while !rest.is_empty() {
            let room = block_size - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == block_size {
                self.emit_block()?;
            }
        }
        self.content_hash.update(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(options: Lz4FrameOptions, data: &[u8]) {
        let mut writer = Lz4FramedWriter::new(Vec::new(), options).unwrap();
        writer.write_all(data).unwrap();
        let framed = writer.finish().unwrap();
        assert_eq!(&framed[..4], &FRAME_MAGIC.to_le_bytes());

        let mut reader = Lz4FramedReader::new(Cursor::new(framed)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn default_options_roundtrip() {
        roundtrip(
            Lz4FrameOptions::default(),
            &b"lz4 framed payload, heavy on repetition. ".repeat(200),
        );
    }

    #[test]
    fn all_checksums_and_content_size() {
        let data = b"with every option enabled".repeat(100);
        roundtrip(
            Lz4FrameOptions {
                block_max_size: BlockMaxSize::Max64K,
                block_checksum: true,
                content_checksum: true,
                content_size: Some(data.len() as u64),
            },
            &data,
        );
    }

    #[test]
    fn incompressible_data_stored_raw() {
        let mut data = Vec::with_capacity(70_000);
        let mut state = 0x2F6E_2B1Du32;
        while data.len() < 70_000 {
            state = state.wrapping_mul(741_103_597).wrapping_add(1);
            data.push((state >> 24) as u8);
        }
        // 64K blocks force at least two blocks on this input.
        roundtrip(
            Lz4FrameOptions {
                block_max_size: BlockMaxSize::Max64K,
                ..Default::default()
            },
            &data,
        );
    }

    #[test]
    fn empty_frame() {
        roundtrip(Lz4FrameOptions::default(), b"");
    }

    #[test]
    fn corrupt_header_checksum_detected() {
        let writer = Lz4FramedWriter::new(Vec::new(), Lz4FrameOptions::default()).unwrap();
        let mut framed = writer.finish().unwrap();
        framed[4] ^= FLG_CONTENT_CHECKSUM; // flip a descriptor flag
        assert!(Lz4FramedReader::new(Cursor::new(framed)).is_err());
    }

    #[test]
    fn corrupt_content_checksum_detected() {
        let mut writer = Lz4FramedWriter::new(
            Vec::new(),
            Lz4FrameOptions {
                content_checksum: true,
                ..Default::default()
            },
        )
        .unwrap();
        writer.write_all(b"content checksum coverage").unwrap();
        let mut framed = writer.finish().unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0x01;

        let mut reader = Lz4FramedReader::new(Cursor::new(framed)).unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn content_size_mismatch_refused_on_write() {
        let mut writer = Lz4FramedWriter::new(
            Vec::new(),
            Lz4FrameOptions {
                content_size: Some(100),
                ..Default::default()
            },
        )
        .unwrap();
        writer.write_all(b"only a little").unwrap();
        assert!(writer.finish().is_err());
    }
}
