//! XZ container over LZMA2.
//!
//! A stream is a header, one or more blocks, an index and a footer. Each
//! block carries its own filter chain; only a single LZMA2 filter is
//! supported here, which is what the `xz` tool emits by default. Block
//! checks (CRC32, CRC64, SHA-256) are verified against the decompressed
//! data, and the index is verified against the blocks actually read.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lzma_rust2::{LZMA2Reader, LZMA2Writer};
use sha2::Digest;

use super::lzma::{LzmaOptions, lzma2_dict_size_from_prop, lzma2_prop_from_dict_size};
use crate::{Error, Result};

const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];
const FILTER_LZMA2: u64 = 0x21;

/// Integrity check applied to each block's uncompressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XzCheck {
    /// No check.
    None,
    /// CRC-32.
    Crc32,
    /// CRC-64, the `xz` default.
    #[default]
    Crc64,
    /// SHA-256.
    Sha256,
}

impl XzCheck {
    fn from_flags(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x04 => Ok(Self::Crc64),
            0x0A => Ok(Self::Sha256),
            other => Err(Error::unsupported(format!("xz check type {other:#04x}"))),
        }
    }

    fn to_flags(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Crc32 => 0x01,
            Self::Crc64 => 0x04,
            Self::Sha256 => 0x0A,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 => 4,
            Self::Crc64 => 8,
            Self::Sha256 => 32,
        }
    }

    fn state(self) -> CheckState {
        match self {
            Self::None => CheckState::None,
            Self::Crc32 => CheckState::Crc32(crc32fast::Hasher::new()),
            Self::Crc64 => CheckState::Crc64(crate::crc::Crc64::new()),
            Self::Sha256 => CheckState::Sha256(Box::new(sha2::Sha256::new())),
        }
    }
}

enum CheckState {
    None,
    Crc32(crc32fast::Hasher),
    Crc64(crate::crc::Crc64),
    Sha256(Box<sha2::Sha256>),
}

impl CheckState {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::None => {}
            Self::Crc32(h) => h.update(data),
            Self::Crc64(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Crc32(h) => h.finalize().to_le_bytes().to_vec(),
            Self::Crc64(h) => h.value().to_le_bytes().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Shared handle over the byte stream so the container sees the exact
/// number of bytes the LZMA2 codec consumed or produced.
struct Shared<T>(Rc<RefCell<Counted<T>>>);

struct Counted<T> {
    inner: T,
    count: u64,
}

impl<T> Shared<T> {
    fn new(inner: T) -> Self {
        Self(Rc::new(RefCell::new(Counted { inner, count: 0 })))
    }

    fn handle(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    fn count(&self) -> u64 {
        self.0.borrow().count
    }

    fn unwrap(self) -> T {
        Rc::try_unwrap(self.0)
            .ok()
            .expect("no codec handle outstanding")
            .into_inner()
            .inner
    }
}

impl<R: Read> Read for Shared<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut counted = self.0.borrow_mut();
        let n = counted.inner.read(buf)?;
        counted.count += n as u64;
        Ok(n)
    }
}

impl<W: Write> Write for Shared<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut counted = self.0.borrow_mut();
        let n = counted.inner.write(buf)?;
        counted.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().inner.flush()
    }
}

fn read_vli<R: Read>(reader: &mut R) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..9 {
        let byte = reader.read_u8()?;
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return Err(Error::invalid("non-minimal xz varint"));
            }
            return Ok(value);
        }
    }
    Err(Error::invalid("xz varint longer than 9 bytes"))
}

fn write_vli(out: &mut Vec<u8>, mut value: u64) {
    loop {
        if value < 0x80 {
            out.push(value as u8);
            return;
        }
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
}

/// Decompresses an XZ stream.
pub struct XzReader<R: Read> {
    shared: Shared<R>,
    check_type: XzCheck,
    flags: [u8; 2],
    block: Option<XzBlock<R>>,
    records: Vec<(u64, u64)>,
    finished: bool,
}

struct XzBlock<R: Read> {
    decoder: LZMA2Reader<Shared<R>>,
    header_size: u64,
    data_start: u64,
    check: CheckState,
    uncompressed: u64,
}

impl<R: Read> XzReader<R> {
    /// Parses the stream header.
    pub fn new(inner: R) -> Result<Self> {
        let mut shared = Shared::new(inner);
        let mut magic = [0u8; 6];
        shared.read_exact(&mut magic)?;
        if magic != XZ_MAGIC {
            return Err(Error::invalid_at(0, "bad xz stream magic"));
        }
        let mut flags = [0u8; 2];
        shared.read_exact(&mut flags)?;
        if flags[0] != 0 {
            return Err(Error::invalid_at(6, "reserved xz stream flag set"));
        }
        let check_type = XzCheck::from_flags(flags[1])?;
        let crc = shared.read_u32::<LittleEndian>()?;
        if crc != crc32fast::hash(&flags) {
            return Err(Error::invalid_at(8, "xz stream header CRC mismatch"));
        }
        Ok(Self {
            shared,
            check_type,
            flags,
            block: None,
            records: Vec::new(),
            finished: false,
        })
    }

    /// The stream's check type.
    pub fn check(&self) -> XzCheck {
        self.check_type
    }

    fn begin_block_or_index(&mut self) -> Result<bool> {
        let first = self.shared.read_u8()?;
        if first == 0 {
            self.read_index_and_footer()?;
            self.finished = true;
            return Ok(false);
        }

        let header_size = (first as u64 + 1) * 4;
        let mut header = vec![0u8; header_size as usize - 1];
        self.shared.read_exact(&mut header)?;
        let (crc_bytes, body_crc) = header.split_at(header.len() - 4);
        let mut crc_input = vec![first];
        crc_input.extend_from_slice(crc_bytes);
        let expected = u32::from_le_bytes(body_crc.try_into().expect("4 bytes"));
        if crc32fast::hash(&crc_input) != expected {
            return Err(Error::invalid("xz block header CRC mismatch"));
        }

        let mut body = crc_bytes;
        let block_flags = body.read_u8()?;
        let num_filters = (block_flags & 0x03) as usize + 1;
        if block_flags & 0x3C != 0 {
            return Err(Error::invalid("reserved xz block flag set"));
        }
        if block_flags & 0x40 != 0 {
            let _compressed_size = read_vli(&mut body)?;
        }
        if block_flags & 0x80 != 0 {
            let _uncompressed_size = read_vli(&mut body)?;
        }

        if num_filters != 1 {
            return Err(Error::unsupported("xz filter chains beyond a single LZMA2"));
        }
        let filter_id = read_vli(&mut body)?;
        if filter_id != FILTER_LZMA2 {
            return Err(Error::unsupported(format!("xz filter {filter_id:#x}")));
        }
        let props_size = read_vli(&mut body)?;
        if props_size != 1 {
            return Err(Error::invalid("bad LZMA2 filter properties size"));
        }
        let dict_size = lzma2_dict_size_from_prop(body.read_u8()?)?;
        // Remaining body bytes are header padding and must be zero.
        if body.iter().any(|&b| b != 0) {
            return Err(Error::invalid("non-zero xz block header padding"));
        }

        let data_start = self.shared.count();
        self.block = Some(XzBlock {
            decoder: LZMA2Reader::new(self.shared.handle(), dict_size, None),
            header_size,
            data_start,
            check: self.check_type.state(),
            uncompressed: 0,
        });
        Ok(true)
    }

    fn finish_block(&mut self) -> Result<()> {
        let block = self.block.take().expect("block in progress");
        let compressed = self.shared.count() - block.data_start;
        let padding = (4 - (compressed % 4) % 4) % 4;
        for _ in 0..padding {
            if self.shared.read_u8()? != 0 {
                return Err(Error::invalid("non-zero xz block padding"));
            }
        }
        let mut stored = vec![0u8; self.check_type.size()];
        self.shared.read_exact(&mut stored)?;
        if block.check.finalize() != stored {
            return Err(Error::invalid("xz block check mismatch"));
        }
        let unpadded = block.header_size + compressed + self.check_type.size() as u64;
        self.records.push((unpadded, block.uncompressed));
        Ok(())
    }

    fn read_index_and_footer(&mut self) -> Result<()> {
        // The 0x00 indicator was already consumed by the caller.
        let mut index = vec![0u8];
        let count = read_vli(&mut self.shared)?;
        write_vli(&mut index, count);
        if count != self.records.len() as u64 {
            return Err(Error::invalid("xz index record count mismatch"));
        }
        for &(unpadded, uncompressed) in &self.records {
            let got_unpadded = read_vli(&mut self.shared)?;
            let got_uncompressed = read_vli(&mut self.shared)?;
            if got_unpadded != unpadded || got_uncompressed != uncompressed {
                return Err(Error::invalid("xz index does not match blocks"));
            }
            write_vli(&mut index, unpadded);
            write_vli(&mut index, uncompressed);
        }
        let padding = (4 - (index.len() % 4)) % 4;
        for _ in 0..padding {
            if self.shared.read_u8()? != 0 {
                return Err(Error::invalid("non-zero xz index padding"));
            }
            index.push(0);
        }
        let stored_crc = self.shared.read_u32::<LittleEndian>()?;
        if stored_crc != crc32fast::hash(&index) {
            return Err(Error::invalid("xz index CRC mismatch"));
        }
        let index_size = index.len() as u64 + 4;

        // Footer: CRC32, backward size, flags, magic.
        let footer_crc = self.shared.read_u32::<LittleEndian>()?;
        let backward = self.shared.read_u32::<LittleEndian>()?;
        let mut footer_flags = [0u8; 2];
        self.shared.read_exact(&mut footer_flags)?;
        let mut footer_magic = [0u8; 2];
        self.shared.read_exact(&mut footer_magic)?;

        let mut crc_input = Vec::with_capacity(6);
        crc_input.extend_from_slice(&backward.to_le_bytes());
        crc_input.extend_from_slice(&footer_flags);
        if footer_crc != crc32fast::hash(&crc_input) {
            return Err(Error::invalid("xz stream footer CRC mismatch"));
        }
        if footer_magic != FOOTER_MAGIC {
            return Err(Error::invalid("bad xz stream footer magic"));
        }
        if footer_flags != self.flags {
            return Err(Error::invalid("xz footer flags disagree with header"));
        }
        if (backward as u64 + 1) * 4 != index_size {
            return Err(Error::invalid("xz backward size disagrees with index"));
        }
        Ok(())
    }
}

impl<R: Read> Read for XzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.finished {
                return Ok(0);
            }
            if self.block.is_none() && !self.begin_block_or_index().map_err(Error::into_io)? {
                return Ok(0);
            }
            let block = self.block.as_mut().expect("block set above");
            let n = block.decoder.read(buf)?;
            if n > 0 {
                block.check.update(&buf[..n]);
                block.uncompressed += n as u64;
                return Ok(n);
            }
            self.finish_block().map_err(Error::into_io)?;
        }
    }
}

/// Compresses to an XZ stream with a single LZMA2 block.
pub struct XzWriter<W: Write> {
    shared: Shared<W>,
    encoder: Option<LZMA2Writer<Shared<W>>>,
    check_type: XzCheck,
    check: CheckState,
    flags: [u8; 2],
    data_start: u64,
    header_size: u64,
    uncompressed: u64,
}

impl<W: Write> XzWriter<W> {
    /// Writes the stream header and block header.
    pub fn new(inner: W, options: &LzmaOptions, check_type: XzCheck) -> Result<Self> {
        let mut shared = Shared::new(inner);
        let flags = [0u8, check_type.to_flags()];
        shared.write_all(&XZ_MAGIC)?;
        shared.write_all(&flags)?;
        shared.write_u32::<LittleEndian>(crc32fast::hash(&flags))?;

        // Block header: flags, LZMA2 filter entry, padding, CRC32.
        let mut body = vec![0x00u8];
        write_vli(&mut body, FILTER_LZMA2);
        write_vli(&mut body, 1);
        body.push(lzma2_prop_from_dict_size(options.dictionary_size()));
        let total = (1 + body.len() + 4).div_ceil(4) * 4;
        body.resize(total - 1 - 4, 0);

        let size_byte = (total / 4 - 1) as u8;
        let mut header = vec![size_byte];
        header.extend_from_slice(&body);
        let crc = crc32fast::hash(&header);
        shared.write_all(&header)?;
        shared.write_u32::<LittleEndian>(crc)?;

        let data_start = shared.count();
        let encoder = LZMA2Writer::new(shared.handle(), &options.0.clone());
        Ok(Self {
            shared,
            encoder: Some(encoder),
            check_type,
            check: check_type.state(),
            flags,
            data_start,
            header_size: total as u64,
            uncompressed: 0,
        })
    }

    /// Finishes the block, writes the check, index and footer, and returns
    /// the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        let handle = self.encoder.take().expect("unfinished writer").finish()?;
        drop(handle);
        let compressed = self.shared.count() - self.data_start;
        let padding = (4 - (compressed % 4) % 4) % 4;
        for _ in 0..padding {
            self.shared.write_u8(0)?;
        }
        let check = std::mem::replace(&mut self.check, CheckState::None).finalize();
        self.shared.write_all(&check)?;

        let unpadded = self.header_size + compressed + self.check_type.size() as u64;
        let mut index = vec![0x00u8];
        write_vli(&mut index, 1);
        write_vli(&mut index, unpadded);
        write_vli(&mut index, self.uncompressed);
        let index_padding = (4 - (index.len() % 4)) % 4;
        index.resize(index.len() + index_padding, 0);
        let index_crc = crc32fast::hash(&index);
        self.shared.write_all(&index)?;
        self.shared.write_u32::<LittleEndian>(index_crc)?;
        let index_size = index.len() as u64 + 4;

        let backward = (index_size / 4 - 1) as u32;
        let mut crc_input = Vec::with_capacity(6);
        crc_input.extend_from_slice(&backward.to_le_bytes());
        crc_input.extend_from_slice(&self.flags);
        self.shared.write_u32::<LittleEndian>(crc32fast::hash(&crc_input))?;
        self.shared.write_u32::<LittleEndian>(backward)?;
        self.shared.write_all(&self.flags)?;
        self.shared.write_all(&FOOTER_MAGIC)?;
        self.shared.flush()?;
        Ok(self.shared.unwrap())
    }
}

impl<W: Write> Write for XzWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self
            .encoder
            .as_mut()
            .expect("unfinished writer")
            .write(buf)?;
        self.check.update(&buf[..n]);
        self.uncompressed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("unfinished writer").flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(check: XzCheck, payload: &[u8]) -> Vec<u8> {
        let options = LzmaOptions::from_level(2);
        let mut writer = XzWriter::new(Vec::new(), &options, check).unwrap();
        writer.write_all(payload).unwrap();
        let compressed = writer.finish().unwrap();
        assert_eq!(&compressed[..6], &XZ_MAGIC);
        assert_eq!(&compressed[compressed.len() - 2..], &FOOTER_MAGIC);

        let mut reader = XzReader::new(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.check(), check);
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn roundtrip_with_each_check() {
        let payload = b"xz stream contents, repeated for mass. ".repeat(64);
        for check in [XzCheck::None, XzCheck::Crc32, XzCheck::Crc64, XzCheck::Sha256] {
            assert_eq!(roundtrip(check, &payload), payload);
        }
    }

    #[test]
    fn empty_stream() {
        assert_eq!(roundtrip(XzCheck::Crc64, b""), b"");
    }

    #[test]
    fn corrupted_check_detected() {
        let options = LzmaOptions::from_level(2);
        let mut writer = XzWriter::new(Vec::new(), &options, XzCheck::Crc32).unwrap();
        writer.write_all(b"some xz payload to corrupt").unwrap();
        let mut compressed = writer.finish().unwrap();
        // Corrupt a payload byte past the two headers.
        compressed[30] ^= 0x01;

        let mut reader = XzReader::new(Cursor::new(compressed)).unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let err = XzReader::new(Cursor::new(b"not an xz stream".to_vec())).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn vli_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX >> 1] {
            let mut buf = Vec::new();
            write_vli(&mut buf, value);
            assert_eq!(read_vli(&mut buf.as_slice()).unwrap(), value);
        }
    }
}
