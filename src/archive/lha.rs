//! LHA/LZH archives (read only).
//!
//! Four header generations share the method id and size cells but differ in
//! framing: levels 0/1 carry a byte-sum check and in-header names, levels
//! 1–3 chain extension headers (filename, dirname, unix metadata, header
//! CRC-16 with the CRC cell zeroed). Stored methods stream; compressed
//! methods are recognised but refuse to read.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::archive::{ArchiveEntry, EntryReader, ReaderState, skip_fully};
use crate::crc::Crc16;
use crate::encoding::EntryEncoding;
use crate::time::DosTime;
use crate::{Error, Result};

const EXT_HEADER_CRC: u8 = 0x00;
const EXT_FILENAME: u8 = 0x01;
const EXT_DIRNAME: u8 = 0x02;
const EXT_MSDOS_ATTR: u8 = 0x40;
const EXT_UNIX_PERM: u8 = 0x50;
const EXT_UNIX_IDS: u8 = 0x51;
const EXT_UNIX_MTIME: u8 = 0x54;

const STORED_METHODS: [&str; 3] = ["-lh0-", "-lz4-", "-pm0-"];
const DIRECTORY_METHOD: &str = "-lhd-";

/// One LHA entry.
#[derive(Debug, Clone, Default)]
pub struct LhaEntry {
    /// Entry name, directory part joined with `/`.
    pub name: String,
    /// Five-byte method id, e.g. `-lh5-`.
    pub method: String,
    /// Header level (0..=3).
    pub level: u8,
    /// Compressed size.
    pub compressed_size: u64,
    /// Original size.
    pub original_size: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    /// CRC-16 of the original data.
    pub crc16: u16,
    /// OS id byte (level 1+).
    pub os_id: u8,
    /// MS-DOS attribute bits.
    pub msdos_attributes: u16,
    /// Unix permission bits, when the extension was present.
    pub unix_mode: Option<u16>,
    /// Unix uid, when present.
    pub uid: Option<u16>,
    /// Unix gid, when present.
    pub gid: Option<u16>,
}

impl LhaEntry {
    /// Whether the payload is stored rather than compressed.
    pub fn is_stored(&self) -> bool {
        STORED_METHODS.contains(&self.method.as_str())
    }
}

impl ArchiveEntry for LhaEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.original_size)
    }

    fn is_directory(&self) -> bool {
        self.method == DIRECTORY_METHOD || self.name.ends_with('/')
    }

    fn last_modified(&self) -> i64 {
        self.mtime
    }
}

/// Streaming LHA reader.
pub struct LhaReader<R: Read> {
    inner: R,
    encoding: EntryEncoding,
    state: ReaderState,
    remaining: u64,
    readable: bool,
    crc: Crc16,
    expected_crc: u16,
    check_crc: bool,
}

impl<R: Read> LhaReader<R> {
    /// Creates a reader decoding names as UTF-8.
    pub fn new(inner: R) -> Self {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Creates a reader with an explicit name encoding (Shift-JIS archives
    /// are common in the wild).
    pub fn with_encoding(inner: R, encoding: EntryEncoding) -> Self {
        Self {
            inner,
            encoding,
            state: ReaderState::Init,
            remaining: 0,
            readable: false,
            crc: Crc16::new(),
            expected_crc: 0,
            check_crc: false,
        }
    }

    fn advance(&mut self) -> Result<Option<LhaEntry>> {
        skip_fully(&mut self.inner, self.remaining)?;
        self.remaining = 0;

        // The first byte decides: 0 terminates levels 0/1 archives, and a
        // clean EOF is tolerated for levels 2/3.
        let mut first = [0u8];
        if self.inner.read(&mut first)? == 0 || first[0] == 0 {
            return Ok(None);
        }

        // Read through the level byte at offset 20.
        let mut head = [0u8; 21];
        head[0] = first[0];
        self.inner.read_exact(&mut head[1..])?;
        let level = head[20];

        let entry = match level {
            0 | 1 => self.parse_level01(&head, level)?,
            2 => self.parse_level2(&head)?,
            3 => self.parse_level3(&head)?,
            other => {
                return Err(Error::unsupported(format!("lha header level {other}")));
            }
        };

        self.remaining = entry.compressed_size;
        self.readable = entry.is_stored();
        self.crc = Crc16::new();
        self.expected_crc = entry.crc16;
        self.check_crc = self.readable;
        Ok(Some(entry))
    }

    fn parse_level01(&mut self, head: &[u8; 21], level: u8) -> Result<LhaEntry> {
        let header_size = head[0] as usize;
        let checksum = head[1];
        if header_size < 22 {
            return Err(Error::invalid("lha level 0/1 header too short"));
        }
        // `header_size` counts from the method id onwards; 19 of those
        // bytes are already in `head`.
        let mut rest = vec![0u8; header_size - 19];
        self.inner.read_exact(&mut rest)?;

        let mut sum = 0u8;
        for &b in head[2..].iter().chain(rest.iter()) {
            sum = sum.wrapping_add(b);
        }
        if sum != checksum {
            return Err(Error::invalid("lha header checksum mismatch"));
        }

        let method = String::from_utf8_lossy(&head[2..7]).into_owned();
        let mut compressed_size = u32::from_le_bytes(head[7..11].try_into().expect("4")) as u64;
        let original_size = u32::from_le_bytes(head[11..15].try_into().expect("4")) as u64;
        let dos_time = DosTime(u32::from_le_bytes(head[15..19].try_into().expect("4")));

        let mut entry = LhaEntry {
            method,
            level,
            compressed_size,
            original_size,
            mtime: dos_time.to_unix_seconds(),
            msdos_attributes: head[19] as u16,
            ..Default::default()
        };

        // rest: [name_len, name..., crc16, (level 1: os id, ext size)]
        let name_len = rest[0] as usize;
        if rest.len() < 1 + name_len + 2 {
            return Err(Error::invalid("lha header name overruns the header"));
        }
        entry.name = self.encoding.decode(&rest[1..1 + name_len]).replace('\\', "/");
        entry.crc16 =
            u16::from_le_bytes(rest[1 + name_len..3 + name_len].try_into().expect("2"));

        if level == 1 {
            if rest.len() < name_len + 6 {
                return Err(Error::invalid("lha level 1 header too short"));
            }
            entry.os_id = rest[3 + name_len];
            let mut next_size = u16::from_le_bytes(
                rest[rest.len() - 2..].try_into().expect("2"),
            );
            // Extension headers are counted inside the skip size.
            let mut ext_total = 0u64;
            while next_size != 0 {
                let (consumed, following) = self.read_extension(next_size, &mut entry)?;
                ext_total += consumed;
                next_size = following;
            }
            if ext_total > compressed_size {
                return Err(Error::invalid("lha extensions exceed the skip size"));
            }
            compressed_size -= ext_total;
            entry.compressed_size = compressed_size;
        }
        Ok(entry)
    }

    fn parse_level2(&mut self, head: &[u8; 21]) -> Result<LhaEntry> {
        let total_size = u16::from_le_bytes(head[0..2].try_into().expect("2")) as usize;
        if total_size < 26 {
            return Err(Error::invalid("lha level 2 header too short"));
        }
        let mut full = head.to_vec();
        full.resize(total_size, 0);
        self.inner.read_exact(&mut full[21..])?;

        let mut entry = LhaEntry {
            method: String::from_utf8_lossy(&head[2..7]).into_owned(),
            level: 2,
            compressed_size: u32::from_le_bytes(head[7..11].try_into().expect("4")) as u64,
            original_size: u32::from_le_bytes(head[11..15].try_into().expect("4")) as u64,
            // Level 2 stores Unix epoch seconds directly.
            mtime: u32::from_le_bytes(head[15..19].try_into().expect("4")) as i64,
            crc16: u16::from_le_bytes(full[21..23].try_into().expect("2")),
            os_id: full[23],
            ..Default::default()
        };

        let crc_pos = walk_extensions(&full, 24, 2, &mut entry, self.encoding)?;
        verify_header_crc(&full, crc_pos, "lha level 2 header CRC mismatch")?;
        Ok(entry)
    }

    fn parse_level3(&mut self, head: &[u8; 21]) -> Result<LhaEntry> {
        let word_size = u16::from_le_bytes(head[0..2].try_into().expect("2"));
        if word_size != 4 {
            return Err(Error::invalid("lha level 3 word size is not 4"));
        }
        // The fixed part runs to offset 32; 11 bytes follow `head`.
        let mut fixed_rest = [0u8; 11];
        self.inner.read_exact(&mut fixed_rest)?;
        let mut full = head.to_vec();
        full.extend_from_slice(&fixed_rest);

        let total_size = u32::from_le_bytes(full[24..28].try_into().expect("4")) as usize;
        if total_size < 32 {
            return Err(Error::invalid("lha level 3 header too short"));
        }
        full.resize(total_size, 0);
        self.inner.read_exact(&mut full[32..])?;

        let mut entry = LhaEntry {
            method: String::from_utf8_lossy(&full[2..7]).into_owned(),
            level: 3,
            compressed_size: u32::from_le_bytes(full[7..11].try_into().expect("4")) as u64,
            original_size: u32::from_le_bytes(full[11..15].try_into().expect("4")) as u64,
            mtime: u32::from_le_bytes(full[15..19].try_into().expect("4")) as i64,
            crc16: u16::from_le_bytes(full[21..23].try_into().expect("2")),
            os_id: full[23],
            ..Default::default()
        };

        let crc_pos = walk_extensions(&full, 28, 4, &mut entry, self.encoding)?;
        verify_header_crc(&full, crc_pos, "lha level 3 header CRC mismatch")?;
        Ok(entry)
    }

    /// Level 1: extensions read from the stream, following the base header.
    /// Returns (bytes consumed, next extension size).
    fn read_extension(&mut self, size: u16, entry: &mut LhaEntry) -> Result<(u64, u16)> {
        if size < 3 {
            return Err(Error::invalid("lha extension shorter than its framing"));
        }
        let mut body = vec![0u8; size as usize - 2];
        self.inner.read_exact(&mut body)?;
        let mut dirname = String::new();
        apply_extension(&body, entry, &mut dirname, self.encoding)?;
        join_dirname(entry, dirname);
        let next = self.inner.read_u16::<LittleEndian>()?;
        Ok((size as u64, next))
    }
}

/// Walks an in-header extension chain starting at the size cell `size_pos`.
/// `width` is 2 for level 2 and 4 for level 3. Returns the position of the
/// header-CRC payload when a 0x00 extension is present.
fn walk_extensions(
    full: &[u8],
    mut size_pos: usize,
    width: usize,
    entry: &mut LhaEntry,
    encoding: EntryEncoding,
) -> Result<Option<usize>> {
    let mut crc_pos = None;
    let mut dirname = String::new();
    loop {
        if size_pos + width > full.len() {
            return Err(Error::invalid("lha extension chain truncated"));
        }
        let next = match width {
            2 => u16::from_le_bytes(full[size_pos..size_pos + 2].try_into().expect("2")) as usize,
            _ => u32::from_le_bytes(full[size_pos..size_pos + 4].try_into().expect("4")) as usize,
        };
        if next == 0 {
            break;
        }
        // The declared size spans the content plus the following size cell.
        if next < width + 1 {
            return Err(Error::invalid("lha extension shorter than its framing"));
        }
        let content_start = size_pos + width;
        let content_len = next - width;
        if content_start + content_len > full.len() {
            return Err(Error::invalid("lha extension overruns the header"));
        }
        let ext = &full[content_start..content_start + content_len];
        if ext[0] == EXT_HEADER_CRC && ext.len() >= 3 {
            crc_pos = Some(content_start + 1);
        }
        apply_extension(ext, entry, &mut dirname, encoding)?;
        size_pos = content_start + content_len;
    }
    join_dirname(entry, dirname);
    Ok(crc_pos)
}

/// Header CRC-16 over the whole header with the CRC cell zeroed.
fn verify_header_crc(full: &[u8], crc_pos: Option<usize>, message: &'static str) -> Result<()> {
    let Some(pos) = crc_pos else {
        // No CRC extension; nothing to verify.
        return Ok(());
    };
    let stored = u16::from_le_bytes(full[pos..pos + 2].try_into().expect("2"));
    let mut copy = full.to_vec();
    copy[pos] = 0;
    copy[pos + 1] = 0;
    let mut crc = Crc16::new();
    crc.update(&copy);
    if crc.value() != stored {
        return Err(Error::invalid(message));
    }
    Ok(())
}

fn apply_extension(
    ext: &[u8],
    entry: &mut LhaEntry,
    dirname: &mut String,
    encoding: EntryEncoding,
) -> Result<()> {
    let Some((&kind, payload)) = ext.split_first() else {
        return Err(Error::invalid("empty lha extension"));
    };
    match kind {
        EXT_HEADER_CRC => {
            // Verified over the whole header by the level parser.
        }
        EXT_FILENAME => {
            entry.name = encoding.decode(payload);
        }
        EXT_DIRNAME => {
            // 0xFF separates path components.
            let parts: Vec<String> = payload
                .split(|&b| b == 0xFF)
                .filter(|part| !part.is_empty())
                .map(|part| encoding.decode(part))
                .collect();
            *dirname = parts.join("/");
        }
        EXT_MSDOS_ATTR => {
            if payload.len() >= 2 {
                entry.msdos_attributes = u16::from_le_bytes(payload[..2].try_into().expect("2"));
            }
        }
        EXT_UNIX_PERM => {
            if payload.len() >= 2 {
                entry.unix_mode =
                    Some(u16::from_le_bytes(payload[..2].try_into().expect("2")));
            }
        }
        EXT_UNIX_IDS => {
            if payload.len() >= 4 {
                entry.gid = Some(u16::from_le_bytes(payload[..2].try_into().expect("2")));
                entry.uid = Some(u16::from_le_bytes(payload[2..4].try_into().expect("2")));
            }
        }
        EXT_UNIX_MTIME => {
            if payload.len() >= 4 {
                entry.mtime = u32::from_le_bytes(payload[..4].try_into().expect("4")) as i64;
            }
        }
        _ => {
            // Unknown extensions are skipped.
        }
    }
    Ok(())
}

fn join_dirname(entry: &mut LhaEntry, dirname: String) {
    if !dirname.is_empty() {
        entry.name = if entry.name.is_empty() {
            format!("{dirname}/")
        } else {
            format!("{dirname}/{}", entry.name)
        };
    }
}

impl<R: Read> EntryReader for LhaReader<R> {
    type Entry = LhaEntry;

    fn next_entry(&mut self) -> Result<Option<LhaEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("lha reader already failed"));
        }
        if self.state == ReaderState::Ended {
            return Ok(None);
        }
        match self.advance() {
            Ok(Some(entry)) => {
                self.state = ReaderState::InPayload;
                Ok(Some(entry))
            }
            Ok(None) => {
                self.state = ReaderState::Ended;
                Ok(None)
            }
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e)
            }
        }
    }
}

impl<R: Read> Read for LhaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() || self.remaining == 0 {
            return Ok(0);
        }
        if !self.readable {
            return Err(Error::unsupported("compressed lha payloads").into_io());
        }
        let take = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..take])?;
        if n == 0 {
            self.state = ReaderState::Failed;
            return Err(Error::Truncated.into_io());
        }
        self.remaining -= n as u64;
        if self.check_crc {
            self.crc.update(&buf[..n]);
            if self.remaining == 0 && self.crc.value() != self.expected_crc {
                self.state = ReaderState::Failed;
                return Err(Error::invalid("lha payload CRC mismatch").into_io());
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a level-0 stored entry.
    fn level0_entry(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"-lh0-");
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&DosTime::from_unix_seconds(1_600_000_000).0.to_le_bytes());
        body.push(0x20); // msdos attr
        body.push(0); // level
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        let mut crc = Crc16::new();
        crc.update(payload);
        body.extend_from_slice(&crc.value().to_le_bytes());

        let checksum = body.iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        let mut out = vec![body.len() as u8, checksum];
        out.extend_from_slice(&body);
        out.extend_from_slice(payload);
        out
    }

    /// Builds a level-2 stored entry with filename/dirname extensions.
    fn level2_entry(dir: &str, name: &str, payload: &[u8]) -> Vec<u8> {
        let mut data_crc = Crc16::new();
        data_crc.update(payload);

        let mut exts = Vec::new();
        // Header CRC extension: size 5 (size cell + type + 2 crc bytes).
        exts.extend_from_slice(&5u16.to_le_bytes());
        exts.push(EXT_HEADER_CRC);
        let crc_ext_pos = exts.len();
        exts.extend_from_slice(&[0, 0]);
        // Filename.
        exts.extend_from_slice(&((3 + name.len()) as u16).to_le_bytes());
        exts.push(EXT_FILENAME);
        exts.extend_from_slice(name.as_bytes());
        // Dirname with the 0xFF terminator.
        exts.extend_from_slice(&((3 + dir.len() + 1) as u16).to_le_bytes());
        exts.push(EXT_DIRNAME);
        exts.extend_from_slice(dir.as_bytes());
        exts.push(0xFF);
        // End of chain.
        exts.extend_from_slice(&0u16.to_le_bytes());

        let total = 24 + exts.len();
        let mut header = Vec::with_capacity(total);
        header.extend_from_slice(&(total as u16).to_le_bytes());
        header.extend_from_slice(b"-lh0-");
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        header.extend_from_slice(&1_600_000_123u32.to_le_bytes());
        header.push(0x20);
        header.push(2); // level
        header.extend_from_slice(&data_crc.value().to_le_bytes());
        header.push(b'U'); // os id
        header.extend_from_slice(&exts);

        // The header CRC covers the whole header with its cell zeroed.
        let mut crc = Crc16::new();
        crc.update(&header);
        let value = crc.value();
        let pos = 24 + crc_ext_pos;
        header[pos..pos + 2].copy_from_slice(&value.to_le_bytes());

        let mut out = header;
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_level2_with_extensions() {
        let mut archive = level2_entry("docs", "manual.txt", b"lha level two body");
        archive.extend_from_slice(&[0, 0]); // terminator
        let mut reader = LhaReader::new(archive.as_slice());
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "docs/manual.txt");
        assert_eq!(entry.level, 2);
        assert_eq!(entry.mtime, 1_600_000_123);
        assert_eq!(entry.os_id, b'U');
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"lha level two body");
    }

    #[test]
    fn level2_header_crc_mismatch_detected() {
        let mut archive = level2_entry("d", "f", b"x");
        archive[16] ^= 0x01; // inside the fixed header, breaks the CRC
        let mut reader = LhaReader::new(archive.as_slice());
        assert!(reader.next_entry().is_err());
    }

    #[test]
    fn reads_level0_stored() {
        let mut archive = level0_entry("HELLO.TXT", b"lha level zero");
        archive.push(0); // terminator
        let mut reader = LhaReader::new(archive.as_slice());
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "HELLO.TXT");
        assert_eq!(entry.method, "-lh0-");
        assert_eq!(entry.level, 0);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"lha level zero");
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn level0_checksum_mismatch_detected() {
        let mut archive = level0_entry("A.TXT", b"x");
        archive[4] ^= 0x01; // corrupt the method id
        let mut reader = LhaReader::new(archive.as_slice());
        assert!(reader.next_entry().is_err());
    }

    #[test]
    fn payload_crc_mismatch_detected() {
        let mut archive = level0_entry("A.TXT", b"payload!");
        let len = archive.len();
        archive[len - 1] ^= 0xFF;
        archive.push(0);
        let mut reader = LhaReader::new(archive.as_slice());
        reader.next_entry().unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }
}
