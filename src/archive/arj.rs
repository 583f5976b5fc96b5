//! ARJ archives (read only).
//!
//! Headers are little-endian records behind a `0x60 0xEA` magic with a
//! CRC-32 over the basic header. Only stored (method 0) payloads stream;
//! compressed methods are listed but refuse to read. Garbled (encrypted)
//! and multi-volume archives are rejected up front.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::archive::{ArchiveEntry, EntryReader, ReaderState, skip_fully};
use crate::time::DosTime;
use crate::{Error, Result};

pub(crate) const ARJ_MAGIC: [u8; 2] = [0x60, 0xEA];

const FLAG_GARBLED: u8 = 0x01;
const FLAG_VOLUME: u8 = 0x04;

const METHOD_STORED: u8 = 0;
const TYPE_DIRECTORY: u8 = 3;

/// The archive-level header.
#[derive(Debug, Clone, Default)]
pub struct ArjMainHeader {
    /// Version of the creating archiver.
    pub archiver_version: u8,
    /// Minimum version needed to extract.
    pub min_version: u8,
    /// Creating host OS code.
    pub host_os: u8,
    /// Archive flag bits.
    pub flags: u8,
    /// Creation time.
    pub created: i64,
    /// Original archive name.
    pub name: String,
    /// Archive comment.
    pub comment: String,
}

/// One ARJ entry.
#[derive(Debug, Clone, Default)]
pub struct ArjEntry {
    /// Entry name.
    pub name: String,
    /// Entry comment.
    pub comment: String,
    /// Compression method (0 = stored).
    pub method: u8,
    /// Entry kind code; 3 is a directory.
    pub file_type: u8,
    /// Creating host OS code.
    pub host_os: u8,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    /// Stored (compressed) size.
    pub compressed_size: u64,
    /// Original size.
    pub original_size: u64,
    /// CRC-32 of the original data.
    pub crc32: u32,
    /// Host access-mode bits.
    pub access_mode: u16,
}

impl ArchiveEntry for ArjEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.original_size)
    }

    fn is_directory(&self) -> bool {
        self.file_type == TYPE_DIRECTORY
    }

    fn last_modified(&self) -> i64 {
        self.mtime
    }
}

/// Streaming ARJ reader.
pub struct ArjReader<R: Read> {
    inner: R,
    main_header: ArjMainHeader,
    state: ReaderState,
    remaining: u64,
    readable: bool,
    crc: crc32fast::Hasher,
    expected_crc: u32,
}

impl<R: Read> ArjReader<R> {
    /// Parses the main header.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = read_basic_header(&mut inner, true)?
            .ok_or_else(|| Error::invalid_at(0, "missing arj main header"))?;
        let main_header = parse_main_header(&header)?;
        if main_header.flags & FLAG_GARBLED != 0 {
            return Err(Error::unsupported("garbled (encrypted) arj archives"));
        }
        if main_header.flags & FLAG_VOLUME != 0 {
            return Err(Error::unsupported("multi-volume arj archives"));
        }
        Ok(Self {
            inner,
            main_header,
            state: ReaderState::Init,
            remaining: 0,
            readable: false,
            crc: crc32fast::Hasher::new(),
            expected_crc: 0,
        })
    }

    /// The archive-level header.
    pub fn main_header(&self) -> &ArjMainHeader {
        &self.main_header
    }

    fn advance(&mut self) -> Result<Option<ArjEntry>> {
        skip_fully(&mut self.inner, self.remaining)?;
        self.remaining = 0;

        let Some(header) = read_basic_header(&mut self.inner, false)? else {
            return Ok(None);
        };
        let entry = parse_local_header(&header)?;
        self.remaining = entry.compressed_size;
        self.readable = entry.method == METHOD_STORED;
        self.crc = crc32fast::Hasher::new();
        self.expected_crc = entry.crc32;
        Ok(Some(entry))
    }
}

/// Reads one basic-header block. `scan` tolerates leading junk before the
/// magic (self-extracting stubs). Returns `None` on the end-of-archive
/// marker.
fn read_basic_header<R: Read>(inner: &mut R, scan: bool) -> Result<Option<Vec<u8>>> {
    let mut window = [0u8; 2];
    inner.read_exact(&mut window)?;
    if scan {
        let mut scanned = 0u32;
        while window != ARJ_MAGIC {
            if scanned > 1 << 20 {
                return Err(Error::invalid("no arj magic within the first MiB"));
            }
            window[0] = window[1];
            let mut next = [0u8];
            inner.read_exact(&mut next)?;
            window[1] = next[0];
            scanned += 1;
        }
    } else if window != ARJ_MAGIC {
        return Err(Error::invalid("bad arj header magic"));
    }

    let size = inner.read_u16::<LittleEndian>()?;
    if size == 0 {
        return Ok(None);
    }
    if size > 2600 {
        return Err(Error::invalid("arj basic header over 2600 bytes"));
    }
    let mut header = vec![0u8; size as usize];
    inner.read_exact(&mut header)?;
    let stored_crc = inner.read_u32::<LittleEndian>()?;
    if crc32fast::hash(&header) != stored_crc {
        return Err(Error::invalid("arj basic header CRC mismatch"));
    }

    // Extended headers chain until a zero size; each carries its own CRC.
    loop {
        let ext_size = inner.read_u16::<LittleEndian>()?;
        if ext_size == 0 {
            break;
        }
        let mut ext = vec![0u8; ext_size as usize];
        inner.read_exact(&mut ext)?;
        let ext_crc = inner.read_u32::<LittleEndian>()?;
        if crc32fast::hash(&ext) != ext_crc {
            return Err(Error::invalid("arj extended header CRC mismatch"));
        }
    }

    Ok(Some(header))
}

fn read_strings(header: &[u8], first_hdr_size: usize) -> Result<(String, String)> {
    let rest = header
        .get(first_hdr_size..)
        .ok_or_else(|| Error::invalid("arj first header size out of range"))?;
    let mut parts = rest.split(|&b| b == 0);
    let name = parts
        .next()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .unwrap_or_default();
    let comment = parts
        .next()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .unwrap_or_default();
    Ok((name, comment))
}

fn parse_main_header(header: &[u8]) -> Result<ArjMainHeader> {
    if header.len() < 30 {
        return Err(Error::invalid("arj main header too short"));
    }
    let mut cursor = &header[..];
    let first_hdr_size = cursor.read_u8()? as usize;
    let archiver_version = cursor.read_u8()?;
    let min_version = cursor.read_u8()?;
    let host_os = cursor.read_u8()?;
    let flags = cursor.read_u8()?;
    let _security_version = cursor.read_u8()?;
    let _file_type = cursor.read_u8()?;
    let _reserved = cursor.read_u8()?;
    let created = DosTime(cursor.read_u32::<LittleEndian>()?).to_unix_seconds();
    let (name, comment) = read_strings(header, first_hdr_size)?;

    Ok(ArjMainHeader {
        archiver_version,
        min_version,
        host_os,
        flags,
        created,
        name,
        comment,
    })
}

fn parse_local_header(header: &[u8]) -> Result<ArjEntry> {
    if header.len() < 30 {
        return Err(Error::invalid("arj local header too short"));
    }
    let mut cursor = &header[..];
    let first_hdr_size = cursor.read_u8()? as usize;
    let _archiver_version = cursor.read_u8()?;
    let _min_version = cursor.read_u8()?;
    let host_os = cursor.read_u8()?;
    let flags = cursor.read_u8()?;
    let method = cursor.read_u8()?;
    let file_type = cursor.read_u8()?;
    let _reserved = cursor.read_u8()?;
    let mtime = DosTime(cursor.read_u32::<LittleEndian>()?).to_unix_seconds();
    let compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let original_size = cursor.read_u32::<LittleEndian>()? as u64;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let _filespec_position = cursor.read_u16::<LittleEndian>()?;
    let access_mode = cursor.read_u16::<LittleEndian>()?;

    if flags & FLAG_GARBLED != 0 {
        return Err(Error::unsupported("garbled (encrypted) arj entries"));
    }
    if flags & FLAG_VOLUME != 0 {
        return Err(Error::unsupported("split arj entries"));
    }

    let (name, comment) = read_strings(header, first_hdr_size)?;
    Ok(ArjEntry {
        name,
        comment,
        method,
        file_type,
        host_os,
        mtime,
        compressed_size,
        original_size,
        crc32,
        access_mode,
    })
}

impl<R: Read> EntryReader for ArjReader<R> {
    type Entry = ArjEntry;

    fn next_entry(&mut self) -> Result<Option<ArjEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("arj reader already failed"));
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

impl<R: Read> Read for ArjReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() || self.remaining == 0 {
            return Ok(0);
        }
        if !self.readable {
            return Err(Error::unsupported("compressed arj payloads").into_io());
        }
        let take = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..take])?;
        if n == 0 {
            self.state = ReaderState::Failed;
            return Err(Error::Truncated.into_io());
        }
        self.remaining -= n as u64;
        self.crc.update(&buf[..n]);
        if self.remaining == 0 {
            let crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new()).finalize();
            if crc != self.expected_crc {
                self.state = ReaderState::Failed;
                return Err(Error::invalid("arj payload CRC mismatch").into_io());
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal stored-method archive: main header, one file, end.
    fn build_archive(payload: &[u8], method: u8) -> Vec<u8> {
        let mut out = Vec::new();

        let mut main = Vec::new();
        main.push(30u8); // first_hdr_size
        main.push(11); // archiver version
        main.push(1); // min version
        main.push(0); // host os
        main.push(0); // flags
        main.extend_from_slice(&[0, 2, 0]); // security, file type, reserved
        main.extend_from_slice(&0x5000_0000u32.to_le_bytes()); // created
        main.extend_from_slice(&[0u8; 30 - 12]); // remaining fixed cells
        main.extend_from_slice(b"test.arj\0\0");

        out.extend_from_slice(&ARJ_MAGIC);
        out.extend_from_slice(&(main.len() as u16).to_le_bytes());
        out.extend_from_slice(&main);
        out.extend_from_slice(&crc32fast::hash(&main).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // no extended headers

        let mut local = Vec::new();
        local.push(30u8);
        local.push(11);
        local.push(1);
        local.push(0); // host os
        local.push(0); // flags
        local.push(method);
        local.push(0); // file type
        local.push(0); // reserved
        local.extend_from_slice(&0x5100_0000u32.to_le_bytes()); // mtime
        local.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        local.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        local.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        local.extend_from_slice(&0u16.to_le_bytes()); // filespec position
        local.extend_from_slice(&0o644u16.to_le_bytes()); // access mode
        local.extend_from_slice(&[0u8; 2]); // chapters
        local.extend_from_slice(b"file.txt\0\0");

        out.extend_from_slice(&ARJ_MAGIC);
        out.extend_from_slice(&(local.len() as u16).to_le_bytes());
        out.extend_from_slice(&local);
        out.extend_from_slice(&crc32fast::hash(&local).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(payload);

        // End of archive: magic + zero size.
        out.extend_from_slice(&ARJ_MAGIC);
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn reads_stored_entry() {
        let bytes = build_archive(b"arj stored payload", 0);
        let mut reader = ArjReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.main_header().name, "test.arj");

        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "file.txt");
        assert_eq!(entry.original_size, 18);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"arj stored payload");

        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn compressed_entries_are_listed_but_not_readable() {
        let bytes = build_archive(b"pretend-compressed", 1);
        let mut reader = ArjReader::new(bytes.as_slice()).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.method, 1);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(Error::from(err), Error::Unsupported(_)));
        // Skipping still works.
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn corrupted_header_crc_rejected() {
        let mut bytes = build_archive(b"x", 0);
        bytes[10] ^= 0xFF;
        assert!(ArjReader::new(bytes.as_slice()).is_err());
    }

    #[test]
    fn junk_before_main_header_is_scanned_past() {
        let mut bytes = b"MZ self-extracting stub ".to_vec();
        bytes.extend_from_slice(&build_archive(b"data", 0));
        let mut reader = ArjReader::new(bytes.as_slice()).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "file.txt");
    }
}
