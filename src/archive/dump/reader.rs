//! Streaming dump-tape reader.

use std::collections::HashMap;
use std::io::Read;

use super::{
    CHECKSUM_SENTINEL, DumpEntry, DumpEntryKind, DumpSummary, NFS_MAGIC, RECORD_SIZE, ROOT_INO,
    TS_ADDR, TS_BITS, TS_CLRI, TS_END, TS_INODE, TS_TAPE,
};
use crate::archive::{EntryReader, ReaderState};
use crate::{Error, Result};

/// One parsed segment header record.
struct SegmentHeader {
    kind: u32,
    ino: u32,
    count: usize,
    /// Per-record presence map; zero means a hole.
    addr: Vec<u8>,
    /// The raw record for the dinode fields.
    raw: [u8; RECORD_SIZE],
}

fn word(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().expect("4 bytes"))
}

fn half(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(raw[offset..offset + 2].try_into().expect("2 bytes"))
}

fn text(raw: &[u8], offset: usize, len: usize) -> String {
    let cell = &raw[offset..offset + len];
    let end = cell.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&cell[..end]).into_owned()
}

/// Reads a dump tape from a forward-only byte stream.
pub struct DumpReader<R: Read> {
    inner: R,
    summary: DumpSummary,
    state: ReaderState,
    /// ino → (parent ino, name), harvested from directory payloads.
    names: HashMap<u32, (u32, String)>,
    current: Option<OpenFile>,
    ended: bool,
}

/// Streaming state of the file entry being read.
struct OpenFile {
    remaining: u64,
    addr: Vec<u8>,
    addr_pos: usize,
    buffer: [u8; RECORD_SIZE],
    buf_pos: usize,
    buf_len: usize,
}

impl<R: Read> DumpReader<R> {
    /// Reads and validates the TS_TAPE volume header.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = read_segment_header(&mut inner)?;
        if header.kind != TS_TAPE {
            return Err(Error::invalid_at(0, "dump tape does not start with TS_TAPE"));
        }
        let raw = &header.raw;
        let summary = DumpSummary {
            date: word(raw, 4) as i64,
            previous_date: word(raw, 8) as i64,
            volume: word(raw, 12),
            label: text(raw, 676, 16),
            level: word(raw, 692),
            filesystem: text(raw, 696, 64),
            device: text(raw, 760, 64),
            hostname: text(raw, 824, 64),
        };
        Ok(Self {
            inner,
            summary,
            state: ReaderState::Init,
            names: HashMap::new(),
            current: None,
            ended: false,
        })
    }

    /// The volume summary.
    pub fn summary(&self) -> &DumpSummary {
        &self.summary
    }

    fn resolve_path(&self, ino: u32) -> String {
        let mut segments = Vec::new();
        let mut cursor = ino;
        let mut hops = 0;
        while cursor != ROOT_INO {
            let Some((parent, name)) = self.names.get(&cursor) else {
                // Parent not on tape yet; fall back to an inode-numbered path.
                return format!("ino-{ino}");
            };
            segments.push(name.clone());
            cursor = *parent;
            hops += 1;
            if hops > 4096 {
                return format!("ino-{ino}");
            }
        }
        segments.reverse();
        segments.join("/")
    }

    fn advance(&mut self) -> Result<Option<DumpEntry>> {
        // Drain the open file.
        if self.current.is_some() {
            let mut sink = [0u8; 4096];
            while self.read_file_data(&mut sink)? > 0 {}
            self.current = None;
        }

        loop {
            let header = read_segment_header(&mut self.inner)?;
            match header.kind {
                TS_CLRI | TS_BITS => {
                    // Inode usage maps; c_count records of bitmap data.
                    crate::archive::skip_fully(
                        &mut self.inner,
                        header.count as u64 * RECORD_SIZE as u64,
                    )?;
                }
                TS_END => {
                    self.ended = true;
                    return Ok(None);
                }
                TS_INODE => {
                    let entry = parse_inode(&header);
                    if entry.kind == DumpEntryKind::Directory {
                        let data = self.collect_data(&header, entry.size)?;
                        self.harvest_directory(entry.ino, &data);
                        let mut entry = entry;
                        entry.name = self.resolve_path(entry.ino);
                        return Ok(Some(entry));
                    }
                    let mut entry = entry;
                    entry.name = self.resolve_path(entry.ino);
                    self.current = Some(OpenFile {
                        remaining: entry.size,
                        addr: header.addr,
                        addr_pos: 0,
                        buffer: [0u8; RECORD_SIZE],
                        buf_pos: 0,
                        buf_len: 0,
                    });
                    return Ok(Some(entry));
                }
                TS_ADDR => {
                    // A continuation with no open file means a corrupt tape.
                    return Err(Error::invalid("unexpected TS_ADDR segment"));
                }
                TS_TAPE => {
                    return Err(Error::unsupported("multi-volume dump tapes"));
                }
                other => {
                    return Err(Error::invalid(format!("unknown dump segment {other}")));
                }
            }
        }
    }

    /// Reads a whole inode's data eagerly (used for directories).
    fn collect_data(&mut self, header: &SegmentHeader, size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        let mut addr = header.addr.clone();
        let mut pos = 0usize;
        while (out.len() as u64) < size {
            if pos == addr.len() {
                let next = read_segment_header(&mut self.inner)?;
                if next.kind != TS_ADDR {
                    return Err(Error::invalid("dump inode data cut short"));
                }
                addr = next.addr;
                pos = 0;
                continue;
            }
            let mut record = [0u8; RECORD_SIZE];
            if addr[pos] != 0 {
                self.inner.read_exact(&mut record)?;
            }
            pos += 1;
            let want = ((size - out.len() as u64) as usize).min(RECORD_SIZE);
            out.extend_from_slice(&record[..want]);
        }
        Ok(out)
    }

    /// Parses 4.4BSD `struct direct` records out of a directory payload.
    fn harvest_directory(&mut self, dir_ino: u32, data: &[u8]) {
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let ino = word(data, pos);
            let reclen = half(data, pos + 4) as usize;
            let namelen = data[pos + 7] as usize;
            if reclen == 0 || pos + reclen > data.len() {
                break;
            }
            if ino != 0 && pos + 8 + namelen <= data.len() {
                let name = String::from_utf8_lossy(&data[pos + 8..pos + 8 + namelen])
                    .into_owned();
                if name != "." && name != ".." {
                    self.names.insert(ino, (dir_ino, name));
                }
            }
            pos += reclen;
        }
    }

    fn read_file_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(file) = self.current.as_mut() else {
            return Ok(0);
        };
        loop {
            if file.remaining == 0 {
                return Ok(0);
            }
            if file.buf_pos < file.buf_len {
                let n = (file.buf_len - file.buf_pos)
                    .min(buf.len())
                    .min(file.remaining as usize);
                buf[..n].copy_from_slice(&file.buffer[file.buf_pos..file.buf_pos + n]);
                file.buf_pos += n;
                file.remaining -= n as u64;
                return Ok(n);
            }
            if file.addr_pos == file.addr.len() {
                let next = read_segment_header(&mut self.inner)?;
                if next.kind != TS_ADDR {
                    return Err(Error::invalid("dump file data cut short"));
                }
                file.addr = next.addr;
                file.addr_pos = 0;
                continue;
            }
            // Load the next logical record: data from tape, holes as zeros.
            if file.addr[file.addr_pos] != 0 {
                self.inner.read_exact(&mut file.buffer)?;
            } else {
                file.buffer.fill(0);
            }
            file.addr_pos += 1;
            file.buf_pos = 0;
            // A short final record still occupies a full tape record; only
            // `remaining` bytes of it are file data.
            file.buf_len = RECORD_SIZE.min(file.remaining as usize);
        }
    }
}

fn read_segment_header<R: Read>(inner: &mut R) -> Result<SegmentHeader> {
    let mut raw = [0u8; RECORD_SIZE];
    inner.read_exact(&mut raw)?;

    if word(&raw, 24) != NFS_MAGIC {
        return Err(Error::invalid("bad dump segment magic"));
    }
    let mut sum = 0u32;
    for i in 0..256 {
        sum = sum.wrapping_add(word(&raw, i * 4));
    }
    if sum != CHECKSUM_SENTINEL {
        return Err(Error::invalid("dump segment checksum mismatch"));
    }

    let count = word(&raw, 160) as usize;
    if count > 512 {
        return Err(Error::invalid("dump segment count over 512"));
    }
    Ok(SegmentHeader {
        kind: word(&raw, 0),
        ino: word(&raw, 20),
        count,
        addr: raw[164..164 + count].to_vec(),
        raw,
    })
}

fn parse_inode(header: &SegmentHeader) -> DumpEntry {
    let raw = &header.raw;
    let mode = half(raw, 32);
    DumpEntry {
        name: String::new(),
        ino: header.ino,
        kind: DumpEntryKind::from_mode(mode),
        mode: mode & 0o7777,
        nlink: half(raw, 34),
        uid: word(raw, 132),
        gid: word(raw, 136),
        size: u64::from_le_bytes(raw[40..48].try_into().expect("8 bytes")),
        atime: word(raw, 48) as i64,
        mtime: word(raw, 56) as i64,
    }
}

impl<R: Read> EntryReader for DumpReader<R> {
    type Entry = DumpEntry;

    fn next_entry(&mut self) -> Result<Option<DumpEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("dump reader already failed"));
        }
        if self.state == ReaderState::Ended || self.ended {
            self.state = ReaderState::Ended;
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

impl<R: Read> Read for DumpReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() {
            return Ok(0);
        }
        match self.read_file_data(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e.into_io())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_checksum(record: &mut [u8; RECORD_SIZE]) {
        record[28..32].copy_from_slice(&0u32.to_le_bytes());
        let mut sum = 0u32;
        for i in 0..256 {
            sum = sum.wrapping_add(word(record, i * 4));
        }
        let fix = CHECKSUM_SENTINEL.wrapping_sub(sum);
        record[28..32].copy_from_slice(&fix.to_le_bytes());
    }

    fn header(kind: u32, ino: u32, count: u32) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        record[0..4].copy_from_slice(&kind.to_le_bytes());
        record[20..24].copy_from_slice(&ino.to_le_bytes());
        record[24..28].copy_from_slice(&NFS_MAGIC.to_le_bytes());
        record[160..164].copy_from_slice(&count.to_le_bytes());
        record
    }

    fn inode_header(
        ino: u32,
        mode: u16,
        size: u64,
        addr: &[u8],
    ) -> [u8; RECORD_SIZE] {
        let mut record = header(TS_INODE, ino, addr.len() as u32);
        record[32..34].copy_from_slice(&mode.to_le_bytes());
        record[34..36].copy_from_slice(&1u16.to_le_bytes());
        record[40..48].copy_from_slice(&size.to_le_bytes());
        record[56..60].copy_from_slice(&1_600_000_000u32.to_le_bytes());
        record[132..136].copy_from_slice(&1000u32.to_le_bytes());
        record[164..164 + addr.len()].copy_from_slice(addr);
        patch_checksum(&mut record);
        record
    }

    /// A directory payload with one entry pointing at `ino`.
    fn dirent_payload(ino: u32, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for (entry_ino, entry_name) in
            [(ROOT_INO, "."), (ROOT_INO, ".."), (ino, name)]
        {
            let namelen = entry_name.len();
            let reclen = (8 + namelen + 4) & !3;
            let mut cell = vec![0u8; reclen];
            cell[0..4].copy_from_slice(&entry_ino.to_le_bytes());
            cell[4..6].copy_from_slice(&(reclen as u16).to_le_bytes());
            cell[6] = 8; // DT_REG, unused by the parser
            cell[7] = namelen as u8;
            cell[8..8 + namelen].copy_from_slice(entry_name.as_bytes());
            out.extend_from_slice(&cell);
        }
        out
    }

    fn build_tape() -> Vec<u8> {
        let mut tape = Vec::new();
        let mut tape_header = header(TS_TAPE, 0, 0);
        tape_header[676..681].copy_from_slice(b"label");
        tape_header[824..828].copy_from_slice(b"host");
        patch_checksum(&mut tape_header);
        tape.extend_from_slice(&tape_header);

        // Root directory, inode 2, one child "hello.txt" at inode 5.
        let dir_payload = dirent_payload(5, "hello.txt");
        tape.extend_from_slice(&inode_header(
            ROOT_INO,
            0x4000 | 0o755,
            dir_payload.len() as u64,
            &[1],
        ));
        let mut record = [0u8; RECORD_SIZE];
        record[..dir_payload.len()].copy_from_slice(&dir_payload);
        tape.extend_from_slice(&record);

        // The file: 1500 bytes, one data record, one hole record.
        let payload = b"dump payload".repeat(50);
        assert!(payload.len() > RECORD_SIZE && payload.len() < 2 * RECORD_SIZE);
        tape.extend_from_slice(&inode_header(
            5,
            0x8000 | 0o644,
            payload.len() as u64,
            &[1, 1],
        ));
        tape.extend_from_slice(&payload[..RECORD_SIZE]);
        let mut tail = [0u8; RECORD_SIZE];
        tail[..payload.len() - RECORD_SIZE].copy_from_slice(&payload[RECORD_SIZE..]);
        tape.extend_from_slice(&tail);

        let mut end = header(TS_END, 0, 0);
        patch_checksum(&mut end);
        tape.extend_from_slice(&end);
        tape
    }

    #[test]
    fn walks_a_small_tape() {
        let tape = build_tape();
        let mut reader = DumpReader::new(tape.as_slice()).unwrap();
        assert_eq!(reader.summary().label, "label");
        assert_eq!(reader.summary().hostname, "host");

        let root = reader.next_entry().unwrap().unwrap();
        assert!(root.is_directory());
        assert_eq!(root.ino, ROOT_INO);

        let file = reader.next_entry().unwrap().unwrap();
        assert_eq!(file.name, "hello.txt");
        assert_eq!(file.kind, DumpEntryKind::File);
        assert_eq!(file.mtime, 1_600_000_000);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"dump payload".repeat(50));

        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn hole_records_read_as_zeros() {
        let mut tape = Vec::new();
        let mut tape_header = header(TS_TAPE, 0, 0);
        patch_checksum(&mut tape_header);
        tape.extend_from_slice(&tape_header);

        // 2048-byte file: a hole record then a data record.
        tape.extend_from_slice(&inode_header(7, 0x8000 | 0o600, 2048, &[0, 1]));
        tape.extend_from_slice(&[0xABu8; RECORD_SIZE]);
        let mut end = header(TS_END, 0, 0);
        patch_checksum(&mut end);
        tape.extend_from_slice(&end);

        let mut reader = DumpReader::new(tape.as_slice()).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "ino-7");
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 2048);
        assert!(data[..RECORD_SIZE].iter().all(|&b| b == 0));
        assert!(data[RECORD_SIZE..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let mut tape = build_tape();
        tape[100] ^= 0x01;
        assert!(DumpReader::new(tape.as_slice()).is_err());
    }
}
