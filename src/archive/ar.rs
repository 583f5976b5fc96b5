//! Unix `ar` archives.
//!
//! Fixed 60-byte ASCII headers after the `!<arch>\n` magic. The 16-byte
//! name cell spills long names either the BSD way (`#1/N`, name leads the
//! payload) or the GNU way (a `//` string table addressed as `/offset`).
//! Odd payloads pad with one `\n`.

use std::io::{Read, Write};

use crate::archive::{ArchiveEntry, EntryReader, EntryWriter, ReaderState, skip_fully};
use crate::fields::{format_decimal, format_octal_digits, parse_decimal, parse_octal};
use crate::{Error, Result};

pub(crate) const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const NAME_LEN: usize = 16;
const TRAILER: &[u8; 2] = b"`\n";

/// One `ar` member.
#[derive(Debug, Clone, Default)]
pub struct ArEntry {
    /// Member name.
    pub name: String,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    /// Owner id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
    /// Payload size.
    pub size: u64,
}

impl ArEntry {
    /// Creates a member entry.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o644,
            ..Default::default()
        }
    }
}

impl ArchiveEntry for ArEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn is_directory(&self) -> bool {
        false
    }

    fn last_modified(&self) -> i64 {
        self.mtime
    }
}

/// Streaming `ar` reader.
pub struct ArReader<R: Read> {
    inner: R,
    state: ReaderState,
    started: bool,
    gnu_name_table: Vec<u8>,
    remaining: u64,
    padding: u64,
}

impl<R: Read> ArReader<R> {
    /// Creates a reader; the magic is checked on the first advance.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReaderState::Init,
            started: false,
            gnu_name_table: Vec::new(),
            remaining: 0,
            padding: 0,
        }
    }

    fn advance(&mut self) -> Result<Option<ArEntry>> {
        if !self.started {
            let mut magic = [0u8; 8];
            self.inner.read_exact(&mut magic)?;
            if &magic != AR_MAGIC {
                return Err(Error::invalid_at(0, "bad ar magic"));
            }
            self.started = true;
        }
        skip_fully(&mut self.inner, self.remaining + self.padding)?;
        self.remaining = 0;
        self.padding = 0;

        loop {
            let mut header = [0u8; HEADER_LEN];
            let mut filled = 0;
            while filled < HEADER_LEN {
                let n = self.inner.read(&mut header[filled..])?;
                if n == 0 {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(Error::Truncated);
                }
                filled += n;
            }
            if &header[58..60] != TRAILER {
                return Err(Error::invalid("ar header missing its terminator"));
            }

            let raw_name = &header[..NAME_LEN];
            let mtime = parse_decimal(&header[16..28], 16, "mtime")? as i64;
            let uid = parse_decimal(&header[28..34], 28, "uid")? as u32;
            let gid = parse_decimal(&header[34..40], 34, "gid")? as u32;
            let mode = parse_octal(&header[40..48], 40, "mode")? as u32;
            let mut size = parse_decimal(&header[48..58], 48, "size")?;

            let trimmed = trim_name(raw_name);

            // GNU string table: stash it and move on to the next member.
            if trimmed == "//" {
                let mut table = vec![0u8; size as usize];
                self.inner.read_exact(&mut table)?;
                if size % 2 == 1 {
                    skip_fully(&mut self.inner, 1)?;
                }
                self.gnu_name_table = table;
                continue;
            }

            let name = if let Some(rest) = trimmed.strip_prefix("#1/") {
                // BSD: the real name leads the payload.
                let name_len: u64 = rest
                    .parse()
                    .map_err(|_| Error::field(0, "bsd name length"))?;
                if name_len > size {
                    return Err(Error::invalid("bsd ar name longer than member"));
                }
                let mut name_bytes = vec![0u8; name_len as usize];
                self.inner.read_exact(&mut name_bytes)?;
                size -= name_len;
                let end = name_bytes
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(name_bytes.len());
                String::from_utf8_lossy(&name_bytes[..end]).into_owned()
            } else if let Some(offset) = trimmed.strip_prefix('/').and_then(|o| {
                // "/" alone is the symbol table; digits are a table offset.
                o.parse::<usize>().ok()
            }) {
                self.gnu_table_lookup(offset)?
            } else if trimmed == "/" {
                // The GNU symbol table is surfaced as a regular member.
                trimmed.clone()
            } else {
                // GNU terminates plain names with '/'.
                trimmed.strip_suffix('/').unwrap_or(&trimmed).to_string()
            };

            self.remaining = size;
            self.padding = size % 2;
            return Ok(Some(ArEntry {
                name,
                mtime,
                uid,
                gid,
                mode,
                size,
            }));
        }
    }

    fn gnu_table_lookup(&self, offset: usize) -> Result<String> {
        let table = &self.gnu_name_table;
        if offset >= table.len() {
            return Err(Error::invalid("gnu ar name offset outside the table"));
        }
        let rest = &table[offset..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        let name = name.strip_suffix(b"/").unwrap_or(name);
        Ok(String::from_utf8_lossy(name).into_owned())
    }
}

fn trim_name(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl<R: Read> EntryReader for ArReader<R> {
    type Entry = ArEntry;

    fn next_entry(&mut self) -> Result<Option<ArEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("ar reader already failed"));
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

impl<R: Read> Read for ArReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() || self.remaining == 0 {
            return Ok(0);
        }
        let take = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..take])?;
        if n == 0 {
            self.state = ReaderState::Failed;
            return Err(Error::Truncated.into_io());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Long-name strategy for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArLongFileMode {
    /// Refuse names over 16 bytes.
    #[default]
    Error,
    /// BSD `#1/N` names carried in the payload.
    Bsd,
    /// GNU `//` string table. The archive is buffered until `finish` so the
    /// table can precede the members that reference it.
    Gnu,
}

/// Streaming `ar` writer.
pub struct ArWriter<W: Write> {
    inner: W,
    mode: ArLongFileMode,
    started: bool,
    finished: bool,
    current_remaining: u64,
    current_pad: bool,
    in_entry: bool,
    /// GNU mode buffers members and the name table until finish.
    gnu_members: Vec<u8>,
    gnu_table: Vec<u8>,
}

impl<W: Write> ArWriter<W> {
    /// Creates a writer refusing long names.
    pub fn new(inner: W) -> Self {
        Self::with_mode(inner, ArLongFileMode::Error)
    }

    /// Creates a writer with the given long-name strategy.
    pub fn with_mode(inner: W, mode: ArLongFileMode) -> Self {
        Self {
            inner,
            mode,
            started: false,
            finished: false,
            current_remaining: 0,
            current_pad: false,
            in_entry: false,
            gnu_members: Vec::new(),
            gnu_table: Vec::new(),
        }
    }

    /// Finishes (if needed) and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        if !self.finished {
            self.finish()?;
        }
        Ok(self.inner)
    }

    fn build_header(name_cell: &[u8], entry: &ArEntry, size: u64) -> Result<[u8; HEADER_LEN]> {
        let mut header = [b' '; HEADER_LEN];
        header[..name_cell.len()].copy_from_slice(name_cell);
        format_decimal(entry.mtime.max(0) as u64, &mut header[16..28], "mtime")?;
        format_decimal(entry.uid as u64, &mut header[28..34], "uid")?;
        format_decimal(entry.gid as u64, &mut header[34..40], "gid")?;
        let mut mode_cell = [b'0'; 8];
        format_octal_digits(entry.mode as u64 & 0o7777777, &mut mode_cell[..7], "mode")?;
        // Left-justify the octal digits the way ar(1) does.
        let digits: Vec<u8> = mode_cell[..7]
            .iter()
            .copied()
            .skip_while(|&b| b == b'0')
            .collect();
        let digits = if digits.is_empty() { vec![b'0'] } else { digits };
        header[40..40 + digits.len()].copy_from_slice(&digits);
        header[40 + digits.len()..48].fill(b' ');
        format_decimal(size, &mut header[48..58], "size")?;
        header[58..60].copy_from_slice(TRAILER);
        Ok(header)
    }
}

impl<W: Write> EntryWriter for ArWriter<W> {
    type Entry = ArEntry;

    fn put_entry(&mut self, entry: &ArEntry) -> Result<()> {
        if self.finished {
            return Err(Error::invalid("ar writer already finished"));
        }
        if self.in_entry {
            return Err(Error::invalid("previous ar entry not closed"));
        }
        if !self.started && self.mode != ArLongFileMode::Gnu {
            self.inner.write_all(AR_MAGIC).map_err(Error::io)?;
        }
        self.started = true;

        let name = entry.name.as_bytes();
        match self.mode {
            ArLongFileMode::Error => {
                if name.len() > NAME_LEN {
                    return Err(Error::TooLong { field: "ar name" });
                }
                let header = Self::build_header(name, entry, entry.size)?;
                self.inner.write_all(&header).map_err(Error::io)?;
                self.current_remaining = entry.size;
            }
            ArLongFileMode::Bsd => {
                if name.len() > NAME_LEN || name.contains(&b' ') {
                    let cell = format!("#1/{}", name.len());
                    let header =
                        Self::build_header(cell.as_bytes(), entry, entry.size + name.len() as u64)?;
                    self.inner.write_all(&header).map_err(Error::io)?;
                    self.inner.write_all(name).map_err(Error::io)?;
                    self.current_pad = (entry.size + name.len() as u64) % 2 == 1;
                    self.current_remaining = entry.size;
                    self.in_entry = true;
                    return Ok(());
                }
                let header = Self::build_header(name, entry, entry.size)?;
                self.inner.write_all(&header).map_err(Error::io)?;
                self.current_remaining = entry.size;
            }
            ArLongFileMode::Gnu => {
                // Short names carry the GNU '/' terminator in the cell; long
                // ones go through the string table.
                let cell = if name.len() + 1 <= NAME_LEN {
                    let mut cell = name.to_vec();
                    cell.push(b'/');
                    cell
                } else {
                    let offset = self.gnu_table.len();
                    self.gnu_table.extend_from_slice(name);
                    self.gnu_table.extend_from_slice(b"/\n");
                    format!("/{offset}").into_bytes()
                };
                let header = Self::build_header(&cell, entry, entry.size)?;
                self.gnu_members.extend_from_slice(&header);
                self.current_remaining = entry.size;
            }
        }
        self.current_pad = entry.size % 2 == 1;
        self.in_entry = true;
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        if !self.in_entry {
            return Err(Error::invalid("no ar entry to close"));
        }
        if self.current_remaining != 0 {
            return Err(Error::invalid("ar entry payload incomplete"));
        }
        if self.current_pad {
            match self.mode {
                ArLongFileMode::Gnu => self.gnu_members.push(b'\n'),
                _ => self.inner.write_all(b"\n").map_err(Error::io)?,
            }
            self.current_pad = false;
        }
        self.in_entry = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.in_entry {
            return Err(Error::invalid("ar entry still open at finish"));
        }
        if self.mode == ArLongFileMode::Gnu {
            self.inner.write_all(AR_MAGIC).map_err(Error::io)?;
            if !self.gnu_table.is_empty() {
                let table_entry = ArEntry::new("", self.gnu_table.len() as u64);
                let mut header =
                    Self::build_header(b"//", &table_entry, self.gnu_table.len() as u64)?;
                // The string table carries blank metadata cells.
                header[16..58].fill(b' ');
                format_decimal(self.gnu_table.len() as u64, &mut header[48..58], "size")?;
                self.inner.write_all(&header).map_err(Error::io)?;
                self.inner.write_all(&self.gnu_table).map_err(Error::io)?;
                if self.gnu_table.len() % 2 == 1 {
                    self.inner.write_all(b"\n").map_err(Error::io)?;
                }
            }
            self.inner
                .write_all(&std::mem::take(&mut self.gnu_members))
                .map_err(Error::io)?;
        } else if !self.started {
            self.inner.write_all(AR_MAGIC).map_err(Error::io)?;
        }
        self.inner.flush().map_err(Error::io)?;
        self.finished = true;
        Ok(())
    }
}

impl<W: Write> Write for ArWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.in_entry {
            return Err(Error::invalid("no open ar entry").into_io());
        }
        if buf.len() as u64 > self.current_remaining {
            return Err(Error::invalid("payload exceeds declared ar size").into_io());
        }
        match self.mode {
            ArLongFileMode::Gnu => self.gnu_members.extend_from_slice(buf),
            _ => self.inner.write_all(buf)?,
        }
        self.current_remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
