//! Streaming TAR writer.

use std::collections::BTreeMap;
use std::io::Write;

use super::entry::{TarEntry, TypeFlag};
use super::{GNU_LONG_NAME_ENTRY, GNU_MAGIC, MAGIC_OFFSET, POSIX_MAGIC, RECORD_SIZE, header, padding_for, pax};
use crate::archive::EntryWriter;
use crate::encoding::EntryEncoding;
use crate::fields::{format_binary, format_octal, format_octal_digits};
use crate::{Error, Result};

/// What to do with a name that does not fit the 100-byte cell (after the
/// ustar prefix split has been tried).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LongFileMode {
    /// Refuse with [`Error::TooLong`].
    #[default]
    Error,
    /// Silently truncate to 100 bytes.
    Truncate,
    /// Emit a GNU `L`/`K` carrier entry before the real one.
    GnuLongName,
    /// Record the full name in a pax extended header.
    Pax,
}

/// What to do with a number that does not fit its octal cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BigNumberMode {
    /// Refuse with [`Error::TooLong`].
    #[default]
    Error,
    /// Use the GNU/star base-256 binary representation.
    Star,
    /// Record the value in a pax extended header.
    Posix,
}

/// Writer configuration.
#[derive(Debug, Clone, Default)]
pub struct TarWriterOptions {
    /// Over-long name handling.
    pub long_file_mode: LongFileMode,
    /// Out-of-range number handling.
    pub big_number_mode: BigNumberMode,
    /// Name encoding.
    pub encoding: EntryEncoding,
}

const MAX_NAME: usize = 100;
const MAX_PREFIX: usize = 155;
const MAX_OCTAL_SIZE: u64 = 0o77777777777; // 11 octal digits, 8 GiB − 1
const MAX_OCTAL_ID: u64 = 0o7777777;
const MAX_OCTAL_TIME: i64 = 0o77777777777;

/// Writes TAR entries to a forward-only byte sink.
pub struct TarWriter<W: Write> {
    inner: W,
    options: TarWriterOptions,
    current_remaining: u64,
    current_padding: u64,
    in_entry: bool,
    finished: bool,
}

impl<W: Write> TarWriter<W> {
    /// Creates a writer with default options.
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, TarWriterOptions::default())
    }

    /// Creates a writer with explicit options.
    pub fn with_options(inner: W, options: TarWriterOptions) -> Self {
        Self {
            inner,
            options,
            current_remaining: 0,
            current_padding: 0,
            in_entry: false,
            finished: false,
        }
    }

    /// Finishes (if needed) and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        if !self.finished {
            self.finish()?;
        }
        Ok(self.inner)
    }

    fn write_record(&mut self, block: &[u8; RECORD_SIZE]) -> Result<()> {
        self.inner.write_all(block).map_err(Error::io)
    }

    /// Emits a GNU `L`/`K` carrier holding `payload` (NUL-terminated).
    fn write_gnu_carrier(&mut self, type_flag: TypeFlag, payload: &[u8]) -> Result<()> {
        let mut carrier = TarEntry::new_file(GNU_LONG_NAME_ENTRY, payload.len() as u64 + 1);
        carrier.type_flag = type_flag;
        let block = self.build_header(&carrier, payload.len() as u64 + 1, true)?;
        self.write_record(&block)?;
        self.inner.write_all(payload).map_err(Error::io)?;
        self.inner.write_all(&[0]).map_err(Error::io)?;
        let padding = padding_for(payload.len() as u64 + 1);
        self.inner
            .write_all(&vec![0u8; padding as usize])
            .map_err(Error::io)?;
        Ok(())
    }

    fn write_pax_entry(&mut self, name: &str, records: &BTreeMap<String, String>) -> Result<()> {
        let payload = pax::serialize(records);
        let short: String = format!("./PaxHeaders.0/{name}")
            .chars()
            .take(MAX_NAME)
            .collect();
        let mut carrier = TarEntry::new_file(short, payload.len() as u64);
        carrier.type_flag = TypeFlag::PaxLocal;
        let block = self.build_header(&carrier, payload.len() as u64, true)?;
        self.write_record(&block)?;
        self.inner.write_all(&payload).map_err(Error::io)?;
        let padding = padding_for(payload.len() as u64);
        self.inner
            .write_all(&vec![0u8; padding as usize])
            .map_err(Error::io)?;
        Ok(())
    }

    /// Serialises a header record. `meta` entries (pax and GNU carriers)
    /// bypass the long-name machinery.
    fn build_header(
        &self,
        entry: &TarEntry,
        size: u64,
        meta: bool,
    ) -> Result<[u8; RECORD_SIZE]> {
        let mut block = [0u8; RECORD_SIZE];

        let name_bytes = self.options.encoding.encode(&entry.name)?;
        let (name_cell, prefix_cell) = if name_bytes.len() <= MAX_NAME {
            (name_bytes.to_vec(), Vec::new())
        } else if !meta {
            match split_prefix(&name_bytes) {
                Some((prefix, rest)) => (rest.to_vec(), prefix.to_vec()),
                None if self.options.long_file_mode == LongFileMode::Truncate => {
                    (name_bytes[..MAX_NAME].to_vec(), Vec::new())
                }
                None => return Err(Error::TooLong { field: "tar name" }),
            }
        } else {
            (name_bytes[..MAX_NAME].to_vec(), Vec::new())
        };
        block[..name_cell.len()].copy_from_slice(&name_cell);
        block[header::PREFIX.0..header::PREFIX.0 + prefix_cell.len()]
            .copy_from_slice(&prefix_cell);

        format_octal(entry.mode as u64, &mut block[100..108], "mode")?;
        self.number_field(entry.uid, &mut block[108..116], MAX_OCTAL_ID, "uid")?;
        self.number_field(entry.gid, &mut block[116..124], MAX_OCTAL_ID, "gid")?;
        self.number_field(size, &mut block[124..136], MAX_OCTAL_SIZE, "size")?;
        if entry.mtime < 0 {
            return Err(Error::TooLong { field: "mtime" });
        }
        self.number_field(
            entry.mtime as u64,
            &mut block[136..148],
            MAX_OCTAL_TIME as u64,
            "mtime",
        )?;

        block[header::TYPEFLAG] = entry.type_flag.to_byte();

        let link_bytes = self.options.encoding.encode(&entry.link_name)?;
        if link_bytes.len() > MAX_NAME && !meta {
            return Err(Error::TooLong { field: "tar link name" });
        }
        let link_len = link_bytes.len().min(MAX_NAME);
        block[header::LINKNAME.0..header::LINKNAME.0 + link_len]
            .copy_from_slice(&link_bytes[..link_len]);

        let magic = if matches!(
            entry.type_flag,
            TypeFlag::GnuLongName | TypeFlag::GnuLongLink | TypeFlag::GnuSparse
        ) {
            GNU_MAGIC
        } else {
            POSIX_MAGIC
        };
        block[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(magic);

        let uname = self.options.encoding.encode(&entry.uname)?;
        let take = uname.len().min(31);
        block[header::UNAME.0..header::UNAME.0 + take].copy_from_slice(&uname[..take]);
        let gname = self.options.encoding.encode(&entry.gname)?;
        let take = gname.len().min(31);
        block[header::GNAME.0..header::GNAME.0 + take].copy_from_slice(&gname[..take]);

        if matches!(
            entry.type_flag,
            TypeFlag::CharDevice | TypeFlag::BlockDevice
        ) {
            format_octal(entry.dev_major as u64, &mut block[329..337], "devmajor")?;
            format_octal(entry.dev_minor as u64, &mut block[337..345], "devminor")?;
        }

        let (sum, _) = header::checksums(&block);
        format_octal_digits(sum, &mut block[148..154], "chksum")?;
        block[154] = 0;
        block[155] = b' ';
        Ok(block)
    }

    fn number_field(
        &self,
        value: u64,
        cell: &mut [u8],
        max: u64,
        field: &'static str,
    ) -> Result<()> {
        if value <= max {
            return format_octal(value, cell, field);
        }
        match self.options.big_number_mode {
            BigNumberMode::Star => {
                format_binary(value, cell);
                Ok(())
            }
            // Posix promotion is resolved in put_entry; reaching this cell
            // with an oversized value means the mode forbids promotion.
            _ => Err(Error::TooLong { field }),
        }
    }
}

fn split_prefix(name: &[u8]) -> Option<(&[u8], &[u8])> {
    if name.len() > MAX_NAME + MAX_PREFIX + 1 {
        return None;
    }
    // Split at a slash so that prefix ≤ 155 and rest ≤ 100.
    for i in (0..name.len().min(MAX_PREFIX + 1)).rev() {
        if name[i] == b'/' {
            let rest = &name[i + 1..];
            if !rest.is_empty() && rest.len() <= MAX_NAME && i <= MAX_PREFIX {
                return Some((&name[..i], rest));
            }
        }
    }
    None
}

impl<W: Write> EntryWriter for TarWriter<W> {
    type Entry = TarEntry;

    fn put_entry(&mut self, entry: &TarEntry) -> Result<()> {
        if self.finished {
            return Err(Error::invalid("tar writer already finished"));
        }
        if self.in_entry {
            return Err(Error::invalid("previous tar entry not closed"));
        }

        let mut pax_records: BTreeMap<String, String> = BTreeMap::new();
        let mut effective = entry.clone();

        let name_bytes = self.options.encoding.encode(&entry.name)?;
        let name_fits = name_bytes.len() <= MAX_NAME || split_prefix(&name_bytes).is_some();
        if !name_fits || !entry.name.is_ascii() {
            match self.options.long_file_mode {
                LongFileMode::Pax => {
                    pax_records.insert("path".into(), entry.name.clone());
                    effective.name = truncate_ascii(&entry.name, MAX_NAME);
                }
                LongFileMode::GnuLongName if !name_fits => {
                    self.write_gnu_carrier(TypeFlag::GnuLongName, &name_bytes)?;
                    effective.name = truncate_ascii(&entry.name, MAX_NAME);
                }
                LongFileMode::Truncate if !name_fits => {
                    effective.name = truncate_ascii(&entry.name, MAX_NAME);
                }
                LongFileMode::Error if !name_fits => {
                    return Err(Error::TooLong { field: "tar name" });
                }
                _ => {}
            }
        }

        let link_bytes = self.options.encoding.encode(&entry.link_name)?;
        if link_bytes.len() > MAX_NAME {
            match self.options.long_file_mode {
                LongFileMode::Pax => {
                    pax_records.insert("linkpath".into(), entry.link_name.clone());
                    effective.link_name = truncate_ascii(&entry.link_name, MAX_NAME);
                }
                LongFileMode::GnuLongName => {
                    self.write_gnu_carrier(TypeFlag::GnuLongLink, &link_bytes)?;
                    effective.link_name = truncate_ascii(&entry.link_name, MAX_NAME);
                }
                LongFileMode::Truncate => {
                    effective.link_name = truncate_ascii(&entry.link_name, MAX_NAME);
                }
                LongFileMode::Error => {
                    return Err(Error::TooLong { field: "tar link name" });
                }
            }
        }

        if self.options.big_number_mode == BigNumberMode::Posix {
            if entry.size > MAX_OCTAL_SIZE {
                pax_records.insert("size".into(), entry.size.to_string());
                effective.size = 0;
            }
            if entry.uid > MAX_OCTAL_ID {
                pax_records.insert("uid".into(), entry.uid.to_string());
                effective.uid = 0;
            }
            if entry.gid > MAX_OCTAL_ID {
                pax_records.insert("gid".into(), entry.gid.to_string());
                effective.gid = 0;
            }
            if entry.mtime > MAX_OCTAL_TIME || entry.mtime < 0 {
                pax_records.insert("mtime".into(), entry.mtime.to_string());
                effective.mtime = 0;
            }
        }

        if !pax_records.is_empty() {
            self.write_pax_entry(&effective.name, &pax_records)?;
        }

        // The payload length on disk is always the real size; the header
        // cell may hold zero when a pax record carries the number instead.
        let stored_size = if effective.is_dataless() { 0 } else { entry.size };
        let header_size_field = if effective.is_dataless() { 0 } else { effective.size };
        let block = self.build_header(&effective, header_size_field, false)?;
        self.write_record(&block)?;

        self.current_remaining = stored_size;
        self.current_padding = padding_for(stored_size);
        self.in_entry = true;
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        if !self.in_entry {
            return Err(Error::invalid("no tar entry to close"));
        }
        if self.current_remaining != 0 {
            return Err(Error::invalid(format!(
                "tar entry payload short by {} bytes",
                self.current_remaining
            )));
        }
        self.inner
            .write_all(&vec![0u8; self.current_padding as usize])
            .map_err(Error::io)?;
        self.current_padding = 0;
        self.in_entry = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.in_entry {
            return Err(Error::invalid("tar entry still open at finish"));
        }
        // Two zero records terminate the archive.
        self.inner
            .write_all(&[0u8; RECORD_SIZE * 2])
            .map_err(Error::io)?;
        self.inner.flush().map_err(Error::io)?;
        self.finished = true;
        Ok(())
    }
}

impl TarEntry {
    fn is_dataless(&self) -> bool {
        use crate::archive::ArchiveEntry;
        self.is_directory()
            || matches!(
                self.type_flag,
                TypeFlag::HardLink | TypeFlag::SymLink | TypeFlag::Fifo
            )
    }
}

/// Truncates to at most `max` encoded bytes without splitting a character.
fn truncate_ascii(name: &str, max: usize) -> String {
    let mut bytes = 0;
    name.chars()
        .take_while(|c| {
            bytes += c.len_utf8();
            bytes <= max
        })
        .collect()
}

impl<W: Write> Write for TarWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.in_entry {
            return Err(Error::invalid("no open tar entry").into_io());
        }
        if buf.len() as u64 > self.current_remaining {
            return Err(Error::invalid("payload exceeds declared tar entry size").into_io());
        }
        self.inner.write_all(buf)?;
        self.current_remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
