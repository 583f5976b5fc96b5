//! Streaming CPIO reader with per-entry dialect detection.

use std::io::Read;

use super::{
    CpioEntry, CpioFormat, MAGIC_BINARY, MAGIC_NEW, MAGIC_NEW_CRC, MAGIC_ODC, TRAILER_NAME,
    simple_checksum,
};
use crate::archive::{ArchiveEntry, EntryReader, ReaderState, skip_fully};
use crate::encoding::EntryEncoding;
use crate::fields::parse_octal;
use crate::{Error, Result};

/// Reads CPIO entries, detecting the dialect from each entry's magic.
pub struct CpioReader<R: Read> {
    inner: R,
    encoding: EntryEncoding,
    state: ReaderState,
    remaining: u64,
    data_padding: u64,
    /// Running byte sum for NewCrc verification.
    check: u32,
    expected_check: Option<u32>,
    position: u64,
}

impl<R: Read> CpioReader<R> {
    /// Creates a reader decoding names as UTF-8.
    pub fn new(inner: R) -> Self {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Creates a reader with an explicit name encoding.
    pub fn with_encoding(inner: R, encoding: EntryEncoding) -> Self {
        Self {
            inner,
            encoding,
            state: ReaderState::Init,
            remaining: 0,
            data_padding: 0,
            check: 0,
            expected_check: None,
            position: 0,
        }
    }

    fn read_exact_counted(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        skip_fully(&mut self.inner, count)?;
        self.position += count;
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<CpioEntry>> {
        // Drop any unread payload, verify a pending checksum lazily only
        // when the payload was fully streamed.
        self.skip(self.remaining + self.data_padding)?;
        self.remaining = 0;
        self.data_padding = 0;
        self.expected_check = None;
        self.check = 0;

        let mut magic = [0u8; 6];
        self.read_exact_counted(&mut magic)?;

        let entry = if &magic == MAGIC_ODC {
            self.read_odc_entry()?
        } else if &magic == MAGIC_NEW || &magic == MAGIC_NEW_CRC {
            self.read_new_entry(&magic == MAGIC_NEW_CRC)?
        } else {
            let word = u16::from_le_bytes([magic[0], magic[1]]);
            let swapped = u16::from_be_bytes([magic[0], magic[1]]);
            if word == MAGIC_BINARY {
                self.read_binary_entry(&magic, false)?
            } else if swapped == MAGIC_BINARY {
                self.read_binary_entry(&magic, true)?
            } else {
                return Err(Error::invalid_at(self.position - 6, "bad cpio magic"));
            }
        };

        if entry.name == TRAILER_NAME {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn read_odc_entry(&mut self) -> Result<CpioEntry> {
        let mut fields = [0u8; 70];
        self.read_exact_counted(&mut fields)?;
        let cell = |i: usize, w: usize| &fields[i..i + w];
        let num =
            |this: &Self, i: usize, w: usize, f: &'static str| parse_octal(cell(i, w), this.position - 70 + i as u64, f);

        let dev = num(self, 0, 6, "dev")?;
        let inode = num(self, 6, 6, "ino")?;
        let mode = num(self, 12, 6, "mode")? as u32;
        let uid = num(self, 18, 6, "uid")?;
        let gid = num(self, 24, 6, "gid")?;
        let nlink = num(self, 30, 6, "nlink")?;
        let rdev = num(self, 36, 6, "rdev")?;
        let mtime = num(self, 42, 11, "mtime")? as i64;
        let name_size = num(self, 53, 6, "namesize")?;
        let size = num(self, 59, 11, "filesize")?;

        let name = self.read_name(name_size, 0)?;
        self.remaining = size;
        self.data_padding = 0;
        Ok(CpioEntry {
            name,
            inode,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            size,
            dev_major: dev,
            rdev_major: rdev,
            format: CpioFormat::OldAscii,
            ..Default::default()
        })
    }

    fn read_new_entry(&mut self, with_crc: bool) -> Result<CpioEntry> {
        let mut fields = [0u8; 104];
        self.read_exact_counted(&mut fields)?;
        let hex = |this: &Self, i: usize, f: &'static str| -> Result<u64> {
            let cell = &fields[i..i + 8];
            let text = std::str::from_utf8(cell)
                .map_err(|_| Error::field(this.position - 104 + i as u64, f))?;
            u64::from_str_radix(text, 16)
                .map_err(|_| Error::field(this.position - 104 + i as u64, f))
        };

        let inode = hex(self, 0, "ino")?;
        let mode = hex(self, 8, "mode")? as u32;
        let uid = hex(self, 16, "uid")?;
        let gid = hex(self, 24, "gid")?;
        let nlink = hex(self, 32, "nlink")?;
        let mtime = hex(self, 40, "mtime")? as i64;
        let size = hex(self, 48, "filesize")?;
        let dev_major = hex(self, 56, "devmajor")?;
        let dev_minor = hex(self, 64, "devminor")?;
        let rdev_major = hex(self, 72, "rdevmajor")?;
        let rdev_minor = hex(self, 80, "rdevminor")?;
        let name_size = hex(self, 88, "namesize")?;
        let checksum = hex(self, 96, "check")? as u32;

        // Name padding aligns the header+name to four bytes.
        let header_len = 6 + 104;
        let name_padding = pad4(header_len as u64 + name_size);
        let name = self.read_name(name_size, name_padding)?;

        self.remaining = size;
        self.data_padding = pad4(size);
        self.expected_check = with_crc.then_some(checksum);
        Ok(CpioEntry {
            name,
            inode,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            size,
            dev_major,
            dev_minor,
            rdev_major,
            rdev_minor,
            checksum,
            format: if with_crc {
                CpioFormat::NewCrc
            } else {
                CpioFormat::New
            },
        })
    }

    fn read_binary_entry(&mut self, magic: &[u8; 6], swapped: bool) -> Result<CpioEntry> {
        // The six magic bytes already hold the first three u16 cells.
        let mut rest = [0u8; 20];
        self.read_exact_counted(&mut rest)?;
        let mut cells = [0u16; 13];
        let all: Vec<u8> = magic.iter().chain(rest.iter()).copied().collect();
        for (i, cell) in cells.iter_mut().enumerate() {
            let pair = [all[2 * i], all[2 * i + 1]];
            *cell = if swapped {
                u16::from_be_bytes(pair)
            } else {
                u16::from_le_bytes(pair)
            };
        }

        let dev = cells[1] as u64;
        let inode = cells[2] as u64;
        let mode = cells[3] as u32;
        let uid = cells[4] as u64;
        let gid = cells[5] as u64;
        let nlink = cells[6] as u64;
        let rdev = cells[7] as u64;
        let mtime = (((cells[8] as u64) << 16) | cells[9] as u64) as i64;
        let name_size = cells[10] as u64;
        let size = ((cells[11] as u64) << 16) | cells[12] as u64;

        // Binary names pad to even length.
        let name_padding = (name_size) % 2;
        let name = self.read_name(name_size, name_padding)?;
        self.remaining = size;
        self.data_padding = size % 2;
        Ok(CpioEntry {
            name,
            inode,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            size,
            dev_major: dev,
            rdev_major: rdev,
            format: CpioFormat::OldBinary,
            ..Default::default()
        })
    }

    fn read_name(&mut self, name_size: u64, padding: u64) -> Result<String> {
        if name_size == 0 {
            return Err(Error::invalid("cpio entry with empty name cell"));
        }
        let mut bytes = vec![0u8; name_size as usize];
        self.read_exact_counted(&mut bytes)?;
        self.skip(padding)?;
        // The stored size includes the terminating NUL.
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len());
        Ok(self.encoding.decode(&bytes[..end]))
    }
}

fn pad4(len: u64) -> u64 {
    (4 - len % 4) % 4
}

impl<R: Read> EntryReader for CpioReader<R> {
    type Entry = CpioEntry;

    fn next_entry(&mut self) -> Result<Option<CpioEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("cpio reader already failed"));
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

impl<R: Read> Read for CpioReader<R> {
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
        self.position += n as u64;
        self.remaining -= n as u64;
        if self.expected_check.is_some() {
            self.check = buf[..n]
                .iter()
                .fold(self.check, |sum, &b| sum.wrapping_add(b as u32));
            if self.remaining == 0 {
                let expected = self.expected_check.take().expect("checked above");
                if self.check != expected {
                    self.state = ReaderState::Failed;
                    return Err(Error::invalid("cpio checksum mismatch").into_io());
                }
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::EntryWriter;
    use crate::archive::cpio::{CpioWriter, CpioWriterOptions};
    use std::io::Write;

    fn write_archive(format: CpioFormat) -> Vec<u8> {
        let options = CpioWriterOptions {
            format,
            ..Default::default()
        };
        let mut writer = CpioWriter::with_options(Vec::new(), options);
        writer
            .put_entry(&CpioEntry::new_directory("dir"))
            .unwrap();
        writer.close_entry().unwrap();
        let mut entry = CpioEntry::new_file("dir/data.bin", 11);
        entry.mtime = 1_600_000_000;
        writer.put_entry(&entry).unwrap();
        writer.write_all(b"hello cpio\n").unwrap();
        writer.close_entry().unwrap();
        writer.finish().unwrap();
        writer.into_inner().unwrap()
    }

    fn roundtrip(format: CpioFormat) {
        let bytes = write_archive(format);
        let mut reader = CpioReader::new(bytes.as_slice());

        let dir = reader.next_entry().unwrap().unwrap();
        assert_eq!(dir.name, "dir");
        assert!(dir.is_directory());
        assert_eq!(dir.format, format);

        let file = reader.next_entry().unwrap().unwrap();
        assert_eq!(file.name, "dir/data.bin");
        assert_eq!(file.size, 11);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello cpio\n");

        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn roundtrip_all_formats() {
        for format in [
            CpioFormat::OldBinary,
            CpioFormat::OldAscii,
            CpioFormat::New,
            CpioFormat::NewCrc,
        ] {
            roundtrip(format);
        }
    }

    #[test]
    fn binary_mtime_survives() {
        let bytes = write_archive(CpioFormat::OldBinary);
        let mut reader = CpioReader::new(bytes.as_slice());
        reader.next_entry().unwrap();
        let file = reader.next_entry().unwrap().unwrap();
        assert_eq!(file.mtime, 1_600_000_000);
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut bytes = write_archive(CpioFormat::NewCrc);
        // Flip a payload byte of the file entry (the last data before the
        // trailer); search for the payload text.
        let pos = bytes
            .windows(5)
            .position(|w| w == b"hello")
            .expect("payload present");
        bytes[pos] ^= 0x01;

        let mut reader = CpioReader::new(bytes.as_slice());
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
    }

    #[test]
    fn bad_magic_reported_with_offset() {
        let mut reader = CpioReader::new(&b"999999rubbish..."[..]);
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat {
                offset: Some(0),
                ..
            }
        ));
    }
}
