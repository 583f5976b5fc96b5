//! Streaming CPIO writer.

use std::io::Write;

use super::{
    CpioEntry, CpioFormat, MAGIC_BINARY, MAGIC_NEW, MAGIC_NEW_CRC, MAGIC_ODC, TRAILER_NAME,
    simple_checksum,
};
use crate::archive::EntryWriter;
use crate::encoding::EntryEncoding;
use crate::{Error, Result};

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct CpioWriterOptions {
    /// The dialect to emit.
    pub format: CpioFormat,
    /// The archive is zero-padded to a multiple of this at finish.
    pub block_size: u32,
    /// Name encoding.
    pub encoding: EntryEncoding,
}

impl Default for CpioWriterOptions {
    fn default() -> Self {
        Self {
            format: CpioFormat::New,
            block_size: 512,
            encoding: EntryEncoding::UTF_8,
        }
    }
}

/// Writes a CPIO archive in one dialect.
pub struct CpioWriter<W: Write> {
    inner: W,
    options: CpioWriterOptions,
    position: u64,
    /// Pending entry; NewCrc buffers the payload to compute the checksum
    /// before the header goes out.
    current: Option<Open>,
    finished: bool,
}

struct Open {
    entry: CpioEntry,
    remaining: u64,
    /// NewCrc only: payload held back until close.
    buffered: Option<Vec<u8>>,
}

impl<W: Write> CpioWriter<W> {
    /// Creates a `newc` writer.
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, CpioWriterOptions::default())
    }

    /// Creates a writer with explicit options.
    pub fn with_options(inner: W, options: CpioWriterOptions) -> Self {
        Self {
            inner,
            options,
            position: 0,
            current: None,
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

    fn out(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).map_err(Error::io)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn pad_to(&mut self, align: u64) -> Result<()> {
        let pad = (align - self.position % align) % align;
        self.out(&vec![0u8; pad as usize])
    }

    fn write_header(&mut self, entry: &CpioEntry, checksum: u32) -> Result<()> {
        let name_bytes = self.options.encoding.encode(&entry.name)?.into_owned();
        match self.options.format {
            CpioFormat::OldAscii => {
                let mut header = Vec::with_capacity(76 + name_bytes.len() + 1);
                header.extend_from_slice(MAGIC_ODC);
                octal6(&mut header, entry.dev_major)?;
                octal6(&mut header, entry.inode)?;
                octal6(&mut header, entry.mode as u64)?;
                octal6(&mut header, entry.uid)?;
                octal6(&mut header, entry.gid)?;
                octal6(&mut header, entry.nlink)?;
                octal6(&mut header, entry.rdev_major)?;
                octal11(&mut header, entry.mtime.max(0) as u64)?;
                octal6(&mut header, name_bytes.len() as u64 + 1)?;
                octal11(&mut header, entry.size)?;
                header.extend_from_slice(&name_bytes);
                header.push(0);
                self.out(&header)
            }
            CpioFormat::New | CpioFormat::NewCrc => {
                let magic = if self.options.format == CpioFormat::NewCrc {
                    MAGIC_NEW_CRC
                } else {
                    MAGIC_NEW
                };
                let mut header = Vec::with_capacity(110 + name_bytes.len() + 4);
                header.extend_from_slice(magic);
                for value in [
                    entry.inode,
                    entry.mode as u64,
                    entry.uid,
                    entry.gid,
                    entry.nlink,
                    entry.mtime.max(0) as u64,
                    entry.size,
                    entry.dev_major,
                    entry.dev_minor,
                    entry.rdev_major,
                    entry.rdev_minor,
                    name_bytes.len() as u64 + 1,
                    checksum as u64,
                ] {
                    hex8(&mut header, value)?;
                }
                header.extend_from_slice(&name_bytes);
                header.push(0);
                // Pad header+name to a 4-byte boundary.
                while (self.position + header.len() as u64) % 4 != 0 {
                    header.push(0);
                }
                self.out(&header)
            }
            CpioFormat::OldBinary => {
                let mut header = Vec::with_capacity(26 + name_bytes.len() + 2);
                for value in [
                    MAGIC_BINARY as u64,
                    entry.dev_major,
                    entry.inode,
                    entry.mode as u64,
                    entry.uid,
                    entry.gid,
                    entry.nlink,
                    entry.rdev_major,
                ] {
                    u16le(&mut header, value)?;
                }
                let mtime = entry.mtime.max(0) as u64;
                u16le(&mut header, mtime >> 16)?;
                u16le(&mut header, mtime & 0xFFFF)?;
                u16le(&mut header, name_bytes.len() as u64 + 1)?;
                u16le(&mut header, entry.size >> 16)?;
                u16le(&mut header, entry.size & 0xFFFF)?;
                header.extend_from_slice(&name_bytes);
                header.push(0);
                if (name_bytes.len() + 1) % 2 == 1 {
                    header.push(0);
                }
                self.out(&header)
            }
        }
    }

    fn data_padding(&self) -> u64 {
        match self.options.format {
            CpioFormat::New | CpioFormat::NewCrc => (4 - self.position % 4) % 4,
            CpioFormat::OldBinary => self.position % 2,
            CpioFormat::OldAscii => 0,
        }
    }
}

fn octal6(out: &mut Vec<u8>, value: u64) -> Result<()> {
    octal_cell(out, value, 6)
}

fn octal11(out: &mut Vec<u8>, value: u64) -> Result<()> {
    octal_cell(out, value, 11)
}

fn octal_cell(out: &mut Vec<u8>, value: u64, width: usize) -> Result<()> {
    let text = format!("{value:0width$o}");
    if text.len() > width {
        return Err(Error::TooLong {
            field: "cpio octal field",
        });
    }
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

fn hex8(out: &mut Vec<u8>, value: u64) -> Result<()> {
    if value > u32::MAX as u64 {
        return Err(Error::TooLong {
            field: "cpio hex field",
        });
    }
    out.extend_from_slice(format!("{value:08x}").as_bytes());
    Ok(())
}

fn u16le(out: &mut Vec<u8>, value: u64) -> Result<()> {
    if value > u16::MAX as u64 {
        return Err(Error::TooLong {
            field: "cpio binary field",
        });
    }
    out.extend_from_slice(&(value as u16).to_le_bytes());
    Ok(())
}

impl<W: Write> EntryWriter for CpioWriter<W> {
    type Entry = CpioEntry;

    fn put_entry(&mut self, entry: &CpioEntry) -> Result<()> {
        if self.finished {
            return Err(Error::invalid("cpio writer already finished"));
        }
        if self.current.is_some() {
            return Err(Error::invalid("previous cpio entry not closed"));
        }
        if entry.name == TRAILER_NAME {
            return Err(Error::invalid("the cpio trailer name is reserved"));
        }

        let buffered = if self.options.format == CpioFormat::NewCrc {
            // Header needs the payload checksum, so hold the data back.
            Some(Vec::with_capacity(entry.size as usize))
        } else {
            self.write_header(entry, 0)?;
            None
        };

        self.current = Some(Open {
            entry: entry.clone(),
            remaining: entry.size,
            buffered,
        });
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Err(Error::invalid("no cpio entry to close"));
        };
        if open.remaining != 0 {
            return Err(Error::invalid("cpio entry payload incomplete"));
        }
        if let Some(buffered) = open.buffered {
            let checksum = simple_checksum(&buffered);
            self.write_header(&open.entry, checksum)?;
            self.out(&buffered)?;
        }
        let pad = self.data_padding();
        self.out(&vec![0u8; pad as usize])?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.current.is_some() {
            return Err(Error::invalid("cpio entry still open at finish"));
        }
        let mut trailer = CpioEntry::new_file(TRAILER_NAME, 0);
        trailer.mode = 0;
        trailer.nlink = 1;
        // Bypass the reserved-name guard via the header writer directly.
        self.write_header(&trailer, 0)?;
        let pad = self.data_padding();
        self.out(&vec![0u8; pad as usize])?;
        if self.options.block_size > 1 {
            self.pad_to(self.options.block_size as u64)?;
        }
        self.inner.flush().map_err(Error::io)?;
        self.finished = true;
        Ok(())
    }
}

impl<W: Write> Write for CpioWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(open) = self.current.as_mut() else {
            return Err(Error::invalid("no open cpio entry").into_io());
        };
        if buf.len() as u64 > open.remaining {
            return Err(Error::invalid("payload exceeds declared cpio size").into_io());
        }
        open.remaining -= buf.len() as u64;
        match &mut open.buffered {
            Some(buffer) => {
                buffer.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => {
                self.inner.write_all(buf)?;
                self.position += buf.len() as u64;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
