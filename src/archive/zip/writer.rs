//! ZIP writer over a seekable sink.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use super::entry::{CompressionMethod, ZipEntry};
use super::extra::{ExtraField, UnicodePathExtra, Zip64ExtendedInfo, serialize_extra_block};
use super::reader::needs_zip64;
use super::{
    CENTRAL_HEADER_SIG, EOCD_SIG, LOCAL_HEADER_SIG, U16_MAX, U32_MAX, VERSION_DEFLATE,
    VERSION_ZIP64, ZIP64_EOCD_SIG, ZIP64_LOCATOR_SIG,
};
use crate::archive::EntryWriter;
use crate::codec::CompressionLevel;
use crate::codec::bzip2::BZip2Writer;
use crate::encoding::EntryEncoding;
use crate::error::Zip64Reason;
use crate::{Error, Result};

/// When ZIP64 structures are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Emit ZIP64 records unconditionally.
    Always,
    /// Refuse any archive that would need ZIP64.
    Never,
    /// Emit ZIP64 records only where a limit is crossed; local headers are
    /// patched retroactively, which is why the sink must seek.
    #[default]
    AsNeeded,
}

/// When Unicode-path extra fields are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnicodeExtraPolicy {
    /// Never write them.
    #[default]
    Never,
    /// Write one for every entry.
    Always,
    /// Only when the configured encoding cannot represent the name.
    NotEncodeable,
}

/// Writer configuration.
#[derive(Debug, Clone, Default)]
pub struct ZipWriterOptions {
    /// ZIP64 behaviour.
    pub zip64: Zip64Mode,
    /// Entry-name encoding.
    pub encoding: EntryEncoding,
    /// Fall back to UTF-8 (with the bit-11 flag) when the configured
    /// encoding cannot represent a name.
    pub fallback_to_utf8: bool,
    /// Unicode-path extra policy.
    pub unicode_extra: UnicodeExtraPolicy,
    /// DEFLATE level.
    pub level: CompressionLevel,
}

/// Counts the bytes the compressor pushes to the sink.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum Sink<W: Write> {
    Idle(W),
    Stored(CountingWriter<W>),
    Deflate(flate2::write::DeflateEncoder<CountingWriter<W>>),
    Bzip2(BZip2Writer<CountingWriter<W>>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::Encoder<'static, CountingWriter<W>>),
    /// Placeholder while control is inside a state change.
    Poisoned,
}

struct OpenEntry {
    entry: ZipEntry,
    header_offset: u64,
    name_len: usize,
    zip64_in_local: bool,
    crc: crc32fast::Hasher,
    uncompressed: u64,
}

/// Writes a ZIP archive with a trailing central directory.
pub struct ZipWriter<W: Write + Seek> {
    sink: Sink<W>,
    options: ZipWriterOptions,
    central: Vec<ZipEntry>,
    open: Option<OpenEntry>,
    finished: bool,
    zip64_used: bool,
}

impl<W: Write + Seek> ZipWriter<W> {
    /// Creates a writer with default options.
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, ZipWriterOptions::default())
    }

    /// Creates a writer with explicit options.
    pub fn with_options(inner: W, options: ZipWriterOptions) -> Self {
        Self {
            sink: Sink::Idle(inner),
            options,
            central: Vec::new(),
            open: None,
            finished: false,
            zip64_used: false,
        }
    }

    /// Finishes (if needed) and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        if !self.finished {
            self.finish()?;
        }
        match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Idle(inner) => Ok(inner),
            _ => Err(Error::invalid("zip entry still open")),
        }
    }

    fn inner_mut(&mut self) -> &mut W {
        match &mut self.sink {
            Sink::Idle(inner) => inner,
            _ => unreachable!("inner access while an entry is open"),
        }
    }

    fn encode_name(&self, entry: &ZipEntry) -> Result<(Vec<u8>, bool)> {
        let encoding = self.options.encoding;
        if encoding == EntryEncoding::UTF_8 {
            return Ok((entry.name.as_bytes().to_vec(), true));
        }
        if encoding.can_encode(&entry.name) {
            return Ok((encoding.encode(&entry.name)?.into_owned(), false));
        }
        if self.options.fallback_to_utf8 {
            return Ok((entry.name.as_bytes().to_vec(), true));
        }
        Err(Error::invalid(format!(
            "entry name not representable in {}",
            encoding.name()
        )))
    }
}

impl<W: Write + Seek> EntryWriter for ZipWriter<W> {
    type Entry = ZipEntry;

    fn put_entry(&mut self, entry: &ZipEntry) -> Result<()> {
        if self.finished {
            return Err(Error::invalid("zip writer already finished"));
        }
        if self.open.is_some() {
            return Err(Error::invalid("previous zip entry not closed"));
        }
        if self.options.zip64 == Zip64Mode::Never {
            if let Some(size) = entry.size {
                if needs_zip64(size) {
                    return Err(Error::Zip64Required(Zip64Reason::EntryTooLarge));
                }
            }
        }
        if !matches!(
            entry.method,
            CompressionMethod::Stored | CompressionMethod::Deflate | CompressionMethod::Bzip2
        ) {
            #[cfg(feature = "zstd")]
            let supported = entry.method == CompressionMethod::Zstd;
            #[cfg(not(feature = "zstd"))]
            let supported = false;
            if !supported {
                return Err(Error::unsupported(format!(
                    "zip compression method {}",
                    entry.method.code()
                )));
            }
        }

        let (name_bytes, utf8) = self.encode_name(entry)?;
        let mut working = entry.clone();
        working.general_purpose_bits.set_utf8_names(utf8);
        working.general_purpose_bits.set_data_descriptor(false);

        let want_unicode_extra = match self.options.unicode_extra {
            UnicodeExtraPolicy::Never => false,
            UnicodeExtraPolicy::Always => true,
            UnicodeExtraPolicy::NotEncodeable => {
                !utf8 || !self.options.encoding.can_encode(&entry.name)
            }
        };
        if want_unicode_extra && working.extra_field(super::extra::UNICODE_PATH_TAG).is_none() {
            working.extra_fields.push(ExtraField::UnicodePath(UnicodePathExtra {
                version: 1,
                name_crc32: crc32fast::hash(&name_bytes),
                unicode_name: entry.name.clone(),
            }));
        }

        let zip64_in_local = match self.options.zip64 {
            Zip64Mode::Always => true,
            Zip64Mode::Never => false,
            Zip64Mode::AsNeeded => {
                entry.size.is_none() || entry.size.is_some_and(needs_zip64)
            }
        };

        // Local extra block: the ZIP64 placeholder (patched on close) plus
        // the caller's fields.
        let mut local_fields = Vec::new();
        if zip64_in_local {
            local_fields.push(ExtraField::Zip64(Zip64ExtendedInfo {
                size: Some(0),
                compressed_size: Some(0),
                ..Default::default()
            }));
        }
        local_fields.extend(working.extra_fields.iter().cloned());
        let extra_block = serialize_extra_block(&local_fields);

        let inner = self.inner_mut();
        let header_offset = inner.stream_position().map_err(Error::io)?;

        inner.write_u32::<LittleEndian>(LOCAL_HEADER_SIG)?;
        inner.write_u16::<LittleEndian>(if zip64_in_local {
            VERSION_ZIP64
        } else {
            VERSION_DEFLATE
        })?;
        inner.write_u16::<LittleEndian>(working.general_purpose_bits.0)?;
        inner.write_u16::<LittleEndian>(working.method.code())?;
        inner.write_u32::<LittleEndian>(working.dos_time.0)?;
        inner.write_u32::<LittleEndian>(0)?; // crc, patched on close
        let sentinel = if zip64_in_local { U32_MAX as u32 } else { 0 };
        inner.write_u32::<LittleEndian>(sentinel)?; // compressed size
        inner.write_u32::<LittleEndian>(sentinel)?; // uncompressed size
        inner.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        inner.write_u16::<LittleEndian>(extra_block.len() as u16)?;
        inner.write_all(&name_bytes)?;
        inner.write_all(&extra_block)?;

        working.local_header_offset = header_offset;

        // Swap the sink into the per-entry compressor.
        let level = self.options.level;
        let method = working.method;
        self.sink = match (std::mem::replace(&mut self.sink, Sink::Poisoned), method) {
            (Sink::Idle(inner), CompressionMethod::Stored) => {
                Sink::Stored(CountingWriter::new(inner))
            }
            (Sink::Idle(inner), CompressionMethod::Deflate) => Sink::Deflate(
                flate2::write::DeflateEncoder::new(CountingWriter::new(inner), level.to_flate2()),
            ),
            (Sink::Idle(inner), CompressionMethod::Bzip2) => {
                Sink::Bzip2(BZip2Writer::new(CountingWriter::new(inner), 9)?)
            }
            #[cfg(feature = "zstd")]
            (Sink::Idle(inner), CompressionMethod::Zstd) => Sink::Zstd(
                zstd::Encoder::new(CountingWriter::new(inner), 0).map_err(Error::io)?,
            ),
            _ => unreachable!("method validated before the header was written"),
        };

        self.open = Some(OpenEntry {
            entry: working,
            header_offset,
            name_len: name_bytes.len(),
            zip64_in_local,
            crc: crc32fast::Hasher::new(),
            uncompressed: 0,
        });
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Err(Error::invalid("no zip entry to close"));
        };

        let counting = match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Stored(counting) => counting,
            Sink::Deflate(encoder) => encoder.finish().map_err(Error::io)?,
            Sink::Bzip2(encoder) => encoder.finish().map_err(Error::io)?,
            #[cfg(feature = "zstd")]
            Sink::Zstd(encoder) => encoder.finish().map_err(Error::io)?,
            _ => return Err(Error::invalid("no zip entry open")),
        };
        let compressed = counting.written;
        let mut inner = counting.inner;

        let crc = open.crc.finalize();
        let size = open.uncompressed;

        if self.options.zip64 == Zip64Mode::Never
            && (needs_zip64(size) || needs_zip64(compressed))
        {
            return Err(Error::Zip64Required(Zip64Reason::EntryTooLarge));
        }
        if !open.zip64_in_local && (needs_zip64(size) || needs_zip64(compressed)) {
            // The local header reserved no ZIP64 extra, so it cannot be
            // patched to hold these numbers.
            return Err(Error::invalid(
                "entry crossed 4 GiB without a reserved ZIP64 extra",
            ));
        }

        // Patch the local header now that the numbers are known.
        let end = inner.stream_position().map_err(Error::io)?;
        inner
            .seek(SeekFrom::Start(open.header_offset + 14))
            .map_err(Error::io)?;
        inner.write_u32::<LittleEndian>(crc)?;
        if open.zip64_in_local {
            inner.write_u32::<LittleEndian>(U32_MAX as u32)?;
            inner.write_u32::<LittleEndian>(U32_MAX as u32)?;
            // The ZIP64 placeholder heads the extra block: tag, length,
            // then the two sizes.
            let extra_pos = open.header_offset + 30 + open.name_len as u64 + 4;
            inner.seek(SeekFrom::Start(extra_pos)).map_err(Error::io)?;
            inner.write_u64::<LittleEndian>(size)?;
            inner.write_u64::<LittleEndian>(compressed)?;
            self.zip64_used = true;
        } else {
            inner.write_u32::<LittleEndian>(compressed as u32)?;
            inner.write_u32::<LittleEndian>(size as u32)?;
        }
        inner.seek(SeekFrom::Start(end)).map_err(Error::io)?;

        let mut entry = open.entry;
        entry.crc32 = crc;
        entry.compressed_size = compressed;
        entry.size = Some(size);
        self.central.push(entry);
        self.sink = Sink::Idle(inner);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.open.is_some() {
            return Err(Error::invalid("zip entry still open at finish"));
        }
        let zip64_mode = self.options.zip64;
        if zip64_mode == Zip64Mode::Never && self.central.len() as u64 > U16_MAX {
            return Err(Error::Zip64Required(Zip64Reason::TooManyEntries));
        }

        let central = std::mem::take(&mut self.central);
        let mut zip64_used = self.zip64_used || zip64_mode == Zip64Mode::Always;
        let cd_start = self.inner_mut().stream_position().map_err(Error::io)?;

        for entry in &central {
            let size = entry.size.unwrap_or(0);
            let csize = entry.compressed_size;
            let offset = entry.local_header_offset;
            let entry_zip64 = zip64_mode == Zip64Mode::Always
                || needs_zip64(size)
                || needs_zip64(csize)
                || needs_zip64(offset);
            if entry_zip64 && zip64_mode == Zip64Mode::Never {
                return Err(Error::Zip64Required(Zip64Reason::EntryTooLarge));
            }
            zip64_used |= entry_zip64;

            let name_bytes = if entry.general_purpose_bits.utf8_names() {
                entry.name.as_bytes().to_vec()
            } else {
                // Names were validated against the encoding in put_entry.
                self.options.encoding.encode(&entry.name)?.into_owned()
            };

            let mut fields: Vec<ExtraField> = entry
                .extra_fields
                .iter()
                .filter(|f| f.tag() != super::extra::ZIP64_TAG)
                .cloned()
                .collect();
            if entry_zip64 {
                fields.insert(
                    0,
                    ExtraField::Zip64(Zip64ExtendedInfo {
                        size: needs_zip64(size).or_always(zip64_mode, size),
                        compressed_size: needs_zip64(csize).or_always(zip64_mode, csize),
                        local_header_offset: needs_zip64(offset).or_always(zip64_mode, offset),
                        disk_start: None,
                    }),
                );
            }
            let extra_block = serialize_extra_block(&fields);

            let inner = match &mut self.sink {
                Sink::Idle(inner) => inner,
                _ => unreachable!("entry closed above"),
            };
            inner.write_u32::<LittleEndian>(CENTRAL_HEADER_SIG)?;
            inner.write_u16::<LittleEndian>((3 << 8) | VERSION_DEFLATE)?;
            inner.write_u16::<LittleEndian>(if entry_zip64 {
                VERSION_ZIP64
            } else {
                VERSION_DEFLATE
            })?;
            inner.write_u16::<LittleEndian>(entry.general_purpose_bits.0)?;
            inner.write_u16::<LittleEndian>(entry.method.code())?;
            inner.write_u32::<LittleEndian>(entry.dos_time.0)?;
            inner.write_u32::<LittleEndian>(entry.crc32)?;
            inner.write_u32::<LittleEndian>(mask32(csize))?;
            inner.write_u32::<LittleEndian>(mask32(size))?;
            inner.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
            inner.write_u16::<LittleEndian>(extra_block.len() as u16)?;
            inner.write_u16::<LittleEndian>(entry.comment.len() as u16)?;
            inner.write_u16::<LittleEndian>(0)?; // disk number start
            inner.write_u16::<LittleEndian>(entry.internal_attributes)?;
            inner.write_u32::<LittleEndian>(entry.external_attributes)?;
            inner.write_u32::<LittleEndian>(mask32(offset))?;
            inner.write_all(&name_bytes)?;
            inner.write_all(&extra_block)?;
            inner.write_all(entry.comment.as_bytes())?;
        }

        let cd_end = self.inner_mut().stream_position().map_err(Error::io)?;
        let cd_size = cd_end - cd_start;

        if zip64_mode == Zip64Mode::Never
            && (needs_zip64(cd_start) || needs_zip64(cd_size))
        {
            return Err(Error::Zip64Required(Zip64Reason::CentralDirectoryTooLarge));
        }
        zip64_used |= central.len() as u64 > U16_MAX
            || needs_zip64(cd_start)
            || needs_zip64(cd_size);

        let inner = self.inner_mut();
        if zip64_used {
            let zip64_eocd_offset = cd_end;
            inner.write_u32::<LittleEndian>(ZIP64_EOCD_SIG)?;
            inner.write_u64::<LittleEndian>(44)?; // record size less sig+len
            inner.write_u16::<LittleEndian>((3 << 8) | VERSION_ZIP64)?;
            inner.write_u16::<LittleEndian>(VERSION_ZIP64)?;
            inner.write_u32::<LittleEndian>(0)?;
            inner.write_u32::<LittleEndian>(0)?;
            inner.write_u64::<LittleEndian>(central.len() as u64)?;
            inner.write_u64::<LittleEndian>(central.len() as u64)?;
            inner.write_u64::<LittleEndian>(cd_size)?;
            inner.write_u64::<LittleEndian>(cd_start)?;

            inner.write_u32::<LittleEndian>(ZIP64_LOCATOR_SIG)?;
            inner.write_u32::<LittleEndian>(0)?;
            inner.write_u64::<LittleEndian>(zip64_eocd_offset)?;
            inner.write_u32::<LittleEndian>(1)?;
        }

        inner.write_u32::<LittleEndian>(EOCD_SIG)?;
        inner.write_u16::<LittleEndian>(0)?;
        inner.write_u16::<LittleEndian>(0)?;
        inner.write_u16::<LittleEndian>(mask16(central.len() as u64))?;
        inner.write_u16::<LittleEndian>(mask16(central.len() as u64))?;
        inner.write_u32::<LittleEndian>(mask32(cd_size))?;
        inner.write_u32::<LittleEndian>(mask32(cd_start))?;
        inner.write_u16::<LittleEndian>(0)?; // no archive comment
        inner.flush().map_err(Error::io)?;

        self.finished = true;
        Ok(())
    }
}

fn mask32(value: u64) -> u32 {
    if needs_zip64(value) {
        U32_MAX as u32
    } else {
        value as u32
    }
}

fn mask16(value: u64) -> u16 {
    if value >= U16_MAX {
        U16_MAX as u16
    } else {
        value as u16
    }
}

trait OrAlways {
    fn or_always(self, mode: Zip64Mode, value: u64) -> Option<u64>;
}

impl OrAlways for bool {
    /// `Some(value)` when the cell overflowed, or unconditionally in
    /// `Always` mode.
    fn or_always(self, mode: Zip64Mode, value: u64) -> Option<u64> {
        (self || mode == Zip64Mode::Always).then_some(value)
    }
}

impl<W: Write + Seek> Write for ZipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(open) = self.open.as_mut() else {
            return Err(Error::invalid("no open zip entry").into_io());
        };
        let n = match &mut self.sink {
            Sink::Stored(w) => w.write(buf)?,
            Sink::Deflate(w) => w.write(buf)?,
            Sink::Bzip2(w) => w.write(buf)?,
            #[cfg(feature = "zstd")]
            Sink::Zstd(w) => w.write(buf)?,
            _ => return Err(Error::invalid("no open zip entry").into_io()),
        };
        open.crc.update(&buf[..n]);
        open.uncompressed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.sink {
            Sink::Idle(w) => w.flush(),
            Sink::Stored(w) => w.flush(),
            Sink::Deflate(w) => w.flush(),
            Sink::Bzip2(w) => w.flush(),
            #[cfg(feature = "zstd")]
            Sink::Zstd(w) => w.flush(),
            Sink::Poisoned => Ok(()),
        }
    }
}
