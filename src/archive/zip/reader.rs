//! Streaming ZIP reader.
//!
//! Walks local headers in file order. Entries that deferred their sizes to
//! a data descriptor are supported for DEFLATE payloads: the inflater
//! detects the stream end itself and surplus bytes are pushed back for the
//! descriptor parse. STORED entries with a descriptor have no discoverable
//! boundary and are rejected; the random-access reader handles those.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::{Decompress, FlushDecompress, Status};

use super::entry::{CompressionMethod, GeneralPurposeBits, ZipEntry};
use super::extra::{ExtraField, parse_extra_block};
use super::{
    CENTRAL_HEADER_SIG, DATA_DESCRIPTOR_SIG, EOCD_SIG, LOCAL_HEADER_SIG, U32_MAX,
};
use crate::archive::{EntryReader, ReaderState};
use crate::codec::bzip2::BZip2Reader;
use crate::encoding::EntryEncoding;
use crate::time::DosTime;
use crate::{Error, Result};

/// Byte source with pushback, so the inflater may overshoot the payload and
/// hand the surplus back for header parsing.
struct Source<R> {
    inner: R,
    pushback: Vec<u8>,
}

impl<R: Read> Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.pushback.is_empty() {
            let n = self.pushback.len().min(buf.len());
            let rest = self.pushback.split_off(n);
            buf[..n].copy_from_slice(&self.pushback);
            self.pushback = rest;
            return Ok(n);
        }
        self.inner.read(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Truncated.into_io());
            }
            filled += n;
        }
        Ok(())
    }

    fn unread(&mut self, bytes: &[u8]) {
        let mut buf = bytes.to_vec();
        buf.extend_from_slice(&self.pushback);
        self.pushback = buf;
    }
}

enum PayloadKind {
    Stored {
        remaining: u64,
    },
    Deflate {
        decomp: Box<Decompress>,
        finished: bool,
        in_buf: Vec<u8>,
        in_pos: usize,
        in_len: usize,
        /// Compressed bytes still expected, when the header declared them.
        bounded: Option<u64>,
    },
    /// Whole compressed payload pre-read; used for the non-streamable codecs.
    Buffered {
        reader: Box<dyn Read>,
    },
}

struct Current {
    kind: PayloadKind,
    crc: crc32fast::Hasher,
    produced: u64,
    compressed_consumed: u64,
    has_descriptor: bool,
    zip64_sizes: bool,
    declared_crc: u32,
    declared_csize: u64,
    declared_size: u64,
}

/// Reads ZIP entries from a forward-only byte stream.
pub struct ZipReader<R: Read> {
    source: Source<R>,
    encoding: EntryEncoding,
    state: ReaderState,
    current: Option<Current>,
}

impl<R: Read> ZipReader<R> {
    /// Creates a reader decoding non-UTF-8 names with CP437's superset.
    pub fn new(inner: R) -> Self {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Creates a reader with an explicit fallback name encoding.
    pub fn with_encoding(inner: R, encoding: EntryEncoding) -> Self {
        Self {
            source: Source {
                inner,
                pushback: Vec::new(),
            },
            encoding,
            state: ReaderState::Init,
            current: None,
        }
    }

    fn advance(&mut self) -> Result<Option<ZipEntry>> {
        self.finish_current()?;

        let mut sig = [0u8; 4];
        self.source.read_exact(&mut sig)?;
        let sig = u32::from_le_bytes(sig);
        if sig == CENTRAL_HEADER_SIG || sig == EOCD_SIG {
            // The entry sequence is over; the trailer is not this reader's
            // concern.
            return Ok(None);
        }
        if sig != LOCAL_HEADER_SIG {
            return Err(Error::invalid("bad zip local header signature"));
        }

        let mut fixed = [0u8; 26];
        self.source.read_exact(&mut fixed)?;
        let mut cursor = &fixed[..];
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let gpb = GeneralPurposeBits(cursor.read_u16::<LittleEndian>()?);
        let method = CompressionMethod::from_code(cursor.read_u16::<LittleEndian>()?);
        let dos_time = DosTime(cursor.read_u32::<LittleEndian>()?);
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let mut csize = cursor.read_u32::<LittleEndian>()? as u64;
        let mut size = cursor.read_u32::<LittleEndian>()? as u64;
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;

        let mut name_bytes = vec![0u8; name_len];
        self.source.read_exact(&mut name_bytes)?;
        let mut extra_bytes = vec![0u8; extra_len];
        self.source.read_exact(&mut extra_bytes)?;

        if gpb.encrypted() {
            return Err(Error::unsupported("encrypted zip entries"));
        }

        let extra_fields = parse_extra_block(&extra_bytes, size, csize, 0)?;
        let mut zip64_sizes = false;
        for field in &extra_fields {
            if let ExtraField::Zip64(info) = field {
                zip64_sizes = true;
                if let Some(real) = info.size {
                    size = real;
                }
                if let Some(real) = info.compressed_size {
                    csize = real;
                }
            }
        }

        let has_descriptor = gpb.has_data_descriptor();
        let name = if gpb.utf8_names() {
            String::from_utf8_lossy(&name_bytes).into_owned()
        } else {
            self.encoding.decode(&name_bytes)
        };

        let entry = ZipEntry {
            name,
            method,
            crc32,
            compressed_size: csize,
            size: if has_descriptor { None } else { Some(size) },
            general_purpose_bits: gpb,
            dos_time,
            extra_fields,
            ..Default::default()
        };

        let kind = match method {
            CompressionMethod::Stored => {
                if has_descriptor {
                    return Err(Error::unsupported(
                        "stored zip entry with a data descriptor in streaming mode",
                    ));
                }
                PayloadKind::Stored { remaining: csize }
            }
            CompressionMethod::Deflate => PayloadKind::Deflate {
                decomp: Box::new(Decompress::new(false)),
                finished: false,
                in_buf: vec![0u8; 8 * 1024],
                in_pos: 0,
                in_len: 0,
                bounded: (!has_descriptor).then_some(csize),
            },
            CompressionMethod::Bzip2 => {
                if has_descriptor {
                    return Err(Error::unsupported(
                        "bzip2 zip entry with a data descriptor in streaming mode",
                    ));
                }
                let mut compressed = vec![0u8; csize as usize];
                self.source.read_exact(&mut compressed)?;
                PayloadKind::Buffered {
                    reader: Box::new(BZip2Reader::new(std::io::Cursor::new(compressed))?),
                }
            }
            #[cfg(feature = "zstd")]
            CompressionMethod::Zstd => {
                if has_descriptor {
                    return Err(Error::unsupported(
                        "zstd zip entry with a data descriptor in streaming mode",
                    ));
                }
                let mut compressed = vec![0u8; csize as usize];
                self.source.read_exact(&mut compressed)?;
                PayloadKind::Buffered {
                    reader: Box::new(crate::codec::zstd::ZstdReader::new(
                        std::io::Cursor::new(compressed),
                    )?),
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "zip compression method {}",
                    other.code()
                )));
            }
        };

        self.current = Some(Current {
            kind,
            crc: crc32fast::Hasher::new(),
            produced: 0,
            compressed_consumed: 0,
            has_descriptor,
            zip64_sizes,
            declared_crc: crc32,
            declared_csize: csize,
            declared_size: size,
        });
        Ok(Some(entry))
    }

    /// Consumes the rest of the current payload and validates its trailer.
    fn finish_current(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        let mut scratch = [0u8; 4096];
        while self.read_payload(&mut scratch)? > 0 {}

        let current = self.current.take().expect("current checked above");
        let (crc, csize, size) = if current.has_descriptor {
            self.read_descriptor(current.zip64_sizes)?
        } else {
            (
                current.declared_crc,
                current.declared_csize,
                current.declared_size,
            )
        };

        if current.crc.clone().finalize() != crc {
            return Err(Error::invalid("zip entry CRC mismatch"));
        }
        if csize != current.compressed_consumed {
            return Err(Error::invalid("zip entry compressed size mismatch"));
        }
        if size != current.produced {
            return Err(Error::invalid("zip entry uncompressed size mismatch"));
        }
        Ok(())
    }

    fn read_descriptor(&mut self, zip64: bool) -> Result<(u32, u64, u64)> {
        let mut head = [0u8; 4];
        self.source.read_exact(&mut head)?;
        let crc = if u32::from_le_bytes(head) == DATA_DESCRIPTOR_SIG {
            let mut real = [0u8; 4];
            self.source.read_exact(&mut real)?;
            u32::from_le_bytes(real)
        } else {
            u32::from_le_bytes(head)
        };
        let (csize, size) = if zip64 {
            let mut sizes = [0u8; 16];
            self.source.read_exact(&mut sizes)?;
            (
                u64::from_le_bytes(sizes[..8].try_into().expect("8 bytes")),
                u64::from_le_bytes(sizes[8..].try_into().expect("8 bytes")),
            )
        } else {
            let mut sizes = [0u8; 8];
            self.source.read_exact(&mut sizes)?;
            (
                u32::from_le_bytes(sizes[..4].try_into().expect("4 bytes")) as u64,
                u32::from_le_bytes(sizes[4..].try_into().expect("4 bytes")) as u64,
            )
        };
        Ok((crc, csize, size))
    }

    fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        match &mut current.kind {
            PayloadKind::Stored { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let n = self.source.read(&mut buf[..take])?;
                if n == 0 {
                    return Err(Error::Truncated);
                }
                *remaining -= n as u64;
                current.compressed_consumed += n as u64;
                current.produced += n as u64;
                current.crc.update(&buf[..n]);
                Ok(n)
            }
            PayloadKind::Deflate {
                decomp,
                finished,
                in_buf,
                in_pos,
                in_len,
                bounded,
            } => {
                loop {
                    if *finished {
                        return Ok(0);
                    }
                    if *in_pos == *in_len {
                        let cap = match bounded {
                            Some(left) => (*left).min(in_buf.len() as u64) as usize,
                            None => in_buf.len(),
                        };
                        if cap == 0 {
                            return Err(Error::invalid(
                                "deflate stream continues past declared compressed size",
                            ));
                        }
                        let n = self.source.read(&mut in_buf[..cap])?;
                        if n == 0 {
                            return Err(Error::Truncated);
                        }
                        *in_pos = 0;
                        *in_len = n;
                        if let Some(left) = bounded {
                            *left -= n as u64;
                        }
                    }

                    let before_in = decomp.total_in();
                    let before_out = decomp.total_out();
                    let status = decomp
                        .decompress(&in_buf[*in_pos..*in_len], buf, FlushDecompress::None)
                        .map_err(|_| Error::invalid("corrupt deflate stream"))?;
                    let consumed = (decomp.total_in() - before_in) as usize;
                    let produced = (decomp.total_out() - before_out) as usize;
                    *in_pos += consumed;
                    current.compressed_consumed += consumed as u64;

                    if status == Status::StreamEnd {
                        *finished = true;
                        // Surplus input belongs to the descriptor or the
                        // next header.
                        let surplus = in_buf[*in_pos..*in_len].to_vec();
                        if let Some(left) = bounded {
                            *left += surplus.len() as u64;
                        }
                        self.source.unread(&surplus);
                        *in_pos = *in_len;
                    }
                    if produced > 0 {
                        current.produced += produced as u64;
                        current.crc.update(&buf[..produced]);
                        return Ok(produced);
                    }
                    if *finished {
                        return Ok(0);
                    }
                }
            }
            PayloadKind::Buffered { reader } => {
                let n = reader.read(buf)?;
                current.produced += n as u64;
                current.crc.update(&buf[..n]);
                if n == 0 {
                    current.compressed_consumed = current.declared_csize;
                }
                Ok(n)
            }
        }
    }
}

impl<R: Read> EntryReader for ZipReader<R> {
    type Entry = ZipEntry;

    fn next_entry(&mut self) -> Result<Option<ZipEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("zip reader already failed"));
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

impl<R: Read> Read for ZipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() {
            return Ok(0);
        }
        match self.read_payload(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e.into_io())
            }
        }
    }
}

// Referenced by the writer when it enforces ZIP64 limits; re-exported here
// to keep the sentinel usage in one place.
pub(crate) fn needs_zip64(value: u64) -> bool {
    value >= U32_MAX
}
