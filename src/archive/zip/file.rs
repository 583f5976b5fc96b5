//! Random-access ZIP reader.

use std::io::{BufReader, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use super::entry::{CompressionMethod, GeneralPurposeBits, ZipEntry};
use super::extra::{ExtraField, parse_extra_block};
use super::{
    CENTRAL_HEADER_SIG, EOCD_SIG, LOCAL_HEADER_SIG, U16_MAX, U32_MAX, ZIP64_EOCD_SIG,
    ZIP64_LOCATOR_SIG,
};
use crate::archive::BoundedReader;
use crate::codec::bzip2::BZip2Reader;
use crate::encoding::EntryEncoding;
use crate::time::DosTime;
use crate::{Error, Result};

const EOCD_MIN: u64 = 22;
const EOCD_SCAN_MAX: u64 = 64 * 1024 + EOCD_MIN;
const ZIP64_LOCATOR_LEN: u64 = 20;

/// Which ordering `entries` iterates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryOrder {
    /// The order records appear in the central directory.
    #[default]
    CentralDirectory,
    /// Ascending local-header offset.
    Physical,
}

/// A ZIP opened over seekable input: the central directory is parsed up
/// front and entry payloads can be opened in any order.
pub struct ZipFile<R: Read + Seek> {
    inner: R,
    entries: Vec<ZipEntry>,
    comment: String,
}

impl<R: Read + Seek> ZipFile<R> {
    /// Scans the trailer and parses the central directory with UTF-8 as the
    /// fallback name encoding.
    pub fn new(inner: R) -> Result<Self> {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Scans the trailer with an explicit fallback encoding for entries
    /// without the UTF-8 name flag.
    pub fn with_encoding(mut inner: R, encoding: EntryEncoding) -> Result<Self> {
        let (cd_offset, cd_size, total_entries, comment) = locate_central_directory(&mut inner)?;

        inner
            .seek(SeekFrom::Start(cd_offset))
            .map_err(Error::io)?;
        let mut directory = BufReader::new(BoundedReader::new(&mut inner, cd_size));
        let mut entries = Vec::with_capacity(total_entries.min(1 << 16) as usize);
        for _ in 0..total_entries {
            entries.push(read_central_record(&mut directory, encoding)?);
        }

        Ok(Self {
            inner,
            entries,
            comment,
        })
    }

    /// The archive comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// The entries in central-directory order.
    pub fn entries(&self) -> impl Iterator<Item = &ZipEntry> {
        self.entries.iter()
    }

    /// The entries in the requested order.
    pub fn entries_in_order(&self, order: EntryOrder) -> Vec<&ZipEntry> {
        let mut refs: Vec<&ZipEntry> = self.entries.iter().collect();
        if order == EntryOrder::Physical {
            refs.sort_by_key(|e| e.local_header_offset);
        }
        refs
    }

    /// Finds an entry by exact name.
    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Opens a fresh payload reader for `entry`.
    pub fn input_stream(&mut self, entry: &ZipEntry) -> Result<Box<dyn Read + '_>> {
        if entry.general_purpose_bits.encrypted() {
            return Err(Error::unsupported("encrypted zip entries"));
        }

        // Seek to the local header and skip its name and extra block; the
        // central directory's lengths are authoritative for everything else.
        self.inner
            .seek(SeekFrom::Start(entry.local_header_offset))
            .map_err(Error::io)?;
        let sig = self.inner.read_u32::<LittleEndian>()?;
        if sig != LOCAL_HEADER_SIG {
            return Err(Error::invalid_at(
                entry.local_header_offset,
                "central directory points at a non-local-header",
            ));
        }
        let mut fixed = [0u8; 22];
        self.inner.read_exact(&mut fixed)?;
        let name_len = u16::from_le_bytes([fixed[18], fixed[19]]) as i64;
        let extra_len = u16::from_le_bytes([fixed[20], fixed[21]]) as i64;
        self.inner
            .seek(SeekFrom::Current(name_len + extra_len))
            .map_err(Error::io)?;

        let bounded = BoundedReader::new(&mut self.inner, entry.compressed_size);
        Ok(match entry.method {
            CompressionMethod::Stored => Box::new(bounded),
            CompressionMethod::Deflate => {
                Box::new(flate2::bufread::DeflateDecoder::new(BufReader::new(bounded)))
            }
            CompressionMethod::Bzip2 => Box::new(BZip2Reader::new(bounded)?),
            #[cfg(feature = "zstd")]
            CompressionMethod::Zstd => {
                Box::new(crate::codec::zstd::ZstdReader::new(BufReader::new(bounded))?)
            }
            other => {
                return Err(Error::unsupported(format!(
                    "zip compression method {}",
                    other.code()
                )));
            }
        })
    }

    /// Returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Backward EOCD scan, then the optional ZIP64 indirection.
fn locate_central_directory<R: Read + Seek>(
    inner: &mut R,
) -> Result<(u64, u64, u64, String)> {
    let file_len = inner.seek(SeekFrom::End(0)).map_err(Error::io)?;
    if file_len < EOCD_MIN {
        return Err(Error::invalid("file too short for a zip trailer"));
    }
    let scan_len = file_len.min(EOCD_SCAN_MAX);
    let scan_start = file_len - scan_len;
    inner
        .seek(SeekFrom::Start(scan_start))
        .map_err(Error::io)?;
    let mut tail = vec![0u8; scan_len as usize];
    inner.read_exact(&mut tail)?;

    let sig = EOCD_SIG.to_le_bytes();
    let mut eocd_pos = None;
    for i in (0..=tail.len() - EOCD_MIN as usize).rev() {
        if tail[i..i + 4] == sig {
            let comment_len =
                u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize;
            if i + EOCD_MIN as usize + comment_len <= tail.len() {
                eocd_pos = Some(i);
                break;
            }
        }
    }
    let Some(eocd_pos) = eocd_pos else {
        return Err(Error::invalid("end of central directory signature not found"));
    };
    let eocd = &tail[eocd_pos..];
    let disk = u16::from_le_bytes([eocd[4], eocd[5]]);
    let cd_disk = u16::from_le_bytes([eocd[6], eocd[7]]);
    if disk != cd_disk {
        return Err(Error::unsupported("split zip archives"));
    }
    let total_entries = u16::from_le_bytes([eocd[10], eocd[11]]) as u64;
    let cd_size = u32::from_le_bytes(eocd[12..16].try_into().expect("4 bytes")) as u64;
    let cd_offset = u32::from_le_bytes(eocd[16..20].try_into().expect("4 bytes")) as u64;
    let comment_len = u16::from_le_bytes([eocd[20], eocd[21]]) as usize;
    let comment = String::from_utf8_lossy(&eocd[22..22 + comment_len]).into_owned();

    // ZIP64: the locator, when present, sits immediately before the EOCD.
    let eocd_file_pos = scan_start + eocd_pos as u64;
    let needs_zip64 = total_entries == U16_MAX || cd_size == U32_MAX || cd_offset == U32_MAX;
    if eocd_file_pos >= ZIP64_LOCATOR_LEN {
        inner
            .seek(SeekFrom::Start(eocd_file_pos - ZIP64_LOCATOR_LEN))
            .map_err(Error::io)?;
        let locator_sig = inner.read_u32::<LittleEndian>()?;
        if locator_sig == ZIP64_LOCATOR_SIG {
            let locator_disk = inner.read_u32::<LittleEndian>()?;
            let zip64_eocd_offset = inner.read_u64::<LittleEndian>()?;
            let total_disks = inner.read_u32::<LittleEndian>()?;
            if locator_disk != 0 || total_disks > 1 {
                return Err(Error::unsupported("split zip archives"));
            }
            return read_zip64_eocd(inner, zip64_eocd_offset, comment);
        }
    }
    if needs_zip64 {
        return Err(Error::invalid(
            "zip trailer demands ZIP64 but the locator is missing",
        ));
    }
    Ok((cd_offset, cd_size, total_entries, comment))
}

fn read_zip64_eocd<R: Read + Seek>(
    inner: &mut R,
    offset: u64,
    comment: String,
) -> Result<(u64, u64, u64, String)> {
    inner.seek(SeekFrom::Start(offset)).map_err(Error::io)?;
    if inner.read_u32::<LittleEndian>()? != ZIP64_EOCD_SIG {
        return Err(Error::invalid_at(offset, "bad ZIP64 end of central directory"));
    }
    let _record_size = inner.read_u64::<LittleEndian>()?;
    let _version_made = inner.read_u16::<LittleEndian>()?;
    let _version_needed = inner.read_u16::<LittleEndian>()?;
    let disk = inner.read_u32::<LittleEndian>()?;
    let cd_disk = inner.read_u32::<LittleEndian>()?;
    if disk != cd_disk {
        return Err(Error::unsupported("split zip archives"));
    }
    let _entries_this_disk = inner.read_u64::<LittleEndian>()?;
    let total_entries = inner.read_u64::<LittleEndian>()?;
    let cd_size = inner.read_u64::<LittleEndian>()?;
    let cd_offset = inner.read_u64::<LittleEndian>()?;
    Ok((cd_offset, cd_size, total_entries, comment))
}

fn read_central_record<R: Read>(inner: &mut R, encoding: EntryEncoding) -> Result<ZipEntry> {
    let sig = inner.read_u32::<LittleEndian>()?;
    if sig != CENTRAL_HEADER_SIG {
        return Err(Error::invalid("bad central directory record signature"));
    }
    let version_made_by = inner.read_u16::<LittleEndian>()?;
    let _version_needed = inner.read_u16::<LittleEndian>()?;
    let gpb = GeneralPurposeBits(inner.read_u16::<LittleEndian>()?);
    let method = CompressionMethod::from_code(inner.read_u16::<LittleEndian>()?);
    let dos_time = DosTime(inner.read_u32::<LittleEndian>()?);
    let crc32 = inner.read_u32::<LittleEndian>()?;
    let csize = inner.read_u32::<LittleEndian>()? as u64;
    let size = inner.read_u32::<LittleEndian>()? as u64;
    let name_len = inner.read_u16::<LittleEndian>()? as usize;
    let extra_len = inner.read_u16::<LittleEndian>()? as usize;
    let comment_len = inner.read_u16::<LittleEndian>()? as usize;
    let disk_start = inner.read_u16::<LittleEndian>()? as u64;
    let internal_attributes = inner.read_u16::<LittleEndian>()?;
    let external_attributes = inner.read_u32::<LittleEndian>()?;
    let offset = inner.read_u32::<LittleEndian>()? as u64;

    let mut name_bytes = vec![0u8; name_len];
    inner.read_exact(&mut name_bytes)?;
    let mut extra_bytes = vec![0u8; extra_len];
    inner.read_exact(&mut extra_bytes)?;
    let mut comment_bytes = vec![0u8; comment_len];
    inner.read_exact(&mut comment_bytes)?;

    if disk_start != U16_MAX && disk_start != 0 {
        return Err(Error::unsupported("split zip archives"));
    }

    let extra_fields = parse_extra_block(&extra_bytes, size, csize, offset)?;

    let mut entry = ZipEntry {
        method,
        crc32,
        compressed_size: csize,
        size: Some(size),
        general_purpose_bits: gpb,
        version_made_by,
        external_attributes,
        internal_attributes,
        dos_time,
        local_header_offset: offset,
        ..Default::default()
    };

    // Resolve ZIP64 sentinels from the typed extra.
    for field in &extra_fields {
        if let ExtraField::Zip64(info) = field {
            if let Some(real) = info.size {
                entry.size = Some(real);
            }
            if let Some(real) = info.compressed_size {
                entry.compressed_size = real;
            }
            if let Some(real) = info.local_header_offset {
                entry.local_header_offset = real;
            }
        }
    }

    // Name: UTF-8 flag wins; otherwise a unicode-path extra with a matching
    // CRC of the raw name bytes; otherwise the configured encoding.
    entry.name = if gpb.utf8_names() {
        String::from_utf8_lossy(&name_bytes).into_owned()
    } else {
        let unicode = extra_fields.iter().find_map(|f| match f {
            ExtraField::UnicodePath(path) if path.name_crc32 == crc32fast::hash(&name_bytes) => {
                Some(path.unicode_name.clone())
            }
            _ => None,
        });
        unicode.unwrap_or_else(|| encoding.decode(&name_bytes))
    };
    entry.comment = if gpb.utf8_names() {
        String::from_utf8_lossy(&comment_bytes).into_owned()
    } else {
        encoding.decode(&comment_bytes)
    };
    entry.extra_fields = extra_fields;

    Ok(entry)
}
