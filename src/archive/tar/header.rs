//! The 512-byte TAR header record.

use super::entry::{SparseSegment, TarEntry, TypeFlag};
use super::{GNU_MAGIC, MAGIC_OFFSET, POSIX_MAGIC, RECORD_SIZE, TarFormat};
use crate::encoding::EntryEncoding;
use crate::fields::{parse_octal, parse_octal_or_binary};
use crate::{Error, Result};

pub(crate) const NAME: (usize, usize) = (0, 100);
pub(crate) const MODE: (usize, usize) = (100, 8);
pub(crate) const UID: (usize, usize) = (108, 8);
pub(crate) const GID: (usize, usize) = (116, 8);
pub(crate) const SIZE: (usize, usize) = (124, 12);
pub(crate) const MTIME: (usize, usize) = (136, 12);
pub(crate) const CHKSUM: (usize, usize) = (148, 8);
pub(crate) const TYPEFLAG: usize = 156;
pub(crate) const LINKNAME: (usize, usize) = (157, 100);
pub(crate) const UNAME: (usize, usize) = (265, 32);
pub(crate) const GNAME: (usize, usize) = (297, 32);
pub(crate) const DEVMAJOR: (usize, usize) = (329, 8);
pub(crate) const DEVMINOR: (usize, usize) = (337, 8);
pub(crate) const PREFIX: (usize, usize) = (345, 155);

/// Old GNU layout: sparse descriptors follow the device cells.
pub(crate) const GNU_SPARSE: usize = 386;
pub(crate) const GNU_SPARSE_COUNT: usize = 4;
pub(crate) const GNU_IS_EXTENDED: usize = 482;
pub(crate) const GNU_REAL_SIZE: (usize, usize) = (483, 12);

/// Continuation record layout: 21 descriptors plus the extension flag.
pub(crate) const SPARSE_EXT_COUNT: usize = 21;
pub(crate) const SPARSE_ENTRY_LEN: usize = 24;

fn field(block: &[u8], cell: (usize, usize)) -> &[u8] {
    &block[cell.0..cell.0 + cell.1]
}

/// Sums header bytes with the checksum cell read as spaces. Returns the
/// unsigned sum and the signed variant some historic GNU versions wrote.
pub(crate) fn checksums(block: &[u8; RECORD_SIZE]) -> (u64, i64) {
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &byte) in block.iter().enumerate() {
        let byte = if (CHKSUM.0..CHKSUM.0 + CHKSUM.1).contains(&i) {
            b' '
        } else {
            byte
        };
        unsigned += byte as u64;
        signed += byte as i8 as i64;
    }
    (unsigned, signed)
}

pub(crate) fn is_zero_block(block: &[u8; RECORD_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

fn trimmed_text(bytes: &[u8], encoding: EntryEncoding) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    encoding.decode(&bytes[..end])
}

/// Parses a header record into a raw entry; long names, pax attributes and
/// sparse continuations are layered on by the reader.
pub(crate) fn parse(
    block: &[u8; RECORD_SIZE],
    offset: u64,
    encoding: EntryEncoding,
) -> Result<TarEntry> {
    let (unsigned, signed) = checksums(block);
    let recorded = parse_octal(field(block, CHKSUM), offset + CHKSUM.0 as u64, "chksum")?;
    if recorded != unsigned && recorded as i64 != signed {
        return Err(Error::invalid_at(offset, "tar header checksum mismatch"));
    }

    let magic = &block[MAGIC_OFFSET..MAGIC_OFFSET + 8];
    let format = if magic == POSIX_MAGIC {
        TarFormat::Ustar
    } else if magic == GNU_MAGIC {
        TarFormat::Gnu
    } else {
        TarFormat::V7
    };

    let mut name = trimmed_text(field(block, NAME), encoding);
    if format == TarFormat::Ustar {
        let prefix = trimmed_text(field(block, PREFIX), encoding);
        if !prefix.is_empty() {
            name = format!("{prefix}/{name}");
        }
    }

    let off = |cell: (usize, usize)| offset + cell.0 as u64;
    let type_flag = TypeFlag::from_byte(block[TYPEFLAG]);

    let mut entry = TarEntry {
        name,
        mode: parse_octal(field(block, MODE), off(MODE), "mode")? as u32,
        uid: parse_octal_or_binary(field(block, UID), off(UID), "uid")?,
        gid: parse_octal_or_binary(field(block, GID), off(GID), "gid")?,
        size: parse_octal_or_binary(field(block, SIZE), off(SIZE), "size")?,
        mtime: parse_octal_or_binary(field(block, MTIME), off(MTIME), "mtime")? as i64,
        type_flag,
        link_name: trimmed_text(field(block, LINKNAME), encoding),
        format,
        ..Default::default()
    };

    if format != TarFormat::V7 {
        entry.uname = trimmed_text(field(block, UNAME), encoding);
        entry.gname = trimmed_text(field(block, GNAME), encoding);
        if matches!(type_flag, TypeFlag::CharDevice | TypeFlag::BlockDevice) {
            entry.dev_major =
                parse_octal(field(block, DEVMAJOR), off(DEVMAJOR), "devmajor")? as u32;
            entry.dev_minor =
                parse_octal(field(block, DEVMINOR), off(DEVMINOR), "devminor")? as u32;
        }
    }

    Ok(entry)
}

/// Parses the in-header part of an old-GNU sparse map. Returns whether a
/// continuation record follows.
pub(crate) fn parse_gnu_sparse(
    block: &[u8; RECORD_SIZE],
    offset: u64,
    entry: &mut TarEntry,
) -> Result<bool> {
    entry.real_size = Some(parse_octal(
        field(block, GNU_REAL_SIZE),
        offset + GNU_REAL_SIZE.0 as u64,
        "realsize",
    )?);
    parse_sparse_entries(
        &block[GNU_SPARSE..],
        GNU_SPARSE_COUNT,
        offset + GNU_SPARSE as u64,
        &mut entry.sparse,
    )?;
    Ok(block[GNU_IS_EXTENDED] != 0)
}

/// Parses one sparse continuation record. Returns whether another follows.
pub(crate) fn parse_sparse_continuation(
    block: &[u8; RECORD_SIZE],
    offset: u64,
    out: &mut Vec<SparseSegment>,
) -> Result<bool> {
    parse_sparse_entries(block, SPARSE_EXT_COUNT, offset, out)?;
    Ok(block[SPARSE_EXT_COUNT * SPARSE_ENTRY_LEN] != 0)
}

fn parse_sparse_entries(
    bytes: &[u8],
    count: usize,
    offset: u64,
    out: &mut Vec<SparseSegment>,
) -> Result<()> {
    for i in 0..count {
        let cell = &bytes[i * SPARSE_ENTRY_LEN..(i + 1) * SPARSE_ENTRY_LEN];
        // An all-NUL descriptor terminates the list.
        if cell.iter().all(|&b| b == 0) {
            break;
        }
        let cell_offset = offset + (i * SPARSE_ENTRY_LEN) as u64;
        let seg_offset = parse_octal_or_binary(&cell[..12], cell_offset, "sparse offset")?;
        let num_bytes = parse_octal_or_binary(&cell[12..], cell_offset + 12, "sparse numbytes")?;
        out.push(SparseSegment {
            offset: seg_offset,
            num_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> [u8; RECORD_SIZE] {
        let mut block = [0u8; RECORD_SIZE];
        block[..9].copy_from_slice(b"hello.txt");
        block[MODE.0..MODE.0 + 8].copy_from_slice(b"0000644\0");
        block[UID.0..UID.0 + 8].copy_from_slice(b"0001750\0");
        block[GID.0..GID.0 + 8].copy_from_slice(b"0001750\0");
        block[SIZE.0..SIZE.0 + 12].copy_from_slice(b"00000000016\0");
        block[MTIME.0..MTIME.0 + 12].copy_from_slice(b"14371573624\0");
        block[TYPEFLAG] = b'0';
        block[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(POSIX_MAGIC);
        let (sum, _) = checksums(&block);
        let digits = format!("{sum:06o}\0 ");
        block[CHKSUM.0..CHKSUM.0 + 8].copy_from_slice(digits.as_bytes());
        block
    }

    #[test]
    fn parses_ustar_header() {
        let entry = parse(&sample_block(), 0, EntryEncoding::UTF_8).unwrap();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.mode, 0o644);
        assert_eq!(entry.size, 0o16);
        assert_eq!(entry.format, TarFormat::Ustar);
        assert_eq!(entry.type_flag, TypeFlag::Normal);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut block = sample_block();
        block[0] = b'x';
        let err = parse(&block, 1024, EntryEncoding::UTF_8).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat {
                offset: Some(1024),
                ..
            }
        ));
    }

    #[test]
    fn accepts_signed_checksum() {
        let mut block = sample_block();
        // A high-bit name byte makes the signed and unsigned sums differ.
        block[20] = 0xFF;
        let (unsigned, signed) = checksums(&block);
        assert_ne!(unsigned as i64, signed);
        let digits = format!("{:06o}\0 ", signed);
        block[CHKSUM.0..CHKSUM.0 + 8].copy_from_slice(digits.as_bytes());
        parse(&block, 0, EntryEncoding::UTF_8).unwrap();
    }

    #[test]
    fn prefix_is_joined() {
        let mut block = sample_block();
        block[PREFIX.0..PREFIX.0 + 4].copy_from_slice(b"some");
        let (sum, _) = checksums(&block);
        let digits = format!("{sum:06o}\0 ");
        block[CHKSUM.0..CHKSUM.0 + 8].copy_from_slice(digits.as_bytes());
        let entry = parse(&block, 0, EntryEncoding::UTF_8).unwrap();
        assert_eq!(entry.name, "some/hello.txt");
    }
}
