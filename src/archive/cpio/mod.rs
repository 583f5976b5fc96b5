//! CPIO archives: odc, newc, newc-with-checksum and the old binary dialect.

mod reader;
mod writer;

pub use reader::CpioReader;
pub use writer::{CpioWriter, CpioWriterOptions};

use crate::archive::ArchiveEntry;

pub(crate) const MAGIC_ODC: &[u8; 6] = b"070707";
pub(crate) const MAGIC_NEW: &[u8; 6] = b"070701";
pub(crate) const MAGIC_NEW_CRC: &[u8; 6] = b"070702";
pub(crate) const MAGIC_BINARY: u16 = 0o070707;

pub(crate) const TRAILER_NAME: &str = "TRAILER!!!";

pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFMT: u32 = 0o170000;

/// The four on-disk dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpioFormat {
    /// Old binary, 16-bit fields (`0o070707` magic, either byte order).
    OldBinary,
    /// Portable ASCII ("odc", magic `070707`), octal fields.
    OldAscii,
    /// New ASCII ("newc", magic `070701`), hex fields, 4-byte padding.
    #[default]
    New,
    /// New ASCII with a per-entry byte-sum checksum (magic `070702`).
    NewCrc,
}

/// One CPIO entry.
#[derive(Debug, Clone, Default)]
pub struct CpioEntry {
    /// Entry name.
    pub name: String,
    /// Inode number.
    pub inode: u64,
    /// Mode and file-type bits.
    pub mode: u32,
    /// Owner id.
    pub uid: u64,
    /// Group id.
    pub gid: u64,
    /// Hard-link count.
    pub nlink: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    /// Payload size.
    pub size: u64,
    /// Device major (newc) or combined device (older dialects).
    pub dev_major: u64,
    /// Device minor (newc).
    pub dev_minor: u64,
    /// Rdev major for special files.
    pub rdev_major: u64,
    /// Rdev minor for special files.
    pub rdev_minor: u64,
    /// Byte-sum checksum, meaningful in the `NewCrc` dialect.
    pub checksum: u32,
    /// The dialect the entry was read with / will be written as.
    pub format: CpioFormat,
}

impl CpioEntry {
    /// Creates a regular-file entry.
    pub fn new_file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        }
    }

    /// Creates a directory entry.
    pub fn new_directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: S_IFDIR | 0o755,
            nlink: 2,
            ..Default::default()
        }
    }
}

impl ArchiveEntry for CpioEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    fn last_modified(&self) -> i64 {
        self.mtime
    }
}

/// Sum-of-bytes checksum of the `NewCrc` dialect.
pub(crate) fn simple_checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}
