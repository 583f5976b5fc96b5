use std::collections::BTreeMap;

use super::TarFormat;
use crate::archive::ArchiveEntry;

/// One stored run of bytes inside a sparse entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseSegment {
    /// Logical offset of the run within the expanded file.
    pub offset: u64,
    /// Number of stored bytes at that offset.
    pub num_bytes: u64,
}

/// The entry kind stored in the header's type-flag cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeFlag {
    /// Regular file (`'0'` or the v7 NUL).
    #[default]
    Normal,
    /// Hard link to an earlier entry.
    HardLink,
    /// Symbolic link.
    SymLink,
    /// Character device node.
    CharDevice,
    /// Block device node.
    BlockDevice,
    /// Directory.
    Directory,
    /// FIFO special file.
    Fifo,
    /// Contiguous file, treated as a regular file.
    Contiguous,
    /// Pax extended header applying to the next entry.
    PaxLocal,
    /// Pax extended header applying to all following entries.
    PaxGlobal,
    /// GNU long-name carrier; payload is the next entry's name.
    GnuLongName,
    /// GNU long-link carrier; payload is the next entry's link target.
    GnuLongLink,
    /// GNU sparse file with the old header layout.
    GnuSparse,
    /// Any other type byte, preserved as-is.
    Other(u8),
}

impl TypeFlag {
    pub(crate) fn from_byte(byte: u8) -> Self {
        match byte {
            0 | b'0' => Self::Normal,
            b'1' => Self::HardLink,
            b'2' => Self::SymLink,
            b'3' => Self::CharDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'7' => Self::Contiguous,
            b'x' => Self::PaxLocal,
            b'g' => Self::PaxGlobal,
            b'L' => Self::GnuLongName,
            b'K' => Self::GnuLongLink,
            b'S' => Self::GnuSparse,
            other => Self::Other(other),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Normal => b'0',
            Self::HardLink => b'1',
            Self::SymLink => b'2',
            Self::CharDevice => b'3',
            Self::BlockDevice => b'4',
            Self::Directory => b'5',
            Self::Fifo => b'6',
            Self::Contiguous => b'7',
            Self::PaxLocal => b'x',
            Self::PaxGlobal => b'g',
            Self::GnuLongName => b'L',
            Self::GnuLongLink => b'K',
            Self::GnuSparse => b'S',
            Self::Other(byte) => byte,
        }
    }

    /// Whether the payload of this entry is file data (as opposed to
    /// metadata consumed by the reader).
    pub(crate) fn carries_data(self) -> bool {
        !matches!(
            self,
            Self::PaxLocal | Self::PaxGlobal | Self::GnuLongName | Self::GnuLongLink
        )
    }
}

/// One TAR entry.
#[derive(Debug, Clone, Default)]
pub struct TarEntry {
    /// Entry name; directories conventionally end in `/`.
    pub name: String,
    /// Unix permission bits.
    pub mode: u32,
    /// Owner id.
    pub uid: u64,
    /// Group id.
    pub gid: u64,
    /// Stored payload size in the archive.
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    /// Entry kind.
    pub type_flag: TypeFlag,
    /// Link target for hard and symbolic links.
    pub link_name: String,
    /// Owner name (ustar).
    pub uname: String,
    /// Group name (ustar).
    pub gname: String,
    /// Device major for device nodes.
    pub dev_major: u32,
    /// Device minor for device nodes.
    pub dev_minor: u32,
    /// Sparse map, empty for dense entries.
    pub sparse: Vec<SparseSegment>,
    /// Expanded size of a sparse entry.
    pub real_size: Option<u64>,
    /// Pax key-value pairs attached to this entry.
    pub pax_headers: BTreeMap<String, String>,
    /// Header dialect the entry was read with.
    pub format: TarFormat,
}

impl TarEntry {
    /// Creates a regular-file entry.
    pub fn new_file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o644,
            type_flag: TypeFlag::Normal,
            ..Default::default()
        }
    }

    /// Creates a directory entry; a trailing `/` is appended when missing.
    pub fn new_directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            mode: 0o755,
            type_flag: TypeFlag::Directory,
            ..Default::default()
        }
    }

    /// The expanded payload size: the real size for sparse entries, the
    /// stored size otherwise.
    pub fn logical_size(&self) -> u64 {
        self.real_size.unwrap_or(self.size)
    }
}

impl ArchiveEntry for TarEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.logical_size())
    }

    fn is_directory(&self) -> bool {
        self.type_flag == TypeFlag::Directory || self.name.ends_with('/')
    }

    fn last_modified(&self) -> i64 {
        self.mtime
    }
}
