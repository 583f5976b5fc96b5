//! 7z archive metadata model.

use super::folder::Folder;
use crate::archive::ArchiveEntry;
use crate::archive::sevenz::bitset::BitSet;
use crate::time::NtTime;

pub(crate) const SIGNATURE_HEADER_SIZE: u64 = 32;
pub(crate) const SEVEN_Z_SIGNATURE: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

pub(crate) const K_END: u8 = 0x00;
pub(crate) const K_HEADER: u8 = 0x01;
pub(crate) const K_ARCHIVE_PROPERTIES: u8 = 0x02;
pub(crate) const K_ADDITIONAL_STREAMS_INFO: u8 = 0x03;
pub(crate) const K_MAIN_STREAMS_INFO: u8 = 0x04;
pub(crate) const K_FILES_INFO: u8 = 0x05;
pub(crate) const K_PACK_INFO: u8 = 0x06;
pub(crate) const K_UNPACK_INFO: u8 = 0x07;
pub(crate) const K_SUB_STREAMS_INFO: u8 = 0x08;
pub(crate) const K_SIZE: u8 = 0x09;
pub(crate) const K_CRC: u8 = 0x0A;
pub(crate) const K_FOLDER: u8 = 0x0B;
pub(crate) const K_CODERS_UNPACK_SIZE: u8 = 0x0C;
pub(crate) const K_NUM_UNPACK_STREAM: u8 = 0x0D;
pub(crate) const K_EMPTY_STREAM: u8 = 0x0E;
pub(crate) const K_EMPTY_FILE: u8 = 0x0F;
pub(crate) const K_ANTI: u8 = 0x10;
pub(crate) const K_NAME: u8 = 0x11;
pub(crate) const K_C_TIME: u8 = 0x12;
pub(crate) const K_A_TIME: u8 = 0x13;
pub(crate) const K_M_TIME: u8 = 0x14;
pub(crate) const K_WIN_ATTRIBUTES: u8 = 0x15;
pub(crate) const K_ENCODED_HEADER: u8 = 0x17;
pub(crate) const K_START_POS: u8 = 0x18;
/// Padding records; skipped like any unknown property.
#[allow(unused)]
pub(crate) const K_DUMMY: u8 = 0x19;

/// A named coder method id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Hash)]
pub struct SevenZMethod(&'static str, &'static [u8]);

impl SevenZMethod {
    /// Method id for COPY.
    pub const ID_COPY: &'static [u8] = &[0x00];
    /// Method id for the delta filter.
    pub const ID_DELTA: &'static [u8] = &[0x03];
    /// Method id for LZMA.
    pub const ID_LZMA: &'static [u8] = &[0x03, 0x01, 0x01];
    /// Method id for LZMA2.
    pub const ID_LZMA2: &'static [u8] = &[0x21];
    /// Method id for BZip2.
    pub const ID_BZIP2: &'static [u8] = &[0x04, 0x02, 0x02];
    /// Method id for DEFLATE.
    pub const ID_DEFLATE: &'static [u8] = &[0x04, 0x01, 0x08];
    /// Method id for Zstandard.
    pub const ID_ZSTD: &'static [u8] = &[0x04, 0xF7, 0x11, 0x01];
    /// Method id for Brotli.
    pub const ID_BROTLI: &'static [u8] = &[0x04, 0xF7, 0x11, 0x02];
    /// Method id for the BCJ x86 filter.
    pub const ID_BCJ_X86: &'static [u8] = &[0x03, 0x03, 0x01, 0x03];
    /// Method id for the BCJ ARM filter.
    pub const ID_BCJ_ARM: &'static [u8] = &[0x03, 0x03, 0x05, 0x01];
    /// Method id for the BCJ ARM64 filter.
    pub const ID_BCJ_ARM64: &'static [u8] = &[0x0A];
    /// Method id for the BCJ ARM Thumb filter.
    pub const ID_BCJ_ARM_THUMB: &'static [u8] = &[0x03, 0x03, 0x07, 0x01];
    /// Method id for the BCJ PowerPC filter.
    pub const ID_BCJ_PPC: &'static [u8] = &[0x03, 0x03, 0x02, 0x05];
    /// Method id for the BCJ IA64 filter.
    pub const ID_BCJ_IA64: &'static [u8] = &[0x03, 0x03, 0x04, 0x01];
    /// Method id for the BCJ SPARC filter.
    pub const ID_BCJ_SPARC: &'static [u8] = &[0x03, 0x03, 0x08, 0x05];
    /// Method id for AES-256 + SHA-256 encryption.
    pub const ID_AES256_SHA256: &'static [u8] = &[0x06, 0xF1, 0x07, 0x01];

    /// COPY (no transformation).
    pub const COPY: Self = Self("COPY", Self::ID_COPY);
    /// Delta filter.
    pub const DELTA: Self = Self("DELTA", Self::ID_DELTA);
    /// LZMA.
    pub const LZMA: Self = Self("LZMA", Self::ID_LZMA);
    /// LZMA2.
    pub const LZMA2: Self = Self("LZMA2", Self::ID_LZMA2);
    /// BZip2.
    pub const BZIP2: Self = Self("BZIP2", Self::ID_BZIP2);
    /// DEFLATE.
    pub const DEFLATE: Self = Self("DEFLATE", Self::ID_DEFLATE);
    /// Zstandard.
    pub const ZSTD: Self = Self("ZSTD", Self::ID_ZSTD);
    /// Brotli.
    pub const BROTLI: Self = Self("BROTLI", Self::ID_BROTLI);
    /// BCJ x86 filter.
    pub const BCJ_X86: Self = Self("BCJ_X86", Self::ID_BCJ_X86);
    /// BCJ ARM filter.
    pub const BCJ_ARM: Self = Self("BCJ_ARM", Self::ID_BCJ_ARM);
    /// BCJ ARM64 filter.
    pub const BCJ_ARM64: Self = Self("BCJ_ARM64", Self::ID_BCJ_ARM64);
    /// BCJ ARM Thumb filter.
    pub const BCJ_ARM_THUMB: Self = Self("BCJ_ARM_THUMB", Self::ID_BCJ_ARM_THUMB);
    /// BCJ PowerPC filter.
    pub const BCJ_PPC: Self = Self("BCJ_PPC", Self::ID_BCJ_PPC);
    /// BCJ IA64 filter.
    pub const BCJ_IA64: Self = Self("BCJ_IA64", Self::ID_BCJ_IA64);
    /// BCJ SPARC filter.
    pub const BCJ_SPARC: Self = Self("BCJ_SPARC", Self::ID_BCJ_SPARC);
    /// AES-256 + SHA-256 encryption.
    pub const AES256_SHA256: Self = Self("AES256SHA256", Self::ID_AES256_SHA256);

    const METHODS: &'static [&'static SevenZMethod] = &[
        &Self::COPY,
        &Self::DELTA,
        &Self::LZMA,
        &Self::LZMA2,
        &Self::BZIP2,
        &Self::DEFLATE,
        &Self::ZSTD,
        &Self::BROTLI,
        &Self::BCJ_X86,
        &Self::BCJ_ARM,
        &Self::BCJ_ARM64,
        &Self::BCJ_ARM_THUMB,
        &Self::BCJ_PPC,
        &Self::BCJ_IA64,
        &Self::BCJ_SPARC,
        &Self::AES256_SHA256,
    ];

    /// The human-readable method name.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.0
    }

    /// The wire method id.
    #[inline]
    pub const fn id(&self) -> &'static [u8] {
        self.1
    }

    /// Looks a method up by its wire id.
    pub fn by_id(id: &[u8]) -> Option<Self> {
        Self::METHODS.iter().find(|m| m.id() == id).copied().copied()
    }
}

/// One file or directory entry in a 7z archive.
#[derive(Debug, Default, Clone)]
pub struct SevenZEntry {
    /// Entry name with `/` separators.
    pub name: String,
    /// Whether the entry has a payload stream.
    pub has_stream: bool,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Whether this is an anti-item marking a deletion in an update set.
    pub is_anti_item: bool,
    /// Modification time, when recorded.
    pub last_modified: Option<NtTime>,
    /// Creation time, when recorded.
    pub created: Option<NtTime>,
    /// Access time, when recorded.
    pub accessed: Option<NtTime>,
    /// Windows attribute bits, when recorded.
    pub windows_attributes: Option<u32>,
    /// Whether a payload CRC was recorded.
    pub has_crc: bool,
    /// CRC-32 of the payload.
    pub crc: u64,
    /// Uncompressed size.
    pub size: u64,
    /// Compressed size of the folder's first pack stream (folder-level).
    pub compressed_size: u64,
}

impl SevenZEntry {
    /// Creates a file entry.
    pub fn new_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_stream: true,
            ..Default::default()
        }
    }

    /// Creates a directory entry.
    pub fn new_directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            ..Default::default()
        }
    }
}

impl ArchiveEntry for SevenZEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn is_directory(&self) -> bool {
        self.is_directory
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
            .map(NtTime::to_unix_seconds)
            .unwrap_or(0)
    }
}

/// Parsed archive structure: folders, entries and the stream map tying
/// them together.
#[derive(Debug, Default, Clone)]
pub struct SevenZArchive {
    pub(crate) pack_pos: u64,
    pub(crate) pack_sizes: Vec<u64>,
    pub(crate) pack_crcs_defined: BitSet,
    pub(crate) pack_crcs: Vec<u64>,
    pub(crate) sub_streams_info: Option<SubStreamsInfo>,
    /// The folders (coder graphs) of the archive.
    pub folders: Vec<Folder>,
    /// The file and directory entries.
    pub entries: Vec<SevenZEntry>,
    /// Mapping between entries, folders and pack streams.
    pub stream_map: StreamMap,
    /// Whether any folder holds more than one sub-stream.
    pub is_solid: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SubStreamsInfo {
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) has_crc: BitSet,
    pub(crate) crcs: Vec<u64>,
}

/// Correlates entries with folders and pack streams.
#[derive(Debug, Default, Clone)]
pub struct StreamMap {
    pub(crate) folder_first_pack_stream_index: Vec<usize>,
    pub(crate) pack_stream_offsets: Vec<u64>,
    /// Index of the first entry of each folder.
    pub folder_first_entry_index: Vec<usize>,
    /// Folder index for each entry (`None` for entries without a stream).
    pub entry_folder_index: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StartHeader {
    pub(crate) next_header_offset: u64,
    pub(crate) next_header_size: u64,
    pub(crate) next_header_crc: u64,
}
