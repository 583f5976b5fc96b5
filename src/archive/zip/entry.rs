use super::extra::ExtraField;
use crate::archive::ArchiveEntry;
use crate::time::DosTime;

/// How an entry's payload is transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// No transformation.
    Stored,
    /// LZW shrinking (legacy, read-recognised only).
    Shrunk,
    /// Imploding (legacy, read-recognised only).
    Implode,
    /// DEFLATE, the common case.
    #[default]
    Deflate,
    /// Enhanced DEFLATE with a 64 KiB window.
    Deflate64,
    /// BZip2 blocks.
    Bzip2,
    /// Raw LZMA.
    Lzma,
    /// Zstandard.
    Zstd,
    /// XZ container.
    Xz,
    /// PPMd variant I.
    Ppmd,
    /// Any other method id.
    Other(u16),
}

impl CompressionMethod {
    /// Maps the on-disk method id.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::Stored,
            1 => Self::Shrunk,
            6 => Self::Implode,
            8 => Self::Deflate,
            9 => Self::Deflate64,
            12 => Self::Bzip2,
            14 => Self::Lzma,
            93 => Self::Zstd,
            95 => Self::Xz,
            98 => Self::Ppmd,
            other => Self::Other(other),
        }
    }

    /// The on-disk method id.
    pub fn code(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Shrunk => 1,
            Self::Implode => 6,
            Self::Deflate => 8,
            Self::Deflate64 => 9,
            Self::Bzip2 => 12,
            Self::Lzma => 14,
            Self::Zstd => 93,
            Self::Xz => 95,
            Self::Ppmd => 98,
            Self::Other(code) => code,
        }
    }
}

/// The general-purpose bit flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneralPurposeBits(pub u16);

impl GeneralPurposeBits {
    /// Whether the entry payload is encrypted.
    pub fn encrypted(self) -> bool {
        self.0 & 0x0001 != 0
    }

    /// Whether CRC and sizes follow the payload in a data descriptor.
    pub fn has_data_descriptor(self) -> bool {
        self.0 & 0x0008 != 0
    }

    /// Whether the name and comment are UTF-8 (bit 11).
    pub fn utf8_names(self) -> bool {
        self.0 & 0x0800 != 0
    }

    pub(crate) fn set_utf8_names(&mut self, utf8: bool) {
        if utf8 {
            self.0 |= 0x0800;
        } else {
            self.0 &= !0x0800;
        }
    }

    pub(crate) fn set_data_descriptor(&mut self, dd: bool) {
        if dd {
            self.0 |= 0x0008;
        } else {
            self.0 &= !0x0008;
        }
    }
}

/// One ZIP entry, shared by the readers and the writer.
#[derive(Debug, Clone, Default)]
pub struct ZipEntry {
    /// Entry name with `/` separators; directories end in `/`.
    pub name: String,
    /// Payload transformation.
    pub method: CompressionMethod,
    /// CRC-32 of the uncompressed payload.
    pub crc32: u32,
    /// Compressed payload size.
    pub compressed_size: u64,
    /// Uncompressed payload size; `None` until known.
    pub size: Option<u64>,
    /// The general-purpose bit word.
    pub general_purpose_bits: GeneralPurposeBits,
    /// Creator version-and-platform word.
    pub version_made_by: u16,
    /// Host-dependent external attributes (Unix mode lives in the high 16 bits).
    pub external_attributes: u32,
    /// Internal attributes word.
    pub internal_attributes: u16,
    /// Packed DOS modification date/time.
    pub dos_time: DosTime,
    /// Entry comment from the central directory.
    pub comment: String,
    /// Extra fields in on-disk order, unknown tags preserved.
    pub extra_fields: Vec<ExtraField>,
    /// Offset of the local header, filled by the random-access reader.
    pub local_header_offset: u64,
}

impl ZipEntry {
    /// Creates a deflated file entry.
    pub fn new_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: CompressionMethod::Deflate,
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
            method: CompressionMethod::Stored,
            size: Some(0),
            ..Default::default()
        }
    }

    /// Sets the modification time from Unix epoch seconds.
    pub fn set_modified(&mut self, epoch_seconds: i64) {
        self.dos_time = DosTime::from_unix_seconds(epoch_seconds);
    }

    /// The Unix mode bits from the external attributes, if any were stored.
    pub fn unix_mode(&self) -> Option<u32> {
        let mode = self.external_attributes >> 16;
        (mode != 0).then_some(mode)
    }

    /// Looks up a typed or opaque extra field by its tag.
    pub fn extra_field(&self, tag: u16) -> Option<&ExtraField> {
        self.extra_fields.iter().find(|f| f.tag() == tag)
    }
}

impl ArchiveEntry for ZipEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    fn last_modified(&self) -> i64 {
        self.dos_time.to_unix_seconds()
    }
}
