//! ZIP extra fields.
//!
//! Extras are `(tag, length, value)` triples chained inside the header's
//! extra block. Known tags parse into typed variants; everything else is
//! preserved verbatim so rewriting an archive is lossless.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::U32_MAX;
use crate::{Error, Result};

/// Tag of the ZIP64 extended information extra.
pub const ZIP64_TAG: u16 = 0x0001;
/// Tag of the Info-ZIP Unicode path extra.
pub const UNICODE_PATH_TAG: u16 = 0x7075;

/// ZIP64 extended information: 64-bit forms of the header fields whose
/// 32-bit cells hold the `0xFFFFFFFF` sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64ExtendedInfo {
    /// Uncompressed size, when the 32-bit cell overflowed.
    pub size: Option<u64>,
    /// Compressed size, when the 32-bit cell overflowed.
    pub compressed_size: Option<u64>,
    /// Local header offset, when the 32-bit cell overflowed.
    pub local_header_offset: Option<u64>,
    /// Disk start number, when the 16-bit cell overflowed.
    pub disk_start: Option<u32>,
}

impl Zip64ExtendedInfo {
    /// Parses the payload. Which fields are present depends on which header
    /// cells carried the sentinel, communicated via the flags.
    pub(crate) fn parse(
        mut payload: &[u8],
        size_masked: bool,
        csize_masked: bool,
        offset_masked: bool,
    ) -> Result<Self> {
        let mut info = Self::default();
        if size_masked {
            info.size = Some(payload.read_u64::<LittleEndian>().map_err(|_| bad())?);
        }
        if csize_masked {
            info.compressed_size =
                Some(payload.read_u64::<LittleEndian>().map_err(|_| bad())?);
        }
        if offset_masked {
            info.local_header_offset =
                Some(payload.read_u64::<LittleEndian>().map_err(|_| bad())?);
        }
        // Trailing disk-start field, present only if bytes remain.
        if payload.len() >= 4 {
            info.disk_start = Some(payload.read_u32::<LittleEndian>().map_err(|_| bad())?);
        }
        Ok(info)
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        if let Some(size) = self.size {
            out.write_u64::<LittleEndian>(size).expect("vec write");
        }
        if let Some(csize) = self.compressed_size {
            out.write_u64::<LittleEndian>(csize).expect("vec write");
        }
        if let Some(offset) = self.local_header_offset {
            out.write_u64::<LittleEndian>(offset).expect("vec write");
        }
        if let Some(disk) = self.disk_start {
            out.write_u32::<LittleEndian>(disk).expect("vec write");
        }
        out
    }
}

fn bad() -> Error {
    Error::invalid("zip64 extra field too short")
}

/// Info-ZIP Unicode path extra: a UTF-8 name that replaces the standard one
/// when its CRC-32 matches the raw standard name bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicodePathExtra {
    /// Format version, 1 in the wild.
    pub version: u8,
    /// CRC-32 of the standard (non-Unicode) name bytes.
    pub name_crc32: u32,
    /// The UTF-8 name.
    pub unicode_name: String,
}

impl UnicodePathExtra {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(Error::invalid("unicode path extra too short"));
        }
        Ok(Self {
            version: payload[0],
            name_crc32: u32::from_le_bytes(payload[1..5].try_into().expect("4 bytes")),
            unicode_name: String::from_utf8_lossy(&payload[5..]).into_owned(),
        })
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.unicode_name.len());
        out.push(self.version);
        out.extend_from_slice(&self.name_crc32.to_le_bytes());
        out.extend_from_slice(self.unicode_name.as_bytes());
        out
    }
}

/// One extra field: typed when the tag is known, opaque otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraField {
    /// ZIP64 extended information (tag 0x0001).
    Zip64(Zip64ExtendedInfo),
    /// Info-ZIP Unicode path (tag 0x7075).
    UnicodePath(UnicodePathExtra),
    /// Anything else, preserved as raw bytes.
    Unknown {
        /// The field tag.
        tag: u16,
        /// The raw payload.
        data: Vec<u8>,
    },
}

impl ExtraField {
    /// The field's tag.
    pub fn tag(&self) -> u16 {
        match self {
            Self::Zip64(_) => ZIP64_TAG,
            Self::UnicodePath(_) => UNICODE_PATH_TAG,
            Self::Unknown { tag, .. } => *tag,
        }
    }
}

/// Parses an extra block. The masked flags describe which 32-bit header
/// cells held the ZIP64 sentinel and therefore which fields the ZIP64
/// extra carries.
pub(crate) fn parse_extra_block(
    block: &[u8],
    size: u64,
    csize: u64,
    offset: u64,
) -> Result<Vec<ExtraField>> {
    let mut fields = Vec::new();
    let mut rest = block;
    while rest.len() >= 4 {
        let tag = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return Err(Error::invalid("zip extra block truncated"));
        }
        let payload = &rest[4..4 + len];
        let field = match tag {
            ZIP64_TAG => ExtraField::Zip64(Zip64ExtendedInfo::parse(
                payload,
                size == U32_MAX,
                csize == U32_MAX,
                offset == U32_MAX,
            )?),
            UNICODE_PATH_TAG => match UnicodePathExtra::parse(payload) {
                Ok(parsed) => ExtraField::UnicodePath(parsed),
                // A malformed unicode extra is not fatal; keep it opaque.
                Err(_) => ExtraField::Unknown {
                    tag,
                    data: payload.to_vec(),
                },
            },
            _ => ExtraField::Unknown {
                tag,
                data: payload.to_vec(),
            },
        };
        fields.push(field);
        rest = &rest[4 + len..];
    }
    // A dangling stub of fewer than four bytes is padding; several
    // producers emit it.
    Ok(fields)
}

/// Serialises extra fields back into one block.
pub(crate) fn serialize_extra_block(fields: &[ExtraField]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        let payload = match field {
            ExtraField::Zip64(info) => info.serialize(),
            ExtraField::UnicodePath(path) => path.serialize(),
            ExtraField::Unknown { data, .. } => data.clone(),
        };
        out.extend_from_slice(&field.tag().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_roundtrip_losslessly() {
        let fields = vec![
            ExtraField::Unknown {
                tag: 0xCAFE,
                data: vec![1, 2, 3],
            },
            ExtraField::Unknown {
                tag: 0x5455,
                data: vec![0x03, 1, 2, 3, 4],
            },
        ];
        let block = serialize_extra_block(&fields);
        let parsed = parse_extra_block(&block, 0, 0, 0).unwrap();
        assert_eq!(parsed, fields);
    }

    #[test]
    fn zip64_parses_only_masked_fields() {
        let info = Zip64ExtendedInfo {
            size: Some(5_000_000_000),
            compressed_size: Some(4_999_999_000),
            ..Default::default()
        };
        let block = serialize_extra_block(&[ExtraField::Zip64(info)]);
        let parsed = parse_extra_block(&block, U32_MAX, U32_MAX, 0).unwrap();
        match &parsed[0] {
            ExtraField::Zip64(parsed) => {
                assert_eq!(parsed.size, Some(5_000_000_000));
                assert_eq!(parsed.compressed_size, Some(4_999_999_000));
                assert_eq!(parsed.local_header_offset, None);
            }
            other => panic!("expected zip64, got {other:?}"),
        }
    }

    #[test]
    fn truncated_block_rejected() {
        let block = [0x01, 0x00, 0x10, 0x00, 0xAA];
        assert!(parse_extra_block(&block, 0, 0, 0).is_err());
    }

    #[test]
    fn unicode_path_roundtrip() {
        let extra = UnicodePathExtra {
            version: 1,
            name_crc32: crc32fast::hash(b"standard.txt"),
            unicode_name: "ünïcode.txt".to_string(),
        };
        let parsed = UnicodePathExtra::parse(&extra.serialize()).unwrap();
        assert_eq!(parsed, extra);
    }
}
