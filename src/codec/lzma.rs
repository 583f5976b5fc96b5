//! LZMA and LZMA2 streams.
//!
//! The raw codecs come from `lzma-rust2`; this module adds the classic
//! `.lzma` container (13-byte header followed by the raw stream) and the
//! property-byte conversions shared by the 7z coders and XZ block headers.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lzma_rust2::{LZMA2Reader, LZMA2Writer, LZMAReader, LZMAWriter};

use crate::{Error, Result};

/// Marker in the `.lzma` header for an unknown uncompressed size; the stream
/// is then terminated by an end marker instead.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Options for the LZMA and LZMA2 encoders: a preset plus the tuning knobs
/// `lzma-rust2` exposes.
#[derive(Debug, Clone)]
pub struct LzmaOptions(pub(crate) lzma_rust2::LZMA2Options);

impl Default for LzmaOptions {
    fn default() -> Self {
        Self(lzma_rust2::LZMA2Options::with_preset(6))
    }
}

impl LzmaOptions {
    /// Creates options from a preset level (0..=9, clamped).
    pub fn from_level(level: u32) -> Self {
        Self(lzma_rust2::LZMA2Options::with_preset(level.min(9)))
    }

    /// Sets the dictionary size, clamped to the codec's supported range.
    pub fn set_dictionary_size(&mut self, dict_size: u32) {
        self.0.dict_size =
            dict_size.clamp(lzma_rust2::DICT_SIZE_MIN, lzma_rust2::DICT_SIZE_MAX);
    }

    /// The configured dictionary size.
    pub fn dictionary_size(&self) -> u32 {
        self.0.dict_size
    }
}

/// Decodes a `.lzma` container: 13-byte header, then the raw LZMA stream.
pub struct LzmaReader<R: Read> {
    inner: LZMAReader<R>,
}

impl<R: Read> LzmaReader<R> {
    /// Parses the header and prepares the raw decoder.
    ///
    /// An explicit uncompressed size in the header wins; the all-ones value
    /// selects end-marker mode.
    pub fn new(mut inner: R) -> Result<Self> {
        let props = inner.read_u8()?;
        if props >= (4 * 5 + 4) * 9 + 9 {
            return Err(Error::invalid_at(0, "bad lzma properties byte"));
        }
        let dict_size = inner.read_u32::<LittleEndian>()?;
        let uncompressed_size = inner.read_u64::<LittleEndian>()?;
        let reader = LZMAReader::new_with_props(inner, uncompressed_size, props, dict_size, None)
            .map_err(Error::io)?;
        Ok(Self { inner: reader })
    }
}

impl<R: Read> Read for LzmaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Encodes a `.lzma` container.
pub struct LzmaWriter<W: Write> {
    inner: LZMAWriter<W>,
}

impl<W: Write> LzmaWriter<W> {
    /// Writes the 13-byte header and prepares the raw encoder.
    ///
    /// With `uncompressed_size = None` the header records the unknown-size
    /// marker and the stream is closed with an end marker.
    pub fn new(mut inner: W, options: &LzmaOptions, uncompressed_size: Option<u64>) -> Result<Self> {
        inner.write_u8(options.0.get_props())?;
        inner.write_u32::<LittleEndian>(options.0.dict_size)?;
        inner.write_u64::<LittleEndian>(uncompressed_size.unwrap_or(UNKNOWN_SIZE))?;
        let writer = LZMAWriter::new_no_header(inner, &options.0, uncompressed_size.is_none())
            .map_err(Error::io)?;
        Ok(Self { inner: writer })
    }

    /// Terminates the stream and returns the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.inner.finish()
    }
}

impl<W: Write> Write for LzmaWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes a bare LZMA2 chunk stream.
pub struct Lzma2Reader<R: Read> {
    inner: LZMA2Reader<R>,
}

impl<R: Read> Lzma2Reader<R> {
    /// Creates a decoder with the given dictionary size.
    pub fn new(inner: R, dict_size: u32) -> Self {
        Self {
            inner: LZMA2Reader::new(inner, dict_size, None),
        }
    }
}

impl<R: Read> Read for Lzma2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Encodes a bare LZMA2 chunk stream.
pub struct Lzma2Writer<W: Write> {
    inner: LZMA2Writer<W>,
}

impl<W: Write> Lzma2Writer<W> {
    /// Creates an encoder with the given options.
    pub fn new(inner: W, options: &LzmaOptions) -> Self {
        Self {
            inner: LZMA2Writer::new(inner, &options.0.clone()),
        }
    }

    /// Writes the terminating chunk and returns the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        self.inner.finish()
    }
}

impl<W: Write> Write for Lzma2Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes the LZMA2 dictionary-size property byte (7z coder properties and
/// XZ filter properties share the encoding).
pub(crate) fn lzma2_dict_size_from_prop(prop: u8) -> Result<u32> {
    let bits = prop as u32;
    if bits & !0x3F != 0 {
        return Err(Error::invalid("unsupported LZMA2 property bits"));
    }
    if bits > 40 {
        return Err(Error::invalid("LZMA2 dictionary larger than 4 GiB"));
    }
    if bits == 40 {
        return Ok(0xFFFF_FFFF);
    }
    Ok((2 | (bits & 1)) << (bits / 2 + 11))
}

/// Encodes a dictionary size as the LZMA2 property byte.
pub(crate) fn lzma2_prop_from_dict_size(dict_size: u32) -> u8 {
    if dict_size == 0xFFFF_FFFF {
        return 40;
    }
    let lead = dict_size.leading_zeros();
    let second_bit = (dict_size >> 30u32.wrapping_sub(lead)).wrapping_sub(2);
    (19u32.wrapping_sub(lead) * 2 + second_bit) as u8
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn lzma_container_roundtrip_with_size() {
        let original = b"lzma container payload ".repeat(64);
        let options = LzmaOptions::from_level(3);
        let mut writer =
            LzmaWriter::new(Vec::new(), &options, Some(original.len() as u64)).unwrap();
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();

        // Header: props byte, dict size, explicit size.
        assert_eq!(
            u64::from_le_bytes(compressed[5..13].try_into().unwrap()),
            original.len() as u64
        );

        let mut decoded = Vec::new();
        LzmaReader::new(Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn lzma_container_roundtrip_end_marker() {
        let original = b"end marker mode".repeat(10);
        let options = LzmaOptions::default();
        let mut writer = LzmaWriter::new(Vec::new(), &options, None).unwrap();
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();
        assert_eq!(
            u64::from_le_bytes(compressed[5..13].try_into().unwrap()),
            UNKNOWN_SIZE
        );

        let mut decoded = Vec::new();
        LzmaReader::new(Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn lzma2_roundtrip() {
        let original = vec![42u8; 100_000];
        let options = LzmaOptions::from_level(1);
        let mut writer = Lzma2Writer::new(Vec::new(), &options);
        writer.write_all(&original).unwrap();
        let compressed = writer.finish().unwrap();

        let mut decoded = Vec::new();
        Lzma2Reader::new(Cursor::new(compressed), options.dictionary_size())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn dict_size_prop_roundtrip() {
        for &size in &[1 << 16, 1 << 20, 3 << 19, 1 << 24, 1 << 26] {
            let prop = lzma2_prop_from_dict_size(size);
            assert_eq!(lzma2_dict_size_from_prop(prop).unwrap(), size);
        }
        assert_eq!(lzma2_dict_size_from_prop(40).unwrap(), 0xFFFF_FFFF);
        assert!(lzma2_dict_size_from_prop(41).is_err());
    }
}
