//! GZIP (RFC 1952) reader and writer.
//!
//! The member framing is implemented here over raw DEFLATE so the reader can
//! resume after each trailer: concatenated members decode end-to-end as one
//! stream. Header text fields are ISO-8859-1 with NUL as the terminator.

use std::io::{BufRead, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::CompressionLevel;
use crate::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const CM_DEFLATE: u8 = 8;

const FTEXT: u8 = 1;
const FHCRC: u8 = 2;
const FEXTRA: u8 = 4;
const FNAME: u8 = 8;
const FCOMMENT: u8 = 16;

/// Producing operating system, byte 9 of the member header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GzipOs {
    /// FAT filesystem (MS-DOS, OS/2, NT/Win32).
    Fat = 0,
    /// Amiga.
    Amiga = 1,
    /// VMS or OpenVMS.
    Vms = 2,
    /// Unix.
    Unix = 3,
    /// VM/CMS.
    VmCms = 4,
    /// Atari TOS.
    AtariTos = 5,
    /// HPFS filesystem (OS/2, NT).
    Hpfs = 6,
    /// Macintosh.
    Macintosh = 7,
    /// Z-System.
    ZSystem = 8,
    /// CP/M.
    CpM = 9,
    /// TOPS-20.
    Tops20 = 10,
    /// NTFS filesystem.
    Ntfs = 11,
    /// QDOS.
    Qdos = 12,
    /// Acorn RISCOS.
    AcornRiscos = 13,
    /// Unknown producer.
    #[default]
    Unknown = 255,
}

impl GzipOs {
    /// Maps a raw header byte, folding unlisted values to [`GzipOs::Unknown`].
    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Fat,
            1 => Self::Amiga,
            2 => Self::Vms,
            3 => Self::Unix,
            4 => Self::VmCms,
            5 => Self::AtariTos,
            6 => Self::Hpfs,
            7 => Self::Macintosh,
            8 => Self::ZSystem,
            9 => Self::CpM,
            10 => Self::Tops20,
            11 => Self::Ntfs,
            12 => Self::Qdos,
            13 => Self::AcornRiscos,
            _ => Self::Unknown,
        }
    }
}

/// One sub-field of the FEXTRA header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipSubField {
    /// Two ISO-8859-1 identifier bytes.
    pub id: [u8; 2],
    /// Sub-field payload.
    pub payload: Vec<u8>,
}

/// The FEXTRA block: an ordered list of sub-fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipExtraField {
    fields: Vec<GzipSubField>,
}

const MAX_EXTRA_ENCODED: usize = 65535;
const MAX_SUBFIELD_PAYLOAD: usize = 65531;

impl GzipExtraField {
    /// Creates an empty extra field.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sub-field, enforcing the RFC 1952 size limits.
    pub fn add(&mut self, id: [u8; 2], payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_SUBFIELD_PAYLOAD {
            return Err(Error::TooLong {
                field: "gzip extra sub-field",
            });
        }
        if self.encoded_len() + 4 + payload.len() > MAX_EXTRA_ENCODED {
            return Err(Error::TooLong {
                field: "gzip extra field",
            });
        }
        self.fields.push(GzipSubField { id, payload });
        Ok(())
    }

    /// The sub-fields in order.
    pub fn fields(&self) -> &[GzipSubField] {
        &self.fields
    }

    /// Total encoded byte length of all sub-fields.
    pub fn encoded_len(&self) -> usize {
        self.fields.iter().map(|f| 4 + f.payload.len()).sum()
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(Error::invalid("gzip extra sub-field header truncated"));
            }
            let id = [rest[0], rest[1]];
            let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
            if rest.len() < 4 + len {
                return Err(Error::invalid("gzip extra sub-field payload truncated"));
            }
            fields.push(GzipSubField {
                id,
                payload: rest[4..4 + len].to_vec(),
            });
            rest = &rest[4 + len..];
        }
        Ok(Self { fields })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        for field in &self.fields {
            out.extend_from_slice(&field.id);
            out.extend_from_slice(&(field.payload.len() as u16).to_le_bytes());
            out.extend_from_slice(&field.payload);
        }
    }
}

/// Member header metadata, also the writer's parameter set.
#[derive(Debug, Clone)]
pub struct GzipParameters {
    /// Compression level for the DEFLATE body.
    pub level: CompressionLevel,
    /// Modification time, Unix epoch seconds (stored modulo 2^32).
    pub modification_time: i64,
    /// Original file name, NUL-free ISO-8859-1.
    pub file_name: Option<String>,
    /// Free-text comment, NUL-free ISO-8859-1.
    pub comment: Option<String>,
    /// Producing operating system.
    pub os: GzipOs,
    /// Whether to emit / whether the member carried a header CRC16.
    pub header_crc: bool,
    /// FEXTRA sub-fields.
    pub extra: Option<GzipExtraField>,
    /// The FTEXT hint bit.
    pub text: bool,
}

impl Default for GzipParameters {
    fn default() -> Self {
        Self {
            level: CompressionLevel::DEFAULT,
            modification_time: 0,
            file_name: None,
            comment: None,
            os: GzipOs::Unknown,
            header_crc: false,
            extra: None,
            text: false,
        }
    }
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_encode(text: &str, field: &'static str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code == 0 {
            // NUL terminates the field on the wire, so it cannot occur inside.
            return Err(Error::invalid(format!("{field} must not contain NUL")));
        }
        if code > 0xFF {
            return Err(Error::invalid(format!(
                "{field} is not representable in ISO-8859-1"
            )));
        }
        out.push(code as u8);
    }
    Ok(out)
}

/// Decompresses one or more concatenated GZIP members.
pub struct GzipReader<R: BufRead> {
    decoder: Option<DeflateDecoder<R>>,
    crc: crc32fast::Hasher,
    member_size: u32,
    header: GzipParameters,
    finished: bool,
}

impl<R: BufRead> GzipReader<R> {
    /// Parses the first member header and prepares to stream the payload.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = read_member_header(&mut inner)?;
        Ok(Self {
            decoder: Some(DeflateDecoder::new(inner)),
            crc: crc32fast::Hasher::new(),
            member_size: 0,
            header,
            finished: false,
        })
    }

    /// Metadata of the first member's header.
    pub fn header(&self) -> &GzipParameters {
        &self.header
    }

    fn finish_member(&mut self) -> std::io::Result<bool> {
        let mut inner = self
            .decoder
            .take()
            .expect("member in progress")
            .into_inner();

        let expected_crc = inner.read_u32::<LittleEndian>().map_err(truncated)?;
        let expected_size = inner.read_u32::<LittleEndian>().map_err(truncated)?;
        let actual_crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new()).finalize();
        if expected_crc != actual_crc {
            return Err(Error::invalid("gzip member CRC mismatch").into_io());
        }
        if expected_size != self.member_size {
            return Err(Error::invalid("gzip member ISIZE mismatch").into_io());
        }
        self.member_size = 0;

        // Another member follows if any byte does.
        if inner.fill_buf()?.is_empty() {
            return Ok(false);
        }
        read_member_header(&mut inner).map_err(Error::into_io)?;
        self.decoder = Some(DeflateDecoder::new(inner));
        Ok(true)
    }
}

fn truncated(e: std::io::Error) -> std::io::Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Truncated.into_io()
    } else {
        e
    }
}

impl<R: BufRead> Read for GzipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.finished {
                return Ok(0);
            }
            let n = self
                .decoder
                .as_mut()
                .expect("decoder present while unfinished")
                .read(buf)?;
            if n > 0 {
                self.crc.update(&buf[..n]);
                self.member_size = self.member_size.wrapping_add(n as u32);
                return Ok(n);
            }
            if !self.finish_member()? {
                self.finished = true;
            }
        }
    }
}

fn read_member_header<R: Read>(inner: &mut R) -> Result<GzipParameters> {
    let mut crc = crc32fast::Hasher::new();
    let mut fixed = [0u8; 10];
    inner.read_exact(&mut fixed)?;
    crc.update(&fixed);

    if fixed[..2] != GZIP_MAGIC {
        return Err(Error::invalid_at(0, "bad gzip magic"));
    }
    if fixed[2] != CM_DEFLATE {
        return Err(Error::unsupported(format!(
            "gzip compression method {}",
            fixed[2]
        )));
    }
    let flags = fixed[3];
    if flags & 0xE0 != 0 {
        return Err(Error::invalid_at(3, "reserved gzip flag bits set"));
    }
    let mtime = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);

    let mut params = GzipParameters {
        modification_time: mtime as i64,
        os: GzipOs::from_byte(fixed[9]),
        text: flags & FTEXT != 0,
        ..Default::default()
    };

    if flags & FEXTRA != 0 {
        let mut len_bytes = [0u8; 2];
        inner.read_exact(&mut len_bytes)?;
        crc.update(&len_bytes);
        let len = u16::from_le_bytes(len_bytes) as usize;
        let mut extra = vec![0u8; len];
        inner.read_exact(&mut extra)?;
        crc.update(&extra);
        params.extra = Some(GzipExtraField::parse(&extra)?);
    }
    if flags & FNAME != 0 {
        params.file_name = Some(latin1_decode(&read_nul_terminated(inner, &mut crc)?));
    }
    if flags & FCOMMENT != 0 {
        params.comment = Some(latin1_decode(&read_nul_terminated(inner, &mut crc)?));
    }
    if flags & FHCRC != 0 {
        params.header_crc = true;
        let mut stored = [0u8; 2];
        inner.read_exact(&mut stored)?;
        let computed = (crc.finalize() & 0xFFFF) as u16;
        if u16::from_le_bytes(stored) != computed {
            return Err(Error::invalid("gzip header CRC mismatch"));
        }
    }
    Ok(params)
}

fn read_nul_terminated<R: Read>(inner: &mut R, crc: &mut crc32fast::Hasher) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut byte = [0u8];
        inner.read_exact(&mut byte)?;
        crc.update(&byte);
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
    }
}

/// Compresses a single GZIP member.
pub struct GzipWriter<W: Write> {
    encoder: Option<DeflateEncoder<W>>,
    crc: crc32fast::Hasher,
    size: u32,
}

impl<W: Write> GzipWriter<W> {
    /// Writes the member header for `params` and prepares the DEFLATE body.
    pub fn new(mut inner: W, params: &GzipParameters) -> Result<Self> {
        let header = build_member_header(params)?;
        inner.write_all(&header).map_err(Error::io)?;
        Ok(Self {
            encoder: Some(DeflateEncoder::new(inner, params.level.to_flate2())),
            crc: crc32fast::Hasher::new(),
            size: 0,
        })
    }

    /// Flushes the DEFLATE body, writes the CRC-32/ISIZE trailer, returns the sink.
    pub fn finish(mut self) -> std::io::Result<W> {
        let mut inner = self.encoder.take().expect("unfinished writer").finish()?;
        inner.write_u32::<LittleEndian>(self.crc.finalize())?;
        inner.write_u32::<LittleEndian>(self.size)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for GzipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self
            .encoder
            .as_mut()
            .expect("unfinished writer")
            .write(buf)?;
        self.crc.update(&buf[..n]);
        self.size = self.size.wrapping_add(n as u32);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("unfinished writer").flush()
    }
}

fn build_member_header(params: &GzipParameters) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(32);
    let mut flags = 0u8;
    if params.text {
        flags |= FTEXT;
    }
    if params.header_crc {
        flags |= FHCRC;
    }
    if params.extra.is_some() {
        flags |= FEXTRA;
    }
    if params.file_name.is_some() {
        flags |= FNAME;
    }
    if params.comment.is_some() {
        flags |= FCOMMENT;
    }

    out.extend_from_slice(&GZIP_MAGIC);
    out.push(CM_DEFLATE);
    out.push(flags);
    out.extend_from_slice(&(params.modification_time as u32).to_le_bytes());
    out.push(match params.level.get() {
        9 => 2,
        1 => 4,
        _ => 0,
    });
    out.push(params.os as u8);

    if let Some(extra) = &params.extra {
        out.extend_from_slice(&(extra.encoded_len() as u16).to_le_bytes());
        extra.serialize(&mut out);
    }
    if let Some(name) = &params.file_name {
        out.extend_from_slice(&latin1_encode(name, "gzip file name")?);
        out.push(0);
    }
    if let Some(comment) = &params.comment {
        out.extend_from_slice(&latin1_encode(comment, "gzip comment")?);
        out.push(0);
    }
    if params.header_crc {
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&((crc & 0xFFFF) as u16).to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(params: &GzipParameters, payload: &[u8]) -> (GzipParameters, Vec<u8>) {
        let mut writer = GzipWriter::new(Vec::new(), params).unwrap();
        writer.write_all(payload).unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = GzipReader::new(Cursor::new(bytes)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        (reader.header().clone(), decoded)
    }

    #[test]
    fn plain_roundtrip() {
        let payload = b"the quick brown fox".repeat(100);
        let (_, decoded) = roundtrip(&GzipParameters::default(), &payload);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn full_header_roundtrip() {
        let mut extra = GzipExtraField::new();
        extra.add(*b"AP", vec![1, 2, 3]).unwrap();
        let params = GzipParameters {
            file_name: Some("data.bin".into()),
            comment: Some("ca\u{EB}sar".into()),
            os: GzipOs::Unix,
            header_crc: true,
            modification_time: 1_600_000_000,
            extra: Some(extra.clone()),
            ..Default::default()
        };
        let (header, decoded) = roundtrip(&params, b"payload");
        assert_eq!(decoded, b"payload");
        assert_eq!(header.file_name.as_deref(), Some("data.bin"));
        assert_eq!(header.comment.as_deref(), Some("ca\u{EB}sar"));
        assert_eq!(header.os, GzipOs::Unix);
        assert_eq!(header.modification_time, 1_600_000_000);
        assert!(header.header_crc);
        assert_eq!(header.extra.as_ref(), Some(&extra));
    }

    #[test]
    fn multi_member_stream_reads_end_to_end() {
        let mut first = GzipWriter::new(Vec::new(), &GzipParameters::default()).unwrap();
        first.write_all(b"first|").unwrap();
        let mut bytes = first.finish().unwrap();

        let mut second = GzipWriter::new(Vec::new(), &GzipParameters::default()).unwrap();
        second.write_all(b"second").unwrap();
        bytes.extend_from_slice(&second.finish().unwrap());

        let mut reader = GzipReader::new(Cursor::new(bytes)).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"first|second");
    }

    #[test]
    fn corrupt_crc_detected() {
        let mut writer = GzipWriter::new(Vec::new(), &GzipParameters::default()).unwrap();
        writer.write_all(b"payload").unwrap();
        let mut bytes = writer.finish().unwrap();
        let len = bytes.len();
        bytes[len - 6] ^= 0xFF;

        let mut reader = GzipReader::new(Cursor::new(bytes)).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            Error::from(err),
            Error::InvalidFormat { .. }
        ));
    }

    #[test]
    fn name_with_nul_rejected() {
        let params = GzipParameters {
            file_name: Some("bad\0name".into()),
            ..Default::default()
        };
        assert!(GzipWriter::new(Vec::new(), &params).is_err());
    }

    #[test]
    fn extra_field_limits() {
        let mut extra = GzipExtraField::new();
        assert!(extra.add(*b"AA", vec![0; MAX_SUBFIELD_PAYLOAD + 1]).is_err());
        extra.add(*b"AA", vec![0; MAX_SUBFIELD_PAYLOAD]).unwrap();
        // The first field fills the block, a second cannot fit.
        assert!(extra.add(*b"BB", vec![0; 10]).is_err());
    }

    #[test]
    fn truncated_stream_reports_truncation() {
        let mut writer = GzipWriter::new(Vec::new(), &GzipParameters::default()).unwrap();
        writer.write_all(b"payload payload payload").unwrap();
        let bytes = writer.finish().unwrap();
        let cut = &bytes[..bytes.len() - 6];

        let mut reader = GzipReader::new(Cursor::new(cut.to_vec())).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(Error::from(err), Error::Truncated));
    }
}
