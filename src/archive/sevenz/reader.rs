//! Random-access 7z reader.

use std::io::{Read, Seek, SeekFrom};

use crc32fast::Hasher;

use super::archive::*;
use super::bitset::{BitSet, read_all_or_bits, read_bits};
use super::coders::add_decoder;
use super::folder::{BindPair, Coder, Folder};
use crate::archive::BoundedReader;
use crate::password::Password;
use crate::{Error, Result};

/// Verifies a CRC-32 once the expected byte count has streamed through.
pub(crate) struct Crc32VerifyingReader<R> {
    inner: R,
    digest: Hasher,
    expected: u64,
    remaining: i64,
}

impl<R: Read> Crc32VerifyingReader<R> {
    pub(crate) fn new(inner: R, remaining: u64, expected: u64) -> Self {
        Self {
            inner,
            digest: Hasher::new(),
            expected,
            remaining: remaining as i64,
        }
    }
}

impl<R: Read> Read for Crc32VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining <= 0 {
            return Ok(0);
        }
        let size = self.inner.read(buf)?;
        if size > 0 {
            self.remaining -= size as i64;
            self.digest.update(&buf[..size]);
        }
        if self.remaining <= 0 {
            let digest = std::mem::replace(&mut self.digest, Hasher::new()).finalize();
            if digest as u64 != self.expected {
                return Err(Error::invalid("7z stream CRC mismatch").into_io());
            }
        }
        Ok(size)
    }
}

/// A 7z archive over seekable input: metadata is parsed up front, entry
/// payloads decode folder-by-folder.
pub struct SevenZFile<R: Read + Seek> {
    inner: R,
    archive: SevenZArchive,
    password: Password,
}

impl<R: Read + Seek> SevenZFile<R> {
    /// Opens an unencrypted archive.
    pub fn new(inner: R) -> Result<Self> {
        Self::with_password(inner, Password::empty())
    }

    /// Opens an archive, decrypting with `password` where needed.
    pub fn with_password(mut inner: R, password: Password) -> Result<Self> {
        let archive = read_archive(&mut inner, &password)?;
        Ok(Self {
            inner,
            archive,
            password,
        })
    }

    /// The parsed archive structure.
    pub fn archive(&self) -> &SevenZArchive {
        &self.archive
    }

    /// The entries, in header order.
    pub fn entries(&self) -> &[SevenZEntry] {
        &self.archive.entries
    }

    /// Streams every entry in order. The callback receives the entry and a
    /// payload reader; returning `false` stops the walk.
    pub fn for_each_entries<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&SevenZEntry, &mut dyn Read) -> Result<bool>,
    {
        let archive = self.archive.clone();
        let count = archive.entries.len();
        let mut i = 0;
        while i < count {
            let entry = &archive.entries[i];
            let folder_index = archive.stream_map.entry_folder_index[i];
            let Some(folder_index) = folder_index else {
                let mut empty: &[u8] = &[];
                if !callback(entry, &mut empty)? {
                    return Ok(());
                }
                i += 1;
                continue;
            };

            let mut decoder =
                folder_decoder(&archive, folder_index, &mut self.inner, &self.password)?;
            while i < count && archive.stream_map.entry_folder_index[i] == Some(folder_index) {
                let entry = &archive.entries[i];
                if !entry.has_stream {
                    let mut empty: &[u8] = &[];
                    if !callback(entry, &mut empty)? {
                        return Ok(());
                    }
                } else {
                    let sub = BoundedReader::new(&mut decoder, entry.size);
                    let mut sub: Box<dyn Read + '_> = if entry.has_crc {
                        Box::new(Crc32VerifyingReader::new(sub, entry.size, entry.crc))
                    } else {
                        Box::new(sub)
                    };
                    let more = callback(entry, &mut sub)?;
                    // Skip whatever the callback left unread so the next
                    // sub-stream starts aligned.
                    std::io::copy(&mut sub, &mut std::io::sink()).map_err(Error::io)?;
                    if !more {
                        return Ok(());
                    }
                }
                i += 1;
            }
        }
        Ok(())
    }

    /// Decodes one entry's payload. Solid folders decode from their start,
    /// so random access inside a folder costs the preceding sub-streams.
    pub fn read_entry_data(&mut self, index: usize) -> Result<Vec<u8>> {
        let archive = self.archive.clone();
        let entry = archive
            .entries
            .get(index)
            .ok_or_else(|| Error::invalid("7z entry index out of range"))?;
        let Some(folder_index) = archive.stream_map.entry_folder_index[index] else {
            return Ok(Vec::new());
        };
        if !entry.has_stream {
            return Ok(Vec::new());
        }

        let mut decoder =
            folder_decoder(&archive, folder_index, &mut self.inner, &self.password)?;

        // Discard earlier sub-streams of the folder.
        let first = archive.stream_map.folder_first_entry_index[folder_index];
        for prior in &archive.entries[first..index] {
            if prior.has_stream {
                crate::archive::skip_fully(&mut decoder, prior.size)?;
            }
        }

        let mut data = vec![0u8; entry.size as usize];
        decoder.read_exact(&mut data)?;
        if entry.has_crc && crc32fast::hash(&data) as u64 != entry.crc {
            return Err(Error::invalid("7z entry CRC mismatch"));
        }
        Ok(data)
    }

    /// Returns the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Builds the decode chain for one folder.
fn folder_decoder<'r, R: Read + Seek>(
    archive: &SevenZArchive,
    folder_index: usize,
    reader: &'r mut R,
    password: &Password,
) -> Result<Box<dyn Read + 'r>> {
    let folder = &archive.folders[folder_index];
    let first_pack = archive.stream_map.folder_first_pack_stream_index[folder_index];
    let offset = SIGNATURE_HEADER_SIZE
        + archive.pack_pos
        + archive.stream_map.pack_stream_offsets[first_pack];
    reader.seek(SeekFrom::Start(offset)).map_err(Error::io)?;

    let pack_size = archive.pack_sizes[first_pack];
    let mut decoder: Box<dyn Read + 'r> = Box::new(BoundedReader::new(reader, pack_size));
    for (index, coder) in folder.ordered_coders() {
        if coder.num_in_streams != 1 || coder.num_out_streams != 1 {
            return Err(Error::unsupported(
                "7z folders with multi-stream coders",
            ));
        }
        decoder = Box::new(add_decoder(
            decoder,
            folder.unpack_size_at(index),
            coder,
            password,
        )?);
    }
    if folder.has_crc {
        decoder = Box::new(Crc32VerifyingReader::new(
            decoder,
            folder.unpack_size(),
            folder.crc,
        ));
    }
    Ok(decoder)
}

/// Parses the archive metadata: signature, start header, then the (possibly
/// compressed) next header with its streams and files info.
pub(crate) fn read_archive<R: Read + Seek>(
    reader: &mut R,
    password: &Password,
) -> Result<SevenZArchive> {
    let reader_len = reader.seek(SeekFrom::End(0)).map_err(Error::io)?;
    reader.seek(SeekFrom::Start(0)).map_err(Error::io)?;

    let mut signature = [0u8; 6];
    reader.read_exact(&mut signature)?;
    if signature != SEVEN_Z_SIGNATURE {
        return Err(Error::invalid_at(0, "bad 7z signature"));
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    if version[0] != 0 {
        return Err(Error::unsupported(format!(
            "7z format version {}.{}",
            version[0], version[1]
        )));
    }

    let start_header_crc = read_u32le(reader)?;

    // A zeroed start header may still precede a usable end header; probe.
    let header_present = if start_header_crc == 0 {
        let position = reader.stream_position().map_err(Error::io)?;
        let mut probe = [0u8; 20];
        reader.read_exact(&mut probe)?;
        reader.seek(SeekFrom::Start(position)).map_err(Error::io)?;
        probe.iter().any(|&b| b != 0)
    } else {
        true
    };

    if header_present {
        let start_header = read_start_header(reader, start_header_crc)?;
        init_archive(reader, start_header, password, true)
    } else {
        locate_end_header(reader, reader_len, password)
    }
}

fn read_start_header<R: Read>(reader: &mut R, expected_crc: u32) -> Result<StartHeader> {
    let mut buf = [0u8; 20];
    reader.read_exact(&mut buf)?;
    if crc32fast::hash(&buf) != expected_crc {
        return Err(Error::invalid_at(8, "7z start header CRC mismatch"));
    }
    Ok(StartHeader {
        next_header_offset: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
        next_header_size: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
        next_header_crc: u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes")) as u64,
    })
}

/// Scans backwards for a header byte when the start header was zeroed out
/// (self-extracting archives and truncated writes do this).
fn locate_end_header<R: Read + Seek>(
    reader: &mut R,
    reader_len: u64,
    password: &Password,
) -> Result<SevenZArchive> {
    let search_limit = 1024 * 1024;
    let prev_data_size = reader.stream_position().map_err(Error::io)? + 20;
    let min_pos = reader_len.saturating_sub(search_limit).max(prev_data_size);
    let mut pos = reader_len.saturating_sub(1);
    while pos > min_pos {
        pos -= 1;
        reader.seek(SeekFrom::Start(pos)).map_err(Error::io)?;
        let nid = read_u8(reader)?;
        if nid == K_ENCODED_HEADER || nid == K_HEADER {
            let start_header = StartHeader {
                next_header_offset: pos - prev_data_size,
                next_header_size: reader_len - pos,
                next_header_crc: 0,
            };
            if let Ok(archive) = init_archive(reader, start_header, password, false) {
                if !archive.entries.is_empty() {
                    return Ok(archive);
                }
            }
        }
    }
    Err(Error::invalid(
        "start header corrupt and no end header found",
    ))
}

fn init_archive<R: Read + Seek>(
    reader: &mut R,
    start_header: StartHeader,
    password: &Password,
    verify_crc: bool,
) -> Result<SevenZArchive> {
    if start_header.next_header_size > usize::MAX as u64 {
        return Err(Error::invalid("7z next header too large"));
    }
    reader
        .seek(SeekFrom::Start(
            SIGNATURE_HEADER_SIZE + start_header.next_header_offset,
        ))
        .map_err(Error::io)?;

    let mut buf = vec![0u8; start_header.next_header_size as usize];
    reader.read_exact(&mut buf)?;
    if verify_crc && crc32fast::hash(&buf) as u64 != start_header.next_header_crc {
        return Err(Error::invalid("7z next header CRC mismatch"));
    }

    let mut archive = SevenZArchive::default();
    let mut header = buf.as_slice();
    let mut nid = read_u8(&mut header)?;

    let decoded;
    if nid == K_ENCODED_HEADER {
        // The header itself is a compressed folder; decode and restart.
        read_streams_info(&mut header, &mut archive)?;
        let folder = archive
            .folders
            .first()
            .ok_or_else(|| Error::invalid("encoded 7z header without folders"))?;
        if archive.pack_sizes.is_empty() {
            return Err(Error::invalid("encoded 7z header without pack streams"));
        }
        let unpack_size = folder.unpack_size();
        let mut decoder = folder_decoder(&archive, 0, reader, password)?;
        let mut plain = vec![0u8; unpack_size as usize];
        decoder
            .read_exact(&mut plain)
            .map_err(|e| match password.is_empty() {
                false => Error::DecryptionFailed,
                true => Error::io(e),
            })?;
        drop(decoder);
        decoded = plain;
        archive = SevenZArchive::default();
        header = decoded.as_slice();
        nid = read_u8(&mut header)?;
    }

    if nid != K_HEADER {
        return Err(Error::invalid("7z archive has no header"));
    }
    read_header(&mut header, &mut archive)?;

    archive.is_solid = archive
        .folders
        .iter()
        .any(|folder| folder.num_unpack_sub_streams > 1);
    Ok(archive)
}

fn read_header(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    let mut nid = read_u8(header)?;
    if nid == K_ARCHIVE_PROPERTIES {
        // Properties are opaque; skip each sized cell.
        let mut prop = read_u8(header)?;
        while prop != K_END {
            let size = read_number_usize(header, "property size")?;
            skip_bytes(header, size)?;
            prop = read_u8(header)?;
        }
        nid = read_u8(header)?;
    }
    if nid == K_ADDITIONAL_STREAMS_INFO {
        return Err(Error::unsupported("7z additional streams"));
    }
    if nid == K_MAIN_STREAMS_INFO {
        read_streams_info(header, archive)?;
        nid = read_u8(header)?;
    }
    if nid == K_FILES_INFO {
        read_files_info(header, archive)?;
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::invalid(format!("7z header terminated by {nid:#04x}")));
    }
    Ok(())
}

fn read_streams_info(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    let mut nid = read_u8(header)?;
    if nid == K_PACK_INFO {
        read_pack_info(header, archive)?;
        nid = read_u8(header)?;
    }
    if nid == K_UNPACK_INFO {
        read_unpack_info(header, archive)?;
        nid = read_u8(header)?;
    } else {
        archive.folders.clear();
    }
    if nid == K_SUB_STREAMS_INFO {
        read_sub_streams_info(header, archive)?;
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::invalid(format!(
            "7z streams info terminated by {nid:#04x}"
        )));
    }
    Ok(())
}

fn read_pack_info(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    archive.pack_pos = read_number(header)?;
    let num_pack_streams = read_number_usize(header, "pack stream count")?;
    let mut nid = read_u8(header)?;
    if nid == K_SIZE {
        archive.pack_sizes = (0..num_pack_streams)
            .map(|_| read_number(header))
            .collect::<Result<_>>()?;
        nid = read_u8(header)?;
    }
    if nid == K_CRC {
        archive.pack_crcs_defined = read_all_or_bits(header, num_pack_streams)?;
        archive.pack_crcs = vec![0; num_pack_streams];
        for i in 0..num_pack_streams {
            if archive.pack_crcs_defined.contains(i) {
                archive.pack_crcs[i] = read_u32le(header)? as u64;
            }
        }
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::invalid(format!(
            "7z pack info terminated by {nid:#04x}"
        )));
    }
    Ok(())
}

fn read_unpack_info(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    let nid = read_u8(header)?;
    if nid != K_FOLDER {
        return Err(Error::invalid(format!("expected kFolder, got {nid:#04x}")));
    }
    let num_folders = read_number_usize(header, "folder count")?;
    archive.folders.reserve_exact(num_folders);
    if read_u8(header)? != 0 {
        return Err(Error::unsupported("externally stored 7z folders"));
    }
    for _ in 0..num_folders {
        archive.folders.push(read_folder(header)?);
    }

    let nid = read_u8(header)?;
    if nid != K_CODERS_UNPACK_SIZE {
        return Err(Error::invalid(format!(
            "expected kCodersUnpackSize, got {nid:#04x}"
        )));
    }
    for folder in archive.folders.iter_mut() {
        let total = folder.total_output_streams;
        folder.unpack_sizes.reserve_exact(total);
        for _ in 0..total {
            folder.unpack_sizes.push(read_number(header)?);
        }
    }

    let mut nid = read_u8(header)?;
    if nid == K_CRC {
        let defined = read_all_or_bits(header, num_folders)?;
        for (i, folder) in archive.folders.iter_mut().enumerate() {
            if defined.contains(i) {
                folder.has_crc = true;
                folder.crc = read_u32le(header)? as u64;
            } else {
                folder.has_crc = false;
            }
        }
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::invalid("7z unpack info badly terminated"));
    }
    Ok(())
}

fn read_folder(header: &mut &[u8]) -> Result<Folder> {
    let mut folder = Folder::default();

    let num_coders = read_number_usize(header, "coder count")?;
    let mut coders = Vec::with_capacity(num_coders);
    let mut total_in = 0u64;
    let mut total_out = 0u64;
    for _ in 0..num_coders {
        let mut coder = Coder::default();
        let bits = read_u8(header)?;
        let id_size = (bits & 0x0F) as usize;
        let is_simple = bits & 0x10 == 0;
        let has_attributes = bits & 0x20 != 0;
        let more_methods = bits & 0x80 != 0;

        coder.id_size = id_size;
        header.read_exact(coder.method_id_mut())?;
        if is_simple {
            coder.num_in_streams = 1;
            coder.num_out_streams = 1;
        } else {
            coder.num_in_streams = read_number(header)?;
            coder.num_out_streams = read_number(header)?;
        }
        total_in += coder.num_in_streams;
        total_out += coder.num_out_streams;
        if has_attributes {
            let size = read_number_usize(header, "coder properties size")?;
            let mut props = vec![0u8; size];
            header.read_exact(&mut props)?;
            coder.properties = props;
        }
        if more_methods {
            return Err(Error::unsupported("7z alternative coder methods"));
        }
        coders.push(coder);
    }
    folder.coders = coders;
    folder.total_input_streams = total_in as usize;
    folder.total_output_streams = total_out as usize;

    if folder.total_output_streams == 0 {
        return Err(Error::invalid("7z folder with no output streams"));
    }
    let num_bind_pairs = folder.total_output_streams - 1;
    let mut bind_pairs = Vec::with_capacity(num_bind_pairs);
    for _ in 0..num_bind_pairs {
        bind_pairs.push(BindPair {
            in_index: read_number(header)?,
            out_index: read_number(header)?,
        });
    }
    folder.bind_pairs = bind_pairs;

    if folder.total_input_streams < num_bind_pairs {
        return Err(Error::invalid(
            "7z folder has fewer inputs than bind pairs",
        ));
    }
    let num_packed = folder.total_input_streams - num_bind_pairs;
    let mut packed = vec![0u64; num_packed];
    if num_packed == 1 {
        let index = (0..folder.total_input_streams)
            .find(|&i| folder.find_bind_pair_for_in_stream(i).is_none())
            .ok_or_else(|| Error::invalid("7z folder has no unbound input"))?;
        packed[0] = index as u64;
    } else {
        for slot in packed.iter_mut() {
            *slot = read_number(header)?;
        }
    }
    folder.packed_streams = packed;

    Ok(folder)
}

fn read_sub_streams_info(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    for folder in archive.folders.iter_mut() {
        folder.num_unpack_sub_streams = 1;
    }
    let mut total_streams = archive.folders.len();

    let mut nid = read_u8(header)?;
    if nid == K_NUM_UNPACK_STREAM {
        total_streams = 0;
        for folder in archive.folders.iter_mut() {
            let count = read_number_usize(header, "sub-stream count")?;
            folder.num_unpack_sub_streams = count;
            total_streams += count;
        }
        nid = read_u8(header)?;
    }

    let mut info = SubStreamsInfo::default();
    info.unpack_sizes.resize(total_streams, 0);
    info.has_crc = BitSet::with_capacity(total_streams);
    info.crcs = vec![0; total_streams];

    let mut next_stream = 0;
    for folder in archive.folders.iter() {
        if folder.num_unpack_sub_streams == 0 {
            continue;
        }
        let mut sum = 0;
        if nid == K_SIZE {
            for _ in 0..folder.num_unpack_sub_streams - 1 {
                let size = read_number(header)?;
                info.unpack_sizes[next_stream] = size;
                next_stream += 1;
                sum += size;
            }
        }
        if sum > folder.unpack_size() {
            return Err(Error::invalid(
                "7z sub-stream sizes exceed their folder's output",
            ));
        }
        info.unpack_sizes[next_stream] = folder.unpack_size() - sum;
        next_stream += 1;
    }
    if nid == K_SIZE {
        nid = read_u8(header)?;
    }

    let mut num_digests = 0;
    for folder in archive.folders.iter() {
        if folder.num_unpack_sub_streams != 1 || !folder.has_crc {
            num_digests += folder.num_unpack_sub_streams;
        }
    }

    if nid == K_CRC {
        let defined = read_all_or_bits(header, num_digests)?;
        let mut digests = vec![0u64; num_digests];
        for (i, digest) in digests.iter_mut().enumerate() {
            if defined.contains(i) {
                *digest = read_u32le(header)? as u64;
            }
        }
        let mut next_crc = 0;
        let mut next_digest = 0;
        for folder in archive.folders.iter() {
            if folder.num_unpack_sub_streams == 1 && folder.has_crc {
                info.has_crc.insert(next_crc);
                info.crcs[next_crc] = folder.crc;
                next_crc += 1;
            } else {
                for _ in 0..folder.num_unpack_sub_streams {
                    if defined.contains(next_digest) {
                        info.has_crc.insert(next_crc);
                    } else {
                        info.has_crc.remove(next_crc);
                    }
                    info.crcs[next_crc] = digests[next_digest];
                    next_crc += 1;
                    next_digest += 1;
                }
            }
        }
        nid = read_u8(header)?;
    }

    if nid != K_END {
        return Err(Error::invalid("7z sub-streams info badly terminated"));
    }
    archive.sub_streams_info = Some(info);
    Ok(())
}

fn read_files_info(header: &mut &[u8], archive: &mut SevenZArchive) -> Result<()> {
    let num_entries = read_number_usize(header, "entry count")?;
    let mut entries: Vec<SevenZEntry> = vec![Default::default(); num_entries];

    let mut is_empty_stream: Option<BitSet> = None;
    let mut is_empty_file: Option<BitSet> = None;
    let mut is_anti: Option<BitSet> = None;
    loop {
        let prop_type = read_u8(header)?;
        if prop_type == K_END {
            break;
        }
        let size = read_number_usize(header, "files property size")?;
        match prop_type {
            K_EMPTY_STREAM => {
                is_empty_stream = Some(read_bits(header, num_entries)?);
            }
            K_EMPTY_FILE => {
                let empty = is_empty_stream.as_ref().ok_or_else(|| {
                    Error::invalid("kEmptyFile before kEmptyStream")
                })?;
                is_empty_file = Some(read_bits(header, empty.len())?);
            }
            K_ANTI => {
                let empty = is_empty_stream.as_ref().ok_or_else(|| {
                    Error::invalid("kAnti before kEmptyStream")
                })?;
                is_anti = Some(read_bits(header, empty.len())?);
            }
            K_NAME => {
                if read_u8(header)? != 0 {
                    return Err(Error::unsupported("externally stored 7z names"));
                }
                if size == 0 {
                    return Err(Error::invalid("empty 7z name table"));
                }
                if (size - 1) % 2 != 0 {
                    return Err(Error::invalid("odd 7z name table length"));
                }
                let mut read = 0usize;
                for entry in entries.iter_mut() {
                    let mut units = Vec::new();
                    loop {
                        if read >= size - 1 {
                            return Err(Error::invalid("7z name table short of names"));
                        }
                        let mut pair = [0u8; 2];
                        header.read_exact(&mut pair)?;
                        read += 2;
                        let unit = u16::from_le_bytes(pair);
                        if unit == 0 {
                            break;
                        }
                        units.push(unit);
                    }
                    entry.name = String::from_utf16_lossy(&units);
                }
                if read != size - 1 {
                    return Err(Error::invalid("7z name table has trailing names"));
                }
            }
            K_C_TIME => {
                let defined = read_all_or_bits(header, num_entries)?;
                if read_u8(header)? != 0 {
                    return Err(Error::unsupported("external 7z timestamps"));
                }
                for (i, entry) in entries.iter_mut().enumerate() {
                    if defined.contains(i) {
                        entry.created = Some(read_u64le(header)?.into());
                    }
                }
            }
            K_A_TIME => {
                let defined = read_all_or_bits(header, num_entries)?;
                if read_u8(header)? != 0 {
                    return Err(Error::unsupported("external 7z timestamps"));
                }
                for (i, entry) in entries.iter_mut().enumerate() {
                    if defined.contains(i) {
                        entry.accessed = Some(read_u64le(header)?.into());
                    }
                }
            }
            K_M_TIME => {
                let defined = read_all_or_bits(header, num_entries)?;
                if read_u8(header)? != 0 {
                    return Err(Error::unsupported("external 7z timestamps"));
                }
                for (i, entry) in entries.iter_mut().enumerate() {
                    if defined.contains(i) {
                        entry.last_modified = Some(read_u64le(header)?.into());
                    }
                }
            }
            K_WIN_ATTRIBUTES => {
                let defined = read_all_or_bits(header, num_entries)?;
                if read_u8(header)? != 0 {
                    return Err(Error::unsupported("external 7z attributes"));
                }
                for (i, entry) in entries.iter_mut().enumerate() {
                    if defined.contains(i) {
                        entry.windows_attributes = Some(read_u32le(header)?);
                    }
                }
            }
            K_START_POS => {
                return Err(Error::unsupported("7z kStartPos"));
            }
            // kDummy padding and unknown properties are skipped alike.
            _ => {
                skip_bytes(header, size)?;
            }
        }
    }

    let mut with_stream = 0usize;
    let mut empty_counter = 0usize;
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.has_stream = is_empty_stream
            .as_ref()
            .map(|set| !set.contains(i))
            .unwrap_or(true);
        if entry.has_stream {
            let info = archive.sub_streams_info.as_ref().ok_or_else(|| {
                Error::invalid("7z entries with streams but no sub-streams info")
            })?;
            entry.is_directory = false;
            entry.has_crc = info.has_crc.contains(with_stream);
            entry.crc = info.crcs[with_stream];
            entry.size = info.unpack_sizes[with_stream];
            with_stream += 1;
        } else {
            entry.is_directory = match &is_empty_file {
                Some(set) => !set.contains(empty_counter),
                None => true,
            };
            entry.is_anti_item = is_anti
                .as_ref()
                .map(|set| set.contains(empty_counter))
                .unwrap_or(false);
            entry.size = 0;
            empty_counter += 1;
        }
    }
    archive.entries = entries;
    calculate_stream_map(archive)
}

fn calculate_stream_map(archive: &mut SevenZArchive) -> Result<()> {
    let mut map = StreamMap::default();

    let num_folders = archive.folders.len();
    map.folder_first_pack_stream_index = vec![0; num_folders];
    let mut next_pack_stream = 0;
    for (i, folder) in archive.folders.iter().enumerate() {
        map.folder_first_pack_stream_index[i] = next_pack_stream;
        next_pack_stream += folder.packed_streams.len();
    }

    map.pack_stream_offsets = vec![0; archive.pack_sizes.len()];
    let mut offset = 0;
    for (i, &size) in archive.pack_sizes.iter().enumerate() {
        map.pack_stream_offsets[i] = offset;
        offset += size;
    }

    map.folder_first_entry_index = vec![0; num_folders];
    map.entry_folder_index = vec![None; archive.entries.len()];
    let mut next_folder = 0;
    let mut folder_stream = 0;
    for i in 0..archive.entries.len() {
        if !archive.entries[i].has_stream && folder_stream == 0 {
            map.entry_folder_index[i] = None;
            continue;
        }
        if folder_stream == 0 {
            while next_folder < archive.folders.len() {
                map.folder_first_entry_index[next_folder] = i;
                if archive.folders[next_folder].num_unpack_sub_streams > 0 {
                    break;
                }
                next_folder += 1;
            }
            if next_folder >= archive.folders.len() {
                return Err(Error::invalid("too few 7z folders for the entries"));
            }
        }
        map.entry_folder_index[i] = Some(next_folder);
        if !archive.entries[i].has_stream {
            continue;
        }
        if map.folder_first_entry_index[next_folder] == i {
            let first_pack = map.folder_first_pack_stream_index[next_folder];
            archive.entries[i].compressed_size = archive.pack_sizes[first_pack];
        }
        folder_stream += 1;
        if folder_stream >= archive.folders[next_folder].num_unpack_sub_streams {
            next_folder += 1;
            folder_stream = 0;
        }
    }

    archive.stream_map = map;
    Ok(())
}

#[inline]
fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut byte = [0u8];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[inline]
fn read_u32le(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[inline]
fn read_u64le(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// The 7z variable-length number: the first byte's leading ones say how
/// many extra little-endian bytes follow.
pub(crate) fn read_number(reader: &mut impl Read) -> Result<u64> {
    let first = read_u8(reader)? as u64;
    let mut mask = 0x80u64;
    let mut value = 0u64;
    for i in 0..8 {
        if first & mask == 0 {
            return Ok(value | ((first & (mask - 1)) << (8 * i)));
        }
        value |= (read_u8(reader)? as u64) << (8 * i);
        mask >>= 1;
    }
    Ok(value)
}

fn read_number_usize(reader: &mut impl Read, field: &'static str) -> Result<usize> {
    let value = read_number(reader)?;
    if value > usize::MAX as u64 {
        return Err(Error::invalid(format!("{field} out of range")));
    }
    Ok(value as usize)
}

fn skip_bytes(reader: &mut &[u8], count: usize) -> Result<()> {
    if reader.len() < count {
        return Err(Error::Truncated);
    }
    *reader = &reader[count..];
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_encoding() {
        // Single byte.
        assert_eq!(read_number(&mut &[0x7F][..]).unwrap(), 0x7F);
        // One extension byte.
        assert_eq!(read_number(&mut &[0x80, 0x12][..]).unwrap(), 0x12);
        assert_eq!(read_number(&mut &[0x81, 0x34][..]).unwrap(), 0x134);
        // Full eight extension bytes.
        let full = [0xFFu8, 1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(
            read_number(&mut &full[..]).unwrap(),
            u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8])
        );
    }

    #[test]
    fn bad_signature() {
        let data = b"PK\x03\x04 not seven z....";
        let mut cursor = std::io::Cursor::new(data.to_vec());
        let err = read_archive(&mut cursor, &Password::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }
}
