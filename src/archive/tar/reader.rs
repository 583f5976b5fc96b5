//! Streaming TAR reader.

use std::collections::BTreeMap;
use std::io::Read;

use super::entry::{SparseSegment, TarEntry, TypeFlag};
use super::{RECORD_SIZE, header, padding_for, pax};
use crate::archive::{ArchiveEntry, EntryReader, ReaderState, skip_fully};
use crate::encoding::EntryEncoding;
use crate::{Error, Result};

/// Reads TAR entries from a forward-only byte stream.
///
/// GNU long names and links, pax local/global headers and sparse maps are
/// resolved internally; `next_entry` only ever yields data-bearing entries.
/// Sparse entries read back expanded, holes as zeros.
pub struct TarReader<R: Read> {
    inner: R,
    encoding: EntryEncoding,
    state: ReaderState,
    position: u64,
    global_pax: BTreeMap<String, String>,
    payload: Payload,
}

/// Read plan for the current entry's payload.
enum Payload {
    None,
    /// Dense entry: stored bytes then record padding.
    Dense { remaining: u64, padding: u64 },
    /// Sparse entry: logical position walks holes and stored segments.
    Sparse {
        segments: Vec<SparseSegment>,
        segment_index: usize,
        logical_pos: u64,
        real_size: u64,
        stored_remaining: u64,
        padding: u64,
    },
}

impl<R: Read> TarReader<R> {
    /// Creates a reader decoding names with UTF-8.
    pub fn new(inner: R) -> Self {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Creates a reader with an explicit name encoding.
    pub fn with_encoding(inner: R, encoding: EntryEncoding) -> Self {
        Self {
            inner,
            encoding,
            state: ReaderState::Init,
            position: 0,
            global_pax: BTreeMap::new(),
            payload: Payload::None,
        }
    }

    /// Returns the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Bytes consumed from the underlying stream so far. After
    /// `next_entry` this is the current entry's payload offset.
    pub(crate) fn stream_position(&self) -> u64 {
        self.position
    }

    fn read_record(&mut self) -> Result<[u8; RECORD_SIZE]> {
        match self.read_record_or_eof()? {
            Some(block) => Ok(block),
            None => Err(Error::Truncated),
        }
    }

    /// Reads one record, distinguishing clean end-of-stream (`None`) from a
    /// record cut short (`Truncated`).
    fn read_record_or_eof(&mut self) -> Result<Option<[u8; RECORD_SIZE]>> {
        let mut block = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            let n = self.inner.read(&mut block[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Truncated);
            }
            filled += n;
        }
        self.position += RECORD_SIZE as u64;
        Ok(Some(block))
    }

    fn drain_payload(&mut self) -> Result<()> {
        let leftover = match &self.payload {
            Payload::None => 0,
            Payload::Dense { remaining, padding } => remaining + padding,
            Payload::Sparse {
                stored_remaining,
                padding,
                ..
            } => stored_remaining + padding,
        };
        if leftover > 0 {
            skip_fully(&mut self.inner, leftover)?;
            self.position += leftover;
        }
        self.payload = Payload::None;
        Ok(())
    }

    fn read_payload_to_vec(&mut self, size: u64, field: &'static str) -> Result<Vec<u8>> {
        if size > 1 << 20 {
            return Err(Error::invalid(format!("{field} header over 1 MiB")));
        }
        let mut payload = vec![0u8; size as usize];
        self.inner.read_exact(&mut payload)?;
        let padding = padding_for(size);
        skip_fully(&mut self.inner, padding)?;
        self.position += size + padding;
        Ok(payload)
    }

    fn advance(&mut self) -> Result<Option<TarEntry>> {
        self.drain_payload()?;

        let mut pending_long_name: Option<String> = None;
        let mut pending_long_link: Option<String> = None;
        let mut pending_pax: Option<BTreeMap<String, String>> = None;

        loop {
            let header_offset = self.position;
            // A clean EOF without the zero terminator ends the archive.
            let Some(block) = self.read_record_or_eof()? else {
                return Ok(None);
            };

            if header::is_zero_block(&block) {
                // Terminator: a second zero record conventionally follows;
                // accept a lone one from sloppy writers.
                let _ = self.read_record_or_eof();
                return Ok(None);
            }

            let mut entry = header::parse(&block, header_offset, self.encoding)?;

            match entry.type_flag {
                TypeFlag::GnuLongName => {
                    let payload = self.read_payload_to_vec(entry.size, "long name")?;
                    pending_long_name = Some(trim_nul(&payload, self.encoding));
                    continue;
                }
                TypeFlag::GnuLongLink => {
                    let payload = self.read_payload_to_vec(entry.size, "long link")?;
                    pending_long_link = Some(trim_nul(&payload, self.encoding));
                    continue;
                }
                TypeFlag::PaxGlobal => {
                    let payload = self.read_payload_to_vec(entry.size, "pax global")?;
                    let records = pax::parse(&payload)?;
                    self.global_pax.extend(records);
                    continue;
                }
                TypeFlag::PaxLocal => {
                    let payload = self.read_payload_to_vec(entry.size, "pax local")?;
                    let records = pax::parse(&payload)?;
                    match &mut pending_pax {
                        Some(pending) => pending.extend(records),
                        None => pending_pax = Some(records),
                    }
                    continue;
                }
                _ => {}
            }

            // Attribute layering: GNU carriers first, pax records override.
            if let Some(name) = pending_long_name.take() {
                entry.name = name;
            }
            if let Some(link) = pending_long_link.take() {
                entry.link_name = link;
            }
            if !self.global_pax.is_empty() {
                let globals = self.global_pax.clone();
                pax::apply(&mut entry, &globals)?;
            }
            if let Some(records) = &pending_pax {
                pax::apply(&mut entry, records)?;
            }

            if entry.type_flag == TypeFlag::GnuSparse {
                let mut more = header::parse_gnu_sparse(&block, header_offset, &mut entry)?;
                while more {
                    let offset = self.position;
                    let continuation = self.read_record()?;
                    more = header::parse_sparse_continuation(
                        &continuation,
                        offset,
                        &mut entry.sparse,
                    )?;
                }
            }

            self.apply_pax_sparse(&mut entry)?;
            self.begin_payload(&entry);
            return Ok(Some(entry));
        }
    }

    /// Handles the pax sparse dialects: 0.1 stores the map in attributes,
    /// 1.0 stores it as decimal lines at the front of the payload.
    fn apply_pax_sparse(&mut self, entry: &mut TarEntry) -> Result<()> {
        let headers = entry.pax_headers.clone();
        let major = headers.get("GNU.sparse.major").map(String::as_str);
        let minor = headers.get("GNU.sparse.minor").map(String::as_str);

        if major == Some("1") && minor == Some("0") {
            if let Some(name) = headers.get("GNU.sparse.name") {
                entry.name = name.clone();
            }
            if let Some(realsize) = headers.get("GNU.sparse.realsize") {
                entry.real_size = Some(
                    realsize
                        .parse()
                        .map_err(|_| Error::invalid("GNU.sparse.realsize is not a number"))?,
                );
            }
            // The map occupies whole records at the payload front.
            let mut consumed = 0u64;
            let mut read_number = |this: &mut Self| -> Result<u64> {
                let mut digits = Vec::new();
                loop {
                    let mut byte = [0u8];
                    this.inner.read_exact(&mut byte)?;
                    consumed += 1;
                    match byte[0] {
                        b'\n' => break,
                        b'0'..=b'9' => digits.push(byte[0]),
                        _ => {
                            return Err(Error::invalid("pax 1.0 sparse map is not numeric"));
                        }
                    }
                }
                String::from_utf8_lossy(&digits)
                    .parse()
                    .map_err(|_| Error::invalid("pax 1.0 sparse map number"))
            };

            let count = read_number(self)?;
            let mut segments = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let offset = read_number(self)?;
                let num_bytes = read_number(self)?;
                segments.push(SparseSegment { offset, num_bytes });
            }
            let map_records = consumed.div_ceil(RECORD_SIZE as u64);
            let map_bytes = map_records * RECORD_SIZE as u64;
            skip_fully(&mut self.inner, map_bytes - consumed)?;
            self.position += map_bytes;
            if map_bytes > entry.size {
                return Err(Error::invalid("pax 1.0 sparse map exceeds entry size"));
            }
            entry.size -= map_bytes;
            entry.sparse = segments;
        } else if let Some(map) = headers.get("GNU.sparse.map") {
            entry.sparse = pax::parse_sparse_map_01(map)?;
            if let Some(size) = headers.get("GNU.sparse.size") {
                entry.real_size = Some(
                    size.parse()
                        .map_err(|_| Error::invalid("GNU.sparse.size is not a number"))?,
                );
            }
        }
        Ok(())
    }

    fn begin_payload(&mut self, entry: &TarEntry) {
        let stored = if entry.type_flag.carries_data() && !entry.is_directory() {
            entry.size
        } else {
            0
        };
        let padding = padding_for(stored);
        self.payload = if entry.sparse.is_empty() {
            Payload::Dense {
                remaining: stored,
                padding,
            }
        } else {
            let mut segments = entry.sparse.clone();
            segments.sort_by_key(|s| s.offset);
            Payload::Sparse {
                segments,
                segment_index: 0,
                logical_pos: 0,
                real_size: entry.logical_size(),
                stored_remaining: stored,
                padding,
            }
        };
    }
}

fn trim_nul(bytes: &[u8], encoding: EntryEncoding) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    encoding.decode(&bytes[..end])
}

impl<R: Read> EntryReader for TarReader<R> {
    type Entry = TarEntry;

    fn next_entry(&mut self) -> Result<Option<TarEntry>> {
        if !self.state.can_advance() {
            return Err(Error::invalid("tar reader already failed"));
        }
        if self.state == ReaderState::Ended {
            return Ok(None);
        }
        match self.advance() {
            Ok(Some(entry)) => {
                self.state = ReaderState::InPayload;
                Ok(Some(entry))
            }
            Ok(None) => {
                self.state = ReaderState::Ended;
                Ok(None)
            }
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e)
            }
        }
    }
}

impl<R: Read> Read for TarReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || !self.state.in_payload() {
            return Ok(0);
        }
        loop {
            match &mut self.payload {
                Payload::None => return Ok(0),
                Payload::Dense { remaining, .. } => {
                    if *remaining == 0 {
                        return Ok(0);
                    }
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    let n = self.inner.read(&mut buf[..take])?;
                    if n == 0 {
                        self.state = ReaderState::Failed;
                        return Err(Error::Truncated.into_io());
                    }
                    *remaining -= n as u64;
                    self.position += n as u64;
                    return Ok(n);
                }
                Payload::Sparse {
                    segments,
                    segment_index,
                    logical_pos,
                    real_size,
                    stored_remaining,
                    ..
                } => {
                    if *logical_pos >= *real_size {
                        return Ok(0);
                    }
                    // Within a hole: zeros up to the next segment or file end.
                    let next_data_start = segments
                        .get(*segment_index)
                        .map(|s| s.offset)
                        .unwrap_or(*real_size);
                    if *logical_pos < next_data_start {
                        let zeros = (next_data_start - *logical_pos)
                            .min(buf.len() as u64)
                            .min(*real_size - *logical_pos)
                            as usize;
                        buf[..zeros].fill(0);
                        *logical_pos += zeros as u64;
                        return Ok(zeros);
                    }
                    // Within a stored segment.
                    let segment = segments[*segment_index];
                    let into_segment = *logical_pos - segment.offset;
                    let segment_left = segment.num_bytes - into_segment;
                    let take = segment_left
                        .min(buf.len() as u64)
                        .min(*stored_remaining)
                        .min(*real_size - *logical_pos) as usize;
                    if take == 0 {
                        *segment_index += 1;
                        continue;
                    }
                    let n = self.inner.read(&mut buf[..take])?;
                    if n == 0 {
                        self.state = ReaderState::Failed;
                        return Err(Error::Truncated.into_io());
                    }
                    *stored_remaining -= n as u64;
                    self.position += n as u64;
                    *logical_pos += n as u64;
                    if *logical_pos == segment.offset + segment.num_bytes {
                        *segment_index += 1;
                    }
                    return Ok(n);
                }
            }
        }
    }
}
