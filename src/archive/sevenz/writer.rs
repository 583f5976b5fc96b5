//! 7z writer.
//!
//! Entries are compressed one folder per payload through the configured
//! content-method chain, then a single uncompressed header is emitted and
//! the start header patched in. Folders stay non-solid, which keeps every
//! entry independently decodable.

use std::io::{Read, Seek, SeekFrom, Write};

use super::archive::{
    K_CODERS_UNPACK_SIZE, K_CRC, K_EMPTY_FILE, K_EMPTY_STREAM, K_END, K_FILES_INFO, K_FOLDER,
    K_HEADER, K_M_TIME, K_MAIN_STREAMS_INFO, K_NAME, K_PACK_INFO, K_SIZE, K_SUB_STREAMS_INFO,
    K_UNPACK_INFO, K_WIN_ATTRIBUTES, SEVEN_Z_SIGNATURE, SIGNATURE_HEADER_SIZE, SevenZEntry,
    SevenZMethod,
};
use super::bitset::{BitSet, write_bits};
use super::coders::{SevenZMethodConfiguration, encode_stage};
use crate::{Error, Result};

struct FolderRecord {
    /// `(method id, properties)` in data order.
    coders: Vec<(&'static [u8], Vec<u8>)>,
    /// Decode-output size per coder, same order.
    unpack_sizes: Vec<u64>,
    crc: u32,
    pack_size: u64,
}

/// Writes a 7z archive.
pub struct SevenZWriter<W: Write + Seek> {
    inner: W,
    entries: Vec<SevenZEntry>,
    folders: Vec<FolderRecord>,
    content_methods: Vec<SevenZMethodConfiguration>,
    finished: bool,
}

impl<W: Write + Seek> SevenZWriter<W> {
    /// Creates a writer; LZMA2 is the default content method.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(SEVEN_Z_SIGNATURE).map_err(Error::io)?;
        inner.write_all(&[0, 4]).map_err(Error::io)?; // format version 0.4
        inner.write_all(&[0u8; 24]).map_err(Error::io)?; // start header, patched later
        Ok(Self {
            inner,
            entries: Vec::new(),
            folders: Vec::new(),
            content_methods: vec![SevenZMethodConfiguration::new(SevenZMethod::LZMA2)],
            finished: false,
        })
    }

    /// Replaces the content-method chain applied to subsequent entries.
    /// Methods are listed in the order they transform the plain data.
    pub fn set_content_methods(&mut self, methods: Vec<SevenZMethodConfiguration>) -> &mut Self {
        if !methods.is_empty() {
            self.content_methods = methods;
        }
        self
    }

    /// Adds an entry. Directories and empty files pass `None`.
    pub fn push_entry(
        &mut self,
        mut entry: SevenZEntry,
        data: Option<&mut dyn Read>,
    ) -> Result<()> {
        if self.finished {
            return Err(Error::invalid("7z writer already finished"));
        }
        let Some(data) = data else {
            entry.has_stream = false;
            entry.size = 0;
            self.entries.push(entry);
            return Ok(());
        };

        let mut plain = Vec::new();
        data.read_to_end(&mut plain).map_err(Error::io)?;
        if plain.is_empty() {
            entry.has_stream = false;
            entry.size = 0;
            self.entries.push(entry);
            return Ok(());
        }

        let crc = crc32fast::hash(&plain);
        entry.has_stream = true;
        entry.is_directory = false;
        entry.size = plain.len() as u64;
        entry.crc = crc as u64;
        entry.has_crc = true;

        // Apply the chain; stage i's input size is coder i's decode output.
        let mut coders = Vec::with_capacity(self.content_methods.len());
        let mut unpack_sizes = Vec::with_capacity(self.content_methods.len());
        let mut current = plain;
        for config in &self.content_methods {
            unpack_sizes.push(current.len() as u64);
            let (encoded, properties) = encode_stage(config, &current)?;
            coders.push((config.method.id(), properties));
            current = encoded;
        }

        self.inner.write_all(&current).map_err(Error::io)?;
        entry.compressed_size = current.len() as u64;
        self.folders.push(FolderRecord {
            coders,
            unpack_sizes,
            crc,
            pack_size: current.len() as u64,
        });
        self.entries.push(entry);
        Ok(())
    }

    /// Emits the header, patches the start header and returns the sink.
    pub fn finish(mut self) -> Result<W> {
        if self.finished {
            return Err(Error::invalid("7z writer already finished"));
        }
        self.finished = true;

        let header_pos = self.inner.stream_position().map_err(Error::io)?;
        let header = self.build_header();
        self.inner.write_all(&header).map_err(Error::io)?;

        // Start header: offset/size/CRC of the header we just wrote, with
        // its own CRC in front.
        let mut start = Vec::with_capacity(20);
        start.extend_from_slice(&(header_pos - SIGNATURE_HEADER_SIZE).to_le_bytes());
        start.extend_from_slice(&(header.len() as u64).to_le_bytes());
        start.extend_from_slice(&crc32fast::hash(&header).to_le_bytes());
        let start_crc = crc32fast::hash(&start);

        self.inner.seek(SeekFrom::Start(8)).map_err(Error::io)?;
        self.inner
            .write_all(&start_crc.to_le_bytes())
            .map_err(Error::io)?;
        self.inner.write_all(&start).map_err(Error::io)?;
        self.inner.flush().map_err(Error::io)?;
        Ok(self.inner)
    }

    fn build_header(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(K_HEADER);

        if !self.folders.is_empty() {
            out.push(K_MAIN_STREAMS_INFO);

            out.push(K_PACK_INFO);
            write_number(&mut out, 0); // pack position
            write_number(&mut out, self.folders.len() as u64);
            out.push(K_SIZE);
            for folder in &self.folders {
                write_number(&mut out, folder.pack_size);
            }
            out.push(K_END);

            out.push(K_UNPACK_INFO);
            out.push(K_FOLDER);
            write_number(&mut out, self.folders.len() as u64);
            out.push(0); // not external
            for folder in &self.folders {
                write_number(&mut out, folder.coders.len() as u64);
                for (id, properties) in &folder.coders {
                    let mut flags = id.len() as u8;
                    if !properties.is_empty() {
                        flags |= 0x20;
                    }
                    out.push(flags);
                    out.extend_from_slice(id);
                    if !properties.is_empty() {
                        write_number(&mut out, properties.len() as u64);
                        out.extend_from_slice(properties);
                    }
                }
                // Chain bind pairs: coder i+1's output feeds coder i's input.
                for i in 0..folder.coders.len().saturating_sub(1) {
                    write_number(&mut out, i as u64);
                    write_number(&mut out, i as u64 + 1);
                }
            }
            out.push(K_CODERS_UNPACK_SIZE);
            for folder in &self.folders {
                for &size in &folder.unpack_sizes {
                    write_number(&mut out, size);
                }
            }
            out.push(K_CRC);
            out.push(1); // all defined
            for folder in &self.folders {
                out.extend_from_slice(&folder.crc.to_le_bytes());
            }
            out.push(K_END);

            out.push(K_SUB_STREAMS_INFO);
            out.push(K_END);

            out.push(K_END);
        }

        out.push(K_FILES_INFO);
        write_number(&mut out, self.entries.len() as u64);

        let empty_count = self.entries.iter().filter(|e| !e.has_stream).count();
        if empty_count > 0 {
            let mut empty_streams = BitSet::with_capacity(self.entries.len());
            for (i, entry) in self.entries.iter().enumerate() {
                if !entry.has_stream {
                    empty_streams.insert(i);
                }
            }
            let mut payload = Vec::new();
            write_bits(&mut payload, &empty_streams, self.entries.len()).expect("vec write");
            out.push(K_EMPTY_STREAM);
            write_number(&mut out, payload.len() as u64);
            out.extend_from_slice(&payload);

            // Among the empty-stream entries, flag the plain files.
            let empties: Vec<&SevenZEntry> = self
                .entries
                .iter()
                .filter(|e| !e.has_stream)
                .collect();
            if empties.iter().any(|e| !e.is_directory) {
                let mut empty_files = BitSet::with_capacity(empties.len());
                for (i, entry) in empties.iter().enumerate() {
                    if !entry.is_directory {
                        empty_files.insert(i);
                    }
                }
                let mut payload = Vec::new();
                write_bits(&mut payload, &empty_files, empties.len()).expect("vec write");
                out.push(K_EMPTY_FILE);
                write_number(&mut out, payload.len() as u64);
                out.extend_from_slice(&payload);
            }
        }

        // Names: external flag plus NUL-terminated UTF-16LE strings.
        let mut names = vec![0u8];
        for entry in &self.entries {
            for unit in entry.name.encode_utf16() {
                names.extend_from_slice(&unit.to_le_bytes());
            }
            names.extend_from_slice(&[0, 0]);
        }
        out.push(K_NAME);
        write_number(&mut out, names.len() as u64);
        out.extend_from_slice(&names);

        if self.entries.iter().any(|e| e.last_modified.is_some()) {
            self.write_times(&mut out, K_M_TIME, |e| e.last_modified.map(u64::from));
        }
        if self.entries.iter().any(|e| e.windows_attributes.is_some()) {
            self.write_attributes(&mut out);
        }

        out.push(K_END); // files info
        out.push(K_END); // header
        out
    }

    fn write_times(
        &self,
        out: &mut Vec<u8>,
        nid: u8,
        get: impl Fn(&SevenZEntry) -> Option<u64>,
    ) {
        let defined: Vec<bool> = self.entries.iter().map(|e| get(e).is_some()).collect();
        let all = defined.iter().all(|&d| d);

        let mut payload = Vec::new();
        if all {
            payload.push(1);
        } else {
            payload.push(0);
            let mut bits = BitSet::with_capacity(defined.len());
            for (i, &d) in defined.iter().enumerate() {
                if d {
                    bits.insert(i);
                }
            }
            write_bits(&mut payload, &bits, defined.len()).expect("vec write");
        }
        payload.push(0); // not external
        for entry in &self.entries {
            if let Some(value) = get(entry) {
                payload.extend_from_slice(&value.to_le_bytes());
            }
        }
        out.push(nid);
        write_number(out, payload.len() as u64);
        out.extend_from_slice(&payload);
    }

    fn write_attributes(&self, out: &mut Vec<u8>) {
        let defined: Vec<bool> = self
            .entries
            .iter()
            .map(|e| e.windows_attributes.is_some())
            .collect();
        let all = defined.iter().all(|&d| d);

        let mut payload = Vec::new();
        if all {
            payload.push(1);
        } else {
            payload.push(0);
            let mut bits = BitSet::with_capacity(defined.len());
            for (i, &d) in defined.iter().enumerate() {
                if d {
                    bits.insert(i);
                }
            }
            write_bits(&mut payload, &bits, defined.len()).expect("vec write");
        }
        payload.push(0); // not external
        for entry in &self.entries {
            if let Some(attributes) = entry.windows_attributes {
                payload.extend_from_slice(&attributes.to_le_bytes());
            }
        }
        out.push(K_WIN_ATTRIBUTES);
        write_number(out, payload.len() as u64);
        out.extend_from_slice(&payload);
    }
}

/// The 7z variable-length number encoding, inverse of the reader's.
pub(crate) fn write_number(out: &mut Vec<u8>, value: u64) {
    let mut first = 0u8;
    let mut mask = 0x80u8;
    let mut extra = 0usize;
    while extra < 8 {
        if value < 1u64 << (7 * (extra + 1)) {
            first |= (value >> (8 * extra)) as u8;
            break;
        }
        first |= mask;
        mask >>= 1;
        extra += 1;
    }
    out.push(first);
    for i in 0..extra {
        out.push((value >> (8 * i)) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::super::reader::read_number;
    use super::*;

    #[test]
    fn number_roundtrip() {
        for value in [0u64, 1, 0x7F, 0x80, 0x134, 0xFFFF, 1 << 30, u64::MAX] {
            let mut buf = Vec::new();
            write_number(&mut buf, value);
            assert_eq!(read_number(&mut buf.as_slice()).unwrap(), value, "{value:#x}");
        }
    }
}
