//! Random-access TAR reader.

use std::io::{Read, Seek, SeekFrom};

use super::entry::TarEntry;
use super::reader::TarReader;
use crate::archive::{BoundedReader, EntryReader};
use crate::encoding::EntryEncoding;
use crate::{Error, Result};

/// A TAR over seekable input: one scan builds the directory, then payloads
/// open in any order.
pub struct TarFile<R: Read + Seek> {
    inner: R,
    entries: Vec<TarEntry>,
    payload_offsets: Vec<u64>,
}

impl<R: Read + Seek> TarFile<R> {
    /// Scans the archive and indexes every entry.
    pub fn new(inner: R) -> Result<Self> {
        Self::with_encoding(inner, EntryEncoding::UTF_8)
    }

    /// Scans with an explicit name encoding.
    pub fn with_encoding(mut inner: R, encoding: EntryEncoding) -> Result<Self> {
        inner.seek(SeekFrom::Start(0)).map_err(Error::io)?;
        let mut entries = Vec::new();
        let mut payload_offsets = Vec::new();
        {
            let mut reader = TarReader::with_encoding(&mut inner, encoding);
            while let Some(entry) = reader.next_entry()? {
                payload_offsets.push(reader.stream_position());
                entries.push(entry);
            }
        }
        Ok(Self {
            inner,
            entries,
            payload_offsets,
        })
    }

    /// The entries in archive order.
    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    /// Finds an entry by exact name.
    pub fn entry(&self, name: &str) -> Option<(usize, &TarEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.name == name)
    }

    /// Opens a fresh payload reader for the entry at `index`.
    ///
    /// Sparse entries are indexed but must be read through the streaming
    /// [`TarReader`], which expands their hole map.
    pub fn input_stream(&mut self, index: usize) -> Result<impl Read + '_> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::invalid("tar entry index out of range"))?;
        if !entry.sparse.is_empty() {
            return Err(Error::unsupported(
                "random access into sparse tar entries",
            ));
        }
        self.inner
            .seek(SeekFrom::Start(self.payload_offsets[index]))
            .map_err(Error::io)?;
        Ok(BoundedReader::new(&mut self.inner, entry.size))
    }

    /// Returns the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
