//! Archive containers.
//!
//! Streaming readers present a lazy sequence of entries: `next_entry`
//! advances and returns the next header, and the reader itself is the
//! [`Read`] view of the current payload. Writers take the mirrored shape:
//! `put_entry` fixes a header, `write` supplies payload, `close_entry`
//! seals it, `finish` emits the trailer.

pub mod ar;
pub mod arj;
pub mod cpio;
pub mod dump;
pub mod lha;
pub mod sevenz;
pub mod tar;
pub mod zip;

use std::io::Read;

use crate::Result;

/// Common surface of one archived file or directory.
pub trait ArchiveEntry {
    /// Path-segmented entry name.
    fn name(&self) -> &str;

    /// Uncompressed payload size; `None` when unknowable before streaming.
    fn size(&self) -> Option<u64>;

    /// Whether this entry names a directory.
    fn is_directory(&self) -> bool;

    /// Modification time, Unix epoch seconds.
    fn last_modified(&self) -> i64;
}

/// A streaming archive reader: advance with [`EntryReader::next_entry`],
/// read the current payload through [`Read`].
pub trait EntryReader: Read {
    /// The format's entry type.
    type Entry: ArchiveEntry;

    /// Advances to the next entry, discarding any unread payload. Returns
    /// `None` once the terminator has been reached.
    fn next_entry(&mut self) -> Result<Option<Self::Entry>>;
}

/// A streaming archive writer.
pub trait EntryWriter: std::io::Write {
    /// The format's entry type.
    type Entry: ArchiveEntry;

    /// Fixes the header of the next entry. Payload bytes follow via `write`.
    fn put_entry(&mut self, entry: &Self::Entry) -> Result<()>;

    /// Seals the current entry, validating the payload length.
    fn close_entry(&mut self) -> Result<()>;

    /// Emits the trailer. No further entries may be written.
    fn finish(&mut self) -> Result<()>;
}

/// Streaming-reader lifecycle. `Failed` is terminal; every public operation
/// checks it first so a reader cannot resume after a format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderState {
    Init,
    HaveHeader,
    InPayload,
    BetweenEntries,
    Ended,
    Failed,
}

impl ReaderState {
    /// Whether `next_entry` is legal in this state.
    pub(crate) fn can_advance(self) -> bool {
        matches!(
            self,
            Self::Init | Self::HaveHeader | Self::InPayload | Self::BetweenEntries | Self::Ended
        )
    }

    /// Whether payload reads deliver data in this state.
    pub(crate) fn in_payload(self) -> bool {
        matches!(self, Self::InPayload | Self::HaveHeader)
    }
}

/// Reads at most `remain` bytes from the inner reader.
pub(crate) struct BoundedReader<R: Read> {
    inner: R,
    remain: u64,
}

impl<R: Read> BoundedReader<R> {
    pub(crate) fn new(inner: R, max_size: u64) -> Self {
        Self {
            inner,
            remain: max_size,
        }
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remain == 0 {
            return Ok(0);
        }
        let limit = (self.remain.min(buf.len() as u64)) as usize;
        let size = self.inner.read(&mut buf[..limit])?;
        self.remain -= size as u64;
        Ok(size)
    }
}

/// Discards exactly `count` bytes, failing on early end of stream.
pub(crate) fn skip_fully<R: Read>(reader: &mut R, mut count: u64) -> std::io::Result<()> {
    let mut scratch = [0u8; 4096];
    while count > 0 {
        let take = count.min(scratch.len() as u64) as usize;
        let n = reader.read(&mut scratch[..take])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                crate::Error::Truncated,
            ));
        }
        count -= n as u64;
    }
    Ok(())
}
