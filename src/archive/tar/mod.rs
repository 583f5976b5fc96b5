//! TAR archives: v7, ustar, pax and the GNU extensions.
//!
//! Entries live on 512-byte record boundaries. The reader resolves GNU
//! long-name/long-link entries, pax local and global headers, and both the
//! old GNU and pax-1.0 sparse layouts before handing an entry out. The
//! writer promotes over-long names and over-range numbers according to its
//! configured modes.

mod entry;
mod file;
mod header;
mod pax;
mod reader;
mod writer;

pub use entry::{SparseSegment, TarEntry, TypeFlag};
pub use file::TarFile;
pub use reader::TarReader;
pub use writer::{BigNumberMode, LongFileMode, TarWriter, TarWriterOptions};

pub(crate) const RECORD_SIZE: usize = 512;

pub(crate) const MAGIC_OFFSET: usize = 257;
/// POSIX "ustar\0" magic plus version "00".
pub(crate) const POSIX_MAGIC: &[u8; 8] = b"ustar\x0000";
/// GNU "ustar  \0" spanning the magic and version cells.
pub(crate) const GNU_MAGIC: &[u8; 8] = b"ustar  \x00";

/// Name used by GNU tar for long-name/long-link pseudo entries.
pub(crate) const GNU_LONG_NAME_ENTRY: &str = "././@LongLink";

/// The header dialect an entry was read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TarFormat {
    /// Pre-POSIX v7 header: name only, no magic.
    V7,
    /// POSIX 1003.1-1988 ustar.
    #[default]
    Ustar,
    /// GNU tar with its old header layout.
    Gnu,
}

pub(crate) fn padding_for(size: u64) -> u64 {
    size.div_ceil(RECORD_SIZE as u64) * RECORD_SIZE as u64 - size
}
