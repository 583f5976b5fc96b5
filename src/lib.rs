//! Multi-format archive and compression codec library written in pure Rust.
//!
//! Two families of building blocks compose into pipelines: archive
//! containers group named entries into one byte stream, and codecs
//! transform byte streams. A reader chain goes byte source → decompressor →
//! archive reader; writing mirrors it.
//!
//! ## Containers
//!
//! | Format | Read | Write | Random access |
//! |--------|------|-------|---------------|
//! | TAR (v7/ustar/pax/GNU) | ✓ | ✓ | ✓ |
//! | ZIP (+ZIP64)           | ✓ | ✓ | ✓ |
//! | 7z                     | ✓ | ✓ | ✓ |
//! | AR (BSD/GNU)           | ✓ | ✓ |   |
//! | CPIO (bin/odc/newc/crc)| ✓ | ✓ |   |
//! | ARJ                    | ✓ |   |   |
//! | DUMP (4.4BSD)          | ✓ |   |   |
//! | LHA (levels 0–3)       | ✓ |   |   |
//!
//! ## Codecs
//!
//! | Codec | Decompression | Compression |
//! |-------|---------------|-------------|
//! | DEFLATE / zlib | ✓ | ✓ |
//! | GZIP (multi-member) | ✓ | ✓ |
//! | BZip2 | ✓ | ✓ |
//! | LZMA / LZMA2 / XZ | ✓ | ✓ |
//! | Snappy (raw + framed) | ✓ | ✓ |
//! | LZ4 (block + framed) | ✓ | ✓ |
//! | Zstandard (*) | ✓ | ✓ |
//! | Brotli (*) | ✓ | ✓ |
//! | Pack200 (bridge) | ✓ | ✓ |
//!
//! (*) Behind an optional cargo feature.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod archive;
pub mod codec;

mod bitio;
mod changeset;
mod crc;
mod detect;
mod encoding;
mod error;
mod extract;
mod fields;
mod password;
mod scatter;
mod time;

pub use archive::{ArchiveEntry, EntryReader, EntryWriter};
pub use bitio::{BitOrder, BitReader, BitWriter};
pub use changeset::{Change, ChangeSet, ChangeSetPerformer, ChangeSetResults};
pub use crc::{Crc16, Crc32C, Crc64, XxHash32};
pub use detect::{Format, detect};
pub use encoding::EntryEncoding;
pub use error::{Error, Result, Zip64Reason};
pub use extract::{default_extract_entry, extract, extract_with, sanitize_extract_path};
pub use password::Password;
pub use scatter::{
    FileBackingStore, InMemoryBackingStore, ParallelScatterCreator, ScatterGatherBackingStore,
};
pub use time::{DosTime, NtTime, NtTimeError};
