//! Pack200 container plumbing.
//!
//! Pack200 itself lives outside this crate; callers supply the actual
//! packer/unpacker through [`Pack200Adapter`]. This module contributes the
//! buffering the adapter needs: the JAR (or pack stream) is staged either in
//! memory or in a temporary file before the adapter runs over it.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::{Error, Result};

/// Magic number of a pack200 stream.
pub const PACK200_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xD0, 0x0D];

/// Where intermediate data is staged while packing or unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pack200Strategy {
    /// Buffer in memory; fastest, unbounded memory.
    #[default]
    InMemory,
    /// Buffer in an unlinked temporary file.
    TempFile,
}

impl Pack200Strategy {
    fn new_store(self) -> Result<StagingStore> {
        Ok(match self {
            Self::InMemory => StagingStore::Memory(Cursor::new(Vec::new())),
            Self::TempFile => StagingStore::File(tempfile::tempfile().map_err(Error::io)?),
        })
    }
}

/// The packer/unpacker bridge. Implementations wrap an external Pack200
/// engine; both directions work stream-to-stream.
pub trait Pack200Adapter {
    /// Converts a JAR stream into a pack200 stream.
    fn pack(&self, jar: &mut dyn Read, pack: &mut dyn Write) -> Result<()>;

    /// Converts a pack200 stream back into a JAR stream.
    fn unpack(&self, pack: &mut dyn Read, jar: &mut dyn Write) -> Result<()>;
}

enum StagingStore {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

impl StagingStore {
    fn rewind(&mut self) -> Result<()> {
        match self {
            Self::Memory(cursor) => cursor.set_position(0),
            Self::File(file) => {
                file.seek(SeekFrom::Start(0)).map_err(Error::io)?;
            }
        }
        Ok(())
    }
}

impl Write for StagingStore {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.write(buf),
            Self::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Memory(cursor) => cursor.flush(),
            Self::File(file) => file.flush(),
        }
    }
}

impl Read for StagingStore {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::File(file) => file.read(buf),
        }
    }
}

/// Unpacks a pack200 stream into a JAR, staged per the chosen strategy, and
/// streams the resulting JAR bytes.
pub struct Pack200Reader {
    jar: StagingStore,
}

impl Pack200Reader {
    /// Runs the adapter's unpacker over `pack` eagerly.
    pub fn new<R: Read>(
        mut pack: R,
        adapter: &dyn Pack200Adapter,
        strategy: Pack200Strategy,
    ) -> Result<Self> {
        let mut jar = strategy.new_store()?;
        adapter.unpack(&mut pack, &mut jar)?;
        jar.rewind()?;
        Ok(Self { jar })
    }
}

impl Read for Pack200Reader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.jar.read(buf)
    }
}

/// Accepts a JAR stream, stages it, and runs the adapter's packer when
/// finished.
pub struct Pack200Writer<'a, W: Write> {
    inner: W,
    adapter: &'a dyn Pack200Adapter,
    jar: StagingStore,
}

impl<'a, W: Write> Pack200Writer<'a, W> {
    /// Creates a writer staging through the chosen strategy.
    pub fn new(inner: W, adapter: &'a dyn Pack200Adapter, strategy: Pack200Strategy) -> Result<Self> {
        Ok(Self {
            inner,
            adapter,
            jar: strategy.new_store()?,
        })
    }

    /// Packs the staged JAR into the inner writer and returns it.
    pub fn finish(mut self) -> Result<W> {
        self.jar.rewind()?;
        self.adapter.pack(&mut self.jar, &mut self.inner)?;
        self.inner.flush().map_err(Error::io)?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Pack200Writer<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.jar.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.jar.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in engine that reverses bytes, enough to exercise the staging.
    struct ReversingAdapter;

    impl Pack200Adapter for ReversingAdapter {
        fn pack(&self, jar: &mut dyn Read, pack: &mut dyn Write) -> Result<()> {
            let mut data = Vec::new();
            jar.read_to_end(&mut data)?;
            data.reverse();
            pack.write_all(&data)?;
            Ok(())
        }

        fn unpack(&self, pack: &mut dyn Read, jar: &mut dyn Write) -> Result<()> {
            self.pack(pack, jar)
        }
    }

    #[test]
    fn roundtrip_through_both_strategies() {
        for strategy in [Pack200Strategy::InMemory, Pack200Strategy::TempFile] {
            let mut writer = Pack200Writer::new(Vec::new(), &ReversingAdapter, strategy).unwrap();
            writer.write_all(b"jar bytes").unwrap();
            let packed = writer.finish().unwrap();
            assert_eq!(packed, b"setyb raj");

            let mut reader =
                Pack200Reader::new(packed.as_slice(), &ReversingAdapter, strategy).unwrap();
            let mut unpacked = Vec::new();
            reader.read_to_end(&mut unpacked).unwrap();
            assert_eq!(unpacked, b"jar bytes");
        }
    }
}
