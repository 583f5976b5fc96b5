//! Parallel scatter/gather payload store.
//!
//! Workers each fill a private backing store with one entry's (typically
//! pre-compressed) payload; the gather phase replays the stores into a
//! destination writer in submission order, never in completion order.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::archive::{ArchiveEntry, EntryWriter};
use crate::{Error, Result};

/// Sequential payload storage handed to one worker.
///
/// The lifecycle is write → `close_for_writing` → `input_stream`; `release`
/// frees the resources (the file-backed variant holds an unlinked temp
/// file, so dropping it removes the data from disk).
pub trait ScatterGatherBackingStore: Send {
    /// Appends payload bytes.
    fn write_out(&mut self, data: &[u8]) -> Result<()>;

    /// Seals the store; `write_out` is illegal afterwards.
    fn close_for_writing(&mut self) -> Result<()>;

    /// Opens the stored bytes for reading. Legal only after
    /// [`ScatterGatherBackingStore::close_for_writing`].
    fn input_stream(&mut self) -> Result<Box<dyn Read + '_>>;

    /// Releases any held resources.
    fn release(&mut self) -> Result<()>;
}

/// Heap-backed store.
#[derive(Default)]
pub struct InMemoryBackingStore {
    data: Vec<u8>,
    sealed: bool,
}

impl InMemoryBackingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScatterGatherBackingStore for InMemoryBackingStore {
    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::invalid("backing store already sealed"));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close_for_writing(&mut self) -> Result<()> {
        self.sealed = true;
        Ok(())
    }

    fn input_stream(&mut self) -> Result<Box<dyn Read + '_>> {
        if !self.sealed {
            return Err(Error::invalid("backing store still open for writing"));
        }
        Ok(Box::new(self.data.as_slice()))
    }

    fn release(&mut self) -> Result<()> {
        self.data = Vec::new();
        Ok(())
    }
}

/// Store backed by an unlinked temporary file.
pub struct FileBackingStore {
    file: Option<File>,
    sealed: bool,
}

impl FileBackingStore {
    /// Creates a store over a fresh unlinked temp file.
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: Some(tempfile::tempfile().map_err(Error::io)?),
            sealed: false,
        })
    }
}

impl ScatterGatherBackingStore for FileBackingStore {
    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::invalid("backing store already sealed"));
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::invalid("backing store released"))?
            .write_all(data)
            .map_err(Error::io)
    }

    fn close_for_writing(&mut self) -> Result<()> {
        self.sealed = true;
        Ok(())
    }

    fn input_stream(&mut self) -> Result<Box<dyn Read + '_>> {
        if !self.sealed {
            return Err(Error::invalid("backing store still open for writing"));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::invalid("backing store released"))?;
        file.seek(SeekFrom::Start(0)).map_err(Error::io)?;
        Ok(Box::new(file))
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the handle deletes the unlinked file.
        self.file = None;
        Ok(())
    }
}

type Job<E> = (
    E,
    Box<dyn FnOnce(&mut dyn Write) -> std::io::Result<()> + Send>,
);

type StoreSupplier = dyn Fn() -> Result<Box<dyn ScatterGatherBackingStore>> + Sync;

/// Accumulates entry payloads across worker threads, then gathers them in
/// submission order.
pub struct ParallelScatterCreator<E: ArchiveEntry + Send> {
    jobs: Vec<Job<E>>,
    supplier: Box<StoreSupplier>,
}

impl<E: ArchiveEntry + Send> ParallelScatterCreator<E> {
    /// Creates a scatter pool with in-memory stores.
    pub fn new() -> Self {
        Self::with_store_supplier(Box::new(|| Ok(Box::new(InMemoryBackingStore::new()))))
    }

    /// Creates a scatter pool backed by temp files.
    pub fn with_temp_files() -> Self {
        Self::with_store_supplier(Box::new(|| Ok(Box::new(FileBackingStore::new()?))))
    }

    /// Creates a scatter pool with a custom store supplier.
    pub fn with_store_supplier(supplier: Box<StoreSupplier>) -> Self {
        Self {
            jobs: Vec::new(),
            supplier,
        }
    }

    /// Submits an entry; `fill` runs on a worker and produces the payload.
    /// Gather order equals submission order.
    pub fn add<F>(&mut self, entry: E, fill: F)
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()> + Send + 'static,
    {
        self.jobs.push((entry, Box::new(fill)));
    }

    /// Runs the pending jobs on up to `threads` workers and gathers the
    /// payloads into `writer` in submission order.
    pub fn write_to<W>(self, writer: &mut W, threads: usize) -> Result<()>
    where
        W: EntryWriter<Entry = E>,
    {
        let threads = threads.max(1);
        let Self { jobs, supplier } = self;
        let supplier = &supplier;

        let mut slots: Vec<Option<(E, Box<dyn ScatterGatherBackingStore>)>> =
            jobs.iter().map(|_| None).collect();
        let jobs: Vec<(usize, Job<E>)> = jobs.into_iter().enumerate().collect();

        // Fan out: a shared work list, each worker owns one store at a time.
        let work = std::sync::Mutex::new(jobs);
        let results = std::sync::Mutex::new(Vec::new());
        let first_error = std::sync::Mutex::new(None::<Error>);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    loop {
                        let job = work.lock().expect("work lock").pop();
                        let Some((index, (entry, fill))) = job else {
                            return;
                        };
                        let outcome = (|| -> Result<(E, Box<dyn ScatterGatherBackingStore>)> {
                            let mut store = supplier()?;
                            let mut sink = StoreWriter { store: &mut *store };
                            fill(&mut sink).map_err(Error::io)?;
                            store.close_for_writing()?;
                            Ok((entry, store))
                        })();
                        match outcome {
                            Ok(done) => {
                                results.lock().expect("results lock").push((index, done));
                            }
                            Err(e) => {
                                first_error.lock().expect("error lock").get_or_insert(e);
                                return;
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().expect("error lock") {
            return Err(e);
        }
        for (index, done) in results.into_inner().expect("results lock") {
            slots[index] = Some(done);
        }

        // Gather in submission order.
        for slot in &mut slots {
            let (entry, store) = slot.as_mut().expect("all jobs completed");
            writer.put_entry(entry)?;
            {
                let mut payload = store.input_stream()?;
                std::io::copy(&mut payload, writer).map_err(Error::io)?;
            }
            writer.close_entry()?;
            store.release()?;
        }
        Ok(())
    }
}

impl<E: ArchiveEntry + Send> Default for ParallelScatterCreator<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts the store trait to `std::io::Write` for the fill closures.
struct StoreWriter<'a> {
    store: &'a mut dyn ScatterGatherBackingStore,
}

impl Write for StoreWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.store
            .write_out(buf)
            .map_err(Error::into_io)
            .map(|_| buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::archive::EntryReader;
    use crate::archive::tar::{TarEntry, TarReader, TarWriter};

    #[test]
    fn store_lifecycle() {
        for mut store in [
            Box::new(InMemoryBackingStore::new()) as Box<dyn ScatterGatherBackingStore>,
            Box::new(FileBackingStore::new().unwrap()),
        ] {
            store.write_out(b"part one ").unwrap();
            store.write_out(b"part two").unwrap();
            assert!(store.input_stream().is_err(), "read before sealing");
            store.close_for_writing().unwrap();
            assert!(store.write_out(b"late").is_err(), "write after sealing");

            let mut data = Vec::new();
            store.input_stream().unwrap().read_to_end(&mut data).unwrap();
            assert_eq!(data, b"part one part two");
            store.release().unwrap();
        }
    }

    #[test]
    fn gather_preserves_submission_order() {
        let mut creator: ParallelScatterCreator<TarEntry> = ParallelScatterCreator::new();
        for i in 0..16 {
            let body = format!("payload number {i:02}");
            let entry = TarEntry::new_file(format!("file-{i:02}.txt"), body.len() as u64);
            creator.add(entry, move |out| out.write_all(body.as_bytes()));
        }

        let mut writer = TarWriter::new(Vec::new());
        creator.write_to(&mut writer, 4).unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut reader = TarReader::new(Cursor::new(bytes));
        let mut index = 0;
        while let Some(entry) = reader.next_entry().unwrap() {
            assert_eq!(entry.name, format!("file-{index:02}.txt"));
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            assert_eq!(body, format!("payload number {index:02}").into_bytes());
            index += 1;
        }
        assert_eq!(index, 16);
    }

    #[test]
    fn temp_file_stores_work_in_parallel() {
        let mut creator: ParallelScatterCreator<TarEntry> =
            ParallelScatterCreator::with_temp_files();
        for i in 0..4 {
            let body = vec![i as u8; 4096];
            let entry = TarEntry::new_file(format!("blob-{i}"), body.len() as u64);
            creator.add(entry, move |out| out.write_all(&body));
        }
        let mut writer = TarWriter::new(Vec::new());
        creator.write_to(&mut writer, 2).unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut reader = TarReader::new(Cursor::new(bytes));
        let mut count = 0;
        while let Some(_) = reader.next_entry().unwrap() {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            assert_eq!(body.len(), 4096);
            count += 1;
        }
        assert_eq!(count, 4);
    }
}
