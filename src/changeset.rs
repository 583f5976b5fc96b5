//! Archive transformation through a change set.
//!
//! Mutation happens by streaming a source archive into a destination writer
//! while an ordered set of add and delete operations is applied; nothing is
//! rewritten in place, and no entry ever appears twice in the output.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use crate::archive::{ArchiveEntry, EntryReader, EntryWriter};
use crate::{Error, Result};

/// One operation of a change set.
pub enum Change<E> {
    /// Remove the entry whose name matches exactly.
    Delete(String),
    /// Remove the named entry and everything beneath it.
    DeleteDir(String),
    /// Add an entry with the given payload. With `replace` set the entry
    /// supersedes any same-named source entry; without it, a source entry
    /// of the same name wins.
    Add {
        /// The entry to add.
        entry: E,
        /// Its payload.
        data: Vec<u8>,
        /// Whether the addition supersedes a same-named source entry.
        replace: bool,
    },
}

/// An ordered collection of changes.
pub struct ChangeSet<E> {
    changes: Vec<Change<E>>,
}

impl<E> Default for ChangeSet<E> {
    fn default() -> Self {
        Self {
            changes: Vec::new(),
        }
    }
}

impl<E> ChangeSet<E> {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an exact-name deletion.
    pub fn delete(&mut self, name: impl Into<String>) -> &mut Self {
        self.changes.push(Change::Delete(name.into()));
        self
    }

    /// Schedules a recursive deletion.
    pub fn delete_dir(&mut self, name: impl Into<String>) -> &mut Self {
        self.changes.push(Change::DeleteDir(name.into()));
        self
    }

    /// Schedules an addition that replaces any same-named source entry.
    pub fn add(&mut self, entry: E, data: Vec<u8>) -> &mut Self {
        self.changes.push(Change::Add {
            entry,
            data,
            replace: true,
        });
        self
    }

    /// Schedules an addition that yields to a same-named source entry.
    pub fn add_if_absent(&mut self, entry: E, data: Vec<u8>) -> &mut Self {
        self.changes.push(Change::Add {
            entry,
            data,
            replace: false,
        });
        self
    }
}

/// Names affected by a performed change set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSetResults {
    /// Entries written from the change set's additions.
    pub added_from_change_set: BTreeSet<String>,
    /// Entries copied through from the source.
    pub added_from_stream: BTreeSet<String>,
    /// Source entries dropped by deletions or replacement.
    pub deleted: BTreeSet<String>,
}

/// Applies a change set in a single pass over the source.
pub struct ChangeSetPerformer<E> {
    changes: Vec<Change<E>>,
}

impl<E: ArchiveEntry> ChangeSetPerformer<E> {
    /// Wraps a change set for execution.
    pub fn new(change_set: ChangeSet<E>) -> Self {
        Self {
            changes: change_set.changes,
        }
    }

    /// Streams `reader` into `writer` with the changes applied.
    pub fn perform<Rd, Wr>(&self, reader: &mut Rd, writer: &mut Wr) -> Result<ChangeSetResults>
    where
        Rd: EntryReader<Entry = E>,
        Wr: EntryWriter<Entry = E>,
    {
        let mut results = ChangeSetResults::default();
        let mut written: BTreeSet<String> = BTreeSet::new();

        // Replacing additions go first; they also shadow source entries.
        for change in &self.changes {
            if let Change::Add {
                entry,
                data,
                replace: true,
            } = change
            {
                let name = entry.name().to_string();
                if written.insert(name.clone()) {
                    write_entry(writer, entry, data)?;
                    results.added_from_change_set.insert(name);
                }
            }
        }

        // One pass over the source.
        while let Some(entry) = reader.next_entry()? {
            let name = entry.name().to_string();
            if written.contains(&name) || self.is_deleted(&name) {
                results.deleted.insert(name);
                continue;
            }
            writer.put_entry(&entry)?;
            std::io::copy(reader, writer).map_err(Error::io)?;
            writer.close_entry()?;
            written.insert(name.clone());
            results.added_from_stream.insert(name);
        }

        // Non-replacing additions fill the remaining gaps.
        for change in &self.changes {
            if let Change::Add {
                entry,
                data,
                replace: false,
            } = change
            {
                let name = entry.name().to_string();
                if written.insert(name.clone()) {
                    write_entry(writer, entry, data)?;
                    results.added_from_change_set.insert(name);
                }
            }
        }

        writer.finish()?;
        Ok(results)
    }

    fn is_deleted(&self, name: &str) -> bool {
        self.changes.iter().any(|change| match change {
            Change::Delete(target) => name == target,
            Change::DeleteDir(target) => {
                name == target
                    || name
                        .strip_prefix(target.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
                    || target
                        .strip_suffix('/')
                        .is_some_and(|trimmed| {
                            name == trimmed
                                || name
                                    .strip_prefix(trimmed)
                                    .is_some_and(|rest| rest.starts_with('/'))
                        })
            }
            Change::Add { .. } => false,
        })
    }
}

fn write_entry<Wr, E>(writer: &mut Wr, entry: &E, data: &[u8]) -> Result<()>
where
    Wr: EntryWriter<Entry = E>,
    E: ArchiveEntry,
{
    writer.put_entry(entry)?;
    writer.write_all(data).map_err(Error::io)?;
    writer.close_entry()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::archive::tar::{TarEntry, TarReader, TarWriter};

    fn sample_archive() -> Vec<u8> {
        let mut writer = TarWriter::new(Vec::new());
        for (name, body) in [
            ("keep.txt", "keep me"),
            ("drop.txt", "drop me"),
            ("dir/a.txt", "nested a"),
            ("dir/b.txt", "nested b"),
            ("replace.txt", "old content"),
        ] {
            let entry = TarEntry::new_file(name, body.len() as u64);
            writer.put_entry(&entry).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            writer.close_entry().unwrap();
        }
        writer.finish().unwrap();
        writer.into_inner().unwrap()
    }

    fn perform(changes: ChangeSet<TarEntry>) -> (ChangeSetResults, Vec<(String, Vec<u8>)>) {
        let source = sample_archive();
        let mut reader = TarReader::new(Cursor::new(source));
        let mut writer = TarWriter::new(Vec::new());
        let results = ChangeSetPerformer::new(changes)
            .perform(&mut reader, &mut writer)
            .unwrap();

        let out = writer.into_inner().unwrap();
        let mut check = TarReader::new(Cursor::new(out));
        let mut entries = Vec::new();
        while let Some(entry) = check.next_entry().unwrap() {
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut check, &mut data).unwrap();
            entries.push((entry.name.clone(), data));
        }
        (results, entries)
    }

    #[test]
    fn deletes_and_delete_dirs_drop_entries() {
        let mut changes = ChangeSet::new();
        changes.delete("drop.txt").delete_dir("dir");
        let (results, entries) = perform(changes);

        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["keep.txt", "replace.txt"]);
        assert!(results.deleted.contains("drop.txt"));
        assert!(results.deleted.contains("dir/a.txt"));
        assert!(results.deleted.contains("dir/b.txt"));
        assert_eq!(results.added_from_stream.len(), 2);
    }

    #[test]
    fn replacing_add_supersedes_the_source() {
        let mut changes = ChangeSet::new();
        changes.add(
            TarEntry::new_file("replace.txt", 11),
            b"new content".to_vec(),
        );
        let (results, entries) = perform(changes);

        let replaced = entries
            .iter()
            .find(|(n, _)| n == "replace.txt")
            .expect("entry present");
        assert_eq!(replaced.1, b"new content");
        assert_eq!(
            entries.iter().filter(|(n, _)| n == "replace.txt").count(),
            1,
            "no entry may appear twice"
        );
        assert!(results.added_from_change_set.contains("replace.txt"));
        assert!(results.deleted.contains("replace.txt"));
    }

    #[test]
    fn non_replacing_add_yields_to_the_source() {
        let mut changes = ChangeSet::new();
        changes.add_if_absent(
            TarEntry::new_file("replace.txt", 6),
            b"ignore".to_vec(),
        );
        changes.add_if_absent(TarEntry::new_file("fresh.txt", 5), b"fresh".to_vec());
        let (results, entries) = perform(changes);

        let kept = entries
            .iter()
            .find(|(n, _)| n == "replace.txt")
            .expect("entry present");
        assert_eq!(kept.1, b"old content");
        assert!(entries.iter().any(|(n, _)| n == "fresh.txt"));
        assert_eq!(results.added_from_change_set.len(), 1);
    }

    #[test]
    fn repeated_application_is_deterministic() {
        let run = || {
            let mut changes = ChangeSet::new();
            changes.delete("drop.txt");
            changes.add(TarEntry::new_file("x.txt", 1), b"x".to_vec());
            let source = sample_archive();
            let mut reader = TarReader::new(Cursor::new(source));
            let mut writer = TarWriter::new(Vec::new());
            ChangeSetPerformer::new(changes)
                .perform(&mut reader, &mut writer)
                .unwrap();
            writer.into_inner().unwrap()
        };
        assert_eq!(run(), run());
    }
}
