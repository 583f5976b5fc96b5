//! Extraction to the filesystem with path-escape protection.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::archive::{ArchiveEntry, EntryReader};
use crate::{Error, Result};

/// Resolves `entry_name` under `target_dir`, refusing any name that would
/// land outside it. Absolute names, drive prefixes and `..` traversal all
/// fail with [`Error::PathEscape`] before anything touches the filesystem.
pub fn sanitize_extract_path(target_dir: &Path, entry_name: &str) -> Result<PathBuf> {
    let escape = || Error::PathEscape {
        entry: entry_name.to_string(),
        target_dir: target_dir.to_path_buf(),
    };

    let mut resolved = PathBuf::new();
    // Archives use '/' but tolerate '\' producers.
    let normalised = entry_name.replace('\\', "/");
    for component in Path::new(&normalised).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    if resolved.as_os_str().is_empty() {
        return Err(escape());
    }
    Ok(target_dir.join(resolved))
}

/// Extracts every entry of a streaming reader into `target_dir`, creating
/// it if needed. Returns the paths written, in archive order.
pub fn extract<R: EntryReader>(reader: &mut R, target_dir: &Path) -> Result<Vec<PathBuf>> {
    extract_with(reader, target_dir, |entry, payload, dest| {
        default_extract_entry(entry, payload, dest)
    })
}

/// Extraction with a custom per-entry handler. The handler receives the
/// sanitised destination; returning `false` stops the walk early.
pub fn extract_with<R, F>(reader: &mut R, target_dir: &Path, mut handler: F) -> Result<Vec<PathBuf>>
where
    R: EntryReader,
    F: FnMut(&R::Entry, &mut dyn Read, &Path) -> Result<bool>,
{
    std::fs::create_dir_all(target_dir)
        .map_err(|e| Error::io_msg(e, "creating the extraction directory"))?;

    let mut written = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        let dest = sanitize_extract_path(target_dir, entry.name())?;
        let more = handler(&entry, reader, &dest)?;
        written.push(dest);
        if !more {
            break;
        }
    }
    Ok(written)
}

/// The default handler: directories are created, files are streamed out and
/// stamped with the entry's modification time.
pub fn default_extract_entry<E: ArchiveEntry>(
    entry: &E,
    payload: &mut dyn Read,
    dest: &Path,
) -> Result<bool> {
    if entry.is_directory() {
        std::fs::create_dir_all(dest).map_err(Error::io)?;
        return Ok(true);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(Error::io)?;
    }
    let mut file = std::fs::File::create(dest)
        .map_err(|e| Error::io_msg(e, dest.to_string_lossy().into_owned()))?;
    std::io::copy(payload, &mut file).map_err(Error::io)?;

    let mtime = entry.last_modified();
    if mtime > 0 {
        let time = std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(mtime as u64);
        let _ = file.set_modified(time);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_resolve_under_the_target() {
        let dest = sanitize_extract_path(Path::new("/tmp/out"), "a/b/c.txt").unwrap();
        assert_eq!(dest, Path::new("/tmp/out/a/b/c.txt"));
    }

    #[test]
    fn dot_segments_collapse() {
        let dest = sanitize_extract_path(Path::new("/tmp/out"), "a/./b/../c.txt").unwrap();
        assert_eq!(dest, Path::new("/tmp/out/a/c.txt"));
    }

    #[test]
    fn traversal_is_refused() {
        let err = sanitize_extract_path(Path::new("/tmp/out"), "../evil").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
        let err = sanitize_extract_path(Path::new("/tmp/out"), "a/../../evil").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[test]
    fn absolute_names_are_refused() {
        assert!(matches!(
            sanitize_extract_path(Path::new("/tmp/out"), "/etc/passwd"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn backslash_separators_normalise() {
        let dest = sanitize_extract_path(Path::new("/tmp/out"), "dir\\file.txt").unwrap();
        assert_eq!(dest, Path::new("/tmp/out/dir/file.txt"));
    }

    #[test]
    fn empty_resolution_is_refused() {
        assert!(sanitize_extract_path(Path::new("/tmp/out"), ".").is_err());
        assert!(sanitize_extract_path(Path::new("/tmp/out"), "a/..").is_err());
    }
}
