use std::io::{Cursor, Write};

use omniarc::archive::tar::{TarEntry, TarWriter, TarReader};
use omniarc::{EntryWriter, Error, extract};

fn archive_with(names: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = TarWriter::new(Vec::new());
    for (name, body) in names {
        if name.ends_with('/') {
            writer.put_entry(&TarEntry::new_directory(*name)).unwrap();
            writer.close_entry().unwrap();
        } else {
            let entry = TarEntry::new_file(*name, body.len() as u64);
            writer.put_entry(&entry).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            writer.close_entry().unwrap();
        }
    }
    writer.finish().unwrap();
    writer.into_inner().unwrap()
}

#[test]
fn extracts_files_and_directories() {
    let bytes = archive_with(&[
        ("docs/", ""),
        ("docs/a.txt", "alpha"),
        ("top.txt", "beta"),
    ]);
    let dir = tempfile::tempdir().expect("tempdir");

    let mut reader = TarReader::new(Cursor::new(bytes));
    let written = extract(&mut reader, dir.path()).expect("extract");
    assert_eq!(written.len(), 3);

    assert!(dir.path().join("docs").is_dir());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("docs/a.txt")).unwrap(),
        "alpha"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("top.txt")).unwrap(),
        "beta"
    );
}

#[test]
fn path_escape_fails_before_writing_anything() {
    let bytes = archive_with(&[("../evil", "nope"), ("fine.txt", "ok")]);
    let dir = tempfile::tempdir().expect("tempdir");

    let mut reader = TarReader::new(Cursor::new(bytes));
    let err = extract(&mut reader, dir.path()).unwrap_err();
    assert!(matches!(err, Error::PathEscape { .. }));

    // Nothing may have leaked out of (or into) the target directory.
    let leaked = dir.path().parent().unwrap().join("evil");
    assert!(!leaked.exists());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn extraction_is_idempotent() {
    let bytes = archive_with(&[("dir/", ""), ("dir/data.txt", "same content")]);
    let dir = tempfile::tempdir().expect("tempdir");

    for _ in 0..2 {
        let mut reader = TarReader::new(Cursor::new(bytes.clone()));
        extract(&mut reader, dir.path()).expect("extract");
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("dir/data.txt")).unwrap(),
        "same content"
    );
    // Exactly the archive's contents, nothing extra.
    let top: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(top.len(), 1);
}

#[test]
fn absolute_entry_names_are_refused() {
    let bytes = archive_with(&[("/etc/passwd", "root:x")]);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut reader = TarReader::new(Cursor::new(bytes));
    // The tar writer stores the name verbatim; extraction must refuse it.
    let result = extract(&mut reader, dir.path());
    assert!(matches!(result, Err(Error::PathEscape { .. })));
}
