use std::io::{Cursor, Read, Write};

use omniarc::archive::ar::{ArEntry, ArLongFileMode, ArReader, ArWriter};
use omniarc::{EntryReader, EntryWriter, Error};

fn roundtrip(mode: ArLongFileMode, names: &[&str]) -> Vec<(String, Vec<u8>)> {
    let mut writer = ArWriter::with_mode(Vec::new(), mode);
    for (i, name) in names.iter().enumerate() {
        let body = format!("member {i}");
        let mut entry = ArEntry::new(*name, body.len() as u64);
        entry.mtime = 1_600_000_000;
        entry.uid = 1000;
        entry.gid = 100;
        writer.put_entry(&entry).expect("header");
        writer.write_all(body.as_bytes()).expect("payload");
        writer.close_entry().expect("close");
    }
    writer.finish().expect("finish");
    let bytes = writer.into_inner().expect("inner");
    assert_eq!(&bytes[..8], b"!<arch>\n");

    let mut reader = ArReader::new(Cursor::new(bytes));
    let mut out = Vec::new();
    while let Some(entry) = reader.next_entry().expect("advance") {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).expect("payload");
        out.push((entry.name.clone(), data));
    }
    out
}

#[test]
fn short_names_roundtrip() {
    let entries = roundtrip(ArLongFileMode::Error, &["a.o", "libfoo.o"]);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "a.o");
    assert_eq!(entries[0].1, b"member 0");
    assert_eq!(entries[1].0, "libfoo.o");
}

#[test]
fn error_mode_refuses_long_names() {
    let mut writer = ArWriter::new(Vec::new());
    let entry = ArEntry::new("a-name-well-over-sixteen-bytes.o", 0);
    assert!(matches!(
        writer.put_entry(&entry),
        Err(Error::TooLong { .. })
    ));
}

#[test]
fn bsd_long_names_roundtrip() {
    let entries = roundtrip(
        ArLongFileMode::Bsd,
        &["short.o", "a-name-well-over-sixteen-bytes.o"],
    );
    assert_eq!(entries[1].0, "a-name-well-over-sixteen-bytes.o");
    assert_eq!(entries[1].1, b"member 1");
}

#[test]
fn gnu_long_names_roundtrip() {
    let entries = roundtrip(
        ArLongFileMode::Gnu,
        &["short.o", "another-name-over-sixteen-bytes.o", "third.o"],
    );
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec!["short.o", "another-name-over-sixteen-bytes.o", "third.o"]
    );
    // Payloads survive the buffered GNU layout.
    assert_eq!(entries[2].1, b"member 2");
}

#[test]
fn odd_payloads_align_with_newline() {
    let mut writer = ArWriter::new(Vec::new());
    let entry = ArEntry::new("odd.o", 3);
    writer.put_entry(&entry).expect("header");
    writer.write_all(b"abc").expect("payload");
    writer.close_entry().expect("close");
    let entry = ArEntry::new("next.o", 2);
    writer.put_entry(&entry).expect("header");
    writer.write_all(b"de").expect("payload");
    writer.close_entry().expect("close");
    writer.finish().expect("finish");
    let bytes = writer.into_inner().expect("inner");

    // The alignment byte after the odd payload.
    assert_eq!(bytes[8 + 60 + 3], b'\n');

    let mut reader = ArReader::new(Cursor::new(bytes));
    let first = reader.next_entry().expect("advance").expect("present");
    assert_eq!(first.size, 3);
    let mut data = Vec::new();
    reader.read_to_end(&mut data).expect("payload");
    assert_eq!(data, b"abc");
    let second = reader.next_entry().expect("advance").expect("present");
    assert_eq!(second.name, "next.o");
}
