use std::io::{Cursor, Read, Write};

use omniarc::archive::zip::{
    CompressionMethod, EntryOrder, Zip64Mode, ZipEntry, ZipFile, ZipReader, ZipWriter,
    ZipWriterOptions,
};
use omniarc::{EntryReader, EntryWriter, Error, Zip64Reason};

fn build_archive(options: ZipWriterOptions) -> Vec<u8> {
    let mut writer = ZipWriter::with_options(Cursor::new(Vec::new()), options);

    let mut readme = ZipEntry::new_file("docs/readme.md");
    readme.set_modified(1_592_224_240);
    writer.put_entry(&readme).expect("header");
    writer
        .write_all(b"# omniarc\n\na readme, repeated enough to deflate. ".repeat(20).as_slice())
        .expect("payload");
    writer.close_entry().expect("close");

    let mut raw = ZipEntry::new_file("raw.bin");
    raw.method = CompressionMethod::Stored;
    writer.put_entry(&raw).expect("header");
    writer.write_all(b"stored bytes").expect("payload");
    writer.close_entry().expect("close");

    writer.put_entry(&ZipEntry::new_directory("docs")).expect("dir");
    writer.close_entry().expect("dir close");

    writer.finish().expect("finish");
    writer.into_inner().expect("inner").into_inner()
}

#[test]
fn streaming_reader_roundtrip() {
    let bytes = build_archive(ZipWriterOptions::default());
    let mut reader = ZipReader::new(Cursor::new(bytes));

    let first = reader.next_entry().expect("entry").expect("present");
    assert_eq!(first.name, "docs/readme.md");
    assert_eq!(first.method, CompressionMethod::Deflate);
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).expect("payload");
    assert!(payload.starts_with(b"# omniarc"));

    let second = reader.next_entry().expect("entry").expect("present");
    assert_eq!(second.name, "raw.bin");
    assert_eq!(second.method, CompressionMethod::Stored);
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).expect("payload");
    assert_eq!(raw, b"stored bytes");

    let third = reader.next_entry().expect("entry").expect("present");
    assert!(third.name.ends_with('/'));

    assert!(reader.next_entry().expect("end").is_none());
}

#[test]
fn random_access_reader_any_order() {
    let bytes = build_archive(ZipWriterOptions::default());
    let mut file = ZipFile::new(Cursor::new(bytes)).expect("open");

    assert_eq!(file.entries().count(), 3);
    let raw = file.entry("raw.bin").expect("present").clone();
    let readme = file.entry("docs/readme.md").expect("present").clone();

    // Payloads open out of declaration order.
    let mut raw_data = Vec::new();
    file.input_stream(&raw)
        .expect("open raw")
        .read_to_end(&mut raw_data)
        .expect("read");
    assert_eq!(raw_data, b"stored bytes");

    let mut readme_data = Vec::new();
    file.input_stream(&readme)
        .expect("open readme")
        .read_to_end(&mut readme_data)
        .expect("read");
    assert!(readme_data.starts_with(b"# omniarc"));

    // Physical ordering sorts by local header offset.
    let physical = file.entries_in_order(EntryOrder::Physical);
    assert_eq!(physical[0].name, "docs/readme.md");
}

#[test]
fn zip64_never_refuses_too_many_entries() {
    let options = ZipWriterOptions {
        zip64: Zip64Mode::Never,
        ..Default::default()
    };
    let mut writer = ZipWriter::with_options(Cursor::new(Vec::new()), options);
    for i in 0..65_536 {
        let mut entry = ZipEntry::new_file(format!("empty-{i}"));
        entry.method = CompressionMethod::Stored;
        writer.put_entry(&entry).expect("header");
        writer.close_entry().expect("close");
    }
    let err = writer.finish().unwrap_err();
    assert!(matches!(
        err,
        Error::Zip64Required(Zip64Reason::TooManyEntries)
    ));
}

#[test]
fn zip64_always_emits_the_locator() {
    let options = ZipWriterOptions {
        zip64: Zip64Mode::Always,
        ..Default::default()
    };
    let mut writer = ZipWriter::with_options(Cursor::new(Vec::new()), options);
    let mut entry = ZipEntry::new_file("a");
    entry.method = CompressionMethod::Stored;
    writer.put_entry(&entry).expect("header");
    writer.write_all(b"x").expect("payload");
    writer.close_entry().expect("close");
    writer.finish().expect("finish");
    let bytes = writer.into_inner().expect("inner").into_inner();

    // ZIP64 end-of-central-directory locator signature present.
    let locator = 0x0706_4B50u32.to_le_bytes();
    assert!(
        bytes.windows(4).any(|w| w == locator),
        "locator record missing"
    );

    let mut file = ZipFile::new(Cursor::new(bytes)).expect("open");
    assert_eq!(file.entries().count(), 1);
    let entry = file.entry("a").expect("present").clone();
    let mut data = Vec::new();
    file.input_stream(&entry)
        .expect("open")
        .read_to_end(&mut data)
        .expect("read");
    assert_eq!(data, b"x");
}

#[test]
fn bzip2_method_roundtrip() {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut entry = ZipEntry::new_file("block.bz");
    entry.method = CompressionMethod::Bzip2;
    writer.put_entry(&entry).expect("header");
    let body = b"bzip2-in-zip payload ".repeat(64);
    writer.write_all(&body).expect("payload");
    writer.close_entry().expect("close");
    writer.finish().expect("finish");

    let bytes = writer.into_inner().expect("inner").into_inner();
    let mut reader = ZipReader::new(Cursor::new(bytes));
    let entry = reader.next_entry().expect("entry").expect("present");
    assert_eq!(entry.method, CompressionMethod::Bzip2);
    let mut data = Vec::new();
    reader.read_to_end(&mut data).expect("payload");
    assert_eq!(data, body);
}

#[test]
fn crc_of_written_entries_verifies() {
    let bytes = build_archive(ZipWriterOptions::default());

    // Corrupt one payload byte inside the stored entry.
    let mut corrupted = bytes.clone();
    let pos = corrupted
        .windows(12)
        .position(|w| w == b"stored bytes")
        .expect("payload present");
    corrupted[pos] ^= 0x01;

    let mut reader = ZipReader::new(Cursor::new(corrupted));
    reader.next_entry().expect("first entry");
    std::io::copy(&mut reader, &mut std::io::sink()).expect("drain first");
    // The corrupt entry surfaces a CRC failure on advance or read.
    let second = reader.next_entry();
    let failed = match second {
        Err(_) => true,
        Ok(_) => reader.next_entry().is_err(),
    };
    assert!(failed, "corruption must be detected");
}

#[test]
fn unknown_method_is_unsupported() {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut entry = ZipEntry::new_file("weird");
    entry.method = CompressionMethod::Ppmd;
    let err = writer.put_entry(&entry).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}
