//! 7z archives.
//!
//! The reader parses the trailer-addressed header (itself possibly an
//! LZMA-compressed folder), materialises the folder graphs and streams
//! entries folder by folder. The writer emits one folder per entry through
//! a configurable content-method chain.

#[cfg(feature = "aes256")]
mod aes;
mod archive;
mod bitset;
mod coders;
mod folder;
mod reader;
mod writer;

#[cfg(feature = "aes256")]
pub use aes::AesOptions;
pub use archive::{SevenZArchive, SevenZEntry, SevenZMethod, StreamMap};
pub use coders::{SevenZCoderOptions, SevenZMethodConfiguration};
pub use folder::{Coder, Folder, OrderedCoderIter};
pub use reader::SevenZFile;
pub use writer::SevenZWriter;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::lzma::LzmaOptions;

    fn write_archive(methods: Vec<SevenZMethodConfiguration>) -> Vec<u8> {
        let mut writer = SevenZWriter::new(Cursor::new(Vec::new())).unwrap();
        writer.set_content_methods(methods);
        writer
            .push_entry(SevenZEntry::new_directory("docs"), None)
            .unwrap();
        let mut payload: &[u8] = b"seven zip payload, compressed by the folder chain";
        writer
            .push_entry(SevenZEntry::new_file("docs/readme.txt"), Some(&mut payload))
            .unwrap();
        let mut second: &[u8] = b"another file";
        writer
            .push_entry(SevenZEntry::new_file("second.bin"), Some(&mut second))
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn assert_roundtrip(methods: Vec<SevenZMethodConfiguration>) {
        let bytes = write_archive(methods);
        assert_eq!(&bytes[..6], &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]);

        let mut file = SevenZFile::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = file.entries().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["docs", "docs/readme.txt", "second.bin"]);
        assert!(file.entries()[0].is_directory);

        let data = file.read_entry_data(1).unwrap();
        assert_eq!(
            data,
            b"seven zip payload, compressed by the folder chain"
        );
        let data = file.read_entry_data(2).unwrap();
        assert_eq!(data, b"another file");
    }

    #[test]
    fn roundtrip_lzma2() {
        assert_roundtrip(vec![SevenZMethodConfiguration::new(SevenZMethod::LZMA2)
            .with_options(SevenZCoderOptions::Lzma2(LzmaOptions::from_level(3)))]);
    }

    #[test]
    fn roundtrip_copy() {
        assert_roundtrip(vec![SevenZMethodConfiguration::new(SevenZMethod::COPY)]);
    }

    #[test]
    fn roundtrip_bzip2() {
        assert_roundtrip(vec![SevenZMethodConfiguration::new(SevenZMethod::BZIP2)]);
    }

    #[test]
    fn roundtrip_delta_then_lzma2() {
        assert_roundtrip(vec![
            SevenZMethodConfiguration::new(SevenZMethod::DELTA)
                .with_options(SevenZCoderOptions::Delta(4)),
            SevenZMethodConfiguration::new(SevenZMethod::LZMA2),
        ]);
    }

    #[cfg(feature = "aes256")]
    #[test]
    fn roundtrip_encrypted() {
        use crate::password::Password;

        let password = Password::from("correct horse");
        let options = AesOptions::new(password.clone()).unwrap();
        let methods = vec![
            SevenZMethodConfiguration::new(SevenZMethod::LZMA2),
            SevenZMethodConfiguration::new(SevenZMethod::AES256_SHA256)
                .with_options(SevenZCoderOptions::Aes(options)),
        ];
        let bytes = write_archive(methods);

        // Without the password the payload is unreadable.
        let mut locked = SevenZFile::new(Cursor::new(bytes.clone())).unwrap();
        assert!(locked.read_entry_data(1).is_err());

        let mut file = SevenZFile::with_password(Cursor::new(bytes), password).unwrap();
        let data = file.read_entry_data(1).unwrap();
        assert_eq!(
            data,
            b"seven zip payload, compressed by the folder chain"
        );
    }

    #[test]
    fn streaming_walk_visits_all_entries() {
        let bytes = write_archive(vec![SevenZMethodConfiguration::new(SevenZMethod::LZMA2)]);
        let mut file = SevenZFile::new(Cursor::new(bytes)).unwrap();
        let mut visited = Vec::new();
        file.for_each_entries(|entry, reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map_err(crate::Error::io)?;
            visited.push((entry.name.clone(), data.len() as u64));
            Ok(true)
        })
        .unwrap();
        assert_eq!(visited.len(), 3);
        assert_eq!(visited[1].1, 49);
    }
}
