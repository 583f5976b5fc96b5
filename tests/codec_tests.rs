use std::io::{Cursor, Read, Write};

use omniarc::codec::bzip2::{BZip2Reader, BZip2Writer};
use omniarc::codec::gzip::{GzipParameters, GzipReader, GzipWriter};
use omniarc::codec::lz4::framed::{Lz4FrameOptions, Lz4FramedReader, Lz4FramedWriter};
use omniarc::codec::lzma::{LzmaOptions, LzmaReader, LzmaWriter};
use omniarc::codec::snappy::framed::{
    SnappyFramedReader, SnappyFramedWriter, mask_crc, unmask_crc,
};
use omniarc::codec::snappy::{SnappyReader, SnappyWriter};
use omniarc::codec::xz::{XzCheck, XzReader, XzWriter};
use omniarc::Crc32C;

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

#[test]
fn bzip2_one_mebibyte_of_a5() {
    let original = vec![0xA5u8; 1 << 20];
    let mut writer = BZip2Writer::new(Vec::new(), 9).expect("writer");
    writer.write_all(&original).expect("payload");
    let compressed = writer.finish().expect("finish");
    assert!(compressed.len() < original.len());

    let mut decoded = Vec::new();
    BZip2Reader::new(Cursor::new(compressed))
        .expect("reader")
        .read_to_end(&mut decoded)
        .expect("decode");
    assert_eq!(decoded, original);
}

#[test]
fn bzip2_text_roundtrip_across_levels() {
    let original = b"It was the best of times, it was the worst of times. ".repeat(600);
    for level in [1, 5, 9] {
        let mut writer = BZip2Writer::new(Vec::new(), level).expect("writer");
        writer.write_all(&original).expect("payload");
        let compressed = writer.finish().expect("finish");
        assert!(compressed.len() < original.len() / 2);

        let mut decoded = Vec::new();
        BZip2Reader::new(Cursor::new(compressed))
            .expect("reader")
            .read_to_end(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, original, "level {level}");
    }
}

#[test]
fn snappy_framed_chunk_boundary() {
    // 65 537 bytes forces at least two data chunks of at most 64 KiB each.
    let original = pseudo_random(65_537, 0xDECAF);
    let mut writer = SnappyFramedWriter::new(Vec::new()).expect("writer");
    writer.write_all(&original).expect("payload");
    let framed = writer.finish().expect("finish");

    // Walk the chunks: signature, then ≥ 2 data chunks with valid CRCs.
    assert_eq!(&framed[..4], &[0xFF, 0x06, 0x00, 0x00]);
    let mut pos = 10;
    let mut data_chunks = 0;
    let mut recovered = Vec::new();
    while pos < framed.len() {
        let kind = framed[pos];
        let len = u32::from_le_bytes([framed[pos + 1], framed[pos + 2], framed[pos + 3], 0])
            as usize;
        let payload = &framed[pos + 4..pos + 4 + len];
        match kind {
            0x00 => {
                data_chunks += 1;
                let stored = u32::from_le_bytes(payload[..4].try_into().unwrap());
                let mut decoder = SnappyReader::new(&payload[4..]).expect("chunk");
                let mut chunk = Vec::new();
                decoder.read_to_end(&mut chunk).expect("chunk data");
                assert_eq!(mask_crc(Crc32C::hash(&chunk)), stored);
                recovered.extend_from_slice(&chunk);
            }
            0x01 => {
                data_chunks += 1;
                let stored = u32::from_le_bytes(payload[..4].try_into().unwrap());
                assert_eq!(mask_crc(Crc32C::hash(&payload[4..])), stored);
                recovered.extend_from_slice(&payload[4..]);
            }
            other => panic!("unexpected chunk type {other:#x}"),
        }
        pos += 4 + len;
    }
    assert!(data_chunks >= 2);
    assert_eq!(recovered, original);

    // And the decoder agrees end to end.
    let mut reader = SnappyFramedReader::new(Cursor::new(framed)).expect("reader");
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded).expect("decode");
    assert_eq!(decoded, original);
}

#[test]
fn snappy_mask_is_an_inverse_pair() {
    for crc in [0u32, 1, 0x7FFF, 0x8000, 0xA282_EAD8, u32::MAX] {
        assert_eq!(unmask_crc(mask_crc(crc)), crc);
    }
}

#[test]
fn snappy_raw_roundtrip() {
    let original = b"snappy raw stream with repeats, with repeats, with repeats".repeat(100);
    let mut writer = SnappyWriter::new(Vec::new(), original.len() as u64).expect("writer");
    writer.write_all(&original).expect("payload");
    let compressed = writer.finish().expect("finish");
    assert!(compressed.len() < original.len());

    let mut reader = SnappyReader::new(Cursor::new(compressed)).expect("reader");
    assert_eq!(reader.uncompressed_size(), original.len() as u64);
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded).expect("decode");
    assert_eq!(decoded, original);
}

#[test]
fn gzip_multi_member_and_metadata() {
    let params = GzipParameters {
        file_name: Some("a.txt".into()),
        os: omniarc::codec::gzip::GzipOs::Unix,
        modification_time: 1_600_000_000,
        ..Default::default()
    };
    let mut first = GzipWriter::new(Vec::new(), &params).expect("writer");
    first.write_all(b"member one|").expect("payload");
    let mut bytes = first.finish().expect("finish");

    let mut second = GzipWriter::new(Vec::new(), &GzipParameters::default()).expect("writer");
    second.write_all(b"member two").expect("payload");
    bytes.extend_from_slice(&second.finish().expect("finish"));

    let mut reader = GzipReader::new(Cursor::new(bytes)).expect("reader");
    assert_eq!(reader.header().file_name.as_deref(), Some("a.txt"));
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded).expect("decode");
    assert_eq!(decoded, b"member one|member two");
}

#[test]
fn lzma_and_xz_roundtrip() {
    let original = pseudo_random(50_000, 7)
        .iter()
        .map(|&b| b % 16) // compressible
        .collect::<Vec<u8>>();

    let options = LzmaOptions::from_level(4);
    let mut writer =
        LzmaWriter::new(Vec::new(), &options, Some(original.len() as u64)).expect("writer");
    writer.write_all(&original).expect("payload");
    let lzma_bytes = writer.finish().expect("finish");
    let mut decoded = Vec::new();
    LzmaReader::new(Cursor::new(lzma_bytes))
        .expect("reader")
        .read_to_end(&mut decoded)
        .expect("decode");
    assert_eq!(decoded, original);

    let mut writer = XzWriter::new(Vec::new(), &options, XzCheck::Crc64).expect("writer");
    writer.write_all(&original).expect("payload");
    let xz_bytes = writer.finish().expect("finish");
    assert_eq!(&xz_bytes[..6], &[0xFD, b'7', b'z', b'X', b'Z', 0x00]);
    let mut decoded = Vec::new();
    XzReader::new(Cursor::new(xz_bytes))
        .expect("reader")
        .read_to_end(&mut decoded)
        .expect("decode");
    assert_eq!(decoded, original);
}

#[test]
fn lz4_framed_with_checksums() {
    let original = pseudo_random(300_000, 99);
    let options = Lz4FrameOptions {
        block_checksum: true,
        content_checksum: true,
        content_size: Some(original.len() as u64),
        ..Default::default()
    };
    let mut writer = Lz4FramedWriter::new(Vec::new(), options).expect("writer");
    writer.write_all(&original).expect("payload");
    let framed = writer.finish().expect("finish");
    assert_eq!(&framed[..4], &0x184D_2204u32.to_le_bytes());

    let mut reader = Lz4FramedReader::new(Cursor::new(framed)).expect("reader");
    assert_eq!(reader.content_size(), Some(original.len() as u64));
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded).expect("decode");
    assert_eq!(decoded, original);
}

#[test]
fn detect_tags_compressed_streams() {
    use omniarc::{Format, detect};

    let mut gz = GzipWriter::new(Vec::new(), &GzipParameters::default()).expect("writer");
    gz.write_all(b"x").expect("payload");
    assert_eq!(detect(&gz.finish().expect("finish")), Some(Format::Gzip));

    let mut bz = BZip2Writer::new(Vec::new(), 1).expect("writer");
    bz.write_all(b"x").expect("payload");
    assert_eq!(detect(&bz.finish().expect("finish")), Some(Format::Bzip2));

    let xz = XzWriter::new(Vec::new(), &LzmaOptions::default(), XzCheck::Crc32)
        .expect("writer")
        .finish()
        .expect("finish");
    assert_eq!(detect(&xz), Some(Format::Xz));
}
