// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Cursor, Read, Seek, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use bootpatch::format::compression::{
    self, CompressedFormat, CompressedReader, CompressedWriter,
};

fn round_trip(data: &[u8], format: CompressedFormat) {
    let raw_writer = Cursor::new(Vec::new());
    let mut writer = CompressedWriter::new(raw_writer, format).unwrap();
    writer.write_all(data).unwrap();
    let mut raw_reader = writer.finish().unwrap();

    raw_reader.rewind().unwrap();
    let mut reader = CompressedReader::new(raw_reader, false).unwrap();
    assert_eq!(reader.format(), format);

    let mut new_data = vec![];
    reader.read_to_end(&mut new_data).unwrap();

    assert_eq!(data, new_data);
}

#[test]
fn round_trip_gzip() {
    round_trip(b"gzip-compressed data", CompressedFormat::Gzip);
}

#[test]
fn round_trip_lz4_legacy() {
    // Make sure we exceed the 8MiB block boundary.
    let data = b"Lz4Legacy".repeat(1024 * 1024);
    round_trip(&data, CompressedFormat::Lz4Legacy);
}

#[test]
fn round_trip_xz() {
    round_trip(b"xz-compressed data", CompressedFormat::Xz);
}

#[test]
fn round_trip_lzma() {
    round_trip(b"lzma-compressed data", CompressedFormat::Lzma);
}

#[test]
fn unknown_format() {
    let cancel_signal = AtomicBool::new(false);
    let data = b"\x07\x07\x01 not compressed";

    assert_matches!(
        compression::decompress(data, false, &cancel_signal),
        Err(compression::Error::UnknownFormat)
    );

    let (raw, format) = compression::decompress(data, true, &cancel_signal).unwrap();
    assert_eq!(format, CompressedFormat::None);
    assert_eq!(raw, data);
}

#[test]
fn xz_payloads_use_crc32() {
    let data = compression::xz_compress(b"payload").unwrap();

    // Stream flags: no check would be 0x00, CRC32 is 0x01, and CRC64 is 0x04.
    assert_eq!(&data[..6], b"\xfd7zXZ\x00");
    assert_eq!(&data[6..8], b"\x00\x01");

    let cancel_signal = AtomicBool::new(false);
    let (raw, format) = compression::decompress(&data, false, &cancel_signal).unwrap();
    assert_eq!(format, CompressedFormat::Xz);
    assert_eq!(raw, b"payload");
}
