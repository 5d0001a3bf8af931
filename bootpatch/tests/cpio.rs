/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{io::Cursor, sync::atomic::AtomicBool};

use assert_matches::assert_matches;
use bootpatch::{
    format::cpio::{self, CpioEntry, CpioEntryType},
    util,
};

fn sample_entries() -> Vec<CpioEntry> {
    vec![
        CpioEntry::new_file(b"init", 0o750, b"#!/init".to_vec()),
        CpioEntry::new_directory(b"system", 0o755),
        CpioEntry::new_directory(b"system/etc", 0o755),
        CpioEntry::new_file(
            b"system/etc/fstab.qcom",
            0o640,
            b"/dev/block/a /a ext4 ro wait".to_vec(),
        ),
        CpioEntry::new_symlink(b"sbin", b"/system/bin"),
    ]
}

#[test]
fn round_trip_archive() {
    let cancel_signal = AtomicBool::new(false);
    let entries = sample_entries();

    let data = cpio::encode(&entries, &cancel_signal).unwrap();
    assert_eq!(&data[..6], b"070701");
    assert_eq!(data.len() % 4, 0);

    let decoded = cpio::decode(&data, &cancel_signal).unwrap();
    assert_eq!(decoded, entries);

    let symlink = &decoded[4];
    assert_eq!(symlink.file_type, CpioEntryType::Symlink);
    assert_eq!(symlink.data, b"/system/bin");
}

#[test]
fn deterministic_output() {
    let cancel_signal = AtomicBool::new(false);

    let mut entries = sample_entries();
    cpio::assign_inodes(&mut entries).unwrap();
    let first = cpio::encode(&entries, &cancel_signal).unwrap();

    let mut entries = cpio::decode(&first, &cancel_signal).unwrap();
    cpio::assign_inodes(&mut entries).unwrap();
    let second = cpio::encode(&entries, &cancel_signal).unwrap();

    assert_eq!(first, second);
    assert_eq!(entries[0].inode, 300000);
    assert_eq!(entries[4].inode, 300004);
}

#[test]
fn block_padding() {
    let cancel_signal = AtomicBool::new(false);
    let entries = sample_entries();

    let unpadded = cpio::encode(&entries, &cancel_signal).unwrap();

    let mut writer = Cursor::new(Vec::new());
    cpio::save(&mut writer, &entries, true, &cancel_signal).unwrap();
    let padded = writer.into_inner();

    assert!(padded.starts_with(&unpadded));
    assert!(util::is_zero(&padded[unpadded.len()..]));
    assert_eq!(padded.len() % 512, 0);

    // Padding after the trailer is ignored.
    assert_eq!(cpio::decode(&padded, &cancel_signal).unwrap(), entries);
}

#[test]
fn reject_unsafe_paths() {
    let cancel_signal = AtomicBool::new(false);

    for path in [&b"../escape"[..], b"/init", b"system/../../etc"] {
        let entries = [CpioEntry::new_file(path, 0o644, vec![])];
        let data = cpio::encode(&entries, &cancel_signal).unwrap();

        assert_matches!(
            cpio::decode(&data, &cancel_signal),
            Err(cpio::Error::UnsafePath(p)) if p == path
        );
    }
}

#[test]
fn reject_bad_archives() {
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        cpio::decode(b"123456", &cancel_signal),
        Err(cpio::Error::UnknownMagic(_))
    );

    let data = cpio::encode(&sample_entries(), &cancel_signal).unwrap();
    assert!(cpio::decode(&data[..data.len() / 2], &cancel_signal).is_err());
}

#[test]
fn cancellation() {
    let cancel_signal = AtomicBool::new(true);

    assert!(cpio::encode(&sample_entries(), &cancel_signal).is_err());
}

#[test]
fn sort_by_path() {
    let mut entries = sample_entries();
    entries.reverse();
    cpio::sort(&mut entries);

    let paths = entries.iter().map(|e| e.path.as_slice()).collect::<Vec<_>>();
    assert_eq!(
        paths,
        [
            &b"init"[..],
            b"sbin",
            b"system",
            b"system/etc",
            b"system/etc/fstab.qcom",
        ],
    );
}

#[test]
fn reject_unknown_file_type() {
    let cancel_signal = AtomicBool::new(false);

    let entries = [CpioEntry::new_file(b"init", 0o750, vec![])];
    let mut data = cpio::encode(&entries, &cancel_signal).unwrap();
    // Mode field of the first header with all S_IFMT bits set.
    data[14..22].copy_from_slice(b"0000F1E8");

    let err = cpio::decode(&data, &cancel_signal).unwrap_err();
    assert_matches!(&err, cpio::Error::UnknownFileType(p, 0o170750) if p == b"init");
    assert_eq!(err.to_string(), "Unknown file type for \"init\": 170750");
}

#[test]
fn maximum_inode() {
    let cancel_signal = AtomicBool::new(false);

    let mut entries = sample_entries();
    entries[0].inode = u32::MAX;

    let data = cpio::encode(&entries, &cancel_signal).unwrap();
    let decoded = cpio::decode(&data, &cancel_signal).unwrap();
    assert_eq!(decoded, entries);
    assert_eq!(cpio::encode(&decoded, &cancel_signal).unwrap(), data);
}
