// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::Path,
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use bootpatch::{
    format::{
        bootimage::{BootImage, BootImageV0Through2, IdKind, SectionKind, V1Extra, V2Extra},
        compression::{self, CompressedFormat},
        cpio::{self, CpioEntry},
        dtb::{self, Fdt},
        footer::{self, AvbTrailer, Trailer},
    },
    patch::{
        boot::{self, BootImagePatch, ErrorKind, PatchPlan, Stage},
        config::{BackupRecord, PatchConfig},
        hexpatch::HexPatch,
        ramdisk,
    },
    util,
};
use ring::digest::SHA1_FOR_LEGACY_USE_ONLY;
use tempfile::TempDir;

const FSTAB: &[u8] = b"/dev/block/system /system ext4 ro wait,verify,forceencrypt=footer\n";

fn stock_archive() -> Vec<u8> {
    let entries = [
        CpioEntry::new_file(b"init", 0o750, b"stock init".to_vec()),
        CpioEntry::new_directory(b"etc", 0o755),
        CpioEntry::new_file(b"etc/fstab.qcom", 0o640, FSTAB.to_vec()),
        CpioEntry::new_file(b"verity_key", 0o644, b"key".to_vec()),
    ];

    cpio::encode(&entries, &AtomicBool::new(false)).unwrap()
}

/// A device tree with a single fstab entry, as found in v2 dtb sections.
fn fstab_dtb(flags: &[u8]) -> Vec<u8> {
    let mut structure = vec![];
    let mut push = |v: u32| structure.extend_from_slice(&v.to_be_bytes());

    // Root node with an empty name, then "fstab" and "system".
    push(1);
    push(0);
    push(1);
    let name = |s: &mut Vec<u8>, n: &[u8]| {
        s.extend_from_slice(n);
        s.resize((s.len() + 4) & !3, 0);
    };
    name(&mut structure, b"fstab");
    structure.extend_from_slice(&1u32.to_be_bytes());
    name(&mut structure, b"system");

    structure.extend_from_slice(&3u32.to_be_bytes());
    structure.extend_from_slice(&(flags.len() as u32).to_be_bytes());
    structure.extend_from_slice(&0u32.to_be_bytes());
    structure.extend_from_slice(flags);
    structure.resize(structure.len().div_ceil(4) * 4, 0);

    for token in [2u32, 2, 2, 9] {
        structure.extend_from_slice(&token.to_be_bytes());
    }

    let strings = b"fsmgr_flags\0";
    let off_struct = 56u32;
    let off_strings = off_struct + structure.len() as u32;
    let total = off_strings + strings.len() as u32;

    let mut data = vec![];
    for field in [
        dtb::FDT_MAGIC,
        total,
        off_struct,
        off_strings,
        40,
        17,
        16,
        0,
        strings.len() as u32,
        structure.len() as u32,
    ] {
        data.extend_from_slice(&field.to_be_bytes());
    }
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&structure);
    data.extend_from_slice(strings);

    data
}

fn stock_image(with_dtb: bool) -> BootImage {
    let cancel_signal = AtomicBool::new(false);
    let ramdisk =
        compression::compress(&stock_archive(), CompressedFormat::Gzip, &cancel_signal).unwrap();

    let (v1_extra, v2_extra) = if with_dtb {
        (
            Some(V1Extra {
                recovery_dtbo_offset: 0,
                recovery_dtbo: vec![],
            }),
            Some(V2Extra {
                dtb_addr: 0x01f00000,
                dtb: fstab_dtb(b"wait,avb,slotselect\0"),
            }),
        )
    } else {
        (None, None)
    };

    BootImage::V0Through2(BootImageV0Through2 {
        kernel_addr: 0x00008000,
        ramdisk_addr: 0x01000000,
        second_addr: 0x00f00000,
        tags_addr: 0x00000100,
        page_size: 2048,
        os_version: 0,
        name: String::new(),
        cmdline: "console=ttyMSM0".to_owned(),
        id: [0; 8],
        id_kind: IdKind::Sha1,
        extra_cmdline: String::new(),
        kernel: b"\x00kernel image\x00skip_initramfs\x00more kernel\x00".to_vec(),
        ramdisk,
        second: vec![],
        v1_extra,
        v2_extra,
    })
}

fn write_image(dir: &Path, image: &BootImage, trailer: &Trailer) -> std::path::PathBuf {
    let path = dir.join("boot.img");
    let data = trailer.apply(image.to_vec().unwrap()).unwrap();
    fs::write(&path, data).unwrap();
    path
}

fn read_ramdisk(image: &BootImage) -> Vec<CpioEntry> {
    let cancel_signal = AtomicBool::new(false);
    let section = image.section(SectionKind::Ramdisk).unwrap();
    let (archive, format) = ramdisk::unpack(section, &cancel_signal).unwrap();
    assert_eq!(format, CompressedFormat::Gzip);

    ramdisk::decode(&archive, &cancel_signal).unwrap()
}

fn find<'a>(entries: &'a [CpioEntry], path: &str) -> &'a CpioEntry {
    entries
        .iter()
        .find(|e| e.path == path.as_bytes())
        .unwrap_or_else(|| panic!("Missing entry: {path}"))
}

fn magisk_plan(config: PatchConfig) -> PatchPlan {
    PatchPlan::builder()
        .config(config)
        .init(b"magiskinit".to_vec())
        .magisk(Some(b"magisk32".to_vec()), Some(b"magisk64".to_vec()))
        .file("overlay.d/sbin/init_patch", 0o750, b"#!/system/bin/sh\n".to_vec())
        .build()
        .unwrap()
}

#[test]
fn patch_stock_image() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let output = temp_dir.path().join("patched.img");
    let input_data = fs::read(&input).unwrap();

    let plan = magisk_plan(PatchConfig::default());
    let repacked = boot::run(&input, &output, None, &plan, &cancel_signal).unwrap();

    let output_data = fs::read(&output).unwrap();
    assert_eq!(repacked.size, output_data.len() as u64);
    assert_eq!(
        repacked.sha1,
        util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &output_data),
    );

    let (patched, trailer) = footer::load_image(&output_data).unwrap();
    assert_eq!(trailer, Trailer::None);

    let entries = read_ramdisk(&patched);

    let init = find(&entries, "init");
    assert_eq!(init.data, b"magiskinit");
    assert_eq!(init.file_mode, 0o750);

    let init_patch = find(&entries, "overlay.d/sbin/init_patch");
    assert_eq!(init_patch.file_mode, 0o750);
    assert_eq!(init_patch.data, b"#!/system/bin/sh\n");

    let magisk64 = find(&entries, "overlay.d/sbin/magisk64.xz");
    let cancel = AtomicBool::new(false);
    let (raw, format) = compression::decompress(&magisk64.data, false, &cancel).unwrap();
    assert_eq!(format, CompressedFormat::Xz);
    assert_eq!(raw, b"magisk64");

    // With the default flags, fstab files are untouched.
    assert_eq!(find(&entries, "etc/fstab.qcom").data, FSTAB);
    find(&entries, "verity_key");

    // The record and backup come last.
    let tail = entries[entries.len() - 3..]
        .iter()
        .map(|e| e.path.as_slice())
        .collect::<Vec<_>>();
    assert_eq!(
        tail,
        [&b".backup"[..], b".backup/ramdisk.cpio", b".backup/.magisk"],
    );

    let original = stock_archive();
    let record = ramdisk::read_record(&entries).unwrap().unwrap();
    assert_eq!(
        record,
        BackupRecord {
            config: PatchConfig::default(),
            sha1: Some(util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &input_data)),
            ramdisk_sha1: Some(util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &original)),
        },
    );
    assert_eq!(find(&entries, ".backup/ramdisk.cpio").data, original);

    let kernel = patched.section(SectionKind::Kernel).unwrap();
    assert_eq!(
        kernel,
        b"\x00kernel image\x00want_initramfs\x00more kernel\x00",
    );

    // The input is left alone.
    assert_eq!(fs::read(&input).unwrap(), input_data);
}

#[test]
fn repatching_restores_original() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let first = temp_dir.path().join("first.img");
    let second = temp_dir.path().join("second.img");

    let plan = magisk_plan(PatchConfig::default());

    assert_eq!(boot::patch_status(&input, &cancel_signal).unwrap(), None);

    boot::run(&input, &first, None, &plan, &cancel_signal).unwrap();
    let status = boot::patch_status(&first, &cancel_signal).unwrap().unwrap();
    assert_eq!(status.config, PatchConfig::default());

    boot::run(&first, &second, None, &plan, &cancel_signal).unwrap();

    let (first_image, _) = footer::load_image(&fs::read(&first).unwrap()).unwrap();
    let (second_image, _) = footer::load_image(&fs::read(&second).unwrap()).unwrap();

    // The record still points at the stock image, so nothing differs.
    let first_entries = read_ramdisk(&first_image);
    let second_entries = read_ramdisk(&second_image);
    assert_eq!(first_entries, second_entries);

    let first_record = ramdisk::read_record(&first_entries).unwrap().unwrap();
    let second_record = ramdisk::read_record(&second_entries).unwrap().unwrap();
    assert_eq!(first_record.ramdisk_sha1, second_record.ramdisk_sha1);
    assert_eq!(first_record.sha1, second_record.sha1);
    assert_eq!(
        second_record.sha1,
        Some(util::hex_digest(
            &SHA1_FOR_LEGACY_USE_ONLY,
            &fs::read(&input).unwrap(),
        )),
    );

    assert_eq!(
        first_image.section(SectionKind::Kernel),
        second_image.section(SectionKind::Kernel),
    );

    // The original ramdisk can be extracted in its original format.
    let restored = boot::restore_ramdisk(&second, &cancel_signal).unwrap();
    let (archive, format) = compression::decompress(&restored, false, &cancel_signal).unwrap();
    assert_eq!(format, CompressedFormat::Gzip);
    assert_eq!(archive, stock_archive());
}

#[test]
fn mandatory_rule_failure_leaves_no_output() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let output = temp_dir.path().join("patched.img");

    let plan = PatchPlan::builder()
        .hex_patches(vec![
            HexPatch::new(
                "missing",
                SectionKind::Kernel,
                b"not in kernel",
                b"NOT IN KERNEL",
                true,
            )
            .unwrap(),
        ])
        .build()
        .unwrap();

    let err = boot::run(&input, &output, None, &plan, &cancel_signal).unwrap_err();
    assert_eq!(err.stage, Stage::Kernel);
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(err.kind().exit_code(), 5);
    assert_matches!(err.source, boot::Error::MandatoryPatchUnmatched(ref l) if l == "missing");

    let files = fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect::<Vec<_>>();
    assert_eq!(files, ["boot.img"]);
}

#[test]
fn output_must_differ_from_input() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let before = fs::read(&input).unwrap();

    let plan = magisk_plan(PatchConfig::default());
    let err = boot::run(&input, &input, None, &plan, &cancel_signal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_matches!(err.source, boot::Error::OutputIsInput(_));

    assert_eq!(fs::read(&input).unwrap(), before);
}

#[test]
fn cancelled_run() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(true);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let output = temp_dir.path().join("patched.img");

    let plan = magisk_plan(PatchConfig::default());
    let err = boot::run(&input, &output, None, &plan, &cancel_signal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(!output.exists());
}

#[test]
fn unparseable_input() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = temp_dir.path().join("garbage.img");
    fs::write(&input, vec![0u8; 8192]).unwrap();
    let output = temp_dir.path().join("patched.img");

    let plan = magisk_plan(PatchConfig::default());
    let err = boot::run(&input, &output, None, &plan, &cancel_signal).unwrap_err();
    assert_eq!(err.stage, Stage::Unpack);
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(err.kind().exit_code(), 2);

    let missing = temp_dir.path().join("missing.img");
    let err = boot::run(&missing, &output, None, &plan, &cancel_signal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn work_dir_contents() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(true), &Trailer::None);
    let output = temp_dir.path().join("patched.img");
    let work_dir = temp_dir.path().join("work");

    // Stale files are removed.
    fs::create_dir(&work_dir).unwrap();
    fs::write(work_dir.join("stale"), b"stale").unwrap();

    let plan = magisk_plan(PatchConfig::default());
    boot::run(&input, &output, Some(&work_dir), &plan, &cancel_signal).unwrap();

    assert!(!work_dir.join("stale").exists());
    assert!(work_dir.join("header.toml").exists());
    assert!(work_dir.join("kernel").exists());
    assert!(work_dir.join("dtb").exists());
    assert_eq!(fs::read(work_dir.join("ramdisk.cpio")).unwrap(), stock_archive());
    // Empty sections are not written.
    assert!(!work_dir.join("second").exists());
}

#[test]
fn strip_verity_and_encryption() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(true), &Trailer::None);
    let output = temp_dir.path().join("patched.img");

    let config = PatchConfig {
        keep_verity: false,
        keep_force_encrypt: false,
        ..Default::default()
    };
    boot::run(&input, &output, None, &magisk_plan(config), &cancel_signal).unwrap();

    let (patched, _) = footer::load_image(&fs::read(&output).unwrap()).unwrap();
    let entries = read_ramdisk(&patched);

    assert_eq!(
        find(&entries, "etc/fstab.qcom").data,
        b"/dev/block/system /system ext4 ro wait\n",
    );
    assert!(entries.iter().all(|e| e.path != b"verity_key"));

    let record = ramdisk::read_record(&entries).unwrap().unwrap();
    assert!(!record.config.keep_verity);
    assert!(!record.config.keep_force_encrypt);

    let dtb = patched.section(SectionKind::Dtb).unwrap();
    let fdt = Fdt::parse(dtb).unwrap();
    let props = fdt.properties().unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].node, "/fstab/system");

    let mut expected = b"wait,slotselect\0".to_vec();
    expected.resize(b"wait,avb,slotselect\0".len(), 0);
    assert_eq!(&dtb[props[0].value.clone()], expected.as_slice());
}

#[test]
fn avb_footer_is_updated() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let mut vbmeta = vec![0u8; 1024];
    vbmeta[..4].copy_from_slice(&footer::VBMETA_MAGIC);
    let trailer = Trailer::Avb(AvbTrailer {
        version_major: 1,
        version_minor: 0,
        partition_size: 1024 * 1024,
        vbmeta,
        tail: vec![],
    });

    let input = write_image(temp_dir.path(), &stock_image(false), &trailer);
    let output = temp_dir.path().join("patched.img");

    let config = PatchConfig {
        patch_vbmeta_flag: true,
        ..Default::default()
    };
    boot::run(&input, &output, None, &magisk_plan(config), &cancel_signal).unwrap();

    let data = fs::read(&output).unwrap();
    assert_eq!(data.len(), 1024 * 1024);

    let (_, trailer) = footer::load_image(&data).unwrap();
    let Trailer::Avb(avb) = &trailer else {
        panic!("Missing AVB footer: {trailer:?}");
    };
    assert_eq!(
        avb.flags().unwrap(),
        footer::VBMETA_FLAG_HASHTREE_DISABLED | footer::VBMETA_FLAG_VERIFICATION_DISABLED,
    );
}

struct CmdlinePatcher;

impl BootImagePatch for CmdlinePatcher {
    fn patcher_name(&self) -> &'static str {
        "CmdlinePatcher"
    }

    fn patch(
        &self,
        boot_image: &mut BootImage,
        _cancel_signal: &AtomicBool,
    ) -> Result<(), boot::Error> {
        if let BootImage::V0Through2(b) = boot_image {
            b.cmdline.push_str(" androidboot.selinux=permissive");
        }

        Ok(())
    }
}

#[test]
fn custom_patcher() {
    let temp_dir = TempDir::new().unwrap();
    let cancel_signal = AtomicBool::new(false);

    let input = write_image(temp_dir.path(), &stock_image(false), &Trailer::None);
    let output = temp_dir.path().join("patched.img");

    let plan = PatchPlan::builder()
        .patcher(Box::new(CmdlinePatcher))
        .build()
        .unwrap();
    boot::run(&input, &output, None, &plan, &cancel_signal).unwrap();

    let (patched, _) = footer::load_image(&fs::read(&output).unwrap()).unwrap();
    let BootImage::V0Through2(b) = &patched else {
        panic!("Unexpected image type: {patched:?}");
    };
    assert_eq!(b.cmdline, "console=ttyMSM0 androidboot.selinux=permissive");
    assert_eq!(b.id_kind, IdKind::Sha1);
}
