// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;
use bootpatch::{
    format::dtb::{self, Fdt},
    patch::fstab,
};

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Assembles a version 17 flattened device tree with an empty memory
/// reservation map.
#[derive(Default)]
struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    fn token(&mut self, token: u32) -> &mut Self {
        self.structure.extend_from_slice(&token.to_be_bytes());
        self
    }

    fn align(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn begin_node(&mut self, name: &str) -> &mut Self {
        self.token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.align();
        self
    }

    fn end_node(&mut self) -> &mut Self {
        self.token(FDT_END_NODE)
    }

    fn nop(&mut self) -> &mut Self {
        self.token(FDT_NOP)
    }

    fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.token(FDT_PROP);
        self.token(value.len() as u32);
        self.token(name_offset);
        self.structure.extend_from_slice(value);
        self.align();
        self
    }

    fn finish(&mut self) -> Vec<u8> {
        self.token(FDT_END);

        let header_size = 40u32;
        let rsvmap_size = 16u32;
        let off_dt_struct = header_size + rsvmap_size;
        let off_dt_strings = off_dt_struct + self.structure.len() as u32;
        let total_size = off_dt_strings + self.strings.len() as u32;

        let mut data = vec![];
        for field in [
            dtb::FDT_MAGIC,
            total_size,
            off_dt_struct,
            off_dt_strings,
            header_size,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            data.extend_from_slice(&field.to_be_bytes());
        }
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&self.structure);
        data.extend_from_slice(&self.strings);

        data
    }
}

fn fstab_tree(flags: &[u8]) -> Vec<u8> {
    FdtBuilder::default()
        .begin_node("")
        .prop("compatible", b"test,board\0")
        .begin_node("firmware")
        .begin_node("android")
        .begin_node("fstab")
        .begin_node("system")
        .prop("dev", b"/dev/block/by-name/system\0")
        .prop("fsmgr_flags", flags)
        .end_node()
        .end_node()
        .nop()
        .begin_node("vendor@1")
        .prop("fsmgr_flags", flags)
        .end_node()
        .end_node()
        .end_node()
        .end_node()
        .finish()
}

#[test]
fn walk_properties() {
    let data = fstab_tree(b"wait,avb\0");
    let fdt = Fdt::parse(&data).unwrap();
    assert_eq!(fdt.total_size(), data.len());

    let props = fdt.properties().unwrap();
    let names = props
        .iter()
        .map(|p| (p.node.as_str(), p.name.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        [
            ("/", "compatible"),
            ("/firmware/android/fstab/system", "dev"),
            ("/firmware/android/fstab/system", "fsmgr_flags"),
            ("/firmware/android/vendor@1", "fsmgr_flags"),
        ],
    );

    assert_eq!(&data[props[0].value.clone()], b"test,board\0");
    assert_eq!(&data[props[2].value.clone()], b"wait,avb\0");

    assert!(props[2].is_under("fstab"));
    assert!(!props[3].is_under("fstab"));
    assert!(props[3].is_under("vendor"));
}

#[test]
fn find_concatenated_trees() {
    let first = fstab_tree(b"wait\0");
    let second = fstab_tree(b"wait,verify\0");

    let mut data = b"leading junk".to_vec();
    // A stray magic value that is not followed by a valid header.
    data.extend_from_slice(&dtb::FDT_MAGIC.to_be_bytes());
    data.extend_from_slice(b"more junk");
    let first_start = data.len();
    data.extend_from_slice(&first);
    data.extend_from_slice(&[0u8; 7]);
    let second_start = data.len();
    data.extend_from_slice(&second);

    let ranges = dtb::find_all(&data);
    assert_eq!(
        ranges,
        [
            first_start..first_start + first.len(),
            second_start..second_start + second.len(),
        ],
    );
}

#[test]
fn appended_to_kernel() {
    let tree = fstab_tree(b"wait\0");

    let mut kernel = vec![0x1f; 1000];
    assert_eq!(dtb::find_appended(&kernel), None);

    kernel.extend_from_slice(&tree);
    kernel.extend_from_slice(&tree);
    assert_eq!(dtb::find_appended(&kernel), Some(1000));
}

#[test]
fn strip_fstab_flags() {
    let original = fstab_tree(b"wait,avb=vbmeta,slotselect\0");
    let mut data = original.clone();

    let removed = fstab::patch_dtb(&mut data, fstab::VERITY_FLAGS).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(data.len(), original.len());

    let props = Fdt::parse(&data).unwrap().properties().unwrap();
    let mut expected = b"wait,slotselect\0".to_vec();
    expected.resize(27, 0);
    assert_eq!(&data[props[2].value.clone()], expected.as_slice());

    // Only nodes below an fstab node are modified.
    assert_eq!(
        &data[props[3].value.clone()],
        b"wait,avb=vbmeta,slotselect\0",
    );

    // Nothing is left to remove the second time.
    assert_eq!(fstab::patch_dtb(&mut data, fstab::VERITY_FLAGS).unwrap(), 0);
}

#[test]
fn no_fstab_nodes() {
    let original = FdtBuilder::default()
        .begin_node("")
        .prop("fsmgr_flags", b"wait,avb\0")
        .end_node()
        .finish();
    let mut data = original.clone();

    assert_eq!(fstab::patch_dtb(&mut data, fstab::VERITY_FLAGS).unwrap(), 0);
    assert_eq!(data, original);
}

#[test]
fn malformed_trees() {
    let unbalanced = FdtBuilder::default()
        .begin_node("")
        .end_node()
        .end_node()
        .finish();
    assert_matches!(
        Fdt::parse(&unbalanced).unwrap().properties(),
        Err(dtb::Error::UnbalancedNodes(_))
    );

    let unclosed = FdtBuilder::default().begin_node("").finish();
    assert_matches!(
        Fdt::parse(&unclosed).unwrap().properties(),
        Err(dtb::Error::UnbalancedNodes(_))
    );

    let unknown = FdtBuilder::default()
        .begin_node("")
        .token(0x7)
        .end_node()
        .finish();
    assert_matches!(
        Fdt::parse(&unknown).unwrap().properties(),
        Err(dtb::Error::UnknownToken { token: 7, .. })
    );

    let mut truncated = fstab_tree(b"wait\0");
    truncated.truncate(truncated.len() - 8);
    assert_matches!(
        Fdt::parse(&truncated),
        Err(dtb::Error::IntOutOfBounds("totalsize", _))
    );

    // Invalid trees are skipped when searching.
    assert!(dtb::find_all(&unbalanced).is_empty());
}
