// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Removal of dm-verity and forced encryption flags from fstab entries. The
//! same logic applies to fstab files in the ramdisk and to `fsmgr_flags`
//! properties in device trees.

use tracing::{debug, trace};

use crate::format::dtb::{self, Fdt};

/// Flags that enable verified boot for a mount point.
pub const VERITY_FLAGS: &[&str] = &[
    "verifyatboot",
    "verify",
    "avb_keys",
    "avb",
    "support_scfs",
    "fsverity",
];

/// Flags that force the data partition to be encrypted.
pub const ENCRYPTION_FLAGS: &[&str] = &["forceencrypt", "forcefdeorfbe", "fileencryption"];

fn is_separator(b: u8) -> bool {
    b == b',' || b == 0 || b.is_ascii_whitespace()
}

/// Length of the flag (including any `=value` suffix) starting at the
/// beginning of `data`.
fn match_flag(data: &[u8], flags: &[&str]) -> Option<usize> {
    for flag in flags {
        let Some(rest) = data.strip_prefix(flag.as_bytes()) else {
            continue;
        };

        match rest.first() {
            None => return Some(flag.len()),
            Some(b'=') => {
                let value_len = rest.iter().position(|b| is_separator(*b)).unwrap_or(rest.len());
                return Some(flag.len() + value_len);
            }
            Some(&b) if is_separator(b) => return Some(flag.len()),
            _ => {}
        }
    }

    None
}

/// Remove all occurrences of the specified flags. Each removed flag takes one
/// adjacent comma with it. The preceding comma is preferred so that the
/// remaining list stays well formed. Returns the new data and the number of
/// flags removed.
pub fn remove_flags(data: &[u8], flags: &[&str]) -> (Vec<u8>, usize) {
    let mut result = Vec::with_capacity(data.len());
    let mut removed = 0;
    let mut i = 0;

    while i < data.len() {
        let at_boundary = i == 0 || is_separator(data[i - 1]);

        if at_boundary {
            if let Some(n) = match_flag(&data[i..], flags) {
                trace!(
                    "Removing flag: {:?}",
                    String::from_utf8_lossy(&data[i..i + n]),
                );

                if result.last() == Some(&b',') {
                    result.pop();
                    i += n;
                } else if data.get(i + n) == Some(&b',') {
                    i += n + 1;
                } else {
                    i += n;
                }

                removed += 1;
                continue;
            }
        }

        result.push(data[i]);
        i += 1;
    }

    (result, removed)
}

fn column_count(line: &[u8]) -> usize {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|c| !c.is_empty())
        .count()
}

/// Like [`remove_flags`], but operates on fstab lines. If every flag in the
/// `fs_mgr_flags` column is removed, the column is replaced with `defaults`
/// so that the line keeps all of its fields.
pub fn remove_fstab_flags(data: &[u8], flags: &[&str]) -> (Vec<u8>, usize) {
    let mut result = Vec::with_capacity(data.len());
    let mut removed = 0;

    for line in data.split_inclusive(|b| *b == b'\n') {
        let (mut new_line, n) = remove_flags(line, flags);

        let is_comment = line.trim_ascii_start().starts_with(b"#");
        if n > 0 && !is_comment && column_count(&new_line) < column_count(line) {
            let end = new_line
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |p| p + 1);

            // Reuse the separator that preceded the removed column.
            let has_separator = matches!(new_line.get(end), Some(b' ' | b'\t'));
            let rest = new_line.split_off(if has_separator { end + 1 } else { end });
            if !has_separator {
                new_line.push(b' ');
            }
            new_line.extend_from_slice(b"defaults");
            new_line.extend_from_slice(&rest);
        }

        removed += n;
        result.extend_from_slice(&new_line);
    }

    (result, removed)
}

/// Like [`remove_flags`], but keeps the buffer size the same by filling the
/// space at the end with zeros.
pub fn remove_flags_in_place(data: &mut [u8], flags: &[&str]) -> usize {
    let (new_data, removed) = remove_flags(data, flags);

    if removed > 0 {
        data[..new_data.len()].copy_from_slice(&new_data);
        data[new_data.len()..].fill(0);
    }

    removed
}

/// Remove flags from the `fsmgr_flags` property of every node below an
/// `fstab` node, in every device tree found in `data`. A device tree without
/// such properties is left untouched.
pub fn patch_dtb(data: &mut [u8], flags: &[&str]) -> Result<usize, dtb::Error> {
    let mut removed = 0;

    for range in dtb::find_all(data) {
        let properties = Fdt::parse(&data[range.clone()])?.properties()?;

        for prop in properties {
            if prop.name != "fsmgr_flags" || !prop.is_under("fstab") {
                continue;
            }

            let value = &mut data[range.start + prop.value.start..range.start + prop.value.end];
            let n = remove_flags_in_place(value, flags);

            if n > 0 {
                debug!("Removed {n} flags from {}/{}", prop.node, prop.name);
            }

            removed += n;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(data: &str, flags: &[&str]) -> (String, usize) {
        let (result, n) = remove_flags(data.as_bytes(), flags);
        (String::from_utf8(result).unwrap(), n)
    }

    #[test]
    fn verity_flags() {
        assert_eq!(
            strip("wait,verify,avb=vbmeta_system,first_stage_mount", VERITY_FLAGS),
            ("wait,first_stage_mount".to_owned(), 2),
        );
        assert_eq!(
            strip("avb,wait", VERITY_FLAGS),
            ("wait".to_owned(), 1),
        );
        assert_eq!(
            strip("wait,avb_keys=/avb/q-gsi.avbpubkey:/avb/r-gsi.avbpubkey", VERITY_FLAGS),
            ("wait".to_owned(), 1),
        );
        assert_eq!(strip("avb", VERITY_FLAGS), (String::new(), 1));
    }

    #[test]
    fn token_boundaries() {
        assert_eq!(
            strip("wait,verifyatboot_x,avbfoo,noverify", VERITY_FLAGS),
            ("wait,verifyatboot_x,avbfoo,noverify".to_owned(), 0),
        );
    }

    #[test]
    fn fstab_lines() {
        let input = "/dev/block/userdata /data ext4 noatime wait,check,forceencrypt=footer\n\
                     /dev/block/system /system ext4 ro wait,verify\n";
        let expected = "/dev/block/userdata /data ext4 noatime wait,check\n\
                        /dev/block/system /system ext4 ro wait\n";

        let (result, n) = remove_flags(input.as_bytes(), ENCRYPTION_FLAGS);
        assert_eq!(n, 1);
        let (result, n) = remove_flags(&result, VERITY_FLAGS);
        assert_eq!(n, 1);
        assert_eq!(String::from_utf8(result).unwrap(), expected);
    }

    #[test]
    fn empty_flags_column() {
        let input = "/dev/block/system /system ext4 ro verify\n\
                     # /dev/block/vendor /vendor ext4 ro avb\n\
                     /dev/block/odm /odm ext4 ro\tavb=vbmeta\n\
                     /dev/block/userdata /data f2fs noatime wait,verify";
        let expected = "/dev/block/system /system ext4 ro defaults\n\
                        # /dev/block/vendor /vendor ext4 ro \n\
                        /dev/block/odm /odm ext4 ro\tdefaults\n\
                        /dev/block/userdata /data f2fs noatime wait";

        let (result, n) = remove_fstab_flags(input.as_bytes(), VERITY_FLAGS);
        assert_eq!(n, 4);
        assert_eq!(String::from_utf8(result).unwrap(), expected);
    }

    #[test]
    fn in_place() {
        let mut data = *b"wait,avb\0";
        assert_eq!(remove_flags_in_place(&mut data, VERITY_FLAGS), 1);
        assert_eq!(&data, b"wait\0\0\0\0\0");

        let mut data = *b"wait\0";
        assert_eq!(remove_flags_in_place(&mut data, VERITY_FLAGS), 0);
        assert_eq!(&data, b"wait\0");
    }
}
