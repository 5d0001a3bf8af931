// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Byte-exact search and replace over binary blobs.

use memchr::memmem;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::format::bootimage::SectionKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Search pattern is empty")]
    EmptyPattern,
    #[error("Search and replace patterns have different lengths: {search} != {replace}")]
    LengthMismatch { search: usize, replace: usize },
    #[error("Invalid hex string: {0:?}")]
    InvalidHex(String, #[source] hex::FromHexError),
}

type Result<T> = std::result::Result<T, Error>;

fn check_patterns(search: &[u8], replace: &[u8]) -> Result<()> {
    if search.is_empty() {
        return Err(Error::EmptyPattern);
    } else if search.len() != replace.len() {
        return Err(Error::LengthMismatch {
            search: search.len(),
            replace: replace.len(),
        });
    }

    Ok(())
}

/// Replace every non-overlapping occurrence of `search`, scanning from left to
/// right. Returns the number of replacements.
pub fn apply_in_place(data: &mut [u8], search: &[u8], replace: &[u8]) -> Result<usize> {
    check_patterns(search, replace)?;

    let offsets = memmem::find_iter(data, search).collect::<Vec<_>>();

    for offset in &offsets {
        data[*offset..*offset + replace.len()].copy_from_slice(replace);
    }

    Ok(offsets.len())
}

/// Like [`apply_in_place`], but returns a patched copy of the blob.
pub fn apply(data: &[u8], search: &[u8], replace: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut result = data.to_vec();
    let count = apply_in_place(&mut result, search, replace)?;

    Ok((result, count))
}

/// Parse a hex string, ignoring case.
pub fn parse_hex(data: &str) -> Result<Vec<u8>> {
    hex::decode(data).map_err(|e| Error::InvalidHex(data.to_owned(), e))
}

/// A labelled search/replace rule for one boot image section.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HexPatch {
    pub label: String,
    pub target: SectionKind,
    #[serde(with = "hex")]
    pub search: Vec<u8>,
    #[serde(with = "hex")]
    pub replace: Vec<u8>,
    /// Whether zero matches should fail the patching process.
    #[serde(default)]
    pub mandatory: bool,
}

impl HexPatch {
    pub fn new(
        label: &str,
        target: SectionKind,
        search: &[u8],
        replace: &[u8],
        mandatory: bool,
    ) -> Result<Self> {
        let patch = Self {
            label: label.to_owned(),
            target,
            search: search.to_vec(),
            replace: replace.to_vec(),
            mandatory,
        };
        patch.validate()?;

        Ok(patch)
    }

    pub fn validate(&self) -> Result<()> {
        check_patterns(&self.search, &self.replace)
    }

    pub fn apply_in_place(&self, data: &mut [u8]) -> Result<usize> {
        let count = apply_in_place(data, &self.search, &self.replace)?;
        debug!("{}: {count} matches in {}", self.label, self.target);

        Ok(count)
    }
}

const SAMSUNG_RKP_SEARCH: [u8; 40] = [
    0x49, 0x01, 0x00, 0x54, 0x01, 0x14, 0x40, 0xb9, 0x3f, 0xa0, 0x0f, 0x71, 0xe9, 0x00, 0x00, 0x54,
    0x01, 0x08, 0x40, 0xb9, 0x3f, 0xa0, 0x0f, 0x71, 0x89, 0x00, 0x00, 0x54, 0x00, 0x18, 0x40, 0xb9,
    0x1f, 0xa0, 0x0f, 0x71, 0x88, 0x01, 0x00, 0x54,
];
const SAMSUNG_RKP_REPLACE: [u8; 40] = [
    0xa1, 0x02, 0x00, 0x54, 0x01, 0x14, 0x40, 0xb9, 0x3f, 0xa0, 0x0f, 0x71, 0x40, 0x02, 0x00, 0x54,
    0x01, 0x08, 0x40, 0xb9, 0x3f, 0xa0, 0x0f, 0x71, 0xe0, 0x01, 0x00, 0x54, 0x00, 0x18, 0x40, 0xb9,
    0x1f, 0xa0, 0x0f, 0x71, 0x81, 0x01, 0x00, 0x54,
];

/// The default kernel rules. None of them are mandatory since each only
/// applies to some kernels.
pub fn builtin_rules() -> Vec<HexPatch> {
    let rule = |label: &str, search: &[u8], replace: &[u8]| HexPatch {
        label: label.to_owned(),
        target: SectionKind::Kernel,
        search: search.to_vec(),
        replace: replace.to_vec(),
        mandatory: false,
    };

    vec![
        rule(
            "Remove Samsung RKP",
            &SAMSUNG_RKP_SEARCH,
            &SAMSUNG_RKP_REPLACE,
        ),
        rule(
            "Remove Samsung defex",
            &[0x82, 0x1b, 0x80, 0x12],
            &[0xe2, 0xff, 0x8f, 0x12],
        ),
        rule(
            "skip_initramfs -> want_initramfs",
            b"skip_initramfs\0",
            b"want_initramfs\0",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_valid() {
        for rule in builtin_rules() {
            rule.validate().unwrap();
        }
    }

    #[test]
    fn non_overlapping() {
        let (data, count) = apply(b"aaaaa", b"aa", b"bb").unwrap();
        assert_eq!(data, b"bbbba");
        assert_eq!(count, 2);
    }

    #[test]
    fn hex_strings() {
        assert_eq!(parse_hex("736B6970").unwrap(), b"skip");
        assert_eq!(parse_hex("736b6970").unwrap(), b"skip");
        assert!(matches!(parse_hex("73z"), Err(Error::InvalidHex(_, _))));
    }
}
