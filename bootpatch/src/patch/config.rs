// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt::Write,
    fs,
    io,
    path::{Path, PathBuf},
    str::ParseBoolError,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patch::hexpatch::{self, HexPatch};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid line in config record: {0:?}")]
    InvalidRecordLine(String),
    #[error("Invalid boolean for {key}: {value:?}")]
    InvalidBool {
        key: String,
        value: String,
        #[source]
        source: ParseBoolError,
    },
    #[error("Invalid hex patch rule: {0:?}")]
    HexPatch(String, #[source] hexpatch::Error),
    #[error("Failed to parse profile")]
    Toml(#[from] toml_edit::de::Error),
    #[error("Failed to read profile: {0:?}")]
    Io(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Options that control which ramdisk and image modifications are made.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchConfig {
    /// Leave dm-verity flags in fstab files and device trees.
    pub keep_verity: bool,
    /// Leave forced encryption flags in fstab files.
    pub keep_force_encrypt: bool,
    /// Disable verification in the vbmeta header of the AVB footer.
    pub patch_vbmeta_flag: bool,
    /// The image is a recovery image that boots into Magisk via a key combo.
    pub recovery_mode: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            keep_verity: true,
            keep_force_encrypt: true,
            patch_vbmeta_flag: false,
            recovery_mode: false,
        }
    }
}

/// The `.backup/.magisk` record that marks a ramdisk as patched.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BackupRecord {
    pub config: PatchConfig,
    /// Hex-encoded SHA-1 digest of the original image file.
    pub sha1: Option<String>,
    /// Hex-encoded SHA-1 digest of the original uncompressed ramdisk.
    pub ramdisk_sha1: Option<String>,
}

impl BackupRecord {
    const KEEP_VERITY: &'static str = "KEEPVERITY";
    const KEEP_FORCE_ENCRYPT: &'static str = "KEEPFORCEENCRYPT";
    const PATCH_VBMETA_FLAG: &'static str = "PATCHVBMETAFLAG";
    const RECOVERY_MODE: &'static str = "RECOVERYMODE";
    const SHA1: &'static str = "SHA1";
    const RAMDISK_SHA1: &'static str = "RAMDISKSHA1";

    /// Serialize to `KEY=value` lines. The key order is fixed.
    pub fn to_text(&self) -> String {
        let mut result = String::new();

        for (key, value) in [
            (Self::KEEP_VERITY, self.config.keep_verity),
            (Self::KEEP_FORCE_ENCRYPT, self.config.keep_force_encrypt),
            (Self::PATCH_VBMETA_FLAG, self.config.patch_vbmeta_flag),
            (Self::RECOVERY_MODE, self.config.recovery_mode),
        ] {
            let _ = writeln!(result, "{key}={value}");
        }

        if let Some(sha1) = &self.sha1 {
            let _ = writeln!(result, "{}={sha1}", Self::SHA1);
        }
        if let Some(sha1) = &self.ramdisk_sha1 {
            let _ = writeln!(result, "{}={sha1}", Self::RAMDISK_SHA1);
        }

        result
    }

    /// Parse `KEY=value` lines. Unknown keys are ignored so that records
    /// written by other tools can still be inspected.
    pub fn parse(data: &str) -> Result<Self> {
        let mut record = Self::default();

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidRecordLine(line.to_owned()))?;

            let parse_bool = |value: &str| {
                value.parse::<bool>().map_err(|e| Error::InvalidBool {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    source: e,
                })
            };

            match key {
                Self::KEEP_VERITY => record.config.keep_verity = parse_bool(value)?,
                Self::KEEP_FORCE_ENCRYPT => record.config.keep_force_encrypt = parse_bool(value)?,
                Self::PATCH_VBMETA_FLAG => record.config.patch_vbmeta_flag = parse_bool(value)?,
                Self::RECOVERY_MODE => record.config.recovery_mode = parse_bool(value)?,
                Self::SHA1 => record.sha1 = Some(value.to_owned()),
                Self::RAMDISK_SHA1 => record.ramdisk_sha1 = Some(value.to_owned()),
                _ => {}
            }
        }

        Ok(record)
    }
}

/// Flag overrides from a profile. Unset flags keep their current value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileFlags {
    pub keep_verity: Option<bool>,
    pub keep_force_encrypt: Option<bool>,
    pub patch_vbmeta_flag: Option<bool>,
    pub recovery_mode: Option<bool>,
}

impl ProfileFlags {
    pub fn apply(&self, config: &mut PatchConfig) {
        if let Some(v) = self.keep_verity {
            config.keep_verity = v;
        }
        if let Some(v) = self.keep_force_encrypt {
            config.keep_force_encrypt = v;
        }
        if let Some(v) = self.patch_vbmeta_flag {
            config.patch_vbmeta_flag = v;
        }
        if let Some(v) = self.recovery_mode {
            config.recovery_mode = v;
        }
    }
}

/// An extra file to inject into the ramdisk.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraFile {
    /// Destination path in the ramdisk.
    pub path: String,
    #[serde(with = "crate::octal")]
    pub mode: u16,
    /// Source path, relative to the payload directory.
    pub source: PathBuf,
    /// Whether to store the file xz-compressed.
    #[serde(default)]
    pub xz: bool,
}

/// A TOML patch profile.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub flags: ProfileFlags,
    #[serde(default, rename = "file")]
    pub files: Vec<ExtraFile>,
    /// [`None`] selects [`hexpatch::builtin_rules`].
    #[serde(rename = "hex_patch")]
    pub hex_patches: Option<Vec<HexPatch>>,
}

impl Profile {
    pub fn from_toml(data: &str) -> Result<Self> {
        let profile: Self = toml_edit::de::from_str(data)?;

        for rule in profile.hex_patches.iter().flatten() {
            rule.validate()
                .map_err(|e| Error::HexPatch(rule.label.clone(), e))?;
        }

        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Io(path.to_owned(), e))?;

        Self::from_toml(&data)
    }

    /// The hex patch rules to use, falling back to the built-in set.
    pub fn hex_patches(&self) -> Vec<HexPatch> {
        match &self.hex_patches {
            Some(p) => p.clone(),
            None => hexpatch::builtin_rules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let record = BackupRecord {
            config: PatchConfig {
                keep_verity: false,
                ..Default::default()
            },
            sha1: Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_owned()),
            ramdisk_sha1: None,
        };

        let text = record.to_text();
        assert_eq!(
            text,
            "KEEPVERITY=false\n\
             KEEPFORCEENCRYPT=true\n\
             PATCHVBMETAFLAG=false\n\
             RECOVERYMODE=false\n\
             SHA1=da39a3ee5e6b4b0d3255bfef95601890afd80709\n",
        );
        assert_eq!(BackupRecord::parse(&text).unwrap(), record);
    }

    #[test]
    fn record_errors() {
        assert!(matches!(
            BackupRecord::parse("KEEPVERITY=maybe"),
            Err(Error::InvalidBool { .. }),
        ));
        assert!(matches!(
            BackupRecord::parse("garbage"),
            Err(Error::InvalidRecordLine(_)),
        ));
        assert!(BackupRecord::parse("PREINITDEVICE=sda\n").is_ok());
    }

    #[test]
    fn profile() {
        let profile = Profile::from_toml(
            r#"
            [flags]
            keep_verity = false

            [[file]]
            path = "overlay.d/sbin/init_patch"
            mode = "750"
            source = "init_patch"

            [[hex_patch]]
            label = "skip_initramfs"
            target = "kernel"
            search = "736B69705F696E697472616D667300"
            replace = "77616E745F696E697472616D667300"
            mandatory = true
            "#,
        )
        .unwrap();

        let mut config = PatchConfig::default();
        profile.flags.apply(&mut config);
        assert!(!config.keep_verity);
        assert!(config.keep_force_encrypt);

        assert_eq!(profile.files[0].mode, 0o750);
        assert!(!profile.files[0].xz);

        let rules = profile.hex_patches();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].search, b"skip_initramfs\0");
        assert!(rules[0].mandatory);

        assert_eq!(Profile::default().hex_patches().len(), 3);
    }

    #[test]
    fn profile_errors() {
        assert!(matches!(
            Profile::from_toml("[flags]\nkeep_veriyt = true\n"),
            Err(Error::Toml(_)),
        ));
        assert!(matches!(
            Profile::from_toml(
                "[[hex_patch]]\nlabel = \"x\"\ntarget = \"kernel\"\nsearch = \"00\"\nreplace = \"0000\"\n",
            ),
            Err(Error::HexPatch(_, hexpatch::Error::LengthMismatch { .. })),
        ));
    }
}
