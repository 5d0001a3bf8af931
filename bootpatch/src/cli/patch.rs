// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tracing::debug;

use crate::{
    cli::status,
    patch::{
        boot::{self, PatchPlan},
        config::{PatchConfig, Profile, ProfileFlags},
    },
};

const PAYLOAD_INIT: &str = "magiskinit";
const PAYLOAD_MAGISK32: &str = "magisk32";
const PAYLOAD_MAGISK64: &str = "magisk64";

fn read_payload(dir: &Path, name: &Path) -> Result<Vec<u8>, boot::Error> {
    let path = dir.join(name);
    fs::read(&path).map_err(|e| boot::Error::File(path, e))
}

fn read_optional_payload(dir: &Path, name: &str) -> Result<Option<Vec<u8>>, boot::Error> {
    match read_payload(dir, Path::new(name)) {
        Ok(data) => Ok(Some(data)),
        Err(boot::Error::File(_, e)) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Payload not found: {name}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn build_plan(cli: &PatchCli) -> Result<PatchPlan> {
    let profile = match &cli.profile {
        Some(path) => Profile::load(path)
            .map_err(boot::Error::from)
            .with_context(|| format!("Failed to load profile: {path:?}"))?,
        None => Profile::default(),
    };

    let mut config = PatchConfig::default();
    profile.flags.apply(&mut config);
    ProfileFlags::from(&cli.flags).apply(&mut config);
    debug!("Patch config: {config:?}");

    let mut builder = PatchPlan::builder()
        .config(config)
        .hex_patches(profile.hex_patches());

    let payload_dir = cli.payload_dir.as_deref().unwrap_or(Path::new("."));

    if cli.payload_dir.is_some() {
        if let Some(data) = read_optional_payload(payload_dir, PAYLOAD_INIT)? {
            builder = builder.init(data);
        }

        let magisk32 = read_optional_payload(payload_dir, PAYLOAD_MAGISK32)?;
        let magisk64 = read_optional_payload(payload_dir, PAYLOAD_MAGISK64)?;
        builder = builder.magisk(magisk32, magisk64);
    }

    for file in &profile.files {
        let data = read_payload(payload_dir, &file.source)?;

        builder = if file.xz {
            builder.xz_file(file.path.as_str(), file.mode, data)
        } else {
            builder.file(file.path.as_str(), file.mode, data)
        };
    }

    Ok(builder.build()?)
}

pub fn patch_main(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let start = Instant::now();

    let plan = build_plan(cli)?;
    debug!("Patch plan: {plan:?}");

    let result = boot::run(
        &cli.input,
        &cli.output,
        cli.work_dir.as_deref(),
        &plan,
        cancel_signal,
    )
    .with_context(|| format!("Failed to patch {:?}", cli.input))?;

    status!(
        "Wrote {:?} ({} bytes, SHA-1 {})",
        result.output,
        result.size,
        result.sha1,
    );
    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Overrides for the patch flags. These take precedence over the profile.
#[derive(Debug, Args)]
pub struct FlagOverrides {
    /// Keep dm-verity flags in fstab files and device trees.
    #[arg(long, value_name = "BOOL")]
    pub keep_verity: Option<bool>,

    /// Keep forced encryption flags in fstab files.
    #[arg(long, value_name = "BOOL")]
    pub keep_force_encrypt: Option<bool>,

    /// Disable verification in the AVB vbmeta header.
    #[arg(long, value_name = "BOOL")]
    pub patch_vbmeta_flag: Option<bool>,

    /// The image is a recovery image.
    #[arg(long, value_name = "BOOL")]
    pub recovery_mode: Option<bool>,
}

impl From<&FlagOverrides> for ProfileFlags {
    fn from(value: &FlagOverrides) -> Self {
        Self {
            keep_verity: value.keep_verity,
            keep_force_encrypt: value.keep_force_encrypt,
            patch_vbmeta_flag: value.patch_vbmeta_flag,
            recovery_mode: value.recovery_mode,
        }
    }
}

/// Patch a boot image.
#[derive(Debug, Parser)]
pub struct PatchCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Directory containing magiskinit, magisk32, and magisk64.
    ///
    /// Files listed in the profile are also read relative to this directory.
    #[arg(long, value_name = "DIR", value_parser)]
    pub payload_dir: Option<PathBuf>,

    /// Path to patch profile TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    pub profile: Option<PathBuf>,

    /// Directory to write unpacked sections to for inspection.
    ///
    /// The directory is deleted and recreated.
    #[arg(long, value_name = "DIR", value_parser)]
    pub work_dir: Option<PathBuf>,

    #[command(flatten)]
    pub flags: FlagOverrides,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::patch::config::{PatchConfig, ProfileFlags};

    use super::PatchCli;

    #[test]
    fn flag_overrides_take_precedence() {
        let cli = PatchCli::try_parse_from([
            "patch",
            "--input",
            "boot.img",
            "--output",
            "patched.img",
            "--keep-verity",
            "false",
            "--recovery-mode",
            "true",
        ])
        .unwrap();

        let profile = ProfileFlags {
            keep_verity: Some(true),
            keep_force_encrypt: Some(true),
            ..Default::default()
        };

        let mut config = PatchConfig::default();
        profile.apply(&mut config);
        ProfileFlags::from(&cli.flags).apply(&mut config);

        assert_eq!(
            config,
            PatchConfig {
                keep_verity: false,
                keep_force_encrypt: true,
                patch_vbmeta_flag: false,
                recovery_mode: true,
            },
        );
    }
}
