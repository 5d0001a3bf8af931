// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::{status, warning},
    patch::{boot, hexpatch},
    stream,
};

pub fn hexpatch_main(cli: &HexpatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let search = hexpatch::parse_hex(&cli.search).map_err(boot::Error::from)?;
    let replace = hexpatch::parse_hex(&cli.replace).map_err(boot::Error::from)?;

    let mut data =
        fs::read(&cli.input).with_context(|| format!("Failed to read: {:?}", cli.input))?;

    stream::check_cancel(cancel_signal)?;

    let count = hexpatch::apply_in_place(&mut data, &search, &replace)
        .map_err(boot::Error::from)
        .context("Failed to apply patch")?;

    if count == 0 {
        warning!("Pattern not found");
    } else {
        status!("Replaced {count} occurrences");
    }

    let output = cli.output.as_ref().unwrap_or(&cli.input);
    fs::write(output, &data).with_context(|| format!("Failed to write: {output:?}"))?;

    println!("{count}");

    Ok(())
}

/// Replace every occurrence of a byte pattern in a file.
#[derive(Debug, Parser)]
pub struct HexpatchCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output file. Defaults to patching the input in place.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,

    /// Hex-encoded pattern to search for.
    #[arg(value_name = "SEARCH")]
    pub search: String,

    /// Hex-encoded replacement of the same length.
    #[arg(value_name = "REPLACE")]
    pub replace: String,
}
