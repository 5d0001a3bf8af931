/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
    str,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::status,
    format::{
        compression::CompressedFormat,
        cpio::CpioEntry,
    },
    patch::{boot, ramdisk},
};

static CONTENT_BEGIN: &str = "----- BEGIN UTF-8 CONTENT -----";
static CONTENT_END: &str = "----- END UTF-8 CONTENT -----";
static CONTENT_END_NO_NEWLINE: &str = "----- END UTF-8 CONTENT (NO NEWLINE) -----";

static BINARY_BEGIN: &str = "----- BEGIN BINARY CONTENT -----";
static BINARY_END: &str = "----- END BINARY CONTENT -----";
static BINARY_END_TRUNCATED: &str = "----- END BINARY CONTENT (TRUNCATED) -----";

static NO_DATA: &str = "----- NO DATA -----";

fn print_content(data: &[u8], truncate: bool) {
    if data.is_empty() {
        println!("{NO_DATA}");
        return;
    }

    if !data.contains(&b'\0') {
        if let Ok(s) = str::from_utf8(data) {
            if !s.contains(CONTENT_BEGIN)
                && !s.contains(CONTENT_END)
                && !s.contains(CONTENT_END_NO_NEWLINE)
            {
                println!("{CONTENT_BEGIN}");
                print!("{s}");
                if data.last() == Some(&b'\n') {
                    println!("{CONTENT_END}");
                } else {
                    println!();
                    println!("{CONTENT_END_NO_NEWLINE}");
                }

                return;
            }
        }
    }

    println!("{BINARY_BEGIN}");

    if data.len() > 512 && truncate {
        println!("{}", data[..512].escape_ascii());
        println!("{BINARY_END_TRUNCATED}");
    } else {
        println!("{}", data.escape_ascii());
        println!("{BINARY_END}");
    }
}

fn load_archive(
    path: &Path,
    cancel_signal: &AtomicBool,
) -> Result<(Vec<CpioEntry>, CompressedFormat)> {
    let data = fs::read(path)?;
    let (archive, format) = ramdisk::unpack(&data, cancel_signal)?;
    let entries = ramdisk::decode(&archive, cancel_signal)?;

    Ok((entries, format))
}

fn dump_subcommand(cli: &DumpCli, cancel_signal: &AtomicBool) -> Result<()> {
    let (entries, format) = load_archive(&cli.input, cancel_signal)
        .with_context(|| format!("Failed to read cpio: {:?}", cli.input))?;

    println!("Compression format: {format}");
    println!();

    for entry in entries {
        println!("{entry}");
        print_content(&entry.data, !cli.no_truncate);
        println!();
    }

    Ok(())
}

fn restore_subcommand(cli: &RestoreCli, cancel_signal: &AtomicBool) -> Result<()> {
    let data = boot::restore_ramdisk(&cli.input, cancel_signal)
        .with_context(|| format!("Failed to restore original ramdisk: {:?}", cli.input))?;

    fs::write(&cli.output, &data)
        .with_context(|| format!("Failed to write ramdisk: {:?}", cli.output))?;

    status!("Wrote original ramdisk to {:?}", cli.output);

    Ok(())
}

pub fn ramdisk_main(cli: &RamdiskCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        RamdiskCommand::Dump(c) => dump_subcommand(c, cancel_signal),
        RamdiskCommand::Restore(c) => restore_subcommand(c, cancel_signal),
    }
}

/// Dump cpio headers and data.
#[derive(Debug, Parser)]
struct DumpCli {
    /// Path to input cpio file. The file may be compressed.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Do not truncate binary file contents.
    #[arg(long)]
    no_truncate: bool,
}

/// Extract the original ramdisk from a patched boot image.
#[derive(Debug, Parser)]
struct RestoreCli {
    /// Path to patched boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output ramdisk file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RamdiskCommand {
    Dump(DumpCli),
    Restore(RestoreCli),
}

/// Inspect ramdisk cpio archives.
#[derive(Debug, Parser)]
pub struct RamdiskCli {
    #[command(subcommand)]
    command: RamdiskCommand,
}
