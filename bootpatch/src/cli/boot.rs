// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use regex::bytes::Regex;
use tracing::debug;

use crate::{
    cli::{status, warning},
    format::{
        bootimage::{BootImage, BootImageExt, SectionKind},
        compression,
        footer::{self, Trailer},
    },
    patch::boot as patch_boot,
    util::NumBytes,
};

const HEADER_FILE: &str = "header.toml";

const KERNEL_VERSION_REGEX: &str = r"Linux version ([0-9A-Za-z._+-]+)";

fn read_image(path: &Path) -> Result<(BootImage, Trailer)> {
    let data = fs::read(path).with_context(|| format!("Failed to read: {path:?}"))?;
    let result = footer::load_image(&data)
        .with_context(|| format!("Failed to read boot image: {path:?}"))?;

    Ok(result)
}

fn write_image(path: &Path, image: &BootImage, trailer: &Trailer) -> Result<()> {
    let data = image
        .to_vec()
        .with_context(|| format!("Failed to serialize boot image: {path:?}"))?;
    let data = trailer
        .apply(data)
        .with_context(|| format!("Failed to attach trailer: {path:?}"))?;

    fs::write(path, data).with_context(|| format!("Failed to write: {path:?}"))
}

/// Find the `Linux version ...` banner in a possibly compressed kernel.
fn kernel_version(kernel: &[u8], cancel_signal: &AtomicBool) -> Result<Option<String>> {
    let (raw, _) = compression::decompress(kernel, true, cancel_signal)?;
    let regex = Regex::new(KERNEL_VERSION_REGEX)?;

    Ok(regex
        .captures(&raw)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned()))
}

fn print_summary(image: &BootImage, trailer: &Trailer) -> Result<()> {
    let header = toml_edit::ser::to_string_pretty(image)?;

    println!("Header version: {}", image.header_version());
    println!("Header size: {}", image.header_size());
    print!("{header}");

    for (name, data) in image.sections() {
        println!("Section {name}: {:?}", NumBytes(data.len()));
    }

    match trailer {
        Trailer::None => {}
        Trailer::Raw(data) => println!("Trailing data: {:?}", NumBytes(data.len())),
        Trailer::Avb(avb) => println!(
            "AVB footer: {:?} partition, {:?} vbmeta, {:?} trailing data",
            NumBytes(avb.partition_size),
            NumBytes(avb.vbmeta.len()),
            NumBytes(avb.tail.len()),
        ),
    }

    Ok(())
}

fn display_info(cli: &BootCli, image: &BootImage, trailer: &Trailer) -> Result<()> {
    if cli.quiet {
        return Ok(());
    }

    if cli.debug {
        println!("{image:#?}");
        println!("{trailer:#?}");
        Ok(())
    } else {
        print_summary(image, trailer)
    }
}

fn unpack_subcommand(boot_cli: &BootCli, cli: &UnpackCli) -> Result<()> {
    let (image, trailer) = read_image(&cli.input)?;
    display_info(boot_cli, &image, &trailer)?;

    if trailer != Trailer::None {
        warning!("Data after the boot image is not unpacked");
    }

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;

    let header_path = cli.output_dir.join(HEADER_FILE);
    let header = toml_edit::ser::to_string_pretty(&image)
        .with_context(|| format!("Failed to serialize header: {header_path:?}"))?;
    fs::write(&header_path, header)
        .with_context(|| format!("Failed to write: {header_path:?}"))?;

    for (name, data) in image.sections() {
        if data.is_empty() {
            debug!("Skipping empty section: {name}");
            continue;
        }

        let path = cli.output_dir.join(&name);
        fs::write(&path, data).with_context(|| format!("Failed to write: {path:?}"))?;
    }

    status!("Unpacked to {:?}", cli.output_dir);

    Ok(())
}

fn pack_subcommand(boot_cli: &BootCli, cli: &PackCli) -> Result<()> {
    let header_path = cli.input_dir.join(HEADER_FILE);
    let header = fs::read_to_string(&header_path)
        .with_context(|| format!("Failed to read: {header_path:?}"))?;
    let mut image: BootImage = toml_edit::de::from_str(&header)
        .with_context(|| format!("Failed to parse header: {header_path:?}"))?;

    for name in image.section_names() {
        let path = cli.input_dir.join(&name);

        // Missing files are empty sections, matching what unpack skips.
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read: {path:?}")),
        };

        image
            .set_section(&name, data)
            .with_context(|| format!("Failed to load section: {path:?}"))?;
    }

    // Every ramdisk in the table needs data, even if it is empty.
    if let BootImage::VendorV3Through4(b) = &mut image {
        let count = b.v4_extra.as_ref().map_or(1, |v4| v4.ramdisk_metas.len());
        b.ramdisks.resize(count, vec![]);
    }

    display_info(boot_cli, &image, &Trailer::None)?;
    write_image(&cli.output, &image, &Trailer::None)?;

    status!("Wrote {:?}", cli.output);

    Ok(())
}

fn repack_subcommand(boot_cli: &BootCli, cli: &RepackCli) -> Result<()> {
    if cli.input == cli.output {
        bail!("Input and output must be different files: {:?}", cli.input);
    }

    let (image, trailer) = read_image(&cli.input)?;
    display_info(boot_cli, &image, &trailer)?;
    write_image(&cli.output, &image, &trailer)?;

    Ok(())
}

fn info_subcommand(cli: &InfoCli, cancel_signal: &AtomicBool) -> Result<()> {
    let (image, trailer) = read_image(&cli.input)?;
    print_summary(&image, &trailer)?;

    if let Some(kernel) = image.section(SectionKind::Kernel).filter(|k| !k.is_empty()) {
        match kernel_version(kernel, cancel_signal)? {
            Some(v) => println!("Kernel version: {v}"),
            None => println!("Kernel version: unknown"),
        }
    }

    Ok(())
}

fn status_subcommand(cli: &StatusCli, cancel_signal: &AtomicBool) -> Result<()> {
    let record = patch_boot::patch_status(&cli.input, cancel_signal)
        .with_context(|| format!("Failed to inspect ramdisk: {:?}", cli.input))?;

    match record {
        Some(r) => {
            status!("Boot image is patched");
            print!("{}", r.to_text());
        }
        None => status!("Boot image is not patched"),
    }

    Ok(())
}

pub fn boot_main(cli: &BootCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        BootCommand::Unpack(c) => unpack_subcommand(cli, c),
        BootCommand::Pack(c) => pack_subcommand(cli, c),
        BootCommand::Repack(c) => repack_subcommand(cli, c),
        BootCommand::Info(c) => info_subcommand(c, cancel_signal),
        BootCommand::Status(c) => status_subcommand(c, cancel_signal),
    }
}

/// Unpack a boot image into a directory.
///
/// The header fields are written to `header.toml` and each non-empty section
/// is written to a file named after the section.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Directory to write the header and sections to.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    output_dir: PathBuf,
}

/// Pack a boot image from an unpacked directory.
#[derive(Debug, Parser)]
struct PackCli {
    /// Directory containing `header.toml` and section files.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    input_dir: PathBuf,

    /// Path to output boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Parse and reserialize a boot image.
#[derive(Debug, Parser)]
struct RepackCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Display boot image header information and the kernel version.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Report whether a boot image has already been patched.
#[derive(Debug, Parser)]
struct StatusCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BootCommand {
    Unpack(UnpackCli),
    Pack(PackCli),
    Repack(RepackCli),
    Info(InfoCli),
    Status(StatusCli),
}

/// Pack or unpack boot images.
#[derive(Debug, Parser)]
pub struct BootCli {
    #[command(subcommand)]
    command: BootCommand,

    /// Don't print boot image header information.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print boot image header information in debug format.
    #[arg(short, long, global = true)]
    debug: bool,
}
