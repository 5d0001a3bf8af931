/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use crate::cli::{boot, completion, hexpatch, patch, ramdisk};

#[derive(Debug, Subcommand)]
pub enum Command {
    Boot(boot::BootCli),
    Completion(completion::CompletionCli),
    Hexpatch(hexpatch::HexpatchCli),
    Patch(patch::PatchCli),
    Ramdisk(ramdisk::RamdiskCli),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    #[default]
    Short,
    /// Include the target and span list.
    Medium,
    /// Include timestamps, thread IDs, and source locations.
    Long,
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,
}

fn init_logging(cli: &Cli) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(cli.log_level));

    match cli.log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Medium => builder.without_time().init(),
        LogFormat::Long => builder
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Boot(c) => boot::boot_main(&c, cancel_signal),
        Command::Completion(c) => completion::completion_main(&c),
        Command::Hexpatch(c) => hexpatch::hexpatch_main(&c, cancel_signal),
        Command::Patch(c) => patch::patch_main(&c, cancel_signal),
        Command::Ramdisk(c) => ramdisk::ramdisk_main(&c, cancel_signal),
    }
}
