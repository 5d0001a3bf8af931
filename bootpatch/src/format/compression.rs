// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, Write},
    sync::atomic::AtomicBool,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use liblzma::{
    read::XzDecoder,
    stream::{Check, LzmaOptions, Stream},
    write::XzEncoder,
};
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream;

static GZIP_MAGIC: &[u8; 2] = b"\x1f\x8b";
static LZ4_LEGACY_MAGIC: &[u8; 4] = b"\x02\x21\x4c\x18";
static XZ_MAGIC: &[u8; 6] = b"\xfd\x37\x7a\x58\x5a\x00";
/// lc=3, lp=0, pb=2 properties byte followed by the low bytes of a dictionary
/// size, which is what every known kernel and ramdisk lzma encoder emits.
static LZMA_MAGIC: &[u8; 3] = b"\x5d\x00\x00";

/// Maximum LZ4 legacy block size.
const LZ4_LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;

const XZ_PRESET: u32 = 9;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("I/O error when autodetecting compression format")]
    AutoDetect(#[source] io::Error),
    #[error("Failed to initialize legacy LZ4 encoder")]
    Lz4Init(#[source] io::Error),
    #[error("Failed to initialize {0} encoder or decoder")]
    LzmaInit(CompressedFormat, #[source] liblzma::stream::Error),
    #[error("Failed to decompress {0} data")]
    Decompress(CompressedFormat, #[source] io::Error),
    #[error("Failed to compress {0} data")]
    Compress(CompressedFormat, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub struct Lz4LegacyEncoder<W: Write> {
    writer: Option<W>,
    buf: Vec<u8>,
    n_filled: usize,
}

impl<W: Write> Lz4LegacyEncoder<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        writer.write_all(LZ4_LEGACY_MAGIC)?;

        Ok(Self {
            writer: Some(writer),
            buf: vec![0u8; LZ4_LEGACY_BLOCK_SIZE],
            n_filled: 0,
        })
    }

    fn write_block(&mut self, force: bool) -> io::Result<()> {
        if !force && self.n_filled < self.buf.len() {
            return Ok(());
        }

        // lz4_flex has no HC mode, so blocks are compressed with the fast
        // compressor. The bootloader's decoder doesn't care.
        let compressed = lz4_flex::block::compress(&self.buf[..self.n_filled]);

        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::other("Encoder already finished"));
        };
        writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
        writer.write_all(&compressed)?;

        self.n_filled = 0;

        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.write_block(true)?;
        self.writer
            .take()
            .ok_or_else(|| io::Error::other("Encoder already finished"))
    }
}

impl<W: Write> Drop for Lz4LegacyEncoder<W> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = self.write_block(true);
        }
    }
}

impl<W: Write> Write for Lz4LegacyEncoder<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            let to_write = buf.len().min(self.buf.len() - self.n_filled);
            self.buf[self.n_filled..self.n_filled + to_write].copy_from_slice(&buf[..to_write]);

            self.n_filled += to_write;
            self.write_block(false)?;

            buf = &buf[to_write..];
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_block(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressedFormat {
    None,
    Gzip,
    Lz4Legacy,
    Lzma,
    Xz,
}

impl CompressedFormat {
    /// Detect the format from the leading bytes of a buffer.
    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if magic.starts_with(LZ4_LEGACY_MAGIC) {
            Some(Self::Lz4Legacy)
        } else if magic.starts_with(XZ_MAGIC) {
            Some(Self::Xz)
        } else if magic.starts_with(LZMA_MAGIC) {
            Some(Self::Lzma)
        } else {
            None
        }
    }
}

impl fmt::Display for CompressedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "uncompressed",
            Self::Gzip => "gzip",
            Self::Lz4Legacy => "lz4_legacy",
            Self::Lzma => "lzma",
            Self::Xz => "xz",
        };

        f.write_str(name)
    }
}

pub enum CompressedReader<R: Read> {
    None(R),
    Gzip(GzDecoder<R>),
    Lz4(FrameDecoder<R>),
    Lzma(XzDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::None => Ok(Self::None(reader)),
            CompressedFormat::Gzip => Ok(Self::Gzip(GzDecoder::new(reader))),
            CompressedFormat::Lz4Legacy => Ok(Self::Lz4(FrameDecoder::new(reader))),
            CompressedFormat::Lzma => {
                let stream = Stream::new_lzma_decoder(u64::MAX)
                    .map_err(|e| Error::LzmaInit(format, e))?;
                Ok(Self::Lzma(XzDecoder::new_stream(reader, stream)))
            }
            CompressedFormat::Xz => Ok(Self::Xz(XzDecoder::new(reader))),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Gzip(_) => CompressedFormat::Gzip,
            Self::Lz4(_) => CompressedFormat::Lz4Legacy,
            Self::Lzma(_) => CompressedFormat::Lzma,
            Self::Xz(_) => CompressedFormat::Xz,
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Autodetect the compression format from the magic bytes at the current
    /// position and rewind. If the format is unknown and `raw_if_unknown` is
    /// true, the data is passed through unchanged.
    pub fn new(mut reader: R, raw_if_unknown: bool) -> Result<Self> {
        let mut magic = Vec::with_capacity(XZ_MAGIC.len());
        (&mut reader)
            .take(XZ_MAGIC.len() as u64)
            .read_to_end(&mut magic)
            .map_err(Error::AutoDetect)?;

        reader.rewind().map_err(Error::AutoDetect)?;

        match CompressedFormat::detect(&magic) {
            Some(format) => Self::with_format(reader, format),
            None if raw_if_unknown => Ok(Self::None(reader)),
            None => Err(Error::UnknownFormat),
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::Lzma(r) | Self::Xz(r) => r.read(buf),
        }
    }
}

#[allow(clippy::large_enum_variant)]
pub enum CompressedWriter<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Lz4Legacy(Lz4LegacyEncoder<W>),
    Lzma(XzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(writer: W, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::None => Ok(Self::None(writer)),
            // The gzip header has no timestamp or file name, so output is
            // reproducible.
            CompressedFormat::Gzip => Ok(Self::Gzip(GzEncoder::new(writer, Compression::best()))),
            CompressedFormat::Lz4Legacy => {
                let encoder = Lz4LegacyEncoder::new(writer).map_err(Error::Lz4Init)?;
                Ok(Self::Lz4Legacy(encoder))
            }
            CompressedFormat::Lzma => {
                let options =
                    LzmaOptions::new_preset(XZ_PRESET).map_err(|e| Error::LzmaInit(format, e))?;
                let stream =
                    Stream::new_lzma_encoder(&options).map_err(|e| Error::LzmaInit(format, e))?;
                Ok(Self::Lzma(XzEncoder::new_stream(writer, stream)))
            }
            CompressedFormat::Xz => Ok(Self::Xz(XzEncoder::new_stream(
                writer,
                xz_stream().map_err(|e| Error::LzmaInit(format, e))?,
            ))),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(w) => w.finish(),
            Self::Lz4Legacy(w) => w.finish(),
            Self::Lzma(w) | Self::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Lz4Legacy(w) => w.write(buf),
            Self::Lzma(w) | Self::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Lz4Legacy(w) => w.flush(),
            Self::Lzma(w) | Self::Xz(w) => w.flush(),
        }
    }
}

/// XZ encoder settings for anything the kernel or init has to decompress. Some
/// kernels are compiled without support for the default CRC64 check.
pub fn xz_stream() -> std::result::Result<Stream, liblzma::stream::Error> {
    Stream::new_easy_encoder(XZ_PRESET, Check::Crc32)
}

/// Compress a file that will be stored xz-compressed inside the ramdisk.
pub fn xz_compress(data: &[u8]) -> Result<Vec<u8>> {
    let format = CompressedFormat::Xz;
    let stream = xz_stream().map_err(|e| Error::LzmaInit(format, e))?;
    let mut writer = XzEncoder::new_stream(Vec::new(), stream);

    writer
        .write_all(data)
        .map_err(|e| Error::Compress(format, e))?;

    writer.finish().map_err(|e| Error::Compress(format, e))
}

/// Decompress an in-memory buffer, returning the data and the detected format.
pub fn decompress(
    data: &[u8],
    raw_if_unknown: bool,
    cancel_signal: &AtomicBool,
) -> Result<(Vec<u8>, CompressedFormat)> {
    let reader = CompressedReader::new(Cursor::new(data), raw_if_unknown)?;
    let format = reader.format();

    let mut raw = Vec::new();
    stream::copy(reader, &mut raw, cancel_signal).map_err(|e| Error::Decompress(format, e))?;

    Ok((raw, format))
}

/// Compress an in-memory buffer with the specified format.
pub fn compress(
    data: &[u8],
    format: CompressedFormat,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let mut writer = CompressedWriter::new(Vec::new(), format)?;

    stream::copy(data, &mut writer, cancel_signal).map_err(|e| Error::Compress(format, e))?;

    writer.finish().map_err(|e| Error::Compress(format, e))
}
