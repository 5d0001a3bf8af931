// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android boot image headers v0 through v4 and vendor boot image headers v3
//! and v4. Every header field is kept so that an unmodified image is written
//! back byte for byte. Size and offset fields are not stored. They are derived
//! from the section contents when the image is written.

use std::{
    fmt,
    io::{self, Cursor, Read, Seek, Write},
    mem,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use ring::digest::{Algorithm, Context, SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::padding::{self, ZeroPadding},
    stream::{CountingReader, CountingWriter, FromReader, ReadFixedSizeExt, ToWriter},
    util::{self, NumBytes, OutOfBoundsError},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

pub const VENDOR_BOOT_MAGIC: [u8; 8] = *b"VNDRBOOT";
pub const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
pub const VENDOR_BOOT_NAME_SIZE: usize = 16;

pub const VENDOR_RAMDISK_TYPE_NONE: u32 = 0;
pub const VENDOR_RAMDISK_TYPE_PLATFORM: u32 = 1;
pub const VENDOR_RAMDISK_TYPE_RECOVERY: u32 = 2;
pub const VENDOR_RAMDISK_TYPE_DLKM: u32 = 3;
pub const VENDOR_RAMDISK_NAME_SIZE: usize = 32;
pub const VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE: usize = 16;

/// v3 and v4 boot images always use 4 KiB pages.
pub const PAGE_SIZE: u32 = 4096;

const HDR_V4_SIGNATURE_SIZE: u32 = 4096;

/// Upper bound for any single section. Stock images are nowhere near this, so
/// anything larger is a corrupt size field.
const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;
/// Upper bound for the vendor v4 bootconfig section.
const BOOTCONFIG_MAX_SIZE: u32 = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown boot image format")]
    UnknownFormat,
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unknown header version: {0}")]
    UnknownHeaderVersion(u32),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
    #[error("{0:?} field is too long (>{1}): {2:?}")]
    StringTooLong(&'static str, usize, String),
    #[error("{0:?} field is out of bounds")]
    IntOutOfBounds(&'static str, #[source] OutOfBoundsError),
    #[error("{0:?} overflowed integer bounds during calculations")]
    IntOverflow(&'static str),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size for boot image type: {0}")]
    InvalidHeaderSize(u32),
    #[error("Mismatched ramdisk ({ramdisks}) and metadata ({metas}) counts")]
    MismatchedRamdiskCounts { ramdisks: usize, metas: usize },
    #[error("Vendor V3 only supports a single ramdisk (count: {0})")]
    VendorV3TooManyRamdisks(usize),
    #[error("Invalid vendor v4 total ramdisk size: {field_value} != {total_size}")]
    VendorV4InvalidRamdiskSize { field_value: u32, total_size: u32 },
    #[error("Invalid vendor v4 ramdisk table size: {actual} != {expected}")]
    VendorV4InvalidRamdiskTableSize { actual: u32, expected: u32 },
    #[error("Invalid vendor v4 ramdisk entry size: {0}")]
    VendorV4InvalidRamdiskEntrySize(u32),
    #[error("Invalid vendor v4 ramdisk entry [{index}] offset: {field_value} != {expected}")]
    VendorV4InvalidRamdiskEntryOffset {
        index: u32,
        field_value: u32,
        expected: u32,
    },
    #[error("Image type has no section named {0:?}")]
    UnknownSection(String),
    #[error("{0:?} extends past the end of the image")]
    Truncated(&'static str),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write boot image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Map a read failure for `field`. Running out of data means the header
/// declared more than the file holds, which is a format problem rather than an
/// I/O problem.
fn read_error(field: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated(field)
        } else {
            Error::DataRead(field, e)
        }
    }
}

/// Bounds check a size field read from a header.
fn check_size(value: u32, max: u32, field: &'static str) -> Result<u32> {
    util::check_bounds(value, ..=max).map_err(|e| Error::IntOutOfBounds(field, e))
}

/// Bounds check the length of a section that is about to be written.
fn section_size(len: usize, max: u32, field: &'static str) -> Result<u32> {
    let len = util::check_bounds(len, ..=max as usize)
        .map_err(|e| Error::IntOutOfBounds(field, e))?;

    Ok(len as u32)
}

fn decode_str(raw: &[u8], field: &'static str) -> Result<String> {
    let trimmed = raw.trim_end_padding();

    str::from_utf8(trimmed)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, e, trimmed.to_vec()))
}

fn encode_str<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N]> {
    value
        .as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, N, value.to_owned()))
}

/// Ensure that the header fields consumed so far add up to `header_size`.
fn check_header_size(reader: &mut impl Seek, header_size: u32, field: &'static str) -> Result<()> {
    let pos = reader.stream_position().map_err(read_error(field))?;

    if pos != u64::from(header_size) {
        return Err(Error::InvalidHeaderSize(header_size));
    }

    Ok(())
}

/// Reads the page-aligned sections that follow a header.
struct PageReader<R> {
    inner: CountingReader<R>,
    page_size: u64,
}

impl<R: Read> PageReader<R> {
    fn new(inner: CountingReader<R>, page_size: u32) -> Self {
        Self {
            inner,
            page_size: page_size.into(),
        }
    }

    fn align(&mut self, field: &'static str) -> Result<()> {
        padding::read_discard(&mut self.inner, self.page_size).map_err(read_error(field))?;
        Ok(())
    }

    fn section(&mut self, size: u32, field: &'static str) -> Result<Vec<u8>> {
        let data = self
            .inner
            .read_vec_exact(size as usize)
            .map_err(read_error(field))?;
        self.align(field)?;

        Ok(data)
    }
}

/// Writes headers followed by page-aligned sections.
struct PageWriter<W> {
    inner: CountingWriter<W>,
    page_size: u64,
}

impl<W: Write> PageWriter<W> {
    fn new(inner: W, page_size: u32) -> Self {
        Self {
            inner: CountingWriter::new(inner),
            page_size: page_size.into(),
        }
    }

    fn raw<T: IntoBytes + Immutable>(&mut self, raw: &T, field: &'static str) -> Result<()> {
        raw.write_to_io(&mut self.inner)
            .map_err(|e| Error::DataWrite(field, e))
    }

    fn bytes(&mut self, data: &[u8], field: &'static str) -> Result<()> {
        self.inner
            .write_all(data)
            .map_err(|e| Error::DataWrite(field, e))
    }

    fn align(&mut self, field: &'static str) -> Result<()> {
        padding::write_zeros(&mut self.inner, self.page_size)
            .map_err(|e| Error::DataWrite(field, e))?;
        Ok(())
    }

    fn section(&mut self, data: &[u8], field: &'static str) -> Result<()> {
        self.bytes(data, field)?;
        self.align(field)
    }
}

pub trait BootImageExt {
    fn header_version(&self) -> u32;

    fn header_size(&self) -> u32;
}

/// Raw on-disk layout for the v0 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV0 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v1 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV1Extra {
    recovery_dtbo_size: little_endian::U32,
    recovery_dtbo_offset: little_endian::U64,
    header_size: little_endian::U32,
}

/// Raw on-disk layout for the extra v2 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV2Extra {
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V1Extra {
    /// Only recomputed when there is a recovery dtbo. mkbootimg leaves the
    /// field alone otherwise.
    pub recovery_dtbo_offset: u64,
    #[serde(skip)]
    pub recovery_dtbo: Vec<u8>,
}

impl fmt::Debug for V1Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V1Extra")
            .field("recovery_dtbo_offset", &self.recovery_dtbo_offset)
            .field("recovery_dtbo", &NumBytes(self.recovery_dtbo.len()))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V2Extra {
    pub dtb_addr: u64,
    #[serde(skip)]
    pub dtb: Vec<u8>,
}

impl fmt::Debug for V2Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V2Extra")
            .field("dtb_addr", &self.dtb_addr)
            .field("dtb", &NumBytes(self.dtb.len()))
            .finish()
    }
}

/// How the v0-v2 `id` field was produced. mkbootimg stores a SHA-1 digest of
/// the sections and newer tools may use SHA-256. Anything else is kept as-is.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Sha1,
    Sha256,
    #[default]
    Opaque,
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV0Through2 {
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub id: [u32; 8],
    #[serde(default)]
    pub id_kind: IdKind,
    pub extra_cmdline: String,
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
    #[serde(skip)]
    pub second: Vec<u8>,
    pub v1_extra: Option<V1Extra>,
    pub v2_extra: Option<V2Extra>,
}

impl fmt::Debug for BootImageV0Through2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV0Through2")
            .field("header_version", &self.header_version())
            .field("page_size", &self.page_size)
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("second_addr", &self.second_addr)
            .field("tags_addr", &self.tags_addr)
            .field("os_version", &self.os_version)
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("extra_cmdline", &self.extra_cmdline)
            .field("id", &self.id)
            .field("id_kind", &self.id_kind)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("second", &NumBytes(self.second.len()))
            .field("v1_extra", &self.v1_extra)
            .field("v2_extra", &self.v2_extra)
            .finish()
    }
}

impl BootImageV0Through2 {
    /// Compute the `id` field the way mkbootimg does: each section followed by
    /// its little-endian size. Sections that don't exist in this header
    /// version are not included.
    pub fn compute_id(&self, algorithm: &'static Algorithm) -> [u32; 8] {
        let mut context = Context::new(algorithm);
        let mut sections = vec![&self.kernel, &self.ramdisk, &self.second];

        if let Some(v1) = &self.v1_extra {
            sections.push(&v1.recovery_dtbo);
        }
        if let Some(v2) = &self.v2_extra {
            sections.push(&v2.dtb);
        }

        for section in sections {
            context.update(section);
            context.update(&(section.len() as u32).to_le_bytes());
        }

        let digest = context.finish();
        let mut raw = [0u8; 32];
        raw[..digest.as_ref().len()].copy_from_slice(digest.as_ref());

        let mut id = [0u32; 8];
        for (value, chunk) in id.iter_mut().zip(raw.chunks_exact(4)) {
            *value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        id
    }

    fn detect_id_kind(&self) -> IdKind {
        if self.id == self.compute_id(&SHA1_FOR_LEGACY_USE_ONLY) {
            IdKind::Sha1
        } else if self.id == self.compute_id(&SHA256) {
            IdKind::Sha256
        } else {
            IdKind::Opaque
        }
    }

    /// The `id` value to write for the current section contents.
    pub fn effective_id(&self) -> [u32; 8] {
        match self.id_kind {
            IdKind::Sha1 => self.compute_id(&SHA1_FOR_LEGACY_USE_ONLY),
            IdKind::Sha256 => self.compute_id(&SHA256),
            IdKind::Opaque => self.id,
        }
    }

    /// Offset of the recovery dtbo within the image, given the current
    /// section sizes.
    fn recovery_dtbo_offset(&self) -> Option<u64> {
        let page_size = u64::from(self.page_size);
        let mut offset = padding::round(u64::from(self.header_size()), page_size)?;

        for section in [&self.kernel, &self.ramdisk, &self.second] {
            offset = padding::round(offset.checked_add(section.len() as u64)?, page_size)?;
        }

        Some(offset)
    }
}

impl BootImageExt for BootImageV0Through2 {
    fn header_version(&self) -> u32 {
        match (&self.v1_extra, &self.v2_extra) {
            (_, Some(_)) => 2,
            (Some(_), None) => 1,
            (None, None) => 0,
        }
    }

    fn header_size(&self) -> u32 {
        let version = self.header_version();
        let mut size = mem::size_of::<RawV0>();

        if version >= 1 {
            size += mem::size_of::<RawV1Extra>();
        }
        if version == 2 {
            size += mem::size_of::<RawV2Extra>();
        }

        size as u32
    }
}

impl<R: Read> FromReader<R> for BootImageV0Through2 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw = RawV0::read_from_io(&mut reader).map_err(read_error("Boot::V0::header"))?;
        if raw.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw.magic));
        }

        let header_version = raw.header_version.get();
        if header_version > 2 {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let page_size = raw.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let kernel_size =
            check_size(raw.kernel_size.get(), COMPONENT_MAX_SIZE, "Boot::V0::kernel_size")?;
        let ramdisk_size =
            check_size(raw.ramdisk_size.get(), COMPONENT_MAX_SIZE, "Boot::V0::ramdisk_size")?;
        let second_size =
            check_size(raw.second_size.get(), COMPONENT_MAX_SIZE, "Boot::V0::second_size")?;

        let raw_v1 = if header_version >= 1 {
            let raw_v1 = RawV1Extra::read_from_io(&mut reader)
                .map_err(read_error("Boot::V1::header"))?;
            check_size(
                raw_v1.recovery_dtbo_size.get(),
                COMPONENT_MAX_SIZE,
                "Boot::V1::recovery_dtbo_size",
            )?;

            Some(raw_v1)
        } else {
            None
        };

        let raw_v2 = if header_version == 2 {
            let raw_v2 = RawV2Extra::read_from_io(&mut reader)
                .map_err(read_error("Boot::V2::header"))?;
            check_size(raw_v2.dtb_size.get(), COMPONENT_MAX_SIZE, "Boot::V2::dtb_size")?;

            Some(raw_v2)
        } else {
            None
        };

        if let Some(v1) = &raw_v1 {
            check_header_size(&mut reader, v1.header_size.get(), "Boot::V1::header_size")?;
        }

        let mut pages = PageReader::new(reader, page_size);
        pages.align("Boot::V0::header_padding")?;

        let kernel = pages.section(kernel_size, "Boot::V0::kernel")?;
        let ramdisk = pages.section(ramdisk_size, "Boot::V0::ramdisk")?;
        let second = pages.section(second_size, "Boot::V0::second")?;

        let v1_extra = match raw_v1 {
            Some(v1) => Some(V1Extra {
                recovery_dtbo_offset: v1.recovery_dtbo_offset.get(),
                recovery_dtbo: pages
                    .section(v1.recovery_dtbo_size.get(), "Boot::V1::recovery_dtbo")?,
            }),
            None => None,
        };

        let v2_extra = match raw_v2 {
            Some(v2) => Some(V2Extra {
                dtb_addr: v2.dtb_addr.get(),
                dtb: pages.section(v2.dtb_size.get(), "Boot::V2::dtb")?,
            }),
            None => None,
        };

        let mut image = Self {
            kernel_addr: raw.kernel_addr.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
            second_addr: raw.second_addr.get(),
            tags_addr: raw.tags_addr.get(),
            page_size,
            os_version: raw.os_version.get(),
            name: decode_str(&raw.name, "Boot::V0::name")?,
            cmdline: decode_str(&raw.cmdline, "Boot::V0::cmdline")?,
            id: raw.id.map(|id| id.get()),
            id_kind: IdKind::Opaque,
            extra_cmdline: decode_str(&raw.extra_cmdline, "Boot::V0::extra_cmdline")?,
            kernel,
            ramdisk,
            second,
            v1_extra,
            v2_extra,
        };

        image.id_kind = image.detect_id_kind();

        Ok(image)
    }
}

impl<W: Write> ToWriter<W> for BootImageV0Through2 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let raw = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: section_size(
                self.kernel.len(),
                COMPONENT_MAX_SIZE,
                "Boot::V0::kernel_size",
            )?
            .into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: section_size(
                self.ramdisk.len(),
                COMPONENT_MAX_SIZE,
                "Boot::V0::ramdisk_size",
            )?
            .into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: section_size(
                self.second.len(),
                COMPONENT_MAX_SIZE,
                "Boot::V0::second_size",
            )?
            .into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: self.header_version().into(),
            os_version: self.os_version.into(),
            name: encode_str::<BOOT_NAME_SIZE>(&self.name, "Boot::V0::name")?,
            cmdline: encode_str::<BOOT_ARGS_SIZE>(&self.cmdline, "Boot::V0::cmdline")?,
            id: self.effective_id().map(|id| id.into()),
            extra_cmdline: encode_str::<BOOT_EXTRA_ARGS_SIZE>(
                &self.extra_cmdline,
                "Boot::V0::extra_cmdline",
            )?,
        };

        let raw_v1 = match &self.v1_extra {
            Some(v1) => {
                let recovery_dtbo_offset = if v1.recovery_dtbo.is_empty() {
                    v1.recovery_dtbo_offset
                } else {
                    self.recovery_dtbo_offset()
                        .ok_or(Error::IntOverflow("Boot::V1::recovery_dtbo_offset"))?
                };

                Some(RawV1Extra {
                    recovery_dtbo_size: section_size(
                        v1.recovery_dtbo.len(),
                        COMPONENT_MAX_SIZE,
                        "Boot::V1::recovery_dtbo_size",
                    )?
                    .into(),
                    recovery_dtbo_offset: recovery_dtbo_offset.into(),
                    header_size: self.header_size().into(),
                })
            }
            None => None,
        };

        let raw_v2 = match &self.v2_extra {
            Some(v2) => Some(RawV2Extra {
                dtb_size: section_size(v2.dtb.len(), COMPONENT_MAX_SIZE, "Boot::V2::dtb_size")?
                    .into(),
                dtb_addr: v2.dtb_addr.into(),
            }),
            None => None,
        };

        let mut pages = PageWriter::new(writer, self.page_size);

        pages.raw(&raw, "Boot::V0::header")?;
        if let Some(raw_v1) = &raw_v1 {
            pages.raw(raw_v1, "Boot::V1::header")?;
        }
        if let Some(raw_v2) = &raw_v2 {
            pages.raw(raw_v2, "Boot::V2::header")?;
        }
        pages.align("Boot::V0::header_padding")?;

        pages.section(&self.kernel, "Boot::V0::kernel")?;
        pages.section(&self.ramdisk, "Boot::V0::ramdisk")?;
        pages.section(&self.second, "Boot::V0::second")?;

        if let Some(v1) = &self.v1_extra {
            pages.section(&v1.recovery_dtbo, "Boot::V1::recovery_dtbo")?;
        }
        if let Some(v2) = &self.v2_extra {
            pages.section(&v2.dtb, "Boot::V2::dtb")?;
        }

        Ok(())
    }
}

/// Raw on-disk layout for the v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV3 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    ramdisk_size: little_endian::U32,
    os_version: little_endian::U32,
    header_size: little_endian::U32,
    reserved: [little_endian::U32; 4],
    header_version: little_endian::U32,
    cmdline: [u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV4Extra {
    signature_size: little_endian::U32,
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V4Extra {
    /// Boot signature used by VTS. It is carried through as an opaque blob.
    /// It is not needed for booting and is not updated when the image changes.
    #[serde(skip)]
    pub signature: Vec<u8>,
}

impl fmt::Debug for V4Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4Extra")
            .field("signature", &NumBytes(self.signature.len()))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV3Through4 {
    pub os_version: u32,
    pub reserved: [u32; 4],
    pub cmdline: String,
    pub v4_extra: Option<V4Extra>,
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
}

impl fmt::Debug for BootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV3Through4")
            .field("header_version", &self.header_version())
            .field("os_version", &self.os_version)
            .field("reserved", &self.reserved)
            .field("cmdline", &self.cmdline)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("v4_extra", &self.v4_extra)
            .finish()
    }
}

impl BootImageExt for BootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawV4Extra>();
        }

        size as u32
    }
}

impl<R: Read> FromReader<R> for BootImageV3Through4 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw = RawV3::read_from_io(&mut reader).map_err(read_error("Boot::V3::header"))?;
        if raw.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw.magic));
        }

        let header_version = raw.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let kernel_size =
            check_size(raw.kernel_size.get(), COMPONENT_MAX_SIZE, "Boot::V3::kernel_size")?;
        let ramdisk_size =
            check_size(raw.ramdisk_size.get(), COMPONENT_MAX_SIZE, "Boot::V3::ramdisk_size")?;

        let signature_size = if header_version == 4 {
            let raw_v4 = RawV4Extra::read_from_io(&mut reader)
                .map_err(read_error("Boot::V4::header"))?;

            Some(check_size(
                raw_v4.signature_size.get(),
                HDR_V4_SIGNATURE_SIZE,
                "Boot::V4::signature_size",
            )?)
        } else {
            None
        };

        check_header_size(&mut reader, raw.header_size.get(), "Boot::V3::header_size")?;

        let mut pages = PageReader::new(reader, PAGE_SIZE);
        pages.align("Boot::V3::header_padding")?;

        let kernel = pages.section(kernel_size, "Boot::V3::kernel")?;
        let ramdisk = pages.section(ramdisk_size, "Boot::V3::ramdisk")?;

        let v4_extra = match signature_size {
            Some(size) => Some(V4Extra {
                signature: pages.section(size, "Boot::V4::signature")?,
            }),
            None => None,
        };

        Ok(Self {
            os_version: raw.os_version.get(),
            reserved: raw.reserved.map(|r| r.get()),
            cmdline: decode_str(&raw.cmdline, "Boot::V3::cmdline")?,
            v4_extra,
            kernel,
            ramdisk,
        })
    }
}

impl<W: Write> ToWriter<W> for BootImageV3Through4 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        let raw = RawV3 {
            magic: BOOT_MAGIC,
            kernel_size: section_size(
                self.kernel.len(),
                COMPONENT_MAX_SIZE,
                "Boot::V3::kernel_size",
            )?
            .into(),
            ramdisk_size: section_size(
                self.ramdisk.len(),
                COMPONENT_MAX_SIZE,
                "Boot::V3::ramdisk_size",
            )?
            .into(),
            os_version: self.os_version.into(),
            header_size: self.header_size().into(),
            reserved: self.reserved.map(|r| r.into()),
            header_version: self.header_version().into(),
            cmdline: encode_str::<{ BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE }>(
                &self.cmdline,
                "Boot::V3::cmdline",
            )?,
        };

        let raw_v4 = match &self.v4_extra {
            Some(v4) => Some(RawV4Extra {
                signature_size: section_size(
                    v4.signature.len(),
                    HDR_V4_SIGNATURE_SIZE,
                    "Boot::V4::signature_size",
                )?
                .into(),
            }),
            None => None,
        };

        let mut pages = PageWriter::new(writer, PAGE_SIZE);

        pages.raw(&raw, "Boot::V3::header")?;
        if let Some(raw_v4) = &raw_v4 {
            pages.raw(raw_v4, "Boot::V4::header")?;
        }
        pages.align("Boot::V3::header_padding")?;

        pages.section(&self.kernel, "Boot::V3::kernel")?;
        pages.section(&self.ramdisk, "Boot::V3::ramdisk")?;

        if let Some(v4) = &self.v4_extra {
            pages.section(&v4.signature, "Boot::V4::signature")?;
        }

        Ok(())
    }
}

/// Raw on-disk layout for the vendor v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV3 {
    /// Magic value. This should be equal to [`VENDOR_BOOT_MAGIC`].
    magic: [u8; 8],
    header_version: little_endian::U32,
    page_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    vendor_ramdisk_size: little_endian::U32,
    cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    tags_addr: little_endian::U32,
    name: [u8; VENDOR_BOOT_NAME_SIZE],
    header_size: little_endian::U32,
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// Raw on-disk layout for the extra vendor v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4Extra {
    vendor_ramdisk_table_size: little_endian::U32,
    vendor_ramdisk_table_entry_num: little_endian::U32,
    vendor_ramdisk_table_entry_size: little_endian::U32,
    bootconfig_size: little_endian::U32,
}

/// Raw on-disk layout for the vendor v4 ramdisk table entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4RamdiskTableEntry {
    ramdisk_size: little_endian::U32,
    ramdisk_offset: little_endian::U32,
    ramdisk_type: little_endian::U32,
    ramdisk_name: [u8; VENDOR_RAMDISK_NAME_SIZE],
    board_id: [little_endian::U32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

const RAMDISK_TABLE_ENTRY_SIZE: u32 = mem::size_of::<RawVendorV4RamdiskTableEntry>() as u32;

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RamdiskMeta {
    pub ramdisk_type: u32,
    pub ramdisk_name: String,
    pub board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorV4Extra {
    pub ramdisk_metas: Vec<RamdiskMeta>,
    #[serde(skip)]
    pub bootconfig: String,
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorBootImageV3Through4 {
    pub page_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub cmdline: String,
    pub tags_addr: u32,
    pub name: String,
    #[serde(skip)]
    pub dtb: Vec<u8>,
    pub dtb_addr: u64,
    /// The v3 format has exactly one ramdisk. The v4 format has one ramdisk
    /// per entry in [`VendorV4Extra::ramdisk_metas`].
    #[serde(skip)]
    pub ramdisks: Vec<Vec<u8>>,
    pub v4_extra: Option<VendorV4Extra>,
}

impl fmt::Debug for VendorBootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ramdisks = self
            .ramdisks
            .iter()
            .map(|r| NumBytes(r.len()))
            .collect::<Vec<_>>();

        f.debug_struct("VendorBootImageV3Through4")
            .field("header_version", &self.header_version())
            .field("page_size", &self.page_size)
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("tags_addr", &self.tags_addr)
            .field("dtb_addr", &self.dtb_addr)
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("ramdisks", &ramdisks)
            .field("dtb", &NumBytes(self.dtb.len()))
            .field("v4_extra", &self.v4_extra)
            .finish()
    }
}

impl VendorBootImageV3Through4 {
    /// Number of ramdisks described by the header. This is also correct for a
    /// header loaded from TOML, which has no section data.
    fn ramdisk_count(&self) -> usize {
        match &self.v4_extra {
            Some(v4) => v4.ramdisk_metas.len(),
            None => 1,
        }
    }

    /// Split the concatenated v4 ramdisk data using the ramdisk table.
    fn read_ramdisk_table<R: Read>(
        pages: &mut PageReader<R>,
        data: &[u8],
        entry_num: u32,
    ) -> Result<(Vec<Vec<u8>>, Vec<RamdiskMeta>)> {
        let total_size = data.len() as u32;
        let mut ramdisks = vec![];
        let mut metas = vec![];
        let mut offset = 0u32;

        for index in 0..entry_num {
            let raw = RawVendorV4RamdiskTableEntry::read_from_io(&mut pages.inner)
                .map_err(read_error("Vendor::V4::table_entry"))?;

            let size = check_size(raw.ramdisk_size.get(), total_size, "Vendor::V4::ramdisk_size")?;

            if raw.ramdisk_offset.get() != offset {
                return Err(Error::VendorV4InvalidRamdiskEntryOffset {
                    index,
                    field_value: raw.ramdisk_offset.get(),
                    expected: offset,
                });
            }

            let end = offset
                .checked_add(size)
                .filter(|e| *e <= total_size)
                .ok_or(Error::VendorV4InvalidRamdiskSize {
                    field_value: total_size,
                    total_size: offset.saturating_add(size),
                })?;

            ramdisks.push(data[offset as usize..end as usize].to_vec());
            metas.push(RamdiskMeta {
                ramdisk_type: raw.ramdisk_type.get(),
                ramdisk_name: decode_str(&raw.ramdisk_name, "Vendor::V4::ramdisk_name")?,
                board_id: raw.board_id.map(|id| id.get()),
            });

            offset = end;
        }

        if offset != total_size {
            return Err(Error::VendorV4InvalidRamdiskSize {
                field_value: total_size,
                total_size: offset,
            });
        }

        pages.align("Vendor::V4::table_padding")?;

        Ok((ramdisks, metas))
    }
}

impl BootImageExt for VendorBootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawVendorV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawVendorV4Extra>();
        }

        size as u32
    }
}

impl<R: Read> FromReader<R> for VendorBootImageV3Through4 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw = RawVendorV3::read_from_io(&mut reader)
            .map_err(read_error("Vendor::V3::header"))?;
        if raw.magic != VENDOR_BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw.magic));
        }

        let header_version = raw.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let page_size = raw.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let vendor_ramdisk_size = check_size(
            raw.vendor_ramdisk_size.get(),
            COMPONENT_MAX_SIZE,
            "Vendor::V3::vendor_ramdisk_size",
        )?;
        let dtb_size = check_size(raw.dtb_size.get(), COMPONENT_MAX_SIZE, "Vendor::V3::dtb_size")?;

        let raw_v4 = if header_version == 4 {
            let raw_v4 = RawVendorV4Extra::read_from_io(&mut reader)
                .map_err(read_error("Vendor::V4::header"))?;

            check_size(
                raw_v4.bootconfig_size.get(),
                BOOTCONFIG_MAX_SIZE,
                "Vendor::V4::bootconfig_size",
            )?;

            let entry_size = raw_v4.vendor_ramdisk_table_entry_size.get();
            if entry_size != RAMDISK_TABLE_ENTRY_SIZE {
                return Err(Error::VendorV4InvalidRamdiskEntrySize(entry_size));
            }

            let table_size = raw_v4
                .vendor_ramdisk_table_entry_num
                .get()
                .checked_mul(entry_size)
                .ok_or(Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_size"))?;
            if table_size != raw_v4.vendor_ramdisk_table_size.get() {
                return Err(Error::VendorV4InvalidRamdiskTableSize {
                    actual: table_size,
                    expected: raw_v4.vendor_ramdisk_table_size.get(),
                });
            }

            Some(raw_v4)
        } else {
            None
        };

        check_header_size(&mut reader, raw.header_size.get(), "Vendor::V3::header_size")?;

        let mut pages = PageReader::new(reader, page_size);
        pages.align("Vendor::V3::header_padding")?;

        // The v4 ramdisk table comes after the device tree, so the ramdisks
        // can only be split at the end.
        let vendor_ramdisk = pages.section(vendor_ramdisk_size, "Vendor::V3::ramdisk")?;
        let dtb = pages.section(dtb_size, "Vendor::V3::dtb")?;

        let (ramdisks, v4_extra) = match raw_v4 {
            Some(raw_v4) => {
                let (ramdisks, ramdisk_metas) = Self::read_ramdisk_table(
                    &mut pages,
                    &vendor_ramdisk,
                    raw_v4.vendor_ramdisk_table_entry_num.get(),
                )?;

                let bootconfig =
                    pages.section(raw_v4.bootconfig_size.get(), "Vendor::V4::bootconfig")?;
                let bootconfig = String::from_utf8(bootconfig).map_err(|e| {
                    Error::StringNotUtf8("Vendor::V4::bootconfig", e.utf8_error(), e.into_bytes())
                })?;

                (
                    ramdisks,
                    Some(VendorV4Extra {
                        ramdisk_metas,
                        bootconfig,
                    }),
                )
            }
            None => (vec![vendor_ramdisk], None),
        };

        Ok(Self {
            page_size,
            kernel_addr: raw.kernel_addr.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
            cmdline: decode_str(&raw.cmdline, "Vendor::V3::cmdline")?,
            tags_addr: raw.tags_addr.get(),
            name: decode_str(&raw.name, "Vendor::V3::name")?,
            dtb,
            dtb_addr: raw.dtb_addr.get(),
            ramdisks,
            v4_extra,
        })
    }
}

impl<W: Write> ToWriter<W> for VendorBootImageV3Through4 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        match &self.v4_extra {
            Some(v4) if v4.ramdisk_metas.len() != self.ramdisks.len() => {
                return Err(Error::MismatchedRamdiskCounts {
                    ramdisks: self.ramdisks.len(),
                    metas: v4.ramdisk_metas.len(),
                });
            }
            None if self.ramdisks.len() > 1 => {
                return Err(Error::VendorV3TooManyRamdisks(self.ramdisks.len()));
            }
            _ => {}
        }

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let vendor_ramdisk_size = section_size(
            self.ramdisks.iter().map(|r| r.len()).sum(),
            COMPONENT_MAX_SIZE,
            "Vendor::V3::vendor_ramdisk_size",
        )?;

        let raw = RawVendorV3 {
            magic: VENDOR_BOOT_MAGIC,
            header_version: self.header_version().into(),
            page_size: self.page_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            vendor_ramdisk_size: vendor_ramdisk_size.into(),
            cmdline: encode_str::<VENDOR_BOOT_ARGS_SIZE>(&self.cmdline, "Vendor::V3::cmdline")?,
            tags_addr: self.tags_addr.into(),
            name: encode_str::<VENDOR_BOOT_NAME_SIZE>(&self.name, "Vendor::V3::name")?,
            header_size: self.header_size().into(),
            dtb_size: section_size(self.dtb.len(), COMPONENT_MAX_SIZE, "Vendor::V3::dtb_size")?
                .into(),
            dtb_addr: self.dtb_addr.into(),
        };

        let mut pages = PageWriter::new(writer, self.page_size);

        pages.raw(&raw, "Vendor::V3::header")?;

        let mut table = vec![];

        if let Some(v4) = &self.v4_extra {
            let entry_num = u32::try_from(self.ramdisks.len())
                .map_err(|_| Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_entry_num"))?;
            let table_size = entry_num
                .checked_mul(RAMDISK_TABLE_ENTRY_SIZE)
                .ok_or(Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_size"))?;

            let raw_v4 = RawVendorV4Extra {
                vendor_ramdisk_table_size: table_size.into(),
                vendor_ramdisk_table_entry_num: entry_num.into(),
                vendor_ramdisk_table_entry_size: RAMDISK_TABLE_ENTRY_SIZE.into(),
                bootconfig_size: section_size(
                    v4.bootconfig.len(),
                    BOOTCONFIG_MAX_SIZE,
                    "Vendor::V4::bootconfig_size",
                )?
                .into(),
            };
            pages.raw(&raw_v4, "Vendor::V4::header")?;

            // Sizes already fit in u32 since their sum does.
            let mut offset = 0u32;

            for (ramdisk, meta) in self.ramdisks.iter().zip(&v4.ramdisk_metas) {
                table.push(RawVendorV4RamdiskTableEntry {
                    ramdisk_size: (ramdisk.len() as u32).into(),
                    ramdisk_offset: offset.into(),
                    ramdisk_type: meta.ramdisk_type.into(),
                    ramdisk_name: encode_str::<VENDOR_RAMDISK_NAME_SIZE>(
                        &meta.ramdisk_name,
                        "Vendor::V4::ramdisk_name",
                    )?,
                    board_id: meta.board_id.map(|id| id.into()),
                });

                offset += ramdisk.len() as u32;
            }
        }

        pages.align("Vendor::V3::header_padding")?;

        for ramdisk in &self.ramdisks {
            pages.bytes(ramdisk, "Vendor::V3::ramdisk")?;
        }
        pages.align("Vendor::V3::ramdisk_padding")?;

        pages.section(&self.dtb, "Vendor::V3::dtb")?;

        if let Some(v4) = &self.v4_extra {
            for entry in &table {
                pages.raw(entry, "Vendor::V4::table_entry")?;
            }
            pages.align("Vendor::V4::table_padding")?;

            pages.section(v4.bootconfig.as_bytes(), "Vendor::V4::bootconfig")?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum BootImage {
    V0Through2(BootImageV0Through2),
    V3Through4(BootImageV3Through4),
    VendorV3Through4(VendorBootImageV3Through4),
}

impl BootImageExt for BootImage {
    fn header_version(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_version(),
            Self::V3Through4(b) => b.header_version(),
            Self::VendorV3Through4(b) => b.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_size(),
            Self::V3Through4(b) => b.header_size(),
            Self::VendorV3Through4(b) => b.header_size(),
        }
    }
}

/// A payload section that patches can target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Kernel,
    Ramdisk,
    Second,
    RecoveryDtbo,
    Dtb,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::Second => "second",
            Self::RecoveryDtbo => "recovery_dtbo",
            Self::Dtb => "dtb",
        };

        f.write_str(name)
    }
}

impl BootImage {
    /// Parse an in-memory image. Returns the image and the number of bytes
    /// that it occupies, including the padding after the final section. Any
    /// data after that point is not part of the image.
    pub fn load(data: &[u8]) -> Result<(Self, u64)> {
        let mut reader = Cursor::new(data);
        let image = Self::from_reader(&mut reader)?;

        Ok((image, reader.position()))
    }

    /// Serialize to an in-memory buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());
        self.to_writer(&mut writer)?;

        Ok(writer.into_inner())
    }

    /// Get a section by kind. [`None`] means this image type has no such
    /// section. For vendor images, [`SectionKind::Ramdisk`] refers to the first
    /// ramdisk.
    pub fn section(&self, kind: SectionKind) -> Option<&[u8]> {
        match (self, kind) {
            (Self::V0Through2(b), SectionKind::Kernel) => Some(&b.kernel),
            (Self::V0Through2(b), SectionKind::Ramdisk) => Some(&b.ramdisk),
            (Self::V0Through2(b), SectionKind::Second) => Some(&b.second),
            (Self::V0Through2(b), SectionKind::RecoveryDtbo) => {
                b.v1_extra.as_ref().map(|v1| v1.recovery_dtbo.as_slice())
            }
            (Self::V0Through2(b), SectionKind::Dtb) => {
                b.v2_extra.as_ref().map(|v2| v2.dtb.as_slice())
            }
            (Self::V3Through4(b), SectionKind::Kernel) => Some(&b.kernel),
            (Self::V3Through4(b), SectionKind::Ramdisk) => Some(&b.ramdisk),
            (Self::VendorV3Through4(b), SectionKind::Ramdisk) => {
                b.ramdisks.first().map(|r| r.as_slice())
            }
            (Self::VendorV3Through4(b), SectionKind::Dtb) => Some(&b.dtb),
            _ => None,
        }
    }

    /// Mutable version of [`Self::section`]. Size fields are recomputed when
    /// the image is written, so sections can be resized freely.
    pub fn section_mut(&mut self, kind: SectionKind) -> Option<&mut Vec<u8>> {
        match (self, kind) {
            (Self::V0Through2(b), SectionKind::Kernel) => Some(&mut b.kernel),
            (Self::V0Through2(b), SectionKind::Ramdisk) => Some(&mut b.ramdisk),
            (Self::V0Through2(b), SectionKind::Second) => Some(&mut b.second),
            (Self::V0Through2(b), SectionKind::RecoveryDtbo) => {
                b.v1_extra.as_mut().map(|v1| &mut v1.recovery_dtbo)
            }
            (Self::V0Through2(b), SectionKind::Dtb) => b.v2_extra.as_mut().map(|v2| &mut v2.dtb),
            (Self::V3Through4(b), SectionKind::Kernel) => Some(&mut b.kernel),
            (Self::V3Through4(b), SectionKind::Ramdisk) => Some(&mut b.ramdisk),
            (Self::VendorV3Through4(b), SectionKind::Ramdisk) => b.ramdisks.first_mut(),
            (Self::VendorV3Through4(b), SectionKind::Dtb) => Some(&mut b.dtb),
            _ => None,
        }
    }

    /// Names of the payload sections in on-disk order. These are the file
    /// names used when an image is unpacked to a directory.
    pub fn section_names(&self) -> Vec<String> {
        let mut names = vec![];

        match self {
            Self::V0Through2(b) => {
                names.extend(["kernel", "ramdisk", "second"].map(String::from));
                if b.v1_extra.is_some() {
                    names.push("recovery_dtbo".to_owned());
                }
                if b.v2_extra.is_some() {
                    names.push("dtb".to_owned());
                }
            }
            Self::V3Through4(b) => {
                names.extend(["kernel", "ramdisk"].map(String::from));
                if b.v4_extra.is_some() {
                    names.push("signature".to_owned());
                }
            }
            Self::VendorV3Through4(b) => {
                names.extend((0..b.ramdisk_count()).map(|i| format!("ramdisk{i}")));
                names.push("dtb".to_owned());
                if b.v4_extra.is_some() {
                    names.push("bootconfig".to_owned());
                }
            }
        }

        names
    }

    /// All payload sections in on-disk order, named as in
    /// [`Self::section_names`].
    pub fn sections(&self) -> Vec<(String, &[u8])> {
        let data: Vec<&[u8]> = match self {
            Self::V0Through2(b) => [&b.kernel, &b.ramdisk, &b.second]
                .into_iter()
                .map(|s| s.as_slice())
                .chain(b.v1_extra.as_ref().map(|v1| v1.recovery_dtbo.as_slice()))
                .chain(b.v2_extra.as_ref().map(|v2| v2.dtb.as_slice()))
                .collect(),
            Self::V3Through4(b) => [&b.kernel, &b.ramdisk]
                .into_iter()
                .map(|s| s.as_slice())
                .chain(b.v4_extra.as_ref().map(|v4| v4.signature.as_slice()))
                .collect(),
            Self::VendorV3Through4(b) => (0..b.ramdisk_count())
                .map(|i| b.ramdisks.get(i).map_or(&[][..], |r| r.as_slice()))
                .chain([b.dtb.as_slice()])
                .chain(b.v4_extra.as_ref().map(|v4| v4.bootconfig.as_bytes()))
                .collect(),
        };

        self.section_names().into_iter().zip(data).collect()
    }

    /// Replace a section by the name given in [`Self::section_names`].
    pub fn set_section(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        let unknown = || Error::UnknownSection(name.to_owned());

        let slot = match (&mut *self, name) {
            (Self::V0Through2(b), "kernel") => &mut b.kernel,
            (Self::V0Through2(b), "ramdisk") => &mut b.ramdisk,
            (Self::V0Through2(b), "second") => &mut b.second,
            (Self::V0Through2(b), "recovery_dtbo") => {
                &mut b.v1_extra.as_mut().ok_or_else(unknown)?.recovery_dtbo
            }
            (Self::V0Through2(b), "dtb") => &mut b.v2_extra.as_mut().ok_or_else(unknown)?.dtb,
            (Self::V3Through4(b), "kernel") => &mut b.kernel,
            (Self::V3Through4(b), "ramdisk") => &mut b.ramdisk,
            (Self::V3Through4(b), "signature") => {
                &mut b.v4_extra.as_mut().ok_or_else(unknown)?.signature
            }
            (Self::VendorV3Through4(b), "dtb") => &mut b.dtb,
            (Self::VendorV3Through4(b), "bootconfig") => {
                let v4 = b.v4_extra.as_mut().ok_or_else(unknown)?;
                v4.bootconfig = String::from_utf8(data).map_err(|e| {
                    Error::StringNotUtf8("Vendor::V4::bootconfig", e.utf8_error(), e.into_bytes())
                })?;
                return Ok(());
            }
            (Self::VendorV3Through4(b), n) => {
                let index = n
                    .strip_prefix("ramdisk")
                    .and_then(|i| i.parse::<usize>().ok())
                    .filter(|i| *i < b.ramdisk_count())
                    .ok_or_else(unknown)?;

                if b.ramdisks.len() <= index {
                    b.ramdisks.resize(index + 1, vec![]);
                }
                &mut b.ramdisks[index]
            }
            _ => return Err(unknown()),
        };

        *slot = data;

        Ok(())
    }
}

/// Try one image type from the start of the stream. `Ok(None)` means the data
/// is some other type.
fn try_parse<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: Read + Seek,
    T: for<'a> FromReader<&'a mut R, Error = Error>,
{
    reader
        .rewind()
        .map_err(read_error("BootImage::autodetect"))?;

    match T::from_reader(reader) {
        Ok(image) => Ok(Some(image)),
        Err(Error::UnknownMagic(_) | Error::UnknownHeaderVersion(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl<R: Read + Seek> FromReader<R> for BootImage {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        if let Some(b) = try_parse::<_, BootImageV0Through2>(&mut reader)? {
            Ok(Self::V0Through2(b))
        } else if let Some(b) = try_parse::<_, BootImageV3Through4>(&mut reader)? {
            Ok(Self::V3Through4(b))
        } else if let Some(b) = try_parse::<_, VendorBootImageV3Through4>(&mut reader)? {
            Ok(Self::VendorV3Through4(b))
        } else {
            Err(Error::UnknownFormat)
        }
    }
}

impl<W: Write> ToWriter<W> for BootImage {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        match self {
            Self::V0Through2(b) => b.to_writer(writer),
            Self::V3Through4(b) => b.to_writer(writer),
            Self::VendorV3Through4(b) => b.to_writer(writer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor_v4() -> BootImage {
        BootImage::VendorV3Through4(VendorBootImageV3Through4 {
            page_size: 4096,
            kernel_addr: 0,
            ramdisk_addr: 0,
            cmdline: String::new(),
            tags_addr: 0,
            name: String::new(),
            dtb: vec![],
            dtb_addr: 0,
            ramdisks: vec![],
            v4_extra: Some(VendorV4Extra {
                ramdisk_metas: vec![
                    RamdiskMeta {
                        ramdisk_type: VENDOR_RAMDISK_TYPE_PLATFORM,
                        ramdisk_name: String::new(),
                        board_id: [0; 16],
                    };
                    2
                ],
                bootconfig: String::new(),
            }),
        })
    }

    #[test]
    fn header_sizes() {
        assert_eq!(mem::size_of::<RawV0>(), 1632);
        assert_eq!(mem::size_of::<RawV3>(), 1580);
        assert_eq!(mem::size_of::<RawVendorV3>(), 2112);
        assert_eq!(RAMDISK_TABLE_ENTRY_SIZE, 108);
    }

    #[test]
    fn named_sections() {
        let mut image = vendor_v4();
        assert_eq!(
            image.section_names(),
            ["ramdisk0", "ramdisk1", "dtb", "bootconfig"],
        );

        image.set_section("ramdisk1", b"second".to_vec()).unwrap();
        image.set_section("ramdisk0", b"first".to_vec()).unwrap();
        image.set_section("bootconfig", b"a=b\n".to_vec()).unwrap();

        let sections = image.sections();
        assert_eq!(sections[0], ("ramdisk0".to_owned(), &b"first"[..]));
        assert_eq!(sections[1], ("ramdisk1".to_owned(), &b"second"[..]));
        assert_eq!(sections[3], ("bootconfig".to_owned(), &b"a=b\n"[..]));

        assert!(matches!(
            image.set_section("ramdisk2", vec![]),
            Err(Error::UnknownSection(_)),
        ));
        assert!(matches!(
            image.set_section("kernel", vec![]),
            Err(Error::UnknownSection(_)),
        ));
        assert!(matches!(
            image.set_section("bootconfig", vec![0xff]),
            Err(Error::StringNotUtf8(..)),
        ));
    }
}
