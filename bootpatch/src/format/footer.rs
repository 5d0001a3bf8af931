// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Handling for data that follows the boot image inside the partition image.
//!
//! Images that went through `avbtool add_hash_footer` end with a 64-byte AVB
//! footer that points to a vbmeta blob placed after the (block aligned) boot
//! image. Other images may carry vendor specific trailers, like Samsung's
//! `SEANDROIDENFORCE` marker, which are preserved as opaque bytes.

use std::fmt;

use thiserror::Error;
use tracing::debug;
use zerocopy::{FromBytes, IntoBytes, big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        bootimage::{self, BootImage},
        padding,
    },
    util::NumBytes,
};

pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";
pub const VBMETA_MAGIC: [u8; 4] = *b"AVB0";

/// avbtool always aligns the vbmeta blob to this size.
const AVB_BLOCK_SIZE: usize = 4096;

/// Offset of the `flags` field in the vbmeta image header.
const VBMETA_FLAGS_OFFSET: usize = 120;
/// Size of the vbmeta image header.
const VBMETA_HEADER_SIZE: usize = 256;

pub const VBMETA_FLAG_HASHTREE_DISABLED: u32 = 1 << 0;
pub const VBMETA_FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("AVB footer points outside of the file: {field} = {value}")]
    FooterOutOfBounds { field: &'static str, value: u64 },
    #[error("vbmeta blob has invalid magic: {0:?}")]
    InvalidVbmetaMagic([u8; 4]),
    #[error("vbmeta blob is too small for a header: {0}")]
    VbmetaTooSmall(usize),
    #[error("Patched image does not fit in the partition: {required} > {available}")]
    NoSpace { required: u64, available: u64 },
    #[error("Failed to parse boot image")]
    BootImage(#[from] bootimage::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the AVB footer. Unlike the boot image header, all
/// fields are big endian.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawFooter {
    magic: [u8; 4],
    version_major: big_endian::U32,
    version_minor: big_endian::U32,
    original_image_size: big_endian::U64,
    vbmeta_offset: big_endian::U64,
    vbmeta_size: big_endian::U64,
    reserved: [u8; 28],
}

const FOOTER_SIZE: usize = std::mem::size_of::<RawFooter>();

#[derive(Clone, PartialEq, Eq)]
pub struct AvbTrailer {
    pub version_major: u32,
    pub version_minor: u32,
    /// Total size of the partition image, including the footer.
    pub partition_size: u64,
    pub vbmeta: Vec<u8>,
    /// Bytes between the end of the boot image and `original_image_size`,
    /// such as a `SEANDROIDENFORCE` marker.
    pub tail: Vec<u8>,
}

impl fmt::Debug for AvbTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvbTrailer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("partition_size", &self.partition_size)
            .field("vbmeta", &NumBytes(self.vbmeta.len()))
            .field("tail", &NumBytes(self.tail.len()))
            .finish()
    }
}

impl AvbTrailer {
    /// Look for an AVB footer at the end of `data`. Returns the size of the
    /// image region that precedes it.
    fn find(data: &[u8]) -> Result<Option<(usize, Self)>> {
        let Some(footer_offset) = data.len().checked_sub(FOOTER_SIZE) else {
            return Ok(None);
        };
        let Ok(raw) = RawFooter::read_from_bytes(&data[footer_offset..]) else {
            return Ok(None);
        };
        if raw.magic != FOOTER_MAGIC {
            return Ok(None);
        }

        let image_size = raw.original_image_size.get();
        let vbmeta_offset = raw.vbmeta_offset.get();
        let vbmeta_size = raw.vbmeta_size.get();

        let image_size = usize::try_from(image_size)
            .ok()
            .filter(|s| *s <= footer_offset)
            .ok_or(Error::FooterOutOfBounds {
                field: "original_image_size",
                value: image_size,
            })?;
        let vbmeta_start = usize::try_from(vbmeta_offset)
            .ok()
            .filter(|o| *o >= image_size && *o <= footer_offset)
            .ok_or(Error::FooterOutOfBounds {
                field: "vbmeta_offset",
                value: vbmeta_offset,
            })?;
        let vbmeta_end = usize::try_from(vbmeta_size)
            .ok()
            .and_then(|s| vbmeta_start.checked_add(s))
            .filter(|e| *e <= footer_offset)
            .ok_or(Error::FooterOutOfBounds {
                field: "vbmeta_size",
                value: vbmeta_size,
            })?;

        let trailer = Self {
            version_major: raw.version_major.get(),
            version_minor: raw.version_minor.get(),
            partition_size: data.len() as u64,
            vbmeta: data[vbmeta_start..vbmeta_end].to_vec(),
            tail: vec![],
        };

        Ok(Some((image_size, trailer)))
    }

    /// The vbmeta header flags.
    pub fn flags(&self) -> Result<u32> {
        check_vbmeta(&self.vbmeta)?;

        let raw = &self.vbmeta[VBMETA_FLAGS_OFFSET..VBMETA_FLAGS_OFFSET + 4];
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Set flags in the vbmeta header so that the bootloader skips
    /// verification. This invalidates the vbmeta signature.
    pub fn disable_verification(&mut self) -> Result<()> {
        let flags =
            self.flags()? | VBMETA_FLAG_HASHTREE_DISABLED | VBMETA_FLAG_VERIFICATION_DISABLED;

        self.vbmeta[VBMETA_FLAGS_OFFSET..VBMETA_FLAGS_OFFSET + 4]
            .copy_from_slice(&flags.to_be_bytes());

        Ok(())
    }

    /// Lay out `image` and its tail, the vbmeta blob, and a fresh footer
    /// within the original partition size.
    fn append_to(&self, mut image: Vec<u8>) -> Result<Vec<u8>> {
        image.extend_from_slice(&self.tail);
        let image_size = image.len() as u64;

        padding::pad_vec(&mut image, AVB_BLOCK_SIZE);
        let vbmeta_offset = image.len() as u64;

        let required = vbmeta_offset + (self.vbmeta.len() + FOOTER_SIZE) as u64;
        if required > self.partition_size {
            return Err(Error::NoSpace {
                required,
                available: self.partition_size,
            });
        }

        image.extend_from_slice(&self.vbmeta);
        image.resize(self.partition_size as usize - FOOTER_SIZE, 0);

        let raw = RawFooter {
            magic: FOOTER_MAGIC,
            version_major: self.version_major.into(),
            version_minor: self.version_minor.into(),
            original_image_size: image_size.into(),
            vbmeta_offset: vbmeta_offset.into(),
            vbmeta_size: (self.vbmeta.len() as u64).into(),
            reserved: [0u8; 28],
        };
        image.extend_from_slice(raw.as_bytes());

        Ok(image)
    }
}

fn check_vbmeta(vbmeta: &[u8]) -> Result<()> {
    if vbmeta.len() < VBMETA_HEADER_SIZE {
        return Err(Error::VbmetaTooSmall(vbmeta.len()));
    }

    let magic = [vbmeta[0], vbmeta[1], vbmeta[2], vbmeta[3]];
    if magic != VBMETA_MAGIC {
        return Err(Error::InvalidVbmetaMagic(magic));
    }

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trailer {
    None,
    Raw(Vec<u8>),
    Avb(AvbTrailer),
}

impl Trailer {
    /// Reattach the trailer to a newly serialized image.
    pub fn apply(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(image),
            Self::Raw(tail) => {
                let mut image = image;
                image.extend_from_slice(tail);
                Ok(image)
            }
            Self::Avb(avb) => avb.append_to(image),
        }
    }
}

/// Split a partition image into the boot image and whatever follows it.
pub fn load_image(data: &[u8]) -> Result<(BootImage, Trailer)> {
    if let Some((image_size, mut avb)) = AvbTrailer::find(data)? {
        let (image, consumed) = BootImage::load(&data[..image_size])?;
        avb.tail = data[consumed as usize..image_size].to_vec();

        debug!("Found AVB footer: {avb:?}");

        return Ok((image, Trailer::Avb(avb)));
    }

    let (image, consumed) = BootImage::load(data)?;
    let tail = &data[consumed as usize..];

    if tail.is_empty() {
        Ok((image, Trailer::None))
    } else {
        debug!("Preserving {:?} of trailing data", NumBytes(tail.len()));
        Ok((image, Trailer::Raw(tail.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbmeta_blob() -> Vec<u8> {
        let mut vbmeta = vec![0u8; 512];
        vbmeta[..4].copy_from_slice(&VBMETA_MAGIC);
        vbmeta
    }

    #[test]
    fn avb_layout() {
        let trailer = AvbTrailer {
            version_major: 1,
            version_minor: 0,
            partition_size: 16384,
            vbmeta: vbmeta_blob(),
            tail: vec![],
        };

        let data = trailer.append_to(vec![0xaa; 5000]).unwrap();
        assert_eq!(data.len(), 16384);
        assert_eq!(&data[8192..8196], b"AVB0");
        assert_eq!(&data[16384 - 64..16384 - 60], b"AVBf");

        let (image_size, found) = AvbTrailer::find(&data).unwrap().unwrap();
        assert_eq!(image_size, 5000);
        assert_eq!(found, trailer);
    }

    #[test]
    fn avb_layout_with_tail() {
        let trailer = AvbTrailer {
            version_major: 1,
            version_minor: 0,
            partition_size: 16384,
            vbmeta: vbmeta_blob(),
            tail: b"SEANDROIDENFORCE".to_vec(),
        };

        let data = trailer.append_to(vec![0xaa; 4090]).unwrap();
        assert_eq!(&data[4090..4106], b"SEANDROIDENFORCE");
        // The tail pushes vbmeta into the next block.
        assert_eq!(&data[8192..8196], b"AVB0");

        let (image_size, _) = AvbTrailer::find(&data).unwrap().unwrap();
        assert_eq!(image_size, 4106);
    }

    #[test]
    fn avb_no_space() {
        let trailer = AvbTrailer {
            version_major: 1,
            version_minor: 0,
            partition_size: 8192,
            vbmeta: vbmeta_blob(),
            tail: vec![],
        };

        let err = trailer.append_to(vec![0xaa; 5000]).unwrap_err();
        assert!(matches!(err, Error::NoSpace { available: 8192, .. }));
    }

    #[test]
    fn vbmeta_flags() {
        let mut trailer = AvbTrailer {
            version_major: 1,
            version_minor: 0,
            partition_size: 16384,
            vbmeta: vbmeta_blob(),
            tail: vec![],
        };
        assert_eq!(trailer.flags().unwrap(), 0);

        trailer.disable_verification().unwrap();
        assert_eq!(trailer.flags().unwrap(), 3);

        trailer.vbmeta[0] = b'X';
        assert!(matches!(
            trailer.disable_verification(),
            Err(Error::InvalidVbmetaMagic(_)),
        ));
    }

    #[test]
    fn no_footer() {
        assert!(AvbTrailer::find(b"short").unwrap().is_none());
        assert!(AvbTrailer::find(&[0u8; 128]).unwrap().is_none());
    }
}
