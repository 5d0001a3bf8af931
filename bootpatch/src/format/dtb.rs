// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A minimal walker for flattened device trees. Only the structure and strings
//! blocks are interpreted. Properties are reported as byte ranges into the
//! original buffer so that callers can patch values in place without changing
//! the size of the tree.

use std::ops::Range;

use memchr::memmem;
use thiserror::Error;
use tracing::trace;
use zerocopy::{FromBytes, big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util::{self, OutOfBoundsError};

pub const FDT_MAGIC: u32 = 0xd00dfeed;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Nesting deeper than this is treated as a malformed tree.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:#010x}")]
    UnknownMagic(u32),
    #[error("Header is truncated")]
    TruncatedHeader,
    #[error("{0:?} field is out of bounds")]
    IntOutOfBounds(&'static str, #[source] OutOfBoundsError),
    #[error("Unexpected end of structure block at offset {0}")]
    Truncated(usize),
    #[error("Unknown token {token:#x} at offset {offset}")]
    UnknownToken { token: u32, offset: usize },
    #[error("String at offset {0} is not NULL terminated")]
    StringNotTerminated(usize),
    #[error("Unbalanced node nesting at offset {0}")]
    UnbalancedNodes(usize),
    #[error("Node nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the FDT header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    magic: big_endian::U32,
    totalsize: big_endian::U32,
    off_dt_struct: big_endian::U32,
    off_dt_strings: big_endian::U32,
    off_mem_rsvmap: big_endian::U32,
    version: big_endian::U32,
    last_comp_version: big_endian::U32,
    boot_cpuid_phys: big_endian::U32,
    size_dt_strings: big_endian::U32,
    size_dt_struct: big_endian::U32,
}

const HEADER_SIZE: usize = std::mem::size_of::<RawHeader>();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    /// Slash-separated node path, with the root node being `/`.
    pub node: String,
    pub name: String,
    /// Location of the value relative to the start of the tree.
    pub value: Range<usize>,
}

impl Property {
    /// Whether any ancestor node has the given name, ignoring unit addresses.
    pub fn is_under(&self, node_name: &str) -> bool {
        self.node
            .split('/')
            .map(|c| c.split_once('@').map_or(c, |(n, _)| n))
            .any(|c| c == node_name)
    }
}

#[derive(Clone, Debug)]
pub struct Fdt<'a> {
    data: &'a [u8],
    struct_block: Range<usize>,
    strings_block: Range<usize>,
}

impl<'a> Fdt<'a> {
    /// Parse the header of a tree starting at the beginning of `data`. Data
    /// past the header's `totalsize` is ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = data
            .get(..HEADER_SIZE)
            .and_then(|h| RawHeader::read_from_bytes(h).ok())
            .ok_or(Error::TruncatedHeader)?;

        if header.magic.get() != FDT_MAGIC {
            return Err(Error::UnknownMagic(header.magic.get()));
        }

        let total_size = util::check_bounds(header.totalsize.get() as usize, HEADER_SIZE..=data.len())
            .map_err(|e| Error::IntOutOfBounds("totalsize", e))?;

        let block = |name: &'static str, offset: u32, size: u32| -> Result<Range<usize>> {
            let start = util::check_bounds(offset as usize, HEADER_SIZE..=total_size)
                .map_err(|e| Error::IntOutOfBounds(name, e))?;
            let end = util::check_bounds(start + size as usize, start..=total_size)
                .map_err(|e| Error::IntOutOfBounds(name, e))?;
            Ok(start..end)
        };

        // Version 17 added size_dt_struct. Older trees run to totalsize.
        let struct_size = if header.version.get() >= 17 {
            header.size_dt_struct.get()
        } else {
            header.totalsize.get().saturating_sub(header.off_dt_struct.get())
        };

        let struct_block = block("off_dt_struct", header.off_dt_struct.get(), struct_size)?;
        let strings_block = block(
            "off_dt_strings",
            header.off_dt_strings.get(),
            header.size_dt_strings.get(),
        )?;

        Ok(Self {
            data: &data[..total_size],
            struct_block,
            strings_block,
        })
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        self.data
            .get(offset..offset + 4)
            .filter(|_| offset + 4 <= self.struct_block.end)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(Error::Truncated(offset))
    }

    fn read_str(&self, offset: usize, limit: usize) -> Result<&'a [u8]> {
        let data = self.data;
        let region = data.get(offset..limit).ok_or(Error::Truncated(offset))?;
        let len = memchr::memchr(0, region).ok_or(Error::StringNotTerminated(offset))?;

        Ok(&data[offset..offset + len])
    }

    /// Walk the structure block and return every property in document order.
    pub fn properties(&self) -> Result<Vec<Property>> {
        let mut result = vec![];
        let mut stack: Vec<String> = vec![];
        let mut offset = self.struct_block.start;

        loop {
            let token = self.read_u32(offset)?;

            match token {
                FDT_BEGIN_NODE => {
                    let name = self.read_str(offset + 4, self.struct_block.end)?;
                    if stack.len() == MAX_DEPTH {
                        return Err(Error::TooDeep);
                    }
                    stack.push(String::from_utf8_lossy(name).into_owned());
                    offset += 4 + align4(name.len() + 1);
                }
                FDT_END_NODE => {
                    stack.pop().ok_or(Error::UnbalancedNodes(offset))?;
                    offset += 4;
                }
                FDT_PROP => {
                    let len = self.read_u32(offset + 4)? as usize;
                    let name_off = self.read_u32(offset + 8)? as usize;
                    let start = offset + 12;
                    let end = start
                        .checked_add(len)
                        .filter(|e| *e <= self.struct_block.end)
                        .ok_or(Error::Truncated(start))?;

                    let name = self.read_str(
                        self.strings_block.start.saturating_add(name_off),
                        self.strings_block.end,
                    )?;

                    let node = match stack.len() {
                        0 => return Err(Error::UnbalancedNodes(offset)),
                        1 => "/".to_owned(),
                        _ => stack[1..].iter().fold(String::new(), |mut p, c| {
                            p.push('/');
                            p.push_str(c);
                            p
                        }),
                    };

                    result.push(Property {
                        node,
                        name: String::from_utf8_lossy(name).into_owned(),
                        value: start..end,
                    });
                    offset = start + align4(len);
                }
                FDT_NOP => offset += 4,
                FDT_END => break,
                t => return Err(Error::UnknownToken { token: t, offset }),
            }
        }

        if !stack.is_empty() {
            return Err(Error::UnbalancedNodes(offset));
        }

        Ok(result)
    }
}

fn align4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

/// Find every valid tree in a blob. Device tree sections often contain
/// multiple concatenated trees and kernels can have trees appended to them.
pub fn find_all(data: &[u8]) -> Vec<Range<usize>> {
    let magic = FDT_MAGIC.to_be_bytes();
    let finder = memmem::Finder::new(&magic);
    let mut result = vec![];
    let mut offset = 0;

    while let Some(pos) = finder.find(&data[offset..]) {
        let start = offset + pos;

        match Fdt::parse(&data[start..]).and_then(|fdt| fdt.properties().map(|_| fdt)) {
            Ok(fdt) => {
                trace!("Found device tree at {start:#x}: {} bytes", fdt.total_size());
                let end = start + fdt.total_size();
                result.push(start..end);
                offset = end;
            }
            Err(e) => {
                trace!("Ignoring device tree magic at {start:#x}: {e}");
                offset = start + 1;
            }
        }
    }

    result
}

/// Locate the first device tree appended to a kernel image. Returns the offset
/// where the kernel itself ends.
pub fn find_appended(kernel: &[u8]) -> Option<usize> {
    find_all(kernel).first().map(|r| r.start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(13), 16);
    }

    #[test]
    fn property_ancestry() {
        let prop = Property {
            node: "/firmware/android/fstab@0/system".to_owned(),
            name: "fsmgr_flags".to_owned(),
            value: 0..0,
        };
        assert!(prop.is_under("fstab"));
        assert!(prop.is_under("android"));
        assert!(!prop.is_under("vendor"));
    }

    #[test]
    fn bad_headers() {
        assert!(matches!(Fdt::parse(&[0u8; 8]), Err(Error::TruncatedHeader)));
        assert!(matches!(
            Fdt::parse(&[0u8; HEADER_SIZE]),
            Err(Error::UnknownMagic(0)),
        ));
        assert!(find_all(b"no device trees here").is_empty());
    }
}
