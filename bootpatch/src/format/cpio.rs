/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    io::{self, Cursor, Read, Write},
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::{
    format::padding,
    stream::{self, CountingReader, CountingWriter, FromReader, ReadFixedSizeExt, ToWriter},
    util::NumBytes,
};

const MAGIC_NEW: &[u8; 6] = b"070701";
const MAGIC_NEW_CRC: &[u8; 6] = b"070702";

pub const CPIO_TRAILER: &[u8; 10] = b"TRAILER!!!";

const S_IFMT: u32 = 0o170000;
const S_IFIFO: u32 = 0o010000;
const S_IFCHR: u32 = 0o020000;
const S_IFDIR: u32 = 0o040000;
const S_IFBLK: u32 = 0o060000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFSOCK: u32 = 0o140000;

const PERM_MASK: u32 = 0o7777;

const IO_BLOCK_SIZE: u64 = 512;

/// Maximum length of an entry path, including the NULL terminator. This is the
/// kernel's PATH_MAX.
const PATH_MAX: u32 = 4096;

/// First inode number handed out by [`assign_inodes`].
const FIRST_INODE: u32 = 300000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 6]),
    #[error("{0:?} field is not a hex number: {data:?}", data = .1.as_bstr())]
    InvalidHex(&'static str, [u8; 8]),
    #[error("{0:?} field is out of bounds: {1}")]
    IntOutOfBounds(&'static str, u32),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Path is not NULL-terminated: {:?}", .0.as_bstr())]
    PathNotTerminated(Vec<u8>),
    #[error("Path escapes the archive root: {:?}", .0.as_bstr())]
    UnsafePath(Vec<u8>),
    #[error("Unknown file type for {path:?}: {1:o}", path = .0.as_bstr())]
    UnknownFileType(Vec<u8>, u32),
    #[error("Hard links are not supported: {:?}", .0.as_bstr())]
    HardLinksNotSupported(Vec<u8>),
    #[error("Entry {:?} was truncated", .0.as_bstr())]
    Truncated(Vec<u8>, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpioEntryType {
    Pipe,
    Char,
    Directory,
    Block,
    Regular,
    Symlink,
    Socket,
}

impl CpioEntryType {
    fn from_mode(mode: u32) -> Option<Self> {
        let file_type = match mode & S_IFMT {
            S_IFIFO => Self::Pipe,
            S_IFCHR => Self::Char,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::Block,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            _ => return None,
        };

        Some(file_type)
    }

    fn to_mode(self) -> u32 {
        match self {
            Self::Pipe => S_IFIFO,
            Self::Char => S_IFCHR,
            Self::Directory => S_IFDIR,
            Self::Block => S_IFBLK,
            Self::Regular => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::Socket => S_IFSOCK,
        }
    }
}

impl fmt::Display for CpioEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipe => "pipe",
            Self::Char => "character device",
            Self::Directory => "directory",
            Self::Block => "block device",
            Self::Regular => "regular file",
            Self::Symlink => "symbolic link",
            Self::Socket => "socket",
        };

        f.write_str(name)
    }
}

/// Check that a path is relative and has no `..` components. Empty and `.`
/// components are allowed because some archivers emit `./` prefixes.
pub fn is_safe_path(path: &[u8]) -> bool {
    !path.is_empty() && !path.starts_with(b"/") && !path.split(|b| *b == b'/').any(|c| c == b"..")
}

/// Read u32 formatted as an ASCII 8-char wide hex string.
fn read_int(mut reader: impl Read, field: &'static str) -> Result<u32> {
    let buf = reader.read_array_exact::<8>()?;

    let mut value = 0;

    for b in buf {
        let digit = (b as char)
            .to_digit(16)
            .ok_or(Error::InvalidHex(field, buf))?;

        value <<= 4;
        value |= digit;
    }

    Ok(value)
}

/// Write u32 formatted as an ASCII 8-char wide hex string.
fn write_int(mut writer: impl Write, value: u32) -> io::Result<()> {
    write!(writer, "{value:08x}")
}

/// Raw newc header fields, minus the magic.
#[derive(Default)]
struct Header {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    filesize: u32,
    dev_maj: u32,
    dev_min: u32,
    rdev_maj: u32,
    rdev_min: u32,
    namesize: u32,
    chksum: u32,
}

impl Header {
    fn read(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            ino: read_int(&mut reader, "ino")?,
            mode: read_int(&mut reader, "mode")?,
            uid: read_int(&mut reader, "uid")?,
            gid: read_int(&mut reader, "gid")?,
            nlink: read_int(&mut reader, "nlink")?,
            mtime: read_int(&mut reader, "mtime")?,
            filesize: read_int(&mut reader, "filesize")?,
            dev_maj: read_int(&mut reader, "dev_maj")?,
            dev_min: read_int(&mut reader, "dev_min")?,
            rdev_maj: read_int(&mut reader, "rdev_maj")?,
            rdev_min: read_int(&mut reader, "rdev_min")?,
            namesize: read_int(&mut reader, "namesize")?,
            chksum: read_int(&mut reader, "chksum")?,
        })
    }

    fn write(&self, mut writer: impl Write, crc: bool) -> io::Result<()> {
        writer.write_all(if crc { MAGIC_NEW_CRC } else { MAGIC_NEW })?;

        for value in [
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.filesize,
            self.dev_maj,
            self.dev_min,
            self.rdev_maj,
            self.rdev_min,
            self.namesize,
            self.chksum,
        ] {
            write_int(&mut writer, value)?;
        }

        Ok(())
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)))
}

#[derive(Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub path: Vec<u8>,
    pub file_type: CpioEntryType,
    /// Permission bits, including setuid, setgid, and sticky.
    pub file_mode: u16,
    pub inode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub dev_maj: u32,
    pub dev_min: u32,
    pub rdev_maj: u32,
    pub rdev_min: u32,
    /// [`None`] for the "newc" format. For the "crc" format, the checksum of
    /// regular files is recomputed when writing and the stored value is only
    /// used for other file types.
    pub checksum: Option<u32>,
    /// File contents or symlink target.
    pub data: Vec<u8>,
}

impl fmt::Debug for CpioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpioEntry")
            .field("path", &self.path.as_bstr())
            .field("file_type", &self.file_type)
            .field("file_mode", &format_args!("{:o}", self.file_mode))
            .field("inode", &self.inode)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("nlink", &self.nlink)
            .field("mtime", &self.mtime)
            .field("dev_maj", &self.dev_maj)
            .field("dev_min", &self.dev_min)
            .field("rdev_maj", &self.rdev_maj)
            .field("rdev_min", &self.rdev_min)
            .field("checksum", &self.checksum)
            .field("data", &NumBytes(self.data.len()))
            .finish()
    }
}

impl fmt::Display for CpioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Path:      {:?}", self.path.as_bstr())?;
        writeln!(f, "Type:      {}", self.file_type)?;
        writeln!(f, "Mode:      {:o}", self.file_mode)?;
        writeln!(f, "Inode:     {}", self.inode)?;
        writeln!(f, "UID:       {}", self.uid)?;
        writeln!(f, "GID:       {}", self.gid)?;
        writeln!(f, "Links:     {}", self.nlink)?;
        writeln!(f, "Modified:  {}", self.mtime)?;
        writeln!(f, "Device:    {:x},{:x}", self.dev_maj, self.dev_min)?;
        writeln!(f, "Device ID: {:x},{:x}", self.rdev_maj, self.rdev_min)?;
        if self.file_type == CpioEntryType::Symlink {
            writeln!(f, "Target:    {:?}", self.data.as_bstr())?;
        } else {
            writeln!(f, "Content:   {:?}", NumBytes(self.data.len()))?;
        }

        Ok(())
    }
}

impl CpioEntry {
    /// Create an entry with fixed metadata (root owned, zero timestamp) so
    /// that generated archives are reproducible.
    fn new(path: &[u8], file_type: CpioEntryType, file_mode: u16, data: Vec<u8>) -> Self {
        Self {
            path: path.to_owned(),
            file_type,
            file_mode,
            inode: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            mtime: 0,
            dev_maj: 0,
            dev_min: 0,
            rdev_maj: 0,
            rdev_min: 0,
            checksum: None,
            data,
        }
    }

    pub fn new_file(path: &[u8], file_mode: u16, data: Vec<u8>) -> Self {
        Self::new(path, CpioEntryType::Regular, file_mode, data)
    }

    pub fn new_directory(path: &[u8], file_mode: u16) -> Self {
        Self::new(path, CpioEntryType::Directory, file_mode, vec![])
    }

    pub fn new_symlink(path: &[u8], target: &[u8]) -> Self {
        Self::new(path, CpioEntryType::Symlink, 0o777, target.to_owned())
    }

    /// Whether this entry is `other` or is located somewhere underneath it.
    pub fn is_under(&self, other: &[u8]) -> bool {
        self.path == other
            || (self.path.starts_with(other) && self.path.get(other.len()) == Some(&b'/'))
    }
}

/// Read the next entry. The trailer is returned as [`None`].
fn read_entry(reader: impl Read) -> Result<Option<CpioEntry>> {
    let mut reader = CountingReader::new(reader);

    let magic = reader.read_array_exact::<6>()?;
    let crc = match &magic {
        MAGIC_NEW => false,
        MAGIC_NEW_CRC => true,
        _ => return Err(Error::UnknownMagic(magic)),
    };

    let header = Header::read(&mut reader)?;

    if header.namesize == 0 || header.namesize > PATH_MAX {
        return Err(Error::IntOutOfBounds("namesize", header.namesize));
    }

    let mut path = reader
        .read_vec_bounded(header.namesize.into())
        .map_err(|e| Error::Truncated(vec![], e))?;
    if path.pop() != Some(b'\0') {
        return Err(Error::PathNotTerminated(path));
    }
    padding::read_discard(&mut reader, 4).map_err(|e| Error::Truncated(path.clone(), e))?;

    let data = reader
        .read_vec_bounded(header.filesize.into())
        .map_err(|e| Error::Truncated(path.clone(), e))?;
    padding::read_discard(&mut reader, 4).map_err(|e| Error::Truncated(path.clone(), e))?;

    if path == CPIO_TRAILER {
        return Ok(None);
    }

    if !is_safe_path(&path) {
        return Err(Error::UnsafePath(path));
    }

    let Some(file_type) = CpioEntryType::from_mode(header.mode) else {
        return Err(Error::UnknownFileType(path, header.mode));
    };
    if header.mode & !(S_IFMT | PERM_MASK) != 0 {
        return Err(Error::IntOutOfBounds("mode", header.mode));
    }

    if file_type != CpioEntryType::Directory && header.nlink > 1 {
        return Err(Error::HardLinksNotSupported(path));
    }

    Ok(Some(CpioEntry {
        path,
        file_type,
        file_mode: (header.mode & PERM_MASK) as u16,
        inode: header.ino,
        uid: header.uid,
        gid: header.gid,
        nlink: header.nlink,
        mtime: header.mtime,
        dev_maj: header.dev_maj,
        dev_min: header.dev_min,
        rdev_maj: header.rdev_maj,
        rdev_min: header.rdev_min,
        checksum: crc.then_some(header.chksum),
        data,
    }))
}

impl<R: Read> FromReader<R> for CpioEntry {
    type Error = Error;

    /// Read a single entry. Reaching the trailer is reported as an
    /// [`io::ErrorKind::UnexpectedEof`] error. Use [`load`] to read a whole
    /// archive.
    fn from_reader(reader: R) -> Result<Self> {
        read_entry(reader)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "Reached cpio trailer").into()
        })
    }
}

impl<W: Write> ToWriter<W> for CpioEntry {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        let mut writer = CountingWriter::new(writer);

        let filesize = self
            .data
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("filesize"))?;
        let namesize = self
            .path
            .len()
            .checked_add(1)
            .and_then(|s| s.to_u32())
            .ok_or(Error::IntegerTooLarge("namesize"))?;

        let chksum = match (self.checksum, self.file_type) {
            (None, _) => 0,
            (Some(_), CpioEntryType::Regular) => checksum(&self.data),
            (Some(c), _) => c,
        };

        let header = Header {
            ino: self.inode,
            mode: self.file_type.to_mode() | (u32::from(self.file_mode) & PERM_MASK),
            uid: self.uid,
            gid: self.gid,
            nlink: self.nlink,
            mtime: self.mtime,
            filesize,
            dev_maj: self.dev_maj,
            dev_min: self.dev_min,
            rdev_maj: self.rdev_maj,
            rdev_min: self.rdev_min,
            namesize,
            chksum,
        };

        header.write(&mut writer, self.checksum.is_some())?;

        writer.write_all(&self.path)?;
        writer.write_all(b"\0")?;
        padding::write_zeros(&mut writer, 4)?;

        writer.write_all(&self.data)?;
        padding::write_zeros(&mut writer, 4)?;

        Ok(())
    }
}

/// Load all entries from an archive. Reading stops at the trailer, so any
/// padding after it is ignored.
pub fn load(mut reader: impl Read, cancel_signal: &AtomicBool) -> Result<Vec<CpioEntry>> {
    let mut entries = vec![];

    loop {
        stream::check_cancel(cancel_signal)?;

        match read_entry(&mut reader)? {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }

    Ok(entries)
}

/// Write all entries followed by a trailer. If `pad_to_block_size` is true,
/// the archive is padded to a multiple of 512 bytes.
pub fn save(
    writer: impl Write,
    entries: &[CpioEntry],
    pad_to_block_size: bool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut writer = CountingWriter::new(writer);

    for entry in entries {
        stream::check_cancel(cancel_signal)?;

        entry.to_writer(&mut writer)?;
    }

    let trailer = Header {
        // 1 higher than the highest inode if possible.
        ino: entries
            .iter()
            .map(|e| e.inode)
            .max()
            .map_or(0, |i| i.wrapping_add(1)),
        // Must be 1 for the CRC format.
        nlink: 1,
        namesize: CPIO_TRAILER.len() as u32 + 1,
        ..Default::default()
    };
    trailer.write(&mut writer, false)?;
    writer.write_all(CPIO_TRAILER)?;
    writer.write_all(b"\0")?;
    padding::write_zeros(&mut writer, 4)?;

    if pad_to_block_size {
        padding::write_zeros(&mut writer, IO_BLOCK_SIZE)?;
    }

    Ok(())
}

/// Decode an in-memory archive.
pub fn decode(data: &[u8], cancel_signal: &AtomicBool) -> Result<Vec<CpioEntry>> {
    load(Cursor::new(data), cancel_signal)
}

/// Encode entries into an in-memory archive. The output only depends on the
/// entries, so encoding the same entries twice yields identical bytes.
pub fn encode(entries: &[CpioEntry], cancel_signal: &AtomicBool) -> Result<Vec<u8>> {
    let mut writer = Cursor::new(Vec::new());
    save(&mut writer, entries, false, cancel_signal)?;
    Ok(writer.into_inner())
}

pub fn sort(entries: &mut [CpioEntry]) {
    entries.sort_by(|a, b| a.path.cmp(&b.path));
}

/// Renumber inodes sequentially in entry order.
pub fn assign_inodes(entries: &mut [CpioEntry]) -> Result<()> {
    if entries.len() > (u32::MAX - FIRST_INODE) as usize {
        return Err(Error::IntegerTooLarge("inode"));
    }

    for (entry, inode) in entries.iter_mut().zip(FIRST_INODE..) {
        entry.inode = inode;
    }

    Ok(())
}
