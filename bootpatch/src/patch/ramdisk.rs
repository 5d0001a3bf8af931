// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Ordered modification of ramdisk entries, plus the `.backup/` bookkeeping
//! used to detect and undo previous patching.

use std::{str::Utf8Error, sync::atomic::AtomicBool};

use bstr::{BString, ByteSlice};
use memchr::memmem;
use ring::digest::SHA1_FOR_LEGACY_USE_ONLY;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    format::{
        compression::{self, CompressedFormat},
        cpio::{self, CpioEntry, CpioEntryType},
    },
    patch::{
        config::{self, BackupRecord},
        fstab,
    },
    util,
};

pub const BACKUP_DIR: &[u8] = b".backup";
pub const BACKUP_RAMDISK: &[u8] = b".backup/ramdisk.cpio";
pub const BACKUP_RECORD: &[u8] = b".backup/.magisk";

/// Mode for directories that are created implicitly.
pub const DEFAULT_DIR_MODE: u16 = 0o755;

const VERITY_KEY: &[u8] = b"verity_key";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid ramdisk path: {0:?}")]
    InvalidPath(BString),
    #[error("Parent path is not a directory: {0:?}")]
    NotADirectory(BString),
    #[error("Ramdisk is not patched")]
    NotPatched,
    #[error("Backup entry not found: {0:?}")]
    MissingBackup(BString),
    #[error("Backup record has no ramdisk digest")]
    MissingDigest,
    #[error("Backup ramdisk digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("Backup record is not UTF-8")]
    RecordNotUtf8(#[source] Utf8Error),
    #[error("Backup record error")]
    Record(#[from] config::Error),
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("CPIO error")]
    Cpio(#[from] cpio::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A single ramdisk modification. Directives are applied in order and a later
/// directive for a path overrides an earlier one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Directive {
    AddFile {
        path: BString,
        mode: u16,
        data: Vec<u8>,
    },
    MakeDir {
        path: BString,
        mode: u16,
    },
    Symlink {
        path: BString,
        target: BString,
    },
    Remove {
        path: BString,
        recursive: bool,
    },
    /// Strip flags from fstab files.
    PatchFstab {
        keep_verity: bool,
        keep_force_encrypt: bool,
    },
    /// Store the original uncompressed archive as [`BACKUP_RAMDISK`].
    Backup { original: Vec<u8> },
}

impl Directive {
    pub fn add_file(path: impl Into<BString>, mode: u16, data: Vec<u8>) -> Self {
        Self::AddFile {
            path: path.into(),
            mode,
            data,
        }
    }

    pub fn make_dir(path: impl Into<BString>, mode: u16) -> Self {
        Self::MakeDir {
            path: path.into(),
            mode,
        }
    }

    pub fn symlink(path: impl Into<BString>, target: impl Into<BString>) -> Self {
        Self::Symlink {
            path: path.into(),
            target: target.into(),
        }
    }

    pub fn remove(path: impl Into<BString>, recursive: bool) -> Self {
        Self::Remove {
            path: path.into(),
            recursive,
        }
    }

    /// Check the path arguments without applying anything.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::AddFile { path, .. }
            | Self::MakeDir { path, .. }
            | Self::Symlink { path, .. }
            | Self::Remove { path, .. } => validate_path(path),
            Self::PatchFstab { .. } | Self::Backup { .. } => Ok(()),
        }
    }
}

/// Paths must be relative and made of non-empty components other than `.` and
/// `..`.
pub fn validate_path(path: &[u8]) -> Result<()> {
    if path.is_empty()
        || path
            .split(|b| *b == b'/')
            .any(|c| c.is_empty() || c == b"." || c == b"..")
    {
        return Err(Error::InvalidPath(path.into()));
    }

    Ok(())
}

/// Applies [`Directive`]s to an entry list while preserving the entry order.
#[derive(Clone, Debug, Default)]
pub struct RamdiskMutator {
    entries: Vec<CpioEntry>,
}

impl RamdiskMutator {
    pub fn new(entries: Vec<CpioEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CpioEntry] {
        &self.entries
    }

    fn find(&self, path: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    /// Create missing parent directories of `path`.
    fn create_ancestors(&mut self, path: &[u8]) -> Result<()> {
        let mut end = 0;

        while let Some(pos) = memchr::memchr(b'/', &path[end..]) {
            end += pos;
            let parent = &path[..end];

            match self.find(parent) {
                Some(i) if self.entries[i].file_type != CpioEntryType::Directory => {
                    return Err(Error::NotADirectory(parent.into()));
                }
                Some(_) => {}
                None => {
                    trace!("Creating parent directory: {:?}", parent.as_bstr());
                    self.entries
                        .push(CpioEntry::new_directory(parent, DEFAULT_DIR_MODE));
                }
            }

            end += 1;
        }

        Ok(())
    }

    /// Insert an entry, replacing any existing entry with the same path in
    /// its original position.
    fn upsert(&mut self, entry: CpioEntry) -> Result<()> {
        validate_path(&entry.path)?;
        self.create_ancestors(&entry.path)?;

        match self.find(&entry.path) {
            Some(i) => {
                trace!("Replacing entry: {}", entry);
                self.entries[i] = entry;
            }
            None => {
                trace!("Adding entry: {}", entry);
                self.entries.push(entry);
            }
        }

        Ok(())
    }

    fn remove(&mut self, path: &[u8], recursive: bool) -> Result<()> {
        validate_path(path)?;

        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.path == path || (recursive && e.is_under(path))));

        debug!(
            "Removed {} entries for {:?}",
            before - self.entries.len(),
            path.as_bstr(),
        );

        Ok(())
    }

    fn patch_fstab(&mut self, keep_verity: bool, keep_force_encrypt: bool) {
        let is_fstab = |e: &CpioEntry| {
            e.file_type == CpioEntryType::Regular
                && !e.is_under(BACKUP_DIR)
                && memmem::find(&e.path, b"fstab").is_some()
                && memmem::find(&e.path, b"twrp").is_none()
                && memmem::find(&e.path, b"recovery").is_none()
        };

        if !keep_verity {
            self.entries.retain(|e| {
                let remove = e.path == VERITY_KEY;
                if remove {
                    debug!("Removing {:?}", e.path.as_bstr());
                }
                !remove
            });
        }

        for entry in self.entries.iter_mut().filter(|e| is_fstab(e)) {
            if !keep_verity {
                let (data, n) = fstab::remove_fstab_flags(&entry.data, fstab::VERITY_FLAGS);
                if n > 0 {
                    debug!("Removed {n} verity flags from {:?}", entry.path.as_bstr());
                    entry.data = data;
                }
            }

            if !keep_force_encrypt {
                let (data, n) = fstab::remove_fstab_flags(&entry.data, fstab::ENCRYPTION_FLAGS);
                if n > 0 {
                    debug!("Removed {n} encryption flags from {:?}", entry.path.as_bstr());
                    entry.data = data;
                }
            }
        }
    }

    pub fn apply(&mut self, directive: &Directive) -> Result<()> {
        match directive {
            Directive::AddFile { path, mode, data } => {
                self.upsert(CpioEntry::new_file(path, *mode, data.clone()))
            }
            Directive::MakeDir { path, mode } => {
                validate_path(path)?;

                // Only the mode changes for existing directories.
                match self.find(path) {
                    Some(i) if self.entries[i].file_type == CpioEntryType::Directory => {
                        self.entries[i].file_mode = *mode;
                        Ok(())
                    }
                    _ => self.upsert(CpioEntry::new_directory(path, *mode)),
                }
            }
            Directive::Symlink { path, target } => {
                self.upsert(CpioEntry::new_symlink(path, target))
            }
            Directive::Remove { path, recursive } => self.remove(path, *recursive),
            Directive::PatchFstab {
                keep_verity,
                keep_force_encrypt,
            } => {
                self.patch_fstab(*keep_verity, *keep_force_encrypt);
                Ok(())
            }
            Directive::Backup { original } => {
                self.upsert(CpioEntry::new_file(BACKUP_RAMDISK, 0, original.clone()))
            }
        }
    }

    pub fn apply_all<'a>(
        &mut self,
        directives: impl IntoIterator<Item = &'a Directive>,
    ) -> Result<()> {
        for directive in directives {
            self.apply(directive)?;
        }

        Ok(())
    }

    /// Finish mutating. Inodes are renumbered so that the output does not
    /// depend on the inode values of the input archive.
    pub fn commit(mut self) -> Result<Vec<CpioEntry>> {
        cpio::assign_inodes(&mut self.entries)?;

        Ok(self.entries)
    }
}

/// Decompress a ramdisk section. An empty section is treated as an empty
/// lz4-legacy archive, which is what the kernel expects for new ramdisks.
pub fn unpack(data: &[u8], cancel_signal: &AtomicBool) -> Result<(Vec<u8>, CompressedFormat)> {
    if data.is_empty() {
        return Ok((vec![], CompressedFormat::Lz4Legacy));
    }

    let (archive, format) = compression::decompress(data, true, cancel_signal)?;
    debug!("Ramdisk format: {format}");

    Ok((archive, format))
}

/// Decode an uncompressed archive. Empty data, which is what [`unpack`] returns
/// for a missing ramdisk, has no entries.
pub fn decode(archive: &[u8], cancel_signal: &AtomicBool) -> Result<Vec<CpioEntry>> {
    if archive.is_empty() {
        return Ok(vec![]);
    }

    Ok(cpio::decode(archive, cancel_signal)?)
}

/// Encode and compress entries into a ramdisk section.
pub fn pack(
    entries: &[CpioEntry],
    format: CompressedFormat,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let archive = cpio::encode(entries, cancel_signal)?;
    let data = compression::compress(&archive, format, cancel_signal)?;

    trace!("Packed {format} ramdisk with {} entries", entries.len());

    Ok(data)
}

pub fn is_patched(entries: &[CpioEntry]) -> bool {
    entries.iter().any(|e| e.path == BACKUP_RECORD)
}

/// Read the `.backup/.magisk` record, if present.
pub fn read_record(entries: &[CpioEntry]) -> Result<Option<BackupRecord>> {
    let Some(entry) = entries.iter().find(|e| e.path == BACKUP_RECORD) else {
        return Ok(None);
    };

    let text = std::str::from_utf8(&entry.data).map_err(Error::RecordNotUtf8)?;

    Ok(Some(BackupRecord::parse(text)?))
}

/// Return the original uncompressed archive stored in a patched ramdisk. The
/// data is checked against the digest in the record.
pub fn restore(entries: &[CpioEntry]) -> Result<Vec<u8>> {
    let record = read_record(entries)?.ok_or(Error::NotPatched)?;
    let expected = record.ramdisk_sha1.ok_or(Error::MissingDigest)?;

    let backup = entries
        .iter()
        .find(|e| e.path == BACKUP_RAMDISK)
        .ok_or_else(|| Error::MissingBackup(BACKUP_RAMDISK.into()))?;

    let actual = util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &backup.data);
    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(Error::DigestMismatch { expected, actual });
    }

    if backup.data.is_empty() {
        warn!("Original ramdisk was empty");
    }

    Ok(backup.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path(b"overlay.d/sbin/init_patch").is_ok());
        assert!(validate_path(b".backup/.magisk").is_ok());
        for bad in [&b""[..], b"/init", b"a//b", b"a/", b"./init", b"a/../b"] {
            assert!(matches!(validate_path(bad), Err(Error::InvalidPath(_))), "{bad:?}");
        }
    }

    #[test]
    fn ancestors_created_in_order() {
        let mut mutator = RamdiskMutator::default();
        mutator
            .apply(&Directive::add_file("a/b/c", 0o644, b"x".to_vec()))
            .unwrap();

        let paths = mutator
            .entries()
            .iter()
            .map(|e| (e.path.as_bstr().to_string(), e.file_mode))
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            [
                ("a".to_owned(), 0o755),
                ("a/b".to_owned(), 0o755),
                ("a/b/c".to_owned(), 0o644),
            ],
        );
    }

    #[test]
    fn parent_must_be_directory() {
        let mut mutator = RamdiskMutator::new(vec![CpioEntry::new_file(b"init", 0o750, vec![])]);
        assert!(matches!(
            mutator.apply(&Directive::add_file("init/x", 0o644, vec![])),
            Err(Error::NotADirectory(_)),
        ));
    }
}
