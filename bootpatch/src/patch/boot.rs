// SPDX-FileCopyrightText: 2022-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The patching pipeline. A run moves through [`Unpacked`],
//! [`RamdiskPatched`], [`KernelPatched`], and [`Repacked`] in that order. Only
//! the final transition writes to the output path.

use std::{
    fmt,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bstr::BString;
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

use crate::{
    format::{
        bootimage::{self, BootImage, BootImageExt, SectionKind},
        compression::{self, CompressedFormat},
        cpio,
        dtb,
        footer::{self, Trailer},
    },
    patch::{
        config::{self, BackupRecord, PatchConfig},
        fstab,
        hexpatch::{self, HexPatch},
        ramdisk::{self, Directive, RamdiskMutator},
    },
    stream, util,
};

/// Machine-readable error classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Unparseable or unsupported container or archive.
    Format,
    /// Invalid patch directive or rule.
    Config,
    /// Filesystem access failure or cancellation.
    Io,
    /// A mandatory rule did not match or a checksum did not match.
    Integrity,
}

impl ErrorKind {
    /// Process exit code for this kind of failure.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Format => 2,
            Self::Config => 3,
            Self::Io => 4,
            Self::Integrity => 5,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Format => "FormatError",
            Self::Config => "ConfigError",
            Self::Io => "IOError",
            Self::Integrity => "IntegrityError",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Output path is the same as the input path: {0:?}")]
    OutputIsInput(PathBuf),
    #[error("Image has no ramdisk slot")]
    NoRamdiskSlot,
    #[error("Mandatory hex patch had no matches: {0}")]
    MandatoryPatchUnmatched(String),
    #[error("Invalid hex patch rule: {0}")]
    InvalidHexPatch(String, #[source] hexpatch::Error),
    #[error("Section count changed after reassembly: {expected} != {actual}")]
    SectionCountMismatch { expected: usize, actual: usize },
    #[error("Section {0:?} changed after reassembly")]
    SectionMismatch(String),
    #[error("{0}")]
    Validation(String),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("Config error")]
    Config(#[from] config::Error),
    #[error("CPIO error")]
    Cpio(#[from] cpio::Error),
    #[error("Device tree error")]
    Dtb(#[from] dtb::Error),
    #[error("Trailer error")]
    Footer(#[from] footer::Error),
    #[error("Hex patch error")]
    HexPatch(#[from] hexpatch::Error),
    #[error("Ramdisk error")]
    Ramdisk(#[from] ramdisk::Error),
    #[error("Failed to serialize header")]
    TomlSer(#[from] toml_edit::ser::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutputIsInput(_)
            | Self::InvalidHexPatch(_, _)
            | Self::Validation(_)
            | Self::HexPatch(_) => ErrorKind::Config,
            Self::Cpio(cpio::Error::Io(e)) if is_cancelled(e) => ErrorKind::Io,
            Self::NoRamdiskSlot
            | Self::BootImage(_)
            | Self::Compression(_)
            | Self::Cpio(_)
            | Self::Dtb(_)
            | Self::TomlSer(_) => ErrorKind::Format,
            Self::MandatoryPatchUnmatched(_)
            | Self::SectionCountMismatch { .. }
            | Self::SectionMismatch(_) => ErrorKind::Integrity,
            Self::Config(e) => match e {
                config::Error::Io(_, _) => ErrorKind::Io,
                _ => ErrorKind::Config,
            },
            Self::Footer(e) => match e {
                footer::Error::NoSpace { .. } => ErrorKind::Integrity,
                _ => ErrorKind::Format,
            },
            Self::Ramdisk(e) => match e {
                ramdisk::Error::InvalidPath(_) | ramdisk::Error::NotADirectory(_) => {
                    ErrorKind::Config
                }
                ramdisk::Error::MissingBackup(_)
                | ramdisk::Error::MissingDigest
                | ramdisk::Error::DigestMismatch { .. } => ErrorKind::Integrity,
                ramdisk::Error::Cpio(cpio::Error::Io(e)) if is_cancelled(e) => ErrorKind::Io,
                _ => ErrorKind::Format,
            },
            Self::Io(_) | Self::File(_, _) => ErrorKind::Io,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

fn is_cancelled(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}

/// The pipeline stage in which a failure occurred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Unpack,
    Ramdisk,
    Kernel,
    Repack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unpack => "unpack",
            Self::Ramdisk => "ramdisk",
            Self::Kernel => "kernel",
            Self::Repack => "repack",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("Failed in {stage} stage ({kind})", kind = .source.kind())]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

trait StageResultExt<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T, E: Into<Error>> StageResultExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|e| StageError {
            stage,
            source: e.into(),
        })
    }
}

/// A modification that runs on the whole image after the kernel rules.
pub trait BootImagePatch {
    fn patcher_name(&self) -> &'static str;

    fn patch(&self, boot_image: &mut BootImage, cancel_signal: &AtomicBool) -> Result<()>;
}

/// Apply hex patch rules to their target sections. Kernel rules operate on
/// the decompressed kernel. The kernel is only recompressed if a rule matched.
pub struct HexPatcher {
    rules: Vec<HexPatch>,
}

impl HexPatcher {
    pub fn new(rules: Vec<HexPatch>) -> Self {
        Self { rules }
    }

    fn patch_kernel(
        kernel: &mut Vec<u8>,
        rules: &[(usize, &HexPatch)],
        counts: &mut [usize],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let split = dtb::find_appended(kernel).unwrap_or(kernel.len());
        let (body, appended) = kernel.split_at(split);
        if !appended.is_empty() {
            debug!("Kernel has {} byte appended device tree", appended.len());
        }

        let (mut raw, format) = compression::decompress(body, true, cancel_signal)?;
        debug!("Kernel format: {format}");

        let mut total = 0;
        for (i, rule) in rules {
            counts[*i] = rule.apply_in_place(&mut raw)?;
            total += counts[*i];
        }

        if total > 0 {
            let mut new_kernel = match format {
                CompressedFormat::None => raw,
                f => compression::compress(&raw, f, cancel_signal)?,
            };
            new_kernel.extend_from_slice(appended);

            *kernel = new_kernel;
        }

        Ok(())
    }
}

impl BootImagePatch for HexPatcher {
    fn patcher_name(&self) -> &'static str {
        "HexPatcher"
    }

    fn patch(&self, boot_image: &mut BootImage, cancel_signal: &AtomicBool) -> Result<()> {
        let mut counts = vec![0; self.rules.len()];

        let kernel_rules = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.target == SectionKind::Kernel)
            .collect::<Vec<_>>();

        if !kernel_rules.is_empty() {
            if let Some(kernel) = boot_image
                .section_mut(SectionKind::Kernel)
                .filter(|k| !k.is_empty())
            {
                Self::patch_kernel(kernel, &kernel_rules, &mut counts, cancel_signal)?;
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.target == SectionKind::Kernel {
                continue;
            }

            stream::check_cancel(cancel_signal)?;

            if let Some(data) = boot_image.section_mut(rule.target) {
                counts[i] = rule.apply_in_place(data)?;
            }
        }

        for (rule, count) in self.rules.iter().zip(counts) {
            if count == 0 && rule.mandatory {
                return Err(Error::MandatoryPatchUnmatched(rule.label.clone()));
            }

            info!("{}: {count} matches", rule.label);
        }

        Ok(())
    }
}

/// Strip verity flags from fstab nodes in the device tree section and in the
/// device tree appended to the kernel.
pub struct DtbVerityPatcher;

impl BootImagePatch for DtbVerityPatcher {
    fn patcher_name(&self) -> &'static str {
        "DtbVerityPatcher"
    }

    fn patch(&self, boot_image: &mut BootImage, _cancel_signal: &AtomicBool) -> Result<()> {
        if let Some(data) = boot_image.section_mut(SectionKind::Dtb) {
            let n = fstab::patch_dtb(data, fstab::VERITY_FLAGS)?;
            debug!("Removed {n} flags from dtb");
        }

        if let Some(kernel) = boot_image.section_mut(SectionKind::Kernel) {
            if let Some(offset) = dtb::find_appended(kernel) {
                let n = fstab::patch_dtb(&mut kernel[offset..], fstab::VERITY_FLAGS)?;
                debug!("Removed {n} flags from kernel_dtb");
            }
        }

        Ok(())
    }
}

/// Everything a run does besides reading the input and writing the output.
pub struct PatchPlan {
    pub config: PatchConfig,
    pub directives: Vec<Directive>,
    pub hex_patches: Vec<HexPatch>,
    pub patchers: Vec<Box<dyn BootImagePatch>>,
}

impl fmt::Debug for PatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchPlan")
            .field("config", &self.config)
            .field("directives", &self.directives.len())
            .field("hex_patches", &self.hex_patches)
            .field(
                "patchers",
                &self
                    .patchers
                    .iter()
                    .map(|p| p.patcher_name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PatchPlan {
    pub fn builder() -> PatchPlanBuilder {
        PatchPlanBuilder::default()
    }
}

#[derive(Default)]
pub struct PatchPlanBuilder {
    config: PatchConfig,
    directives: Vec<(Directive, bool)>,
    hex_patches: Option<Vec<HexPatch>>,
    patchers: Vec<Box<dyn BootImagePatch>>,
}

impl PatchPlanBuilder {
    pub fn config(mut self, config: PatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace `/init`.
    pub fn init(self, data: Vec<u8>) -> Self {
        self.file("init", 0o750, data)
    }

    /// Add the directory layout and xz-compressed binaries used by Magisk.
    pub fn magisk(self, magisk32: Option<Vec<u8>>, magisk64: Option<Vec<u8>>) -> Self {
        let mut builder = self
            .dir("overlay.d", 0o750)
            .dir("overlay.d/sbin", 0o750);

        if let Some(data) = magisk32 {
            builder = builder.xz_file("overlay.d/sbin/magisk32.xz", 0o644, data);
        }
        if let Some(data) = magisk64 {
            builder = builder.xz_file("overlay.d/sbin/magisk64.xz", 0o644, data);
        }

        builder
    }

    pub fn file(mut self, path: impl Into<BString>, mode: u16, data: Vec<u8>) -> Self {
        self.directives
            .push((Directive::add_file(path, mode, data), false));
        self
    }

    /// Like [`Self::file`], but the data is stored xz-compressed.
    pub fn xz_file(mut self, path: impl Into<BString>, mode: u16, data: Vec<u8>) -> Self {
        self.directives
            .push((Directive::add_file(path, mode, data), true));
        self
    }

    pub fn dir(mut self, path: impl Into<BString>, mode: u16) -> Self {
        self.directives.push((Directive::make_dir(path, mode), false));
        self
    }

    pub fn symlink(mut self, path: impl Into<BString>, target: impl Into<BString>) -> Self {
        self.directives.push((Directive::symlink(path, target), false));
        self
    }

    pub fn remove(mut self, path: impl Into<BString>, recursive: bool) -> Self {
        self.directives.push((Directive::remove(path, recursive), false));
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push((directive, false));
        self
    }

    /// Use these rules instead of [`hexpatch::builtin_rules`].
    pub fn hex_patches(mut self, rules: Vec<HexPatch>) -> Self {
        self.hex_patches = Some(rules);
        self
    }

    pub fn patcher(mut self, patcher: Box<dyn BootImagePatch>) -> Self {
        self.patchers.push(patcher);
        self
    }

    /// Validate everything and compress the files that need it.
    pub fn build(self) -> Result<PatchPlan> {
        let hex_patches = self.hex_patches.unwrap_or_else(hexpatch::builtin_rules);
        for rule in &hex_patches {
            rule.validate()
                .map_err(|e| Error::InvalidHexPatch(rule.label.clone(), e))?;
        }

        let mut directives = Vec::with_capacity(self.directives.len());

        for (directive, xz) in self.directives {
            directive.validate()?;

            let directive = match directive {
                Directive::AddFile { path, mode, data } if xz => Directive::AddFile {
                    path,
                    mode,
                    data: compression::xz_compress(&data)?,
                },
                d => d,
            };

            directives.push(directive);
        }

        Ok(PatchPlan {
            config: self.config,
            directives,
            hex_patches,
            patchers: self.patchers,
        })
    }
}

/// Recreate the work directory and return its path.
fn prepare_work_dir(path: &Path) -> Result<PathBuf> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::File(path.to_owned(), e)),
    }

    fs::create_dir_all(path).map_err(|e| Error::File(path.to_owned(), e))?;

    Ok(path.to_owned())
}

fn write_work_file(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, data).map_err(|e| Error::File(path, e))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// State shared by every stage.
struct Run<'a> {
    input: PathBuf,
    input_sha1: String,
    image: BootImage,
    trailer: Trailer,
    work_dir: Option<PathBuf>,
    cancel_signal: &'a AtomicBool,
}

pub struct Unpacked<'a> {
    run: Run<'a>,
}

impl<'a> Unpacked<'a> {
    /// Parse the input file. If `work_dir` is specified, it is recreated and
    /// the unpacked header and sections are written to it.
    pub fn load(
        input: &Path,
        work_dir: Option<&Path>,
        cancel_signal: &'a AtomicBool,
    ) -> std::result::Result<Self, StageError> {
        let _span = debug_span!("unpack").entered();

        Self::load_inner(input, work_dir, cancel_signal).stage(Stage::Unpack)
    }

    fn load_inner(
        input: &Path,
        work_dir: Option<&Path>,
        cancel_signal: &'a AtomicBool,
    ) -> Result<Self> {
        let data = fs::read(input).map_err(|e| Error::File(input.to_owned(), e))?;
        let input_sha1 = util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &data);

        let (image, trailer) = footer::load_image(&data)?;

        info!(
            "Loaded boot image v{} ({} byte header) from {input:?}",
            image.header_version(),
            image.header_size(),
        );

        let work_dir = work_dir.map(prepare_work_dir).transpose()?;

        if let Some(dir) = &work_dir {
            let header = toml_edit::ser::to_string_pretty(&image)?;
            write_work_file(dir, "header.toml", header.as_bytes())?;

            for (name, data) in image.sections() {
                if !data.is_empty() {
                    write_work_file(dir, &name, data)?;
                }
            }
        }

        Ok(Self {
            run: Run {
                input: input.to_owned(),
                input_sha1,
                image,
                trailer,
                work_dir,
                cancel_signal,
            },
        })
    }

    pub fn boot_image(&self) -> &BootImage {
        &self.run.image
    }

    pub fn trailer(&self) -> &Trailer {
        &self.run.trailer
    }

    /// Apply the plan's directives to the first ramdisk, followed by fstab
    /// patching and the backup entries.
    pub fn patch_ramdisk(
        self,
        plan: &PatchPlan,
    ) -> std::result::Result<RamdiskPatched<'a>, StageError> {
        let _span = debug_span!("ramdisk").entered();

        let mut run = self.run;
        Self::patch_ramdisk_inner(&mut run, plan).stage(Stage::Ramdisk)?;

        Ok(RamdiskPatched {
            run,
            config: plan.config,
        })
    }

    fn patch_ramdisk_inner(run: &mut Run<'a>, plan: &PatchPlan) -> Result<()> {
        stream::check_cancel(run.cancel_signal)?;

        let section = run
            .image
            .section(SectionKind::Ramdisk)
            .ok_or(Error::NoRamdiskSlot)?;

        let (mut archive, format) = ramdisk::unpack(section, run.cancel_signal)?;
        let mut entries = ramdisk::decode(&archive, run.cancel_signal)?;

        // Re-patching keeps the digest of the stock image, not the patched one.
        let mut stock_sha1 = Some(run.input_sha1.clone());

        if ramdisk::is_patched(&entries) {
            warn!("Ramdisk is already patched; restoring original first");
            if let Some(sha1) = ramdisk::read_record(&entries)?.and_then(|r| r.sha1) {
                stock_sha1 = Some(sha1);
            }
            archive = ramdisk::restore(&entries)?;
            entries = ramdisk::decode(&archive, run.cancel_signal)?;
        }

        if let Some(dir) = &run.work_dir {
            write_work_file(dir, "ramdisk.cpio", &archive)?;
        }

        let record = BackupRecord {
            config: plan.config,
            sha1: stock_sha1,
            ramdisk_sha1: Some(util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &archive)),
        };

        let trailing = [
            Directive::PatchFstab {
                keep_verity: plan.config.keep_verity,
                keep_force_encrypt: plan.config.keep_force_encrypt,
            },
            Directive::Backup { original: archive },
            Directive::make_dir(ramdisk::BACKUP_DIR, 0),
            Directive::add_file(ramdisk::BACKUP_RECORD, 0, record.to_text().into_bytes()),
        ];

        let mut mutator = RamdiskMutator::new(entries);
        mutator.apply_all(plan.directives.iter().chain(&trailing))?;
        let entries = mutator.commit()?;

        let new_ramdisk = ramdisk::pack(&entries, format, run.cancel_signal)?;
        info!(
            "Patched {format} ramdisk: {} entries, {} bytes",
            entries.len(),
            new_ramdisk.len(),
        );

        let slot = run
            .image
            .section_mut(SectionKind::Ramdisk)
            .ok_or(Error::NoRamdiskSlot)?;
        *slot = new_ramdisk;

        Ok(())
    }
}

pub struct RamdiskPatched<'a> {
    run: Run<'a>,
    config: PatchConfig,
}

impl<'a> RamdiskPatched<'a> {
    pub fn boot_image(&self) -> &BootImage {
        &self.run.image
    }

    /// Apply hex patch rules, strip device tree verity flags unless
    /// `keep_verity` is set, and run the plan's custom patchers.
    pub fn patch_kernel(
        self,
        plan: &PatchPlan,
    ) -> std::result::Result<KernelPatched<'a>, StageError> {
        let _span = debug_span!("kernel").entered();

        let mut run = self.run;
        Self::patch_kernel_inner(&mut run, plan).stage(Stage::Kernel)?;

        Ok(KernelPatched {
            run,
            config: self.config,
        })
    }

    fn patch_kernel_inner(run: &mut Run<'a>, plan: &PatchPlan) -> Result<()> {
        stream::check_cancel(run.cancel_signal)?;

        let hex_patcher = HexPatcher::new(plan.hex_patches.clone());
        let mut patchers: Vec<&dyn BootImagePatch> = vec![&hex_patcher];
        if !plan.config.keep_verity {
            patchers.push(&DtbVerityPatcher);
        }
        patchers.extend(plan.patchers.iter().map(|p| &**p));

        for patcher in patchers {
            let _span = debug_span!("patcher", name = patcher.patcher_name()).entered();

            stream::check_cancel(run.cancel_signal)?;
            patcher.patch(&mut run.image, run.cancel_signal)?;
        }

        Ok(())
    }
}

pub struct KernelPatched<'a> {
    run: Run<'a>,
    config: PatchConfig,
}

impl KernelPatched<'_> {
    pub fn boot_image(&self) -> &BootImage {
        &self.run.image
    }

    /// Serialize the image, verify it by parsing it again, reattach the
    /// trailer, and atomically write it to `output`.
    pub fn repack(self, output: &Path) -> std::result::Result<Repacked, StageError> {
        let _span = debug_span!("repack").entered();

        self.repack_inner(output).stage(Stage::Repack)
    }

    fn repack_inner(self, output: &Path) -> Result<Repacked> {
        let run = self.run;

        stream::check_cancel(run.cancel_signal)?;

        if same_file(&run.input, output) {
            return Err(Error::OutputIsInput(output.to_owned()));
        }

        let data = run.image.to_vec()?;
        verify_sections(&run.image, &data)?;

        let mut trailer = run.trailer;
        if self.config.patch_vbmeta_flag {
            match &mut trailer {
                Trailer::Avb(avb) => avb.disable_verification()?,
                _ => warn!("Image has no AVB footer; not patching vbmeta flags"),
            }
        }

        let data = trailer.apply(data)?;

        stream::check_cancel(run.cancel_signal)?;

        write_atomic(output, &data)?;

        let sha1 = util::hex_digest(&SHA1_FOR_LEGACY_USE_ONLY, &data);
        info!("Wrote {} bytes to {output:?}", data.len());

        Ok(Repacked {
            output: output.to_owned(),
            size: data.len() as u64,
            sha1,
        })
    }
}

/// Parse a freshly serialized image and check that every section survived.
fn verify_sections(image: &BootImage, data: &[u8]) -> Result<()> {
    let (reparsed, _) = BootImage::load(data)?;

    let expected = image.sections();
    let actual = reparsed.sections();

    if expected.len() != actual.len() {
        return Err(Error::SectionCountMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    for ((name, a), (_, b)) in expected.iter().zip(&actual) {
        if util::hex_digest(&SHA256, a) != util::hex_digest(&SHA256, b) {
            return Err(Error::SectionMismatch(name.clone()));
        }
    }

    Ok(())
}

/// Write to a temporary file in the destination directory and move it into
/// place. The temporary file is removed if anything fails.
fn write_atomic(output: &Path, data: &[u8]) -> Result<()> {
    let prefix = output
        .file_name()
        .map(|n| {
            let mut n = n.to_owned();
            n.push(".");
            n
        })
        .unwrap_or_else(|| "bootpatch.".into());

    let mut temp_file = NamedTempFile::with_prefix_in(prefix, util::parent_path(output))
        .map_err(|e| Error::File(output.to_owned(), e))?;

    temp_file
        .write_all(data)
        .and_then(|()| temp_file.as_file().sync_all())
        .map_err(|e| Error::File(temp_file.path().to_owned(), e))?;

    // NamedTempFile always uses 600 permissions.
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::prelude::PermissionsExt};

        use rustix::{fs::Mode, process::umask};

        let mask = umask(Mode::empty());
        umask(mask);

        // Mac uses a 16-bit value.
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(0o666 & !mask.bits());

        temp_file
            .as_file()
            .set_permissions(Permissions::from_mode(mode))
            .map_err(|e| Error::File(temp_file.path().to_owned(), e))?;
    }

    temp_file
        .persist(output)
        .map_err(|e| Error::File(output.to_owned(), e.error))?;

    Ok(())
}

/// The result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Repacked {
    pub output: PathBuf,
    pub size: u64,
    /// Hex-encoded SHA-1 digest of the output file.
    pub sha1: String,
}

/// Run every stage in order.
pub fn run(
    input: &Path,
    output: &Path,
    work_dir: Option<&Path>,
    plan: &PatchPlan,
    cancel_signal: &AtomicBool,
) -> std::result::Result<Repacked, StageError> {
    if same_file(input, output) {
        return Err(StageError {
            stage: Stage::Unpack,
            source: Error::OutputIsInput(output.to_owned()),
        });
    }

    Unpacked::load(input, work_dir, cancel_signal)?
        .patch_ramdisk(plan)?
        .patch_kernel(plan)?
        .repack(output)
}

/// Check whether an image file has already been patched. Returns the backup
/// record if it has.
pub fn patch_status(input: &Path, cancel_signal: &AtomicBool) -> Result<Option<BackupRecord>> {
    let data = fs::read(input).map_err(|e| Error::File(input.to_owned(), e))?;
    let (image, _) = footer::load_image(&data)?;

    let Some(section) = image.section(SectionKind::Ramdisk) else {
        return Ok(None);
    };

    let (archive, _) = ramdisk::unpack(section, cancel_signal)?;
    let entries = ramdisk::decode(&archive, cancel_signal)?;

    Ok(ramdisk::read_record(&entries)?)
}

/// Get the original ramdisk of a patched image, compressed in the same format
/// as the current ramdisk.
pub fn restore_ramdisk(input: &Path, cancel_signal: &AtomicBool) -> Result<Vec<u8>> {
    let data = fs::read(input).map_err(|e| Error::File(input.to_owned(), e))?;
    let (image, _) = footer::load_image(&data)?;
    let section = image
        .section(SectionKind::Ramdisk)
        .ok_or(Error::NoRamdiskSlot)?;

    let (archive, format) = ramdisk::unpack(section, cancel_signal)?;
    let entries = ramdisk::decode(&archive, cancel_signal)?;
    let original = ramdisk::restore(&entries)?;

    Ok(compression::compress(&original, format, cancel_signal)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ErrorKind::Format.exit_code(), 2);
        assert_eq!(ErrorKind::Config.exit_code(), 3);
        assert_eq!(ErrorKind::Io.exit_code(), 4);
        assert_eq!(ErrorKind::Integrity.exit_code(), 5);
        assert_eq!(ErrorKind::Io.to_string(), "IOError");
    }

    #[test]
    fn builder_rejects_bad_paths() {
        let err = PatchPlan::builder()
            .file("../escape", 0o644, vec![])
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn builder_xz_files() {
        let plan = PatchPlan::builder()
            .magisk(Some(b"magisk32".to_vec()), None)
            .build()
            .unwrap();

        assert_eq!(plan.directives.len(), 3);
        let Directive::AddFile { path, mode, data } = &plan.directives[2] else {
            panic!("Unexpected directive: {:?}", plan.directives[2]);
        };
        assert_eq!(path, "overlay.d/sbin/magisk32.xz");
        assert_eq!(*mode, 0o644);
        assert!(data.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]));
    }
}
