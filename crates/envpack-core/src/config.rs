//! Pack configuration and archive format selection.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Default parcel repository root on the target host.
pub const DEFAULT_PARCEL_ROOT: &str = "/opt/cloudera/parcels";

/// The finite set of output containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed POSIX tar.
    Tar,
    /// gzip-compressed tar.
    TarGz,
    /// bzip2-compressed tar.
    TarBz2,
    /// xz-compressed tar.
    TarXz,
    /// zstd-compressed tar.
    TarZst,
    /// Zip container (store or deflate).
    Zip,
    /// SquashFS image produced through `mksquashfs`.
    Squashfs,
    /// Cloudera-style parcel (gz-tar with mandatory metadata entries).
    Parcel,
    /// Plain directory on disk, no container.
    NoArchive,
}

impl ArchiveFormat {
    /// Infer the format from an output path's extension.
    pub fn infer(output: &Path) -> Option<Self> {
        let name = output.file_name()?.to_str()?.to_ascii_lowercase();
        let format = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Self::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar.zst") {
            Self::TarZst
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".squashfs") || name.ends_with(".sqfs") {
            Self::Squashfs
        } else if name.ends_with(".parcel") {
            Self::Parcel
        } else {
            return None;
        };
        Some(format)
    }

    /// Parse a user-supplied format name (the `--format` values).
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tar" => Ok(Self::Tar),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            "tar.bz2" | "tbz2" => Ok(Self::TarBz2),
            "tar.xz" | "txz" => Ok(Self::TarXz),
            "tar.zst" => Ok(Self::TarZst),
            "zip" => Ok(Self::Zip),
            "squashfs" => Ok(Self::Squashfs),
            "parcel" => Ok(Self::Parcel),
            "no-archive" => Ok(Self::NoArchive),
            other => Err(PackError::config(format!("unknown format '{other}'"))),
        }
    }

    /// Whether timestamps and ownership are normalized by default for this
    /// container.
    pub fn reproducible_by_default(self) -> bool {
        matches!(self, Self::Tar | Self::TarGz | Self::TarZst | Self::Parcel)
    }

    /// The longest member path this container can store, when limited.
    ///
    /// Tar is unlimited through pax/GNU extensions; zip names are a 16-bit
    /// length field.
    pub fn arcname_limit(self) -> Option<usize> {
        match self {
            Self::Zip => Some(u16::MAX as usize),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarXz => "tar.xz",
            Self::TarZst => "tar.zst",
            Self::Zip => "zip",
            Self::Squashfs => "squashfs",
            Self::Parcel => "parcel",
            Self::NoArchive => "no-archive",
        };
        f.write_str(name)
    }
}

/// SquashFS compressor choice.
///
/// Exposed explicitly because the historical mapping from a single integer
/// level to a codec has shifted between releases; when unset it is derived
/// once from `compress_level` (0 → none, 1-5 → zstd, 6-9 → xz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashfsCodec {
    /// No compression.
    None,
    /// zstd compression.
    Zstd,
    /// xz compression.
    Xz,
}

impl SquashfsCodec {
    /// Derive a codec from the abstract compression level.
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Self::None,
            1..=5 => Self::Zstd,
            _ => Self::Xz,
        }
    }
}

/// Parcel-specific naming options.
#[derive(Debug, Clone, Default)]
pub struct ParcelOptions {
    /// Parcel name; defaults to the environment directory name.
    pub name: Option<String>,
    /// Parcel version; defaults to `1.0`.
    pub version: Option<String>,
    /// Target distribution tag (e.g. `el7`).
    pub distribution: Option<String>,
    /// Parcel repository root on the target host.
    pub root: Option<String>,
}

/// The configuration record consumed by [`crate::pack`].
///
/// This mirrors the command-line surface one to one; the CLI layer does no
/// interpretation of its own.
#[derive(Debug, Clone)]
pub struct PackConfig {
    /// Environment prefix to pack. Mutually exclusive with `name`.
    pub prefix: Option<PathBuf>,
    /// Named environment, resolved through the oracle. Mutually exclusive
    /// with `prefix`.
    pub name: Option<String>,
    /// Output path; the extension infers the format unless `format` is set.
    pub output: Option<PathBuf>,
    /// Explicit output format.
    pub format: Option<ArchiveFormat>,
    /// Compression level, 0-9; interpretation is per sink.
    pub compress_level: u32,
    /// Worker count: `-1` all cores, `0`/`1` serial.
    pub n_threads: i32,
    /// Directory prefix under which all members are stored in the archive.
    pub arcroot: Option<PathBuf>,
    /// Target on-host prefix written into text rewrites.
    pub dest_prefix: Option<String>,
    /// Drop packages installed in editable mode instead of failing.
    pub ignore_editable_packages: bool,
    /// Demote missing managed files (and missing cache manifests) to
    /// warnings.
    pub ignore_missing_files: bool,
    /// Demote cross-prefix installs to warnings and rewrite from the
    /// manifest's own placeholder.
    pub force_cross_prefix: bool,
    /// Include unmanaged files under the package manager's bookkeeping
    /// directories.
    pub unmanaged: bool,
    /// Drop members whose paths exceed the container's limit instead of
    /// failing.
    pub ignore_long_paths: bool,
    /// Overwrite an existing output and create missing parent directories.
    pub force: bool,
    /// Timestamp/ownership normalization; `None` keeps the per-format
    /// default.
    pub reproducible: Option<bool>,
    /// Extra include globs, applied after the standard exclusion policy.
    pub includes: Vec<String>,
    /// Extra exclude globs, applied after the standard exclusion policy.
    pub excludes: Vec<String>,
    /// SquashFS codec override.
    pub squashfs_codec: Option<SquashfsCodec>,
    /// Parcel naming.
    pub parcel: ParcelOptions,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            name: None,
            output: None,
            format: None,
            compress_level: 4,
            n_threads: -1,
            arcroot: None,
            dest_prefix: None,
            ignore_editable_packages: false,
            ignore_missing_files: false,
            force_cross_prefix: false,
            unmanaged: false,
            ignore_long_paths: false,
            force: false,
            reproducible: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            squashfs_codec: None,
            parcel: ParcelOptions::default(),
        }
    }
}

impl PackConfig {
    /// Resolve the effective archive format from `format`, falling back to
    /// the output extension, falling back to `tar.gz`.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] when an explicit output path carries
    /// an extension no format matches and no explicit format was given.
    pub fn resolve_format(&self) -> Result<ArchiveFormat> {
        if let Some(format) = self.format {
            return Ok(format);
        }
        match &self.output {
            Some(path) => ArchiveFormat::infer(path).ok_or_else(|| {
                PackError::config(format!(
                    "cannot infer format from '{}'; pass --format",
                    path.display()
                ))
            }),
            None => Ok(ArchiveFormat::TarGz),
        }
    }

    /// Resolve the effective worker count.
    pub fn resolve_threads(&self) -> usize {
        match self.n_threads {
            n if n < 0 => num_cpus::get(),
            0 | 1 => 1,
            n => n as usize,
        }
    }

    /// Whether reproducible output applies for `format`.
    pub fn resolve_reproducible(&self, format: ArchiveFormat) -> bool {
        self.reproducible
            .unwrap_or_else(|| format.reproducible_by_default())
    }

    /// Validate everything that can be rejected before any filesystem work.
    ///
    /// # Errors
    ///
    /// [`PackError::Config`] for contradictory settings; this is the check
    /// that rejects `dest_prefix`/`arcroot` overrides for parcels before
    /// the walk begins.
    pub fn validate(&self) -> Result<ArchiveFormat> {
        if self.prefix.is_some() && self.name.is_some() {
            return Err(PackError::config("pass either a prefix or a name, not both"));
        }
        if self.compress_level > 9 {
            return Err(PackError::config(format!(
                "compress level must be 0-9, got {}",
                self.compress_level
            )));
        }
        let format = self.resolve_format()?;
        if format == ArchiveFormat::Parcel {
            if self.dest_prefix.is_some() {
                return Err(PackError::config(
                    "parcels fix their own destination prefix; --dest-prefix is not allowed",
                ));
            }
            if self.arcroot.is_some() {
                return Err(PackError::config(
                    "parcels fix their own archive root; --arcroot is not allowed",
                ));
            }
        }
        Ok(format)
    }
}
