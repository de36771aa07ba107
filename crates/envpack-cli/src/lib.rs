//! envpack - pack an installed environment into a relocatable archive.
//!
//! Thin front-end over [`envpack_core`]: argument parsing, a console
//! reporter, and exit-code mapping. All policy lives in the core crate.

pub mod progress;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;

use envpack_core::config::ParcelOptions;
use envpack_core::{ArchiveFormat, CondaMetaOracle, PackConfig, SquashfsCodec};

use crate::progress::ConsoleReporter;

/// Command-line surface. Mirrors the core configuration record one to one.
#[derive(Debug, Parser)]
#[command(name = "envpack")]
#[command(author, version, about = "Pack an installed environment into a relocatable archive")]
pub struct Cli {
    /// Full path to the environment to pack
    #[arg(short, long, value_name = "PATH", conflicts_with = "name")]
    pub prefix: Option<PathBuf>,

    /// Name of a registered environment to pack
    #[arg(short, long, value_name = "NAME")]
    pub name: Option<String>,

    /// Output path; the extension selects the format unless --format is given
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Output format [possible: infer, zip, tar, tar.gz, tar.bz2, tar.xz,
    /// tar.zst, squashfs, parcel, no-archive]
    #[arg(long, default_value = "infer")]
    pub format: String,

    /// Compression level, 0-9; interpretation depends on the format
    #[arg(long, default_value_t = 4, value_name = "LEVEL")]
    pub compress_level: u32,

    /// Worker threads; -1 uses all cores, 0 or 1 runs serially
    #[arg(short = 'j', long, default_value_t = -1, value_name = "N", allow_hyphen_values = true)]
    pub n_threads: i32,

    /// Directory prefix under which all entries are stored in the archive
    #[arg(long, value_name = "PATH")]
    pub arcroot: Option<PathBuf>,

    /// Destination prefix on the target host
    #[arg(short = 'd', long, value_name = "PATH")]
    pub dest_prefix: Option<String>,

    /// Drop packages installed in editable mode instead of failing
    #[arg(long)]
    pub ignore_editable_packages: bool,

    /// Demote missing managed files to warnings
    #[arg(long)]
    pub ignore_missing_files: bool,

    /// Pack even when files record a different install prefix
    #[arg(long)]
    pub force_cross_prefix: bool,

    /// Include unmanaged files under the package manager's bookkeeping
    /// directories
    #[arg(long)]
    pub unmanaged: bool,

    /// Drop files whose paths exceed the archive format's limit
    #[arg(long)]
    pub ignore_long_paths: bool,

    /// Overwrite existing output and create missing parent directories
    #[arg(short, long)]
    pub force: bool,

    /// Force timestamp/ownership normalization on
    #[arg(long, conflicts_with = "no_reproducible")]
    pub reproducible: bool,

    /// Force timestamp/ownership normalization off
    #[arg(long)]
    pub no_reproducible: bool,

    /// Glob of paths to leave out (repeatable)
    #[arg(long = "exclude", value_name = "GLOB")]
    pub excludes: Vec<String>,

    /// Glob of paths to keep even when excluded (repeatable)
    #[arg(long = "include", value_name = "GLOB")]
    pub includes: Vec<String>,

    /// SquashFS codec [possible: none, zstd, xz]; derived from the level
    /// when omitted
    #[arg(long, value_name = "CODEC")]
    pub squashfs_codec: Option<String>,

    /// Parcel name (parcel format only)
    #[arg(long, value_name = "NAME")]
    pub parcel_name: Option<String>,

    /// Parcel version (parcel format only)
    #[arg(long, value_name = "VERSION")]
    pub parcel_version: Option<String>,

    /// Parcel distribution tag, e.g. el7 (parcel format only)
    #[arg(long, value_name = "DISTRO")]
    pub parcel_distribution: Option<String>,

    /// Parcel repository root on the target host (parcel format only)
    #[arg(long, value_name = "PATH")]
    pub parcel_root: Option<String>,

    /// Apply the deferred rewrites to an already-extracted tree and exit
    #[arg(long, value_name = "DIR")]
    pub unpack: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Translate the parsed arguments into the core configuration record.
    ///
    /// # Errors
    ///
    /// Invalid `--format` or `--squashfs-codec` values.
    pub fn into_config(self) -> anyhow::Result<PackConfig> {
        let format = match self.format.as_str() {
            "infer" => None,
            other => Some(ArchiveFormat::parse(other)?),
        };
        let squashfs_codec = match self.squashfs_codec.as_deref() {
            None => None,
            Some("none") => Some(SquashfsCodec::None),
            Some("zstd") => Some(SquashfsCodec::Zstd),
            Some("xz") => Some(SquashfsCodec::Xz),
            Some(other) => anyhow::bail!("unknown squashfs codec '{other}'"),
        };
        let reproducible = match (self.reproducible, self.no_reproducible) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Ok(PackConfig {
            prefix: self.prefix,
            name: self.name,
            output: self.output,
            format,
            compress_level: self.compress_level,
            n_threads: self.n_threads,
            arcroot: self.arcroot,
            dest_prefix: self.dest_prefix,
            ignore_editable_packages: self.ignore_editable_packages,
            ignore_missing_files: self.ignore_missing_files,
            force_cross_prefix: self.force_cross_prefix,
            unmanaged: self.unmanaged,
            ignore_long_paths: self.ignore_long_paths,
            force: self.force,
            reproducible,
            includes: self.includes,
            excludes: self.excludes,
            squashfs_codec,
            parcel: ParcelOptions {
                name: self.parcel_name,
                version: self.parcel_version,
                distribution: self.parcel_distribution,
                root: self.parcel_root,
            },
        })
    }
}

/// Run the CLI to completion.
///
/// # Errors
///
/// Any fatal pack error, with context; the binary maps this to a non-zero
/// exit code.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(root) = cli.unpack.clone() {
        let patched = envpack_core::apply_unpack(&root, None)
            .with_context(|| format!("failed to finish unpacking '{}'", root.display()))?;
        println!("Applied deferred rewrites to {patched} file(s)");
        return Ok(());
    }

    let quiet = cli.quiet;
    let config = cli.into_config()?;
    let reporter = ConsoleReporter::new(quiet);
    let cancel = AtomicBool::new(false);

    let outcome = envpack_core::pack(&config, &CondaMetaOracle, &reporter, &cancel)?;
    if !quiet {
        println!(
            "Packed {} package(s), {} member(s) into '{}'",
            outcome.packages,
            outcome.members,
            outcome.output.display()
        );
    }
    Ok(())
}
