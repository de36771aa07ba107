//! Top-level pack orchestration.
//!
//! Validation, inventory, walk, policy checks, synthetic entries, and the
//! streaming pipeline, in that order. Everything that can fail by
//! configuration fails before any output path is touched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use crate::config::{ArchiveFormat, DEFAULT_PARCEL_ROOT, PackConfig};
use crate::error::{PackError, Result};
use crate::inventory::{Inventory, PackageOracle, PrefixMode};
use crate::pipeline::{StreamContext, stream_records};
use crate::prefix::{default_dest_prefix, normalize_prefix};
use crate::reporter::Reporter;
use crate::sink::{ParcelMeta, SinkOptions};
use crate::unpack::{MANIFEST_ARCNAME, RUNNER_ARCNAME, RUNNER_SCRIPT, UnpackEntry, UnpackManifest};
use crate::walker::{FileKind, FileRecord, PrefixAction, SourceKind, walk_environment};

/// Result of a successful pack.
#[derive(Debug, Clone)]
pub struct PackOutcome {
    /// The finalized output path.
    pub output: PathBuf,
    /// Archive members written, directories included.
    pub members: usize,
    /// Uncompressed content bytes streamed.
    pub bytes: u64,
    /// Installed packages covered.
    pub packages: usize,
}

/// Pack the environment described by `config` into a relocatable archive.
///
/// `cancel` is polled between items; setting it aborts the run, removes
/// the partial output, and returns [`PackError::Cancelled`].
///
/// # Errors
///
/// Every fatal condition of the error taxonomy; see [`PackError`].
pub fn pack(
    config: &PackConfig,
    oracle: &dyn PackageOracle,
    reporter: &dyn Reporter,
    cancel: &AtomicBool,
) -> Result<PackOutcome> {
    let started = Instant::now();
    let format = config.validate()?;

    // Identify the environment.
    let prefix = match (&config.prefix, &config.name) {
        (Some(prefix), None) => prefix.clone(),
        (None, Some(name)) => oracle
            .resolve_name(name)
            .ok_or_else(|| PackError::config(format!("no environment named '{name}'")))?,
        (None, None) | (Some(_), Some(_)) => {
            // validate() already rejected prefix+name; this arm also covers
            // the empty case with the actionable message.
            return Err(PackError::config("an environment prefix or name is required"));
        }
    };
    let prefix = normalize_prefix(&prefix)?;
    if !prefix.is_dir() {
        return Err(PackError::config(format!(
            "'{}' is not a directory",
            prefix.display()
        )));
    }
    let prefix_str = prefix
        .to_str()
        .ok_or_else(|| PackError::config("prefix is not valid UTF-8"))?
        .to_string();
    let env_name = prefix
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("environment")
        .to_string();

    reporter.section("Analyzing environment");
    let inventory = Inventory::load(&prefix, oracle, config.ignore_missing_files)?;
    tracing::info!(
        prefix = %prefix.display(),
        packages = inventory.packages().len(),
        %format,
        "packing environment"
    );

    // Parcel identity drives naming, arcroot, and the destination prefix.
    let parcel_meta = (format == ArchiveFormat::Parcel).then(|| ParcelMeta {
        name: config.parcel.name.clone().unwrap_or_else(|| env_name.clone()),
        version: config
            .parcel
            .version
            .clone()
            .unwrap_or_else(|| "1.0".to_string()),
        distribution: config
            .parcel
            .distribution
            .clone()
            .unwrap_or_else(|| "el7".to_string()),
        root: config
            .parcel
            .root
            .clone()
            .unwrap_or_else(|| DEFAULT_PARCEL_ROOT.to_string()),
        packages: inventory
            .packages()
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect(),
    });

    let output = resolve_output(config, format, &env_name, parcel_meta.as_ref());
    prepare_output_path(&output, format, config.force)?;

    let arcroot = match &parcel_meta {
        Some(meta) => Some(PathBuf::from(meta.arcroot())),
        None => config.arcroot.clone(),
    };
    let (dest_prefix, dest_explicit) = match (&parcel_meta, &config.dest_prefix) {
        (Some(meta), _) => (meta.dest_prefix(), true),
        (None, Some(dest)) => (dest.clone(), true),
        (None, None) => (default_dest_prefix(), false),
    };

    let mut records = walk_environment(&prefix, &prefix_str, &inventory, config, format, reporter)?;

    // Length policy: an explicitly requested destination must fit into
    // every binary placeholder, checked before any output exists.
    if dest_explicit {
        for record in &records {
            if let PrefixAction::Binary { placeholder } = &record.prefix_action {
                if dest_prefix.len() > placeholder.len() {
                    return Err(PackError::DestinationPrefixTooLong {
                        dest_len: dest_prefix.len(),
                        placeholder_len: placeholder.len(),
                        path: record.relative_path.clone(),
                    });
                }
            }
        }
    }

    // The deferred-rewrite manifest and its runner ride along as ordinary
    // members so they obey the canonical ordering like everything else.
    let manifest = build_manifest(&records, &prefix_str, &dest_prefix, config.force_cross_prefix);
    insert_synthetic(&mut records, synthetic_dir("bin"));
    insert_synthetic(&mut records, synthetic_dir("conda-meta"));
    insert_synthetic(
        &mut records,
        FileRecord::synthetic(
            PathBuf::from(RUNNER_ARCNAME),
            0o755,
            RUNNER_SCRIPT.as_bytes().to_vec(),
        ),
    );
    insert_synthetic(
        &mut records,
        FileRecord::synthetic(PathBuf::from(MANIFEST_ARCNAME), 0o644, manifest.to_json()?),
    );

    let options = SinkOptions {
        compress_level: config.compress_level,
        reproducible: config.resolve_reproducible(format),
        squashfs_codec: config.squashfs_codec,
        parcel: parcel_meta,
    };
    let mut sink = crate::sink::open(&output, format, &options)?;
    if let Some(root) = &arcroot {
        sink.add_directory(root, 0o755, 0)?;
    }

    reporter.section("Packing");
    let ctx = StreamContext {
        dest_prefix,
        force_cross_prefix: config.force_cross_prefix,
        reproducible: options.reproducible,
        arcroot,
        workers: config.resolve_threads(),
        cancel,
        reporter,
    };
    let stats = stream_records(records, sink, &ctx)?;

    let elapsed = started.elapsed().as_secs_f64();
    reporter.summary(stats.members, stats.bytes, elapsed);
    Ok(PackOutcome {
        output,
        members: stats.members,
        bytes: stats.bytes,
        packages: inventory.packages().len(),
    })
}

/// Pick the output path: explicit, or derived from the environment name.
fn resolve_output(
    config: &PackConfig,
    format: ArchiveFormat,
    env_name: &str,
    parcel: Option<&ParcelMeta>,
) -> PathBuf {
    if let Some(output) = &config.output {
        return output.clone();
    }
    match (format, parcel) {
        (_, Some(meta)) => PathBuf::from(meta.file_name()),
        (ArchiveFormat::NoArchive, None) => PathBuf::from(env_name),
        (format, None) => PathBuf::from(format!("{env_name}.{format}")),
    }
}

/// Enforce the overwrite policy and, under `force`, create missing parent
/// directories and clear a stale directory output.
fn prepare_output_path(output: &Path, format: ArchiveFormat, force: bool) -> Result<()> {
    let exists = output.symlink_metadata().is_ok();
    if exists && !force {
        return Err(PackError::OutputExists {
            path: output.to_path_buf(),
        });
    }
    if force {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        // File outputs are replaced atomically by the final rename; a
        // directory output has to be cleared up front.
        if exists && format == ArchiveFormat::NoArchive {
            if output.is_dir() {
                fs::remove_dir_all(output)?;
            } else {
                fs::remove_file(output)?;
            }
        }
    }
    Ok(())
}

/// Collect the deferred rewrites: every binary-prefix file, plus text files
/// whose pack-time rewrite was skipped because `force_cross_prefix` made
/// their placeholder ambiguous.
fn build_manifest(
    records: &[FileRecord],
    prefix_str: &str,
    dest_prefix: &str,
    force_cross_prefix: bool,
) -> UnpackManifest {
    let mut files = Vec::new();
    for record in records {
        match &record.prefix_action {
            PrefixAction::Binary { .. } => files.push(UnpackEntry {
                path: record.relative_path.to_string_lossy().into_owned(),
                mode: PrefixMode::Binary,
            }),
            PrefixAction::Text { fallback: Some(_), .. } if force_cross_prefix => {
                files.push(UnpackEntry {
                    path: record.relative_path.to_string_lossy().into_owned(),
                    mode: PrefixMode::Text,
                });
            }
            _ => {}
        }
    }
    UnpackManifest {
        prefix_placeholder: prefix_str.to_string(),
        destination_prefix: dest_prefix.to_string(),
        files,
    }
}

fn synthetic_dir(rel: &str) -> FileRecord {
    FileRecord {
        relative_path: PathBuf::from(rel),
        disk_path: None,
        content: None,
        source_kind: SourceKind::Unmanaged,
        file_kind: FileKind::Directory,
        mode: 0o755,
        mtime: 0,
        size: 0,
        prefix_action: PrefixAction::None,
        link_target: None,
    }
}

/// Insert a synthetic record at its canonical position. An existing member
/// with the same path is replaced (the shipped runner and manifest always
/// win over stray files of the same name).
fn insert_synthetic(records: &mut Vec<FileRecord>, record: FileRecord) {
    match records.binary_search_by(|r| r.relative_path.cmp(&record.relative_path)) {
        Ok(pos) => {
            if record.file_kind == FileKind::Directory {
                // The directory already exists; keep the walked entry.
                return;
            }
            records[pos] = record;
        }
        Err(pos) => records.insert(pos, record),
    }
}
