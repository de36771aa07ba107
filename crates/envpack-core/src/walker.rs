//! Environment walker and per-file classifier.
//!
//! Walks the prefix depth-first in lexicographic order (directories before
//! their contents), reconciles every entry with the package inventory, and
//! attaches the policy decisions: include or drop, and whether the file
//! needs a text rewrite or a deferred binary rewrite.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::{ArchiveFormat, PackConfig};
use crate::error::{PackError, Result};
use crate::inventory::{Inventory, PrefixMode};
use crate::prefix::{self, PREFIX_SCAN_LEN};
use crate::reporter::Reporter;

/// Who accounts for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Claimed by a package manifest.
    Managed,
    /// On disk but owned by no package.
    Unmanaged,
}

/// Filesystem kind of an archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Symbolic link.
    Symlink,
    /// Directory.
    Directory,
}

/// The rewrite decision for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixAction {
    /// No embedded prefix; ship verbatim.
    None,
    /// Rewrite in-stream while archiving.
    Text {
        /// The bytes to search for (normally the source prefix).
        placeholder: String,
        /// The build-time placeholder from the manifest, tried when the
        /// primary placeholder is absent under `force_cross_prefix`.
        fallback: Option<String>,
    },
    /// Ship verbatim and record for the unpack runner.
    Binary {
        /// The embedded NUL-terminated prefix string.
        placeholder: String,
    },
}

/// One classified entry, produced by the walker and consumed exactly once
/// by the pipeline.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Path relative to the prefix, which is also the member path below
    /// the archive root.
    pub relative_path: PathBuf,
    /// Absolute path on disk; `None` for synthetic entries whose content
    /// is generated by the driver.
    pub disk_path: Option<PathBuf>,
    /// Generated content for synthetic entries.
    pub content: Option<Vec<u8>>,
    /// Who accounts for this file.
    pub source_kind: SourceKind,
    /// Filesystem kind.
    pub file_kind: FileKind,
    /// Unix permission bits.
    pub mode: u32,
    /// Modification time, seconds since the epoch (zeroed later by the
    /// reproducibility policy).
    pub mtime: u64,
    /// Size in bytes (0 for directories and symlinks).
    pub size: u64,
    /// Rewrite decision.
    pub prefix_action: PrefixAction,
    /// Symlink target, already retargeted when it pointed inside the
    /// prefix.
    pub link_target: Option<PathBuf>,
}

impl FileRecord {
    /// Synthetic regular-file record with generated content.
    pub fn synthetic(relative_path: PathBuf, mode: u32, content: Vec<u8>) -> Self {
        Self {
            relative_path,
            disk_path: None,
            size: content.len() as u64,
            content: Some(content),
            source_kind: SourceKind::Unmanaged,
            file_kind: FileKind::Regular,
            mode,
            mtime: 0,
            prefix_action: PrefixAction::None,
            link_target: None,
        }
    }
}

/// Marker suffixes of editable-install link records.
const EDITABLE_MARKERS: [&str; 2] = [".egg-link", ".pth"];

/// File names dropped unconditionally: regenerable caches, installer
/// droppings, and the package manager's own history.
fn is_always_excluded(rel: &Path) -> bool {
    let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.ends_with(".pyc") || name.ends_with(".pyo") || name.ends_with('~') {
        return true;
    }
    if name == ".DS_Store" || name == ".nonadmin" || name.ends_with(".conda_trash") {
        return true;
    }
    rel == Path::new("conda-meta/history")
}

/// Whether `rel` names an editable-install link record
/// (`pip install -e` leaves `*.egg-link` or `__editable__*.pth` under
/// `site-packages`).
fn editable_marker(rel: &Path) -> Option<String> {
    if !rel.components().any(|c| c.as_os_str() == "site-packages") {
        return None;
    }
    let name = rel.file_name()?.to_str()?;
    let is_marker = name.ends_with(EDITABLE_MARKERS[0])
        || (name.starts_with("__editable__") && name.ends_with(EDITABLE_MARKERS[1]));
    if !is_marker {
        return None;
    }
    let stem = name
        .trim_start_matches("__editable__")
        .trim_end_matches(".egg-link")
        .trim_end_matches(".pth");
    Some(stem.trim_matches('.').to_string())
}

/// Compiled include/exclude globs.
struct GlobFilter {
    includes: Vec<glob::Pattern>,
    excludes: Vec<glob::Pattern>,
}

impl GlobFilter {
    fn new(config: &PackConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p)
                        .map_err(|e| PackError::config(format!("bad glob '{p}': {e}")))
                })
                .collect()
        };
        Ok(Self {
            includes: compile(&config.includes)?,
            excludes: compile(&config.excludes)?,
        })
    }

    /// Excluded unless an include glob rescues it.
    fn drops(&self, rel: &Path) -> bool {
        if self.includes.iter().any(|p| p.matches_path(rel)) {
            return false;
        }
        self.excludes.iter().any(|p| p.matches_path(rel))
    }
}

/// Scan a file for the source prefix: the head first, then the rest only
/// when the head was inconclusive. Returns `(found, sniffs_as_text)`.
fn scan_for_prefix(path: &Path, needle: &[u8]) -> std::io::Result<(bool, bool)> {
    let mut file = fs::File::open(path)?;
    let mut head = vec![0u8; PREFIX_SCAN_LEN];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let is_text = prefix::looks_like_text(&head);
    if prefix::contains_placeholder(&head, needle) {
        return Ok((true, is_text));
    }
    if filled < PREFIX_SCAN_LEN {
        return Ok((false, is_text));
    }

    // Head was inconclusive; scan the remainder with overlap so a match
    // straddling the head boundary is not lost.
    let overlap = needle.len().saturating_sub(1);
    let mut buf = head[head.len() - overlap.min(head.len())..].to_vec();
    let mut chunk = vec![0u8; PREFIX_SCAN_LEN];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Ok((false, is_text));
        }
        buf.extend_from_slice(&chunk[..n]);
        if prefix::contains_placeholder(&buf, needle) {
            return Ok((true, is_text));
        }
        let keep = buf.len().saturating_sub(overlap);
        buf.drain(..keep);
    }
}

/// Walk `prefix` and produce the classified record stream, in the canonical
/// order the archive will use.
///
/// # Errors
///
/// Fatal classification errors per the policy: [`PackError::MissingManagedFile`]
/// (downgradable), [`PackError::EditablePackages`] (downgradable),
/// [`PackError::PathTooLongForFormat`] (downgradable), plus I/O errors.
pub fn walk_environment(
    prefix: &Path,
    prefix_str: &str,
    inventory: &Inventory,
    config: &PackConfig,
    format: ArchiveFormat,
    reporter: &dyn Reporter,
) -> Result<Vec<FileRecord>> {
    let filter = GlobFilter::new(config)?;
    let needle = prefix_str.as_bytes();
    let arcroot_len = config
        .arcroot
        .as_ref()
        .map_or(0, |r| r.as_os_str().len() + 1);

    let mut records = Vec::new();
    let mut seen = BTreeSet::new();
    let mut editables = Vec::new();

    let walk = walkdir::WalkDir::new(prefix)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut iter = walk.into_iter();
    while let Some(entry) = iter.next() {
        let entry = entry.map_err(|e| {
            PackError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("walk error")
            }))
        })?;
        let Ok(rel) = entry.path().strip_prefix(prefix).map(Path::to_path_buf) else {
            continue;
        };

        // Prune regenerable bytecode caches wholesale.
        if entry.file_type().is_dir()
            && rel.file_name().is_some_and(|n| n == "__pycache__")
        {
            iter.skip_current_dir();
            continue;
        }
        if is_always_excluded(&rel) {
            continue;
        }

        let meta = inventory.get(&rel);
        let source_kind = if meta.is_some() {
            SourceKind::Managed
        } else {
            SourceKind::Unmanaged
        };

        // Bookkeeping directories carry unmanaged droppings (lockfiles,
        // caches) that only make sense on the source machine.
        if source_kind == SourceKind::Unmanaged
            && !config.unmanaged
            && rel.starts_with("conda-meta")
        {
            continue;
        }
        if filter.drops(&rel) {
            continue;
        }
        if let Some(name) = editable_marker(&rel) {
            editables.push(name);
            continue;
        }

        if let Some(limit) = format.arcname_limit() {
            let len = arcroot_len + rel.as_os_str().len();
            if len > limit {
                if config.ignore_long_paths {
                    reporter.warning(&format!(
                        "dropping '{}': path exceeds the {limit}-byte {format} limit",
                        rel.display()
                    ));
                    continue;
                }
                return Err(PackError::PathTooLongForFormat {
                    path: rel,
                    len,
                    limit,
                    format: format.to_string(),
                });
            }
        }

        seen.insert(rel.clone());

        let stat = entry.metadata().map_err(|e| {
            PackError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("stat error")
            }))
        })?;
        #[cfg(unix)]
        let mode = std::os::unix::fs::MetadataExt::mode(&stat);
        #[cfg(not(unix))]
        let mode = 0o644;
        let mtime = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());

        if entry.file_type().is_dir() {
            records.push(FileRecord {
                relative_path: rel,
                disk_path: Some(entry.path().to_path_buf()),
                content: None,
                source_kind,
                file_kind: FileKind::Directory,
                mode,
                mtime,
                size: 0,
                prefix_action: PrefixAction::None,
                link_target: None,
            });
            continue;
        }

        if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            let retargeted = prefix::retarget_symlink(prefix, &rel, &target);
            records.push(FileRecord {
                relative_path: rel,
                disk_path: Some(entry.path().to_path_buf()),
                content: None,
                source_kind,
                file_kind: FileKind::Symlink,
                mode,
                mtime,
                size: 0,
                prefix_action: PrefixAction::None,
                link_target: Some(retargeted.unwrap_or(target)),
            });
            continue;
        }

        let prefix_action = match meta {
            Some(meta) => match meta.file_mode {
                Some(PrefixMode::Text) if meta.prefix_placeholder.is_some() => {
                    PrefixAction::Text {
                        placeholder: prefix_str.to_string(),
                        fallback: meta.prefix_placeholder.clone(),
                    }
                }
                Some(PrefixMode::Binary) if meta.prefix_placeholder.is_some() => {
                    PrefixAction::Binary {
                        placeholder: prefix_str.to_string(),
                    }
                }
                _ => PrefixAction::None,
            },
            None => {
                // Unmanaged files carry no manifest; sniff for the prefix.
                let (found, is_text) = scan_for_prefix(entry.path(), needle)?;
                if !found {
                    PrefixAction::None
                } else if is_text {
                    PrefixAction::Text {
                        placeholder: prefix_str.to_string(),
                        fallback: None,
                    }
                } else {
                    PrefixAction::Binary {
                        placeholder: prefix_str.to_string(),
                    }
                }
            }
        };

        records.push(FileRecord {
            relative_path: rel,
            disk_path: Some(entry.path().to_path_buf()),
            content: None,
            source_kind,
            file_kind: FileKind::Regular,
            mode,
            mtime,
            size: stat.len(),
            prefix_action,
            link_target: None,
        });
    }

    if !editables.is_empty() {
        editables.sort();
        editables.dedup();
        if config.ignore_editable_packages {
            reporter.warning(&format!(
                "dropping editable packages: {}",
                editables.join(", ")
            ));
        } else {
            return Err(PackError::EditablePackages { names: editables });
        }
    }

    // Manifest entries never observed on disk are missing managed files.
    for (path, meta) in inventory.iter() {
        if seen.contains(path)
            || is_always_excluded(path)
            || filter.drops(path)
            || editable_marker(path).is_some()
        {
            continue;
        }
        if config.ignore_missing_files {
            reporter.warning(&format!(
                "'{}' ({}) is missing from the environment",
                path.display(),
                meta.owner
            ));
        } else {
            return Err(PackError::MissingManagedFile {
                path: path.clone(),
                package: meta.owner.to_string(),
            });
        }
    }

    tracing::debug!(records = records.len(), "environment walked");
    Ok(records)
}
