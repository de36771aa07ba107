//! Package inventory: who owns which file.
//!
//! The package manager is an opaque oracle that lists the installed packages
//! of an environment. Each package carries a manifest (a prefix record kept
//! under `conda-meta/`, falling back to `info/paths.json` in the package
//! cache) describing every member file plus its prefix-rewrite metadata.
//! The inventory folds all manifests into a single `relative path → owner`
//! map; overlapping claims are a hard error.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{PackError, Result};

/// How an embedded prefix reference must be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixMode {
    /// Plain substring replacement, done while streaming into the archive.
    Text,
    /// Length-preserving C-string patch, deferred to the unpack runner.
    Binary,
}

/// Filesystem kind of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    /// A regular file hard-linked from the package cache.
    Hardlink,
    /// A symbolic link.
    Softlink,
    /// A directory entry.
    Directory,
}

/// One file of a package manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsEntry {
    /// Path relative to the environment prefix.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,
    /// Filesystem kind, when the manifest records one.
    #[serde(default)]
    pub path_type: Option<PathType>,
    /// Content digest recorded at install time.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Size recorded at install time.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
    /// Rewrite mode, present only for files that embed a prefix.
    #[serde(default)]
    pub file_mode: Option<PrefixMode>,
    /// The build-time placeholder the package manager substituted at
    /// install time.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,
}

/// The `paths_data` block of a prefix record (also the shape of a cached
/// `info/paths.json`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsData {
    /// Schema version; 1 is the only one in the wild.
    #[serde(default)]
    pub paths_version: u64,
    /// Member files.
    #[serde(default)]
    pub paths: Vec<PathsEntry>,
}

/// A package manager prefix record (`conda-meta/<name>-<version>-<build>.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct PrefixRecord {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Build string.
    #[serde(default)]
    pub build: String,
    /// Flat member list (older records carry only this).
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Rich per-file metadata.
    #[serde(default)]
    pub paths_data: Option<PathsData>,
    /// Where the extracted package lives in the package cache.
    #[serde(default)]
    pub extracted_package_dir: Option<PathBuf>,
}

/// Package identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    /// Name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Build string.
    pub build: String,
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.build.is_empty() {
            write!(f, "{}-{}", self.name, self.version)
        } else {
            write!(f, "{}-{}-{}", self.name, self.version, self.build)
        }
    }
}

/// Per-file metadata attached by the inventory.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// The owning package.
    pub owner: Arc<PackageId>,
    /// Filesystem kind from the manifest, if recorded.
    pub path_type: Option<PathType>,
    /// Install-time content digest.
    pub sha256: Option<String>,
    /// Install-time size.
    pub size: Option<u64>,
    /// Rewrite mode for files that embed a prefix.
    pub file_mode: Option<PrefixMode>,
    /// Build-time placeholder for files that embed a prefix.
    pub prefix_placeholder: Option<String>,
}

/// The package manager, reduced to the one question we ask it.
///
/// Production code uses [`CondaMetaOracle`]; tests inject fixed package
/// lists without touching a real environment.
pub trait PackageOracle {
    /// List the installed packages of `prefix`, manifests included.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment's package metadata cannot be
    /// enumerated at all.
    fn list_packages(&self, prefix: &Path) -> Result<Vec<PrefixRecord>>;

    /// Resolve an environment name to its prefix, when the oracle knows a
    /// registry of named environments.
    fn resolve_name(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Oracle backed by the `conda-meta/` directory inside the prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct CondaMetaOracle;

impl PackageOracle for CondaMetaOracle {
    fn list_packages(&self, prefix: &Path) -> Result<Vec<PrefixRecord>> {
        let meta_dir = prefix.join("conda-meta");
        if !meta_dir.is_dir() {
            return Err(PackError::config(format!(
                "'{}' is not a managed environment (no conda-meta directory)",
                prefix.display()
            )));
        }
        let mut records = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(&meta_dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        for path in entries {
            let content = fs::read_to_string(&path)?;
            let record: PrefixRecord = serde_json::from_str(&content)?;
            records.push(record);
        }
        Ok(records)
    }

    fn resolve_name(&self, name: &str) -> Option<PathBuf> {
        // ~/.conda/environments.txt lists one absolute prefix per line.
        let home = std::env::var_os("HOME")?;
        let registry = Path::new(&home).join(".conda/environments.txt");
        let content = fs::read_to_string(registry).ok()?;
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .find(|p| p.file_name().is_some_and(|n| n == name))
    }
}

/// The folded ownership map for one environment.
#[derive(Debug, Default)]
pub struct Inventory {
    files: BTreeMap<PathBuf, FileMeta>,
    packages: Vec<Arc<PackageId>>,
}

impl Inventory {
    /// Load the inventory for `prefix` from `oracle`.
    ///
    /// When a package's rich manifest is absent from both the prefix record
    /// and the package cache, the load fails with
    /// [`PackError::MissingPackageCache`] — unless `ignore_missing_cache`
    /// is set, in which case the package's files are left out of the
    /// inventory entirely and the walker will pick them up as unmanaged.
    ///
    /// # Errors
    ///
    /// [`PackError::ConflictingOwnership`] when two packages claim the same
    /// path; [`PackError::MissingPackageCache`] as described above; plus
    /// I/O and parse errors from the oracle.
    pub fn load(
        prefix: &Path,
        oracle: &dyn PackageOracle,
        ignore_missing_cache: bool,
    ) -> Result<Self> {
        let records = oracle.list_packages(prefix)?;
        let mut inv = Self::default();

        for record in records {
            let id = Arc::new(PackageId {
                name: record.name.clone(),
                version: record.version.clone(),
                build: record.build.clone(),
            });

            let paths = match Self::manifest_paths(&record) {
                Some(paths) => paths,
                None if ignore_missing_cache => {
                    tracing::warn!(package = %id, "manifest missing from package cache; files demoted to unmanaged");
                    inv.packages.push(id);
                    continue;
                }
                None => {
                    return Err(PackError::MissingPackageCache {
                        package: id.to_string(),
                    });
                }
            };

            for entry in paths {
                let meta = FileMeta {
                    owner: Arc::clone(&id),
                    path_type: entry.path_type,
                    sha256: entry.sha256.clone(),
                    size: entry.size_in_bytes,
                    file_mode: entry.file_mode,
                    prefix_placeholder: entry.prefix_placeholder.clone(),
                };
                if let Some(previous) = inv.files.insert(entry.relative_path.clone(), meta) {
                    return Err(PackError::ConflictingOwnership {
                        path: entry.relative_path.clone(),
                        first: previous.owner.to_string(),
                        second: id.to_string(),
                    });
                }
            }
            inv.packages.push(id);
        }

        tracing::debug!(
            packages = inv.packages.len(),
            files = inv.files.len(),
            "inventory loaded"
        );
        Ok(inv)
    }

    /// Resolve a record's member list, preferring the inline `paths_data`
    /// and falling back to the cached `info/paths.json`.
    fn manifest_paths(record: &PrefixRecord) -> Option<Vec<PathsEntry>> {
        if let Some(data) = &record.paths_data {
            if !data.paths.is_empty() {
                return Some(data.paths.clone());
            }
        }
        // Older records: the rich manifest only exists in the package cache.
        let cached = record.extracted_package_dir.as_ref()?.join("info/paths.json");
        let content = fs::read_to_string(cached).ok()?;
        let data: PathsData = serde_json::from_str(&content).ok()?;
        if data.paths.is_empty() && !record.files.is_empty() {
            return None;
        }
        Some(data.paths)
    }

    /// Look up the metadata for a path relative to the prefix.
    pub fn get(&self, relative: &Path) -> Option<&FileMeta> {
        self.files.get(relative)
    }

    /// Iterate all `(path, metadata)` pairs in lexicographic path order.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileMeta)> {
        self.files.iter()
    }

    /// Number of managed files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no package claims any file.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The installed packages, in oracle order.
    pub fn packages(&self) -> &[Arc<PackageId>] {
        &self.packages
    }
}
