//! Domain-specific errors for packing operations

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, PackError>;

/// Everything that can go fatally wrong while analyzing or packing an
/// environment.
///
/// Several kinds are downgradable to warnings through [`crate::PackConfig`]
/// flags (`ignore_missing_files`, `ignore_long_paths`, `force_cross_prefix`);
/// the call sites that honor those flags route the demoted error through the
/// reporter instead of returning it.
#[derive(Error, Debug)]
pub enum PackError {
    /// The package manager listed a package whose manifest is not present in
    /// the package cache, so file ownership cannot be established.
    #[error(
        "package '{package}' has no manifest in the package cache; \
         re-install it or pass --ignore-missing-files to pack its files as unmanaged"
    )]
    MissingPackageCache {
        /// `name-version-build` of the affected package.
        package: String,
    },

    /// Two package manifests claim the same file.
    #[error("'{}' is claimed by both '{first}' and '{second}'", path.display())]
    ConflictingOwnership {
        /// Path relative to the prefix.
        path: PathBuf,
        /// First claiming package.
        first: String,
        /// Second claiming package.
        second: String,
    },

    /// A manifest lists a file that does not exist on disk.
    #[error(
        "'{}' is owned by '{package}' but missing from the environment \
         (pass --ignore-missing-files to continue)",
        path.display()
    )]
    MissingManagedFile {
        /// Path relative to the prefix.
        path: PathBuf,
        /// Owning package.
        package: String,
    },

    /// The requested destination prefix does not fit inside a binary
    /// placeholder, so a length-preserving rewrite is impossible.
    #[error(
        "destination prefix is {dest_len} bytes but '{}' embeds a \
         {placeholder_len}-byte placeholder; choose a shorter destination",
        path.display()
    )]
    DestinationPrefixTooLong {
        /// Byte length of the destination prefix.
        dest_len: usize,
        /// Byte length of the placeholder in the offending file.
        placeholder_len: usize,
        /// The binary file with the shortest placeholder.
        path: PathBuf,
    },

    /// A manifest records an install prefix different from the environment
    /// prefix being packed.
    #[error(
        "'{}' was installed under '{recorded}' but the environment lives at \
         '{expected}' (pass --force-cross-prefix to pack anyway)",
        path.display()
    )]
    CrossPrefixInstall {
        /// Path relative to the prefix.
        path: PathBuf,
        /// Prefix recorded in the manifest.
        recorded: String,
        /// Prefix of the environment being packed.
        expected: String,
    },

    /// Packages installed in editable mode reference source trees outside
    /// the prefix and cannot be relocated.
    #[error(
        "editable packages cannot be packed: {} (pass --ignore-editable-packages to drop them)",
        names.join(", ")
    )]
    EditablePackages {
        /// Names of the editable packages found.
        names: Vec<String>,
    },

    /// The output path already exists and `force` was not set.
    #[error("output '{}' already exists (pass --force to overwrite)", path.display())]
    OutputExists {
        /// The requested output path.
        path: PathBuf,
    },

    /// The requested archive format needs an external tool that is absent.
    #[error("format '{format}' is unavailable: {reason}")]
    FormatUnavailable {
        /// Human name of the format.
        format: String,
        /// Why it cannot be produced on this host.
        reason: String,
    },

    /// An archive member path exceeds what the chosen container can store.
    #[error(
        "'{}' is {len} bytes, beyond the {limit}-byte limit of {format} \
         (pass --ignore-long-paths to drop such files)",
        path.display()
    )]
    PathTooLongForFormat {
        /// The offending member path.
        path: PathBuf,
        /// Its byte length.
        len: usize,
        /// The container's limit.
        limit: usize,
        /// Human name of the format.
        format: String,
    },

    /// A worker thread hit an unexpected I/O or compressor error.
    #[error("while packing '{}': {source}", path.display())]
    WorkerFailure {
        /// The file being processed when the failure occurred.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Cooperative cancellation was requested.
    #[error("packing was cancelled")]
    Cancelled,

    /// Configuration rejected before any work started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error outside the worker pool.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest or metadata document could not be parsed.
    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PackError {
    /// Shorthand for [`PackError::Config`].
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
