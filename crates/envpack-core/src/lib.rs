//! Core engine for envpack.
//!
//! Turns an installed environment into a single relocatable archive:
//! analyzes the prefix against the package manager's manifests, rewrites
//! textual prefix references while streaming files into one of several
//! containers, and records binary rewrites for a companion runner applied
//! after extraction. Designed to be consumed by CLI frontends without
//! coupling to any specific UI.

/// Pack configuration and archive format selection.
pub mod config;
/// Domain error taxonomy.
pub mod error;
/// Package inventory: manifests, ownership, and the oracle trait.
pub mod inventory;
/// Top-level pack orchestration.
pub mod pack;
/// Driver, worker pool, and ordered sink writer.
pub mod pipeline;
/// Prefix and path primitives.
pub mod prefix;
/// Progress reporting trait and implementations for UI decoupling.
pub mod reporter;
/// Streaming text rewrite and the deferred C-string patch.
pub mod rewrite;
/// Archive sinks: tar family, zip, SquashFS, parcel, and directory.
pub mod sink;
/// Deferred-rewrite manifest and the unpack runner.
pub mod unpack;
/// Environment walker and per-file classifier.
pub mod walker;

pub use config::{ArchiveFormat, PackConfig, ParcelOptions, SquashfsCodec};
pub use error::{PackError, Result};
pub use inventory::{CondaMetaOracle, Inventory, PackageOracle};
pub use pack::{PackOutcome, pack};
pub use reporter::{NullReporter, Reporter};
pub use unpack::apply_unpack;
