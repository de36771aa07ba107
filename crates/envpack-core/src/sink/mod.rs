//! Archive sinks.
//!
//! Every output container implements the same narrow contract: ordered
//! `add_*` calls followed by exactly one `finalize` (atomic rename from a
//! temp path) or `abort` (delete the temp). The driver is the only caller;
//! sinks are never shared between threads.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::{ArchiveFormat, SquashfsCodec};
use crate::error::{PackError, Result};

mod dir;
mod parcel;
mod squashfs;
mod tar;
mod zip;

pub use dir::DirectorySink;
pub use parcel::{ParcelMeta, ParcelSink};
pub use squashfs::SquashfsSink;
pub use tar::{TarCompression, TarSink};
pub use zip::ZipSink;

/// Uniform writer contract for all containers.
pub trait Sink {
    /// Append a directory entry.
    ///
    /// # Errors
    ///
    /// I/O or container errors.
    fn add_directory(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()>;

    /// Append a regular file whose content is produced by `content`.
    ///
    /// `size` is the exact number of bytes `content` yields.
    ///
    /// # Errors
    ///
    /// I/O or container errors.
    fn add_regular(
        &mut self,
        arcname: &Path,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()>;

    /// Append a symbolic link.
    ///
    /// # Errors
    ///
    /// I/O or container errors.
    fn add_symlink(&mut self, arcname: &Path, mode: u32, mtime: u64, target: &Path) -> Result<()>;

    /// Flush, close, and atomically move the temp output into place.
    ///
    /// # Errors
    ///
    /// I/O or container errors; on error the temp output is removed.
    fn finalize(self: Box<Self>) -> Result<()>;

    /// Drop the temp output. Infallible by design: abort runs on error
    /// paths where there is nothing useful left to do with a failure.
    fn abort(self: Box<Self>);
}

/// Options shared by all sink constructors.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Abstract compression level, 0-9.
    pub compress_level: u32,
    /// Normalize timestamps/ownership for byte-identical output.
    pub reproducible: bool,
    /// Explicit SquashFS codec; derived from the level when absent.
    pub squashfs_codec: Option<SquashfsCodec>,
    /// Parcel metadata; required for [`ArchiveFormat::Parcel`].
    pub parcel: Option<ParcelMeta>,
}

/// Open a sink for `format` writing to `output`.
///
/// The temp output lives next to `output` so the final rename stays on one
/// filesystem.
///
/// # Errors
///
/// [`PackError::FormatUnavailable`] when a required external tool is
/// missing; [`PackError::Config`] for parcel misuse; plus I/O errors.
pub fn open(output: &Path, format: ArchiveFormat, options: &SinkOptions) -> Result<Box<dyn Sink>> {
    let sink: Box<dyn Sink> = match format {
        ArchiveFormat::Tar => Box::new(TarSink::create(output, TarCompression::None, options)?),
        ArchiveFormat::TarGz => Box::new(TarSink::create(output, TarCompression::Gzip, options)?),
        ArchiveFormat::TarBz2 => {
            Box::new(TarSink::create(output, TarCompression::Bzip2, options)?)
        }
        ArchiveFormat::TarXz => Box::new(TarSink::create(output, TarCompression::Xz, options)?),
        ArchiveFormat::TarZst => {
            Box::new(TarSink::create(output, TarCompression::Zstd, options)?)
        }
        ArchiveFormat::Zip => Box::new(ZipSink::create(output, options)?),
        ArchiveFormat::Squashfs => Box::new(SquashfsSink::create(output, options)?),
        ArchiveFormat::Parcel => {
            let meta = options.parcel.clone().ok_or_else(|| {
                PackError::config("parcel output requires parcel metadata")
            })?;
            Box::new(ParcelSink::create(output, meta, options)?)
        }
        ArchiveFormat::NoArchive => Box::new(DirectorySink::create(output)?),
    };
    Ok(sink)
}

/// Resolve the parent directory of an output path, for temp-file placement.
pub(crate) fn output_parent(output: &Path) -> PathBuf {
    output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
