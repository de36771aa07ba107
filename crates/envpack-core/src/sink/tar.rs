//! The tar family: plain, gzip, bzip2, xz, and zstd.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;
use crate::sink::{Sink, SinkOptions, output_parent};

/// Compressor wrapped around the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    /// No compression.
    None,
    /// gzip via flate2.
    Gzip,
    /// bzip2.
    Bzip2,
    /// xz (lzma2).
    Xz,
    /// zstd.
    Zstd,
}

/// A writer that can flush its compressor trailer through a trait object.
trait FinishWrite: Write + Send {
    fn finish_box(self: Box<Self>) -> io::Result<()>;
}

impl FinishWrite for BufWriter<File> {
    fn finish_box(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

impl FinishWrite for flate2::write::GzEncoder<BufWriter<File>> {
    fn finish_box(self: Box<Self>) -> io::Result<()> {
        self.finish()?.flush()
    }
}

impl FinishWrite for bzip2::write::BzEncoder<BufWriter<File>> {
    fn finish_box(self: Box<Self>) -> io::Result<()> {
        self.finish()?.flush()
    }
}

impl FinishWrite for xz2::write::XzEncoder<BufWriter<File>> {
    fn finish_box(self: Box<Self>) -> io::Result<()> {
        self.finish()?.flush()
    }
}

impl FinishWrite for zstd::stream::Encoder<'static, BufWriter<File>> {
    fn finish_box(self: Box<Self>) -> io::Result<()> {
        self.finish()?.flush()
    }
}

/// Tar-family sink.
///
/// Headers are POSIX ustar; the `tar` crate falls back to GNU long-name
/// extension entries only when a path or link target overflows the ustar
/// fields. Under the reproducibility policy uid/gid are zero, uname/gname
/// empty, and mtimes zero (gzip streams carry no name or mtime either —
/// flate2's defaults).
pub struct TarSink {
    builder: tar::Builder<Box<dyn FinishWrite>>,
    tmp: NamedTempFile,
    output: PathBuf,
    reproducible: bool,
}

impl std::fmt::Debug for TarSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarSink")
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl TarSink {
    /// Open a tar sink writing through `compression` to a temp file next
    /// to `output`.
    ///
    /// # Errors
    ///
    /// I/O errors creating the temp file or compressor.
    pub fn create(output: &Path, compression: TarCompression, options: &SinkOptions) -> Result<Self> {
        let tmp = NamedTempFile::new_in(output_parent(output))?;
        let file = BufWriter::new(tmp.reopen()?);
        let level = options.compress_level;

        let writer: Box<dyn FinishWrite> = match compression {
            TarCompression::None => Box::new(file),
            TarCompression::Gzip => Box::new(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::new(level.clamp(0, 9)),
            )),
            TarCompression::Bzip2 => Box::new(bzip2::write::BzEncoder::new(
                file,
                bzip2::Compression::new(level.clamp(1, 9)),
            )),
            TarCompression::Xz => Box::new(xz2::write::XzEncoder::new(file, level.clamp(0, 9))),
            // zstd level 0 means "the library default" (3).
            TarCompression::Zstd => {
                Box::new(zstd::stream::Encoder::new(file, level as i32)?)
            }
        };

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);
        Ok(Self {
            builder,
            tmp,
            output: output.to_path_buf(),
            reproducible: options.reproducible,
        })
    }

    fn header(&self, mode: u32, mtime: u64, size: u64) -> tar::Header {
        let mut header = tar::Header::new_ustar();
        header.set_mode(mode & 0o7777);
        header.set_size(size);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(if self.reproducible { 0 } else { mtime });
        header
    }
}

impl Sink for TarSink {
    fn add_directory(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()> {
        let mut header = self.header(mode, mtime, 0);
        header.set_entry_type(tar::EntryType::Directory);
        // Directory members carry a trailing slash by convention.
        let arcname = PathBuf::from(format!("{}/", arcname.display()));
        self.builder.append_data(&mut header, arcname, io::empty())?;
        Ok(())
    }

    fn add_regular(
        &mut self,
        arcname: &Path,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        let mut header = self.header(mode, mtime, size);
        header.set_entry_type(tar::EntryType::Regular);
        self.builder.append_data(&mut header, arcname, content)?;
        Ok(())
    }

    fn add_symlink(&mut self, arcname: &Path, mode: u32, mtime: u64, target: &Path) -> Result<()> {
        let mut header = self.header(mode, mtime, 0);
        header.set_entry_type(tar::EntryType::Symlink);
        self.builder.append_link(&mut header, arcname, target)?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let Self {
            mut builder,
            tmp,
            output,
            ..
        } = *self;
        builder.finish()?;
        builder.into_inner()?.finish_box()?;
        tmp.persist(&output).map_err(|e| e.error)?;
        tracing::debug!(output = %output.display(), "tar sink finalized");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        // NamedTempFile unlinks on drop.
        drop(self);
    }
}
