//! Zip sink: store or deflate per the numeric level.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;

use crate::error::{PackError, Result};
use crate::sink::{Sink, SinkOptions, output_parent};

/// Entries at or above this size are written with ZIP64 records.
const ZIP64_THRESHOLD: u64 = 4 * 1024 * 1024 * 1024;

/// Convert epoch seconds to a DOS-representable date-time, clamped to the
/// 1980..=2107 window the format can store.
fn dos_datetime(secs: u64) -> zip::DateTime {
    // Howard Hinnant's civil-from-days algorithm.
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    let year = year.clamp(1980, 2107) as u16;
    zip::DateTime::from_date_and_time(
        year,
        month as u8,
        day as u8,
        hour as u8,
        minute as u8,
        second as u8,
    )
    .unwrap_or_default()
}

/// Zip container sink.
pub struct ZipSink {
    writer: zip::ZipWriter<File>,
    tmp: NamedTempFile,
    output: PathBuf,
    compress_level: u32,
    reproducible: bool,
}

impl std::fmt::Debug for ZipSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipSink")
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl ZipSink {
    /// Open a zip sink writing to a temp file next to `output`.
    ///
    /// # Errors
    ///
    /// I/O errors creating the temp file.
    pub fn create(output: &Path, options: &SinkOptions) -> Result<Self> {
        let tmp = NamedTempFile::new_in(output_parent(output))?;
        let writer = zip::ZipWriter::new(tmp.reopen()?);
        Ok(Self {
            writer,
            tmp,
            output: output.to_path_buf(),
            compress_level: options.compress_level,
            reproducible: options.reproducible,
        })
    }

    fn options(&self, mode: u32, mtime: u64, size: u64) -> SimpleFileOptions {
        let method = if self.compress_level == 0 {
            zip::CompressionMethod::Stored
        } else {
            zip::CompressionMethod::Deflated
        };
        let mut opts = SimpleFileOptions::default()
            .compression_method(method)
            .unix_permissions(mode & 0o7777)
            .large_file(size >= ZIP64_THRESHOLD)
            .last_modified_time(if self.reproducible {
                zip::DateTime::default()
            } else {
                dos_datetime(mtime)
            });
        if method == zip::CompressionMethod::Deflated {
            opts = opts.compression_level(Some(i64::from(self.compress_level)));
        }
        opts
    }

    fn arcname(arcname: &Path) -> Result<String> {
        arcname
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| PackError::config(format!("non-UTF-8 member path '{}'", arcname.display())))
    }
}

impl Sink for ZipSink {
    fn add_directory(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()> {
        self.writer
            .add_directory(Self::arcname(arcname)?, self.options(mode, mtime, 0))
            .map_err(io::Error::other)?;
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
        self.writer
            .start_file(Self::arcname(arcname)?, self.options(mode, mtime, size))
            .map_err(io::Error::other)?;
        io::copy(content, &mut self.writer)?;
        Ok(())
    }

    fn add_symlink(&mut self, arcname: &Path, mode: u32, mtime: u64, target: &Path) -> Result<()> {
        let target = target
            .to_str()
            .ok_or_else(|| PackError::config(format!("non-UTF-8 link target '{}'", target.display())))?;
        self.writer
            .add_symlink(Self::arcname(arcname)?, target, self.options(mode, mtime, 0))
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let Self {
            mut writer,
            tmp,
            output,
            ..
        } = *self;
        writer.finish().map_err(io::Error::other)?;
        tmp.persist(&output).map_err(|e| e.error)?;
        tracing::debug!(output = %output.display(), "zip sink finalized");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        drop(self);
    }
}
