//! SquashFS sink: stage to a directory, then invoke `mksquashfs`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use crate::config::SquashfsCodec;
use crate::error::{PackError, Result};
use crate::sink::dir::{DirectorySink, TreeWriter};
use crate::sink::{Sink, SinkOptions, output_parent};

/// SquashFS image sink.
///
/// The image itself is produced by the external `mksquashfs` tool; the sink
/// stages the rewritten tree into a temp directory and runs the tool at
/// finalize. The codec is explicit configuration ([`SquashfsCodec`]),
/// derived once from the abstract level when unset.
#[derive(Debug)]
pub struct SquashfsSink {
    stage: TempDir,
    writer: TreeWriter,
    tool: PathBuf,
    codec: SquashfsCodec,
    reproducible: bool,
    output: PathBuf,
}

impl SquashfsSink {
    /// Open a SquashFS sink targeting `output`.
    ///
    /// # Errors
    ///
    /// [`PackError::FormatUnavailable`] when `mksquashfs` cannot be found
    /// on `PATH`; I/O errors creating the staging directory.
    pub fn create(output: &Path, options: &SinkOptions) -> Result<Self> {
        let tool = which::which("mksquashfs").map_err(|_| PackError::FormatUnavailable {
            format: "squashfs".to_string(),
            reason: "mksquashfs not found on PATH".to_string(),
        })?;
        let stage = TempDir::new_in(output_parent(output))?;
        let writer = DirectorySink::staging(stage.path().to_path_buf());
        let codec = options
            .squashfs_codec
            .unwrap_or_else(|| SquashfsCodec::from_level(options.compress_level));
        tracing::debug!(?codec, "squashfs codec selected");
        Ok(Self {
            stage,
            writer,
            tool,
            codec,
            reproducible: options.reproducible,
            output: output.to_path_buf(),
        })
    }
}

impl Sink for SquashfsSink {
    fn add_directory(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()> {
        self.writer.dir(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &Path,
        mode: u32,
        mtime: u64,
        _size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.writer.file(arcname, mode, mtime, content)
    }

    fn add_symlink(&mut self, arcname: &Path, _mode: u32, mtime: u64, target: &Path) -> Result<()> {
        self.writer.symlink(arcname, mtime, target)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let Self {
            stage,
            mut writer,
            tool,
            codec,
            reproducible,
            output,
        } = *self;
        writer.apply_dir_times()?;

        let image = tempfile::NamedTempFile::new_in(output_parent(&output))?;
        let mut cmd = Command::new(&tool);
        cmd.arg(stage.path()).arg(image.path());
        cmd.args(["-noappend", "-no-progress"]);
        match codec {
            // No "-comp none" in mksquashfs; disabling every block type
            // gets the same effect.
            SquashfsCodec::None => {
                cmd.args(["-noI", "-noD", "-noF", "-noX"]);
            }
            SquashfsCodec::Zstd => {
                cmd.args(["-comp", "zstd"]);
            }
            SquashfsCodec::Xz => {
                cmd.args(["-comp", "xz"]);
            }
        }
        if reproducible {
            cmd.args(["-all-root", "-mkfs-time", "0"]);
        }

        let out = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PackError::FormatUnavailable {
                    format: "squashfs".to_string(),
                    reason: "mksquashfs disappeared from PATH".to_string(),
                }
            } else {
                PackError::Io(e)
            }
        })?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(PackError::Io(std::io::Error::other(format!(
                "mksquashfs failed: {}",
                stderr.trim()
            ))));
        }

        image.persist(&output).map_err(|e| e.error)?;
        tracing::debug!(output = %output.display(), "squashfs sink finalized");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        drop(self);
    }
}
