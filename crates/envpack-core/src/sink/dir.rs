//! The no-archive sink: a directory clone on disk.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::TempDir;

use crate::error::Result;
use crate::sink::{Sink, output_parent};

/// Writes entries as real files under a root directory.
///
/// Shared between [`DirectorySink`] and the SquashFS staging step.
/// Directory mtimes are recorded and applied at the end, deepest first,
/// because writing children would clobber them.
#[derive(Debug)]
pub(crate) struct TreeWriter {
    root: PathBuf,
    dir_times: Vec<(PathBuf, u64)>,
}

impl TreeWriter {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            dir_times: Vec::new(),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn dir(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()> {
        let path = self.root.join(arcname);
        fs::create_dir_all(&path)?;
        set_mode(&path, mode)?;
        self.dir_times.push((path, mtime));
        Ok(())
    }

    pub(crate) fn file(
        &mut self,
        arcname: &Path,
        mode: u32,
        mtime: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        let path = self.root.join(arcname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&path)?;
        std::io::copy(content, &mut out)?;
        drop(out);
        set_mode(&path, mode)?;
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime as i64, 0))?;
        Ok(())
    }

    pub(crate) fn symlink(&mut self, arcname: &Path, mtime: u64, target: &Path) -> Result<()> {
        let path = self.root.join(arcname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &path)?;
        #[cfg(not(unix))]
        {
            let _ = target;
        }
        let t = FileTime::from_unix_time(mtime as i64, 0);
        let _ = filetime::set_symlink_file_times(&path, t, t);
        Ok(())
    }

    /// Apply the recorded directory mtimes, children before parents.
    pub(crate) fn apply_dir_times(&mut self) -> Result<()> {
        self.dir_times.sort();
        for (path, mtime) in self.dir_times.drain(..).rev() {
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime as i64, 0))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// The `no-archive` sink: stages into a temp directory next to the output
/// and renames it into place on finalize, so a failed run never leaves a
/// half-written clone behind.
#[derive(Debug)]
pub struct DirectorySink {
    stage: TempDir,
    writer: TreeWriter,
    output: PathBuf,
}

impl DirectorySink {
    /// Open a directory sink targeting `output`.
    ///
    /// # Errors
    ///
    /// I/O errors creating the staging directory.
    pub fn create(output: &Path) -> Result<Self> {
        let stage = TempDir::new_in(output_parent(output))?;
        let writer = TreeWriter::new(stage.path().to_path_buf());
        Ok(Self {
            stage,
            writer,
            output: output.to_path_buf(),
        })
    }

    /// Open a writer staging into an explicit directory with no final
    /// rename (the SquashFS sink feeds the staged tree to `mksquashfs`).
    pub(crate) fn staging(root: PathBuf) -> TreeWriter {
        TreeWriter::new(root)
    }
}

impl Sink for DirectorySink {
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
            output,
        } = *self;
        writer.apply_dir_times()?;
        let staged = stage.keep();
        if let Err(e) = fs::rename(&staged, &output) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        tracing::debug!(output = %output.display(), "directory sink finalized");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        // TempDir removes the staged tree on drop.
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_directory_clone() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("env");
        let mut sink = Box::new(DirectorySink::create(&out).unwrap());
        sink.add_directory(Path::new("bin"), 0o755, 1_000_000).unwrap();
        sink.add_regular(
            Path::new("bin/tool"),
            0o755,
            2_000_000,
            5,
            &mut Cursor::new(b"hello".to_vec()),
        )
        .unwrap();
        sink.add_symlink(Path::new("bin/alias"), 0o777, 0, Path::new("tool"))
            .unwrap();
        (sink as Box<dyn Sink>).finalize().unwrap();

        assert_eq!(fs::read(out.join("bin/tool")).unwrap(), b"hello");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(out.join("bin/tool")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            assert_eq!(
                fs::read_link(out.join("bin/alias")).unwrap(),
                PathBuf::from("tool")
            );
        }
        let mtime = fs::metadata(out.join("bin/tool"))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(mtime, 2_000_000);
    }

    #[test]
    fn test_abort_removes_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("env");
        let mut sink = Box::new(DirectorySink::create(&out).unwrap());
        sink.add_regular(Path::new("f"), 0o644, 0, 1, &mut Cursor::new(b"x".to_vec()))
            .unwrap();
        (sink as Box<dyn Sink>).abort();
        assert!(!out.exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
