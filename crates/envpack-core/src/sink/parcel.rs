//! Parcel sink: a gz-tar with mandatory cluster-manager metadata.
//!
//! Parcels are consumed by a cluster manager that expects a fixed layout:
//! everything under `{name}-{version}/`, a `meta/parcel.json` descriptor,
//! and an environment script sourced on activation. Naming and the
//! destination prefix are derived, never user-supplied.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};
use crate::sink::tar::{TarCompression, TarSink};
use crate::sink::{Sink, SinkOptions};

/// Parcel identity and contents summary.
#[derive(Debug, Clone)]
pub struct ParcelMeta {
    /// Parcel name.
    pub name: String,
    /// Parcel version.
    pub version: String,
    /// Distribution tag baked into the file name (e.g. `el7`).
    pub distribution: String,
    /// Parcel repository root on the target host.
    pub root: String,
    /// `(name, version)` of every packed package, for the descriptor.
    pub packages: Vec<(String, String)>,
}

impl ParcelMeta {
    /// The directory every member lives under, `{name}-{version}`.
    pub fn arcroot(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// The enforced destination prefix, `{root}/{name}-{version}`.
    pub fn dest_prefix(&self) -> String {
        format!("{}/{}", self.root, self.arcroot())
    }

    /// The enforced output file name, `{name}-{version}-{distribution}.parcel`.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.parcel", self.name, self.version, self.distribution)
    }

    fn descriptor(&self) -> serde_json::Value {
        serde_json::json!({
            "schema_version": 1,
            "name": self.name,
            "version": self.version,
            "extraVersion": self.distribution,
            "setActiveSymlink": true,
            "scripts": { "defines": format!("{}_env.sh", self.name) },
            "packages": self.packages.iter().map(|(name, version)| {
                serde_json::json!({ "name": name, "version": version })
            }).collect::<Vec<_>>(),
            "components": [],
            "provides": ["conda_env"],
            "users": {},
            "groups": [],
        })
    }

    fn env_script(&self) -> String {
        format!(
            "#!/bin/sh\n\
             # Sourced by the cluster manager when the parcel is activated.\n\
             ENVPACK_PARCEL_DIRNAME=\"${{PARCEL_DIRNAME:-{arcroot}}}\"\n\
             export ENVPACK_ENV_ROOT=\"$PARCELS_ROOT/$ENVPACK_PARCEL_DIRNAME\"\n\
             export PATH=\"$ENVPACK_ENV_ROOT/bin:$PATH\"\n",
            arcroot = self.arcroot()
        )
    }
}

/// Parcel container sink.
#[derive(Debug)]
pub struct ParcelSink {
    inner: TarSink,
}

impl ParcelSink {
    /// Open a parcel sink, validating the enforced file name and writing
    /// the two mandatory `meta/` entries.
    ///
    /// # Errors
    ///
    /// [`PackError::Config`] when `output` does not follow the
    /// `{name}-{version}-{distribution}.parcel` naming; otherwise I/O
    /// errors from the underlying tar sink.
    pub fn create(output: &Path, meta: ParcelMeta, options: &SinkOptions) -> Result<Self> {
        let expected = meta.file_name();
        let actual = output.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if actual != expected {
            return Err(PackError::config(format!(
                "parcel output must be named '{expected}', got '{actual}'"
            )));
        }

        let mut inner = TarSink::create(output, TarCompression::Gzip, options)?;
        let root = PathBuf::from(meta.arcroot());

        inner.add_directory(&root.join("meta"), 0o755, 0)?;
        let descriptor = serde_json::to_vec_pretty(&meta.descriptor())?;
        inner.add_regular(
            &root.join("meta/parcel.json"),
            0o644,
            0,
            descriptor.len() as u64,
            &mut Cursor::new(descriptor),
        )?;
        let script = meta.env_script().into_bytes();
        inner.add_regular(
            &root.join(format!("meta/{}_env.sh", meta.name)),
            0o755,
            0,
            script.len() as u64,
            &mut Cursor::new(script),
        )?;

        Ok(Self { inner })
    }
}

impl Sink for ParcelSink {
    fn add_directory(&mut self, arcname: &Path, mode: u32, mtime: u64) -> Result<()> {
        self.inner.add_directory(arcname, mode, mtime)
    }

    fn add_regular(
        &mut self,
        arcname: &Path,
        mode: u32,
        mtime: u64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.inner.add_regular(arcname, mode, mtime, size, content)
    }

    fn add_symlink(&mut self, arcname: &Path, mode: u32, mtime: u64, target: &Path) -> Result<()> {
        self.inner.add_symlink(arcname, mode, mtime, target)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        Box::new(self.inner).finalize()
    }

    fn abort(self: Box<Self>) {
        Box::new(self.inner).abort();
    }
}
