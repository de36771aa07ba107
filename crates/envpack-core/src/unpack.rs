//! Deferred-rewrite manifest and the companion unpack runner.
//!
//! Binary rewrites cannot happen at pack time (they need the final on-host
//! path), so every archive carries a manifest enumerating them plus a small
//! self-contained runner that applies them after extraction. Text entries
//! appear in the manifest only when pack-time rewriting was not possible;
//! the runner re-runs the text policy on those.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};
use crate::inventory::PrefixMode;
use crate::rewrite::{patch_cstring_bytes, rewrite_text_bytes};

/// Archive path of the deferred-rewrite manifest, below the archive root.
pub const MANIFEST_ARCNAME: &str = "conda-meta/envpack.json";

/// Archive path of the runner, below the archive root.
pub const RUNNER_ARCNAME: &str = "bin/envpack-unpack";

/// One deferred rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpackEntry {
    /// Path relative to the environment root, POSIX separators.
    pub path: String,
    /// Which rewrite policy the runner applies.
    pub mode: PrefixMode,
}

/// The manifest shipped at [`MANIFEST_ARCNAME`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpackManifest {
    /// The original install prefix, as embedded in the shipped files.
    pub prefix_placeholder: String,
    /// What the archive pretends to be: the configured destination prefix
    /// or the neutral placeholder.
    pub destination_prefix: String,
    /// All deferred rewrites.
    pub files: Vec<UnpackEntry>,
}

impl UnpackManifest {
    /// Serialize to pretty JSON (the manifest is user-visible).
    ///
    /// # Errors
    ///
    /// Serialization of this type cannot realistically fail; errors are
    /// still propagated rather than swallowed.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Load a manifest from an extracted tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// I/O and parse errors.
    pub fn from_root(root: &Path) -> Result<Self> {
        let content = fs::read_to_string(root.join(MANIFEST_ARCNAME))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// The runner installed at [`RUNNER_ARCNAME`].
///
/// Deliberately self-contained: it derives the environment root from its
/// own location and reads the manifest from the extracted tree, so the
/// same script text works for every archive.
pub const RUNNER_SCRIPT: &str = r#"#!/usr/bin/env python
"""Finish relocating this environment after extraction.

Applies the deferred prefix rewrites recorded at pack time: binary files
get a length-preserving C-string patch, text files a plain substitution.
Run it once from anywhere after extracting the archive.
"""
import json
import os
import sys


def patch_cstrings(data, old, new):
    out = bytearray()
    rest = data
    while True:
        i = rest.find(old)
        if i < 0:
            out += rest
            return bytes(out)
        end = rest.find(b"\0", i + len(old))
        if end < 0:
            end = len(rest)
        region = rest[i:end]
        patched = new + region[len(old):]
        out += rest[:i] + patched + b"\0" * (len(region) - len(patched))
        rest = rest[end:]


def main():
    here = os.path.dirname(os.path.abspath(__file__))
    root = os.path.dirname(here)
    with open(os.path.join(root, "conda-meta", "envpack.json")) as f:
        manifest = json.load(f)
    src = manifest["prefix_placeholder"].encode("utf-8")
    pretend = manifest["destination_prefix"].encode("utf-8")
    dest = root.encode("utf-8")
    for entry in manifest["files"]:
        path = os.path.join(root, *entry["path"].split("/"))
        with open(path, "rb") as f:
            data = f.read()
        if entry["mode"] == "binary":
            if len(dest) > len(src):
                sys.exit(
                    "error: %r is longer than the %d-byte prefix embedded in %r"
                    % (root, len(src), entry["path"])
                )
            data = patch_cstrings(data, src, dest)
        else:
            data = data.replace(src, dest).replace(pretend, dest)
        with open(path, "wb") as f:
            f.write(data)


if __name__ == "__main__":
    main()
"#;

/// Apply the deferred rewrites to an extracted tree in-process.
///
/// This is the runner's behavior expressed as a library call: binary
/// entries get the length-preserving patch, text entries the plain
/// substitution, both targeting `dest` (defaulting to `root` itself, which
/// is where the tree actually lives). Returns the number of files patched.
///
/// # Errors
///
/// [`PackError::DestinationPrefixTooLong`] when `dest` cannot fit into a
/// binary placeholder; otherwise I/O and parse errors.
pub fn apply_unpack(root: &Path, dest: Option<&str>) -> Result<usize> {
    let manifest = UnpackManifest::from_root(root)?;
    let dest = match dest {
        Some(d) => d.to_string(),
        None => root
            .to_str()
            .ok_or_else(|| PackError::config("environment root is not valid UTF-8"))?
            .to_string(),
    };
    let src = manifest.prefix_placeholder.as_bytes();
    let pretend = manifest.destination_prefix.as_bytes();

    let mut patched = 0usize;
    for entry in &manifest.files {
        let path = root.join(&entry.path);
        let data = fs::read(&path)?;
        let new_data = match entry.mode {
            PrefixMode::Binary => {
                if dest.len() > src.len() {
                    return Err(PackError::DestinationPrefixTooLong {
                        dest_len: dest.len(),
                        placeholder_len: src.len(),
                        path: path.clone(),
                    });
                }
                patch_cstring_bytes(&data, src, dest.as_bytes()).0
            }
            PrefixMode::Text => {
                let pass1 = rewrite_text_bytes(&data, src, dest.as_bytes());
                rewrite_text_bytes(&pass1, pretend, dest.as_bytes())
            }
        };
        if new_data != data {
            fs::write(&path, new_data)?;
            patched += 1;
        }
    }
    tracing::debug!(patched, "deferred rewrites applied");
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = UnpackManifest {
            prefix_placeholder: "/opt/env_build".to_string(),
            destination_prefix: "/srv/app".to_string(),
            files: vec![UnpackEntry {
                path: "lib/libfoo.so".to_string(),
                mode: PrefixMode::Binary,
            }],
        };
        let json = manifest.to_json().unwrap();
        let text = std::str::from_utf8(&json).unwrap();
        assert!(text.contains("\"mode\": \"binary\""));
        let back: UnpackManifest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.prefix_placeholder, "/opt/env_build");
    }

    #[test]
    fn test_runner_script_is_self_contained() {
        assert!(RUNNER_SCRIPT.starts_with("#!/usr/bin/env python"));
        assert!(RUNNER_SCRIPT.contains("conda-meta"));
        assert!(RUNNER_SCRIPT.contains("envpack.json"));
        // No pack-time interpolation markers left behind.
        assert!(!RUNNER_SCRIPT.contains("@"));
    }

    #[test]
    fn test_apply_unpack_binary_patch() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let dest = root.to_str().unwrap();
        // The embedded prefix must be at least as long as the temp dir path.
        let src: String = format!("/opt/{}", "x".repeat(dest.len().max(8)));

        let mut blob = b"\x7fELF".to_vec();
        blob.extend_from_slice(src.as_bytes());
        blob.extend_from_slice(b"/lib\0tail");
        write_file(root, "lib/libfoo.so", &blob);

        let manifest = UnpackManifest {
            prefix_placeholder: src.clone(),
            destination_prefix: "/srv/app".to_string(),
            files: vec![UnpackEntry {
                path: "lib/libfoo.so".to_string(),
                mode: PrefixMode::Binary,
            }],
        };
        write_file(root, MANIFEST_ARCNAME, &manifest.to_json().unwrap());

        let patched = apply_unpack(root, None).unwrap();
        assert_eq!(patched, 1);
        let data = fs::read(root.join("lib/libfoo.so")).unwrap();
        assert_eq!(data.len(), blob.len());
        let expect = format!("{dest}/lib");
        assert!(memchr::memmem::find(&data, expect.as_bytes()).is_some());
        assert!(data.ends_with(b"tail"));
    }

    #[test]
    fn test_apply_unpack_rejects_long_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_file(root, "lib/blob.bin", b"/p\0");
        let manifest = UnpackManifest {
            prefix_placeholder: "/p".to_string(),
            destination_prefix: "/q".to_string(),
            files: vec![UnpackEntry {
                path: "lib/blob.bin".to_string(),
                mode: PrefixMode::Binary,
            }],
        };
        write_file(root, MANIFEST_ARCNAME, &manifest.to_json().unwrap());
        let err = apply_unpack(root, None).unwrap_err();
        assert!(matches!(err, PackError::DestinationPrefixTooLong { .. }));
    }

    #[test]
    fn test_apply_unpack_text_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let dest = root.to_str().unwrap().to_string();
        write_file(root, "bin/activate", b"export PREFIX=/opt/env_build\n");
        let manifest = UnpackManifest {
            prefix_placeholder: "/opt/env_build".to_string(),
            destination_prefix: "/srv/pretend".to_string(),
            files: vec![UnpackEntry {
                path: "bin/activate".to_string(),
                mode: PrefixMode::Text,
            }],
        };
        write_file(root, MANIFEST_ARCNAME, &manifest.to_json().unwrap());
        apply_unpack(root, None).unwrap();
        let content = fs::read_to_string(root.join("bin/activate")).unwrap();
        assert_eq!(content, format!("export PREFIX={dest}\n"));
    }
}
