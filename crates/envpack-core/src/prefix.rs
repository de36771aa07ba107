//! Prefix and path primitives.
//!
//! An installed environment embeds the absolute path it was installed at
//! (the *source prefix*) in shell scripts, config files, and compiled
//! binaries. Everything in this module is about finding that byte sequence
//! and computing where things should point instead.

use std::path::{Component, Path, PathBuf};

use crate::error::{PackError, Result};

/// Number of bytes sniffed from the head of a file to decide text vs binary.
pub const TEXT_SNIFF_LEN: usize = 1024;

/// How much of an unmanaged file is scanned for the source prefix before
/// falling back to a full-file scan.
pub const PREFIX_SCAN_LEN: usize = 64 * 1024;

/// Build the default destination prefix used when the caller does not pick
/// one: a neutral path padded out to 255 bytes so it can be patched down to
/// any realistic deploy target by the unpack runner.
pub fn default_dest_prefix() -> String {
    let mut s = String::from("/opt/env");
    while s.len() < 255 {
        s.push_str("_placehold");
    }
    s.truncate(255);
    s
}

/// Normalize an environment prefix: must be absolute, trailing separators
/// and `.` components are dropped.
///
/// # Errors
///
/// Returns [`PackError::Config`] for relative paths or paths containing
/// `..` components.
pub fn normalize_prefix(prefix: &Path) -> Result<PathBuf> {
    if !prefix.is_absolute() {
        return Err(PackError::config(format!(
            "prefix must be an absolute path, got '{}'",
            prefix.display()
        )));
    }
    let mut out = PathBuf::new();
    for comp in prefix.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PackError::config(format!(
                    "prefix must not contain '..': '{}'",
                    prefix.display()
                )));
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Heuristic text check: a file sniffs as text when its first
/// [`TEXT_SNIFF_LEN`] bytes contain no NUL.
pub fn looks_like_text(head: &[u8]) -> bool {
    let sniff = &head[..head.len().min(TEXT_SNIFF_LEN)];
    !sniff.contains(&0)
}

/// Byte-exact substring search for a placeholder.
///
/// Placeholders are the literal bytes the package manager wrote at install
/// time, so this is `memmem`, never a regex or any encoding-aware match.
pub fn find_placeholder(haystack: &[u8], placeholder: &[u8]) -> Option<usize> {
    if placeholder.is_empty() {
        return None;
    }
    memchr::memmem::find(haystack, placeholder)
}

/// Whether `haystack` contains `placeholder` anywhere.
pub fn contains_placeholder(haystack: &[u8], placeholder: &[u8]) -> bool {
    find_placeholder(haystack, placeholder).is_some()
}

/// Compute a relative path from `from_dir` to `to_path`.
///
/// Both arguments must be absolute paths. The function walks up from
/// `from_dir` to the common ancestor and then descends into `to_path`.
///
/// Example: `relative_path("/a/b/c", "/a/b/d/e")` returns `"../d/e"`.
pub fn relative_path(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from_components: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to_path.components().collect();

    let common_len = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for part in &to_components[common_len..] {
        result.push(part);
    }
    result
}

/// Rewrite an absolute symlink target that points inside the source prefix
/// into a link relative to the symlink's own directory within the archive.
///
/// Targets outside the prefix are left alone (returned as `None`) and the
/// symlink ships with its absolute target untouched.
pub fn retarget_symlink(prefix: &Path, link_rel: &Path, target: &Path) -> Option<PathBuf> {
    if !target.is_absolute() {
        return None;
    }
    let suffix = target.strip_prefix(prefix).ok()?;
    // The link's directory, expressed absolutely under the prefix, so both
    // sides of relative_path share a root.
    let link_dir = link_rel.parent().map_or_else(|| prefix.to_path_buf(), |p| prefix.join(p));
    Some(relative_path(&link_dir, &prefix.join(suffix)))
}
