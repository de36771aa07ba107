//! Prefix rewriting.
//!
//! Text files are rewritten while streaming into the archive: every
//! occurrence of the placeholder (the exact bytes the package manager wrote
//! at install time) becomes the destination prefix. Binary files are never
//! rewritten at pack time; the length-preserving C-string patch below is
//! what the unpack runner applies on the target host.

use std::io::{self, Read, Write};

use memchr::memmem;

/// Default sliding-buffer size for streaming rewrites.
const REWRITE_BUF_LEN: usize = 64 * 1024;

/// Stream `reader` into `writer`, replacing every occurrence of
/// `placeholder` with `replacement`.
///
/// The match is a byte-exact substring search; line endings and every byte
/// outside a match are passed through untouched. A sliding window with
/// `placeholder.len() - 1` bytes of overlap catches matches straddling read
/// boundaries.
///
/// Returns the number of replacements made.
///
/// # Errors
///
/// Propagates I/O errors from either side.
pub fn rewrite_text(
    reader: impl Read,
    writer: impl Write,
    placeholder: &[u8],
    replacement: &[u8],
) -> io::Result<usize> {
    rewrite_text_buffered(reader, writer, placeholder, replacement, REWRITE_BUF_LEN)
}

/// [`rewrite_text`] with an explicit buffer capacity (small capacities are
/// exercised by tests to force boundary straddling).
pub fn rewrite_text_buffered(
    mut reader: impl Read,
    mut writer: impl Write,
    placeholder: &[u8],
    replacement: &[u8],
    capacity: usize,
) -> io::Result<usize> {
    if placeholder.is_empty() {
        io::copy(&mut reader, &mut writer)?;
        return Ok(0);
    }

    let finder = memmem::Finder::new(placeholder);
    let overlap = placeholder.len() - 1;
    // The window must be able to hold the overlap plus at least one full
    // pattern beyond it, or no match could ever complete.
    let capacity = capacity.max(placeholder.len() * 2);

    let mut buf = Vec::with_capacity(capacity);
    let mut chunk = vec![0u8; capacity];
    let mut replaced = 0usize;

    loop {
        let n = reader.read(&mut chunk)?;
        let eof = n == 0;
        buf.extend_from_slice(&chunk[..n]);

        if buf.is_empty() {
            break;
        }

        // Bytes past this point may be the head of a match whose tail has
        // not been read yet; hold them back until the next round.
        let emit_until = if eof { buf.len() } else { buf.len().saturating_sub(overlap) };

        let mut pos = 0;
        while let Some(found) = finder.find(&buf[pos..]) {
            let at = pos + found;
            if at >= emit_until {
                break;
            }
            writer.write_all(&buf[pos..at])?;
            writer.write_all(replacement)?;
            pos = at + placeholder.len();
            replaced += 1;
        }
        if pos < emit_until {
            writer.write_all(&buf[pos..emit_until])?;
            pos = emit_until;
        }
        buf.drain(..pos);

        if eof {
            // Anything still buffered is shorter than the placeholder.
            writer.write_all(&buf)?;
            break;
        }
    }

    Ok(replaced)
}

/// Rewrite a byte slice in one shot; used for content that is already in
/// memory (activation scripts, generated metadata).
pub fn rewrite_text_bytes(data: &[u8], placeholder: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    // Writing to a Vec cannot fail.
    let _ = rewrite_text_buffered(data, &mut out, placeholder, replacement, REWRITE_BUF_LEN);
    out
}

/// Length-preserving C-string patch, the deferred half of the rewrite.
///
/// Every occurrence of `placeholder` is treated as the head of a
/// NUL-terminated string. The region from the match start to the
/// terminating NUL is rewritten as `replacement` + original suffix, padded
/// with NUL bytes back to the original length, so alignment and total file
/// size are preserved.
///
/// Returns the patched bytes and the number of strings patched. The output
/// length always equals the input length; callers must have verified
/// `replacement.len() <= placeholder.len()` beforehand.
pub fn patch_cstring_bytes(
    data: &[u8],
    placeholder: &[u8],
    replacement: &[u8],
) -> (Vec<u8>, usize) {
    debug_assert!(replacement.len() <= placeholder.len());

    let finder = memmem::Finder::new(placeholder);
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    let mut patched = 0usize;

    while let Some(at) = finder.find(rest) {
        // Locate the end of the C string: the first NUL after the match,
        // or end-of-data for strings that run off the end.
        let end = rest[at + placeholder.len()..]
            .iter()
            .position(|&b| b == 0)
            .map_or(rest.len(), |off| at + placeholder.len() + off);
        let len = end - at;
        let suffix = &rest[at + placeholder.len()..end];

        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(&replacement[..len.min(replacement.len())]);
        out.extend_from_slice(&suffix[..len.saturating_sub(replacement.len()).min(suffix.len())]);
        // NUL padding restores the original region length.
        out.resize(out.len() + (len - len.min(replacement.len() + suffix.len())), 0);
        rest = &rest[end..];
        patched += 1;
    }
    out.extend_from_slice(rest);
    (out, patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(input: &[u8], from: &[u8], to: &[u8], capacity: usize) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let n = rewrite_text_buffered(input, &mut out, from, to, capacity).unwrap();
        (out, n)
    }

    #[test]
    fn test_simple_replacement() {
        let (out, n) = rewrite(b"export PREFIX=/opt/env\n", b"/opt/env", b"/srv/app", 64);
        assert_eq!(out, b"export PREFIX=/srv/app\n");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_replacement_changes_length() {
        let (out, n) = rewrite(
            b"/opt/env/bin:/opt/env/lib",
            b"/opt/env",
            b"/a/much/longer/destination",
            64,
        );
        assert_eq!(
            out,
            b"/a/much/longer/destination/bin:/a/much/longer/destination/lib"
        );
        assert_eq!(n, 2);
    }

    #[test]
    fn test_boundary_straddling_match() {
        // A 16-byte window over input where the match crosses every
        // possible chunk boundary.
        let input = b"aaaaaaaaaaaa/opt/envbbbbbbbbbbbb";
        for cap in 16..24 {
            let (out, n) = rewrite(input, b"/opt/env", b"/x", cap);
            assert_eq!(out, b"aaaaaaaaaaaa/xbbbbbbbbbbbb", "capacity {cap}");
            assert_eq!(n, 1);
        }
    }

    #[test]
    fn test_adjacent_matches() {
        let (out, n) = rewrite(b"/opt/env/opt/env", b"/opt/env", b"/y", 16);
        assert_eq!(out, b"/y/y");
        assert_eq!(n, 2);
    }

    #[test]
    fn test_no_match_passthrough() {
        let input: Vec<u8> = (0u32..10_000).map(|i| (i % 251) as u8).collect();
        let (out, n) = rewrite(&input, b"/opt/env", b"/x", 128);
        assert_eq!(out, input);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_crlf_preserved() {
        let (out, _) = rewrite(b"set PATH=/opt/env\r\n", b"/opt/env", b"/srv", 64);
        assert_eq!(out, b"set PATH=/srv\r\n");
    }

    #[test]
    fn test_cstring_patch_preserves_length() {
        let mut data = Vec::new();
        data.extend_from_slice(b"\x7fELF....");
        data.extend_from_slice(b"/opt/env_build/lib/libfoo.so\0\0\0\0");
        data.extend_from_slice(b"trailing");
        let (out, patched) = patch_cstring_bytes(&data, b"/opt/env_build", b"/srv/app");
        assert_eq!(out.len(), data.len());
        assert_eq!(patched, 1);
        let want: &[u8] = b"/srv/app/lib/libfoo.so\0";
        let at = memmem::find(&out, want).unwrap();
        // The shortened string is NUL-padded back to the original region.
        assert_eq!(at, 8);
        assert_eq!(&out[out.len() - 8..], b"trailing");
    }

    #[test]
    fn test_cstring_patch_multiple_strings() {
        let data = b"/p/env/a\0xx/p/env/b\0".to_vec();
        let (out, patched) = patch_cstring_bytes(&data, b"/p/env", b"/q");
        assert_eq!(patched, 2);
        assert_eq!(out.len(), data.len());
        assert_eq!(&out[..], b"/q/a\0\0\0\0\0xx/q/b\0\0\0\0\0");
    }

    #[test]
    fn test_cstring_patch_equal_length() {
        let data = b"ab/p/env/lib\0cd".to_vec();
        let (out, patched) = patch_cstring_bytes(&data, b"/p/env", b"/q/env");
        assert_eq!(patched, 1);
        assert_eq!(&out[..], b"ab/q/env/lib\0cd");
    }
}
