//! The packing pipeline: one driver, N workers, one sink writer.
//!
//! The driver feeds classified records into a bounded queue; workers open
//! files, apply the text rewrite, and hand back payloads; the driver drains
//! payloads *in submission order* through a reorder buffer and writes them
//! to the sink. Workers never touch the sink and never coordinate with
//! each other, so archive layout is deterministic regardless of completion
//! order, and memory stays bounded by the queue depth.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{PackError, Result};
use crate::reporter::Reporter;
use crate::rewrite::rewrite_text;
use crate::sink::Sink;
use crate::walker::{FileKind, FileRecord, PrefixAction};

/// Files larger than this are spooled or streamed instead of buffered.
const SPOOL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Shared context for one streaming run.
pub struct StreamContext<'a> {
    /// Effective destination prefix written into text rewrites.
    pub dest_prefix: String,
    /// Rewrite-from-manifest-placeholder override is active.
    pub force_cross_prefix: bool,
    /// Zero mtimes before they reach the sink.
    pub reproducible: bool,
    /// Directory prepended to every member path.
    pub arcroot: Option<PathBuf>,
    /// Worker count; 1 runs everything on the driver thread.
    pub workers: usize,
    /// Cooperative cancel flag, polled between items.
    pub cancel: &'a AtomicBool,
    /// Progress sink, written only by the driver.
    pub reporter: &'a dyn Reporter,
}

impl std::fmt::Debug for StreamContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("dest_prefix", &self.dest_prefix)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Totals reported after a successful stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    /// Archive members written, directories included.
    pub members: usize,
    /// Uncompressed content bytes.
    pub bytes: u64,
}

/// What a worker produced for one record.
enum Payload {
    Directory,
    Symlink,
    /// Content in memory (small files and all rewrites).
    Inline(Vec<u8>),
    /// Rewritten content spooled to an anonymous temp file.
    Spooled(File, u64),
    /// Verbatim large file, streamed straight from disk at write time.
    DiskRaw(PathBuf, u64),
}

/// Open, transform, and package one record's content.
///
/// Runs on a worker thread (or inline when serial). Everything returned is
/// ready for the sink without further file I/O except `DiskRaw`.
fn produce(record: &FileRecord, ctx_dest: &str, force_cross_prefix: bool) -> Result<Payload> {
    match record.file_kind {
        FileKind::Directory => Ok(Payload::Directory),
        FileKind::Symlink => Ok(Payload::Symlink),
        FileKind::Regular => {
            if let Some(content) = &record.content {
                return Ok(Payload::Inline(content.clone()));
            }
            let disk_path = record
                .disk_path
                .as_ref()
                .ok_or_else(|| PackError::config("record carries neither content nor a path"))?;

            let deferred_text = force_cross_prefix
                && matches!(
                    &record.prefix_action,
                    PrefixAction::Text { fallback: Some(_), .. }
                );

            match &record.prefix_action {
                PrefixAction::Text {
                    placeholder,
                    fallback,
                } if !deferred_text => {
                    let file = open_worker(disk_path)?;
                    let payload = rewrite_into_payload(
                        file,
                        record,
                        disk_path,
                        placeholder.as_bytes(),
                        ctx_dest.as_bytes(),
                    )?;
                    // A managed text file that no longer contains the
                    // source prefix but still carries its build placeholder
                    // was installed under some other prefix.
                    if payload.1 == 0 {
                        if let Some(fallback) = fallback {
                            if payload_contains(&payload.0, fallback.as_bytes())? {
                                return Err(PackError::CrossPrefixInstall {
                                    path: record.relative_path.clone(),
                                    recorded: fallback.clone(),
                                    expected: placeholder.clone(),
                                });
                            }
                        }
                    }
                    Ok(payload.0)
                }
                _ => {
                    // Verbatim: binary rewrites are deferred to the unpack
                    // runner, everything else simply has no prefix inside.
                    if record.size > SPOOL_THRESHOLD {
                        Ok(Payload::DiskRaw(disk_path.clone(), record.size))
                    } else {
                        let mut file = open_worker(disk_path)?;
                        let mut buf = Vec::with_capacity(record.size as usize);
                        file.read_to_end(&mut buf)
                            .map_err(|e| worker_err(disk_path, e))?;
                        trace_digest(record, &buf);
                        Ok(Payload::Inline(buf))
                    }
                }
            }
        }
    }
}

fn open_worker(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| worker_err(path, e))
}

fn worker_err(path: &Path, source: io::Error) -> PackError {
    PackError::WorkerFailure {
        path: path.to_path_buf(),
        source,
    }
}

fn trace_digest(record: &FileRecord, data: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let digest = Sha256::digest(data);
        tracing::trace!(
            path = %record.relative_path.display(),
            sha256 = %hex::encode(digest),
            "content hashed"
        );
    }
}

/// Stream a text rewrite into memory or, for large results, a spool file.
/// Returns the payload and the replacement count.
fn rewrite_into_payload(
    file: File,
    record: &FileRecord,
    disk_path: &Path,
    placeholder: &[u8],
    replacement: &[u8],
) -> Result<(Payload, usize)> {
    if record.size > SPOOL_THRESHOLD {
        let mut spool = tempfile::tempfile().map_err(|e| worker_err(disk_path, e))?;
        let replaced = rewrite_text(file, &mut spool, placeholder, replacement)
            .map_err(|e| worker_err(disk_path, e))?;
        let size = spool
            .seek(SeekFrom::End(0))
            .and_then(|len| spool.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(|e| worker_err(disk_path, e))?;
        Ok((Payload::Spooled(spool, size), replaced))
    } else {
        let mut buf = Vec::with_capacity(record.size as usize);
        let replaced = rewrite_text(file, &mut buf, placeholder, replacement)
            .map_err(|e| worker_err(disk_path, e))?;
        trace_digest(record, &buf);
        Ok((Payload::Inline(buf), replaced))
    }
}

/// Check a payload's content for a byte pattern (cross-prefix detection).
fn payload_contains(payload: &Payload, needle: &[u8]) -> Result<bool> {
    match payload {
        Payload::Inline(buf) => Ok(crate::prefix::contains_placeholder(buf, needle)),
        Payload::Spooled(file, _) => {
            // The clone shares the spool's cursor; rewind it again after
            // scanning so the sink reads from the start.
            let mut clone = file.try_clone()?;
            clone.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::new();
            clone.read_to_end(&mut buf)?;
            clone.seek(SeekFrom::Start(0))?;
            Ok(crate::prefix::contains_placeholder(&buf, needle))
        }
        _ => Ok(false),
    }
}

/// Write one finished payload to the sink.
fn write_payload(
    sink: &mut dyn Sink,
    ctx: &StreamContext<'_>,
    record: &FileRecord,
    payload: Payload,
) -> Result<u64> {
    let arcname = match &ctx.arcroot {
        Some(root) => root.join(&record.relative_path),
        None => record.relative_path.clone(),
    };
    let mtime = if ctx.reproducible { 0 } else { record.mtime };

    match payload {
        Payload::Directory => {
            sink.add_directory(&arcname, record.mode, mtime)?;
            Ok(0)
        }
        Payload::Symlink => {
            let target = record
                .link_target
                .as_ref()
                .ok_or_else(|| PackError::config("symlink record without a target"))?;
            sink.add_symlink(&arcname, record.mode, mtime, target)?;
            Ok(0)
        }
        Payload::Inline(buf) => {
            let size = buf.len() as u64;
            sink.add_regular(&arcname, record.mode, mtime, size, &mut Cursor::new(buf))?;
            Ok(size)
        }
        Payload::Spooled(mut file, size) => {
            sink.add_regular(&arcname, record.mode, mtime, size, &mut file)?;
            Ok(size)
        }
        Payload::DiskRaw(path, size) => {
            let mut file = File::open(&path).map_err(|e| worker_err(&path, e))?;
            sink.add_regular(&arcname, record.mode, mtime, size, &mut file)?;
            Ok(size)
        }
    }
}

/// Stream `records` through the worker pool into `sink`, in order.
///
/// On success the sink is finalized; on any error (including cancellation)
/// it is aborted and the partial output removed.
///
/// # Errors
///
/// The first error observed, after workers are joined and the sink
/// aborted: [`PackError::Cancelled`], [`PackError::WorkerFailure`],
/// [`PackError::CrossPrefixInstall`], or sink I/O errors.
pub fn stream_records(
    records: Vec<FileRecord>,
    mut sink: Box<dyn Sink>,
    ctx: &StreamContext<'_>,
) -> Result<StreamStats> {
    let total = records.len();
    let outcome = if ctx.workers <= 1 {
        stream_serial(records, sink.as_mut(), ctx)
    } else {
        stream_parallel(records, sink.as_mut(), ctx)
    };

    match outcome {
        Ok(stats) => {
            sink.finalize()?;
            tracing::info!(members = stats.members, total, "stream complete");
            Ok(stats)
        }
        Err(e) => {
            sink.abort();
            Err(e)
        }
    }
}

fn check_cancel(ctx: &StreamContext<'_>) -> Result<()> {
    if ctx.cancel.load(Ordering::Relaxed) {
        return Err(PackError::Cancelled);
    }
    Ok(())
}

fn stream_serial(
    records: Vec<FileRecord>,
    sink: &mut dyn Sink,
    ctx: &StreamContext<'_>,
) -> Result<StreamStats> {
    let total = records.len();
    let mut stats = StreamStats::default();
    for (index, record) in records.into_iter().enumerate() {
        check_cancel(ctx)?;
        let payload = produce(&record, &ctx.dest_prefix, ctx.force_cross_prefix)?;
        stats.bytes += write_payload(sink, ctx, &record, payload)?;
        stats.members += 1;
        ctx.reporter
            .file_done(index + 1, total, &record.relative_path.display().to_string());
    }
    Ok(stats)
}

fn stream_parallel(
    records: Vec<FileRecord>,
    sink: &mut dyn Sink,
    ctx: &StreamContext<'_>,
) -> Result<StreamStats> {
    let total = records.len();
    let queue_depth = ctx.workers * 2;
    let (work_tx, work_rx) = mpsc::sync_channel::<(usize, FileRecord)>(queue_depth);
    let (result_tx, result_rx) =
        mpsc::sync_channel::<(usize, FileRecord, Result<Payload>)>(queue_depth);
    // Admission permits: one per record allowed in flight. The driver
    // returns a permit after each write, so at most `queue_depth + workers`
    // records exist between queue, workers, and the reorder buffer.
    let (permit_tx, permit_rx) = mpsc::sync_channel::<()>(queue_depth + ctx.workers);
    for _ in 0..queue_depth + ctx.workers {
        let _ = permit_tx.try_send(());
    }
    let work_rx = Mutex::new(work_rx);

    std::thread::scope(|scope| {
        // Feeder: pushes records into the bounded queue; a missing permit
        // or a full queue suspends it, a dropped receiver stops it.
        scope.spawn(move || {
            for item in records.into_iter().enumerate() {
                if ctx.cancel.load(Ordering::Relaxed) {
                    break;
                }
                if permit_rx.recv().is_err() {
                    break;
                }
                if work_tx.send(item).is_err() {
                    break;
                }
            }
            drop(work_tx);
        });

        // Workers: pull, transform, push. They never see the sink.
        for _ in 0..ctx.workers {
            let result_tx = result_tx.clone();
            let work_rx = &work_rx;
            scope.spawn(move || {
                loop {
                    let Some((seq, record)) = work_rx
                        .lock()
                        .ok()
                        .and_then(|rx| rx.recv().ok())
                    else {
                        break;
                    };
                    if ctx.cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let payload = produce(&record, &ctx.dest_prefix, ctx.force_cross_prefix);
                    if result_tx.send((seq, record, payload)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Driver-as-writer: drain results, reorder, write. The pending map
        // is bounded by what the channels admit (queue depth + workers).
        let mut pending: BTreeMap<usize, (FileRecord, Payload)> = BTreeMap::new();
        let mut next = 0usize;
        let mut stats = StreamStats::default();
        let mut first_error: Option<PackError> = None;

        'drain: while next < total {
            let Ok((seq, record, payload)) = result_rx.recv() else {
                // All workers gone before every record arrived.
                if first_error.is_none() {
                    first_error = Some(if ctx.cancel.load(Ordering::Relaxed) {
                        PackError::Cancelled
                    } else {
                        PackError::Io(io::Error::other("worker pool stopped early"))
                    });
                }
                break;
            };
            match payload {
                Ok(payload) => {
                    pending.insert(seq, (record, payload));
                }
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
            while let Some((record, payload)) = pending.remove(&next) {
                if let Err(e) = check_cancel(ctx) {
                    first_error = Some(e);
                    break 'drain;
                }
                match write_payload(sink, ctx, &record, payload) {
                    Ok(bytes) => {
                        stats.bytes += bytes;
                        stats.members += 1;
                        next += 1;
                        let _ = permit_tx.try_send(());
                        ctx.reporter.file_done(
                            next,
                            total,
                            &record.relative_path.display().to_string(),
                        );
                    }
                    Err(e) => {
                        first_error = Some(e);
                        break 'drain;
                    }
                }
            }
        }

        if let Some(e) = first_error {
            // Unblock the feeder and workers, then let scope join them.
            ctx.cancel.store(true, Ordering::Relaxed);
            drop(permit_tx);
            drop(result_rx);
            return Err(e);
        }
        Ok(stats)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use crate::sink::SinkOptions;
    use crate::sink::{TarCompression, TarSink};
    use crate::walker::SourceKind;
    use std::io::Write;

    fn record(rel: &str, disk: Option<PathBuf>, size: u64, action: PrefixAction) -> FileRecord {
        FileRecord {
            relative_path: PathBuf::from(rel),
            disk_path: disk,
            content: None,
            source_kind: SourceKind::Unmanaged,
            file_kind: FileKind::Regular,
            mode: 0o644,
            mtime: 1_700_000_000,
            size,
            prefix_action: action,
            link_target: None,
        }
    }

    fn ctx<'a>(cancel: &'a AtomicBool, workers: usize) -> StreamContext<'a> {
        StreamContext {
            dest_prefix: "/srv/app".to_string(),
            force_cross_prefix: false,
            reproducible: true,
            arcroot: None,
            workers,
            cancel,
            reporter: &NullReporter,
        }
    }

    fn read_tar(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    fn sink_options() -> SinkOptions {
        SinkOptions {
            compress_level: 0,
            reproducible: true,
            squashfs_codec: None,
            parcel: None,
        }
    }

    #[test]
    fn test_ordered_output_with_many_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut records = Vec::new();
        for i in 0..50 {
            let rel = format!("f{i:03}");
            let path = tmp.path().join(&rel);
            let mut f = File::create(&path).unwrap();
            // Uneven sizes so completion order scrambles.
            let body = vec![b'a' + (i % 26) as u8; 100 + (i as usize % 7) * 5000];
            f.write_all(&body).unwrap();
            records.push(record(&rel, Some(path), body.len() as u64, PrefixAction::None));
        }
        let out = tmp.path().join("out.tar");
        let sink = Box::new(TarSink::create(&out, TarCompression::None, &sink_options()).unwrap());
        let cancel = AtomicBool::new(false);
        let stats = stream_records(records, sink, &ctx(&cancel, 8)).unwrap();
        assert_eq!(stats.members, 50);

        let names: Vec<String> = read_tar(&out).into_iter().map(|(n, _)| n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_text_rewrite_flows_through() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("activate");
        std::fs::write(&path, b"export PREFIX=/opt/env_build\n").unwrap();
        let records = vec![record(
            "activate",
            Some(path),
            29,
            PrefixAction::Text {
                placeholder: "/opt/env_build".to_string(),
                fallback: None,
            },
        )];
        let out = tmp.path().join("out.tar");
        let sink = Box::new(TarSink::create(&out, TarCompression::None, &sink_options()).unwrap());
        let cancel = AtomicBool::new(false);
        stream_records(records, sink, &ctx(&cancel, 1)).unwrap();

        let entries = read_tar(&out);
        assert_eq!(entries[0].1, b"export PREFIX=/srv/app\n");
    }

    #[test]
    fn test_worker_error_aborts_and_removes_output() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![record(
            "ghost",
            Some(tmp.path().join("does-not-exist")),
            10,
            PrefixAction::None,
        )];
        let out = tmp.path().join("out.tar");
        let sink = Box::new(TarSink::create(&out, TarCompression::None, &sink_options()).unwrap());
        let cancel = AtomicBool::new(false);
        let err = stream_records(records, sink, &ctx(&cancel, 4)).unwrap_err();
        assert!(matches!(err, PackError::WorkerFailure { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_cancel_before_start() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let records = vec![record("f", Some(path), 1, PrefixAction::None)];
        let out = tmp.path().join("out.tar");
        let sink = Box::new(TarSink::create(&out, TarCompression::None, &sink_options()).unwrap());
        let cancel = AtomicBool::new(true);
        let err = stream_records(records, sink, &ctx(&cancel, 1)).unwrap_err();
        assert!(matches!(err, PackError::Cancelled));
        assert!(!out.exists());
    }

    #[test]
    fn test_cross_prefix_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("activate");
        std::fs::write(&path, b"export PREFIX=/opt/other_env\n").unwrap();
        let records = vec![record(
            "activate",
            Some(path),
            29,
            PrefixAction::Text {
                placeholder: "/opt/env_build".to_string(),
                fallback: Some("/opt/other_env".to_string()),
            },
        )];
        let out = tmp.path().join("out.tar");
        let sink = Box::new(TarSink::create(&out, TarCompression::None, &sink_options()).unwrap());
        let cancel = AtomicBool::new(false);
        let err = stream_records(records, sink, &ctx(&cancel, 1)).unwrap_err();
        assert!(matches!(err, PackError::CrossPrefixInstall { .. }));
    }
}
