//! Reporter trait for dependency injection
//!
//! This trait allows core logic to report progress and status without
//! being coupled to a specific terminal implementation. It is passed to
//! the driver by reference and written only by the driver thread.

/// Progress and status sink for a pack run.
pub trait Reporter: Send + Sync {
    /// A new phase has started (e.g. "Analyzing", "Packing").
    fn section(&self, title: &str);

    /// One archive member has been written. `index` counts from 1 up to
    /// `total`.
    fn file_done(&self, index: usize, total: usize, arcname: &str);

    /// A downgraded error that did not stop the run.
    fn warning(&self, msg: &str);

    /// Final summary after the sink was finalized.
    fn summary(&self, files: usize, bytes: u64, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn file_done(&self, index: usize, total: usize, arcname: &str) {
        (**self).file_done(index, total, arcname);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, files: usize, bytes: u64, elapsed_secs: f64) {
        (**self).summary(files, bytes, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., library use, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn file_done(&self, _: usize, _: usize, _: &str) {}
    fn warning(&self, _: &str) {}
    fn summary(&self, _: usize, _: u64, _: f64) {}
}
