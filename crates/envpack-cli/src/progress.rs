//! Console reporter: plain line output, no terminal takeover.

use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use envpack_core::Reporter;

/// Reporter printing to stderr, with a carriage-return progress line when
/// attached to a terminal.
#[derive(Debug)]
pub struct ConsoleReporter {
    quiet: bool,
    interactive: bool,
    last_percent: AtomicUsize,
}

impl ConsoleReporter {
    /// Create a reporter; `quiet` suppresses everything but warnings.
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            interactive: std::io::stderr().is_terminal(),
            last_percent: AtomicUsize::new(usize::MAX),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        if !self.quiet {
            eprintln!("[{title}]");
        }
    }

    fn file_done(&self, index: usize, total: usize, _arcname: &str) {
        if self.quiet || !self.interactive || total == 0 {
            return;
        }
        let percent = index * 100 / total;
        // Redraw only on whole-percent changes to keep stderr quiet.
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            let mut err = std::io::stderr().lock();
            let _ = write!(err, "\r  {index}/{total} ({percent:3}%)");
            if index == total {
                let _ = writeln!(err);
            }
        }
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn summary(&self, files: usize, bytes: u64, elapsed_secs: f64) {
        if self.quiet {
            return;
        }
        let mib = bytes as f64 / (1024.0 * 1024.0);
        eprintln!("Wrote {files} member(s), {mib:.1} MiB in {elapsed_secs:.1}s");
    }
}
