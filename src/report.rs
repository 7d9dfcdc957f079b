//! Line-oriented diagnostic output shared by all phases.

use std::fmt;
use std::io::{self, Write};

use parking_lot::Mutex;

/// Serialized diagnostic sink.
///
/// Per-event lines are dropped in quiet mode; banners always go through.
pub struct Reporter {
    quiet: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

/// Exclusive access to the sink for the duration of one critical section.
pub struct ReportGuard<'a> {
    quiet: bool,
    out: &'a mut Box<dyn Write + Send>,
}

impl ReportGuard<'_> {
    /// Write one per-event line unless quiet.
    pub fn emit(&mut self, args: fmt::Arguments<'_>) {
        if self.quiet {
            return;
        }
        if let Err(e) = writeln!(self.out, "{args}") {
            log::warn!("failed to write diagnostic: {e}");
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

impl Reporter {
    pub fn new(out: Box<dyn Write + Send>, quiet: bool) -> Self {
        Self {
            quiet,
            out: Mutex::new(out),
        }
    }

    /// Report to standard output.
    pub fn stdout(quiet: bool) -> Self {
        Self::new(Box::new(io::stdout()), quiet)
    }

    /// Discard everything.
    pub fn sink() -> Self {
        Self::new(Box::new(io::sink()), true)
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Run `f` while holding the sink lock.
    ///
    /// Anything `f` does (writing lines, bumping counters) is atomic with
    /// respect to other critical sections.
    pub fn critical<R>(&self, f: impl FnOnce(&mut ReportGuard<'_>) -> R) -> R {
        let mut out = self.out.lock();
        let mut guard = ReportGuard {
            quiet: self.quiet,
            out: &mut *out,
        };
        f(&mut guard)
    }

    /// Write one per-event line unless quiet.
    pub fn emit(&self, args: fmt::Arguments<'_>) {
        self.critical(|g| g.emit(args));
    }

    /// Write a line regardless of quiet mode.
    pub fn banner(&self, args: fmt::Arguments<'_>) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{args}").and_then(|_| out.flush()) {
            log::warn!("failed to write diagnostic: {e}");
        }
    }

    pub fn flush(&self) {
        if let Err(e) = self.out.lock().flush() {
            log::warn!("failed to flush diagnostics: {e}");
        }
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").field("quiet", &self.quiet).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuffer;

    #[test]
    fn test_quiet_drops_events_keeps_banners() {
        let buf = SharedBuffer::default();
        let reporter = Reporter::new(Box::new(buf.clone()), true);

        reporter.emit(format_args!("gap: 0x10"));
        reporter.banner(format_args!("phase 3"));

        assert_eq!(buf.lines(), vec!["phase 3"]);
    }

    #[test]
    fn test_lines_do_not_interleave() {
        let buf = SharedBuffer::default();
        let reporter = Reporter::new(Box::new(buf.clone()), false);

        std::thread::scope(|s| {
            for t in 0..8 {
                let reporter = &reporter;
                s.spawn(move || {
                    for i in 0..50 {
                        reporter.critical(|g| {
                            g.emit(format_args!("thread {t} line {i} begin"));
                            g.emit(format_args!("thread {t} line {i} end"));
                        });
                    }
                });
            }
        });

        let lines = buf.lines();
        assert_eq!(lines.len(), 8 * 50 * 2);
        for pair in lines.chunks(2) {
            assert!(pair[0].ends_with("begin"));
            assert_eq!(pair[0].replace("begin", "end"), pair[1]);
        }
    }
}
