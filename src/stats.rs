//! Process-wide finding counters and the final summary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::check::BlockVerdict;
use crate::fallback::DecodeOutcome;
use crate::gaps::GapBucket;

#[derive(Debug, Default)]
struct Tally {
    count: AtomicU64,
    bytes: AtomicU64,
}

impl Tally {
    fn add(&self, bytes: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn read(&self) -> SizeTally {
        SizeTally {
            count: self.count.load(Ordering::Relaxed),
            size: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Counters fed by the fallback adapter, block checker and gap scanner.
///
/// Increments may race freely; [`Statistics::summary`] is only meaningful
/// once every phase that writes here has finished.
#[derive(Debug, Default)]
pub struct Statistics {
    funcs: AtomicU64,
    blocks: AtomicU64,
    instns: AtomicU64,
    bytes: AtomicU64,

    unknown: AtomicU64,
    unknown_valid: AtomicU64,
    unknown_troll: AtomicU64,
    unknown_error: AtomicU64,

    bad_length: AtomicU64,
    align_errors: AtomicU64,
    length_errors: AtomicU64,

    gaps: Tally,
    gap_buckets: [Tally; 4],
    overlaps: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_unknown(&self, outcome: &DecodeOutcome) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DecodeOutcome::ValidAtStart { .. } => &self.unknown_valid,
            DecodeOutcome::ValidAfterSkip { .. } => &self.unknown_troll,
            DecodeOutcome::NoMatch => &self.unknown_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_function(&self, num_blocks: usize) {
        self.funcs.fetch_add(1, Ordering::Relaxed);
        self.blocks.fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    /// One block went through the checker.
    pub fn record_block(&self, num_instns: usize, size: u64, verdict: &BlockVerdict) {
        self.instns.fetch_add(num_instns as u64, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);

        let counter = match verdict {
            BlockVerdict::Consistent => return,
            BlockVerdict::AlignmentError { .. } => &self.align_errors,
            BlockVerdict::LengthOverrun { .. } => &self.length_errors,
            BlockVerdict::BadLength { .. } => &self.bad_length,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self, size: u64) {
        self.gaps.add(size);
        self.gap_buckets[GapBucket::for_size(size).index()].add(size);
    }

    pub fn record_overlap(&self) {
        self.overlaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    pub fn summary(&self) -> Summary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        Summary {
            funcs: load(&self.funcs),
            blocks: load(&self.blocks),
            instns: load(&self.instns),
            bytes: load(&self.bytes),
            unknown: UnknownCounts {
                total: load(&self.unknown),
                valid: load(&self.unknown_valid),
                troll: load(&self.unknown_troll),
                error: load(&self.unknown_error),
            },
            bad_length: load(&self.bad_length),
            align_errors: load(&self.align_errors),
            length_errors: load(&self.length_errors),
            gaps: GapCounts {
                total: self.gaps.read(),
                under_16: self.gap_buckets[GapBucket::Under16.index()].read(),
                under_64: self.gap_buckets[GapBucket::Under64.index()].read(),
                under_256: self.gap_buckets[GapBucket::Under256.index()].read(),
                other: self.gap_buckets[GapBucket::Other.index()].read(),
            },
            overlaps: load(&self.overlaps),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeTally {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnknownCounts {
    pub total: u64,
    pub valid: u64,
    pub troll: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GapCounts {
    pub total: SizeTally,
    pub under_16: SizeTally,
    pub under_64: SizeTally,
    pub under_256: SizeTally,
    pub other: SizeTally,
}

/// Final totals of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub funcs: u64,
    pub blocks: u64,
    pub instns: u64,
    pub bytes: u64,
    pub unknown: UnknownCounts,
    pub bad_length: u64,
    pub align_errors: u64,
    pub length_errors: u64,
    pub gaps: GapCounts,
    pub overlaps: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "funcs: {}  blocks: {}  instns: {}  bytes: {}",
            self.funcs, self.blocks, self.instns, self.bytes
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "unknown: {}  valid: {}  troll: {}  error: {}",
            self.unknown.total, self.unknown.valid, self.unknown.troll, self.unknown.error
        )?;
        writeln!(f)?;
        writeln!(f, "num bad length: {}", self.bad_length)?;
        if self.align_errors > 0 || self.length_errors > 0 {
            writeln!(
                f,
                "num align errors: {}   num length errors: {}",
                self.align_errors, self.length_errors
            )?;
        }
        writeln!(f)?;

        let g = &self.gaps;
        writeln!(f, "num gaps: {:8}    size: {:10}", g.total.count, g.total.size)?;
        writeln!(f, "under 16: {:8}    size: {:10}", g.under_16.count, g.under_16.size)?;
        writeln!(f, "under 64: {:8}    size: {:10}", g.under_64.count, g.under_64.size)?;
        writeln!(f, "under 256: {:7}    size: {:10}", g.under_256.count, g.under_256.size)?;
        writeln!(f, "other:    {:8}    size: {:10}", g.other.count, g.other.size)?;
        write!(f, "num blocks overlap:  {}", self.overlaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_outcomes() {
        let stats = Statistics::new();
        stats.record_unknown(&DecodeOutcome::ValidAtStart { length: 3 });
        stats.record_unknown(&DecodeOutcome::ValidAfterSkip { skip: 1, length: 2 });
        stats.record_unknown(&DecodeOutcome::NoMatch);
        stats.record_unknown(&DecodeOutcome::NoMatch);

        let s = stats.summary();
        assert_eq!(
            s.unknown,
            UnknownCounts {
                total: 4,
                valid: 1,
                troll: 1,
                error: 2
            }
        );
    }

    #[test]
    fn test_gap_totals() {
        let stats = Statistics::new();
        for size in [4, 15, 16, 100, 256, 1000] {
            stats.record_gap(size);
        }

        let g = stats.summary().gaps;
        assert_eq!(g.total, SizeTally { count: 6, size: 1391 });
        assert_eq!(g.under_16, SizeTally { count: 2, size: 19 });
        assert_eq!(g.under_64, SizeTally { count: 1, size: 16 });
        assert_eq!(g.under_256, SizeTally { count: 1, size: 100 });
        assert_eq!(g.other, SizeTally { count: 2, size: 1256 });
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let stats = Statistics::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        stats.record_unknown(&DecodeOutcome::NoMatch);
                        stats.record_overlap();
                    }
                });
            }
        });

        let s = stats.summary();
        assert_eq!(s.unknown.total, 8000);
        assert_eq!(s.unknown.error, 8000);
        assert_eq!(s.overlaps, 8000);
    }

    #[test]
    fn test_summary_text_layout() {
        let stats = Statistics::new();
        stats.record_function(2);
        stats.record_block(4, 16, &BlockVerdict::Consistent);
        stats.record_gap(16);

        let text = stats.summary().to_string();
        assert!(text.starts_with("funcs: 1  blocks: 2  instns: 4  bytes: 16\n"));
        assert!(text.contains("num bad length: 0\n"));
        assert!(!text.contains("num align errors"));
        assert!(text.contains("under 64:        1    size:         16\n"));
        assert!(text.ends_with("num blocks overlap:  0"));
    }

    #[test]
    fn test_structural_errors_line_appears() {
        let stats = Statistics::new();
        stats.record_block(
            1,
            4,
            &BlockVerdict::AlignmentError {
                offset: 1,
                expected: 0x1001,
                actual: 0x1000,
            },
        );

        let s = stats.summary();
        assert_eq!(s.align_errors, 1);
        assert!(s.to_string().contains("num align errors: 1   num length errors: 0"));
    }
}
