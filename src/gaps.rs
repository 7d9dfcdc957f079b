//! Unclaimed regions (gaps) and overlaps between basic blocks.
//!
//! Compilers may place cold regions of one function inside the address range
//! of another, so the scan runs over the union of all blocks, never per
//! function.

use serde::Serialize;

use crate::report::Reporter;
use crate::stats::Statistics;
use crate::{Address, Block};

/// Size class of a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GapBucket {
    Under16,
    Under64,
    Under256,
    Other,
}

impl GapBucket {
    pub fn for_size(size: u64) -> Self {
        match size {
            0..=15 => GapBucket::Under16,
            16..=63 => GapBucket::Under64,
            64..=255 => GapBucket::Under256,
            _ => GapBucket::Other,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GapRecord {
    pub prev_start: Address,
    pub prev_end: Address,
    pub next_start: Address,
    pub size: u64,
    pub bucket: GapBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverlapRecord {
    pub prev_end: Address,
    pub start: Address,
    pub end: Address,
}

/// Relationship between a block and its predecessor in address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayoutFinding {
    Gap(GapRecord),
    Overlap(OverlapRecord),
}

/// Compare each block with its predecessor. `blocks` must be sorted by start.
pub fn scan<'a, I>(blocks: I) -> Vec<LayoutFinding>
where
    I: IntoIterator<Item = &'a Block>,
{
    let mut findings = Vec::new();
    let mut iter = blocks.into_iter();
    let Some(mut prev) = iter.next() else {
        return findings;
    };

    for block in iter {
        debug_assert!(prev.start <= block.start, "blocks must be sorted by start");

        if block.start > prev.end {
            let size = block.start - prev.end;
            findings.push(LayoutFinding::Gap(GapRecord {
                prev_start: prev.start,
                prev_end: prev.end,
                next_start: block.start,
                size,
                bucket: GapBucket::for_size(size),
            }));
        } else if block.start < prev.end {
            findings.push(LayoutFinding::Overlap(OverlapRecord {
                prev_end: prev.end,
                start: block.start,
                end: block.end,
            }));
        }

        prev = block;
    }

    findings
}

/// Tally the findings and print one line for each.
pub fn record(findings: &[LayoutFinding], stats: &Statistics, reporter: &Reporter) {
    for finding in findings {
        match finding {
            LayoutFinding::Gap(g) => {
                stats.record_gap(g.size);
                reporter.emit(format_args!(
                    "gap: prev block: 0x{:x}  end: 0x{:x}  next: 0x{:x}  size: 0x{:x} ({})",
                    g.prev_start, g.prev_end, g.next_start, g.size, g.size
                ));
            }
            LayoutFinding::Overlap(o) => {
                stats.record_overlap();
                reporter.emit(format_args!(
                    "overlap: prev end: 0x{:x}  begin: 0x{:x}  end: 0x{:x}",
                    o.prev_end, o.start, o.end
                ));
            }
        }
    }
}
