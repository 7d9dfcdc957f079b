//! Fallback decoding for bytes the primary disassembler cannot decode.
//!
//! The adapter asks the reference decoder about the failing window. There are
//! three possibilities:
//!
//! 1. the reference decoder accepts an instruction at offset 0. The primary
//!    decoder simply does not know this opcode;
//! 2. it rejects offset 0 but accepts a later offset (a "troll" hit). Most
//!    likely the primary decoder got the length of the previous instruction
//!    wrong and is now out of sync;
//! 3. nothing in the window decodes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::report::{ReportGuard, Reporter};
use crate::stats::Statistics;
use crate::{
    Address, AuditError, FallbackResult, Insn, RawBuffer, ReferenceDecoder, UnknownInsnHandler,
};

/// Consecutive unmatched windows tolerated before the parse is aborted.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 20;

/// Classification of one fallback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Valid instruction at offset 0
    ValidAtStart { length: usize },
    /// First valid instruction found `skip` bytes in
    ValidAfterSkip { skip: usize, length: usize },
    /// Trolling found nothing
    NoMatch,
}

/// Which outcomes are handed back as placeholder instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixPolicy {
    pub fix_valid: bool,
    pub fix_troll: bool,
}

impl FixPolicy {
    /// `--no-fix`
    pub const NONE: FixPolicy = FixPolicy {
        fix_valid: false,
        fix_troll: false,
    };

    /// `--fix`
    pub const VALID: FixPolicy = FixPolicy {
        fix_valid: true,
        fix_troll: false,
    };

    /// `--fix-all`
    pub const ALL: FixPolicy = FixPolicy {
        fix_valid: true,
        fix_troll: true,
    };
}

/// Whether fallback invocations are being tallied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Initial CFG discovery: every invocation is counted and reported
    Counting,
    /// Re-derivation of already discovered blocks: nothing is recorded
    Replay,
}

/// Search `bytes` for the first offset the reference decoder accepts.
///
/// Offset 0 is tried first, then `1..len` in increasing order. The lowest
/// offset that decodes wins, regardless of the length found there.
pub fn troll_search(reference: &dyn ReferenceDecoder, bytes: &[u8]) -> DecodeOutcome {
    if let Ok(length) = reference.decode_len(bytes) {
        return DecodeOutcome::ValidAtStart { length };
    }

    for skip in 1..bytes.len() {
        if let Ok(length) = reference.decode_len(&bytes[skip..]) {
            return DecodeOutcome::ValidAfterSkip { skip, length };
        }
    }

    DecodeOutcome::NoMatch
}

/// [`UnknownInsnHandler`] backed by a reference decoder.
pub struct FallbackAdapter {
    reference: Arc<dyn ReferenceDecoder>,
    policy: FixPolicy,
    counting: AtomicBool,
    consecutive_failures: AtomicU32,
    stats: Arc<Statistics>,
    reporter: Arc<Reporter>,
}

impl FallbackAdapter {
    /// New adapter, starting in the counting phase.
    pub fn new(
        reference: Arc<dyn ReferenceDecoder>,
        policy: FixPolicy,
        stats: Arc<Statistics>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            reference,
            policy,
            counting: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            stats,
            reporter,
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.counting.store(phase == Phase::Counting, Ordering::SeqCst);
    }

    pub fn phase(&self) -> Phase {
        if self.counting.load(Ordering::SeqCst) {
            Phase::Counting
        } else {
            Phase::Replay
        }
    }

    /// Classify `buffer` (taken at `addr`) and decide what to return.
    pub fn decode_fallback(
        &self,
        addr: Address,
        buffer: &RawBuffer,
    ) -> Result<FallbackResult, AuditError> {
        let bytes = buffer.as_slice();
        let outcome = troll_search(self.reference.as_ref(), bytes);

        let result = match outcome {
            DecodeOutcome::ValidAtStart { length } if self.policy.fix_valid => {
                FallbackResult::Placeholder(Insn::placeholder(addr, &bytes[..length.min(bytes.len())]))
            }
            // Cover only the skipped bytes so the next decode lands on the
            // instruction the reference decoder found.
            DecodeOutcome::ValidAfterSkip { skip, .. } if self.policy.fix_troll => {
                FallbackResult::Placeholder(Insn::placeholder(addr, &bytes[..skip]))
            }
            _ => FallbackResult::Failure,
        };

        let counting = self.phase() == Phase::Counting;
        let failures = self.reporter.critical(|out| {
            let failures = if outcome == DecodeOutcome::NoMatch {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                0
            };

            // Splitting blocks into instructions calls back in here again,
            // only the discovery pass is tallied.
            if counting {
                self.describe(out, addr, bytes, &outcome);
                self.stats.record_unknown(&outcome);
            }
            failures
        });

        if failures > MAX_CONSECUTIVE_FAILURES {
            log::error!("{failures} unmatched unknown instructions in a row, last at {addr:#x}");
            return Err(AuditError::RunawayFailures(failures));
        }

        Ok(result)
    }

    fn describe(&self, out: &mut ReportGuard<'_>, addr: Address, bytes: &[u8], outcome: &DecodeOutcome) {
        if out.is_quiet() {
            return;
        }

        let hex: String = bytes.iter().map(|b| format!(" {b:02x}")).collect();
        match *outcome {
            DecodeOutcome::ValidAtStart { length } => out.emit(format_args!(
                "unknown at 0x{addr:x}: {hex}  valid: {length}{}",
                fix_tag(self.policy.fix_valid)
            )),
            DecodeOutcome::ValidAfterSkip { skip, length } => out.emit(format_args!(
                "unknown at 0x{addr:x}: {hex}  troll: {skip}  len: {length}{}",
                fix_tag(self.policy.fix_troll)
            )),
            DecodeOutcome::NoMatch => out.emit(format_args!("unknown at 0x{addr:x}: {hex}  error")),
        }
    }
}

fn fix_tag(enabled: bool) -> &'static str {
    if enabled {
        "  (fix)"
    } else {
        ""
    }
}

impl UnknownInsnHandler for FallbackAdapter {
    fn on_unknown(&self, addr: Address, buffer: &RawBuffer) -> Result<FallbackResult, AuditError> {
        self.decode_fallback(addr, buffer)
    }
}
