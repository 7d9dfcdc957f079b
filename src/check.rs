//! Per-block length check against the reference decoder.
//!
//! Each block is rebuilt byte by byte from its instruction list, then every
//! instruction is decoded again from the rebuilt copy. Only the first problem
//! in a block is reported; after that the block is considered corrupted.

use crate::report::Reporter;
use crate::stats::Statistics;
use crate::{Address, Block, Insn, ReferenceDecoder};

/// Extra scratch space past the block end, enough for one maximal
/// instruction when the reference decoder reads further than the primary did.
pub const SCRATCH_MARGIN: usize = 20;

/// Bytes handed to the reference decoder at each instruction.
pub const LOOKAHEAD: usize = 16;

/// Result of checking one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    Consistent,
    /// Instruction does not start where the previous one ended
    AlignmentError {
        offset: u64,
        expected: Address,
        actual: Address,
    },
    /// Instruction runs past the end of the block
    LengthOverrun {
        offset: u64,
        declared_len: usize,
        block_size: u64,
    },
    /// Reference decoder disagrees on the length (`ref_len` is None when it
    /// could not decode at all)
    BadLength {
        addr: Address,
        dyn_len: usize,
        ref_len: Option<usize>,
        window: Vec<u8>,
    },
}

impl BlockVerdict {
    pub fn is_consistent(&self) -> bool {
        matches!(self, BlockVerdict::Consistent)
    }
}

/// Compares the primary disassembler's instruction lengths with a reference decoder.
pub struct BlockChecker<'a> {
    reference: &'a dyn ReferenceDecoder,
}

impl<'a> BlockChecker<'a> {
    pub fn new(reference: &'a dyn ReferenceDecoder) -> Self {
        Self { reference }
    }

    /// Check one block given the instructions the primary disassembler
    /// reports for it, in address order.
    pub fn check(&self, block: &Block, insns: &[Insn]) -> BlockVerdict {
        let block_size = block.size();
        let mut scratch = vec![0u8; block_size as usize + SCRATCH_MARGIN];

        // rebuild the block, instructions must tile it exactly
        let mut pos: u64 = 0;
        for insn in insns {
            let expected = block.start + pos;
            if insn.addr != expected {
                return BlockVerdict::AlignmentError {
                    offset: pos,
                    expected,
                    actual: insn.addr,
                };
            }

            let len = insn.size as u64;
            if pos + len > block_size {
                return BlockVerdict::LengthOverrun {
                    offset: pos,
                    declared_len: insn.size as usize,
                    block_size,
                };
            }

            let at = pos as usize;
            scratch[at..at + insn.size as usize].copy_from_slice(insn.bytes());
            pos += len;
        }

        for insn in insns {
            let at = (insn.addr - block.start) as usize;
            let window = &scratch[at..(at + LOOKAHEAD).min(scratch.len())];
            let dyn_len = insn.size as usize;

            match self.reference.decode_len(window) {
                Ok(len) if len == dyn_len => {}
                other => {
                    return BlockVerdict::BadLength {
                        addr: insn.addr,
                        dyn_len,
                        ref_len: other.ok(),
                        window: window.to_vec(),
                    }
                }
            }
        }

        BlockVerdict::Consistent
    }
}

/// Tally one checked block and print its diagnostic, if any.
pub fn record(
    block: &Block,
    num_insns: usize,
    verdict: &BlockVerdict,
    stats: &Statistics,
    reporter: &Reporter,
) {
    stats.record_block(num_insns, block.size(), verdict);

    match verdict {
        BlockVerdict::Consistent => {}
        BlockVerdict::AlignmentError { offset, actual, .. } => reporter.emit(format_args!(
            "block error (align): 0x{:x}  offset: 0x{offset:x}  next: 0x{actual:x}",
            block.start
        )),
        BlockVerdict::LengthOverrun {
            offset,
            declared_len,
            block_size,
        } => reporter.emit(format_args!(
            "block error (too long): 0x{:x}  offset: 0x{offset:x}  len: 0x{declared_len:x}  block size: 0x{block_size:x}",
            block.start
        )),
        BlockVerdict::BadLength {
            addr,
            dyn_len,
            ref_len,
            window,
        } => {
            let hex: String = window.iter().map(|b| format!(" {b:02x}")).collect();
            reporter.emit(format_args!(
                "bad length at 0x{addr:x}: {hex}  primary: {dyn_len}  reference: {}",
                ref_len.unwrap_or(0)
            ))
        }
    }
}
