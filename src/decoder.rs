//! Primary (Capstone) and reference (iced-x86) x86-64 decoders.

use std::cell::RefCell;
use std::fmt;

use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;
use iced_x86::DecoderOptions;

use crate::{Address, Decoder, Insn, ReferenceDecoder, ReferenceError, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),
}

impl From<DecoderError> for crate::AuditError {
    fn from(e: DecoderError) -> Self {
        crate::AuditError::DecoderError(e.to_string())
    }
}

thread_local! {
    // Capstone handles are not Sync, each worker thread gets its own.
    static CS_POOL: RefCell<Option<Capstone>> = const { RefCell::new(None) };
}

/// Capstone-based primary decoder for x86-64.
#[derive(Debug, Default)]
pub struct CapstoneDecoder;

impl CapstoneDecoder {
    /// Create an x86-64 decoder.
    ///
    /// Builds one handle up front so a broken Capstone install fails here
    /// instead of silently on every worker thread.
    pub fn x86_64() -> Result<Self, DecoderError> {
        Self::build_x86_64()?;
        Ok(CapstoneDecoder)
    }

    /// Build an x86 64-bit handle
    pub fn build_x86_64() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .x86()
            .mode(X86Mode::Mode64)
            .detail(false)
            .build()?)
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::x86-64")
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, bytes: &[u8], addr: Address) -> Option<Insn> {
        if bytes.is_empty() {
            return None;
        }
        let slice = &bytes[..bytes.len().min(MAX_INSTRUCTION_SIZE)];

        CS_POOL.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Self::build_x86_64().ok();
            }
            let cs = slot.as_ref()?;

            let insns = cs.disasm_count(slice, addr, 1).ok()?;
            let i = insns.iter().next()?;

            // Ensure instruction starts at the address we requested
            if i.address() != addr || i.bytes().is_empty() {
                return None;
            }

            Some(Insn::new(
                i.address(),
                i.bytes(),
                i.mnemonic().unwrap_or(""),
                i.op_str().unwrap_or(""),
            ))
        })
    }
}

/// iced-x86 length oracle, always in 64-bit mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcedReference;

impl IcedReference {
    pub fn new() -> Self {
        IcedReference
    }
}

impl ReferenceDecoder for IcedReference {
    fn decode_len(&self, bytes: &[u8]) -> Result<usize, ReferenceError> {
        if bytes.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let mut decoder = iced_x86::Decoder::new(64, bytes, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(ReferenceError::Invalid(format!("{:?}", decoder.last_error())));
        }

        Ok(insn.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_decode() {
        // mov rbp, rsp
        let bytes = [0x48, 0x89, 0xe5, 0xc3];
        let decoder = CapstoneDecoder::x86_64().unwrap();

        let insn = decoder.decode(&bytes, 0x401000).unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.size, 3);
        assert_eq!(insn.addr, 0x401000);
        assert_eq!(insn.bytes(), &bytes[..3]);
    }

    #[test]
    fn test_decode_across_threads() {
        let decoder = CapstoneDecoder::x86_64().unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let insn = decoder.decode(&[0x90], 0x10).unwrap();
                    assert_eq!(insn.mnemonic, "nop");
                });
            }
        });
    }

    #[test]
    fn test_reference_lengths() {
        let reference = IcedReference::new();

        assert_eq!(reference.decode_len(&[0x90]), Ok(1));
        assert_eq!(reference.decode_len(&[0x48, 0x89, 0xe5, 0x90]), Ok(3));
        // mov eax, imm32
        assert_eq!(reference.decode_len(&[0xb8, 0x01, 0x00, 0x00, 0x00]), Ok(5));
    }

    #[test]
    fn test_reference_rejects_legacy_opcode() {
        // push es does not exist in 64-bit mode
        let reference = IcedReference::new();
        assert!(matches!(reference.decode_len(&[0x06, 0x90]), Err(ReferenceError::Invalid(_))));
        assert_eq!(reference.decode_len(&[]), Err(ReferenceError::Empty));
    }

    #[test]
    fn test_reference_truncated_window() {
        // mov eax, imm32 cut short
        let reference = IcedReference::new();
        assert!(reference.decode_len(&[0xb8, 0x01]).is_err());
    }
}
