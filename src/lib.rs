//! Decode cross-validation for x86-64 control-flow graphs.
//!
//! Nuclide Audit builds a CFG of a binary with a primary disassembler
//! (Capstone) and checks every instruction it claims against an independent
//! reference decoder (iced-x86). It reports three kinds of defects:
//!
//! 1. bytes the primary decoder does not recognize at all (the fallback
//!    adapter classifies them as valid, "troll" or unmatched),
//! 2. instructions the primary decoder accepts with the wrong length,
//! 3. unclaimed regions (gaps) and overlaps between basic blocks.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nuclide_audit::{
//!     audit::{Audit, AuditConfig},
//!     decoder::{CapstoneDecoder, IcedReference},
//!     parser::GoblinParser,
//!     report::Reporter,
//!     BinaryParser,
//! };
//!
//! let data = std::fs::read("path/to/binary").unwrap();
//! let metadata = GoblinParser::new().parse(&data).unwrap();
//! let image = metadata.code_image(&data);
//!
//! let audit = Audit::new(
//!     AuditConfig::default(),
//!     Arc::new(CapstoneDecoder::x86_64().unwrap()),
//!     Arc::new(IcedReference::new()),
//!     Arc::new(Reporter::stdout(false)),
//! );
//! let summary = audit.run(&image, metadata.function_entries()).unwrap();
//! println!("{summary}");
//! ```

pub mod parser;
pub mod decoder;
pub mod cfg;
pub mod dump;
pub mod fallback;
pub mod check;
pub mod gaps;
pub mod stats;
pub mod report;
pub mod format;
pub mod audit;
#[cfg(test)]
pub(crate) mod testing;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

/// Longest legal x86 instruction in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Capacity of a fallback buffer: one maximal instruction plus slack for trolling.
pub const RAW_BUFFER_SIZE: usize = MAX_INSTRUCTION_SIZE + 4;

/// One decoded instruction, as reported by the primary disassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction, zero padded
    pub bytes: [u8; RAW_BUFFER_SIZE],
}

impl Insn {
    /// Build an instruction record from its raw encoding.
    ///
    /// `raw` longer than [`RAW_BUFFER_SIZE`] is truncated.
    pub fn new(addr: Address, raw: &[u8], mnemonic: &str, operands: &str) -> Self {
        let len = raw.len().min(RAW_BUFFER_SIZE);
        let mut bytes = [0u8; RAW_BUFFER_SIZE];
        bytes[..len].copy_from_slice(&raw[..len]);

        Self {
            addr,
            size: len as u8,
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            bytes,
        }
    }

    /// A no-op stand-in covering `raw`, used when an unknown instruction is fixed.
    pub fn placeholder(addr: Address, raw: &[u8]) -> Self {
        Self::new(addr, raw, "nop", "")
    }

    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address just past the end of this instruction
    pub fn end(&self) -> Address {
        self.addr + self.size as Address
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Decoder trait: the primary, architecture-specific disassembler.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction at the start of `bytes`.
    ///
    /// # Arguments
    /// * `bytes` - Bytes of the image starting at `addr`
    /// * `addr` - Virtual address of `bytes[0]`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, bytes: &[u8], addr: Address) -> Option<Insn>;
}

/// Why the reference decoder rejected a byte window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// Nothing to decode
    #[error("empty buffer")]
    Empty,

    /// Bytes do not form a valid 64-bit instruction
    #[error("invalid instruction: {0}")]
    Invalid(String),
}

/// Reference decoder: a stateless length oracle in 64-bit mode.
pub trait ReferenceDecoder: Send + Sync {
    /// Decode one instruction at the start of `bytes` and return its length.
    /// The decoder never reads past the end of `bytes`.
    fn decode_len(&self, bytes: &[u8]) -> Result<usize, ReferenceError>;
}

/// Bytes copied out of the image at a decode-failure site.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    data: [u8; RAW_BUFFER_SIZE],
    len: usize,
}

impl RawBuffer {
    /// Copy up to [`RAW_BUFFER_SIZE`] bytes from `src`.
    pub fn copy_from(src: &[u8]) -> Self {
        let len = src.len().min(RAW_BUFFER_SIZE);
        let mut data = [0u8; RAW_BUFFER_SIZE];
        data[..len].copy_from_slice(&src[..len]);
        Self { data, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBuffer({:02x?})", self.as_slice())
    }
}

/// What the fallback hands back to the primary disassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackResult {
    /// Accept this synthetic instruction in place of the unknown bytes
    Placeholder(Insn),
    /// Treat the position as undecodable
    Failure,
}

/// Callback the primary disassembler invokes when it cannot decode at `addr`.
pub trait UnknownInsnHandler: Send + Sync {
    /// Classify the bytes at a decode failure.
    ///
    /// An `Err` is fatal and aborts the whole parse.
    fn on_unknown(&self, addr: Address, buffer: &RawBuffer) -> Result<FallbackResult, AuditError>;
}

/// One basic block, as delimited by the primary disassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Address of the first instruction
    pub start: Address,
    /// Address just past the last instruction
    pub end: Address,
    /// Out edges, in the order the terminating instruction produces them
    pub succs: Vec<Edge>,
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Direct call to another function
    Call,
    /// Return site after a call
    CallFallthrough,
    /// Conditional branch taken
    CondTaken,
    /// Conditional branch not taken
    CondNotTaken,
    /// Unconditional direct jump
    Direct,
    /// Straight-line flow into the next block
    Fallthrough,
}

impl EdgeKind {
    /// Whether the edge leaves the function.
    pub fn is_interproc(self) -> bool {
        self == EdgeKind::Call
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Call => "call",
            EdgeKind::CallFallthrough => "call-ft",
            EdgeKind::CondTaken => "cond-take",
            EdgeKind::CondNotTaken => "cond-not",
            EdgeKind::Direct => "direct",
            EdgeKind::Fallthrough => "fallthr",
        };
        f.write_str(name)
    }
}

/// One out edge of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub target: Address,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(target: Address, kind: EdgeKind) -> Self {
        Self { target, kind }
    }
}

impl Block {
    /// Create a block covering `[start, end)` with no successors
    pub fn new(start: Address, end: Address) -> Self {
        Self {
            start,
            end,
            succs: Vec::new(),
        }
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// Unknown architecture
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A section in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Starting virtual address of the section
    pub address: Address,
    /// Offset of the section contents in the file
    pub offset: usize,
    /// Size of the section in bytes
    pub size: usize,
    /// Whether this section contains executable code
    pub executable: bool,
}

impl Section {
    /// Create a new section
    pub fn new(name: String, address: Address, offset: usize, size: usize, executable: bool) -> Self {
        Self {
            name,
            address,
            offset,
            size,
            executable,
        }
    }

    /// End address of this section, `None` if the range wraps
    pub fn end_address(&self) -> Option<Address> {
        self.address.checked_add(self.size as Address)
    }
}

/// A function entry point known before parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FunctionSeed {
    pub entry: Address,
    pub name: String,
}

impl FunctionSeed {
    pub fn new(entry: Address, name: impl Into<String>) -> Self {
        Self {
            entry,
            name: name.into(),
        }
    }
}

/// Metadata describing a parsed binary.
#[derive(Debug, Clone)]
pub struct BinaryMetadata {
    /// Detected architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// List of sections found in the binary
    pub sections: Vec<Section>,
    /// Function symbols (entry, name)
    pub symbols: Vec<FunctionSeed>,
}

impl BinaryMetadata {
    /// Get all executable sections
    pub fn executable_sections(&self) -> Vec<&Section> {
        self.sections.iter().filter(|s| s.executable && s.size > 0).collect()
    }

    /// Map every executable section of `img` at its virtual address.
    pub fn code_image<'a>(&self, img: &'a [u8]) -> cfg::CodeImage<'a> {
        let mut regions = Vec::new();

        for section in self.executable_sections() {
            let start = section.offset;
            if start >= img.len() {
                log::warn!("section '{}' lies outside the file, skipped", section.name);
                continue;
            }
            let (Some(file_end), Some(_)) = (start.checked_add(section.size), section.end_address())
            else {
                log::warn!(
                    "section '{}' has a malformed range (offset {:#x}, address {:#x}, size {:#x}), skipped",
                    section.name,
                    section.offset,
                    section.address,
                    section.size
                );
                continue;
            };
            let end = file_end.min(img.len());
            regions.push(cfg::CodeRegion {
                name: section.name.clone(),
                base: section.address,
                bytes: &img[start..end],
            });
        }

        cfg::CodeImage::new(regions)
    }

    /// Entry point plus function symbols, deduplicated and sorted by address.
    pub fn function_entries(&self) -> Vec<FunctionSeed> {
        let mut seeds: Vec<FunctionSeed> = self.symbols.clone();
        if let Some(entry) = self.entry_point.filter(|&e| e != 0) {
            seeds.push(FunctionSeed::new(entry, "_start"));
        }

        seeds.sort();
        seeds.dedup_by_key(|s| s.entry);
        seeds
    }
}

/// Parser trait: turn raw bytes into `BinaryMetadata`.
pub trait BinaryParser: Send + Sync {
    /// Parse binary data into metadata
    ///
    /// # Arguments
    /// * `data` - The binary data to parse
    ///
    /// # Returns
    /// Result containing BinaryMetadata if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<BinaryMetadata, AuditError>;
}

/// Error type for audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Decoder could not be initialized
    #[error("Decoder error: {0}")]
    DecoderError(String),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Too many unmatched unknown instructions in a row
    #[error("exceeded num unmatched unknown instructions: {0}")]
    RunawayFailures(u32),

    /// Summary could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Worker pool could not be started
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insn_bytes() {
        let insn = Insn::new(0x1000, &[0x48, 0x89, 0xe5], "mov", "rbp, rsp");

        assert_eq!(insn.bytes(), &[0x48, 0x89, 0xe5]);
        assert_eq!(insn.size, 3);
        assert_eq!(insn.end(), 0x1003);
    }

    #[test]
    fn test_placeholder_is_nop() {
        let insn = Insn::placeholder(0x2000, &[0x0f, 0x0b]);
        assert_eq!(insn.mnemonic, "nop");
        assert_eq!(insn.bytes(), &[0x0f, 0x0b]);
    }

    #[test]
    fn test_raw_buffer_truncates() {
        let src = [0xccu8; 32];
        let buf = RawBuffer::copy_from(&src);
        assert_eq!(buf.len(), RAW_BUFFER_SIZE);

        let short = RawBuffer::copy_from(&[0x90]);
        assert_eq!(short.as_slice(), &[0x90]);
        assert!(!short.is_empty());
    }

    #[test]
    fn test_block_size() {
        let block = Block::new(0x1000, 0x1010);
        assert_eq!(block.size(), 16);
    }

    #[test]
    fn test_code_image_skips_malformed_sections() {
        let meta = BinaryMetadata {
            architecture: Architecture::X86_64,
            entry_point: None,
            sections: vec![
                Section::new(".huge".into(), 0x1000, 4, usize::MAX, true),
                Section::new(".wrap".into(), u64::MAX - 1, 0, 4, true),
                Section::new(".text".into(), 0x2000, 0, 4, true),
            ],
            symbols: Vec::new(),
        };
        let img = [0x90u8; 8];

        let image = meta.code_image(&img);
        assert_eq!(image.regions().len(), 1);
        assert_eq!(image.regions()[0].name, ".text");
        assert!(!image.contains(0x1004));
        assert_eq!(meta.sections[1].end_address(), None);
        assert_eq!(meta.sections[2].end_address(), Some(0x2004));
    }

    #[test]
    fn test_edge_names() {
        assert_eq!(EdgeKind::CondTaken.to_string(), "cond-take");
        assert_eq!(EdgeKind::CallFallthrough.to_string(), "call-ft");
        assert!(EdgeKind::Call.is_interproc());
        assert!(!EdgeKind::Direct.is_interproc());
    }

    #[test]
    fn test_function_entries_dedup() {
        let meta = BinaryMetadata {
            architecture: Architecture::X86_64,
            entry_point: Some(0x1000),
            sections: Vec::new(),
            symbols: vec![
                FunctionSeed::new(0x2000, "helper"),
                FunctionSeed::new(0x1000, "_entry"),
            ],
        };

        let entries = meta.function_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry, 0x1000);
        assert_eq!(entries[1].name, "helper");
    }
}
