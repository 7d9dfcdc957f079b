//! Recursive-descent CFG construction over the executable regions of a binary.
//!
//! Functions are parsed independently from their entry points. Direct call
//! targets become new functions, parsed in further rounds until no new entry
//! turns up. Each round runs on the caller's thread pool.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use iced_x86::{DecoderOptions, FlowControl, Mnemonic, OpKind};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::{
    Address, AuditError, Block, Decoder, Edge, EdgeKind, FallbackResult, FunctionSeed, Insn, RawBuffer,
    UnknownInsnHandler, MAX_INSTRUCTION_SIZE, RAW_BUFFER_SIZE,
};

/// One executable region mapped at its virtual address.
#[derive(Debug, Clone)]
pub struct CodeRegion<'a> {
    pub name: String,
    pub base: Address,
    pub bytes: &'a [u8],
}

impl CodeRegion<'_> {
    pub fn end(&self) -> Address {
        self.base.saturating_add(self.bytes.len() as Address)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The code the primary disassembler sees.
#[derive(Debug, Clone, Default)]
pub struct CodeImage<'a> {
    regions: Vec<CodeRegion<'a>>,
}

impl<'a> CodeImage<'a> {
    pub fn new(mut regions: Vec<CodeRegion<'a>>) -> Self {
        regions.sort_by_key(|r| r.base);
        Self { regions }
    }

    /// A single region, mostly for tests and raw blobs.
    pub fn from_bytes(base: Address, bytes: &'a [u8]) -> Self {
        Self::new(vec![CodeRegion {
            name: "raw".to_string(),
            base,
            bytes,
        }])
    }

    pub fn regions(&self) -> &[CodeRegion<'a>] {
        &self.regions
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.region_of(addr).is_some()
    }

    /// Up to `max_len` bytes starting at `addr`, never crossing a region end.
    pub fn window(&self, addr: Address, max_len: usize) -> Option<&'a [u8]> {
        let region = self.region_of(addr)?;
        let start = (addr - region.base) as usize;
        let end = (start + max_len).min(region.bytes.len());
        Some(&region.bytes[start..end])
    }

    fn region_of(&self, addr: Address) -> Option<&CodeRegion<'a>> {
        self.regions.iter().find(|r| r.contains(addr))
    }
}

/// How an instruction passes control on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Falls through to the next instruction
    Sequential,
    /// Unconditional jump, direct target if known
    Jump(Option<Address>),
    /// Conditional branch: target or fall-through
    Branch(Option<Address>),
    /// Call: returns to the next instruction
    Call(Option<Address>),
    /// Return, halt or trap
    Stop,
}

impl Flow {
    /// Classify an x86-64 instruction.
    ///
    /// The raw bytes are decoded with iced-x86 so that prefixed forms
    /// (`repz ret`, `bnd jmp`, `notrack jmp rax`) are recognized. When iced
    /// rejects the bytes or disagrees on the length, the mnemonic decides.
    pub fn of(insn: &Insn) -> Flow {
        if base_mnemonic(&insn.mnemonic) == "nop" {
            return Flow::Sequential;
        }

        let mut decoder =
            iced_x86::Decoder::with_ip(64, insn.bytes(), insn.addr, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() || instr.len() != insn.size as usize {
            return Flow::of_mnemonic(insn);
        }

        let target = match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(instr.near_branch_target())
            }
            _ => None,
        };
        match instr.flow_control() {
            FlowControl::UnconditionalBranch => Flow::Jump(target),
            FlowControl::IndirectBranch => Flow::Jump(None),
            FlowControl::ConditionalBranch => Flow::Branch(target),
            FlowControl::Call => Flow::Call(target),
            FlowControl::IndirectCall => Flow::Call(None),
            FlowControl::Return | FlowControl::Exception => Flow::Stop,
            _ if instr.mnemonic() == Mnemonic::Hlt => Flow::Stop,
            _ => Flow::Sequential,
        }
    }

    /// Classify by the mnemonic text alone, ignoring any prefixes in it.
    fn of_mnemonic(insn: &Insn) -> Flow {
        let mnemonic = base_mnemonic(&insn.mnemonic);
        let target = direct_target(&insn.operands);

        match mnemonic.as_str() {
            "jmp" | "ljmp" => Flow::Jump(target),
            "call" | "lcall" => Flow::Call(target),
            "ret" | "retf" | "retfq" | "iret" | "iretd" | "iretq" | "hlt" | "ud2" | "ud0"
            | "ud1" | "sysret" | "sysexit" => Flow::Stop,
            m if m.starts_with('j') || m.starts_with("loop") => Flow::Branch(target),
            _ => Flow::Sequential,
        }
    }

    fn ends_block(self) -> bool {
        self != Flow::Sequential
    }
}

/// Last word of a mnemonic: `"notrack jmp"` becomes `"jmp"`.
fn base_mnemonic(mnemonic: &str) -> String {
    mnemonic
        .split_whitespace()
        .last()
        .unwrap_or("")
        .to_lowercase()
}

/// Operand text that is nothing but an immediate address, e.g. `0x401020`.
fn direct_target(operands: &str) -> Option<Address> {
    let hex = operands.trim().strip_prefix("0x")?;
    u64::from_str_radix(hex, 16).ok()
}

/// One function and its basic blocks, sorted by start address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub entry: Address,
    pub name: String,
    pub blocks: Vec<Block>,
}

/// Every function found in a binary, sorted by entry address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cfg {
    pub functions: Vec<Function>,
}

impl Cfg {
    pub fn new(mut functions: Vec<Function>) -> Self {
        functions.sort_by(|a, b| a.entry.cmp(&b.entry).then_with(|| a.name.cmp(&b.name)));
        for func in &mut functions {
            func.blocks.sort_by_key(|b| (b.start, b.end));
        }
        Self { functions }
    }

    pub fn num_blocks(&self) -> usize {
        self.functions.iter().map(|f| f.blocks.len()).sum()
    }

    /// Blocks in function-entry order, then block-start order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.functions.iter().flat_map(|f| f.blocks.iter())
    }

    /// The union of all functions' blocks, sorted by `(start, end)`.
    /// Blocks shared between functions appear once per function.
    pub fn sorted_blocks(&self) -> Vec<&Block> {
        let mut blocks: Vec<&Block> = self.blocks().collect();
        blocks.sort_by_key(|b| (b.start, b.end));
        blocks
    }
}

/// Something that can list a block's instructions.
pub trait InsnSource: Sync {
    fn block_insns(&self, block: &Block) -> Result<Vec<Insn>, AuditError>;
}

/// The primary disassembler: a decoder driven over a code image.
pub struct Disassembler<'a> {
    image: &'a CodeImage<'a>,
    decoder: &'a dyn Decoder,
    callback: Option<Arc<dyn UnknownInsnHandler>>,
}

impl<'a> Disassembler<'a> {
    pub fn new(image: &'a CodeImage<'a>, decoder: &'a dyn Decoder) -> Self {
        Self {
            image,
            decoder,
            callback: None,
        }
    }

    /// Install the handler consulted whenever `decoder` fails.
    pub fn register_callback(&mut self, handler: Arc<dyn UnknownInsnHandler>) {
        self.callback = Some(handler);
    }

    /// Decode one instruction at `addr`, consulting the callback on failure.
    ///
    /// `Ok(None)` means the position is undecodable (or outside the image).
    pub fn decode_at(&self, addr: Address) -> Result<Option<Insn>, AuditError> {
        let Some(bytes) = self.image.window(addr, MAX_INSTRUCTION_SIZE) else {
            return Ok(None);
        };
        if let Some(insn) = self.decoder.decode(bytes, addr) {
            return Ok(Some(insn));
        }

        let Some(handler) = &self.callback else {
            return Ok(None);
        };
        let raw = self.image.window(addr, RAW_BUFFER_SIZE).unwrap_or(bytes);
        match handler.on_unknown(addr, &RawBuffer::copy_from(raw))? {
            FallbackResult::Placeholder(insn) if insn.size > 0 => Ok(Some(insn)),
            _ => Ok(None),
        }
    }

    /// Parse every function reachable from `seeds` on `pool`.
    pub fn parse(&self, pool: &ThreadPool, seeds: Vec<FunctionSeed>) -> Result<Cfg, AuditError> {
        let mut known: BTreeMap<Address, String> = BTreeMap::new();
        let mut pending = Vec::new();
        for seed in seeds {
            if self.image.contains(seed.entry) && !known.contains_key(&seed.entry) {
                known.insert(seed.entry, seed.name.clone());
                pending.push(seed);
            }
        }

        let mut functions = Vec::new();
        let mut round = 0;
        while !pending.is_empty() {
            round += 1;
            log::debug!("parse round {round}: {} functions", pending.len());

            let parsed: Vec<(Function, BTreeSet<Address>)> = pool.install(|| {
                pending
                    .par_iter()
                    .map(|seed| self.parse_function(seed))
                    .collect::<Result<Vec<_>, AuditError>>()
            })?;

            let mut next = Vec::new();
            for (func, calls) in parsed {
                for target in calls {
                    if self.image.contains(target) && !known.contains_key(&target) {
                        let name = format!("targ{target:x}");
                        known.insert(target, name.clone());
                        next.push(FunctionSeed::new(target, name));
                    }
                }
                functions.push(func);
            }
            pending = next;
        }

        let cfg = Cfg::new(functions);
        log::info!(
            "parsed {} functions, {} blocks",
            cfg.functions.len(),
            cfg.num_blocks()
        );
        Ok(cfg)
    }

    /// Recursive descent from one entry point.
    ///
    /// Returns the function and the direct call targets found in it.
    pub fn parse_function(
        &self,
        seed: &FunctionSeed,
    ) -> Result<(Function, BTreeSet<Address>), AuditError> {
        let mut insns: BTreeMap<Address, (Insn, Flow)> = BTreeMap::new();
        let mut leaders = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut calls = BTreeSet::new();

        leaders.insert(seed.entry);
        queue.push_back(seed.entry);

        while let Some(start) = queue.pop_front() {
            if !seen.insert(start) {
                continue;
            }

            let mut at = start;
            loop {
                if insns.contains_key(&at) {
                    // ran into an already decoded stream
                    leaders.insert(at);
                    break;
                }
                let Some(insn) = self.decode_at(at)? else { break };
                let next = insn.end();
                let flow = Flow::of(&insn);
                insns.insert(at, (insn, flow));

                let mut follow = |target: Address| {
                    if self.image.contains(target) {
                        leaders.insert(target);
                        queue.push_back(target);
                    }
                };
                match flow {
                    Flow::Sequential => {
                        at = next;
                        continue;
                    }
                    Flow::Jump(target) => target.into_iter().for_each(&mut follow),
                    Flow::Branch(target) => {
                        target.into_iter().for_each(&mut follow);
                        follow(next);
                    }
                    Flow::Call(target) => {
                        calls.extend(target);
                        follow(next);
                    }
                    Flow::Stop => {}
                }
                break;
            }
        }

        let blocks = leaders
            .iter()
            .filter_map(|&leader| form_block(&insns, &leaders, leader))
            .collect();

        let func = Function {
            entry: seed.entry,
            name: seed.name.clone(),
            blocks,
        };
        Ok((func, calls))
    }
}

/// Walk from `leader` until a control transfer or the next leader.
fn form_block(
    insns: &BTreeMap<Address, (Insn, Flow)>,
    leaders: &BTreeSet<Address>,
    leader: Address,
) -> Option<Block> {
    let (mut insn, mut flow) = insns.get(&leader).map(|(i, f)| (i, *f))?;
    loop {
        let next = insn.end();
        if flow.ends_block() || leaders.contains(&next) {
            break;
        }
        match insns.get(&next) {
            Some((i, f)) => {
                insn = i;
                flow = *f;
            }
            None => break,
        }
    }

    let end = insn.end();
    let succs = match flow {
        Flow::Sequential if insns.contains_key(&end) => vec![Edge::new(end, EdgeKind::Fallthrough)],
        Flow::Sequential | Flow::Stop => Vec::new(),
        Flow::Jump(target) => target.map(|t| Edge::new(t, EdgeKind::Direct)).into_iter().collect(),
        Flow::Branch(target) => target
            .map(|t| Edge::new(t, EdgeKind::CondTaken))
            .into_iter()
            .chain(Some(Edge::new(end, EdgeKind::CondNotTaken)))
            .collect(),
        Flow::Call(target) => target
            .map(|t| Edge::new(t, EdgeKind::Call))
            .into_iter()
            .chain(Some(Edge::new(end, EdgeKind::CallFallthrough)))
            .collect(),
    };

    Some(Block {
        start: leader,
        end,
        succs,
    })
}

impl InsnSource for Disassembler<'_> {
    /// Re-decode a block's instructions. Unknown bytes go through the
    /// callback again, exactly as during the parse.
    fn block_insns(&self, block: &Block) -> Result<Vec<Insn>, AuditError> {
        let mut out = Vec::new();
        let mut at = block.start;
        while at < block.end {
            match self.decode_at(at)? {
                Some(insn) => {
                    at = insn.end();
                    out.push(insn);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CapstoneDecoder;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(n: usize) -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(n).build().unwrap()
    }

    /// Accepts every unknown byte as a one-byte placeholder.
    #[derive(Default)]
    struct OneByteFix {
        calls: AtomicUsize,
    }

    impl UnknownInsnHandler for OneByteFix {
        fn on_unknown(&self, addr: Address, buffer: &RawBuffer) -> Result<FallbackResult, AuditError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(FallbackResult::Placeholder(Insn::placeholder(addr, &buffer.as_slice()[..1])))
        }
    }

    fn flow_of(bytes: &[u8]) -> Flow {
        let decoder = CapstoneDecoder::x86_64().unwrap();
        Flow::of(&decoder.decode(bytes, 0x1000).unwrap())
    }

    #[rstest]
    #[case::ret(&[0xc3], Flow::Stop)]
    #[case::repz_ret(&[0xf3, 0xc3], Flow::Stop)]
    #[case::bnd_ret(&[0xf2, 0xc3], Flow::Stop)]
    #[case::notrack_jmp(&[0x3e, 0xff, 0xe0], Flow::Jump(None))]
    #[case::jmp_reg(&[0xff, 0xe0], Flow::Jump(None))]
    #[case::bnd_jmp(&[0xf2, 0xe9, 0x00, 0x00, 0x00, 0x00], Flow::Jump(Some(0x1006)))]
    #[case::jmp_short(&[0xeb, 0x02], Flow::Jump(Some(0x1004)))]
    #[case::je(&[0x74, 0x02], Flow::Branch(Some(0x1004)))]
    #[case::loop_(&[0xe2, 0xfe], Flow::Branch(Some(0x1000)))]
    #[case::call(&[0xe8, 0x00, 0x00, 0x00, 0x00], Flow::Call(Some(0x1005)))]
    #[case::call_reg(&[0xff, 0xd0], Flow::Call(None))]
    #[case::hlt(&[0xf4], Flow::Stop)]
    #[case::ud2(&[0x0f, 0x0b], Flow::Stop)]
    #[case::mov(&[0x48, 0x89, 0xe5], Flow::Sequential)]
    #[case::lea(&[0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00], Flow::Sequential)]
    fn test_flow_classification(#[case] bytes: &[u8], #[case] flow: Flow) {
        assert_eq!(flow_of(bytes), flow);
    }

    #[test]
    fn test_flow_from_prefixed_mnemonic() {
        // bytes iced rejects, so only the text is left to go on
        let insn = |m: &str, ops: &str| Insn::new(0, &[0x06], m, ops);

        assert_eq!(Flow::of(&insn("repz ret", "")), Flow::Stop);
        assert_eq!(Flow::of(&insn("bnd ret", "")), Flow::Stop);
        assert_eq!(Flow::of(&insn("notrack jmp", "rax")), Flow::Jump(None));
        assert_eq!(Flow::of(&insn("bnd jmp", "0x2000")), Flow::Jump(Some(0x2000)));
        assert_eq!(Flow::of(&insn("bnd jne", "0x10")), Flow::Branch(Some(0x10)));
        // placeholders never transfer control
        assert_eq!(Flow::of(&Insn::placeholder(0, &[0xc3])), Flow::Sequential);
    }

    #[test]
    fn test_prefixed_return_ends_block() {
        // 0x10: repz ret, then bytes that must never be reached
        let code = [0xf3, 0xc3, 0x06, 0x06];
        let image = CodeImage::from_bytes(0x10, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let handler = Arc::new(OneByteFix::default());
        let mut disasm = Disassembler::new(&image, &decoder);
        disasm.register_callback(handler.clone());

        let (func, _) = disasm.parse_function(&FunctionSeed::new(0x10, "f")).unwrap();
        assert_eq!(func.blocks, vec![Block::new(0x10, 0x12)]);
        assert_eq!(handler.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_notrack_jump_ends_block() {
        // 0x10: nop; notrack jmp rax; then a jump table that is not code
        let code = [0x90, 0x3e, 0xff, 0xe0, 0x06, 0x06];
        let image = CodeImage::from_bytes(0x10, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let disasm = Disassembler::new(&image, &decoder);

        let (func, _) = disasm.parse_function(&FunctionSeed::new(0x10, "f")).unwrap();
        assert_eq!(func.blocks.len(), 1);
        assert_eq!((func.blocks[0].start, func.blocks[0].end), (0x10, 0x14));
        assert!(func.blocks[0].succs.is_empty());
    }

    #[test]
    fn test_image_window() {
        let bytes = [0x90u8; 8];
        let image = CodeImage::from_bytes(0x1000, &bytes);

        assert_eq!(image.window(0x1006, 16).map(<[u8]>::len), Some(2));
        assert!(image.window(0x1008, 16).is_none());
        assert!(!image.contains(0xfff));
    }

    #[test]
    fn test_branch_splits_blocks() {
        // 0x1000: push rbp
        // 0x1001: test eax, eax
        // 0x1003: je 0x1006
        // 0x1005: nop
        // 0x1006: pop rbp
        // 0x1007: ret
        let code = [0x55, 0x85, 0xc0, 0x74, 0x01, 0x90, 0x5d, 0xc3];
        let image = CodeImage::from_bytes(0x1000, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let disasm = Disassembler::new(&image, &decoder);

        let (func, calls) = disasm.parse_function(&FunctionSeed::new(0x1000, "f")).unwrap();
        assert!(calls.is_empty());

        let ranges: Vec<_> = func.blocks.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(ranges, vec![(0x1000, 0x1005), (0x1005, 0x1006), (0x1006, 0x1008)]);
        assert_eq!(
            func.blocks[0].succs,
            vec![
                Edge::new(0x1006, EdgeKind::CondTaken),
                Edge::new(0x1005, EdgeKind::CondNotTaken),
            ]
        );
        assert_eq!(func.blocks[1].succs, vec![Edge::new(0x1006, EdgeKind::Fallthrough)]);
        assert!(func.blocks[2].succs.is_empty());
    }

    #[test]
    fn test_calls_become_functions() {
        // 0x2000: call 0x2006; ret; 0x2006: nop; ret
        let code = [0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x90, 0xc3];
        let image = CodeImage::from_bytes(0x2000, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let disasm = Disassembler::new(&image, &decoder);

        let cfg = disasm.parse(&pool(2), vec![FunctionSeed::new(0x2000, "main")]).unwrap();

        let entries: Vec<_> = cfg.functions.iter().map(|f| (f.entry, f.name.as_str())).collect();
        assert_eq!(entries, vec![(0x2000, "main"), (0x2006, "targ2006")]);
        assert_eq!(cfg.num_blocks(), 3);
    }

    #[test]
    fn test_undecodable_bytes_end_block_without_callback() {
        // nop; then bytes capstone rejects in 64-bit mode
        let code = [0x90, 0x06, 0x06, 0x06];
        let image = CodeImage::from_bytes(0x10, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let disasm = Disassembler::new(&image, &decoder);

        let (func, _) = disasm.parse_function(&FunctionSeed::new(0x10, "f")).unwrap();
        assert_eq!(func.blocks, vec![Block::new(0x10, 0x11)]);
    }

    #[test]
    fn test_callback_fills_unknown_bytes() {
        let code = [0x90, 0x06, 0x06, 0xc3];
        let image = CodeImage::from_bytes(0x10, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let handler = Arc::new(OneByteFix::default());
        let mut disasm = Disassembler::new(&image, &decoder);
        disasm.register_callback(handler.clone());

        let (func, _) = disasm.parse_function(&FunctionSeed::new(0x10, "f")).unwrap();
        assert_eq!(func.blocks, vec![Block::new(0x10, 0x14)]);
        assert_eq!(handler.calls.load(Ordering::Relaxed), 2);

        // re-deriving the block goes through the callback again
        let insns = disasm.block_insns(&func.blocks[0]).unwrap();
        let sizes: Vec<_> = insns.iter().map(|i| (i.addr, i.size)).collect();
        assert_eq!(sizes, vec![(0x10, 1), (0x11, 1), (0x12, 1), (0x13, 1)]);
        assert_eq!(handler.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_parse_is_independent_of_thread_count() {
        // three functions calling each other
        let code = [
            0xe8, 0x05, 0x00, 0x00, 0x00, // 0x0: call 0xa
            0xe9, 0x06, 0x00, 0x00, 0x00, // 0x5: jmp 0x10
            0x74, 0x02, //                   0xa: je 0xe
            0x90, 0x90, //                   0xc: nop; nop
            0xc3, //                         0xe: ret
            0xcc, //                         0xf: int3
            0x48, 0x31, 0xc0, //             0x10: xor rax, rax
            0xc3, //                         0x13: ret
        ];
        let image = CodeImage::from_bytes(0, &code);
        let decoder = CapstoneDecoder::x86_64().unwrap();
        let disasm = Disassembler::new(&image, &decoder);
        let seeds = vec![FunctionSeed::new(0, "main")];

        let one = disasm.parse(&pool(1), seeds.clone()).unwrap();
        let many = disasm.parse(&pool(4), seeds).unwrap();
        assert_eq!(one, many);
        assert_eq!(one.functions.len(), 2);
    }
}
