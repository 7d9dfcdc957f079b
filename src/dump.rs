//! Deterministic text dump of a parsed CFG.
//!
//! Functions are sorted by entry, blocks by address and out edges by target,
//! so two dumps of the same binary differ only if the parse itself differs.
//! Diffing dumps taken with different `-j` values is the quickest way to
//! catch a racy parse.

use std::collections::BTreeMap;
use std::io::Write;

use crate::cfg::{Cfg, InsnSource};
use crate::{Address, AuditError, Edge};

const RULE: &str = "--------------------------------------------------";

/// Write every function, block, instruction and out edge of `cfg`.
pub fn write_cfg(out: &mut dyn Write, cfg: &Cfg, source: &dyn InsnSource) -> Result<(), AuditError> {
    // blocks shared between functions list every owner
    let mut owners: BTreeMap<(Address, Address), Vec<Address>> = BTreeMap::new();
    for func in &cfg.functions {
        for block in &func.blocks {
            owners.entry((block.start, block.end)).or_default().push(func.entry);
        }
    }

    for func in &cfg.functions {
        let bytes: u64 = func.blocks.iter().map(|b| b.size()).sum();
        writeln!(out, "\n{RULE}")?;
        writeln!(
            out,
            "func:  0x{:x}  ({}, {})  {}",
            func.entry,
            func.blocks.len(),
            bytes,
            func.name
        )?;

        for block in &func.blocks {
            let insns = source.block_insns(block)?;

            write!(
                out,
                "\nblock: 0x{:x}--0x{:x} ({}, {})",
                block.start,
                block.end,
                insns.len(),
                block.size()
            )?;
            if let Some(funcs) = owners.get(&(block.start, block.end)).filter(|f| f.len() > 1) {
                write!(out, "  funcs: ({})", funcs.len())?;
                for entry in funcs {
                    write!(out, "  0x{entry:x}")?;
                }
            }
            writeln!(out)?;

            for insn in &insns {
                writeln!(out, "stmt:  0x{:x} ({})  {insn}", insn.addr, insn.size)?;
            }

            let mut edges: Vec<Edge> = block.succs.clone();
            edges.sort();
            let last = insns.last().map_or(block.start, |i| i.addr);
            write!(out, "out edges: 0x{last:x} ({})", edges.len())?;
            for edge in &edges {
                write!(out, "  0x{:x} ({}", edge.target, edge.kind)?;
                if edge.kind.is_interproc() {
                    write!(out, ", interproc")?;
                }
                write!(out, ")")?;
            }
            writeln!(out)?;
        }
    }

    writeln!(out, "\nnum funcs:  {}", cfg.functions.len())?;
    Ok(())
}
