//! The three audit phases, wired together.

use std::io::Write;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::cfg::{Cfg, CodeImage, Disassembler, InsnSource};
use crate::check::{self, BlockChecker, BlockVerdict};
use crate::dump;
use crate::fallback::{FallbackAdapter, FixPolicy, Phase};
use crate::gaps;
use crate::report::Reporter;
use crate::stats::{Statistics, Summary};
use crate::{AuditError, Block, Decoder, FunctionSeed, ReferenceDecoder};

/// Upper bound for `jobs`.
pub const MAX_JOBS: usize = 550;

/// Run-time options of an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditConfig {
    /// Worker threads for the parse and check phases
    pub jobs: usize,
    /// Suppress per-event diagnostic lines
    pub quiet: bool,
    /// Which fallback outcomes become placeholder instructions
    pub fix: FixPolicy,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            quiet: false,
            fix: FixPolicy::NONE,
        }
    }
}

/// Cross-validation of one binary.
pub struct Audit {
    config: AuditConfig,
    primary: Arc<dyn Decoder>,
    reference: Arc<dyn ReferenceDecoder>,
    reporter: Arc<Reporter>,
    stats: Arc<Statistics>,
}

impl Audit {
    pub fn new(
        config: AuditConfig,
        primary: Arc<dyn Decoder>,
        reference: Arc<dyn ReferenceDecoder>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            config,
            primary,
            reference,
            reporter,
            stats: Arc::new(Statistics::new()),
        }
    }

    fn pool(&self) -> Result<ThreadPool, AuditError> {
        let jobs = self.config.jobs.clamp(1, MAX_JOBS);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("audit-{i}"))
            .build()?)
    }

    fn phase(&self, title: &str) {
        if self.reporter.is_quiet() {
            self.reporter.banner(format_args!("{title}"));
        } else {
            self.reporter.banner(format_args!("\n{title}\n"));
        }
    }

    fn adapter(&self) -> Arc<FallbackAdapter> {
        Arc::new(FallbackAdapter::new(
            self.reference.clone(),
            self.config.fix,
            self.stats.clone(),
            self.reporter.clone(),
        ))
    }

    /// Parse `image` from `seeds`, check every block, scan for gaps.
    pub fn run(&self, image: &CodeImage<'_>, seeds: Vec<FunctionSeed>) -> Result<Summary, AuditError> {
        let pool = self.pool()?;
        let adapter = self.adapter();
        let mut disasm = Disassembler::new(image, self.primary.as_ref());
        disasm.register_callback(adapter.clone());

        self.phase("phase 1 -- parse binary and test for unknown instructions ...");
        log::info!("parsing {} seed functions on {} threads", seeds.len(), pool.current_num_threads());
        let cfg = disasm.parse(&pool, seeds)?;

        // The callback stays installed so fixed instructions decode the same
        // way when blocks are split into instructions, but nothing is counted.
        adapter.set_phase(Phase::Replay);

        self.check_blocks(&pool, &cfg, &disasm)?;
        self.scan_layout(&cfg);
        self.reporter.flush();

        Ok(self.stats.summary())
    }

    /// Parse `image` and write the CFG to `out` instead of auditing it.
    ///
    /// Unknown instructions are still handled by the fallback adapter under
    /// the configured fix policy, so the dump shows the CFG an audit checks.
    pub fn dump_cfg(
        &self,
        image: &CodeImage<'_>,
        seeds: Vec<FunctionSeed>,
        out: &mut dyn Write,
    ) -> Result<usize, AuditError> {
        let pool = self.pool()?;
        let adapter = self.adapter();
        let mut disasm = Disassembler::new(image, self.primary.as_ref());
        disasm.register_callback(adapter.clone());

        let cfg = disasm.parse(&pool, seeds)?;
        adapter.set_phase(Phase::Replay);

        dump::write_cfg(out, &cfg, &disasm)?;
        out.flush()?;
        Ok(cfg.functions.len())
    }

    /// Phases 2 and 3 on an existing CFG.
    pub fn run_on_cfg(&self, cfg: &Cfg, source: &dyn InsnSource) -> Result<Summary, AuditError> {
        let pool = self.pool()?;
        self.check_blocks(&pool, cfg, source)?;
        self.scan_layout(cfg);
        self.reporter.flush();
        Ok(self.stats.summary())
    }

    /// Phase 2: compare every block against the reference decoder.
    ///
    /// Blocks are checked in parallel; verdicts are recorded afterwards in
    /// function order so output does not depend on scheduling.
    pub fn check_blocks(
        &self,
        pool: &ThreadPool,
        cfg: &Cfg,
        source: &dyn InsnSource,
    ) -> Result<(), AuditError> {
        self.phase("phase 2 -- test known instructions for bad length ...");

        for func in &cfg.functions {
            self.stats.record_function(func.blocks.len());
        }

        let blocks: Vec<&Block> = cfg.blocks().collect();
        let checker = BlockChecker::new(self.reference.as_ref());
        let verdicts: Vec<(usize, BlockVerdict)> = pool.install(|| {
            blocks
                .par_iter()
                .map(|block| {
                    let insns = source.block_insns(block)?;
                    Ok((insns.len(), checker.check(block, &insns)))
                })
                .collect::<Result<Vec<_>, AuditError>>()
        })?;

        for (block, (num_insns, verdict)) in blocks.iter().zip(&verdicts) {
            check::record(block, *num_insns, verdict, &self.stats, &self.reporter);
        }
        log::debug!("checked {} blocks", blocks.len());
        Ok(())
    }

    /// Phase 3: gaps and overlaps across all blocks of all functions.
    pub fn scan_layout(&self, cfg: &Cfg) {
        self.phase("phase 3 -- test for gaps between blocks ...");

        let findings = gaps::scan(cfg.sorted_blocks());
        gaps::record(&findings, &self.stats, &self.reporter);
        log::debug!("{} layout findings", findings.len());
    }
}
