//! Trip-count driven loop unrolling.
//!
//! The analyzer builds one candidate record per loop (trip count, trip
//! multiple, body size, canonical form, side effects) and selects a strategy:
//!
//! 1. Loops with side effects are left alone unless calls are allowed.
//! 2. Small known trip counts unroll fully.
//! 3. Larger known trip counts unroll partially, by the largest factor that
//!    divides the trip count evenly and respects the size cap.
//! 4. Unknown trip counts on canonical loops unroll with a runtime guard and
//!    a scalar epilogue, when enabled.
//!
//! Loops are visited innermost first. Before each rewrite the pass re-checks
//! that the header still heads a loop, since an earlier unroll may have
//! dissolved it. The mechanical rewrite may refuse a loop it cannot handle;
//! that is reported as a missed-optimization remark, not a failure.

use log::debug;

use crate::common::types::DataLayout;
use crate::ir::analysis::CfgAnalysis;
use crate::ir::ir::{BlockId, Function, Opcode};
use crate::passes::loop_analysis::{LoopInfo, NaturalLoop, ScalarEvolution};
use crate::passes::unroll::{unroll_loop, UnrollRequest, UnrollStatus};
use crate::passes::{PassResult, PreservedAnalyses};

/// Unrolling thresholds and switches.
#[derive(Debug, Clone)]
pub struct UnrollConfig {
    /// Maximum trip count for full unrolling.
    pub full_max_count: u32,
    /// Maximum body size times trip count for full unrolling.
    pub full_max_insns: u32,
    /// Preferred partial/runtime unroll factor.
    pub partial_factor: u32,
    /// Hard cap on the partial factor.
    pub max_partial: u32,
    pub allow_runtime: bool,
    /// Minimum remaining trip count the runtime guard requires.
    pub runtime_min_tc: u32,
    /// Unroll loops containing calls.
    pub allow_calls: bool,
    /// Cap on body size times factor for partial unrolling.
    pub max_unrolled_size: u32,
}

impl Default for UnrollConfig {
    fn default() -> Self {
        UnrollConfig {
            full_max_count: 8,
            full_max_insns: 100,
            partial_factor: 4,
            max_partial: 8,
            allow_runtime: true,
            runtime_min_tc: 4,
            allow_calls: false,
            max_unrolled_size: 400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrollStrategy {
    NoUnroll,
    Full,
    Partial,
    Runtime,
}

/// Everything the analyzer learned about one loop, plus its verdict.
#[derive(Debug, Clone)]
pub struct UnrollCandidate {
    /// Header block label; labels stay stable while blocks shift position.
    pub header: BlockId,
    pub trip_count: u32,
    pub trip_multiple: u32,
    /// Non-phi, non-terminator instructions in the loop body.
    pub instruction_count: u32,
    pub is_canonical: bool,
    pub has_side_effects: bool,
    /// The body contains a call, memory-pure or not. Replicating even a pure
    /// call multiplies code size, so `allow_calls` gates both.
    pub has_calls: bool,
    pub strategy: UnrollStrategy,
    pub unroll_factor: u32,
}

#[derive(Debug, Default, Clone)]
pub struct UnrollStats {
    pub loops_analyzed: u64,
    pub loops_fully_unrolled: u64,
    pub loops_partially_unrolled: u64,
    pub loops_runtime_unrolled: u64,
    pub loops_skipped: u64,
}

impl std::fmt::Display for UnrollStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "LoopUnrolling statistics:")?;
        writeln!(f, "  Loops analyzed: {}", self.loops_analyzed)?;
        writeln!(f, "  Fully unrolled: {}", self.loops_fully_unrolled)?;
        writeln!(f, "  Partially unrolled: {}", self.loops_partially_unrolled)?;
        writeln!(f, "  Runtime unrolled: {}", self.loops_runtime_unrolled)?;
        write!(f, "  Skipped: {}", self.loops_skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemarkVerdict {
    Unrolled,
    Missed,
}

/// One optimization decision worth surfacing to the host.
#[derive(Debug, Clone)]
pub struct Remark {
    pub pass: &'static str,
    pub verdict: RemarkVerdict,
    /// Loop header the remark refers to.
    pub header: BlockId,
    pub factor: u32,
    pub message: String,
}

pub struct LoopUnrollPass {
    config: UnrollConfig,
    dl: DataLayout,
    stats: UnrollStats,
    remarks: Vec<Remark>,
}

impl Default for LoopUnrollPass {
    fn default() -> Self {
        LoopUnrollPass::new(UnrollConfig::default(), DataLayout::default())
    }
}

impl LoopUnrollPass {
    pub fn new(config: UnrollConfig, dl: DataLayout) -> LoopUnrollPass {
        LoopUnrollPass { config, dl, stats: UnrollStats::default(), remarks: Vec::new() }
    }

    pub fn stats(&self) -> &UnrollStats {
        &self.stats
    }

    /// Drain the remark stream accumulated so far.
    pub fn take_remarks(&mut self) -> Vec<Remark> {
        std::mem::take(&mut self.remarks)
    }

    /// Analyze every loop of the function, innermost first, and return the
    /// candidate records including the ones the strategy rejected.
    pub fn analyze(&self, func: &Function) -> Vec<UnrollCandidate> {
        let cfg = CfgAnalysis::build(func);
        let li = LoopInfo::compute(&cfg);
        let se = ScalarEvolution::compute(func, &li, &self.dl);
        li.postorder()
            .into_iter()
            .map(|idx| self.analyze_loop(func, &li.loops[idx], &se, idx))
            .collect()
    }

    /// Unroll what the analyzer approved. When anything changed, only the
    /// dominator tree remains valid; loop info and trip counts must be
    /// recomputed by the host.
    pub fn run(&mut self, func: &mut Function) -> PassResult {
        let candidates: Vec<UnrollCandidate> = {
            let all = self.analyze(func);
            self.stats.loops_analyzed += all.len() as u64;
            all.into_iter().filter(|c| c.strategy != UnrollStrategy::NoUnroll).collect()
        };
        if candidates.is_empty() {
            debug!("no unrolling candidates in @{}", func.name);
            return PassResult { changed: false, preserved: PreservedAnalyses::all() };
        }

        let mut changed = false;
        let mut analyses_stale = false;
        let mut cfg = CfgAnalysis::build(func);
        let mut li = LoopInfo::compute(&cfg);

        for cand in candidates {
            if analyses_stale {
                cfg = CfgAnalysis::build(func);
                li = LoopInfo::compute(&cfg);
                analyses_stale = false;
            }
            // A previous unroll may have dissolved this loop; skip if its
            // header no longer heads one.
            let Some(&header_idx) = cfg.label_to_idx.get(&cand.header) else { continue };
            let Some(lp) = li.loops.iter().find(|l| l.header == header_idx) else {
                continue;
            };

            let request = UnrollRequest {
                factor: cand.unroll_factor,
                trip_count: cand.trip_count,
                full: cand.strategy == UnrollStrategy::Full,
                runtime: cand.strategy == UnrollStrategy::Runtime,
                guard_min: self.config.runtime_min_tc,
            };
            match unroll_loop(func, lp, &request) {
                UnrollStatus::UnrolledOk => {
                    changed = true;
                    analyses_stale = true;
                    match cand.strategy {
                        UnrollStrategy::Full => self.stats.loops_fully_unrolled += 1,
                        UnrollStrategy::Partial => self.stats.loops_partially_unrolled += 1,
                        UnrollStrategy::Runtime => self.stats.loops_runtime_unrolled += 1,
                        UnrollStrategy::NoUnroll => {}
                    }
                    self.remark(&cand, RemarkVerdict::Unrolled);
                }
                UnrollStatus::Unmodified => {
                    self.stats.loops_skipped += 1;
                    self.remark(&cand, RemarkVerdict::Missed);
                }
            }
        }

        if changed {
            PassResult { changed: true, preserved: PreservedAnalyses::DOM_TREE }
        } else {
            PassResult { changed: false, preserved: PreservedAnalyses::all() }
        }
    }

    fn remark(&mut self, cand: &UnrollCandidate, verdict: RemarkVerdict) {
        let message = match verdict {
            RemarkVerdict::Unrolled => {
                format!("unrolled loop by factor {}", cand.unroll_factor)
            }
            RemarkVerdict::Missed => "failed to unroll loop".to_string(),
        };
        debug!("loop at {}: {}", cand.header, message);
        self.remarks.push(Remark {
            pass: "loop-unroll",
            verdict,
            header: cand.header,
            factor: cand.unroll_factor,
            message,
        });
    }

    fn analyze_loop(
        &self,
        func: &Function,
        lp: &NaturalLoop,
        se: &ScalarEvolution,
        loop_idx: usize,
    ) -> UnrollCandidate {
        let mut cand = UnrollCandidate {
            header: func.blocks[lp.header].label,
            trip_count: se.small_constant_trip_count(loop_idx),
            trip_multiple: se.small_constant_trip_multiple(loop_idx),
            instruction_count: count_instructions(func, lp),
            is_canonical: lp.is_canonical(),
            has_side_effects: loop_has_side_effects(func, lp),
            has_calls: loop_has_calls(func, lp),
            strategy: UnrollStrategy::NoUnroll,
            unroll_factor: 1,
        };
        let (strategy, factor) = self.determine_strategy(&cand);
        cand.strategy = strategy;
        cand.unroll_factor = factor;
        debug!(
            "loop at {}: tc={} insns={} canonical={} side_effects={} -> {:?} x{}",
            cand.header,
            cand.trip_count,
            cand.instruction_count,
            cand.is_canonical,
            cand.has_side_effects,
            cand.strategy,
            cand.unroll_factor
        );
        cand
    }

    fn determine_strategy(&self, cand: &UnrollCandidate) -> (UnrollStrategy, u32) {
        let cfg = &self.config;
        if (cand.has_side_effects || cand.has_calls) && !cfg.allow_calls {
            return (UnrollStrategy::NoUnroll, 1);
        }
        if cand.trip_count > 0
            && cand.trip_count <= cfg.full_max_count
            && cand.trip_count * cand.instruction_count <= cfg.full_max_insns
        {
            return (UnrollStrategy::Full, cand.trip_count);
        }
        if cand.trip_count > 0 {
            // Largest factor that divides the trip count evenly and stays
            // under the size cap; no remainder loop is ever needed.
            let start = cfg.partial_factor.min(cfg.max_partial);
            let mut factor = start;
            while factor > 1
                && (cand.trip_count % factor != 0
                    || cand.instruction_count * factor > cfg.max_unrolled_size)
            {
                factor -= 1;
            }
            if factor > 1 {
                return (UnrollStrategy::Partial, factor);
            }
            return (UnrollStrategy::NoUnroll, 1);
        }
        if cfg.allow_runtime && cand.is_canonical {
            return (UnrollStrategy::Runtime, cfg.partial_factor);
        }
        (UnrollStrategy::NoUnroll, 1)
    }
}

/// Count non-phi, non-terminator instructions in the loop body.
fn count_instructions(func: &Function, lp: &NaturalLoop) -> u32 {
    let mut count = 0;
    for &bi in &lp.body {
        for &inst in &func.blocks[bi].insts {
            let data = func.inst(inst);
            if data.opcode != Opcode::Phi && !data.opcode.is_terminator() {
                count += 1;
            }
        }
    }
    count
}

/// A loop has side effects when it contains a call to a function not known
/// to be memory-pure, or any volatile or atomic operation.
fn loop_has_side_effects(func: &Function, lp: &NaturalLoop) -> bool {
    for &bi in &lp.body {
        for &inst in &func.blocks[bi].insts {
            let data = func.inst(inst);
            if data.attrs.volatile || data.attrs.atomic {
                return true;
            }
            if data.opcode == Opcode::Call
                && data.attrs.callee.as_ref().map_or(true, |c| !c.memory_pure)
            {
                return true;
            }
        }
    }
    false
}

fn loop_has_calls(func: &Function, lp: &NaturalLoop) -> bool {
    lp.body.iter().any(|&bi| {
        func.blocks[bi].insts.iter().any(|&inst| func.inst(inst).opcode == Opcode::Call)
    })
}
