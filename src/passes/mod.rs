//! Optimization passes and their host-facing surface.
//!
//! Three transformations share the analyses in this module: constant folding,
//! value-numbering redundancy elimination, and loop unrolling. Composed (the
//! `custom-optimize` entry point) they run in that order; each returns a
//! [`PassResult`] naming which analyses it preserved so the host can
//! invalidate the rest. [`FunctionAnalyses`] is the compute-on-demand cache
//! the combined pipeline threads through the passes.
//!
//! The registry maps the five pipeline names to runners:
//! `custom-constant-fold`, `custom-loop-unroll`, `custom-redundancy-elim`,
//! `print<custom-redundancy>`, and `custom-optimize`. The combined pipeline
//! also honors `SSAOPT_DISABLE_PASSES`, a comma list of `constfold`,
//! `redundancy`, and `unroll`.

pub mod constant_fold;
pub mod loop_analysis;
pub mod loop_unroll;
pub mod redundancy;
pub mod redundancy_elim;
pub mod unroll;

use bitflags::bitflags;
use log::debug;

use crate::common::types::DataLayout;
use crate::ir::analysis::CfgAnalysis;
use crate::ir::ir::Function;
use crate::ir::verify;
use crate::passes::constant_fold::ConstantFoldPass;
use crate::passes::loop_analysis::{LoopInfo, ScalarEvolution};
use crate::passes::loop_unroll::{LoopUnrollPass, UnrollConfig};
use crate::passes::redundancy::RedundancyAnalysis;
use crate::passes::redundancy_elim::{print_redundancy, RedundancyElimPass};

bitflags! {
    /// Analyses a pass guarantees are still valid after it runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PreservedAnalyses: u32 {
        const CFG = 1 << 0;
        const DOM_TREE = 1 << 1;
        const LOOP_INFO = 1 << 2;
        const SCALAR_EVOLUTION = 1 << 3;
    }
}

/// What a pass reports back to the host.
#[derive(Debug, Clone, Copy)]
pub struct PassResult {
    pub changed: bool,
    pub preserved: PreservedAnalyses,
}

impl PassResult {
    /// Nothing happened; everything the host computed is still valid.
    pub fn unchanged() -> PassResult {
        PassResult { changed: false, preserved: PreservedAnalyses::all() }
    }
}

/// Compute-on-demand analysis cache for one function, invalidated according
/// to the [`PassResult`]s of the passes that ran.
pub struct FunctionAnalyses {
    dl: DataLayout,
    cfg: Option<CfgAnalysis>,
    loops: Option<LoopInfo>,
    scev: Option<ScalarEvolution>,
}

impl FunctionAnalyses {
    pub fn new(dl: DataLayout) -> FunctionAnalyses {
        FunctionAnalyses { dl, cfg: None, loops: None, scev: None }
    }

    /// Drop everything a pass did not preserve. The CFG bundle also carries
    /// the dominator tree, so both flags must be preserved for it to
    /// survive; loop info and trip counts are derived from it and fall with
    /// it.
    pub fn invalidate(&mut self, preserved: PreservedAnalyses) {
        if !preserved.contains(PreservedAnalyses::CFG | PreservedAnalyses::DOM_TREE) {
            self.cfg = None;
        }
        if !preserved.contains(PreservedAnalyses::LOOP_INFO) || self.cfg.is_none() {
            self.loops = None;
        }
        if !preserved.contains(PreservedAnalyses::SCALAR_EVOLUTION) || self.loops.is_none() {
            self.scev = None;
        }
    }

    pub fn cfg(&mut self, func: &Function) -> &CfgAnalysis {
        if self.cfg.is_none() {
            self.cfg = Some(CfgAnalysis::build(func));
        }
        self.cfg.as_ref().unwrap()
    }

    pub fn loops(&mut self, func: &Function) -> &LoopInfo {
        if self.loops.is_none() {
            if self.cfg.is_none() {
                self.cfg = Some(CfgAnalysis::build(func));
            }
            self.loops = Some(LoopInfo::compute(self.cfg.as_ref().unwrap()));
        }
        self.loops.as_ref().unwrap()
    }

    pub fn scalar_evolution(&mut self, func: &Function) -> &ScalarEvolution {
        if self.scev.is_none() {
            self.loops(func);
            self.scev =
                Some(ScalarEvolution::compute(func, self.loops.as_ref().unwrap(), &self.dl));
        }
        self.scev.as_ref().unwrap()
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Run constant-fold, redundancy-eliminate, and loop-unroll in order,
/// sharing the dominator analysis where a pass keeps it valid. Returns the
/// combined result: changed if any pass changed, preserving only what every
/// pass preserved.
pub fn optimize(func: &mut Function, dl: &DataLayout, config: &UnrollConfig) -> PassResult {
    let disabled = std::env::var("SSAOPT_DISABLE_PASSES").unwrap_or_default();
    let mut changed = false;
    let mut preserved = PreservedAnalyses::all();
    let mut analyses = FunctionAnalyses::new(*dl);

    debug_assert!(verify::is_well_formed(func), "malformed IR handed to optimize");

    if !disabled.contains("constfold") {
        let mut pass = ConstantFoldPass::new(*dl);
        let result = pass.run(func);
        debug!("{}", pass.stats());
        changed |= result.changed;
        preserved &= result.preserved;
        analyses.invalidate(result.preserved);
        debug_assert!(verify::is_well_formed(func), "constant folding broke the IR");
    }

    if !disabled.contains("redundancy") {
        let mut pass = RedundancyElimPass::new();
        let result = {
            let cfg = analyses.cfg(func);
            pass.run_with_analysis(func, cfg)
        };
        debug!("{}", pass.stats());
        changed |= result.changed;
        preserved &= result.preserved;
        analyses.invalidate(result.preserved);
        debug_assert!(verify::is_well_formed(func), "redundancy elimination broke the IR");
    }

    if !disabled.contains("unroll") {
        let mut pass = LoopUnrollPass::new(config.clone(), *dl);
        let result = pass.run(func);
        debug!("{}", pass.stats());
        changed |= result.changed;
        preserved &= result.preserved;
        analyses.invalidate(result.preserved);
        debug_assert!(verify::is_well_formed(func), "loop unrolling broke the IR");
    }

    PassResult { changed, preserved }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub const CONSTANT_FOLD_NAME: &str = "custom-constant-fold";
pub const LOOP_UNROLL_NAME: &str = "custom-loop-unroll";
pub const REDUNDANCY_ELIM_NAME: &str = "custom-redundancy-elim";
pub const PRINT_REDUNDANCY_NAME: &str = "print<custom-redundancy>";
pub const OPTIMIZE_NAME: &str = "custom-optimize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassName {
    ConstantFold,
    LoopUnroll,
    RedundancyElim,
    PrintRedundancy,
    Optimize,
}

/// All registered entry-point names.
pub fn pass_names() -> [&'static str; 5] {
    [
        CONSTANT_FOLD_NAME,
        LOOP_UNROLL_NAME,
        REDUNDANCY_ELIM_NAME,
        PRINT_REDUNDANCY_NAME,
        OPTIMIZE_NAME,
    ]
}

/// Resolve a pipeline name to a pass.
pub fn parse_pass_name(name: &str) -> Option<PassName> {
    match name {
        CONSTANT_FOLD_NAME => Some(PassName::ConstantFold),
        LOOP_UNROLL_NAME => Some(PassName::LoopUnroll),
        REDUNDANCY_ELIM_NAME => Some(PassName::RedundancyElim),
        PRINT_REDUNDANCY_NAME => Some(PassName::PrintRedundancy),
        OPTIMIZE_NAME => Some(PassName::Optimize),
        _ => None,
    }
}

/// Run a registered pass. `out` only receives text for the printer pass.
pub fn run_pass(
    name: PassName,
    func: &mut Function,
    dl: &DataLayout,
    out: &mut dyn std::fmt::Write,
) -> PassResult {
    match name {
        PassName::ConstantFold => ConstantFoldPass::new(*dl).run(func),
        PassName::LoopUnroll => LoopUnrollPass::new(UnrollConfig::default(), *dl).run(func),
        PassName::RedundancyElim => RedundancyElimPass::new().run(func),
        PassName::PrintRedundancy => {
            let cfg = CfgAnalysis::build(func);
            let info = RedundancyAnalysis::run(func, &cfg);
            let _ = print_redundancy(func, &info, out);
            PassResult::unchanged()
        }
        PassName::Optimize => optimize(func, dl, &UnrollConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{IrType, Predicate};
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::{IrConst, Opcode};
    use crate::ir::print::function_to_string;
    use crate::ir::verify::verify_function;

    /// A function exercising all three passes: a constant chain, a
    /// commutative redundancy, and a fully unrollable loop.
    fn mixed_function() -> Function {
        let mut b = FunctionBuilder::new("mixed", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let ten = b.iconst(IrType::I32, 10);
        let twenty = b.iconst(IrType::I32, 20);
        let k = b.binop(Opcode::Add, IrType::I32, ten, twenty);
        let u = b.binop(Opcode::Add, IrType::I32, x, y);
        let v = b.binop(Opcode::Add, IrType::I32, y, x);
        let seed = b.binop(Opcode::Add, IrType::I32, u, v);
        let zero = b.iconst(IrType::I32, 0);
        b.br(body);
        b.switch_to(body);
        let i = b.phi(IrType::I32, &[(zero, entry), (zero, body)]);
        let acc = b.phi(IrType::I32, &[(seed, entry), (seed, body)]);
        let acc_next = b.binop(Opcode::Add, IrType::I32, acc, k);
        let one = b.iconst(IrType::I32, 1);
        let i_next = b.binop(Opcode::Add, IrType::I32, i, one);
        let four = b.iconst(IrType::I32, 4);
        let c = b.icmp(Predicate::Slt, i_next, four);
        b.cond_br(c, body, exit);
        b.switch_to(exit);
        let r = b.phi(IrType::I32, &[(acc_next, body)]);
        b.ret(Some(r));
        let mut func = b.finish();
        func.replace_phi_incoming(func.def_inst(i).unwrap(), body, body, i_next);
        func.replace_phi_incoming(func.def_inst(acc).unwrap(), body, body, acc_next);
        func
    }

    #[test]
    fn test_optimize_runs_all_three_passes() {
        let mut func = mixed_function();
        let result = optimize(&mut func, &DataLayout::default(), &UnrollConfig::default());
        assert!(result.changed);
        assert_eq!(verify_function(&func), Ok(()));
        // The constant chain folded, the commutative duplicate is gone, and
        // the loop is straight-line code now.
        let text = function_to_string(&func);
        assert!(!text.contains("condbr"));
        let adds = func
            .blocks
            .iter()
            .flat_map(|bl| bl.insts.iter())
            .filter(|&&i| func.inst(i).opcode == Opcode::Add)
            .count();
        // seed = u + u, plus four unrolled accumulations.
        assert!(adds >= 5);
    }

    #[test]
    fn test_optimize_is_deterministic() {
        let run = || {
            let mut func = mixed_function();
            optimize(&mut func, &DataLayout::default(), &UnrollConfig::default());
            function_to_string(&func)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_second_fold_after_elimination_is_noop() {
        // fold -> eliminate -> fold: the second fold finds nothing, since
        // elimination replaces instructions with equivalent non-constants.
        let mut func = mixed_function();
        let dl = DataLayout::default();
        let mut fold = ConstantFoldPass::new(dl);
        assert!(fold.run(&mut func).changed);
        let mut elim = RedundancyElimPass::new();
        elim.run(&mut func);
        let mut fold2 = ConstantFoldPass::new(dl);
        let again = fold2.run(&mut func);
        assert!(!again.changed);
        assert!(again.preserved.is_all());
    }

    #[test]
    fn test_registry_resolves_all_names() {
        for name in pass_names() {
            assert!(parse_pass_name(name).is_some(), "unresolved pass name {name}");
        }
        assert_eq!(parse_pass_name("custom-optimize"), Some(PassName::Optimize));
        assert_eq!(parse_pass_name("no-such-pass"), None);
    }

    #[test]
    fn test_print_pass_reports_and_preserves() {
        let mut b = FunctionBuilder::new("rep", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let u = b.binop(Opcode::Add, IrType::I32, x, y);
        let v = b.binop(Opcode::Add, IrType::I32, y, x);
        let s = b.binop(Opcode::Add, IrType::I32, u, v);
        b.ret(Some(s));
        let mut func = b.finish();

        let before = function_to_string(&func);
        let mut out = String::new();
        let result = run_pass(PassName::PrintRedundancy, &mut func, &DataLayout::default(), &mut out);
        assert!(!result.changed);
        assert!(result.preserved.is_all());
        assert!(out.contains("Redundant instructions found: 1"));
        assert_eq!(function_to_string(&func), before);
    }

    #[test]
    fn test_constant_chain_through_registry() {
        let mut b = FunctionBuilder::new("chain", IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let ten = b.iconst(IrType::I32, 10);
        let twenty = b.iconst(IrType::I32, 20);
        let two = b.iconst(IrType::I32, 2);
        let three = b.iconst(IrType::I32, 3);
        let a = b.binop(Opcode::Add, IrType::I32, ten, twenty);
        let m = b.binop(Opcode::Mul, IrType::I32, a, two);
        let d = b.binop(Opcode::SDiv, IrType::I32, m, three);
        b.ret(Some(d));
        let mut func = b.finish();

        let mut out = String::new();
        let result = run_pass(PassName::ConstantFold, &mut func, &DataLayout::default(), &mut out);
        assert!(result.changed);
        let insts: Vec<_> = func.block_insts(entry).collect();
        assert_eq!(insts.len(), 1);
        assert_eq!(func.const_value(func.inst(insts[0]).args[0]), Some(IrConst::I32(20)));
    }

    #[test]
    fn test_analysis_cache_invalidation() {
        let mut func = mixed_function();
        let dl = DataLayout::default();
        let mut analyses = FunctionAnalyses::new(dl);
        let _ = analyses.scalar_evolution(&func);

        // Folding preserves nothing when it changes the function.
        let mut fold = ConstantFoldPass::new(dl);
        let result = fold.run(&mut func);
        assert!(result.changed);
        analyses.invalidate(result.preserved);
        // The cache rebuilds on demand and still reflects the live IR.
        let loops = analyses.loops(&func);
        assert_eq!(loops.loops.len(), 1);
    }
}
