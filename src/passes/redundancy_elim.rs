//! Redundancy elimination.
//!
//! Consumes the pairs produced by [`RedundancyAnalysis`] and rewrites each
//! redundant instruction to reference its dominating provider: redirect all
//! uses, then erase in bulk once the whole map has been processed.
//!
//! The replacement map may contain chains (the provider of one pair being
//! itself redundant to an earlier instruction), so replacements are chased to
//! their terminal provider before any use is redirected. A pair whose types
//! disagree is skipped at debug log level rather than failed; SSA guarantees
//! the erasures cannot otherwise interfere, because a provider is always
//! defined before the instruction it replaces.

use log::debug;
use rustc_hash::FxHashMap;

use crate::ir::analysis::CfgAnalysis;
use crate::ir::ir::{Function, Inst};
use crate::ir::print::inst_to_string;
use crate::passes::redundancy::{RedundancyAnalysis, RedundancyInfo};
use crate::passes::{PassResult, PreservedAnalyses};

#[derive(Debug, Default, Clone)]
pub struct ElimStats {
    pub functions_processed: u64,
    pub instructions_eliminated: u64,
}

impl std::fmt::Display for ElimStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RedundancyElimination statistics:")?;
        writeln!(f, "  Functions processed: {}", self.functions_processed)?;
        write!(f, "  Instructions eliminated: {}", self.instructions_eliminated)
    }
}

#[derive(Default)]
pub struct RedundancyElimPass {
    stats: ElimStats,
}

impl RedundancyElimPass {
    pub fn new() -> RedundancyElimPass {
        RedundancyElimPass::default()
    }

    pub fn stats(&self) -> &ElimStats {
        &self.stats
    }

    /// Run the analysis and eliminate what it found. Preserves the CFG
    /// structure and the dominator tree; instruction removal moves no block
    /// edges.
    pub fn run(&mut self, func: &mut Function) -> PassResult {
        let cfg = CfgAnalysis::build(func);
        self.run_with_analysis(func, &cfg)
    }

    /// Same as [`run`](Self::run) with a caller-supplied dominator analysis,
    /// so a pipeline can share one bundle across passes that keep the CFG
    /// intact.
    pub fn run_with_analysis(&mut self, func: &mut Function, cfg: &CfgAnalysis) -> PassResult {
        self.stats.functions_processed += 1;
        let info = RedundancyAnalysis::run(func, cfg);
        let changed = self.eliminate(func, &info);
        if changed {
            PassResult {
                changed: true,
                preserved: PreservedAnalyses::CFG | PreservedAnalyses::DOM_TREE,
            }
        } else {
            PassResult { changed: false, preserved: PreservedAnalyses::all() }
        }
    }

    /// Apply a previously computed analysis result.
    pub fn eliminate(&mut self, func: &mut Function, info: &RedundancyInfo) -> bool {
        if !info.has_redundancies() {
            return false;
        }

        let chain: FxHashMap<Inst, Inst> = info.pairs.iter().copied().collect();
        let mut to_delete: Vec<Inst> = Vec::new();

        for &(redundant, provider) in &info.pairs {
            // Earlier transformations may already have erased either side.
            if func.is_erased(redundant) {
                continue;
            }
            // Chase chains to the terminal provider. Chains always walk up
            // the dominance order, so they terminate.
            let mut provider = provider;
            while let Some(&next) = chain.get(&provider) {
                provider = next;
            }
            if func.is_erased(provider) {
                continue;
            }

            if func.inst(redundant).ty != func.inst(provider).ty {
                debug!(
                    "type mismatch, skipping: {} vs {}",
                    inst_to_string(func, redundant),
                    inst_to_string(func, provider)
                );
                continue;
            }

            func.replace_all_uses(func.inst_result(redundant), func.inst_result(provider));
            to_delete.push(redundant);
            self.stats.instructions_eliminated += 1;
        }

        func.erase_insts(&to_delete);
        !to_delete.is_empty()
    }
}

/// Render an analysis report. This is the `print<custom-redundancy>` entry
/// point's output.
pub fn print_redundancy(
    func: &Function,
    info: &RedundancyInfo,
    out: &mut dyn std::fmt::Write,
) -> std::fmt::Result {
    writeln!(out, "Redundancy analysis for function: {}", func.name)?;
    writeln!(out, "  Total instructions analyzed: {}", info.stats.total_instructions)?;
    writeln!(out, "  Redundant instructions found: {}", info.stats.redundant_instructions)?;
    writeln!(out, "  Unique expressions: {}", info.stats.unique_expressions)?;
    if info.has_redundancies() {
        writeln!(out)?;
        writeln!(out, "Redundant instructions:")?;
        for &(redundant, provider) in &info.pairs {
            writeln!(out, "  {}", inst_to_string(func, redundant))?;
            writeln!(out, "    -> can be replaced by: {}", inst_to_string(func, provider))?;
        }
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::IrType;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::Opcode;
    use crate::ir::print::function_to_string;
    use crate::ir::verify::verify_function;

    #[test]
    fn test_commutative_pair_eliminated() {
        // u = x + y; v = y + x; return u + v  =>  return u + u
        let mut b = FunctionBuilder::new("comm", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let u = b.binop(Opcode::Add, IrType::I32, x, y);
        let v = b.binop(Opcode::Add, IrType::I32, y, x);
        let r = b.binop(Opcode::Add, IrType::I32, u, v);
        b.ret(Some(r));
        let mut func = b.finish();

        let mut pass = RedundancyElimPass::new();
        let result = pass.run(&mut func);
        assert!(result.changed);
        assert!(result.preserved.contains(PreservedAnalyses::DOM_TREE));
        assert_eq!(pass.stats().instructions_eliminated, 1);

        let insts: Vec<_> = func.block_insts(entry).collect();
        assert_eq!(insts.len(), 3);
        let sum = func.inst(insts[1]);
        assert_eq!(sum.args[0], u);
        assert_eq!(sum.args[1], u);
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn test_dominance_blocks_replacement() {
        // p = x + y in one branch arm, q = x + y in the merge block: the arm
        // does not dominate the merge, so both survive.
        let mut b = FunctionBuilder::new("nodom", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let c = b.param(IrType::I8);
        let entry = b.create_block();
        let arm = b.create_block();
        let other = b.create_block();
        let merge = b.create_block();
        b.switch_to(entry);
        b.cond_br(c, arm, other);
        b.switch_to(arm);
        let p = b.binop(Opcode::Add, IrType::I32, x, y);
        b.br(merge);
        b.switch_to(other);
        b.br(merge);
        b.switch_to(merge);
        let zero = b.iconst(IrType::I32, 0);
        let m = b.phi(IrType::I32, &[(p, arm), (zero, other)]);
        let q = b.binop(Opcode::Add, IrType::I32, x, y);
        let s = b.binop(Opcode::Add, IrType::I32, m, q);
        b.ret(Some(s));
        let mut func = b.finish();

        let before = function_to_string(&func);
        let mut pass = RedundancyElimPass::new();
        let result = pass.run(&mut func);
        assert!(!result.changed);
        assert_eq!(function_to_string(&func), before);
    }

    #[test]
    fn test_chain_resolves_to_terminal_provider() {
        // Three equal expressions in a dominance chain of blocks. The second
        // and third both pair with the first; uses must end up on it.
        let mut b = FunctionBuilder::new("chain", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let b0 = b.create_block();
        let b1 = b.create_block();
        let b2 = b.create_block();
        b.switch_to(b0);
        let e1 = b.binop(Opcode::Add, IrType::I32, x, y);
        b.br(b1);
        b.switch_to(b1);
        let e2 = b.binop(Opcode::Add, IrType::I32, x, y);
        b.br(b2);
        b.switch_to(b2);
        let e3 = b.binop(Opcode::Add, IrType::I32, x, y);
        let s = b.binop(Opcode::Add, IrType::I32, e2, e3);
        b.ret(Some(s));
        let mut func = b.finish();

        let mut pass = RedundancyElimPass::new();
        let result = pass.run(&mut func);
        assert!(result.changed);
        assert_eq!(pass.stats().instructions_eliminated, 2);
        let sum = func.def_inst(s).unwrap();
        assert_eq!(func.inst(sum).args[0], e1);
        assert_eq!(func.inst(sum).args[1], e1);
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn test_no_redundancy_leaves_ir_byte_identical() {
        let mut b = FunctionBuilder::new("clean", IrType::I32);
        let x = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let one = b.iconst(IrType::I32, 1);
        let a = b.binop(Opcode::Add, IrType::I32, x, one);
        let c = b.binop(Opcode::Sub, IrType::I32, a, x);
        b.ret(Some(c));
        let mut func = b.finish();

        let before = function_to_string(&func);
        let mut pass = RedundancyElimPass::new();
        let result = pass.run(&mut func);
        assert!(!result.changed);
        assert!(result.preserved.is_all());
        assert_eq!(function_to_string(&func), before);
    }

    #[test]
    fn test_report_shape() {
        let mut b = FunctionBuilder::new("rep", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let u = b.binop(Opcode::Add, IrType::I32, x, y);
        let v = b.binop(Opcode::Add, IrType::I32, y, x);
        let r = b.binop(Opcode::Add, IrType::I32, u, v);
        b.ret(Some(r));
        let func = b.finish();

        let cfg = CfgAnalysis::build(&func);
        let info = RedundancyAnalysis::run(&func, &cfg);
        let mut out = String::new();
        print_redundancy(&func, &info, &mut out).unwrap();
        assert!(out.contains("Redundancy analysis for function: rep"));
        assert!(out.contains("Redundant instructions found: 1"));
        assert!(out.contains("-> can be replaced by:"));
    }
}
