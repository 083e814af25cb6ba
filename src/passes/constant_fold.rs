//! Aggressive constant folding.
//!
//! Each sweep has three phases: candidate collection (no mutation), folding
//! (uses redirected to the interned constant, instruction marked for
//! deletion), and bulk erasure. Sweeps repeat until a full pass changes
//! nothing, so chains like `c = a + b; d = c * 2` fold completely: `c` in one
//! sweep, `d` in the next, once `d`'s operand has become a constant.
//!
//! A candidate whose evaluation is undefined (division by a constant zero,
//! overflow on no-wrap arithmetic) is left untouched; that is an expected
//! outcome, not a failure.

use log::trace;

use crate::common::types::DataLayout;
use crate::ir::const_eval;
use crate::ir::ir::{Function, Inst, Opcode, Value};
use crate::passes::{PassResult, PreservedAnalyses};

/// Candidate counts per opcode family, plus the number of instructions
/// actually folded.
#[derive(Debug, Default, Clone)]
pub struct FoldStats {
    pub binary_ops: u64,
    pub comparisons: u64,
    pub casts: u64,
    pub selects: u64,
    pub geps: u64,
    pub folded: u64,
}

impl std::fmt::Display for FoldStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ConstantFolding statistics:")?;
        writeln!(f, "  Binary operators: {}", self.binary_ops)?;
        writeln!(f, "  Comparisons: {}", self.comparisons)?;
        writeln!(f, "  Casts: {}", self.casts)?;
        writeln!(f, "  Selects: {}", self.selects)?;
        writeln!(f, "  Address computations: {}", self.geps)?;
        write!(f, "  Folded: {}", self.folded)
    }
}

pub struct ConstantFoldPass {
    dl: DataLayout,
    stats: FoldStats,
}

impl ConstantFoldPass {
    pub fn new(dl: DataLayout) -> ConstantFoldPass {
        ConstantFoldPass { dl, stats: FoldStats::default() }
    }

    pub fn stats(&self) -> &FoldStats {
        &self.stats
    }

    /// Fold to fixed point. Preserves every analysis when nothing folded,
    /// none otherwise.
    pub fn run(&mut self, func: &mut Function) -> PassResult {
        let mut changed = false;
        let mut first_sweep = true;

        loop {
            // Phase 1: collect candidates without mutating.
            let mut candidates: Vec<Inst> = Vec::new();
            for block in &func.blocks {
                for &inst in &block.insts {
                    if self.is_candidate(func, inst, first_sweep) {
                        candidates.push(inst);
                    }
                }
            }
            first_sweep = false;
            if candidates.is_empty() {
                break;
            }

            // Phase 2: evaluate, redirect uses, and mark for deletion.
            let mut to_delete: Vec<Inst> = Vec::new();
            for &inst in &candidates {
                if let Some(replacement) = self.fold_one(func, inst) {
                    let result = func.inst_result(inst);
                    func.replace_all_uses(result, replacement);
                    to_delete.push(inst);
                    self.stats.folded += 1;
                }
            }

            // Phase 3: bulk erasure, never during iteration.
            if to_delete.is_empty() {
                break;
            }
            func.erase_insts(&to_delete);
            changed = true;
        }

        if changed {
            PassResult { changed: true, preserved: PreservedAnalyses::empty() }
        } else {
            PassResult { changed: false, preserved: PreservedAnalyses::all() }
        }
    }

    /// Folding predicate: the opcode family is foldable and the operands that
    /// must be constant are.
    fn is_candidate(&mut self, func: &Function, inst: Inst, count: bool) -> bool {
        let data = func.inst(inst);
        if func.has_side_effects(inst) {
            return false;
        }
        let is_const = |v: Value| func.const_value(v).is_some();
        match data.opcode {
            op if op.is_int_binary() || op.is_float_binary() => {
                if is_const(data.args[0]) && is_const(data.args[1]) {
                    if count {
                        self.stats.binary_ops += 1;
                    }
                    return true;
                }
                false
            }
            Opcode::Icmp | Opcode::Fcmp => {
                if is_const(data.args[0]) && is_const(data.args[1]) {
                    if count {
                        self.stats.comparisons += 1;
                    }
                    return true;
                }
                false
            }
            Opcode::Cast => {
                if is_const(data.args[0]) {
                    if count {
                        self.stats.casts += 1;
                    }
                    return true;
                }
                false
            }
            Opcode::Select => {
                // A constant condition is enough: the live arm replaces the
                // select verbatim, constant or not.
                if is_const(data.args[0]) {
                    if count {
                        self.stats.selects += 1;
                    }
                    return true;
                }
                false
            }
            Opcode::Gep => {
                if is_const(data.args[0]) && is_const(data.args[1]) {
                    if count {
                        self.stats.geps += 1;
                    }
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Compute the replacement value for one candidate, or `None` when the
    /// evaluation is not defined.
    fn fold_one(&mut self, func: &mut Function, inst: Inst) -> Option<Value> {
        let data = func.inst(inst);
        if data.opcode == Opcode::Select {
            if let Some(cond) = func.const_value(data.args[0]) {
                let arm = if cond.is_zero() { data.args[2] } else { data.args[1] };
                trace!("fold select i{} to its {} arm", inst.0, if cond.is_zero() { "false" } else { "true" });
                return Some(arm);
            }
        }
        let ty = data.ty;
        let value = const_eval::try_evaluate(func, inst, &self.dl)?;
        trace!("fold i{} to {:?}", inst.0, value);
        Some(func.make_const(value, ty))
    }
}
