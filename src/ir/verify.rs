//! IR well-formedness checker.
//!
//! Verifies the structural contract the passes assume: single definitions,
//! consistent def-use edges, definitions dominating uses, well-formed block
//! layouts (terminator last, phis first), and phi incoming entries matching
//! each block's actual predecessors. Malformed IR is out of contract for the
//! transformations; the combined pipeline checks this in debug builds
//! between passes.

use crate::common::error::VerifyError;
use crate::ir::analysis::CfgAnalysis;
use crate::ir::ir::{Function, Opcode, Value, ValueDef};

/// Check a function against the IR contract. Returns the first violation
/// found, in a deterministic order (blocks in layout order, instructions in
/// program order).
pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    verify_layout(func)?;
    let cfg = CfgAnalysis::build(func);
    verify_phis(func, &cfg)?;
    verify_def_use(func)?;
    verify_dominance(func, &cfg)?;
    Ok(())
}

fn verify_layout(func: &Function) -> Result<(), VerifyError> {
    for block in &func.blocks {
        if block.insts.is_empty() {
            return Err(VerifyError::EmptyBlock(block.label.0));
        }
        let mut seen_non_phi = false;
        for (pos, &inst) in block.insts.iter().enumerate() {
            let Some(data) = func.try_inst(inst) else {
                return Err(VerifyError::ErasedInBlock(inst.0));
            };
            let last = pos + 1 == block.insts.len();
            if data.opcode.is_terminator() && !last {
                return Err(VerifyError::MidBlockTerminator(block.label.0));
            }
            if last && !data.opcode.is_terminator() {
                return Err(VerifyError::MissingTerminator(block.label.0));
            }
            if data.opcode == Opcode::Phi {
                if seen_non_phi {
                    return Err(VerifyError::MisplacedPhi(block.label.0));
                }
            } else {
                seen_non_phi = true;
            }
            for target in &data.blocks {
                if data.opcode.is_terminator() && func.block_pos(*target).is_none() {
                    return Err(VerifyError::UnknownBlock(block.label.0, target.0));
                }
            }
        }
    }
    Ok(())
}

/// Every phi must carry exactly one incoming entry per distinct predecessor
/// of its block, and every entry must name one of those predecessors.
fn verify_phis(func: &Function, cfg: &CfgAnalysis) -> Result<(), VerifyError> {
    for (idx, block) in func.blocks.iter().enumerate() {
        let mut preds: Vec<usize> = cfg.preds.row(idx).iter().map(|&p| p as usize).collect();
        preds.sort_unstable();
        preds.dedup();
        for &inst in &block.insts {
            let data = func.inst(inst);
            if data.opcode != Opcode::Phi {
                continue;
            }
            let mut incoming = Vec::with_capacity(data.blocks.len());
            for pred in &data.blocks {
                match cfg.label_to_idx.get(pred) {
                    Some(&i) => incoming.push(i),
                    None => return Err(VerifyError::UnknownBlock(block.label.0, pred.0)),
                }
            }
            incoming.sort_unstable();
            if incoming != preds {
                return Err(VerifyError::PhiArityMismatch(
                    block.label.0,
                    data.blocks.len(),
                    preds.len(),
                ));
            }
        }
    }
    Ok(())
}

fn verify_def_use(func: &Function) -> Result<(), VerifyError> {
    // Every operand slot must have a matching use edge, and every use edge
    // must point at a live instruction holding that value in that slot.
    for block in &func.blocks {
        for &inst in &block.insts {
            let data = func.inst(inst);
            for (slot, &arg) in data.args.iter().enumerate() {
                let found = func
                    .uses(arg)
                    .iter()
                    .any(|e| e.user == inst && e.index as usize == slot);
                if !found {
                    return Err(VerifyError::MissingUseEdge(inst.0, slot));
                }
            }
        }
    }
    for v in 0..func.num_values() as u32 {
        let v = Value(v);
        for edge in func.uses(v) {
            let Some(data) = func.try_inst(edge.user) else {
                return Err(VerifyError::DanglingUse(v.0, edge.user.0));
            };
            if data.args.get(edge.index as usize) != Some(&v) {
                return Err(VerifyError::StaleUseEdge(v.0, edge.user.0, edge.index as usize));
            }
        }
    }
    Ok(())
}

fn verify_dominance(func: &Function, cfg: &CfgAnalysis) -> Result<(), VerifyError> {
    for block in &func.blocks {
        for &inst in &block.insts {
            let data = func.inst(inst);
            if data.opcode == Opcode::Phi {
                // A phi use must be dominated at the end of the incoming
                // block, not at the phi itself.
                for (&arg, &pred) in data.args.iter().zip(data.blocks.iter()) {
                    if let Some(def) = func.def_inst(arg) {
                        if !cfg.label_to_idx.contains_key(&pred) {
                            return Err(VerifyError::UnknownBlock(block.label.0, pred.0));
                        }
                        let Some(term) = func.terminator(pred) else {
                            return Err(VerifyError::MissingTerminator(pred.0));
                        };
                        if def != term && !cfg.dominates_inst(def, term) {
                            return Err(VerifyError::UseNotDominated(inst.0, arg.0));
                        }
                    }
                }
                continue;
            }
            for &arg in &data.args {
                if let Some(def) = func.def_inst(arg) {
                    if !cfg.dominates_inst(def, inst) {
                        return Err(VerifyError::UseNotDominated(inst.0, arg.0));
                    }
                }
            }
        }
    }
    verify_defs_attached(func)
}

fn verify_defs_attached(func: &Function) -> Result<(), VerifyError> {
    // Any value with live uses must have a live, attached definition.
    let mut in_block = vec![false; func.num_insts()];
    for block in &func.blocks {
        for &inst in &block.insts {
            in_block[inst.index()] = true;
        }
    }
    for v in 0..func.num_values() as u32 {
        let v = Value(v);
        if func.uses(v).is_empty() {
            continue;
        }
        if let ValueDef::Inst { inst, .. } = func.value_def(v) {
            if func.is_erased(*inst) || !in_block[inst.index()] {
                return Err(VerifyError::DetachedDef(v.0, inst.0));
            }
        }
    }
    Ok(())
}

/// Convenience wrapper used by debug assertions in the pipeline.
pub fn is_well_formed(func: &Function) -> bool {
    verify_function(func).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{IrType, Predicate};
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::ir::Opcode;

    #[test]
    fn test_well_formed_function_passes() {
        let mut b = FunctionBuilder::new("ok", IrType::I32);
        let p = b.param(IrType::I32);
        let entry = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let one = b.iconst(IrType::I32, 1);
        let x = b.binop(Opcode::Add, IrType::I32, p, one);
        b.br(exit);
        b.switch_to(exit);
        b.ret(Some(x));
        let func = b.finish();
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn test_missing_terminator_detected() {
        let mut b = FunctionBuilder::new("bad", IrType::Void);
        let entry = b.create_block();
        b.switch_to(entry);
        let c = b.iconst(IrType::I32, 1);
        let _ = b.binop(Opcode::Add, IrType::I32, c, c);
        let func = b.finish();
        assert_eq!(verify_function(&func), Err(VerifyError::MissingTerminator(0)));
    }

    #[test]
    fn test_use_before_def_detected() {
        // Build a valid function, then swap the two instructions so the use
        // precedes the definition.
        let mut b = FunctionBuilder::new("bad", IrType::I32);
        let p = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let x = b.binop(Opcode::Add, IrType::I32, p, p);
        let y = b.binop(Opcode::Mul, IrType::I32, x, p);
        b.ret(Some(y));
        let mut func = b.finish();
        let pos = func.block_pos(entry).unwrap();
        func.blocks[pos].insts.swap(0, 1);
        assert!(matches!(verify_function(&func), Err(VerifyError::UseNotDominated(..))));
    }

    #[test]
    fn test_phi_missing_incoming_detected() {
        // Diamond whose merge phi only covers one of its two predecessors.
        let mut b = FunctionBuilder::new("bad", IrType::I32);
        let p = b.param(IrType::I32);
        let c = b.param(IrType::I8);
        let entry = b.create_block();
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.switch_to(entry);
        b.cond_br(c, left, right);
        b.switch_to(left);
        let one = b.iconst(IrType::I32, 1);
        let a = b.binop(Opcode::Add, IrType::I32, p, one);
        b.br(merge);
        b.switch_to(right);
        b.br(merge);
        b.switch_to(merge);
        let m = b.phi(IrType::I32, &[(a, left)]);
        b.ret(Some(m));
        let func = b.finish();
        assert_eq!(verify_function(&func), Err(VerifyError::PhiArityMismatch(3, 1, 2)));
    }

    #[test]
    fn test_phi_naming_non_predecessor_detected() {
        // Two incomings for two predecessors, but one names the wrong block.
        let mut b = FunctionBuilder::new("bad", IrType::I32);
        let p = b.param(IrType::I32);
        let c = b.param(IrType::I8);
        let entry = b.create_block();
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.switch_to(entry);
        b.cond_br(c, left, right);
        b.switch_to(left);
        b.br(merge);
        b.switch_to(right);
        b.br(merge);
        b.switch_to(merge);
        // Second entry claims to come from the entry block, which does not
        // branch to the merge.
        let m = b.phi(IrType::I32, &[(p, left), (p, entry)]);
        b.ret(Some(m));
        let func = b.finish();
        assert_eq!(verify_function(&func), Err(VerifyError::PhiArityMismatch(3, 2, 2)));
    }

    #[test]
    fn test_phi_incoming_checked_at_edge() {
        // Loop where the phi's latch incoming is defined later in the loop
        // body: legal, since the value dominates the latch terminator even
        // though it does not dominate the phi.
        let mut b = FunctionBuilder::new("loop", IrType::I32);
        let entry = b.create_block();
        let header = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let zero = b.iconst(IrType::I32, 0);
        b.br(header);
        b.switch_to(header);
        // Placeholder incoming on the backedge, patched once `next` exists.
        let i = b.phi(IrType::I32, &[(zero, entry), (zero, header)]);
        let one = b.iconst(IrType::I32, 1);
        let next = b.binop(Opcode::Add, IrType::I32, i, one);
        let ten = b.iconst(IrType::I32, 10);
        let c = b.icmp(Predicate::Slt, next, ten);
        b.cond_br(c, header, exit);
        b.switch_to(exit);
        b.ret(Some(i));
        let mut func = b.finish();
        let phi = func.def_inst(i).unwrap();
        func.replace_phi_incoming(phi, header, header, next);
        assert_eq!(verify_function(&func), Ok(()));
    }
}
