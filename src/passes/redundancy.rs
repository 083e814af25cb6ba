//! Dominance-based value numbering.
//!
//! Assigns equivalence-class numbers to SSA values and indexes analyzable
//! instructions by a canonical [`ExpressionKey`]. Walking the dominator tree
//! in preorder guarantees that when a block is processed, every instruction
//! that could provide an available value for it has already been inserted
//! into the expression table, so availability reduces to a dominance check
//! at lookup time.
//!
//! Commutative opcodes canonicalize their operand value numbers into
//! ascending order before hashing, which is the only algebraic identity the
//! engine knows: `a + b` and `b + a` share a key, nothing else does.
//!
//! Value numbers start at 1; 0 is reserved for "not numbered". Two values
//! with the same number are definitionally equal; distinct numbers carry no
//! information.

use std::hash::{Hash, Hasher};

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::common::types::IrType;
use crate::ir::analysis::CfgAnalysis;
use crate::ir::ir::{Function, Inst, Opcode, Value};

/// The canonical identity of a computation: opcode, result type, operand
/// value numbers (sorted for commutative opcodes), comparison predicate
/// (0 when absent), and the in-bounds flag for address arithmetic. Two
/// instructions with equal keys compute the same value in any program state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionKey {
    pub opcode: u32,
    pub ty: IrType,
    pub operands: SmallVec<[u32; 2]>,
    pub predicate: u32,
    pub in_bounds: bool,
}

impl Hash for ExpressionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.mix());
    }
}

impl ExpressionKey {
    /// Rotate-and-xor mix over all five fields.
    fn mix(&self) -> u64 {
        const GOLDEN: u64 = 0x9e37_79b9;
        let combine = |h: u64, v: u64| -> u64 { (h.rotate_left(13) ^ v).wrapping_mul(GOLDEN) };
        let mut h = combine(GOLDEN, self.opcode as u64);
        h = combine(h, self.ty.code() as u64);
        for &vn in &self.operands {
            h = combine(h, vn as u64);
        }
        h = combine(h, self.predicate as u64);
        combine(h, self.in_bounds as u64)
    }
}

/// The value numbering engine: value-to-number map plus the expression
/// availability table. Owned by a single analysis run over one function.
pub struct ValueNumberTable {
    value_numbers: FxHashMap<Value, u32>,
    next: u32,
    /// Buckets keep insertion order; lookups scan newest first so the chosen
    /// provider is deterministic.
    expressions: FxHashMap<ExpressionKey, Vec<Inst>>,
}

impl Default for ValueNumberTable {
    fn default() -> Self {
        ValueNumberTable::new()
    }
}

impl ValueNumberTable {
    pub fn new() -> ValueNumberTable {
        ValueNumberTable { value_numbers: FxHashMap::default(), next: 1, expressions: FxHashMap::default() }
    }

    /// Number a value, assigning a fresh number on first sight. Idempotent.
    pub fn value_number(&mut self, v: Value) -> u32 {
        if let Some(&vn) = self.value_numbers.get(&v) {
            return vn;
        }
        let vn = self.next;
        self.next += 1;
        self.value_numbers.insert(v, vn);
        trace!("assigned VN {} to %{}", vn, v.0);
        vn
    }

    /// Number of a value, or 0 when it has not been numbered.
    pub fn lookup(&self, v: Value) -> u32 {
        self.value_numbers.get(&v).copied().unwrap_or(0)
    }

    /// Build the canonical key for an instruction, numbering its operands.
    pub fn make_key(&mut self, func: &Function, inst: Inst) -> ExpressionKey {
        let data = func.inst(inst);
        let mut operands: SmallVec<[u32; 2]> =
            data.args.iter().map(|&a| self.value_number(a)).collect();
        if data.opcode.is_commutative() && operands.len() == 2 && operands[0] > operands[1] {
            operands.swap(0, 1);
        }
        ExpressionKey {
            opcode: data.opcode.code(),
            ty: data.ty,
            operands,
            predicate: data.attrs.predicate.map_or(0, |p| p.code()),
            in_bounds: data.attrs.in_bounds,
        }
    }

    /// Find a previously inserted instruction under `key` that strictly
    /// dominates `query`. Buckets are scanned newest first, so of several
    /// dominating candidates the most recently inserted wins.
    pub fn find_available(&self, key: &ExpressionKey, query: Inst, cfg: &CfgAnalysis) -> Option<Inst> {
        let bucket = self.expressions.get(key)?;
        for &candidate in bucket.iter().rev() {
            if candidate == query {
                continue;
            }
            if cfg.dominates_inst(candidate, query) {
                trace!("available: i{} dominates i{}", candidate.0, query.0);
                return Some(candidate);
            }
        }
        None
    }

    /// Record an instruction as a provider for `key`.
    pub fn insert(&mut self, key: ExpressionKey, inst: Inst) {
        self.expressions.entry(key).or_default().push(inst);
    }

    pub fn clear(&mut self) {
        self.next = 1;
        self.value_numbers.clear();
        self.expressions.clear();
    }
}

/// Instructions eligible for the expression table: no phis, terminators,
/// memory operations, allocations, or calls, and nothing volatile, atomic,
/// or otherwise side-effecting. Everything else still receives a value
/// number so it can appear as an operand.
pub fn is_analyzable(func: &Function, inst: Inst) -> bool {
    let data = func.inst(inst);
    if data.opcode.is_terminator() {
        return false;
    }
    match data.opcode {
        Opcode::Phi | Opcode::Load | Opcode::Store | Opcode::Alloca | Opcode::Call => false,
        _ => !data.attrs.volatile && !data.attrs.atomic && !func.has_side_effects(inst),
    }
}

/// Counters for one analysis run.
#[derive(Debug, Default, Clone)]
pub struct RedundancyStats {
    pub total_instructions: u64,
    pub redundant_instructions: u64,
    pub unique_expressions: u64,
}

/// Result of the analysis: redundant instructions paired with the dominating
/// provider that can replace them, in discovery order.
#[derive(Default)]
pub struct RedundancyInfo {
    pub pairs: Vec<(Inst, Inst)>,
    pub stats: RedundancyStats,
}

impl RedundancyInfo {
    pub fn has_redundancies(&self) -> bool {
        !self.pairs.is_empty()
    }

    /// Replacement for a given redundant instruction.
    pub fn replacement_for(&self, inst: Inst) -> Option<Inst> {
        self.pairs.iter().find(|(r, _)| *r == inst).map(|&(_, p)| p)
    }
}

/// The analysis: number parameters first, then process blocks in
/// dominator-tree preorder, top to bottom within each block.
pub struct RedundancyAnalysis;

impl RedundancyAnalysis {
    pub fn run(func: &Function, cfg: &CfgAnalysis) -> RedundancyInfo {
        let mut result = RedundancyInfo::default();
        let mut vnt = ValueNumberTable::new();

        for &param in func.params() {
            vnt.value_number(param);
        }

        for &block_idx in &cfg.preorder {
            let block = &func.blocks[block_idx];
            for &inst in &block.insts {
                result.stats.total_instructions += 1;

                if !is_analyzable(func, inst) {
                    vnt.value_number(func.inst_result(inst));
                    continue;
                }

                let key = vnt.make_key(func, inst);
                if let Some(available) = vnt.find_available(&key, inst, cfg) {
                    trace!("redundant: i{} can reuse i{}", inst.0, available.0);
                    result.pairs.push((inst, available));
                    result.stats.redundant_instructions += 1;
                } else {
                    vnt.insert(key, inst);
                    result.stats.unique_expressions += 1;
                }

                vnt.value_number(func.inst_result(inst));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{IrType, Predicate};
    use crate::ir::builder::FunctionBuilder;

    fn analyze(func: &Function) -> RedundancyInfo {
        let cfg = CfgAnalysis::build(func);
        RedundancyAnalysis::run(func, &cfg)
    }

    #[test]
    fn test_commutative_keys_match() {
        let mut b = FunctionBuilder::new("comm", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let u = b.binop(Opcode::Add, IrType::I32, x, y);
        let v = b.binop(Opcode::Add, IrType::I32, y, x);
        let r = b.binop(Opcode::Add, IrType::I32, u, v);
        b.ret(Some(r));
        let func = b.finish();

        let mut vnt = ValueNumberTable::new();
        for &p in func.params() {
            vnt.value_number(p);
        }
        let ui = func.def_inst(u).unwrap();
        let vi = func.def_inst(v).unwrap();
        assert_eq!(vnt.make_key(&func, ui), vnt.make_key(&func, vi));

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 1);
        assert_eq!(info.pairs, vec![(vi, ui)]);
    }

    #[test]
    fn test_non_commutative_keys_differ() {
        let mut b = FunctionBuilder::new("sub", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let u = b.binop(Opcode::Sub, IrType::I32, x, y);
        let v = b.binop(Opcode::Sub, IrType::I32, y, x);
        let r = b.binop(Opcode::Add, IrType::I32, u, v);
        b.ret(Some(r));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
    }

    #[test]
    fn test_predicate_distinguishes_comparisons() {
        let mut b = FunctionBuilder::new("cmp", IrType::I8);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let lt = b.icmp(Predicate::Slt, x, y);
        let gt = b.icmp(Predicate::Sgt, x, y);
        let both = b.binop(Opcode::And, IrType::I8, lt, gt);
        b.ret(Some(both));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
    }

    #[test]
    fn test_dominating_provider_found_across_blocks() {
        let mut b = FunctionBuilder::new("dom", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        let next = b.create_block();
        b.switch_to(entry);
        let p = b.binop(Opcode::Add, IrType::I32, x, y);
        b.br(next);
        b.switch_to(next);
        let q = b.binop(Opcode::Add, IrType::I32, x, y);
        b.ret(Some(q));
        let func = b.finish();

        let info = analyze(&func);
        let pi = func.def_inst(p).unwrap();
        let qi = func.def_inst(q).unwrap();
        assert_eq!(info.pairs, vec![(qi, pi)]);
        // Dominance soundness: the provider dominates the query point.
        let cfg = CfgAnalysis::build(&func);
        assert!(cfg.dominates_inst(pi, qi));
    }

    #[test]
    fn test_no_match_without_dominance() {
        // Diamond: the same expression in both arms must not pair up.
        let mut b = FunctionBuilder::new("diamond", IrType::I32);
        let x = b.param(IrType::I32);
        let c = b.param(IrType::I8);
        let entry = b.create_block();
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.switch_to(entry);
        b.cond_br(c, left, right);
        b.switch_to(left);
        let one = b.iconst(IrType::I32, 1);
        let a = b.binop(Opcode::Add, IrType::I32, x, one);
        b.br(merge);
        b.switch_to(right);
        let bb = b.binop(Opcode::Add, IrType::I32, x, one);
        b.br(merge);
        b.switch_to(merge);
        let m = b.phi(IrType::I32, &[(a, left), (bb, right)]);
        b.ret(Some(m));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
    }

    #[test]
    fn test_volatile_load_not_entered() {
        let mut b = FunctionBuilder::new("vol", IrType::I32);
        let p = b.param(IrType::Ptr);
        let entry = b.create_block();
        b.switch_to(entry);
        let a = b.load_volatile(IrType::I32, p);
        let bb = b.load_volatile(IrType::I32, p);
        let s = b.binop(Opcode::Add, IrType::I32, a, bb);
        b.ret(Some(s));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
        // Non-analyzable instructions are still numbered for operand use.
        assert_eq!(info.stats.total_instructions, 4);
    }

    #[test]
    fn test_calls_not_entered_even_when_pure() {
        let mut b = FunctionBuilder::new("calls", IrType::I32);
        let x = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let a = b.call(IrType::I32, "f", &[x], true);
        let bb = b.call(IrType::I32, "f", &[x], true);
        let s = b.binop(Opcode::Add, IrType::I32, a, bb);
        b.ret(Some(s));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
    }

    #[test]
    fn test_type_distinguishes_expressions() {
        let mut b = FunctionBuilder::new("ty", IrType::I64);
        let x = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let a = b.cast(IrType::I64, x);
        let bb = b.cast(IrType::U64, x);
        let s = b.binop(Opcode::Add, IrType::I64, a, bb);
        b.ret(Some(s));
        let func = b.finish();

        let info = analyze(&func);
        assert_eq!(info.stats.redundant_instructions, 0);
    }

    #[test]
    fn test_later_copies_pair_with_first_provider() {
        // Three copies of the same expression in one block: redundant copies
        // never enter the table, so both later copies pair with the first.
        let mut b = FunctionBuilder::new("recent", IrType::I32);
        let x = b.param(IrType::I32);
        let y = b.param(IrType::I32);
        let entry = b.create_block();
        b.switch_to(entry);
        let e1 = b.binop(Opcode::Add, IrType::I32, x, y);
        let e2 = b.binop(Opcode::Add, IrType::I32, x, y);
        let e3 = b.binop(Opcode::Add, IrType::I32, x, y);
        let s1 = b.binop(Opcode::Mul, IrType::I32, e1, e2);
        let s2 = b.binop(Opcode::Mul, IrType::I32, s1, e3);
        b.ret(Some(s2));
        let func = b.finish();

        let info = analyze(&func);
        let i1 = func.def_inst(e1).unwrap();
        let i2 = func.def_inst(e2).unwrap();
        let i3 = func.def_inst(e3).unwrap();
        // Only the first copy enters the table; later copies are redundant
        // against it (they never become providers themselves).
        assert_eq!(info.pairs, vec![(i2, i1), (i3, i1)]);
    }
}
