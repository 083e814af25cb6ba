//! Natural loop discovery, loop nesting, and trip-count analysis.
//!
//! A natural loop is identified by a back edge (tail -> header) where the
//! header dominates the tail; the body is every block that reaches the tail
//! without passing through the header. Loops sharing a header are merged:
//! multiple back edges to one header (a `continue` plus a normal latch, say)
//! each produce a partial body, and analyzing a partial body independently
//! would miss side effects that live in the rest of the loop.
//!
//! Trip counts come from the canonical induction pattern: a header phi with a
//! constant-stepped increment feeding the backedge and an exit comparison in
//! the latch. When the pattern's bound is also constant, the iteration count
//! is evaluated concretely (bounded, so "small constant" stays small); any
//! other shape reports 0, meaning unknown at compile time.

use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

use crate::common::types::{DataLayout, Predicate};
use crate::ir::analysis::{CfgAnalysis, FlatAdj};
use crate::ir::const_eval::{const_int, fold_icmp, sext};
use crate::ir::ir::{BlockId, Function, Inst, Opcode, Value};

/// Beyond this many simulated iterations a trip count stops being "small"
/// and is reported as unknown.
const TRIP_COUNT_CAP: u64 = 1 << 16;

/// A natural loop. Block references are indices into the function's block
/// list at the time the owning [`LoopInfo`] was computed.
pub struct NaturalLoop {
    /// The header block index, target of the back edge(s).
    pub header: usize,
    /// All block indices forming the loop body (includes the header).
    pub body: FxHashSet<usize>,
    /// The unique back-edge source, when there is exactly one.
    pub latch: Option<usize>,
    /// The unique predecessor of the header from outside the loop.
    pub preheader: Option<usize>,
    /// Blocks outside the loop that a loop block branches to, ascending.
    pub exits: Vec<usize>,
    /// Immediately enclosing loop, as an index into `LoopInfo::loops`.
    pub parent: Option<usize>,
    /// Nesting depth; top-level loops have depth 1.
    pub depth: u32,
}

impl NaturalLoop {
    /// Canonical form: preheader and latch both exist.
    pub fn is_canonical(&self) -> bool {
        self.preheader.is_some() && self.latch.is_some()
    }

    pub fn contains(&self, block: usize) -> bool {
        self.body.contains(&block)
    }
}

/// Loop nest information for one function.
pub struct LoopInfo {
    pub loops: Vec<NaturalLoop>,
    /// Innermost loop per block index.
    innermost: Vec<Option<usize>>,
}

impl LoopInfo {
    pub fn compute(cfg: &CfgAnalysis) -> LoopInfo {
        let n = cfg.num_blocks;

        // Find back edges, grouping tails by header. BTreeMap keeps header
        // order deterministic.
        let mut back_edges: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for tail in 0..n {
            for &header in cfg.succs.row(tail) {
                let header = header as usize;
                if cfg.dominates(header, tail) {
                    back_edges.entry(header).or_default().push(tail);
                }
            }
        }

        let mut loops = Vec::with_capacity(back_edges.len());
        for (header, tails) in back_edges {
            let mut body = FxHashSet::default();
            for &tail in &tails {
                grow_loop_body(&mut body, header, tail, &cfg.preds);
            }
            let latch = if tails.len() == 1 { Some(tails[0]) } else { None };

            let mut outside_preds: Vec<usize> = cfg
                .preds
                .row(header)
                .iter()
                .map(|&p| p as usize)
                .filter(|p| !body.contains(p))
                .collect();
            outside_preds.sort_unstable();
            outside_preds.dedup();
            let preheader = if outside_preds.len() == 1 { Some(outside_preds[0]) } else { None };

            let mut exits: Vec<usize> = Vec::new();
            let mut sorted_body: Vec<usize> = body.iter().copied().collect();
            sorted_body.sort_unstable();
            for &b in &sorted_body {
                for &s in cfg.succs.row(b) {
                    let s = s as usize;
                    if !body.contains(&s) {
                        exits.push(s);
                    }
                }
            }
            exits.sort_unstable();
            exits.dedup();

            loops.push(NaturalLoop {
                header,
                body,
                latch,
                preheader,
                exits,
                parent: None,
                depth: 1,
            });
        }

        // Nesting: after the per-header merge, two loops with distinct
        // headers are either disjoint or nested, so the immediately enclosing
        // loop is the smallest one containing this loop's header.
        for i in 0..loops.len() {
            let mut best: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].body.contains(&loops[i].header) {
                    continue;
                }
                if loops[j].body.len() <= loops[i].body.len() {
                    continue;
                }
                if best.map_or(true, |b| loops[j].body.len() < loops[b].body.len()) {
                    best = Some(j);
                }
            }
            loops[i].parent = best;
        }
        for i in 0..loops.len() {
            let mut depth = 1;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = depth;
        }

        let mut innermost: Vec<Option<usize>> = vec![None; n];
        for (idx, lp) in loops.iter().enumerate() {
            for &b in &lp.body {
                match innermost[b] {
                    Some(prev) if loops[prev].body.len() <= lp.body.len() => {}
                    _ => innermost[b] = Some(idx),
                }
            }
        }

        LoopInfo { loops, innermost }
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Loops with no enclosing loop.
    pub fn top_level_loops(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.loops.len()).filter(|&i| self.loops[i].parent.is_none())
    }

    pub fn is_header(&self, block: usize) -> bool {
        self.loops.iter().any(|l| l.header == block)
    }

    /// Innermost loop containing a block.
    pub fn loop_for(&self, block: usize) -> Option<usize> {
        self.innermost.get(block).copied().flatten()
    }

    /// Loops ordered outermost first (parents before children).
    pub fn preorder(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.loops.len()).collect();
        order.sort_by(|&a, &b| {
            self.loops[b]
                .body
                .len()
                .cmp(&self.loops[a].body.len())
                .then(self.loops[a].header.cmp(&self.loops[b].header))
        });
        order
    }

    /// Loops ordered innermost first (children before parents).
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = self.preorder();
        order.reverse();
        order
    }
}

/// Extend `body` with every block that reaches `tail` backwards. The header
/// goes in first and acts as the barrier: the walk never expands past it, so
/// only blocks inside this back edge's loop are collected. A self-loop
/// (tail == header) contributes nothing beyond the header itself, and tails
/// already absorbed by an earlier back edge of the same header are skipped
/// outright.
fn grow_loop_body(body: &mut FxHashSet<usize>, header: usize, tail: usize, preds: &FlatAdj) {
    body.insert(header);
    if !body.insert(tail) {
        return;
    }
    let mut frontier = vec![tail];
    while let Some(b) = frontier.pop() {
        frontier.extend(
            preds.row(b).iter().map(|&p| p as usize).filter(|&p| body.insert(p)),
        );
    }
}

// ── Induction pattern ─────────────────────────────────────────────────────────

/// The canonical counted-loop shape: a header phi stepped by a constant, fed
/// back through the latch, and compared against a bound to decide the back
/// edge. Recognized only for single-block loops (header == latch), where the
/// exit test is the block terminator.
pub struct IvPattern {
    /// Induction phi in the header.
    pub phi: Inst,
    /// The add producing the stepped value.
    pub next: Inst,
    /// Initial value, incoming from the preheader.
    pub init: Value,
    pub step: i64,
    /// Comparison bound (constant or not).
    pub bound: Value,
    pub pred: Predicate,
    pub cmp: Inst,
    /// The comparison reads the stepped value rather than the phi.
    pub cmp_on_next: bool,
    /// The conditional branch takes the back edge on a true condition.
    pub backedge_on_true: bool,
    pub exit_block: BlockId,
}

/// Recognize the induction pattern of a single-block loop.
pub fn induction_pattern(func: &Function, lp: &NaturalLoop) -> Option<IvPattern> {
    let latch = lp.latch?;
    if latch != lp.header || lp.preheader.is_none() {
        return None;
    }
    let header_label = func.blocks[lp.header].label;
    let preheader_label = func.blocks[lp.preheader?].label;

    let term = func.terminator(header_label)?;
    let term_data = func.inst(term);
    if term_data.opcode != Opcode::CondBr {
        return None;
    }
    let backedge_on_true = term_data.blocks[0] == header_label;
    let exit_block = if backedge_on_true { term_data.blocks[1] } else { term_data.blocks[0] };
    if (backedge_on_true && term_data.blocks[1] == header_label)
        || (!backedge_on_true && term_data.blocks[1] != header_label)
    {
        return None; // Both or neither target is the header.
    }

    let cmp = func.def_inst(term_data.args[0])?;
    let cmp_data = func.inst(cmp);
    if cmp_data.opcode != Opcode::Icmp {
        return None;
    }
    let pred = cmp_data.attrs.predicate?;
    let bound = cmp_data.args[1];
    let probe = cmp_data.args[0];

    // The compared value is either the phi itself or the stepped value.
    let probe_inst = func.def_inst(probe)?;
    let (phi, next, cmp_on_next) = match func.inst(probe_inst).opcode {
        Opcode::Phi => {
            let next = find_step(func, header_label, probe)?;
            (probe_inst, next, false)
        }
        Opcode::Add => {
            let add_data = func.inst(probe_inst);
            let phi_arg = add_data.args.iter().copied().find(|&a| {
                func.def_inst(a)
                    .map_or(false, |d| func.inst(d).opcode == Opcode::Phi && func.inst(d).block == header_label)
            })?;
            (func.def_inst(phi_arg)?, probe_inst, true)
        }
        _ => return None,
    };

    let phi_data = func.inst(phi);
    if phi_data.opcode != Opcode::Phi || phi_data.block != header_label || phi_data.args.len() != 2 {
        return None;
    }
    let init = func.phi_incoming(phi, preheader_label)?;
    let latch_in = func.phi_incoming(phi, header_label)?;
    if latch_in != func.inst_result(next) {
        return None;
    }

    let next_data = func.inst(next);
    if next_data.opcode != Opcode::Add {
        return None;
    }
    let phi_result = func.inst_result(phi);
    let step_val = if next_data.args[0] == phi_result {
        next_data.args[1]
    } else if next_data.args[1] == phi_result {
        next_data.args[0]
    } else {
        return None;
    };
    let step = const_int(func, step_val)?;
    if step == 0 {
        return None;
    }

    Some(IvPattern {
        phi,
        next,
        init,
        step,
        bound,
        pred,
        cmp,
        cmp_on_next,
        backedge_on_true,
        exit_block,
    })
}

/// Find the add in `block` that steps `phi_result` and feeds the backedge.
fn find_step(func: &Function, block: BlockId, phi_result: Value) -> Option<Inst> {
    let phi = func.def_inst(phi_result)?;
    let latch_in = func.phi_incoming(phi, block)?;
    let next = func.def_inst(latch_in)?;
    (func.inst(next).opcode == Opcode::Add && func.inst(next).block == block).then_some(next)
}

// ── Scalar evolution ──────────────────────────────────────────────────────────

/// Per-loop compile-time trip counts. A count of 0 means unknown; the trip
/// multiple is the largest known divisor of the trip count and is at least 1.
pub struct ScalarEvolution {
    trips: Vec<(u32, u32)>,
}

impl ScalarEvolution {
    pub fn compute(func: &Function, li: &LoopInfo, dl: &DataLayout) -> ScalarEvolution {
        let trips = li
            .loops
            .iter()
            .map(|lp| {
                let tc = induction_pattern(func, lp)
                    .and_then(|pat| simulate_trip_count(func, &pat, dl))
                    .unwrap_or(0);
                (tc, tc.max(1))
            })
            .collect();
        ScalarEvolution { trips }
    }

    /// Constant trip count of a loop, or 0 when unknown at compile time.
    pub fn small_constant_trip_count(&self, loop_idx: usize) -> u32 {
        self.trips[loop_idx].0
    }

    /// Largest known divisor of the trip count (>= 1).
    pub fn small_constant_trip_multiple(&self, loop_idx: usize) -> u32 {
        self.trips[loop_idx].1
    }
}

/// Concretely run the induction pattern when init and bound are constants.
fn simulate_trip_count(func: &Function, pat: &IvPattern, dl: &DataLayout) -> Option<u32> {
    let init = const_int(func, pat.init)?;
    let bound = const_int(func, pat.bound)?;
    let w = func.value_type(pat.bound).bit_width(dl);

    let mut i = sext(init, w);
    let mut count: u64 = 0;
    loop {
        count += 1;
        if count > TRIP_COUNT_CAP {
            return None;
        }
        let next = sext(i.wrapping_add(pat.step), w);
        let probe = if pat.cmp_on_next { next } else { i };
        let taken = fold_icmp(pat.pred, probe, bound, w);
        let continues = if pat.backedge_on_true { taken } else { !taken };
        if !continues {
            return Some(count as u32);
        }
        i = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::IrType;
    use crate::ir::builder::FunctionBuilder;

    /// Build `for (i = 0; ; ) { sum += i; i += step; if (i < bound) repeat }`
    /// as a preheader, a single-block loop, and an exit.
    fn counted_loop(bound: i64, step: i64) -> Function {
        let mut b = FunctionBuilder::new("loop", IrType::I32);
        let entry = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let zero = b.iconst(IrType::I32, 0);
        b.br(body);
        b.switch_to(body);
        let i = b.phi(IrType::I32, &[(zero, entry), (zero, body)]);
        let sum = b.phi(IrType::I32, &[(zero, entry), (zero, body)]);
        let sum_next = b.binop(Opcode::Add, IrType::I32, sum, i);
        let step_c = b.iconst(IrType::I32, step);
        let i_next = b.binop(Opcode::Add, IrType::I32, i, step_c);
        let bound_c = b.iconst(IrType::I32, bound);
        let c = b.icmp(Predicate::Slt, i_next, bound_c);
        b.cond_br(c, body, exit);
        b.switch_to(exit);
        b.ret(Some(sum_next));
        let mut func = b.finish();
        let i_phi = func.def_inst(i).unwrap();
        let sum_phi = func.def_inst(sum).unwrap();
        func.replace_phi_incoming(i_phi, body, body, i_next);
        func.replace_phi_incoming(sum_phi, body, body, sum_next);
        func
    }

    #[test]
    fn test_single_block_loop_discovered() {
        let func = counted_loop(10, 1);
        let cfg = CfgAnalysis::build(&func);
        let li = LoopInfo::compute(&cfg);
        assert_eq!(li.loops.len(), 1);
        let lp = &li.loops[0];
        assert_eq!(lp.header, 1);
        assert_eq!(lp.latch, Some(1));
        assert_eq!(lp.preheader, Some(0));
        assert_eq!(lp.exits, vec![2]);
        assert!(lp.is_canonical());
        assert!(li.is_header(1));
        assert!(!li.is_header(0));
        assert_eq!(li.loop_for(1), Some(0));
        assert_eq!(li.loop_for(0), None);
    }

    #[test]
    fn test_trip_count_simulation() {
        let func = counted_loop(10, 1);
        let cfg = CfgAnalysis::build(&func);
        let li = LoopInfo::compute(&cfg);
        let se = ScalarEvolution::compute(&func, &li, &DataLayout::default());
        assert_eq!(se.small_constant_trip_count(0), 10);
        assert_eq!(se.small_constant_trip_multiple(0), 10);
    }

    #[test]
    fn test_trip_count_with_step_two() {
        let func = counted_loop(10, 2);
        let cfg = CfgAnalysis::build(&func);
        let li = LoopInfo::compute(&cfg);
        let se = ScalarEvolution::compute(&func, &li, &DataLayout::default());
        assert_eq!(se.small_constant_trip_count(0), 5);
    }

    #[test]
    fn test_unknown_bound_reports_zero() {
        let mut b = FunctionBuilder::new("loop", IrType::I32);
        let n = b.param(IrType::I32);
        let entry = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let zero = b.iconst(IrType::I32, 0);
        b.br(body);
        b.switch_to(body);
        let i = b.phi(IrType::I32, &[(zero, entry), (zero, body)]);
        let one = b.iconst(IrType::I32, 1);
        let i_next = b.binop(Opcode::Add, IrType::I32, i, one);
        let c = b.icmp(Predicate::Slt, i_next, n);
        b.cond_br(c, body, exit);
        b.switch_to(exit);
        b.ret(Some(i));
        let mut func = b.finish();
        let i_phi = func.def_inst(i).unwrap();
        func.replace_phi_incoming(i_phi, body, body, i_next);

        let cfg = CfgAnalysis::build(&func);
        let li = LoopInfo::compute(&cfg);
        // Pattern recognized, but the bound is a parameter.
        assert!(induction_pattern(&func, &li.loops[0]).is_some());
        let se = ScalarEvolution::compute(&func, &li, &DataLayout::default());
        assert_eq!(se.small_constant_trip_count(0), 0);
        assert_eq!(se.small_constant_trip_multiple(0), 1);
    }

    #[test]
    fn test_nested_loops_order_innermost_first() {
        // outer: 1..3 headed at block 1; inner: single-block loop at block 2.
        let mut b = FunctionBuilder::new("nest", IrType::Void);
        let entry = b.create_block();
        let outer = b.create_block();
        let inner = b.create_block();
        let outer_latch = b.create_block();
        let exit = b.create_block();
        b.switch_to(entry);
        let zero = b.iconst(IrType::I32, 0);
        b.br(outer);
        b.switch_to(outer);
        let oi = b.phi(IrType::I32, &[(zero, entry), (zero, outer_latch)]);
        b.br(inner);
        b.switch_to(inner);
        let ii = b.phi(IrType::I32, &[(zero, outer), (zero, inner)]);
        let one = b.iconst(IrType::I32, 1);
        let ii_next = b.binop(Opcode::Add, IrType::I32, ii, one);
        let four = b.iconst(IrType::I32, 4);
        let ic = b.icmp(Predicate::Slt, ii_next, four);
        b.cond_br(ic, inner, outer_latch);
        b.switch_to(outer_latch);
        let oi_next = b.binop(Opcode::Add, IrType::I32, oi, one);
        let eight = b.iconst(IrType::I32, 8);
        let oc = b.icmp(Predicate::Slt, oi_next, eight);
        b.cond_br(oc, outer, exit);
        b.switch_to(exit);
        b.ret(None);
        let mut func = b.finish();
        func.replace_phi_incoming(func.def_inst(ii).unwrap(), inner, inner, ii_next);
        func.replace_phi_incoming(func.def_inst(oi).unwrap(), outer_latch, outer_latch, oi_next);

        let cfg = CfgAnalysis::build(&func);
        let li = LoopInfo::compute(&cfg);
        assert_eq!(li.loops.len(), 2);
        let post = li.postorder();
        // Innermost (smaller body) first.
        assert!(li.loops[post[0]].body.len() < li.loops[post[1]].body.len());
        let inner_idx = post[0];
        let outer_idx = post[1];
        assert_eq!(li.loops[inner_idx].parent, Some(outer_idx));
        assert_eq!(li.loops[inner_idx].depth, 2);
        assert_eq!(li.loops[outer_idx].depth, 1);
        assert_eq!(li.top_level_loops().collect::<Vec<_>>(), vec![outer_idx]);
    }
}
