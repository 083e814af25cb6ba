//! Mechanical loop unrolling.
//!
//! The pass layer decides *whether* and *how much* to unroll; this module
//! performs the IR surgery. It supports canonical single-block loops (the
//! header is also the latch) with any number of phi-carried values:
//!
//! - **Full**: the body is replicated once per iteration as straight-line
//!   blocks, phis become concrete per-iteration values, and the loop is
//!   deleted. Values that fall dead (the induction chain, the exit compare)
//!   are swept afterwards.
//! - **Partial**: the body is replicated `factor` times inside the loop
//!   block, and the phi backedge entries and the exit compare are rewired to
//!   the last copy. Callers guarantee the factor divides the trip count, so
//!   no remainder loop is needed.
//! - **Runtime**: a guard tests whether at least `guard_min` iterations
//!   remain; if so an unrolled main loop runs groups of `factor` iterations,
//!   and the original loop serves as the scalar epilogue for the remainder.
//!
//! Any other shape is refused with [`UnrollStatus::Unmodified`]; the caller
//! reports that as a missed optimization. Loops containing inner loops are
//! structurally excluded by the single-block requirement.

use rustc_hash::FxHashMap;

use crate::common::types::{IrType, Predicate};
use crate::ir::ir::{BlockId, Function, Inst, InstAttrs, InstData, IrConst, Opcode, Value};
use crate::passes::loop_analysis::{induction_pattern, IvPattern, NaturalLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrollStatus {
    UnrolledOk,
    Unmodified,
}

/// What the caller decided; `trip_count` is 0 for runtime unrolling.
pub struct UnrollRequest {
    pub factor: u32,
    pub trip_count: u32,
    /// Replicate `trip_count` times and delete the loop.
    pub full: bool,
    /// Unknown trip count: emit guard, unrolled main loop, scalar epilogue.
    pub runtime: bool,
    /// Minimum remaining iterations the runtime guard requires before
    /// entering the unrolled main loop.
    pub guard_min: u32,
}

/// One phi-carried value of the loop.
struct PhiVar {
    inst: Inst,
    result: Value,
    init: Value,
    latch_in: Value,
}

/// Unroll `lp` according to `req`. Refuses (leaving the IR untouched) when
/// the loop shape is outside what the rewrite supports.
pub fn unroll_loop(func: &mut Function, lp: &NaturalLoop, req: &UnrollRequest) -> UnrollStatus {
    if req.factor < 1 {
        return UnrollStatus::Unmodified;
    }
    let Some(latch) = lp.latch else { return UnrollStatus::Unmodified };
    if latch != lp.header || lp.preheader.is_none() || lp.exits.len() != 1 {
        return UnrollStatus::Unmodified;
    }
    let Some(pattern) = induction_pattern(func, lp) else {
        return UnrollStatus::Unmodified;
    };

    let header = func.blocks[lp.header].label;
    let preheader = func.blocks[lp.preheader.unwrap()].label;

    let Some(phis) = collect_phis(func, header, preheader) else {
        return UnrollStatus::Unmodified;
    };

    if req.runtime {
        runtime_unroll(func, header, preheader, &pattern, &phis, req)
    } else if req.full {
        if req.factor != req.trip_count || req.trip_count == 0 {
            return UnrollStatus::Unmodified;
        }
        full_unroll(func, header, preheader, &pattern, &phis, req.trip_count)
    } else {
        partial_unroll(func, header, &phis, req)
    }
}

/// Gather the loop's phis with their preheader and backedge incomings.
/// Refuses phis that are not the canonical two-incoming form.
fn collect_phis(func: &Function, header: BlockId, preheader: BlockId) -> Option<Vec<PhiVar>> {
    let mut phis = Vec::new();
    for inst in func.block_insts(header) {
        let data = func.inst(inst);
        if data.opcode != Opcode::Phi {
            continue;
        }
        if data.args.len() != 2 {
            return None;
        }
        let init = func.phi_incoming(inst, preheader)?;
        let latch_in = func.phi_incoming(inst, header)?;
        phis.push(PhiVar { inst, result: func.inst_result(inst), init, latch_in });
    }
    Some(phis)
}

/// Body instructions of the loop block: everything but phis and the
/// terminator, in program order.
fn body_insts(func: &Function, header: BlockId) -> Vec<Inst> {
    let insts = &func.block(header).insts;
    insts[..insts.len() - 1]
        .iter()
        .copied()
        .filter(|&i| func.inst(i).opcode != Opcode::Phi)
        .collect()
}

fn lookup(map: &FxHashMap<Value, Value>, v: Value) -> Value {
    map.get(&v).copied().unwrap_or(v)
}

/// Clone one body instruction into `block` with operands remapped, and record
/// the mapping from the original result to the clone's.
fn clone_inst(func: &mut Function, block: BlockId, orig: Inst, map: &mut FxHashMap<Value, Value>) {
    let data = func.inst(orig);
    let mut clone = InstData {
        opcode: data.opcode,
        ty: data.ty,
        args: data.args.clone(),
        blocks: data.blocks.clone(),
        attrs: data.attrs.clone(),
        block,
    };
    for arg in clone.args.iter_mut() {
        *arg = lookup(map, *arg);
    }
    let result = func.append_inst(block, clone);
    map.insert(func.inst_result(orig), result);
}

/// Step the phi environment across an iteration boundary. Phi updates are
/// parallel: all new values are computed from the old map before any entry
/// is written.
fn step_phi_env(map: &mut FxHashMap<Value, Value>, phis: &[PhiVar]) {
    let new_vals: Vec<(Value, Value)> =
        phis.iter().map(|p| (p.result, lookup(map, p.latch_in))).collect();
    for (result, val) in new_vals {
        map.insert(result, val);
    }
}

/// Erase instructions in `blocks` whose results are unused, iterating until
/// nothing more falls dead. Removes the unrolled induction chains and exit
/// compares that no longer feed anything.
fn sweep_dead(func: &mut Function, blocks: &[BlockId]) {
    loop {
        let mut dead = Vec::new();
        for &block in blocks {
            if func.block_pos(block).is_none() {
                continue;
            }
            for inst in func.block_insts(block) {
                let data = func.inst(inst);
                if data.opcode.is_terminator() || data.opcode == Opcode::Phi {
                    continue;
                }
                if func.has_side_effects(inst) {
                    continue;
                }
                if func.uses(func.inst_result(inst)).is_empty() {
                    dead.push(inst);
                }
            }
        }
        if dead.is_empty() {
            return;
        }
        func.erase_insts(&dead);
    }
}

// ── Full unroll ───────────────────────────────────────────────────────────────

fn full_unroll(
    func: &mut Function,
    header: BlockId,
    preheader: BlockId,
    pattern: &IvPattern,
    phis: &[PhiVar],
    trip_count: u32,
) -> UnrollStatus {
    let body = body_insts(func, header);

    // Per-iteration value environment; iteration 0 starts from the preheader
    // incomings.
    let mut map: FxHashMap<Value, Value> = FxHashMap::default();
    for p in phis {
        map.insert(p.result, p.init);
    }

    let mut copies = Vec::with_capacity(trip_count as usize);
    for k in 0..trip_count {
        if k > 0 {
            step_phi_env(&mut map, phis);
        }
        let block = func.new_block();
        for &inst in &body {
            clone_inst(func, block, inst, &mut map);
        }
        copies.push(block);
    }

    // Chain the copies: preheader -> copy 0 -> ... -> copy n-1 -> exit.
    let ph_term = func.terminator(preheader).expect("preheader has no terminator");
    func.retarget(ph_term, header, copies[0]);
    for (i, &block) in copies.iter().enumerate() {
        let target = if i + 1 < copies.len() { copies[i + 1] } else { pattern.exit_block };
        func.append_inst(block, InstData::new(Opcode::Br, IrType::Void, &[]).with_targets(&[target]));
    }

    // Redirect every surviving use of a loop-defined value (exit phis and any
    // other downstream use) to its final-iteration equivalent, then drop the
    // loop block.
    let loop_defs: Vec<Value> = func.block_insts(header).map(|i| func.inst_result(i)).collect();
    for v in loop_defs {
        let replacement = lookup(&map, v);
        if replacement != v {
            func.replace_all_uses(v, replacement);
        }
    }
    // Exit phis now carry the right values but still name the old loop block
    // as their incoming edge.
    let last = *copies.last().unwrap();
    let exit_phis: Vec<Inst> = func
        .block_insts(pattern.exit_block)
        .filter(|&i| func.inst(i).opcode == Opcode::Phi)
        .collect();
    for phi in exit_phis {
        func.retarget(phi, header, last);
    }
    func.remove_block(header);

    sweep_dead(func, &copies);
    UnrollStatus::UnrolledOk
}

// ── Partial unroll ────────────────────────────────────────────────────────────

fn partial_unroll(
    func: &mut Function,
    header: BlockId,
    phis: &[PhiVar],
    req: &UnrollRequest,
) -> UnrollStatus {
    let factor = req.factor;
    if factor < 2 || req.trip_count == 0 || req.trip_count % factor != 0 {
        return UnrollStatus::Unmodified;
    }
    let body = body_insts(func, header);
    let term = func.terminator(header).expect("loop block has no terminator");

    // Copy 0 is the original body (identity environment); copies 1..factor
    // are appended in place.
    let mut map: FxHashMap<Value, Value> = FxHashMap::default();
    for _ in 1..factor {
        step_phi_env(&mut map, phis);
        for &inst in &body {
            clone_inst(func, header, inst, &mut map);
        }
    }

    // Clones were appended after the terminator; restore it to last place.
    let pos = func.block_pos(header).expect("unknown loop block");
    let insts = &mut func.blocks[pos].insts;
    let tpos = insts.iter().position(|&i| i == term).expect("terminator vanished");
    insts.remove(tpos);
    insts.push(term);

    // The backedge now carries the last copy's values, and the exit test
    // reads the last copy's compare.
    for p in phis {
        func.replace_phi_incoming(p.inst, header, header, lookup(&map, p.latch_in));
    }
    let cond = func.inst(term).args[0];
    func.replace_arg(term, 0, lookup(&map, cond));

    // Uses outside the loop observe the last executed iteration, which is
    // now the last copy.
    let loop_defs: Vec<(Value, Value)> = {
        let mut defs = Vec::new();
        for p in phis {
            defs.push((p.result, lookup(&map, p.result)));
        }
        for &inst in &body {
            let v = func.inst_result(inst);
            defs.push((v, lookup(&map, v)));
        }
        defs
    };
    for (v, replacement) in loop_defs {
        if v == replacement {
            continue;
        }
        let outside: Vec<(Inst, usize)> = func
            .uses(v)
            .iter()
            .filter(|e| func.inst(e.user).block != header)
            .map(|e| (e.user, e.index as usize))
            .collect();
        for (user, idx) in outside {
            func.replace_arg(user, idx, replacement);
        }
    }

    sweep_dead(func, &[header]);
    UnrollStatus::UnrolledOk
}

// ── Runtime unroll ────────────────────────────────────────────────────────────

fn runtime_unroll(
    func: &mut Function,
    header: BlockId,
    preheader: BlockId,
    pattern: &IvPattern,
    phis: &[PhiVar],
    req: &UnrollRequest,
) -> UnrollStatus {
    let factor = req.factor;
    if factor < 2 {
        return UnrollStatus::Unmodified;
    }
    // The guard and main-loop bound arithmetic below is only correct for the
    // canonical upward-counting shape.
    if pattern.step != 1
        || !pattern.cmp_on_next
        || !pattern.backedge_on_true
        || !matches!(pattern.pred, Predicate::Slt | Predicate::Ult)
    {
        return UnrollStatus::Unmodified;
    }
    // The bound must be loop-invariant so the guard can read it.
    if let Some(def) = func.def_inst(pattern.bound) {
        if func.inst(def).block == header {
            return UnrollStatus::Unmodified;
        }
    }
    // Without closed-form exit values, loop results may only escape through
    // exit-block phis; the skip edge supplies its own incoming there.
    let loop_values: Vec<Value> = func.block_insts(header).map(|i| func.inst_result(i)).collect();
    for &v in &loop_values {
        for e in func.uses(v) {
            let user_data = func.inst(e.user);
            if user_data.block == header {
                continue;
            }
            if user_data.block == pattern.exit_block && user_data.opcode == Opcode::Phi {
                continue;
            }
            return UnrollStatus::Unmodified;
        }
    }

    let iv_ty = func.value_type(func.inst_result(pattern.phi));
    let init = pattern.init;
    let bound = pattern.bound;
    let body = body_insts(func, header);
    let guard_min = req.guard_min.max(factor) as i64;
    let icmp_attrs = |p: Predicate| InstAttrs { predicate: Some(p), ..Default::default() };

    let guard = func.new_block();
    let main_ph = func.new_block();
    let main = func.new_block();
    let epi_guard = func.new_block();
    let epi_ph = func.new_block();

    // Guard: enter the unrolled main loop only when the loop runs at least
    // guard_min iterations: init < bound && bound - init >= guard_min.
    let ph_term = func.terminator(preheader).expect("preheader has no terminator");
    func.retarget(ph_term, header, guard);
    let rem = func.append_inst(guard, InstData::new(Opcode::Sub, iv_ty, &[bound, init]));
    let entered = func.append_inst(
        guard,
        InstData::new(Opcode::Icmp, IrType::I8, &[init, bound]).with_attrs(icmp_attrs(pattern.pred)),
    );
    let ge = if pattern.pred == Predicate::Ult { Predicate::Uge } else { Predicate::Sge };
    let min_c = func.make_const(IrConst::from_i64(guard_min, iv_ty), iv_ty);
    let enough = func.append_inst(
        guard,
        InstData::new(Opcode::Icmp, IrType::I8, &[rem, min_c]).with_attrs(icmp_attrs(ge)),
    );
    let both = func.append_inst(guard, InstData::new(Opcode::And, IrType::I8, &[entered, enough]));
    func.append_inst(
        guard,
        InstData::new(Opcode::CondBr, IrType::Void, &[both]).with_targets(&[main_ph, epi_ph]),
    );

    // Main preheader computes the adjusted bound: the main loop keeps going
    // while a full group of `factor` iterations fits, i.e. while the stepped
    // induction value stays below bound - (factor - 1).
    let fm1 = func.make_const(IrConst::from_i64(factor as i64 - 1, iv_ty), iv_ty);
    let limit = func.append_inst(main_ph, InstData::new(Opcode::Sub, iv_ty, &[bound, fm1]));
    func.append_inst(main_ph, InstData::new(Opcode::Br, IrType::Void, &[]).with_targets(&[main]));

    // Main loop: fresh phis, `factor` body copies, widened exit test.
    let mut map: FxHashMap<Value, Value> = FxHashMap::default();
    let mut main_phis = Vec::with_capacity(phis.len());
    for p in phis {
        // Backedge incoming is a placeholder until the copies exist.
        let data = InstData::new(Opcode::Phi, func.value_type(p.result), &[p.init, p.init])
            .with_targets(&[main_ph, main]);
        let v = func.append_inst(main, data);
        map.insert(p.result, v);
        main_phis.push(v);
    }
    for k in 0..factor {
        if k > 0 {
            step_phi_env(&mut map, phis);
        }
        for &inst in &body {
            clone_inst(func, main, inst, &mut map);
        }
    }
    // `map` now holds the last copy's environment. The next-group values are
    // the latch incomings evaluated in it.
    for (p, &mv) in phis.iter().zip(main_phis.iter()) {
        let phi_inst = func.def_inst(mv).expect("main phi vanished");
        func.replace_phi_incoming(phi_inst, main, main, lookup(&map, p.latch_in));
    }
    let iv_result = func.inst_result(pattern.phi);
    let iv_latch_in = phis
        .iter()
        .find(|p| p.result == iv_result)
        .map(|p| p.latch_in)
        .expect("induction phi missing from phi set");
    let next_iv = lookup(&map, iv_latch_in);
    let cont = func.append_inst(
        main,
        InstData::new(Opcode::Icmp, IrType::I8, &[next_iv, limit]).with_attrs(icmp_attrs(pattern.pred)),
    );
    func.append_inst(
        main,
        InstData::new(Opcode::CondBr, IrType::Void, &[cont]).with_targets(&[main, epi_guard]),
    );

    // Epilogue guard: run the scalar loop only when iterations remain;
    // otherwise exit directly.
    let more = func.append_inst(
        epi_guard,
        InstData::new(Opcode::Icmp, IrType::I8, &[next_iv, bound]).with_attrs(icmp_attrs(pattern.pred)),
    );
    func.append_inst(
        epi_guard,
        InstData::new(Opcode::CondBr, IrType::Void, &[more]).with_targets(&[epi_ph, pattern.exit_block]),
    );

    // Epilogue preheader merges the guard-failed entry (initial values) with
    // the main-loop exit (mid-loop values).
    let mut epi_vals = Vec::with_capacity(phis.len());
    for p in phis {
        let data = InstData::new(
            Opcode::Phi,
            func.value_type(p.result),
            &[p.init, lookup(&map, p.latch_in)],
        )
        .with_targets(&[guard, epi_guard]);
        epi_vals.push(func.append_inst(epi_ph, data));
    }
    func.append_inst(epi_ph, InstData::new(Opcode::Br, IrType::Void, &[]).with_targets(&[header]));

    // The original loop becomes the epilogue, entered from epi_ph.
    for (p, &ev) in phis.iter().zip(epi_vals.iter()) {
        func.replace_phi_incoming(p.inst, preheader, epi_ph, ev);
    }

    // Exit phis gain an incoming for the skip edge. On that edge the last
    // executed iteration is the main loop's final copy, so loop-defined
    // values map through the copy environment.
    let exit_phis: Vec<Inst> = func
        .block_insts(pattern.exit_block)
        .filter(|&i| func.inst(i).opcode == Opcode::Phi)
        .collect();
    for phi in exit_phis {
        if let Some(w) = func.phi_incoming(phi, header) {
            func.add_phi_incoming(phi, lookup(&map, w), epi_guard);
        }
    }

    sweep_dead(func, &[main]);
    UnrollStatus::UnrolledOk
}
