//! Core SSA representation: typed values, instructions with explicit def-use
//! chains, and the per-function arenas that own both.
//!
//! Every SSA value is a function parameter, an interned constant, or the
//! result of exactly one instruction. Instructions (terminators included)
//! produce exactly one result value; terminators and stores produce a Void
//! result so the one-result invariant holds uniformly.
//!
//! Handles are dense `u32` indices into function-owned arenas. Erasing an
//! instruction clears its arena slot and drops all of its use edges but keeps
//! handle identity stable; the arena is never compacted while a pass runs.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::common::types::{IrType, Predicate};

/// A basic block identifier. Uses a u32 index for zero-cost copies instead of
/// heap-allocated String labels; the textual printer renders it as ".L{id}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

/// An SSA value reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl Value {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An instruction handle into the function's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(pub u32);

impl Inst {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// IR constants. Floats compare and hash by bit pattern via [`ConstKey`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrConst {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// An absolute address constant; 0 is the null pointer.
    Ptr(u64),
}

/// Hashable representation of IR constants, using bit patterns for floats.
/// This allows constants to be interned and used as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKey {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    Ptr(u64),
}

impl IrConst {
    pub fn to_key(&self) -> ConstKey {
        match self {
            IrConst::I8(v) => ConstKey::I8(*v),
            IrConst::I16(v) => ConstKey::I16(*v),
            IrConst::I32(v) => ConstKey::I32(*v),
            IrConst::I64(v) => ConstKey::I64(*v),
            IrConst::F32(v) => ConstKey::F32(v.to_bits()),
            IrConst::F64(v) => ConstKey::F64(v.to_bits()),
            IrConst::Ptr(v) => ConstKey::Ptr(*v),
        }
    }

    /// Extract as i64 with sign extension (integer and pointer constants only).
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            IrConst::I8(v) => Some(*v as i64),
            IrConst::I16(v) => Some(*v as i64),
            IrConst::I32(v) => Some(*v as i64),
            IrConst::I64(v) => Some(*v),
            IrConst::Ptr(v) => Some(*v as i64),
            IrConst::F32(_) | IrConst::F64(_) => None,
        }
    }

    /// Extract as f64 (float constants only).
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            IrConst::F32(v) => Some(*v as f64),
            IrConst::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            IrConst::I8(0) | IrConst::I16(0) | IrConst::I32(0) | IrConst::I64(0) => true,
            IrConst::Ptr(0) => true,
            IrConst::F32(v) => *v == 0.0,
            IrConst::F64(v) => *v == 0.0,
            _ => false,
        }
    }

    /// Construct an integer constant of the given type from an i64, truncating
    /// to the type's width. Unsigned types store the truncated bit pattern.
    pub fn from_i64(val: i64, ty: IrType) -> IrConst {
        match ty {
            IrType::I8 | IrType::U8 => IrConst::I8(val as i8),
            IrType::I16 | IrType::U16 => IrConst::I16(val as i16),
            IrType::I32 | IrType::U32 => IrConst::I32(val as i32),
            IrType::I64 | IrType::U64 => IrConst::I64(val),
            IrType::F32 => IrConst::F32(val as f32),
            IrType::F64 => IrConst::F64(val as f64),
            IrType::Ptr => IrConst::Ptr(val as u64),
            IrType::Void => IrConst::I64(0),
        }
    }
}

/// Instruction opcodes. Terminators are ordinary opcodes so the block layout
/// stays a flat instruction list with the terminator in final position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Integer arithmetic and bitwise operations.
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    // Float arithmetic.
    FAdd,
    FSub,
    FMul,
    FDiv,
    // Comparisons (predicate attribute selects the ordering).
    Icmp,
    Fcmp,
    /// Type conversion; source type is the operand's type, target is the
    /// result type.
    Cast,
    /// `select cond, a, b` with both arms always evaluated.
    Select,
    /// Address arithmetic: `base + index * elem_size`.
    Gep,
    Load,
    Store,
    Alloca,
    Call,
    Phi,
    // Terminators.
    Br,
    CondBr,
    Ret,
    Unreachable,
}

impl Opcode {
    /// Dense numeric identity, used when hashing expression keys.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Br | Opcode::CondBr | Opcode::Ret | Opcode::Unreachable)
    }

    /// Returns true if this operation is commutative (a op b == b op a).
    /// Float add/mul are treated as commutative; IEEE addition commutes even
    /// though it does not associate.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::FAdd
                | Opcode::FMul
        )
    }

    pub fn is_int_binary(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::UDiv
                | Opcode::SRem
                | Opcode::URem
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::LShr
                | Opcode::AShr
        )
    }

    pub fn is_float_binary(self) -> bool {
        matches!(self, Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "sdiv",
            Opcode::UDiv => "udiv",
            Opcode::SRem => "srem",
            Opcode::URem => "urem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::LShr => "lshr",
            Opcode::AShr => "ashr",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::Icmp => "icmp",
            Opcode::Fcmp => "fcmp",
            Opcode::Cast => "cast",
            Opcode::Select => "select",
            Opcode::Gep => "gep",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Alloca => "alloca",
            Opcode::Call => "call",
            Opcode::Phi => "phi",
            Opcode::Br => "br",
            Opcode::CondBr => "condbr",
            Opcode::Ret => "ret",
            Opcode::Unreachable => "unreachable",
        }
    }
}

/// Call target with its memory purity, as declared by the host. Calls to
/// functions not known to be memory-pure count as side effects.
#[derive(Debug, Clone)]
pub struct Callee {
    pub name: String,
    pub memory_pure: bool,
}

/// Instruction attributes. Most fields only apply to a few opcodes and stay
/// at their defaults elsewhere.
#[derive(Debug, Clone, Default)]
pub struct InstAttrs {
    /// Comparison predicate (Icmp/Fcmp).
    pub predicate: Option<Predicate>,
    /// In-bounds flag for address arithmetic (Gep).
    pub in_bounds: bool,
    pub volatile: bool,
    pub atomic: bool,
    /// Signed overflow is undefined for this arithmetic instruction.
    pub no_wrap: bool,
    /// Byte stride for Gep indices; allocation size for Alloca.
    pub elem_size: u64,
    /// Call target (Call only).
    pub callee: Option<Callee>,
}

/// An instruction: opcode, result type, ordered operands, attributes, and the
/// owning block. Branch targets (and phi incoming blocks, in operand order)
/// live in `blocks`.
#[derive(Debug, Clone)]
pub struct InstData {
    pub opcode: Opcode,
    pub ty: IrType,
    pub args: SmallVec<[Value; 2]>,
    pub blocks: SmallVec<[BlockId; 2]>,
    pub attrs: InstAttrs,
    pub block: BlockId,
}

impl InstData {
    pub fn new(opcode: Opcode, ty: IrType, args: &[Value]) -> InstData {
        InstData {
            opcode,
            ty,
            args: SmallVec::from_slice(args),
            blocks: SmallVec::new(),
            attrs: InstAttrs::default(),
            block: BlockId(u32::MAX),
        }
    }

    pub fn with_targets(mut self, targets: &[BlockId]) -> InstData {
        self.blocks = SmallVec::from_slice(targets);
        self
    }

    pub fn with_attrs(mut self, attrs: InstAttrs) -> InstData {
        self.attrs = attrs;
        self
    }
}

/// How a value comes into existence.
#[derive(Debug, Clone)]
pub enum ValueDef {
    Param { index: u32, ty: IrType },
    Const { value: IrConst, ty: IrType },
    Inst { inst: Inst, ty: IrType },
}

impl ValueDef {
    pub fn ty(&self) -> IrType {
        match self {
            ValueDef::Param { ty, .. } => *ty,
            ValueDef::Const { ty, .. } => *ty,
            ValueDef::Inst { ty, .. } => *ty,
        }
    }
}

/// A single use of a value: the using instruction and the operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseEdge {
    pub user: Inst,
    pub index: u32,
}

/// A basic block: a label plus an ordered instruction list whose final entry
/// is a terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: BlockId,
    pub insts: Vec<Inst>,
}

/// An IR function: the unit of transformation. Owns the value arena, the
/// instruction arena, the use-edge lists, and the ordered block list.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub return_type: IrType,
    pub blocks: Vec<BasicBlock>,
    values: Vec<ValueDef>,
    insts: Vec<Option<InstData>>,
    /// Result value of each instruction, parallel with `insts`.
    results: Vec<Value>,
    /// Use edges per value, parallel with `values`.
    uses: Vec<Vec<UseEdge>>,
    params: Vec<Value>,
    const_cache: FxHashMap<(ConstKey, u32), Value>,
    next_label: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: IrType) -> Function {
        Function {
            name: name.into(),
            return_type,
            blocks: Vec::new(),
            values: Vec::new(),
            insts: Vec::new(),
            results: Vec::new(),
            uses: Vec::new(),
            params: Vec::new(),
            const_cache: FxHashMap::default(),
            next_label: 0,
        }
    }

    // ── Values ────────────────────────────────────────────────────────────

    /// Append a function parameter of the given type.
    pub fn add_param(&mut self, ty: IrType) -> Value {
        let index = self.params.len() as u32;
        let v = self.push_value(ValueDef::Param { index, ty });
        self.params.push(v);
        v
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Intern a constant. Identical constants of the same type share one
    /// value, so value identity doubles as constant identity.
    pub fn make_const(&mut self, value: IrConst, ty: IrType) -> Value {
        let key = (value.to_key(), ty.code());
        if let Some(&v) = self.const_cache.get(&key) {
            return v;
        }
        let v = self.push_value(ValueDef::Const { value, ty });
        self.const_cache.insert(key, v);
        v
    }

    fn push_value(&mut self, def: ValueDef) -> Value {
        let v = Value(self.values.len() as u32);
        self.values.push(def);
        self.uses.push(Vec::new());
        v
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn value_def(&self, v: Value) -> &ValueDef {
        &self.values[v.index()]
    }

    pub fn value_type(&self, v: Value) -> IrType {
        self.values[v.index()].ty()
    }

    /// The constant behind a value, if it is one.
    pub fn const_value(&self, v: Value) -> Option<IrConst> {
        match &self.values[v.index()] {
            ValueDef::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The defining instruction of a value, if it is an instruction result.
    pub fn def_inst(&self, v: Value) -> Option<Inst> {
        match &self.values[v.index()] {
            ValueDef::Inst { inst, .. } => Some(*inst),
            _ => None,
        }
    }

    pub fn uses(&self, v: Value) -> &[UseEdge] {
        &self.uses[v.index()]
    }

    // ── Blocks ────────────────────────────────────────────────────────────

    /// Create a new, empty block appended to the block list.
    pub fn new_block(&mut self) -> BlockId {
        let label = BlockId(self.next_label);
        self.next_label += 1;
        self.blocks.push(BasicBlock { label, insts: Vec::new() });
        label
    }

    /// Position of a block in the ordered block list.
    pub fn block_pos(&self, label: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    pub fn block(&self, label: BlockId) -> &BasicBlock {
        let pos = self.block_pos(label).expect("unknown block label");
        &self.blocks[pos]
    }

    /// The terminator of a block, assuming the block is well formed.
    pub fn terminator(&self, label: BlockId) -> Option<Inst> {
        let block = self.block(label);
        block.insts.last().copied().filter(|&i| self.inst(i).opcode.is_terminator())
    }

    /// Remove a block from the block list, erasing all of its instructions.
    /// Callers must have redirected outside uses of its values first.
    pub fn remove_block(&mut self, label: BlockId) {
        let pos = self.block_pos(label).expect("unknown block label");
        let dead: Vec<Inst> = self.blocks[pos].insts.clone();
        self.erase_insts(&dead);
        self.blocks.retain(|b| b.label != label);
    }

    // ── Instructions ──────────────────────────────────────────────────────

    /// Create an instruction at the end of `block` and return its result
    /// value. Wires up use edges for every operand.
    pub fn append_inst(&mut self, block: BlockId, mut data: InstData) -> Value {
        data.block = block;
        let inst = Inst(self.insts.len() as u32);
        for (i, &arg) in data.args.iter().enumerate() {
            self.uses[arg.index()].push(UseEdge { user: inst, index: i as u32 });
        }
        let result = self.push_value(ValueDef::Inst { inst, ty: data.ty });
        self.insts.push(Some(data));
        self.results.push(result);
        let pos = self.block_pos(block).expect("unknown block label");
        self.blocks[pos].insts.push(inst);
        result
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn inst(&self, i: Inst) -> &InstData {
        self.insts[i.index()].as_ref().expect("access to erased instruction")
    }

    pub fn try_inst(&self, i: Inst) -> Option<&InstData> {
        self.insts[i.index()].as_ref()
    }

    pub fn is_erased(&self, i: Inst) -> bool {
        self.insts[i.index()].is_none()
    }

    pub fn inst_result(&self, i: Inst) -> Value {
        self.results[i.index()]
    }

    /// Returns true if the instruction can write memory, transfer control to
    /// unknown code, or otherwise must not be duplicated or removed freely.
    pub fn has_side_effects(&self, i: Inst) -> bool {
        let data = self.inst(i);
        if data.attrs.volatile || data.attrs.atomic {
            return true;
        }
        match data.opcode {
            Opcode::Store => true,
            Opcode::Call => data.attrs.callee.as_ref().map_or(true, |c| !c.memory_pure),
            _ => false,
        }
    }

    // ── Mutation ──────────────────────────────────────────────────────────

    /// Redirect every use of `old` to `new`. O(uses of old); the def-use
    /// lists stay consistent.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        if old == new {
            return;
        }
        let edges = std::mem::take(&mut self.uses[old.index()]);
        for e in &edges {
            let data = self.insts[e.user.index()]
                .as_mut()
                .expect("use edge points at erased instruction");
            data.args[e.index as usize] = new;
        }
        self.uses[new.index()].extend(edges);
    }

    /// Replace a single operand slot, keeping use edges consistent.
    pub fn replace_arg(&mut self, inst: Inst, index: usize, new: Value) {
        let old = {
            let data = self.insts[inst.index()].as_mut().expect("erased instruction");
            let old = data.args[index];
            if old == new {
                return;
            }
            data.args[index] = new;
            old
        };
        let idx32 = index as u32;
        self.uses[old.index()].retain(|e| !(e.user == inst && e.index == idx32));
        self.uses[new.index()].push(UseEdge { user: inst, index: idx32 });
    }

    /// Rewrite branch targets (or phi incoming block labels) equal to `from`
    /// into `to`.
    pub fn retarget(&mut self, inst: Inst, from: BlockId, to: BlockId) {
        let data = self.insts[inst.index()].as_mut().expect("erased instruction");
        for b in data.blocks.iter_mut() {
            if *b == from {
                *b = to;
            }
        }
    }

    /// For a phi, rewrite the incoming entry from `old_block` to come from
    /// `new_block` with `new_value`. No-op when no such entry exists.
    pub fn replace_phi_incoming(
        &mut self,
        phi: Inst,
        old_block: BlockId,
        new_block: BlockId,
        new_value: Value,
    ) {
        let slot = {
            let data = self.insts[phi.index()].as_ref().expect("erased instruction");
            debug_assert_eq!(data.opcode, Opcode::Phi);
            data.blocks.iter().position(|&b| b == old_block)
        };
        if let Some(slot) = slot {
            self.replace_arg(phi, slot, new_value);
            let data = self.insts[phi.index()].as_mut().expect("erased instruction");
            data.blocks[slot] = new_block;
        }
    }

    /// Append an incoming entry to a phi.
    pub fn add_phi_incoming(&mut self, phi: Inst, value: Value, pred: BlockId) {
        let slot = {
            let data = self.insts[phi.index()].as_mut().expect("erased instruction");
            debug_assert_eq!(data.opcode, Opcode::Phi);
            data.args.push(value);
            data.blocks.push(pred);
            (data.args.len() - 1) as u32
        };
        self.uses[value.index()].push(UseEdge { user: phi, index: slot });
    }

    /// Incoming value of a phi for a given predecessor block.
    pub fn phi_incoming(&self, phi: Inst, pred: BlockId) -> Option<Value> {
        let data = self.inst(phi);
        debug_assert_eq!(data.opcode, Opcode::Phi);
        data.blocks.iter().position(|&b| b == pred).map(|i| data.args[i])
    }

    /// Erase a batch of instructions: drop their use edges, clear their arena
    /// slots, and remove them from their blocks. Erasure never runs while a
    /// block's instruction list is being iterated; passes collect a deletion
    /// list and call this afterwards.
    pub fn erase_insts(&mut self, dead: &[Inst]) {
        if dead.is_empty() {
            return;
        }
        let mut removed = false;
        for &i in dead {
            let Some(data) = self.insts[i.index()].take() else { continue };
            for &arg in &data.args {
                self.uses[arg.index()].retain(|e| e.user != i);
            }
            removed = true;
        }
        if removed {
            let insts = &self.insts;
            for block in &mut self.blocks {
                block.insts.retain(|&i| insts[i.index()].is_some());
            }
        }
    }

    pub fn erase_inst(&mut self, inst: Inst) {
        self.erase_insts(&[inst]);
    }

    /// Iterate all live instructions of a block in order.
    pub fn block_insts(&self, label: BlockId) -> impl Iterator<Item = Inst> + '_ {
        self.block(label).insts.iter().copied()
    }
}
