//! Convenience layer for constructing IR functions instruction by
//! instruction. Used by hosts lowering into the IR and by tests.

use crate::common::types::{IrType, Predicate};
use crate::ir::ir::{
    BlockId, Callee, Function, InstAttrs, InstData, IrConst, Opcode, Value,
};

pub struct FunctionBuilder {
    func: Function,
    current: Option<BlockId>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, return_type: IrType) -> FunctionBuilder {
        FunctionBuilder { func: Function::new(name, return_type), current: None }
    }

    pub fn param(&mut self, ty: IrType) -> Value {
        self.func.add_param(ty)
    }

    pub fn create_block(&mut self) -> BlockId {
        self.func.new_block()
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> BlockId {
        self.current.expect("no current block; call switch_to first")
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn finish(self) -> Function {
        self.func
    }

    fn emit(&mut self, data: InstData) -> Value {
        let block = self.current_block();
        self.func.append_inst(block, data)
    }

    // ── Constants ─────────────────────────────────────────────────────────

    pub fn iconst(&mut self, ty: IrType, val: i64) -> Value {
        self.func.make_const(IrConst::from_i64(val, ty), ty)
    }

    pub fn fconst32(&mut self, val: f32) -> Value {
        self.func.make_const(IrConst::F32(val), IrType::F32)
    }

    pub fn fconst64(&mut self, val: f64) -> Value {
        self.func.make_const(IrConst::F64(val), IrType::F64)
    }

    pub fn pconst(&mut self, addr: u64) -> Value {
        self.func.make_const(IrConst::Ptr(addr), IrType::Ptr)
    }

    // ── Instructions ──────────────────────────────────────────────────────

    pub fn binop(&mut self, op: Opcode, ty: IrType, lhs: Value, rhs: Value) -> Value {
        debug_assert!(op.is_int_binary() || op.is_float_binary());
        self.emit(InstData::new(op, ty, &[lhs, rhs]))
    }

    /// Arithmetic on which signed overflow is undefined; the constant folder
    /// refuses to fold an overflowing evaluation of these.
    pub fn binop_nowrap(&mut self, op: Opcode, ty: IrType, lhs: Value, rhs: Value) -> Value {
        let attrs = InstAttrs { no_wrap: true, ..Default::default() };
        self.emit(InstData::new(op, ty, &[lhs, rhs]).with_attrs(attrs))
    }

    pub fn icmp(&mut self, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        let attrs = InstAttrs { predicate: Some(pred), ..Default::default() };
        self.emit(InstData::new(Opcode::Icmp, IrType::I8, &[lhs, rhs]).with_attrs(attrs))
    }

    pub fn fcmp(&mut self, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        let attrs = InstAttrs { predicate: Some(pred), ..Default::default() };
        self.emit(InstData::new(Opcode::Fcmp, IrType::I8, &[lhs, rhs]).with_attrs(attrs))
    }

    pub fn cast(&mut self, to_ty: IrType, val: Value) -> Value {
        self.emit(InstData::new(Opcode::Cast, to_ty, &[val]))
    }

    pub fn select(&mut self, ty: IrType, cond: Value, tval: Value, fval: Value) -> Value {
        self.emit(InstData::new(Opcode::Select, ty, &[cond, tval, fval]))
    }

    pub fn gep(&mut self, base: Value, index: Value, elem_size: u64, in_bounds: bool) -> Value {
        let attrs = InstAttrs { in_bounds, elem_size, ..Default::default() };
        self.emit(InstData::new(Opcode::Gep, IrType::Ptr, &[base, index]).with_attrs(attrs))
    }

    pub fn load(&mut self, ty: IrType, ptr: Value) -> Value {
        self.emit(InstData::new(Opcode::Load, ty, &[ptr]))
    }

    pub fn load_volatile(&mut self, ty: IrType, ptr: Value) -> Value {
        let attrs = InstAttrs { volatile: true, ..Default::default() };
        self.emit(InstData::new(Opcode::Load, ty, &[ptr]).with_attrs(attrs))
    }

    pub fn store(&mut self, val: Value, ptr: Value) -> Value {
        self.emit(InstData::new(Opcode::Store, IrType::Void, &[val, ptr]))
    }

    pub fn alloca(&mut self, size: u64) -> Value {
        let attrs = InstAttrs { elem_size: size, ..Default::default() };
        self.emit(InstData::new(Opcode::Alloca, IrType::Ptr, &[]).with_attrs(attrs))
    }

    pub fn call(
        &mut self,
        ret_ty: IrType,
        name: impl Into<String>,
        args: &[Value],
        memory_pure: bool,
    ) -> Value {
        let attrs = InstAttrs {
            callee: Some(Callee { name: name.into(), memory_pure }),
            ..Default::default()
        };
        self.emit(InstData::new(Opcode::Call, ret_ty, args).with_attrs(attrs))
    }

    pub fn phi(&mut self, ty: IrType, incoming: &[(Value, BlockId)]) -> Value {
        let args: Vec<Value> = incoming.iter().map(|(v, _)| *v).collect();
        let blocks: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
        self.emit(InstData::new(Opcode::Phi, ty, &args).with_targets(&blocks))
    }

    // ── Terminators ───────────────────────────────────────────────────────

    pub fn br(&mut self, target: BlockId) {
        self.emit(InstData::new(Opcode::Br, IrType::Void, &[]).with_targets(&[target]));
    }

    pub fn cond_br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.emit(
            InstData::new(Opcode::CondBr, IrType::Void, &[cond])
                .with_targets(&[then_block, else_block]),
        );
    }

    pub fn ret(&mut self, val: Option<Value>) {
        match val {
            Some(v) => self.emit(InstData::new(Opcode::Ret, IrType::Void, &[v])),
            None => self.emit(InstData::new(Opcode::Ret, IrType::Void, &[])),
        };
    }

    pub fn unreachable(&mut self) {
        self.emit(InstData::new(Opcode::Unreachable, IrType::Void, &[]));
    }
}
