//! Deterministic textual printer for IR functions.
//!
//! Output is a pure function of the IR: identical functions print
//! byte-identically, which the pass tests rely on to check that no-op passes
//! leave a function untouched.

use std::fmt::{self, Write};

use crate::ir::ir::{Function, Inst, IrConst, Opcode, Value, ValueDef};

fn write_const(out: &mut String, c: IrConst) {
    match c {
        IrConst::I8(v) => { let _ = write!(out, "{}", v); }
        IrConst::I16(v) => { let _ = write!(out, "{}", v); }
        IrConst::I32(v) => { let _ = write!(out, "{}", v); }
        IrConst::I64(v) => { let _ = write!(out, "{}", v); }
        IrConst::F32(v) => { let _ = write!(out, "{:?}", v); }
        IrConst::F64(v) => { let _ = write!(out, "{:?}", v); }
        IrConst::Ptr(v) => { let _ = write!(out, "0x{:x}", v); }
    }
}

fn write_operand(out: &mut String, func: &Function, v: Value) {
    match func.value_def(v) {
        ValueDef::Const { value, .. } => write_const(out, *value),
        _ => { let _ = write!(out, "%{}", v.0); }
    }
}

/// Render one instruction (without trailing newline).
pub fn inst_to_string(func: &Function, inst: Inst) -> String {
    let mut out = String::new();
    let data = func.inst(inst);
    let result = func.inst_result(inst);

    if !matches!(data.opcode, Opcode::Store | Opcode::Br | Opcode::CondBr | Opcode::Ret | Opcode::Unreachable)
    {
        let _ = write!(out, "%{} = ", result.0);
    }

    let _ = write!(out, "{}", data.opcode.name());
    if let Some(pred) = data.attrs.predicate {
        let _ = write!(out, " {}", pred.name());
    }
    if data.attrs.in_bounds {
        out.push_str(" inbounds");
    }
    if data.attrs.volatile {
        out.push_str(" volatile");
    }
    if data.attrs.atomic {
        out.push_str(" atomic");
    }
    if data.attrs.no_wrap {
        out.push_str(" nowrap");
    }
    if data.ty != crate::common::types::IrType::Void {
        let _ = write!(out, " {}", data.ty);
    }

    match data.opcode {
        Opcode::Phi => {
            for (i, (&arg, &block)) in data.args.iter().zip(data.blocks.iter()).enumerate() {
                out.push_str(if i == 0 { " [ " } else { ", [ " });
                write_operand(&mut out, func, arg);
                let _ = write!(out, ", {} ]", block);
            }
        }
        Opcode::Call => {
            if let Some(callee) = &data.attrs.callee {
                let _ = write!(out, " @{}(", callee.name);
                for (i, &arg) in data.args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_operand(&mut out, func, arg);
                }
                out.push(')');
                if callee.memory_pure {
                    out.push_str(" pure");
                }
            }
        }
        Opcode::Br => {
            let _ = write!(out, " {}", data.blocks[0]);
        }
        Opcode::CondBr => {
            out.push(' ');
            write_operand(&mut out, func, data.args[0]);
            let _ = write!(out, ", {}, {}", data.blocks[0], data.blocks[1]);
        }
        Opcode::Alloca => {
            let _ = write!(out, " size {}", data.attrs.elem_size);
        }
        Opcode::Gep => {
            out.push(' ');
            write_operand(&mut out, func, data.args[0]);
            out.push_str(", ");
            write_operand(&mut out, func, data.args[1]);
            let _ = write!(out, ", scale {}", data.attrs.elem_size);
        }
        _ => {
            for (i, &arg) in data.args.iter().enumerate() {
                out.push_str(if i == 0 { " " } else { ", " });
                write_operand(&mut out, func, arg);
            }
        }
    }

    out
}

/// Render a whole function.
pub fn function_to_string(func: &Function) -> String {
    let mut out = String::new();
    let _ = write!(out, "function @{}(", func.name);
    for (i, &p) in func.params().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} %{}", func.value_type(p), p.0);
    }
    let _ = writeln!(out, ") -> {} {{", func.return_type);
    for block in &func.blocks {
        let _ = writeln!(out, "{}:", block.label);
        for &inst in &block.insts {
            let _ = writeln!(out, "  {}", inst_to_string(func, inst));
        }
    }
    out.push_str("}\n");
    out
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&function_to_string(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{IrType, Predicate};
    use crate::ir::builder::FunctionBuilder;

    #[test]
    fn test_printer_is_deterministic() {
        let build = || {
            let mut b = FunctionBuilder::new("f", IrType::I32);
            let p = b.param(IrType::I32);
            let entry = b.create_block();
            b.switch_to(entry);
            let ten = b.iconst(IrType::I32, 10);
            let x = b.binop(crate::ir::ir::Opcode::Add, IrType::I32, p, ten);
            let c = b.icmp(Predicate::Slt, x, ten);
            let y = b.select(IrType::I32, c, x, p);
            b.ret(Some(y));
            b.finish()
        };
        assert_eq!(function_to_string(&build()), function_to_string(&build()));
    }

    #[test]
    fn test_inst_rendering_shapes() {
        let mut b = FunctionBuilder::new("f", IrType::Void);
        let p = b.param(IrType::Ptr);
        let entry = b.create_block();
        b.switch_to(entry);
        let idx = b.iconst(IrType::I64, 2);
        let addr = b.gep(p, idx, 8, true);
        let v = b.load(IrType::I64, addr);
        b.store(v, addr);
        b.ret(None);
        let func = b.finish();
        let text = function_to_string(&func);
        assert!(text.contains("gep inbounds ptr %0, 2, scale 8"));
        assert!(text.contains("load i64 %"));
        assert!(text.contains("store "));
    }
}
