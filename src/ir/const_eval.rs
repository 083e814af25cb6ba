//! Target-aware constant evaluation.
//!
//! `try_evaluate` computes the result of an instruction whose operands are
//! compile-time constants, consulting the [`DataLayout`] for widths so the
//! result matches the target rather than the host. Evaluations that would
//! trap or are undefined return `None` and the instruction stays as it is:
//! division or remainder by zero, signed overflow on no-wrap arithmetic,
//! shift amounts at or beyond the bit width, and out-of-range or NaN
//! float-to-int conversions.

use crate::common::types::{DataLayout, IrType, Predicate};
use crate::ir::ir::{Function, Inst, IrConst, Opcode};

/// Sign-extend the low `w` bits of `v`.
#[inline]
pub(crate) fn sext(v: i64, w: u32) -> i64 {
    if w >= 64 {
        v
    } else {
        (v << (64 - w)) >> (64 - w)
    }
}

/// Zero-extend the low `w` bits of `v`.
#[inline]
fn zext(v: i64, w: u32) -> u64 {
    if w >= 64 {
        v as u64
    } else {
        (v as u64) & ((1u64 << w) - 1)
    }
}

/// Normalize a constant to an i64 carrying the extension its type dictates:
/// sign extension for signed integers, zero extension for unsigned and
/// pointer values.
fn int_value(c: IrConst, ty: IrType) -> Option<i64> {
    let raw = c.to_i64()?;
    Some(match ty {
        IrType::I8 => raw as i8 as i64,
        IrType::U8 => raw as u8 as i64,
        IrType::I16 => raw as i16 as i64,
        IrType::U16 => raw as u16 as i64,
        IrType::I32 => raw as i32 as i64,
        IrType::U32 => raw as u32 as i64,
        IrType::I64 | IrType::U64 | IrType::Ptr => raw,
        _ => return None,
    })
}

/// Constant integer behind a value, normalized by the extension its type
/// dictates. Used by trip-count analysis to read induction bounds.
pub(crate) fn const_int(func: &Function, v: crate::ir::ir::Value) -> Option<i64> {
    let c = func.const_value(v)?;
    int_value(c, func.value_type(v))
}

/// Try to evaluate `inst` to a constant. Returns `None` when any relevant
/// operand is not a constant or when the evaluation is not defined.
pub fn try_evaluate(func: &Function, inst: Inst, dl: &DataLayout) -> Option<IrConst> {
    let data = func.try_inst(inst)?;
    if data.opcode.is_terminator() || data.opcode == Opcode::Phi {
        return None;
    }
    if func.has_side_effects(inst) {
        return None;
    }

    let op = data.opcode;
    if op.is_int_binary() {
        let lhs = func.const_value(data.args[0])?;
        let rhs = func.const_value(data.args[1])?;
        let a = int_value(lhs, data.ty)?;
        let b = int_value(rhs, data.ty)?;
        let r = fold_int_binop(op, a, b, data.ty, data.attrs.no_wrap, dl)?;
        return Some(IrConst::from_i64(r, data.ty));
    }
    if op.is_float_binary() {
        let a = func.const_value(data.args[0])?.to_f64()?;
        let b = func.const_value(data.args[1])?.to_f64()?;
        let r = match op {
            Opcode::FAdd => a + b,
            Opcode::FSub => a - b,
            Opcode::FMul => a * b,
            Opcode::FDiv => a / b,
            _ => unreachable!(),
        };
        return Some(match data.ty {
            IrType::F32 => IrConst::F32(r as f32),
            _ => IrConst::F64(r),
        });
    }

    match op {
        Opcode::Icmp => {
            let pred = data.attrs.predicate?;
            let lty = func.value_type(data.args[0]);
            let lhs = func.const_value(data.args[0])?;
            let rhs = func.const_value(data.args[1])?;
            let a = int_value(lhs, lty)?;
            let b = int_value(rhs, lty)?;
            let w = lty.bit_width(dl);
            let r = fold_icmp(pred, a, b, w);
            Some(IrConst::I8(r as i8))
        }
        Opcode::Fcmp => {
            let pred = data.attrs.predicate?;
            let a = func.const_value(data.args[0])?.to_f64()?;
            let b = func.const_value(data.args[1])?.to_f64()?;
            Some(IrConst::I8(fold_fcmp(pred, a, b) as i8))
        }
        Opcode::Cast => {
            let src = func.const_value(data.args[0])?;
            let from = func.value_type(data.args[0]);
            fold_cast(src, from, data.ty, dl)
        }
        Opcode::Select => {
            let cond = func.const_value(data.args[0])?;
            let tval = func.const_value(data.args[1])?;
            let fval = func.const_value(data.args[2])?;
            Some(if cond.is_zero() { fval } else { tval })
        }
        Opcode::Gep => {
            let base = match func.const_value(data.args[0])? {
                IrConst::Ptr(a) => a,
                _ => return None,
            };
            let ity = func.value_type(data.args[1]);
            let idx = int_value(func.const_value(data.args[1])?, ity)?;
            let offset = (idx as u64).wrapping_mul(data.attrs.elem_size);
            Some(IrConst::Ptr(dl.truncate_pointer(base.wrapping_add(offset))))
        }
        _ => None,
    }
}

fn fold_int_binop(
    op: Opcode,
    a: i64,
    b: i64,
    ty: IrType,
    no_wrap: bool,
    dl: &DataLayout,
) -> Option<i64> {
    let w = ty.bit_width(dl);
    let min_w: i64 = if w >= 64 { i64::MIN } else { -(1i64 << (w - 1)) };
    let sa = sext(a, w);
    let sb = sext(b, w);
    let ua = zext(a, w);
    let ub = zext(b, w);

    // Wide arithmetic plus a signed-overflow check for no-wrap opcodes.
    let checked = |r128: i128| -> Option<i64> {
        let wrapped = sext(r128 as i64, w);
        if no_wrap && (wrapped as i128) != r128 {
            return None;
        }
        Some(wrapped)
    };

    match op {
        Opcode::Add => checked(sa as i128 + sb as i128),
        Opcode::Sub => checked(sa as i128 - sb as i128),
        Opcode::Mul => checked(sa as i128 * sb as i128),
        Opcode::SDiv => {
            if sb == 0 || (sa == min_w && sb == -1) {
                return None;
            }
            Some(sa / sb)
        }
        Opcode::SRem => {
            if sb == 0 || (sa == min_w && sb == -1) {
                return None;
            }
            Some(sa % sb)
        }
        Opcode::UDiv => {
            if ub == 0 {
                return None;
            }
            Some((ua / ub) as i64)
        }
        Opcode::URem => {
            if ub == 0 {
                return None;
            }
            Some((ua % ub) as i64)
        }
        Opcode::And => Some((ua & ub) as i64),
        Opcode::Or => Some((ua | ub) as i64),
        Opcode::Xor => Some((ua ^ ub) as i64),
        Opcode::Shl => {
            if ub >= w as u64 {
                return None;
            }
            Some((ua << ub) as i64)
        }
        Opcode::LShr => {
            if ub >= w as u64 {
                return None;
            }
            Some((ua >> ub) as i64)
        }
        Opcode::AShr => {
            if ub >= w as u64 {
                return None;
            }
            Some(sa >> ub)
        }
        _ => None,
    }
}

pub(crate) fn fold_icmp(pred: Predicate, a: i64, b: i64, w: u32) -> bool {
    let sa = sext(a, w);
    let sb = sext(b, w);
    let ua = zext(a, w);
    let ub = zext(b, w);
    match pred {
        Predicate::Eq => ua == ub,
        Predicate::Ne => ua != ub,
        Predicate::Slt => sa < sb,
        Predicate::Sle => sa <= sb,
        Predicate::Sgt => sa > sb,
        Predicate::Sge => sa >= sb,
        Predicate::Ult => ua < ub,
        Predicate::Ule => ua <= ub,
        Predicate::Ugt => ua > ub,
        Predicate::Uge => ua >= ub,
    }
}

/// Ordered float comparison; comparisons against NaN are false except `Ne`.
fn fold_fcmp(pred: Predicate, a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return pred == Predicate::Ne;
    }
    match pred {
        Predicate::Eq => a == b,
        Predicate::Ne => a != b,
        Predicate::Slt | Predicate::Ult => a < b,
        Predicate::Sle | Predicate::Ule => a <= b,
        Predicate::Sgt | Predicate::Ugt => a > b,
        Predicate::Sge | Predicate::Uge => a >= b,
    }
}

fn fold_cast(src: IrConst, from: IrType, to: IrType, dl: &DataLayout) -> Option<IrConst> {
    // Float to float, float to int, int/ptr to float.
    if from.is_float() && to.is_float() {
        let f = src.to_f64()?;
        return Some(match to {
            IrType::F32 => IrConst::F32(f as f32),
            _ => IrConst::F64(f),
        });
    }
    if from.is_float() {
        // Trapping conversion: NaN and out-of-range values are undefined.
        let f = src.to_f64()?;
        if f.is_nan() {
            return None;
        }
        let t = f.trunc();
        let w = to.bit_width(dl);
        if to.is_signed() {
            let min = if w >= 64 { i64::MIN as f64 } else { -((1u64 << (w - 1)) as f64) };
            let max = if w >= 64 { i64::MAX as f64 } else { ((1u64 << (w - 1)) as f64) - 1.0 };
            if t < min || t > max {
                return None;
            }
            return Some(IrConst::from_i64(t as i64, to));
        }
        if to.is_unsigned() || to == IrType::Ptr {
            let max = if w >= 64 { u64::MAX as f64 } else { ((1u64 << w) as f64) - 1.0 };
            if t < 0.0 || t > max {
                return None;
            }
            return Some(IrConst::from_i64(t as u64 as i64, to));
        }
        return None;
    }
    let v = int_value(src, from)?;
    if to.is_float() {
        let f = if from.is_unsigned() || from == IrType::Ptr {
            zext(v, from.bit_width(dl)) as f64
        } else {
            v as f64
        };
        return Some(match to {
            IrType::F32 => IrConst::F32(f as f32),
            _ => IrConst::F64(f),
        });
    }
    if to == IrType::Ptr {
        return Some(IrConst::Ptr(dl.truncate_pointer(v as u64)));
    }
    if to.is_integer() {
        return Some(IrConst::from_i64(v, to));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;

    fn eval_binop(op: Opcode, ty: IrType, a: i64, b: i64, no_wrap: bool) -> Option<IrConst> {
        let mut bld = FunctionBuilder::new("t", ty);
        let entry = bld.create_block();
        bld.switch_to(entry);
        let ca = bld.iconst(ty, a);
        let cb = bld.iconst(ty, b);
        let r = if no_wrap {
            bld.binop_nowrap(op, ty, ca, cb)
        } else {
            bld.binop(op, ty, ca, cb)
        };
        bld.ret(Some(r));
        let func = bld.finish();
        let inst = func.def_inst(r).unwrap();
        try_evaluate(&func, inst, &DataLayout::default())
    }

    #[test]
    fn test_basic_arithmetic() {
        assert_eq!(eval_binop(Opcode::Add, IrType::I32, 10, 20, false), Some(IrConst::I32(30)));
        assert_eq!(eval_binop(Opcode::Mul, IrType::I32, 30, 2, false), Some(IrConst::I32(60)));
        assert_eq!(eval_binop(Opcode::SDiv, IrType::I32, 60, 3, false), Some(IrConst::I32(20)));
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        assert_eq!(eval_binop(Opcode::SDiv, IrType::I32, 1, 0, false), None);
        assert_eq!(eval_binop(Opcode::UDiv, IrType::I64, 1, 0, false), None);
        assert_eq!(eval_binop(Opcode::SRem, IrType::I32, 1, 0, false), None);
    }

    #[test]
    fn test_sdiv_min_by_minus_one_is_not_folded() {
        assert_eq!(eval_binop(Opcode::SDiv, IrType::I32, i32::MIN as i64, -1, false), None);
    }

    #[test]
    fn test_nowrap_overflow_is_not_folded() {
        assert_eq!(eval_binop(Opcode::Add, IrType::I32, i32::MAX as i64, 1, true), None);
        // The same evaluation wraps when overflow is defined.
        assert_eq!(
            eval_binop(Opcode::Add, IrType::I32, i32::MAX as i64, 1, false),
            Some(IrConst::I32(i32::MIN))
        );
    }

    #[test]
    fn test_shift_out_of_range_is_not_folded() {
        assert_eq!(eval_binop(Opcode::Shl, IrType::I32, 1, 32, false), None);
        assert_eq!(eval_binop(Opcode::Shl, IrType::I32, 1, 31, false), Some(IrConst::I32(i32::MIN)));
    }

    #[test]
    fn test_unsigned_division_uses_unsigned_bits() {
        // 0xFFFF_FFFE / 2 as u32 is 0x7FFF_FFFF, not -1.
        assert_eq!(
            eval_binop(Opcode::UDiv, IrType::U32, -2i64, 2, false),
            Some(IrConst::I32(0x7FFF_FFFF))
        );
    }

    #[test]
    fn test_icmp_signedness() {
        let mut bld = FunctionBuilder::new("t", IrType::I8);
        let entry = bld.create_block();
        bld.switch_to(entry);
        let a = bld.iconst(IrType::I32, -1);
        let b = bld.iconst(IrType::I32, 1);
        let s = bld.icmp(Predicate::Slt, a, b);
        let u = bld.icmp(Predicate::Ult, a, b);
        bld.ret(Some(s));
        let func = bld.finish();
        let dl = DataLayout::default();
        assert_eq!(try_evaluate(&func, func.def_inst(s).unwrap(), &dl), Some(IrConst::I8(1)));
        // As unsigned, -1 is 0xFFFFFFFF which is not below 1.
        assert_eq!(try_evaluate(&func, func.def_inst(u).unwrap(), &dl), Some(IrConst::I8(0)));
    }

    #[test]
    fn test_float_to_int_range_checks() {
        let mut bld = FunctionBuilder::new("t", IrType::I8);
        let entry = bld.create_block();
        bld.switch_to(entry);
        let big = bld.fconst64(3.0e10);
        let nan = bld.fconst64(f64::NAN);
        let ok = bld.fconst64(-3.5);
        let c1 = bld.cast(IrType::I32, big);
        let c2 = bld.cast(IrType::I32, nan);
        let c3 = bld.cast(IrType::I32, ok);
        bld.ret(Some(c3));
        let func = bld.finish();
        let dl = DataLayout::default();
        assert_eq!(try_evaluate(&func, func.def_inst(c1).unwrap(), &dl), None);
        assert_eq!(try_evaluate(&func, func.def_inst(c2).unwrap(), &dl), None);
        assert_eq!(try_evaluate(&func, func.def_inst(c3).unwrap(), &dl), Some(IrConst::I32(-3)));
    }

    #[test]
    fn test_gep_folds_through_datalayout() {
        let mut bld = FunctionBuilder::new("t", IrType::Ptr);
        let entry = bld.create_block();
        bld.switch_to(entry);
        let base = bld.pconst(0x1000);
        let idx = bld.iconst(IrType::I64, 3);
        let addr = bld.gep(base, idx, 4, true);
        bld.ret(Some(addr));
        let func = bld.finish();
        let inst = func.def_inst(addr).unwrap();
        assert_eq!(
            try_evaluate(&func, inst, &DataLayout::default()),
            Some(IrConst::Ptr(0x100C))
        );
        // A 4-byte pointer target wraps the address to 32 bits.
        let dl32 = DataLayout { pointer_size: 4, little_endian: true };
        assert_eq!(try_evaluate(&func, inst, &dl32), Some(IrConst::Ptr(0x100C)));
    }

    #[test]
    fn test_select_all_constant() {
        let mut bld = FunctionBuilder::new("t", IrType::I32);
        let entry = bld.create_block();
        bld.switch_to(entry);
        let c = bld.iconst(IrType::I8, 1);
        let a = bld.iconst(IrType::I32, 10);
        let b = bld.iconst(IrType::I32, 20);
        let s = bld.select(IrType::I32, c, a, b);
        bld.ret(Some(s));
        let func = bld.finish();
        let inst = func.def_inst(s).unwrap();
        assert_eq!(try_evaluate(&func, inst, &DataLayout::default()), Some(IrConst::I32(10)));
    }
}
