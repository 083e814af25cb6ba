//! IR type identities and target layout parameters shared by all passes.

/// Scalar IR types. Signedness is carried in the type so constant evaluation
/// can pick the right extension when widening sub-word values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Ptr,
    Void,
}

impl IrType {
    /// Size in bytes. Pointers take their width from the [`DataLayout`].
    pub fn size(&self, dl: &DataLayout) -> usize {
        match self {
            IrType::I8 | IrType::U8 => 1,
            IrType::I16 | IrType::U16 => 2,
            IrType::I32 | IrType::U32 | IrType::F32 => 4,
            IrType::I64 | IrType::U64 | IrType::F64 => 8,
            IrType::Ptr => dl.pointer_size as usize,
            IrType::Void => 0,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            IrType::I8
                | IrType::I16
                | IrType::I32
                | IrType::I64
                | IrType::U8
                | IrType::U16
                | IrType::U32
                | IrType::U64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, IrType::U8 | IrType::U16 | IrType::U32 | IrType::U64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    /// Bit width for integer types (pointer width for Ptr). 0 for Void.
    pub fn bit_width(&self, dl: &DataLayout) -> u32 {
        (self.size(dl) * 8) as u32
    }

    /// Dense numeric identity, used when hashing expression keys.
    pub fn code(&self) -> u32 {
        match self {
            IrType::I8 => 0,
            IrType::I16 => 1,
            IrType::I32 => 2,
            IrType::I64 => 3,
            IrType::U8 => 4,
            IrType::U16 => 5,
            IrType::U32 => 6,
            IrType::U64 => 7,
            IrType::F32 => 8,
            IrType::F64 => 9,
            IrType::Ptr => 10,
            IrType::Void => 11,
        }
    }

    /// Short mnemonic used by the textual printer.
    pub fn name(&self) -> &'static str {
        match self {
            IrType::I8 => "i8",
            IrType::I16 => "i16",
            IrType::I32 => "i32",
            IrType::I64 => "i64",
            IrType::U8 => "u8",
            IrType::U16 => "u16",
            IrType::U32 => "u32",
            IrType::U64 => "u64",
            IrType::F32 => "f32",
            IrType::F64 => "f64",
            IrType::Ptr => "ptr",
            IrType::Void => "void",
        }
    }
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison predicates. Signed/unsigned orderings are explicit; float
/// comparisons use the signed spellings with ordered semantics (any
/// comparison involving a NaN evaluates to false, except `Ne`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl Predicate {
    /// Nonzero numeric identity for expression keys; 0 is reserved for
    /// "no predicate".
    pub fn code(&self) -> u32 {
        match self {
            Predicate::Eq => 1,
            Predicate::Ne => 2,
            Predicate::Slt => 3,
            Predicate::Sle => 4,
            Predicate::Sgt => 5,
            Predicate::Sge => 6,
            Predicate::Ult => 7,
            Predicate::Ule => 8,
            Predicate::Ugt => 9,
            Predicate::Uge => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Slt => "slt",
            Predicate::Sle => "sle",
            Predicate::Sgt => "sgt",
            Predicate::Sge => "sge",
            Predicate::Ult => "ult",
            Predicate::Ule => "ule",
            Predicate::Ugt => "ugt",
            Predicate::Uge => "uge",
        }
    }
}

/// Target layout parameters consulted by constant evaluation. Numeric
/// evaluation must go through this so folding matches the target, not the
/// host.
#[derive(Debug, Clone, Copy)]
pub struct DataLayout {
    /// Pointer size in bytes.
    pub pointer_size: u32,
    pub little_endian: bool,
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout { pointer_size: 8, little_endian: true }
    }
}

impl DataLayout {
    /// Mask a raw address down to the pointer width.
    pub fn truncate_pointer(&self, addr: u64) -> u64 {
        let bits = self.pointer_size as u64 * 8;
        if bits >= 64 {
            addr
        } else {
            addr & ((1u64 << bits) - 1)
        }
    }
}
