//! SSA-form optimization framework: aggressive constant folding, value-numbering
//! based redundancy elimination, and trip-count driven loop unrolling.
//!
//! The crate operates on one [`ir::Function`] at a time. A host pipeline
//! constructs IR through [`ir::FunctionBuilder`] (or supplies its own lowered
//! form), then runs passes individually or through the combined pipeline
//! registered under the `custom-optimize` entry point (see [`passes`]).
//!
//! Pass composition order is constant-fold, then redundancy-eliminate, then
//! loop-unroll. Every pass returns a [`passes::PassResult`] naming the
//! analyses it preserved so the host can invalidate the rest.

pub mod common;
pub mod ir;
pub mod passes;

pub use crate::common::types::{DataLayout, IrType, Predicate};
pub use crate::ir::builder::FunctionBuilder;
pub use crate::ir::ir::{BasicBlock, BlockId, Function, Inst, IrConst, Opcode, Value};
pub use crate::passes::{PassResult, PreservedAnalyses};
