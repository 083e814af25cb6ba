//! Typed IR-contract violations reported by the verifier.
//!
//! Passes themselves never surface errors: expected failures (unfoldable
//! constants, refused unrolls) are skipped or reported through the remark
//! stream. These errors only describe malformed IR, which is out of contract
//! for the transformations and checked by `ir::verify` in debug pipelines.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("block .L{0} is empty")]
    EmptyBlock(u32),

    #[error("block .L{0} does not end in a terminator")]
    MissingTerminator(u32),

    #[error("terminator in the middle of block .L{0}")]
    MidBlockTerminator(u32),

    #[error("phi after non-phi instruction in block .L{0}")]
    MisplacedPhi(u32),

    #[error("phi in block .L{0} has {1} incoming entries that do not match its {2} predecessors")]
    PhiArityMismatch(u32, usize, usize),

    #[error("branch in block .L{0} targets unknown block .L{1}")]
    UnknownBlock(u32, u32),

    #[error("instruction i{0} appears in block list but its arena slot is erased")]
    ErasedInBlock(u32),

    #[error("value %{0} is defined by instruction i{1} which is not attached to a block")]
    DetachedDef(u32, u32),

    #[error("use of value %{1} by instruction i{0} is not dominated by its definition")]
    UseNotDominated(u32, u32),

    #[error("value %{0} records erased instruction i{1} as a user")]
    DanglingUse(u32, u32),

    #[error("instruction i{0} operand {1} has no matching use edge on the used value")]
    MissingUseEdge(u32, usize),

    #[error("use edge on value %{0} points at instruction i{1} operand {2}, which holds a different value")]
    StaleUseEdge(u32, u32, usize),
}
