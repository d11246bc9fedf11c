//! Core intermediate representation for the murk obfuscation toolkit,
//! plus the deterministic interpreter and constant folder the passes and
//! tests are built on.

pub mod fold;
pub mod interp;
pub mod ir;

pub use ir::{
    AtomicOrdering, BasicBlock, BinOp, BlockAddress, BlockId, EdgeKind, FuncId, Function,
    GlobalDataSlot, GlobalId, GlobalInit, IntWidth, Linkage, ModuleIr, OpId, OpKind, Operand,
    Operation, Pred, Terminator,
};
