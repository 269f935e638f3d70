//! Intermediate representation: stack bytecode with structured concurrency
//! instructions, plus the AST-to-bytecode lowerer.

pub mod instruction;
pub mod lowerer;
pub mod ops;
pub mod program;
pub mod verifier;

pub use instruction::{BinOp, Instruction, Op, UnOp};
pub use lowerer::lower;
pub use program::{
    Assertion, AssertionKind, CompiledProgram, FunctionCode, ProgramCode,
};
