//! Semantic analysis: symbol collection, name resolution and type checking.

pub mod analyzer;
pub mod symbols;

pub use analyzer::{analyze, CheckedUnit};
pub use symbols::{FunctionSym, PortSig, ProgramSig, SharedVar, SymbolTable};
