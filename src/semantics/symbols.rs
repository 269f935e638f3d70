//! Symbol table built by the semantic analyzer and consumed by the lowerer.

use std::collections::{BTreeMap, HashMap};

use crate::error::Pos;
use crate::types::Type;

/// A shared variable. Shared names form one global namespace across the
/// translation unit.
#[derive(Debug, Clone)]
pub struct SharedVar {
    /// Declared or inferred type.
    pub ty: Type,
    /// Module the variable was declared in.
    pub module: String,
    /// Declaration position.
    pub pos: Pos,
}

/// A program signature. Program names are unique across the unit.
#[derive(Debug, Clone)]
pub struct ProgramSig {
    /// Parameter names and types, in order.
    pub params: Vec<(String, Type)>,
    /// Module the program was declared in.
    pub module: String,
    /// Declaration position.
    pub pos: Pos,
}

/// A function symbol. The index in [`SymbolTable::functions`] is the
/// function id used by `Call` instructions.
#[derive(Debug, Clone)]
pub struct FunctionSym {
    /// Function name (unique within its module).
    pub name: String,
    /// Module the function was declared in.
    pub module: String,
    /// Parameter names and types, in order.
    pub params: Vec<(String, Type)>,
    /// Return type.
    pub ret: Type,
    /// Whether the function is `@private` to its module.
    pub private: bool,
    /// Declaration position.
    pub pos: Pos,
}

/// Message signature of a channel endpoint, inferred from the channel
/// declarations in `main`.
#[derive(Debug, Clone)]
pub struct PortSig {
    /// Component types of each message.
    pub types: Vec<Type>,
    /// Position of the channel declaration that fixed the signature.
    pub decl_pos: Pos,
}

/// The merged symbol table of a translation unit.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Shared variables in sorted name order.
    pub shared: BTreeMap<String, SharedVar>,
    /// Programs by name.
    pub programs: HashMap<String, ProgramSig>,
    /// Functions; the index is the function id.
    pub functions: Vec<FunctionSym>,
    /// Function id lookup by (module, name).
    pub function_ids: HashMap<(String, String), usize>,
    /// Out-port signatures by (program, port).
    pub out_ports: HashMap<(String, String), PortSig>,
    /// In-port signatures by (program, port).
    pub in_ports: HashMap<(String, String), PortSig>,
}

impl SymbolTable {
    /// Look up a function id by module and name.
    pub fn function_id(&self, module: &str, name: &str) -> Option<usize> {
        self.function_ids
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    /// The function symbol behind an id.
    pub fn function(&self, id: usize) -> &FunctionSym {
        &self.functions[id]
    }
}
