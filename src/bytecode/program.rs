//! Compiled program representation.

use std::collections::HashMap;
use std::fmt;

use crate::bytecode::instruction::{Instruction, Op};
use crate::bytecode::ops;
use crate::error::{Pos, VmError};
use crate::types::{Literal, Type};

/// Assertion block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionKind {
    /// Must hold in every reachable state.
    Always,
    /// Must hold on some state of every terminal cycle.
    Eventually,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionKind::Always => write!(f, "always"),
            AssertionKind::Eventually => write!(f, "eventually"),
        }
    }
}

/// A compiled assertion: an instruction stream evaluating to a boolean over
/// the shared variables only.
#[derive(Debug, Clone)]
pub struct Assertion {
    /// Always or eventually.
    pub kind: AssertionKind,
    /// Condition code.
    pub code: Vec<Instruction>,
    /// Source text of the condition, for reporting.
    pub text: String,
    /// Position of the condition.
    pub pos: Pos,
}

impl Assertion {
    /// Shared variables the condition reads. A condition is re-evaluated
    /// only after a transition that wrote one of them, so an invariant like
    /// `X == 2` does not trip on the initial state before anyone touched
    /// `X`.
    pub fn depends_on(&self) -> Vec<&str> {
        self.code
            .iter()
            .filter_map(|instr| match &instr.op {
                Op::LoadShared(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Evaluate the condition against a shared-variable lookup. The code is
    /// restricted to pure operations; anything else is a lowering bug.
    pub fn evaluate(
        &self,
        lookup: &dyn Fn(&str) -> Option<Literal>,
    ) -> Result<bool, VmError> {
        let result = eval_pure(&self.code, lookup)?;
        result.as_bool().ok_or_else(|| VmError::TypeMismatch {
            expected: "bool".to_string(),
            actual: result.type_of().to_string(),
        })
    }
}

/// Evaluate a pure instruction stream (literals, shared reads, operators)
/// to a single value. Used for assertions and for shared initializers at
/// compile time.
pub fn eval_pure(
    code: &[Instruction],
    lookup: &dyn Fn(&str) -> Option<Literal>,
) -> Result<Literal, VmError> {
    let mut stack: Vec<Literal> = Vec::new();
    for instr in code {
        match &instr.op {
            Op::PushLit(lit) => stack.push(lit.clone()),
            Op::LoadShared(name) => {
                let value = lookup(name).ok_or_else(|| VmError::TypeMismatch {
                    expected: format!("shared variable '{}'", name),
                    actual: "undefined".to_string(),
                })?;
                stack.push(value);
            }
            Op::BinOp(op) => {
                let right = stack.pop().ok_or(VmError::StackUnderflow)?;
                let left = stack.pop().ok_or(VmError::StackUnderflow)?;
                stack.push(ops::apply_binop(*op, left, right)?);
            }
            Op::UnOp(op) => {
                let operand = stack.pop().ok_or(VmError::StackUnderflow)?;
                stack.push(ops::apply_unop(*op, operand)?);
            }
            Op::MakeTuple(n) => {
                let items = split_off(&mut stack, *n)?;
                stack.push(Literal::Tuple(items));
            }
            Op::MakeList(n) => {
                let items = split_off(&mut stack, *n)?;
                stack.push(Literal::List(items));
            }
            Op::Index => {
                let index = stack.pop().ok_or(VmError::StackUnderflow)?;
                let base = stack.pop().ok_or(VmError::StackUnderflow)?;
                stack.push(ops::apply_index(base, index)?);
            }
            other => {
                return Err(VmError::TypeMismatch {
                    expected: "a pure expression".to_string(),
                    actual: format!("instruction '{}'", other),
                });
            }
        }
    }
    stack.pop().ok_or(VmError::StackUnderflow)
}

fn split_off(stack: &mut Vec<Literal>, n: usize) -> Result<Vec<Literal>, VmError> {
    if stack.len() < n {
        return Err(VmError::StackUnderflow);
    }
    Ok(stack.split_off(stack.len() - n))
}

/// Code of one program declaration.
#[derive(Debug, Clone)]
pub struct ProgramCode {
    /// Program name; `main` is a program like any other.
    pub name: String,
    /// Parameter names and types; arguments become the first locals.
    pub params: Vec<(String, Type)>,
    /// Instruction stream, ending in `Halt`.
    pub instructions: Vec<Instruction>,
}

/// Code of one function declaration.
#[derive(Debug, Clone)]
pub struct FunctionCode {
    /// Function name, for disassembly and errors.
    pub name: String,
    /// Parameter names and types.
    pub params: Vec<(String, Type)>,
    /// Return type.
    pub ret: Type,
    /// Instruction stream, ending in `Return`.
    pub instructions: Vec<Instruction>,
}

/// The immutable output of compilation.
#[derive(Debug, Clone, Default)]
pub struct CompiledProgram {
    /// Programs by name, including `main`.
    pub programs: HashMap<String, ProgramCode>,
    /// Functions; the index is the id used by `Call`.
    pub functions: Vec<FunctionCode>,
    /// Shared variables with their initial values, in declaration order.
    pub shared_init: Vec<(String, Literal)>,
    /// Compiled assertions.
    pub assertions: Vec<Assertion>,
}

impl CompiledProgram {
    /// The `main` program's code.
    pub fn main(&self) -> &ProgramCode {
        self.programs
            .get("main")
            .expect("a compiled program always contains 'main'")
    }

    /// Look up a program by name.
    pub fn program(&self, name: &str) -> Option<&ProgramCode> {
        self.programs.get(name)
    }
}

impl fmt::Display for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.programs.keys().collect();
        names.sort();
        for name in names {
            let program = &self.programs[name];
            writeln!(f, "{}:", program.name)?;
            for instr in &program.instructions {
                writeln!(f, "  {}", instr)?;
            }
        }
        for (id, function) in self.functions.iter().enumerate() {
            writeln!(f, "fn{} {}:", id, function.name)?;
            for instr in &function.instructions {
                writeln!(f, "  {}", instr)?;
            }
        }
        for assertion in &self.assertions {
            writeln!(f, "{} {{ {} }}", assertion.kind, assertion.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::BinOp;

    fn instr(op: Op) -> Instruction {
        Instruction::synthetic(op)
    }

    #[test]
    fn test_eval_pure() {
        let code = vec![
            instr(Op::PushLit(Literal::Int(2))),
            instr(Op::PushLit(Literal::Int(3))),
            instr(Op::BinOp(BinOp::Add)),
        ];
        assert_eq!(eval_pure(&code, &|_| None).unwrap(), Literal::Int(5));
    }

    #[test]
    fn test_assertion_evaluates_shared() {
        let assertion = Assertion {
            kind: AssertionKind::Always,
            code: vec![
                instr(Op::LoadShared("C".into())),
                instr(Op::PushLit(Literal::Int(2))),
                instr(Op::BinOp(BinOp::Le)),
            ],
            text: "C <= 2".into(),
            pos: Pos::default(),
        };
        let holds = assertion
            .evaluate(&|name| (name == "C").then(|| Literal::Int(1)))
            .unwrap();
        assert!(holds);
    }

    #[test]
    fn test_impure_instruction_rejected() {
        let code = vec![instr(Op::Halt)];
        assert!(eval_pure(&code, &|_| None).is_err());
    }
}
