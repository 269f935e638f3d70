//! Diagnostics shared by every stage of the pipeline.
//!
//! Errors are values, not control-flow escapes: every phase returns either a
//! result or diagnostics. A single [`AlthreadError`] shape covers all phases
//! so external consumers see one serializable format.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Pid;

/// Source position attached to AST nodes, instructions and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pos {
    /// Logical path of the file the span comes from.
    pub file: String,
    /// Byte offset of the span start.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// 1-based line of the span start.
    pub line: usize,
    /// 1-based column of the span start.
    pub column: usize,
}

impl Pos {
    /// Span covering both positions, anchored at `self`.
    pub fn merge(&self, other: &Pos) -> Pos {
        Pos {
            file: self.file.clone(),
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line,
            column: self.column,
        }
    }

    /// Whether `self` lies entirely within `other`.
    pub fn within(&self, other: &Pos) -> bool {
        self.file == other.file && self.start >= other.start && self.end <= other.end
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Classification of a diagnostic, by pipeline stage or runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Tokenization failure.
    Lex,
    /// Grammar failure.
    Parse,
    /// Import resolution failure.
    Import,
    /// Name resolution failure, including the case rule for identifiers.
    Name,
    /// Type error.
    Type,
    /// `@private` access violation.
    Privacy,
    /// Channel endpoint arity or type mismatch.
    PortMismatch,
    /// Runtime fault in the virtual machine.
    Vm,
    /// `always`/`eventually` assertion violation.
    Assertion,
    /// No process can make progress.
    Deadlock,
    /// Step or state budget exhausted.
    Budget,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lex => "lex error",
            ErrorKind::Parse => "parse error",
            ErrorKind::Import => "import error",
            ErrorKind::Name => "name error",
            ErrorKind::Type => "type error",
            ErrorKind::Privacy => "privacy violation",
            ErrorKind::PortMismatch => "port mismatch",
            ErrorKind::Vm => "runtime error",
            ErrorKind::Assertion => "assertion violation",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::Budget => "budget exceeded",
        };
        write!(f, "{}", name)
    }
}

/// A secondary position attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Explanation of why the position is relevant.
    pub message: String,
    /// The position itself.
    pub pos: Pos,
}

/// The structured error produced by every phase.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{}", self.render())]
pub struct AlthreadError {
    /// Diagnostic classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Primary source position, when one is known.
    pub pos: Option<Pos>,
    /// Secondary positions.
    pub notes: Vec<Note>,
}

impl AlthreadError {
    /// Build a diagnostic with a primary position.
    pub fn new(kind: ErrorKind, pos: Pos, message: impl Into<String>) -> Self {
        AlthreadError {
            kind,
            message: message.into(),
            pos: Some(pos),
            notes: Vec::new(),
        }
    }

    /// Build a diagnostic without a position (global conditions such as
    /// deadlock or exhausted budgets).
    pub fn global(kind: ErrorKind, message: impl Into<String>) -> Self {
        AlthreadError {
            kind,
            message: message.into(),
            pos: None,
            notes: Vec::new(),
        }
    }

    /// Wrap a VM fault with the faulting process and position.
    pub fn vm(err: VmError, pid: Pid, pos: Option<Pos>) -> Self {
        AlthreadError {
            kind: ErrorKind::Vm,
            message: format!("process {}: {}", pid, err),
            pos,
            notes: Vec::new(),
        }
    }

    /// Attach a secondary position.
    pub fn with_note(mut self, message: impl Into<String>, pos: Pos) -> Self {
        self.notes.push(Note {
            message: message.into(),
            pos,
        });
        self
    }

    fn render(&self) -> String {
        match &self.pos {
            Some(pos) => format!("{} at {}: {}", self.kind, pos, self.message),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

/// Faults the virtual machine can raise while executing an instruction.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum VmError {
    /// Integer division by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Integer modulo by zero.
    #[error("modulo by zero")]
    ModuloByZero,
    /// Index outside a list or tuple.
    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange {
        /// The offending index.
        index: i64,
        /// The container length.
        len: usize,
    },
    /// Operand type did not match the instruction.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// What the instruction required.
        expected: String,
        /// What was on the stack.
        actual: String,
    },
    /// `send` on a port with no channel declaration reaching it.
    #[error("send on undeclared channel '{0}'")]
    UndeclaredChannel(String),
    /// A second channel declaration for the same sender endpoint.
    #[error("channel '{0}' is already connected")]
    ChannelRedeclared(String),
    /// `run` of a program name absent from the compiled program.
    #[error("unknown program '{0}'")]
    UnknownProgram(String),
    /// Operand stack underflow; indicates a lowering bug.
    #[error("stack underflow")]
    StackUnderflow,
    /// A single macro-step executed more instructions than the per-step
    /// limit, i.e. a loop with no globally visible operation.
    #[error("instruction limit exceeded within one step")]
    InstructionLimit,
    /// Integer overflow in arithmetic.
    #[error("integer overflow")]
    Overflow,
}

/// Result alias used by phases that stop at the first error.
pub type AlthreadResult<T> = Result<T, AlthreadError>;

/// Result alias used by the public pipeline operations, which report every
/// diagnostic collected by the failing phase.
pub type CompileResult<T> = Result<T, Vec<AlthreadError>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Pos {
        Pos {
            file: "main.alt".into(),
            start: 10,
            end: 14,
            line: 2,
            column: 3,
        }
    }

    #[test]
    fn test_render_with_pos() {
        let err = AlthreadError::new(ErrorKind::Type, pos(), "expected int");
        assert_eq!(err.to_string(), "type error at main.alt:2:3: expected int");
    }

    #[test]
    fn test_render_global() {
        let err = AlthreadError::global(ErrorKind::Deadlock, "no process can make progress");
        assert_eq!(err.to_string(), "deadlock: no process can make progress");
    }

    #[test]
    fn test_vm_error_wrapping() {
        let err = AlthreadError::vm(VmError::DivisionByZero, Pid(2), Some(pos()));
        assert_eq!(err.kind, ErrorKind::Vm);
        assert!(err.message.contains("#2"));
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_serializable() {
        let err = AlthreadError::new(ErrorKind::Parse, pos(), "unexpected token");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"parse\""));
    }

    #[test]
    fn test_pos_within() {
        let outer = Pos {
            file: "a".into(),
            start: 0,
            end: 100,
            line: 1,
            column: 1,
        };
        let inner = Pos {
            file: "a".into(),
            start: 5,
            end: 20,
            line: 1,
            column: 6,
        };
        assert!(inner.within(&outer));
        assert!(!outer.within(&inner));
    }
}
