//! Core types shared by every stage: process identifiers, runtime values and
//! the language's type algebra.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process identifier. Pids are assigned deterministically: `main` is pid 0
/// and the i-th `run` executed anywhere in the system yields pid i+1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Pid(pub u32);

impl Pid {
    /// Pid of the `main` process.
    pub const MAIN: Pid = Pid(0);

    /// Get the raw pid value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a running process instance, the value produced by `run P(args)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcHandle {
    /// Name of the program the process is an instance of.
    pub program: String,
    /// The instance's pid.
    pub pid: Pid,
}

/// Runtime value. All Althread data is a value type; there are no heap
/// objects. The serialized form is singleton-keyed (`{"int":5}`,
/// `{"tuple":[...]}`) for external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Literal {
    /// The unit value of statements and `void` functions.
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Immutable string.
    String(String),
    /// Fixed-arity heterogeneous tuple.
    Tuple(Vec<Literal>),
    /// Homogeneous list.
    List(Vec<Literal>),
    /// Process handle.
    Proc(ProcHandle),
}

impl Literal {
    /// The type this value inhabits.
    pub fn type_of(&self) -> Type {
        match self {
            Literal::Null => Type::Void,
            Literal::Int(_) => Type::Int,
            Literal::Bool(_) => Type::Bool,
            Literal::String(_) => Type::String,
            Literal::Tuple(items) => Type::Tuple(items.iter().map(Literal::type_of).collect()),
            Literal::List(items) => {
                let elem = items.first().map(Literal::type_of).unwrap_or(Type::Void);
                Type::List(Box::new(elem))
            }
            Literal::Proc(handle) => Type::Proc(handle.program.clone()),
        }
    }

    /// The value a declaration without an initializer receives.
    pub fn default_of(ty: &Type) -> Literal {
        match ty {
            Type::Void => Literal::Null,
            Type::Int => Literal::Int(0),
            Type::Bool => Literal::Bool(false),
            Type::String => Literal::String(String::new()),
            Type::Tuple(items) => Literal::Tuple(items.iter().map(Literal::default_of).collect()),
            Type::List(_) => Literal::List(Vec::new()),
            Type::Proc(name) => Literal::Proc(ProcHandle {
                program: name.clone(),
                pid: Pid::MAIN,
            }),
        }
    }

    /// Interpret the value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interpret the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::String(s) => write!(f, "{}", s),
            Literal::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Literal::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Literal::Proc(handle) => write!(f, "proc({}){}", handle.program, handle.pid),
        }
    }
}

/// The language's type algebra. No generics and no user-defined records; the
/// only composites are tuples, lists and process handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    /// Statement / no-return-value type.
    Void,
    /// Signed 64-bit integer.
    Int,
    /// Boolean.
    Bool,
    /// String.
    String,
    /// Tuple of the given element types.
    Tuple(Vec<Type>),
    /// List with the given element type.
    List(Box<Type>),
    /// Handle to an instance of the named program.
    Proc(String),
}

impl Type {
    /// Whether a value of type `other` can be used where `self` is expected.
    /// There are no implicit coercions; the only latitude is that an empty
    /// list literal fits any list type.
    pub fn accepts(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::List(_), Type::List(elem)) if **elem == Type::Void => true,
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.accepts(y))
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int => write!(f, "int"),
            Type::Bool => write!(f, "bool"),
            Type::String => write!(f, "string"),
            Type::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Type::List(elem) => write!(f, "list({})", elem),
            Type::Proc(name) => write!(f, "proc({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_types() {
        assert_eq!(Literal::Int(5).type_of(), Type::Int);
        assert_eq!(
            Literal::Tuple(vec![Literal::Int(1), Literal::Bool(true)]).type_of(),
            Type::Tuple(vec![Type::Int, Type::Bool])
        );
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Literal::default_of(&Type::Int), Literal::Int(0));
        assert_eq!(
            Literal::default_of(&Type::List(Box::new(Type::Int))),
            Literal::List(vec![])
        );
    }

    #[test]
    fn test_singleton_keyed_serialization() {
        let json = serde_json::to_string(&Literal::Int(5)).unwrap();
        assert_eq!(json, r#"{"int":5}"#);
        let json = serde_json::to_string(&Literal::Tuple(vec![Literal::Bool(true)])).unwrap();
        assert_eq!(json, r#"{"tuple":[{"bool":true}]}"#);
    }

    #[test]
    fn test_empty_list_fits_any_list() {
        let empty = Literal::List(vec![]).type_of();
        assert!(Type::List(Box::new(Type::Int)).accepts(&empty));
        assert!(!Type::List(Box::new(Type::Int)).accepts(&Type::Int));
    }
}
