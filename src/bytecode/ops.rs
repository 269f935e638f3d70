//! Value semantics of the operators, shared by the VM executor, the
//! compile-time evaluation of shared initializers and the assertion
//! evaluators.

use crate::bytecode::instruction::{BinOp, UnOp};
use crate::error::VmError;
use crate::types::Literal;

fn type_mismatch(expected: &str, actual: &Literal) -> VmError {
    VmError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.type_of().to_string(),
    }
}

/// Apply a binary operator.
pub fn apply_binop(op: BinOp, left: Literal, right: Literal) -> Result<Literal, VmError> {
    use Literal::*;
    match op {
        BinOp::Add => match (left, right) {
            (Int(a), Int(b)) => a
                .checked_add(b)
                .map(Int)
                .ok_or(VmError::Overflow),
            (String(a), String(b)) => Ok(String(a + &b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (l, r) => Err(VmError::TypeMismatch {
                expected: "matching int, string or list operands".to_string(),
                actual: format!("{} and {}", l.type_of(), r.type_of()),
            }),
        },
        BinOp::Sub => int_op(left, right, |a, b| {
            a.checked_sub(b).ok_or(VmError::Overflow)
        }),
        BinOp::Mul => int_op(left, right, |a, b| {
            a.checked_mul(b).ok_or(VmError::Overflow)
        }),
        BinOp::Div => int_op(left, right, |a, b| {
            if b == 0 {
                Err(VmError::DivisionByZero)
            } else {
                a.checked_div(b).ok_or(VmError::Overflow)
            }
        }),
        BinOp::Mod => int_op(left, right, |a, b| {
            if b == 0 {
                Err(VmError::ModuloByZero)
            } else {
                a.checked_rem(b).ok_or(VmError::Overflow)
            }
        }),
        BinOp::Eq => Ok(Bool(left == right)),
        BinOp::Ne => Ok(Bool(left != right)),
        BinOp::Lt => int_cmp(left, right, |a, b| a < b),
        BinOp::Le => int_cmp(left, right, |a, b| a <= b),
        BinOp::Gt => int_cmp(left, right, |a, b| a > b),
        BinOp::Ge => int_cmp(left, right, |a, b| a >= b),
        BinOp::And => bool_op(left, right, |a, b| a && b),
        BinOp::Or => bool_op(left, right, |a, b| a || b),
    }
}

/// Apply a unary operator.
pub fn apply_unop(op: UnOp, operand: Literal) -> Result<Literal, VmError> {
    match op {
        UnOp::Neg => match operand {
            Literal::Int(n) => n.checked_neg().map(Literal::Int).ok_or(VmError::Overflow),
            other => Err(type_mismatch("int", &other)),
        },
        UnOp::Not => match operand {
            Literal::Bool(b) => Ok(Literal::Bool(!b)),
            other => Err(type_mismatch("bool", &other)),
        },
        UnOp::Len => match operand {
            Literal::List(items) => Ok(Literal::Int(items.len() as i64)),
            Literal::Tuple(items) => Ok(Literal::Int(items.len() as i64)),
            Literal::String(s) => Ok(Literal::Int(s.chars().count() as i64)),
            other => Err(type_mismatch("list, string or tuple", &other)),
        },
    }
}

/// Index a list.
pub fn apply_index(base: Literal, index: Literal) -> Result<Literal, VmError> {
    let i = index.as_int().ok_or_else(|| type_mismatch("int", &index))?;
    match base {
        Literal::List(items) => {
            if i < 0 || i as usize >= items.len() {
                Err(VmError::IndexOutOfRange {
                    index: i,
                    len: items.len(),
                })
            } else {
                Ok(items[i as usize].clone())
            }
        }
        other => Err(type_mismatch("list", &other)),
    }
}

fn int_op(
    left: Literal,
    right: Literal,
    f: impl FnOnce(i64, i64) -> Result<i64, VmError>,
) -> Result<Literal, VmError> {
    match (left, right) {
        (Literal::Int(a), Literal::Int(b)) => f(a, b).map(Literal::Int),
        (l, r) => Err(VmError::TypeMismatch {
            expected: "int operands".to_string(),
            actual: format!("{} and {}", l.type_of(), r.type_of()),
        }),
    }
}

fn int_cmp(
    left: Literal,
    right: Literal,
    f: impl FnOnce(i64, i64) -> bool,
) -> Result<Literal, VmError> {
    match (left, right) {
        (Literal::Int(a), Literal::Int(b)) => Ok(Literal::Bool(f(a, b))),
        (l, r) => Err(VmError::TypeMismatch {
            expected: "int operands".to_string(),
            actual: format!("{} and {}", l.type_of(), r.type_of()),
        }),
    }
}

fn bool_op(
    left: Literal,
    right: Literal,
    f: impl FnOnce(bool, bool) -> bool,
) -> Result<Literal, VmError> {
    match (left, right) {
        (Literal::Bool(a), Literal::Bool(b)) => Ok(Literal::Bool(f(a, b))),
        (l, r) => Err(VmError::TypeMismatch {
            expected: "bool operands".to_string(),
            actual: format!("{} and {}", l.type_of(), r.type_of()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            apply_binop(BinOp::Add, Literal::Int(2), Literal::Int(3)).unwrap(),
            Literal::Int(5)
        );
        assert_eq!(
            apply_binop(BinOp::Mod, Literal::Int(7), Literal::Int(3)).unwrap(),
            Literal::Int(1)
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = apply_binop(BinOp::Div, Literal::Int(1), Literal::Int(0)).unwrap_err();
        assert_eq!(err, VmError::DivisionByZero);
    }

    #[test]
    fn test_string_and_list_concat() {
        assert_eq!(
            apply_binop(
                BinOp::Add,
                Literal::String("ab".into()),
                Literal::String("cd".into())
            )
            .unwrap(),
            Literal::String("abcd".into())
        );
        assert_eq!(
            apply_binop(
                BinOp::Add,
                Literal::List(vec![Literal::Int(1)]),
                Literal::List(vec![Literal::Int(2)])
            )
            .unwrap(),
            Literal::List(vec![Literal::Int(1), Literal::Int(2)])
        );
    }

    #[test]
    fn test_comparison() {
        assert_eq!(
            apply_binop(BinOp::Lt, Literal::Int(1), Literal::Int(2)).unwrap(),
            Literal::Bool(true)
        );
        let err = apply_binop(BinOp::Lt, Literal::Bool(true), Literal::Int(2)).unwrap_err();
        assert!(matches!(err, VmError::TypeMismatch { .. }));
    }

    #[test]
    fn test_index() {
        let list = Literal::List(vec![Literal::Int(10), Literal::Int(20)]);
        assert_eq!(
            apply_index(list.clone(), Literal::Int(1)).unwrap(),
            Literal::Int(20)
        );
        let err = apply_index(list, Literal::Int(2)).unwrap_err();
        assert!(matches!(err, VmError::IndexOutOfRange { index: 2, len: 2 }));
    }

    #[test]
    fn test_len() {
        assert_eq!(
            apply_unop(UnOp::Len, Literal::String("abc".into())).unwrap(),
            Literal::Int(3)
        );
    }
}
