//! Static checks over lowered bytecode.
//!
//! The lowerer promises a strict stack discipline: statements are balanced,
//! expressions add exactly one value, and every program ends at `Halt` with
//! only its locals on the stack. The verifier walks each instruction stream
//! with a worklist, propagating the stack depth along every control edge and
//! rejecting inconsistencies. It exists for tests and debug builds; a
//! verification failure is always a lowering bug, never a user error.

use crate::bytecode::instruction::{Instruction, Op};
use crate::bytecode::program::CompiledProgram;

/// Verify the stack discipline of every code unit in `program`.
pub fn verify(program: &CompiledProgram) -> Result<(), String> {
    for code in program.programs.values() {
        verify_unit(
            &format!("program {}", code.name),
            &code.instructions,
            code.params.len(),
            program,
        )?;
    }
    for (id, function) in program.functions.iter().enumerate() {
        verify_unit(
            &format!("fn{} {}", id, function.name),
            &function.instructions,
            function.params.len(),
            program,
        )?;
    }
    for assertion in &program.assertions {
        verify_unit(
            &format!("assertion {}", assertion.text),
            &assertion.code,
            0,
            program,
        )?;
    }
    Ok(())
}

fn verify_unit(
    unit: &str,
    code: &[Instruction],
    entry_depth: usize,
    program: &CompiledProgram,
) -> Result<(), String> {
    if code.is_empty() {
        return Ok(());
    }
    let mut depths: Vec<Option<i64>> = vec![None; code.len()];
    let mut worklist = vec![(0usize, entry_depth as i64)];

    while let Some((pc, depth)) = worklist.pop() {
        if pc >= code.len() {
            return Err(format!("{}: control flows past the end at pc {}", unit, pc));
        }
        match depths[pc] {
            Some(known) if known != depth => {
                return Err(format!(
                    "{}: pc {} reached with depths {} and {}",
                    unit, pc, known, depth
                ));
            }
            Some(_) => continue,
            None => depths[pc] = Some(depth),
        }

        let (delta, edges) = effect(&code[pc].op, program)?;
        let next = depth + delta;
        if next < 0 {
            return Err(format!(
                "{}: stack underflow at pc {} ({})",
                unit, pc, code[pc].op
            ));
        }
        match edges {
            Edges::Fallthrough => worklist.push((pc + 1, next)),
            Edges::Jump(target) => worklist.push((target, next)),
            Edges::Branch(target) => {
                worklist.push((pc + 1, next));
                worklist.push((target, next));
            }
            Edges::Terminal => {}
        }
    }
    Ok(())
}

enum Edges {
    Fallthrough,
    Jump(usize),
    Branch(usize),
    Terminal,
}

/// Net stack effect and outgoing edges of one opcode. The blocked outcome of
/// `WaitCond` and failed `TryReceive` probes are not edges: a blocked guard
/// aborts the whole macro-step, so only the success path is ever observable.
fn effect(op: &Op, program: &CompiledProgram) -> Result<(i64, Edges), String> {
    let r = match op {
        Op::PushLit(_) | Op::PushSelf | Op::LoadLocal(_) | Op::LoadShared(_) => {
            (1, Edges::Fallthrough)
        }
        Op::StoreLocal(_) | Op::StoreShared(_) => (-1, Edges::Fallthrough),
        Op::BinOp(_) | Op::Index => (-1, Edges::Fallthrough),
        Op::UnOp(_) => (0, Edges::Fallthrough),
        Op::MakeTuple(n) | Op::MakeList(n) => (1 - *n as i64, Edges::Fallthrough),
        Op::Pop(n) => (-(*n as i64), Edges::Fallthrough),
        Op::Jump(target) => (0, Edges::Jump(*target)),
        Op::JumpIfFalse(target) => (-1, Edges::Branch(*target)),
        Op::BreakLoop { target, pops } | Op::ContinueLoop { target, pops } => {
            (-(*pops as i64), Edges::Jump(*target))
        }
        Op::Call { args, .. } => (1 - *args as i64, Edges::Fallthrough),
        Op::Return => (0, Edges::Terminal),
        Op::Print { args } => (-(*args as i64), Edges::Fallthrough),
        Op::RunProgram(name) => {
            let params = program
                .program(name)
                .map(|p| p.params.len())
                .ok_or_else(|| format!("run of unknown program '{}'", name))?;
            (1 - params as i64, Edges::Fallthrough)
        }
        Op::DeclareChannel { .. } => (-2, Edges::Fallthrough),
        Op::Send { args, .. } => (-(*args as i64), Edges::Fallthrough),
        Op::TryReceive { binds, .. } => (1 + *binds as i64, Edges::Fallthrough),
        Op::WaitCond { .. } => (-1, Edges::Fallthrough),
        Op::AtomicBegin | Op::AtomicEnd => (0, Edges::Fallthrough),
        Op::Halt => (0, Edges::Terminal),
    };
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::linker::{link, VirtualFs};
    use crate::semantics::analyze;

    fn compile_src(src: &str) -> CompiledProgram {
        let unit = link("main.alt", src, &VirtualFs::new()).unwrap();
        let checked = analyze(unit).unwrap();
        crate::bytecode::lowerer::lower(&checked).unwrap()
    }

    #[test]
    fn test_balanced_hello() {
        let compiled = compile_src(r#"main { print("hi"); }"#);
        verify(&compiled).unwrap();
    }

    #[test]
    fn test_balanced_control_flow() {
        let compiled = compile_src(
            "shared { let C: int = 0; }\n\
             main {\n\
                 let x = 0;\n\
                 for i in 0..3 {\n\
                     if i % 2 == 0 { x = x + i; } else { continue; }\n\
                     while x > 2 { x = x - 1; break; }\n\
                 }\n\
                 wait until C == 0;\n\
             }",
        );
        verify(&compiled).unwrap();
    }

    #[test]
    fn test_balanced_channels_and_functions() {
        let compiled = compile_src(
            "fn double(x: int) -> int { return x * 2; }\n\
             program Producer() { send out(double(1)); }\n\
             program Consumer() { await receive inp(v) => { print(v); } }\n\
             main {\n\
                 let p = run Producer();\n\
                 let c = run Consumer();\n\
                 channel p.out (int) > c.inp;\n\
             }",
        );
        verify(&compiled).unwrap();
    }
}
