//! The per-process evaluator: executes one macro-step.
//!
//! A macro-step runs instructions of a single process until just after the
//! first globally visible instruction (shared read/write, channel send or
//! probe), until the process finishes, or — inside `atomic` regions — until
//! the region closes. Purely local instruction runs collapse into the same
//! transition, so a process that never touches shared state contributes a
//! single step.
//!
//! Blocking is all-or-nothing: when a `WaitCond` guard fails anywhere in the
//! step, the attempt aborts and the caller discards the state it was applied
//! to. No prefix of a blocked step is ever observable, which is exactly the
//! atomicity the model checker needs.

use log::trace;

use crate::bytecode::instruction::Op;
use crate::bytecode::{ops, CompiledProgram, Instruction};
use crate::error::{AlthreadError, AlthreadResult, Pos, VmError};
use crate::types::{Literal, Pid, ProcHandle};
use crate::vm::channel::{Channel, ChannelId};
use crate::vm::process::{CodeRef, Frame, ProcessStatus};
use crate::vm::state::GlobalState;

/// Default cap on instructions inside one macro-step; a step that exceeds it
/// is a loop with no globally visible operation.
pub const DEFAULT_STEP_INSTRUCTION_LIMIT: u64 = 100_000;

/// A send or receive observed during a step, for the message-flow log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    /// True for a send, false for a receive.
    pub sent: bool,
    /// The channel.
    pub channel: ChannelId,
    /// The receiving endpoint.
    pub receiver: (Pid, String),
    /// The message, as a tuple of its components.
    pub message: Literal,
    /// Per-channel monotonic sequence number of the message.
    pub number: u64,
}

/// Observable side effects of one committed macro-step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepEffects {
    /// `print` output, one entry per statement.
    pub prints: Vec<String>,
    /// Channel operations in execution order.
    pub events: Vec<ChannelEvent>,
    /// Source lines the step executed, deduplicated consecutively.
    pub lines: Vec<usize>,
    /// Shared variables the step wrote; `always` assertions re-evaluate only
    /// when one of their dependencies appears here.
    pub writes: Vec<String>,
    /// Instructions executed.
    pub instructions: u64,
}

/// Outcome of attempting a macro-step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step committed; the state passed in is the successor.
    Completed(StepEffects),
    /// A guard was unsatisfied; the state passed in must be discarded.
    Blocked,
}

/// Executes macro-steps of one compiled program.
pub struct Executor<'a> {
    program: &'a CompiledProgram,
    step_limit: u64,
}

impl<'a> Executor<'a> {
    /// Executor with the default per-step instruction limit.
    pub fn new(program: &'a CompiledProgram) -> Self {
        Executor {
            program,
            step_limit: DEFAULT_STEP_INSTRUCTION_LIMIT,
        }
    }

    /// Override the per-step instruction limit.
    pub fn with_step_limit(program: &'a CompiledProgram, step_limit: u64) -> Self {
        Executor {
            program,
            step_limit,
        }
    }

    fn code_of(&self, code: &CodeRef) -> &'a [Instruction] {
        match code {
            CodeRef::Program(name) => {
                &self
                    .program
                    .program(name)
                    .expect("processes only run compiled programs")
                    .instructions
            }
            CodeRef::Function(id) => &self.program.functions[*id].instructions,
        }
    }

    /// Attempt one macro-step of `pid` on `state`.
    ///
    /// On `Completed`, `state` is the committed successor. On `Blocked` or
    /// `Err`, `state` is torn and must be discarded — callers always apply
    /// steps to a clone.
    pub fn macro_step(
        &self,
        state: &mut GlobalState,
        pid: Pid,
    ) -> AlthreadResult<StepOutcome> {
        let mut atomic_depth: usize = 0;
        let mut effects = StepEffects::default();

        loop {
            if effects.instructions >= self.step_limit {
                let pos = self.current_pos(state, pid);
                return Err(AlthreadError::vm(VmError::InstructionLimit, pid, pos));
            }

            let (code_ref, pc) = {
                let process = state.process(pid);
                debug_assert!(!process.finished(), "stepping a finished process");
                let frame = process.frame();
                (frame.code.clone(), frame.pc)
            };
            let instr = &self.code_of(&code_ref)[pc];
            trace!("{} pc {}: {}", pid, pc, instr.op);

            // An atomic region (explicit or a wait/receive guard) opens a
            // fresh macro-step: work already done commits first, so a guard
            // that later blocks cannot roll it back.
            if matches!(instr.op, Op::AtomicBegin)
                && atomic_depth == 0
                && effects.instructions > 0
            {
                state.process_mut(pid).status = ProcessStatus::Running;
                return Ok(StepOutcome::Completed(effects));
            }

            if let Some(line) = instr.line() {
                if effects.lines.last() != Some(&line) {
                    effects.lines.push(line);
                }
            }
            effects.instructions += 1;

            {
                let process = state.process_mut(pid);
                process.clock += 1;
                process.frame_mut().pc = pc + 1;
            }

            let pos = instr.pos.clone();
            match &instr.op {
                Op::PushLit(lit) => {
                    state.process_mut(pid).stack.push(lit.clone());
                }
                Op::PushSelf => {
                    let program = state.process(pid).program.clone();
                    state
                        .process_mut(pid)
                        .stack
                        .push(Literal::Proc(ProcHandle { program, pid }));
                }
                Op::LoadLocal(slot) => {
                    let process = state.process_mut(pid);
                    let fp = process.frame().fp;
                    let value = process.stack[fp + slot].clone();
                    process.stack.push(value);
                }
                Op::StoreLocal(slot) => {
                    let process = state.process_mut(pid);
                    let fp = process.frame().fp;
                    let value = self.pop(state, pid, &pos)?;
                    state.process_mut(pid).stack[fp + slot] = value;
                }
                Op::LoadShared(name) => {
                    let value = state
                        .shared
                        .get(name)
                        .cloned()
                        .expect("the analyzer resolved every shared variable");
                    state.process_mut(pid).stack.push(value);
                }
                Op::StoreShared(name) => {
                    let value = self.pop(state, pid, &pos)?;
                    state.shared.insert(name.clone(), value);
                    if !effects.writes.contains(name) {
                        effects.writes.push(name.clone());
                    }
                    state.bump_epoch();
                }
                Op::BinOp(op) => {
                    let right = self.pop(state, pid, &pos)?;
                    let left = self.pop(state, pid, &pos)?;
                    let result = ops::apply_binop(*op, left, right)
                        .map_err(|e| AlthreadError::vm(e, pid, pos.clone()))?;
                    state.process_mut(pid).stack.push(result);
                }
                Op::UnOp(op) => {
                    let operand = self.pop(state, pid, &pos)?;
                    let result = ops::apply_unop(*op, operand)
                        .map_err(|e| AlthreadError::vm(e, pid, pos.clone()))?;
                    state.process_mut(pid).stack.push(result);
                }
                Op::MakeTuple(n) => {
                    let items = self.pop_n(state, pid, *n, &pos)?;
                    state.process_mut(pid).stack.push(Literal::Tuple(items));
                }
                Op::MakeList(n) => {
                    let items = self.pop_n(state, pid, *n, &pos)?;
                    state.process_mut(pid).stack.push(Literal::List(items));
                }
                Op::Index => {
                    let index = self.pop(state, pid, &pos)?;
                    let base = self.pop(state, pid, &pos)?;
                    let result = ops::apply_index(base, index)
                        .map_err(|e| AlthreadError::vm(e, pid, pos.clone()))?;
                    state.process_mut(pid).stack.push(result);
                }
                Op::Pop(n) => {
                    self.pop_n(state, pid, *n, &pos)?;
                }
                Op::Jump(target) => {
                    state.process_mut(pid).frame_mut().pc = *target;
                }
                Op::JumpIfFalse(target) => {
                    let cond = self.pop_bool(state, pid, &pos)?;
                    if !cond {
                        state.process_mut(pid).frame_mut().pc = *target;
                    }
                }
                Op::BreakLoop { target, pops } | Op::ContinueLoop { target, pops } => {
                    self.pop_n(state, pid, *pops, &pos)?;
                    state.process_mut(pid).frame_mut().pc = *target;
                }
                Op::Call { function, args } => {
                    let process = state.process_mut(pid);
                    let fp = process.stack.len() - args;
                    process.frames.push(Frame {
                        code: CodeRef::Function(*function),
                        pc: 0,
                        fp,
                    });
                }
                Op::Return => {
                    let value = self.pop(state, pid, &pos)?;
                    let process = state.process_mut(pid);
                    let frame = process
                        .frames
                        .pop()
                        .expect("return only occurs inside a function frame");
                    process.stack.truncate(frame.fp);
                    process.stack.push(value);
                }
                Op::Print { args } => {
                    let items = self.pop_n(state, pid, *args, &pos)?;
                    let rendered: Vec<String> =
                        items.iter().map(|item| item.to_string()).collect();
                    effects.prints.push(rendered.join(" "));
                }
                Op::RunProgram(name) => {
                    let params = self
                        .program
                        .program(name)
                        .ok_or_else(|| {
                            AlthreadError::vm(
                                VmError::UnknownProgram(name.clone()),
                                pid,
                                pos.clone(),
                            )
                        })?
                        .params
                        .len();
                    let args = self.pop_n(state, pid, params, &pos)?;
                    let child = Pid(state.next_pid);
                    state.next_pid += 1;
                    state
                        .processes
                        .push_back(crate::vm::process::Process::new(child, name.clone(), args));
                    state.process_mut(pid).stack.push(Literal::Proc(ProcHandle {
                        program: name.clone(),
                        pid: child,
                    }));
                    state.bump_epoch();
                }
                Op::DeclareChannel {
                    sender_port,
                    types,
                    receiver_port,
                } => {
                    let receiver = self.pop_proc(state, pid, &pos)?;
                    let sender = self.pop_proc(state, pid, &pos)?;
                    let id = ChannelId {
                        pid: sender,
                        port: sender_port.clone(),
                    };
                    if state.channels.contains_key(&id) {
                        return Err(AlthreadError::vm(
                            VmError::ChannelRedeclared(id.to_string()),
                            pid,
                            pos,
                        ));
                    }
                    state.channels.insert(
                        id,
                        Channel::new(types.clone(), (receiver, receiver_port.clone())),
                    );
                    state.bump_epoch();
                }
                Op::Send { port, args } => {
                    let components = self.pop_n(state, pid, *args, &pos)?;
                    let id = ChannelId {
                        pid,
                        port: port.clone(),
                    };
                    let Some(channel) = state.channels.get_mut(&id) else {
                        return Err(AlthreadError::vm(
                            VmError::UndeclaredChannel(port.clone()),
                            pid,
                            pos,
                        ));
                    };
                    for (component, expected) in components.iter().zip(channel.types.iter()) {
                        let actual = component.type_of();
                        if !expected.accepts(&actual) {
                            return Err(AlthreadError::vm(
                                VmError::TypeMismatch {
                                    expected: expected.to_string(),
                                    actual: actual.to_string(),
                                },
                                pid,
                                pos,
                            ));
                        }
                    }
                    let message = Literal::Tuple(components);
                    let number = channel.sent;
                    channel.sent += 1;
                    channel.queue.push_back(message.clone());
                    let receiver = channel.receiver.clone();
                    effects.events.push(ChannelEvent {
                        sent: true,
                        channel: id,
                        receiver,
                        message,
                        number,
                    });
                    state.bump_epoch();
                }
                Op::TryReceive { port, binds } => {
                    let channel_id = state.channel_to(pid, port);
                    let received = match channel_id {
                        Some(id) => {
                            let channel = state
                                .channels
                                .get_mut(&id)
                                .expect("channel_to returns live ids");
                            match channel.queue.front().cloned() {
                                Some(message) => {
                                    let number = channel.front_number();
                                    channel.queue.pop_front();
                                    let receiver = channel.receiver.clone();
                                    Some((id, message, number, receiver))
                                }
                                None => None,
                            }
                        }
                        None => None,
                    };
                    match received {
                        Some((id, message, number, receiver)) => {
                            let Literal::Tuple(components) = message.clone() else {
                                unreachable!("queues only hold tuple messages");
                            };
                            if components.len() != *binds {
                                return Err(AlthreadError::vm(
                                    VmError::TypeMismatch {
                                        expected: format!("{} component(s)", binds),
                                        actual: format!("{}", components.len()),
                                    },
                                    pid,
                                    pos,
                                ));
                            }
                            let process = state.process_mut(pid);
                            process.stack.extend(components);
                            process.stack.push(Literal::Bool(true));
                            effects.events.push(ChannelEvent {
                                sent: false,
                                channel: id,
                                receiver,
                                message,
                                number,
                            });
                            state.bump_epoch();
                        }
                        None => {
                            state.process_mut(pid).stack.push(Literal::Bool(false));
                        }
                    }
                }
                Op::WaitCond { .. } => {
                    let satisfied = self.pop_bool(state, pid, &pos)?;
                    if !satisfied {
                        return Ok(StepOutcome::Blocked);
                    }
                }
                Op::AtomicBegin => {
                    atomic_depth += 1;
                }
                Op::AtomicEnd => {
                    atomic_depth = atomic_depth
                        .checked_sub(1)
                        .expect("atomic end without matching begin");
                }
                Op::Halt => {
                    let process = state.process_mut(pid);
                    process.frames.clear();
                    process.stack.clear();
                    process.status = ProcessStatus::Finished;
                    return Ok(StepOutcome::Completed(effects));
                }
            }

            let ends_step = atomic_depth == 0
                && (instr.op.is_global() || matches!(instr.op, Op::AtomicEnd));
            if ends_step {
                state.process_mut(pid).status = ProcessStatus::Running;
                return Ok(StepOutcome::Completed(effects));
            }
        }
    }

    fn current_pos(&self, state: &GlobalState, pid: Pid) -> Option<Pos> {
        let process = state.process(pid);
        if process.finished() {
            return None;
        }
        let frame = process.frame();
        self.code_of(&frame.code)
            .get(frame.pc)
            .and_then(|i| i.pos.clone())
    }

    fn pop(
        &self,
        state: &mut GlobalState,
        pid: Pid,
        pos: &Option<Pos>,
    ) -> AlthreadResult<Literal> {
        state
            .process_mut(pid)
            .stack
            .pop()
            .ok_or_else(|| AlthreadError::vm(VmError::StackUnderflow, pid, pos.clone()))
    }

    fn pop_n(
        &self,
        state: &mut GlobalState,
        pid: Pid,
        n: usize,
        pos: &Option<Pos>,
    ) -> AlthreadResult<Vec<Literal>> {
        let process = state.process_mut(pid);
        if process.stack.len() < n {
            return Err(AlthreadError::vm(VmError::StackUnderflow, pid, pos.clone()));
        }
        let at = process.stack.len() - n;
        Ok(process.stack.split_off(at))
    }

    fn pop_bool(
        &self,
        state: &mut GlobalState,
        pid: Pid,
        pos: &Option<Pos>,
    ) -> AlthreadResult<bool> {
        let value = self.pop(state, pid, pos)?;
        value.as_bool().ok_or_else(|| {
            AlthreadError::vm(
                VmError::TypeMismatch {
                    expected: "bool".to_string(),
                    actual: value.type_of().to_string(),
                },
                pid,
                pos.clone(),
            )
        })
    }

    fn pop_proc(
        &self,
        state: &mut GlobalState,
        pid: Pid,
        pos: &Option<Pos>,
    ) -> AlthreadResult<Pid> {
        let value = self.pop(state, pid, pos)?;
        match value {
            Literal::Proc(handle) => Ok(handle.pid),
            other => Err(AlthreadError::vm(
                VmError::TypeMismatch {
                    expected: "proc".to_string(),
                    actual: other.type_of().to_string(),
                },
                pid,
                pos.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::linker::{link, VirtualFs};
    use crate::semantics::analyze;

    fn compile_src(src: &str) -> CompiledProgram {
        let unit = link("main.alt", src, &VirtualFs::new()).unwrap();
        let checked = analyze(unit).unwrap();
        crate::bytecode::lower(&checked).unwrap()
    }

    #[test]
    fn test_local_program_runs_in_one_step() {
        let program = compile_src(r#"main { print("hi"); }"#);
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        let outcome = executor.macro_step(&mut state, Pid::MAIN).unwrap();
        match outcome {
            StepOutcome::Completed(effects) => {
                assert_eq!(effects.prints, vec!["hi"]);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(state.process(Pid::MAIN).finished());
    }

    #[test]
    fn test_shared_write_ends_step() {
        let program = compile_src(
            "shared { let X: int = 0; }\nmain { X = 1; X = 2; }",
        );
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        executor.macro_step(&mut state, Pid::MAIN).unwrap();
        // The first step commits only the first store.
        assert_eq!(state.shared.get("X"), Some(&Literal::Int(1)));
        assert!(!state.process(Pid::MAIN).finished());
        executor.macro_step(&mut state, Pid::MAIN).unwrap();
        assert_eq!(state.shared.get("X"), Some(&Literal::Int(2)));
    }

    #[test]
    fn test_wait_blocks_without_commit() {
        let program = compile_src(
            "shared { let F: bool = false; }\nmain { wait until F; print(\"done\"); }",
        );
        let executor = Executor::new(&program);
        let state = GlobalState::initial(&program);
        let mut attempt = state.clone();
        let outcome = executor.macro_step(&mut attempt, Pid::MAIN).unwrap();
        assert_eq!(outcome, StepOutcome::Blocked);
        // Satisfy the guard and retry from the pristine state.
        let mut satisfied = state.clone();
        satisfied.shared.insert("F".into(), Literal::Bool(true));
        let outcome = executor.macro_step(&mut satisfied, Pid::MAIN).unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(_)));
    }

    #[test]
    fn test_atomic_body_is_one_step() {
        let program = compile_src(
            "shared { let X: int = 0; }\nmain { atomic { X = X + 1; X = X + 1; } }",
        );
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        executor.macro_step(&mut state, Pid::MAIN).unwrap();
        assert_eq!(state.shared.get("X"), Some(&Literal::Int(2)));
    }

    #[test]
    fn test_run_assigns_sequential_pids() {
        let program = compile_src(
            "shared { let X: int = 0; }\n\
             program P() { X = X + 1; }\n\
             main { let a = run P(); let b = run P(); X = 0; }",
        );
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        // One step covers both local `run` expressions and ends after the
        // shared store.
        executor.macro_step(&mut state, Pid::MAIN).unwrap();
        assert_eq!(state.processes.len(), 3);
        assert_eq!(state.process(Pid(1)).program, "P");
        assert_eq!(state.process(Pid(2)).program, "P");
        assert_eq!(state.next_pid, 3);
    }

    #[test]
    fn test_guard_opens_a_fresh_step() {
        let program = compile_src(
            "shared { let X: int = 0; }\n\
             program P() { X = X + 1; }\n\
             main { run P(); run P(); wait until X == 2; }",
        );
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        // The first step commits the two `run` expressions and stops at the
        // guard; blocking later cannot roll back the process creations.
        let outcome = executor.macro_step(&mut state, Pid::MAIN).unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(_)));
        assert_eq!(state.processes.len(), 3);
        // The guard itself now blocks on a clone until the children run.
        let mut attempt = state.clone();
        let outcome = executor.macro_step(&mut attempt, Pid::MAIN).unwrap();
        assert_eq!(outcome, StepOutcome::Blocked);
    }

    #[test]
    fn test_division_by_zero_faults() {
        let program = compile_src("main { let x = 1 / 0; }");
        let executor = Executor::new(&program);
        let mut state = GlobalState::initial(&program);
        let err = executor.macro_step(&mut state, Pid::MAIN).unwrap_err();
        assert!(err.message.contains("division by zero"));
        assert!(err.pos.is_some());
    }

    #[test]
    fn test_send_on_undeclared_channel_faults() {
        let program = compile_src(
            "program P() { send out(1); }\n\
             program C() { await receive inp(x) => { } }\n\
             main { let p = run P(); let c = run C(); channel p.out (int) > c.inp; }",
        );
        let executor = Executor::new(&program);
        // Hand-build a state where P sends before main connected anything.
        let mut state = GlobalState::initial(&program);
        state
            .processes
            .push_back(crate::vm::process::Process::new(Pid(1), "P", vec![]));
        state.next_pid = 2;
        let err = executor.macro_step(&mut state, Pid(1)).unwrap_err();
        assert!(err.message.contains("undeclared channel"));
    }

    #[test]
    fn test_instruction_limit() {
        let program = compile_src("main { loop { } }");
        let executor = Executor::with_step_limit(&program, 1_000);
        let mut state = GlobalState::initial(&program);
        let err = executor.macro_step(&mut state, Pid::MAIN).unwrap_err();
        assert!(err.message.contains("instruction limit"));
    }
}
