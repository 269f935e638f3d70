//! Scheduler: computes the enabled set of a global state.
//!
//! The scheduler owns no state of its own. For every live process it applies
//! one speculative macro-step to a clone of the state; steps that complete
//! are enabled (the clone is the successor), steps that block are not, and
//! steps that fault are *enabled faults* — reachable runtime errors the
//! caller decides how to surface (the simulator aborts, the model checker
//! reports a counter-example). Selecting among the returned steps is the
//! only source of nondeterminism in the whole machine.

use crate::bytecode::CompiledProgram;
use crate::error::AlthreadError;
use crate::types::Pid;
use crate::vm::executor::{Executor, StepEffects, StepOutcome};
use crate::vm::state::GlobalState;

/// One enabled macro-step of a state.
#[derive(Debug)]
pub struct EnabledStep {
    /// The stepped process.
    pub pid: Pid,
    /// Program name of the stepped process, for edge labels.
    pub program: String,
    /// The committed successor and its effects, or the runtime fault the
    /// step runs into.
    pub result: Result<(GlobalState, StepEffects), AlthreadError>,
}

impl EnabledStep {
    /// Source lines the step executed (empty for faulted steps).
    pub fn lines(&self) -> Vec<usize> {
        match &self.result {
            Ok((_, effects)) => effects.lines.clone(),
            Err(_) => Vec::new(),
        }
    }
}

/// Enabled-set computation over one compiled program.
pub struct Scheduler<'a> {
    executor: Executor<'a>,
}

impl<'a> Scheduler<'a> {
    /// Scheduler with the default per-step instruction limit.
    pub fn new(program: &'a CompiledProgram) -> Self {
        Scheduler {
            executor: Executor::new(program),
        }
    }

    /// Scheduler with a custom per-step instruction limit.
    pub fn with_step_limit(program: &'a CompiledProgram, step_limit: u64) -> Self {
        Scheduler {
            executor: Executor::with_step_limit(program, step_limit),
        }
    }

    /// Compute `enabled(state)`: all macro-steps whose guards are satisfied,
    /// in ascending pid order, plus the pids whose probe blocked.
    ///
    /// Treating the state as read-only here is what makes the checker's
    /// snapshots sound: only adopting a returned successor mutates anything.
    pub fn enabled(&self, state: &GlobalState) -> (Vec<EnabledStep>, Vec<Pid>) {
        self.enabled_where(state, |_| true)
    }

    /// Like [`enabled`](Self::enabled), but only probes processes `probe`
    /// accepts. The simulator skips processes it already observed blocked at
    /// the current guard epoch; guards are pure, so re-probing them cannot
    /// change the answer until the epoch moves.
    pub fn enabled_where(
        &self,
        state: &GlobalState,
        probe: impl Fn(Pid) -> bool,
    ) -> (Vec<EnabledStep>, Vec<Pid>) {
        let mut steps = Vec::new();
        let mut blocked = Vec::new();
        for process in state.processes.iter() {
            if process.finished() || !probe(process.pid) {
                continue;
            }
            let mut successor = state.clone();
            match self.executor.macro_step(&mut successor, process.pid) {
                Ok(StepOutcome::Completed(effects)) => steps.push(EnabledStep {
                    pid: process.pid,
                    program: process.program.clone(),
                    result: Ok((successor, effects)),
                }),
                Ok(StepOutcome::Blocked) => blocked.push(process.pid),
                Err(fault) => steps.push(EnabledStep {
                    pid: process.pid,
                    program: process.program.clone(),
                    result: Err(fault),
                }),
            }
        }
        (steps, blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::linker::{link, VirtualFs};
    use crate::semantics::analyze;
    use crate::types::Literal;

    fn compile_src(src: &str) -> CompiledProgram {
        let unit = link("main.alt", src, &VirtualFs::new()).unwrap();
        let checked = analyze(unit).unwrap();
        crate::bytecode::lower(&checked).unwrap()
    }

    #[test]
    fn test_single_process_single_step() {
        let program = compile_src(r#"main { print("hi"); }"#);
        let scheduler = Scheduler::new(&program);
        let state = GlobalState::initial(&program);
        let (steps, blocked) = scheduler.enabled(&state);
        assert_eq!(steps.len(), 1);
        assert!(blocked.is_empty());
        let (successor, effects) = steps[0].result.as_ref().unwrap();
        assert!(successor.all_finished());
        assert_eq!(effects.prints, vec!["hi"]);
    }

    #[test]
    fn test_interleaving_choices() {
        let program = compile_src(
            "shared { let X: int = 0; }\n\
             program P() { X = X + 1; }\n\
             main { run P(); run P(); X = 0; }",
        );
        let scheduler = Scheduler::new(&program);
        let state = GlobalState::initial(&program);
        // Step main once to spawn the children.
        let (steps, _) = scheduler.enabled(&state);
        let (after_spawn, _) = steps[0].result.as_ref().unwrap();
        let (steps, blocked) = scheduler.enabled(after_spawn);
        // main plus both children are enabled.
        assert_eq!(steps.len(), 3);
        assert!(blocked.is_empty());
        let pids: Vec<Pid> = steps.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![Pid(0), Pid(1), Pid(2)]);
    }

    #[test]
    fn test_blocked_guard_not_enabled() {
        let program = compile_src(
            "shared { let F: bool = false; }\nmain { wait until F; }",
        );
        let scheduler = Scheduler::new(&program);
        let state = GlobalState::initial(&program);
        let (steps, blocked) = scheduler.enabled(&state);
        assert!(steps.is_empty());
        assert_eq!(blocked, vec![Pid::MAIN]);
    }

    #[test]
    fn test_fault_is_an_enabled_step() {
        let program = compile_src("main { let x = 1 / 0; }");
        let scheduler = Scheduler::new(&program);
        let state = GlobalState::initial(&program);
        let (steps, _) = scheduler.enabled(&state);
        assert_eq!(steps.len(), 1);
        assert!(steps[0].result.is_err());
    }

    #[test]
    fn test_atomic_step_has_no_intermediate_state() {
        let program = compile_src(
            "shared { let X: int = 0; }\n\
             main { atomic { X = X + 1; X = X + 1; } }",
        );
        let scheduler = Scheduler::new(&program);
        let state = GlobalState::initial(&program);
        let (steps, _) = scheduler.enabled(&state);
        assert_eq!(steps.len(), 1);
        let (successor, _) = steps[0].result.as_ref().unwrap();
        // The only successor has both increments applied.
        assert_eq!(successor.shared.get("X"), Some(&Literal::Int(2)));
    }
}
