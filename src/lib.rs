//! # Althread
//!
//! A small concurrent programming language for teaching the semantics of
//! concurrent programs. Programs describe sequential processes that share
//! global variables, communicate through typed FIFO channels and may be
//! constrained by safety/liveness assertions.
//!
//! The crate exposes three operations over source text and a virtual file
//! system:
//!
//! - [`compile`]: parse, link imports, check and lower to stack bytecode;
//! - [`run`]: nondeterministic simulation producing one trace;
//! - [`check`]: exhaustive model checking of the reachable state space.
//!
//! The core performs no I/O: imports resolve against the caller-provided
//! virtual file system, and all outputs (diagnostics, traces, state graphs)
//! are serializable values.

#![warn(clippy::all)]

pub mod bytecode;
pub mod checker;
pub mod error;
pub mod frontend;
pub mod semantics;
pub mod simulator;
pub mod types;
pub mod vm;

/// Command-line interface and argument parsing.
pub mod cli;

pub use bytecode::CompiledProgram;
pub use checker::{CheckConfig, CheckResult, ModelChecker, Violation};
pub use error::{AlthreadError, AlthreadResult, CompileResult, ErrorKind, Pos, VmError};
pub use frontend::VirtualFs;
pub use simulator::{RunResult, SelectionPolicy, Simulator, SimulatorConfig};
pub use types::{Literal, Pid, Type};
pub use vm::{GlobalState, Scheduler, Snapshot};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compile `source` (at logical path `path`) against `vfs`.
///
/// Returns the immutable compiled program, or every diagnostic the failing
/// phase collected. Parsing and linking stop at the first error; the
/// semantic analyzer reports all of its findings at once.
pub fn compile(source: &str, path: &str, vfs: &VirtualFs) -> CompileResult<CompiledProgram> {
    let unit = frontend::link(path, source, vfs).map_err(|e| vec![e])?;
    let checked = semantics::analyze(unit)?;
    let compiled = bytecode::lower(&checked).map_err(|e| vec![e])?;
    debug_assert!(
        bytecode::verifier::verify(&compiled).is_ok(),
        "lowering broke the stack discipline"
    );
    Ok(compiled)
}

/// Compile and simulate one trace of the program.
///
/// Runtime conditions (deadlock, assertion violation, VM fault, exhausted
/// step budget) end the trace and are reported in
/// [`RunResult::diagnostic`] with all partial output intact.
pub fn run(
    source: &str,
    path: &str,
    vfs: &VirtualFs,
    config: SimulatorConfig,
) -> CompileResult<RunResult> {
    let program = compile(source, path, vfs)?;
    Ok(Simulator::new(&program, config).run())
}

/// Compile and exhaustively model-check the program.
///
/// Explores every reachable state up to `max_states`, verifying `always`
/// assertions on the fly and `eventually` assertions by a terminal-SCC scan
/// of the final graph.
pub fn check(
    source: &str,
    path: &str,
    vfs: &VirtualFs,
    max_states: Option<usize>,
) -> CompileResult<CheckResult> {
    let program = compile(source, path, vfs)?;
    Ok(ModelChecker::new(&program, CheckConfig { max_states }).check())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_compile_reports_diagnostics() {
        let errs = compile("main { let x = Missing; }", "main.alt", &VirtualFs::new())
            .unwrap_err();
        assert!(!errs.is_empty());
        assert_eq!(errs[0].kind, ErrorKind::Name);
    }

    #[test]
    fn test_run_hello() {
        let result = run(
            r#"main { print("hi"); }"#,
            "main.alt",
            &VirtualFs::new(),
            SimulatorConfig::default(),
        )
        .unwrap();
        assert_eq!(result.stdout, vec!["hi"]);
    }

    #[test]
    fn test_check_hello() {
        let result = check(
            r#"main { print("hi"); }"#,
            "main.alt",
            &VirtualFs::new(),
            None,
        )
        .unwrap();
        assert!(result.violations.is_empty());
        assert_eq!(result.graph.len(), 2);
    }
}
