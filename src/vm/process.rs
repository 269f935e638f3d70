//! Per-process runtime state.
//!
//! A process is a program counter, an operand stack and a call-frame list;
//! "suspension" at `wait until` or `await receive` is nothing more than the
//! scheduler declining to step the process, so no host-language coroutines
//! are involved.

use serde::{Deserialize, Serialize};

use crate::types::{Literal, Pid};

/// Which instruction stream a frame executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeRef {
    /// The body of the named program.
    Program(String),
    /// The function with the given id.
    Function(usize),
}

/// One activation record. Locals live on the shared operand stack starting
/// at `fp`; `Return` truncates back to `fp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Instruction stream.
    pub code: CodeRef,
    /// Next instruction to execute.
    pub pc: usize,
    /// Stack index where this frame's locals begin.
    pub fp: usize,
}

/// Scheduling status, derived from execution and kept for snapshots; it does
/// not participate in canonical state hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Has an enabled step or has not been probed yet.
    Running,
    /// Last probe found its guard unsatisfied.
    Waiting,
    /// Reached `Halt`; the slot remains for trace inspection.
    Finished,
}

/// An Althread process.
#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    /// Process id; also the index of the slot in the process table.
    pub pid: Pid,
    /// Name of the program this process instantiates.
    pub program: String,
    /// Call frames, innermost last. Empty once finished.
    pub frames: Vec<Frame>,
    /// Operand stack; locals at the bottom of each frame.
    pub stack: Vec<Literal>,
    /// Scheduling status.
    pub status: ProcessStatus,
    /// Instructions executed so far. Observational only; excluded from
    /// canonical hashing so runs of different length can merge.
    pub clock: u64,
}

impl Process {
    /// Install a new process running `program` with `args` as its first
    /// locals.
    pub fn new(pid: Pid, program: impl Into<String>, args: Vec<Literal>) -> Self {
        let program = program.into();
        Process {
            pid,
            frames: vec![Frame {
                code: CodeRef::Program(program.clone()),
                pc: 0,
                fp: 0,
            }],
            stack: args,
            program,
            status: ProcessStatus::Running,
            clock: 0,
        }
    }

    /// Whether the process has reached `Halt`.
    pub fn finished(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost frame. Panics on a finished process; callers check
    /// `finished` first.
    pub fn frame(&self) -> &Frame {
        self.frames.last().expect("process still has a frame")
    }

    /// Mutable innermost frame.
    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("process still has a frame")
    }

    /// Program counter of the innermost frame, or 0 when finished.
    pub fn pc(&self) -> usize {
        self.frames.last().map(|f| f.pc).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_process_layout() {
        let p = Process::new(Pid(3), "Worker", vec![Literal::Int(7)]);
        assert_eq!(p.pid, Pid(3));
        assert!(!p.finished());
        assert_eq!(p.frame().pc, 0);
        assert_eq!(p.frame().fp, 0);
        assert_eq!(p.stack, vec![Literal::Int(7)]);
        assert_eq!(p.status, ProcessStatus::Running);
    }

    #[test]
    fn test_finished_after_frames_drained() {
        let mut p = Process::new(Pid(0), "main", vec![]);
        p.frames.clear();
        assert!(p.finished());
        assert_eq!(p.pc(), 0);
    }
}
