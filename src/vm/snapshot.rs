//! Serializable views of a global state for external consumers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Literal, Pid};
use crate::vm::process::ProcessStatus;
use crate::vm::state::GlobalState;

/// Per-process view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Process id.
    pub pid: Pid,
    /// Program the process instantiates.
    pub name: String,
    /// Scheduling status.
    pub status: ProcessStatus,
    /// Instructions executed so far.
    pub clock: u64,
    /// Program counter of the innermost frame.
    pub instruction_pointer: usize,
    /// Operand stack, locals first.
    pub memory: Vec<Literal>,
}

/// Full view of one global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Channel queues keyed by `sender_pid.port`.
    pub channels: BTreeMap<String, Vec<Literal>>,
    /// Shared variables.
    pub globals: BTreeMap<String, Literal>,
    /// Per-process views in pid order.
    pub locals: Vec<ProcessSnapshot>,
}

impl Snapshot {
    /// Capture `state`.
    pub fn of(state: &GlobalState) -> Self {
        let channels = state
            .channels
            .iter()
            .map(|(id, channel)| {
                (
                    id.to_string(),
                    channel.queue.iter().cloned().collect::<Vec<Literal>>(),
                )
            })
            .collect();
        let globals = state
            .shared
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let locals = state
            .processes
            .iter()
            .map(|process| ProcessSnapshot {
                pid: process.pid,
                name: process.program.clone(),
                status: process.status,
                clock: process.clock,
                instruction_pointer: process.pc(),
                memory: process.stack.clone(),
            })
            .collect();
        Snapshot {
            channels,
            globals,
            locals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompiledProgram;

    #[test]
    fn test_snapshot_shape() {
        let mut program = CompiledProgram::default();
        program.shared_init.push(("C".into(), Literal::Int(4)));
        let state = GlobalState::initial(&program);
        let snapshot = Snapshot::of(&state);
        assert_eq!(snapshot.globals.get("C"), Some(&Literal::Int(4)));
        assert_eq!(snapshot.locals.len(), 1);
        assert_eq!(snapshot.locals[0].name, "main");
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"globals\""));
    }
}
