//! The global state: shared variables, channels and the process table.
//!
//! Owned by the active operation (one `run` or one `check` call) and mutated
//! only by applying macro-steps. All containers are persistent so the model
//! checker can snapshot a state in O(log n).

use im::{OrdMap, Vector};

use crate::bytecode::CompiledProgram;
use crate::types::{Literal, Pid};
use crate::vm::channel::{Channel, ChannelId};
use crate::vm::process::{Process, ProcessStatus};

/// One global state of the system.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalState {
    /// Shared variables. Sorted iteration order doubles as the canonical
    /// order for hashing.
    pub shared: OrdMap<String, Literal>,
    /// Channels keyed by sender endpoint, sorted for canonicalization.
    pub channels: OrdMap<ChannelId, Channel>,
    /// Process table; the index is the pid.
    pub processes: Vector<Process>,
    /// Next pid handed out by `run`; pids are dense and deterministic.
    pub next_pid: u32,
    /// Bumped by every transition that can change a blocked process's guard
    /// (shared writes, queue operations, process creation, channel wiring).
    /// Bookkeeping only; excluded from canonical hashing.
    pub epoch: u64,
}

impl GlobalState {
    /// Initial state: shared variables installed, a single process running
    /// `main` as pid 0.
    pub fn initial(program: &CompiledProgram) -> Self {
        let mut shared = OrdMap::new();
        for (name, value) in &program.shared_init {
            shared.insert(name.clone(), value.clone());
        }
        let mut processes = Vector::new();
        processes.push_back(Process::new(Pid::MAIN, "main", Vec::new()));
        GlobalState {
            shared,
            channels: OrdMap::new(),
            processes,
            next_pid: 1,
            epoch: 0,
        }
    }

    /// The process with the given pid.
    pub fn process(&self, pid: Pid) -> &Process {
        self.processes
            .get(pid.raw() as usize)
            .expect("pids index the process table")
    }

    /// Mutable process access.
    pub fn process_mut(&mut self, pid: Pid) -> &mut Process {
        self.processes
            .get_mut(pid.raw() as usize)
            .expect("pids index the process table")
    }

    /// Whether every process has finished.
    pub fn all_finished(&self) -> bool {
        self.processes.iter().all(|p| p.finished())
    }

    /// The channel delivering to `(pid, port)`, if one was declared.
    pub fn channel_to(&self, pid: Pid, port: &str) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, ch)| ch.receiver.0 == pid && ch.receiver.1 == port)
            .map(|(id, _)| id.clone())
    }

    /// Record a guard-relevant change.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Set a live process's status. Used to reflect blocked probes into
    /// snapshots; finished processes keep their status.
    pub fn set_status(&mut self, pid: Pid, status: ProcessStatus) {
        let process = self.process_mut(pid);
        if !process.finished() {
            process.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn empty_program() -> CompiledProgram {
        let mut program = CompiledProgram::default();
        program.shared_init.push(("C".into(), Literal::Int(0)));
        program
    }

    #[test]
    fn test_initial_state() {
        let state = GlobalState::initial(&empty_program());
        assert_eq!(state.shared.get("C"), Some(&Literal::Int(0)));
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.process(Pid::MAIN).program, "main");
        assert_eq!(state.next_pid, 1);
    }

    #[test]
    fn test_channel_lookup_by_receiver() {
        let mut state = GlobalState::initial(&empty_program());
        let id = ChannelId {
            pid: Pid(1),
            port: "out".into(),
        };
        state
            .channels
            .insert(id.clone(), Channel::new(vec![Type::Int], (Pid(2), "inp".into())));
        assert_eq!(state.channel_to(Pid(2), "inp"), Some(id));
        assert_eq!(state.channel_to(Pid(2), "other"), None);
    }

    #[test]
    fn test_cheap_clone_is_independent() {
        let mut state = GlobalState::initial(&empty_program());
        let snapshot = state.clone();
        state.shared.insert("C".into(), Literal::Int(9));
        assert_eq!(snapshot.shared.get("C"), Some(&Literal::Int(0)));
    }
}
