//! Canonical state encoding and hashing.
//!
//! The visited set of the model checker is keyed by a 128-bit digest of a
//! canonical byte encoding of the global state. Canonical means: shared
//! variables in sorted name order, channels in sorted `(sender_pid, port)`
//! order, processes in ascending pid order — the orders the persistent maps
//! already iterate in — and none of the purely observational fields (clocks,
//! statuses, guard epochs, per-channel send counters), so that runs of
//! different length reaching the same configuration collapse to one node.

use ring::digest;
use serde::Serialize;

use crate::types::{Literal, Pid};
use crate::vm::channel::ChannelId;
use crate::vm::process::Frame;
use crate::vm::state::GlobalState;

#[derive(Serialize)]
struct CanonicalChannel<'a> {
    receiver: (&'a Pid, &'a str),
    queue: Vec<&'a Literal>,
}

#[derive(Serialize)]
struct CanonicalProcess<'a> {
    program: &'a str,
    frames: &'a [Frame],
    stack: &'a [Literal],
}

#[derive(Serialize)]
struct CanonicalState<'a> {
    shared: Vec<(&'a str, &'a Literal)>,
    channels: Vec<(&'a ChannelId, CanonicalChannel<'a>)>,
    processes: Vec<CanonicalProcess<'a>>,
    next_pid: u32,
}

/// The canonical byte encoding of `state`.
pub fn canonical_bytes(state: &GlobalState) -> Vec<u8> {
    let canonical = CanonicalState {
        shared: state
            .shared
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect(),
        channels: state
            .channels
            .iter()
            .map(|(id, channel)| {
                (
                    id,
                    CanonicalChannel {
                        receiver: (&channel.receiver.0, channel.receiver.1.as_str()),
                        queue: channel.queue.iter().collect(),
                    },
                )
            })
            .collect(),
        processes: state
            .processes
            .iter()
            .map(|process| CanonicalProcess {
                program: &process.program,
                frames: &process.frames,
                stack: &process.stack,
            })
            .collect(),
        next_pid: state.next_pid,
    };
    bincode::serialize(&canonical).expect("canonical state always serializes")
}

/// 128-bit digest of the canonical encoding. Collisions are treated as state
/// equality, which is sound for DFS because every observable field
/// participates in the digest.
pub fn canonical_hash(state: &GlobalState) -> u128 {
    let bytes = canonical_bytes(state);
    let digest = digest::digest(&digest::SHA256, &bytes);
    let mut first = [0u8; 16];
    first.copy_from_slice(&digest.as_ref()[..16]);
    u128::from_le_bytes(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompiledProgram;
    use crate::vm::process::ProcessStatus;

    fn base_state() -> GlobalState {
        let mut program = CompiledProgram::default();
        program.shared_init.push(("A".into(), Literal::Int(1)));
        program.shared_init.push(("B".into(), Literal::Bool(false)));
        GlobalState::initial(&program)
    }

    #[test]
    fn test_hash_is_stable() {
        let state = base_state();
        assert_eq!(canonical_hash(&state), canonical_hash(&state.clone()));
    }

    #[test]
    fn test_insertion_order_is_irrelevant() {
        let mut a = base_state();
        let mut b = base_state();
        a.shared.insert("A".into(), Literal::Int(9));
        a.shared.insert("B".into(), Literal::Bool(true));
        b.shared.insert("B".into(), Literal::Bool(true));
        b.shared.insert("A".into(), Literal::Int(9));
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_observational_fields_do_not_hash() {
        let mut a = base_state();
        let b = a.clone();
        a.epoch += 17;
        a.process_mut(Pid::MAIN).clock += 5;
        a.process_mut(Pid::MAIN).status = ProcessStatus::Waiting;
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_shared_value_changes_hash() {
        let mut a = base_state();
        let b = a.clone();
        a.shared.insert("A".into(), Literal::Int(2));
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_pc_changes_hash() {
        let mut a = base_state();
        let b = a.clone();
        a.process_mut(Pid::MAIN).frame_mut().pc = 3;
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
