//! Simulator: drives the scheduler with a selection policy and records one
//! trace.
//!
//! The simulator is where nondeterminism gets resolved concretely: at every
//! decision point it picks one enabled macro-step — uniformly at random from
//! a fixed seed by default, or round-robin — applies it, and buffers the
//! observable side effects (stdout, message-flow events, per-step VM
//! snapshots). `always` assertions are evaluated after every transition.
//!
//! Deadlocks, assertion violations, runtime faults and exhausted step
//! budgets end the trace with a diagnostic but keep everything recorded so
//! far intact.

use std::collections::HashMap;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bytecode::{AssertionKind, CompiledProgram};
use crate::error::{AlthreadError, ErrorKind};
use crate::types::Pid;
use crate::vm::{
    GlobalState, ProcessStatus, Scheduler, Snapshot,
};

/// How the simulator picks among enabled steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Uniform random with a fixed seed.
    Random {
        /// RNG seed; equal seeds give equal traces.
        seed: u64,
    },
    /// Cycle through processes in ascending pid order.
    RoundRobin,
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Step selection policy.
    pub policy: SelectionPolicy,
    /// Transition budget; exceeding it surfaces a `Budget` diagnostic.
    pub max_steps: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            policy: SelectionPolicy::Random { seed: 0 },
            max_steps: 10_000,
        }
    }
}

/// Send (`s`) or receive (`r`) event marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A message was enqueued.
    #[serde(rename = "s")]
    Send,
    /// A message was dequeued.
    #[serde(rename = "r")]
    Receive,
}

/// One entry of the message-flow log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Send or receive.
    pub evt_type: EventType,
    /// Sender-side pid of the channel.
    pub sender: Pid,
    /// Receiver-side pid of the channel.
    pub receiver: Option<Pid>,
    /// Rendered message.
    pub message: String,
    /// Per-channel monotonic message number.
    pub number: u64,
    /// Program name of the process that performed the step.
    pub actor_prog_name: String,
    /// State right after the step.
    pub vm_state: Snapshot,
}

/// Output of one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// `print` output in order.
    pub stdout: Vec<String>,
    /// Human-readable step log.
    pub debug: String,
    /// Message-flow events.
    pub message_flow_graph: Vec<FlowEvent>,
    /// Snapshot after every transition, the initial state first.
    pub vm_states: Vec<Snapshot>,
    /// Why the trace ended early, if it did: deadlock, assertion violation,
    /// runtime fault or an exhausted budget. Partial output stays intact.
    pub diagnostic: Option<AlthreadError>,
}

/// Drives one nondeterministic execution.
pub struct Simulator<'a> {
    program: &'a CompiledProgram,
    config: SimulatorConfig,
}

impl<'a> Simulator<'a> {
    /// Simulator over `program` with `config`.
    pub fn new(program: &'a CompiledProgram, config: SimulatorConfig) -> Self {
        Simulator { program, config }
    }

    /// Run to termination, deadlock, violation or budget exhaustion.
    pub fn run(&self) -> RunResult {
        let scheduler = Scheduler::new(self.program);
        let mut state = GlobalState::initial(self.program);
        let mut rng = match self.config.policy {
            SelectionPolicy::Random { seed } => Some(StdRng::seed_from_u64(seed)),
            SelectionPolicy::RoundRobin => None,
        };
        let mut last_pid: Option<Pid> = None;
        // Pid -> guard epoch at which its probe blocked; skip re-probing
        // until the epoch moves.
        let mut blocked_at: HashMap<Pid, u64> = HashMap::new();

        let mut result = RunResult {
            stdout: Vec::new(),
            debug: String::new(),
            message_flow_graph: Vec::new(),
            vm_states: vec![Snapshot::of(&state)],
            diagnostic: None,
        };
        let mut log_lines: Vec<String> = Vec::new();

        for step in 0..self.config.max_steps {
            let epoch = state.epoch;
            let (steps, blocked) =
                scheduler.enabled_where(&state, |pid| blocked_at.get(&pid) != Some(&epoch));
            for pid in &blocked {
                blocked_at.insert(*pid, epoch);
                state.set_status(*pid, ProcessStatus::Waiting);
            }

            if steps.is_empty() {
                if !state.all_finished() {
                    result.diagnostic = Some(AlthreadError::global(
                        ErrorKind::Deadlock,
                        "no process can make progress",
                    ));
                    log_lines.push("deadlock".to_string());
                    // One final snapshot showing the waiting statuses.
                    result.vm_states.push(Snapshot::of(&state));
                }
                break;
            }

            let index = match &mut rng {
                Some(rng) => rng.gen_range(0..steps.len()),
                None => next_round_robin(&steps, last_pid),
            };
            let chosen = &steps[index];
            last_pid = Some(chosen.pid);

            let (successor, effects) = match &chosen.result {
                Ok(ok) => ok,
                Err(fault) => {
                    result.diagnostic = Some(fault.clone());
                    log_lines.push(format!("step {}: {} faulted: {}", step, chosen.pid, fault));
                    break;
                }
            };

            state = successor.clone();
            result.stdout.extend(effects.prints.iter().cloned());
            log_lines.push(format!(
                "step {}: {} {} lines {:?}",
                step, chosen.pid, chosen.program, effects.lines
            ));

            let snapshot = Snapshot::of(&state);
            for event in &effects.events {
                result.message_flow_graph.push(FlowEvent {
                    evt_type: if event.sent {
                        EventType::Send
                    } else {
                        EventType::Receive
                    },
                    sender: event.channel.pid,
                    receiver: Some(event.receiver.0),
                    message: event.message.to_string(),
                    number: event.number,
                    actor_prog_name: chosen.program.clone(),
                    vm_state: snapshot.clone(),
                });
            }
            result.vm_states.push(snapshot);

            if let Some(violation) = self.check_always(&state, &effects.writes) {
                result.diagnostic = Some(violation);
                break;
            }

            if state.all_finished() {
                break;
            }

            if step + 1 == self.config.max_steps {
                result.diagnostic = Some(AlthreadError::global(
                    ErrorKind::Budget,
                    format!("step budget of {} exceeded", self.config.max_steps),
                ));
            }
        }

        debug!("simulation ended after {} state(s)", result.vm_states.len());
        result.debug = log_lines.join("\n");
        result
    }

    /// Evaluate the `always` assertions whose dependencies the last step
    /// wrote.
    fn check_always(&self, state: &GlobalState, writes: &[String]) -> Option<AlthreadError> {
        for assertion in &self.program.assertions {
            if assertion.kind != AssertionKind::Always {
                continue;
            }
            if !assertion
                .depends_on()
                .iter()
                .any(|dep| writes.iter().any(|w| w == dep))
            {
                continue;
            }
            let lookup = |name: &str| state.shared.get(name).cloned();
            match assertion.evaluate(&lookup) {
                Ok(true) => {}
                Ok(false) => {
                    return Some(AlthreadError::new(
                        ErrorKind::Assertion,
                        assertion.pos.clone(),
                        format!("always condition '{}' violated", assertion.text),
                    ));
                }
                Err(fault) => {
                    return Some(AlthreadError::new(
                        ErrorKind::Assertion,
                        assertion.pos.clone(),
                        format!("always condition '{}' failed to evaluate: {}", assertion.text, fault),
                    ));
                }
            }
        }
        None
    }
}

/// Smallest enabled pid strictly greater than `last`, wrapping around.
fn next_round_robin(steps: &[crate::vm::EnabledStep], last: Option<Pid>) -> usize {
    let Some(last) = last else {
        return 0;
    };
    steps
        .iter()
        .position(|s| s.pid > last)
        .unwrap_or(0)
}
