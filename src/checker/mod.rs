//! Model checker: exhaustive DFS over the reachable state space.
//!
//! States are deduplicated by their canonical 128-bit hash, `always`
//! assertions are evaluated on every newly discovered successor whose
//! incoming transition wrote one of their dependencies, and runtime faults
//! at reachable states are counter-examples like any violation. `eventually`
//! assertions are verified after exploration by scanning the terminal
//! strongly-connected components of the graph.

pub mod canonical;
pub mod graph;

use std::collections::HashMap;

use log::debug;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::bytecode::{Assertion, AssertionKind, CompiledProgram};
use crate::error::{AlthreadError, ErrorKind};
use crate::types::Pid;
use crate::vm::{GlobalState, ProcessStatus, Scheduler, Snapshot};

pub use canonical::{canonical_bytes, canonical_hash};
pub use graph::{EdgeMeta, NodeMeta, StateGraph};

/// Model-checking parameters.
#[derive(Debug, Clone, Default)]
pub struct CheckConfig {
    /// Cap on explored states; exceeding it surfaces a `Budget` diagnostic
    /// together with the partial graph.
    pub max_states: Option<usize>,
}

/// One transition of a counter-example path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    /// State the step left.
    pub from: Snapshot,
    /// State the step reached.
    pub to: Snapshot,
    /// Stepped process.
    pub pid: Pid,
    /// Program name of the stepped process.
    pub name: String,
    /// Source lines the step executed.
    pub lines: Vec<usize>,
}

/// A property violation with its witness path from the initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// What went wrong: assertion violation, runtime fault, or an
    /// `eventually` property avoidable forever.
    pub error: AlthreadError,
    /// Macro-steps from the initial state to the offending state; empty when
    /// the initial state itself offends.
    pub path: Vec<PathStep>,
}

/// Output of `check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// All violations found, in discovery order.
    pub violations: Vec<Violation>,
    /// The explored graph (partial when the budget ran out).
    pub graph: StateGraph,
    /// `Budget` diagnostic when `max_states` was hit.
    pub diagnostic: Option<AlthreadError>,
}

struct NodeData {
    state: GlobalState,
    level: usize,
    predecessor: Option<usize>,
    pred_edge: Option<(Pid, String, Vec<usize>)>,
    successors: Vec<EdgeMeta>,
    /// Per `eventually` assertion: whether this state satisfies it.
    eventually: Vec<bool>,
}

/// Exhaustive explorer for one compiled program.
pub struct ModelChecker<'a> {
    program: &'a CompiledProgram,
    config: CheckConfig,
}

impl<'a> ModelChecker<'a> {
    /// Checker over `program` with `config`.
    pub fn new(program: &'a CompiledProgram, config: CheckConfig) -> Self {
        ModelChecker { program, config }
    }

    /// Explore every reachable state and verify all assertions.
    pub fn check(&self) -> CheckResult {
        let scheduler = Scheduler::new(self.program);
        let eventually: Vec<&Assertion> = self
            .program
            .assertions
            .iter()
            .filter(|a| a.kind == AssertionKind::Eventually)
            .collect();

        let initial = GlobalState::initial(self.program);
        let mut nodes = vec![NodeData {
            eventually: self.eventually_flags(&eventually, &initial),
            state: initial,
            level: 0,
            predecessor: None,
            pred_edge: None,
            successors: Vec::new(),
        }];
        let mut visited: HashMap<u128, usize> = HashMap::new();
        visited.insert(canonical_hash(&nodes[0].state), 0);

        let mut violations: Vec<Violation> = Vec::new();
        let mut diagnostic = None;
        let mut to_expand = vec![0usize];

        'explore: while let Some(current) = to_expand.pop() {
            let (steps, blocked) = scheduler.enabled(&nodes[current].state);
            for pid in blocked {
                nodes[current].state.set_status(pid, ProcessStatus::Waiting);
            }

            for step in steps {
                match step.result {
                    Err(fault) => {
                        violations.push(Violation {
                            error: fault,
                            path: self.path_to(&nodes, current),
                        });
                    }
                    Ok((successor, effects)) => {
                        let hash = canonical_hash(&successor);
                        let (to, is_new) = match visited.get(&hash) {
                            Some(&existing) => (existing, false),
                            None => {
                                let id = nodes.len();
                                visited.insert(hash, id);
                                nodes.push(NodeData {
                                    eventually: self
                                        .eventually_flags(&eventually, &successor),
                                    state: successor,
                                    level: nodes[current].level + 1,
                                    predecessor: Some(current),
                                    pred_edge: Some((
                                        step.pid,
                                        step.program.clone(),
                                        effects.lines.clone(),
                                    )),
                                    successors: Vec::new(),
                                });
                                (id, true)
                            }
                        };
                        nodes[current].successors.push(EdgeMeta {
                            lines: effects.lines.clone(),
                            pid: step.pid,
                            name: step.program.clone(),
                            to,
                        });
                        if !is_new {
                            continue;
                        }
                        if let Some(error) =
                            self.check_always(&nodes[to].state, &effects.writes)
                        {
                            violations.push(Violation {
                                error,
                                path: self.path_to(&nodes, to),
                            });
                            // A violating state stays in the graph but is
                            // not explored further.
                            continue;
                        }
                        if let Some(max) = self.config.max_states {
                            if nodes.len() >= max {
                                diagnostic = Some(AlthreadError::global(
                                    ErrorKind::Budget,
                                    format!("state budget of {} exceeded", max),
                                ));
                                break 'explore;
                            }
                        }
                        to_expand.push(to);
                    }
                }
            }
        }

        // Terminal-SCC scan for `eventually`; skipped on a truncated graph,
        // where terminal components are exploration artifacts.
        if diagnostic.is_none() && !eventually.is_empty() {
            self.check_eventually(&eventually, &nodes, &mut violations);
        }

        debug!(
            "explored {} state(s), {} violation(s)",
            nodes.len(),
            violations.len()
        );

        let graph = StateGraph {
            nodes: nodes
                .into_iter()
                .map(|node| {
                    (
                        Snapshot::of(&node.state),
                        NodeMeta {
                            level: node.level,
                            predecessor: node.predecessor,
                            successors: node.successors,
                        },
                    )
                })
                .collect(),
        };

        CheckResult {
            violations,
            graph,
            diagnostic,
        }
    }

    fn eventually_flags(&self, eventually: &[&Assertion], state: &GlobalState) -> Vec<bool> {
        eventually
            .iter()
            .map(|assertion| {
                let lookup = |name: &str| state.shared.get(name).cloned();
                assertion.evaluate(&lookup).unwrap_or(false)
            })
            .collect()
    }

    /// Evaluate the `always` assertions whose dependencies the incoming step
    /// wrote. The initial state has no incoming step and is never checked,
    /// matching the dependency-triggered semantics of the conditions.
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
                        format!(
                            "always condition '{}' failed to evaluate: {}",
                            assertion.text, fault
                        ),
                    ));
                }
            }
        }
        None
    }

    /// A violation of `eventually P` is a terminal strongly-connected
    /// component that is a non-trivial cycle with no state satisfying `P`:
    /// a fair run can circle there forever without ever reaching `P`.
    fn check_eventually(
        &self,
        eventually: &[&Assertion],
        nodes: &[NodeData],
        violations: &mut Vec<Violation>,
    ) {
        let mut graph = DiGraph::<(), ()>::with_capacity(nodes.len(), 0);
        let indices: Vec<NodeIndex> = (0..nodes.len()).map(|_| graph.add_node(())).collect();
        for (from, node) in nodes.iter().enumerate() {
            for edge in &node.successors {
                graph.add_edge(indices[from], indices[edge.to], ());
            }
        }

        for component in tarjan_scc(&graph) {
            let members: Vec<usize> = component.iter().map(|ix| ix.index()).collect();
            let non_trivial = members.len() > 1
                || nodes[members[0]]
                    .successors
                    .iter()
                    .any(|edge| edge.to == members[0]);
            if !non_trivial {
                continue;
            }
            let terminal = members.iter().all(|&m| {
                nodes[m]
                    .successors
                    .iter()
                    .all(|edge| members.contains(&edge.to))
            });
            if !terminal {
                continue;
            }
            for (index, assertion) in eventually.iter().enumerate() {
                if members.iter().any(|&m| nodes[m].eventually[index]) {
                    continue;
                }
                let entry = *members.iter().min().expect("components are non-empty");
                violations.push(Violation {
                    error: AlthreadError::new(
                        ErrorKind::Assertion,
                        assertion.pos.clone(),
                        format!(
                            "eventually condition '{}' can be avoided forever in a terminal cycle",
                            assertion.text
                        ),
                    ),
                    path: self.path_to(nodes, entry),
                });
            }
        }
    }

    fn path_to(&self, nodes: &[NodeData], target: usize) -> Vec<PathStep> {
        let mut steps = Vec::new();
        let mut current = target;
        while let Some(previous) = nodes[current].predecessor {
            let (pid, name, lines) = nodes[current]
                .pred_edge
                .clone()
                .expect("non-root nodes carry their discovery edge");
            steps.push(PathStep {
                from: Snapshot::of(&nodes[previous].state),
                to: Snapshot::of(&nodes[current].state),
                pid,
                name,
                lines,
            });
            current = previous;
        }
        steps.reverse();
        steps
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

    fn check_src(src: &str) -> CheckResult {
        let program = compile_src(src);
        ModelChecker::new(&program, CheckConfig::default()).check()
    }

    #[test]
    fn test_hello_world_two_states() {
        let result = check_src(r#"main { print("hi"); }"#);
        assert!(result.violations.is_empty());
        assert_eq!(result.graph.len(), 2);
        assert_eq!(result.graph.terminal_nodes(), vec![1]);
    }

    #[test]
    fn test_shared_counter_holds() {
        let result = check_src(
            "shared { let C: int = 0; }\n\
             program Inc() { C = C + 1; }\n\
             main { run Inc(); run Inc(); wait until C == 2; }\n\
             always { C <= 2; }",
        );
        assert!(result.violations.is_empty(), "{:?}", result.violations);
        assert!(result
            .graph
            .nodes
            .iter()
            .any(|(snapshot, _)| snapshot.globals.get("C") == Some(&Literal::Int(2))));
    }

    #[test]
    fn test_lost_update_found() {
        let result = check_src(
            "shared { let X: int = 0; }\n\
             program P() { let t = X; X = t + 1; }\n\
             main { run P(); run P(); wait until true; }\n\
             always { X == 2; }",
        );
        assert!(!result.violations.is_empty());
        // Some witness ends with a state where an update was lost.
        let witness = &result.violations[0];
        let last = witness.path.last().expect("non-empty path");
        assert_eq!(last.to.globals.get("X"), Some(&Literal::Int(1)));
    }

    #[test]
    fn test_check_is_deterministic() {
        let src = "shared { let X: int = 0; }\n\
                   program P() { let t = X; X = t + 1; }\n\
                   main { run P(); run P(); wait until true; }\n\
                   always { X == 2; }";
        let a = check_src(src);
        let b = check_src(src);
        assert_eq!(a.graph.len(), b.graph.len());
        assert_eq!(a.violations.len(), b.violations.len());
        assert_eq!(a.violations[0].path, b.violations[0].path);
        let a_nodes: Vec<&Snapshot> = a.graph.nodes.iter().map(|(s, _)| s).collect();
        let b_nodes: Vec<&Snapshot> = b.graph.nodes.iter().map(|(s, _)| s).collect();
        assert_eq!(a_nodes, b_nodes);
    }

    #[test]
    fn test_runtime_fault_is_counter_example() {
        let result = check_src(
            "shared { let X: int = 0; }\n\
             program P() { X = 1 / (1 - X); }\n\
             main { run P(); run P(); }",
        );
        // One P sets X to 1, the other then divides by zero.
        assert!(result
            .violations
            .iter()
            .any(|v| v.error.kind == ErrorKind::Vm));
    }

    #[test]
    fn test_deadlock_is_terminal_node() {
        let result = check_src(
            "shared { let F: bool = false; }\n\
             program P() { wait until F; }\n\
             main { run P(); wait until F; }",
        );
        assert!(result.violations.is_empty());
        let terminals = result.graph.terminal_nodes();
        assert_eq!(terminals.len(), 1);
        let (snapshot, _) = &result.graph.nodes[terminals[0]];
        assert!(snapshot
            .locals
            .iter()
            .all(|p| p.status == crate::vm::ProcessStatus::Waiting));
    }

    #[test]
    fn test_state_budget() {
        let program = compile_src(
            "shared { let X: int = 0; }\n\
             main { loop { X = X + 1; } }",
        );
        let config = CheckConfig {
            max_states: Some(100),
        };
        let result = ModelChecker::new(&program, config).check();
        let diagnostic = result.diagnostic.expect("budget expected");
        assert_eq!(diagnostic.kind, ErrorKind::Budget);
        assert!(result.graph.len() <= 101);
    }

    #[test]
    fn test_eventually_violation_on_terminal_cycle() {
        let result = check_src(
            "shared { let X: int = 0; }\n\
             main { loop { X = 1 - X; } }\n\
             eventually { X == 5; }",
        );
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0]
            .error
            .message
            .contains("can be avoided forever"));
    }

    #[test]
    fn test_eventually_holds_when_cycle_satisfies() {
        let result = check_src(
            "shared { let X: int = 0; }\n\
             main { loop { X = 1 - X; } }\n\
             eventually { X == 1; }",
        );
        assert!(result.violations.is_empty(), "{:?}", result.violations);
    }

    #[test]
    fn test_atomic_has_no_intermediate_node() {
        let result = check_src(
            "shared { let X: int = 0; }\n\
             main { atomic { X = 1; X = 2; } }",
        );
        assert!(result.violations.is_empty());
        // No explored state exposes X == 1.
        assert!(result
            .graph
            .nodes
            .iter()
            .all(|(snapshot, _)| snapshot.globals.get("X") != Some(&Literal::Int(1))));
    }
}
