//! The explored state graph, shaped for external renderers.

use serde::{Deserialize, Serialize};

use crate::types::Pid;
use crate::vm::Snapshot;

/// One outgoing transition of a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMeta {
    /// Source lines the macro-step executed.
    pub lines: Vec<usize>,
    /// Stepped process.
    pub pid: Pid,
    /// Program name of the stepped process.
    pub name: String,
    /// Index of the successor node.
    pub to: usize,
}

/// Metadata of one graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Distance from the initial state along the discovery path.
    pub level: usize,
    /// Node this one was first discovered from; `None` for the root.
    pub predecessor: Option<usize>,
    /// Outgoing transitions.
    pub successors: Vec<EdgeMeta>,
}

/// The full visited graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateGraph {
    /// Nodes in discovery order; index 0 is the initial state.
    pub nodes: Vec<(Snapshot, NodeMeta)>,
}

impl StateGraph {
    /// Number of explored states.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty (it never is after a successful check).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes without outgoing transitions.
    pub fn terminal_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, (_, meta))| meta.successors.is_empty())
            .map(|(index, _)| index)
            .collect()
    }
}
