//! Dependency graph for one decomposition batch.
//!
//! A batch is the list of subtask specs returned by a single decomposition
//! call. Before the coordinator turns a batch into tasks it is validated
//! here: local ids must be unique and non-empty, every dependency must name
//! a sibling in the same batch, and the dependencies must be acyclic.

use crate::decompose::SubtaskSpec;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Validated dependency graph over a batch's local ids.
///
/// An edge `a -> b` means `b` depends on `a`.
pub struct BatchGraph {
    graph: DiGraph<String, ()>,
}

impl BatchGraph {
    /// Build and validate the graph for `specs`.
    ///
    /// # Errors
    /// Returns `Error::InvalidDecomposition` if a local id is empty or
    /// repeated, a dependency names an id outside the batch, or the
    /// dependencies form a cycle.
    pub fn from_specs(specs: &[SubtaskSpec]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(specs.len());

        for spec in specs {
            if spec.local_id.trim().is_empty() {
                return Err(Error::InvalidDecomposition(format!(
                    "subtask of type '{}' has an empty local id",
                    spec.task_type
                )));
            }
            if index.contains_key(&spec.local_id) {
                return Err(Error::InvalidDecomposition(format!(
                    "duplicate local id '{}'",
                    spec.local_id
                )));
            }
            let node = graph.add_node(spec.local_id.clone());
            index.insert(spec.local_id.clone(), node);
        }

        for spec in specs {
            let to = index[&spec.local_id];
            for dep in &spec.depends_on {
                let from = index.get(dep).ok_or_else(|| {
                    Error::InvalidDecomposition(format!(
                        "'{}' depends on '{}', which is not in the batch",
                        spec.local_id, dep
                    ))
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            let at = toposort(&graph, None)
                .err()
                .and_then(|cycle| graph.node_weight(cycle.node_id()).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::InvalidDecomposition(format!(
                "dependency cycle detected at '{}'",
                at
            )));
        }

        Ok(Self { graph })
    }

    /// Number of subtasks in the batch.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Group local ids into stages: every id appears after all of its
    /// dependencies, and ids within a stage keep batch order.
    pub fn stages(&self) -> Vec<Vec<&str>> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut stages = Vec::new();
        while !remaining.is_empty() {
            let mut ready: Vec<NodeIndex> = remaining
                .iter()
                .filter(|(_, &count)| count == 0)
                .map(|(&n, _)| n)
                .collect();
            ready.sort();

            for n in &ready {
                remaining.remove(n);
                for next in self.graph.neighbors_directed(*n, Direction::Outgoing) {
                    if let Some(count) = remaining.get_mut(&next) {
                        *count -= 1;
                    }
                }
            }
            stages.push(ready.into_iter().map(|n| self.graph[n].as_str()).collect());
        }
        stages
    }
}

impl std::fmt::Debug for BatchGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchGraph")
            .field("subtasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
