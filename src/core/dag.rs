//! Dependency graph over the subtasks of one coordinator.
//!
//! Edges point from a dependency to its dependent (`from` must complete
//! before `to` becomes eligible). Decomposition only ever creates edges
//! from later-created to earlier-created siblings, so the graph is acyclic
//! by construction; [`DependencyGraph::add_dependency`] still refuses an
//! edge that would close a cycle so a bad record can never be persisted.
//!
//! Eligibility itself is read from the store by the scheduler. The graph
//! exists to validate a sibling set before it is written.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// The sibling dependency graph.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from a sibling set.
    ///
    /// # Errors
    /// Returns an error if a task depends on an id outside the set, or if
    /// the dependency edges contain a cycle.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task.id);
        }
        for task in tasks {
            for dep in &task.depends_on_task_ids {
                dag.add_dependency(dep, &task.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a task. Returns the existing index if the id is already present.
    pub fn add_task(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `to` depends on `from`.
    ///
    /// # Errors
    /// Returns an error if either task is unknown or the edge would create a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::DecompositionParse(format!("dependency {} is not a sibling", from)))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::DecompositionParse(format!("task {} is not in the graph", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::DecompositionParse(format!(
                "dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
