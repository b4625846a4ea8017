//! Dependency graph over validated task specs.
//!
//! The graph is built once by the manifest validator and is read-only
//! afterwards. Nodes are `TaskSpec`s in declaration order; edges point from
//! a dependency to its dependent.

use crate::core::task::TaskSpec;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The validated task dependency graph.
pub struct DependencyGraph {
    /// Project the tasks belong to.
    project: String,
    /// The underlying directed graph (dependency -> dependent).
    graph: DiGraph<TaskSpec, ()>,
    /// Index mapping from task name to NodeIndex for fast lookups.
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from tasks with unique names and known dependencies.
    ///
    /// Callers must have checked name uniqueness and dependency existence;
    /// dependencies on unknown names are ignored here. Cycles are NOT
    /// rejected, use `find_cycle` for that.
    pub(crate) fn build(project: &str, tasks: &[TaskSpec]) -> Self {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let node = graph.add_node(task.clone());
            index.insert(task.name.clone(), node);
        }

        for task in tasks {
            let to = index[&task.name];
            for dep in &task.dependencies {
                if let Some(&from) = index.get(dep) {
                    // update_edge collapses repeated dependencies into one edge
                    graph.update_edge(from, to, ());
                }
            }
        }

        Self {
            project: project.to_string(),
            graph,
            index,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Get a task by node index.
    pub fn task(&self, node: NodeIndex) -> &TaskSpec {
        &self.graph[node]
    }

    /// Look up a task's node index by name.
    pub fn node(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    /// Get a task by name.
    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.node(name).map(|n| &self.graph[n])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node indices in manifest declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Tasks in manifest declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.graph.node_weights()
    }

    /// Direct dependencies of a task, in declaration order.
    pub fn dependencies(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(node, Direction::Incoming)
    }

    /// Direct dependents of a task, in declaration order.
    pub fn dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(node, Direction::Outgoing)
    }

    fn sorted_neighbors(&self, node: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        out.sort();
        out
    }

    /// Tasks in an order where every task follows its dependencies.
    ///
    /// Returns `None` if the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<&TaskSpec>> {
        let sorted = toposort(&self.graph, None).ok()?;
        Some(sorted.into_iter().map(|n| &self.graph[n]).collect())
    }

    /// Find a dependency cycle, if any.
    ///
    /// Runs a three-colour depth-first search from every node in declaration
    /// order and returns the names on the first cycle found, listed in
    /// dependency order starting from the earliest-declared member reached.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; self.len()];

        for root in self.nodes() {
            if color[root.index()] != Color::White {
                continue;
            }
            // Explicit DFS stack of (node, its dependents, next dependent to
            // visit). The stack doubles as the current path.
            color[root.index()] = Color::Gray;
            let mut stack = vec![(root, self.dependents(root), 0usize)];

            while let Some((node, next_nodes, cursor)) = stack.last_mut() {
                let Some(&next) = next_nodes.get(*cursor) else {
                    color[node.index()] = Color::Black;
                    stack.pop();
                    continue;
                };
                *cursor += 1;

                match color[next.index()] {
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|(n, _, _)| *n == next)
                            .unwrap_or(0);
                        return Some(
                            stack[start..]
                                .iter()
                                .map(|(n, _, _)| self.graph[*n].name.clone())
                                .collect(),
                        );
                    }
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        stack.push((next, self.dependents(next), 0));
                    }
                    Color::Black => {}
                }
            }
        }

        None
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("project", &self.project)
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
