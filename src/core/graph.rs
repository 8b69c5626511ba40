//! Dependency graph over a bounded working set of beads.
//!
//! The graph is built from tracker relations and drives both topological
//! ordering for the planner and cross-batch dependency derivation. Only
//! blocking relations inside the working set produce edges; relations whose
//! counterparty is outside the set are ignored.

use crate::core::bead::Relation;
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};

/// Directed dependency graph over bead identifiers.
///
/// Edges point from a dependency to its dependent: an edge `a -> b` means
/// `b` cannot start until `a` completes. Node insertion follows the input
/// bead order, which keeps topological sorting deterministic.
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// Bead ids in original input order.
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from a working set and its relations.
    ///
    /// Every bead in `bead_ids` becomes a node. Each blocking relation with
    /// both endpoints in the set adds one dependency edge; parent-child
    /// relations and out-of-set counterparties contribute nothing.
    pub fn build(bead_ids: &[String], relations: &[Relation]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for id in bead_ids {
            if !index.contains_key(id) {
                let node = graph.add_node(id.clone());
                index.insert(id.clone(), node);
            }
        }

        for relation in relations {
            let Some((dependent, dependency)) = relation.dependency() else {
                continue;
            };
            let (Some(&dep_node), Some(&dependent_node)) =
                (index.get(dependency), index.get(dependent))
            else {
                continue;
            };
            // Trackers often report both directions of the same edge.
            if graph.find_edge(dep_node, dependent_node).is_none() {
                graph.add_edge(dep_node, dependent_node, ());
            }
        }

        Self {
            graph,
            index,
            order: bead_ids.to_vec(),
        }
    }

    /// Beads this bead depends on (must complete before it).
    pub fn depends_on(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    /// Beads that depend on this bead.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: petgraph::Direction) -> Vec<&str> {
        if let Some(&node) = self.index.get(id) {
            self.graph
                .neighbors_directed(node, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .map(String::as_str)
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn bead_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Topological order via Kahn's algorithm.
    ///
    /// The queue is seeded with zero-in-degree beads in original input
    /// order, so independent beads come out in the order they went in.
    ///
    /// # Errors
    /// Returns [`Error::Cycle`] when the result is shorter than the working
    /// set (some in-degrees never reached zero). No partial order is
    /// returned.
    pub fn topo_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            in_degree.insert(id.as_str(), self.depends_on(id).len());
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() < self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| !sorted.contains(id))
                .cloned()
                .unwrap_or_default();
            return Err(Error::Cycle { bead: stuck });
        }

        Ok(sorted)
    }

    /// Dependency depth per bead: 0 for roots, 1 + max over dependencies
    /// otherwise. Assumes an acyclic graph (call [`Self::topo_sort`] first).
    pub fn depths(&self, topo: &[String]) -> HashMap<String, usize> {
        let mut depths: HashMap<String, usize> = HashMap::new();
        for id in topo {
            let depth = self
                .depends_on(id)
                .iter()
                .filter_map(|dep| depths.get(*dep))
                .max()
                .map(|d| d + 1)
                .unwrap_or(0);
            depths.insert(id.clone(), depth);
        }
        depths
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("beads", &self.bead_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
