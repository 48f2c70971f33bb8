//! Id-addressed directed graph over `petgraph`.
//!
//! The scheduler addresses nodes by stable string id ("ready the node whose
//! id is X", "remove node Y") and removes nodes as stages complete, so this
//! wraps `StableDiGraph` (indices survive removals) with an id → index side
//! map. Cycle detection delegates to `petgraph::algo::toposort`.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A node with this id already exists.
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    /// No node with this id.
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// The graph contains a cycle.
    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// DirectedGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct NodeSlot<T> {
    id: String,
    item: T,
}

/// A directed graph whose nodes carry a stable string id and a payload.
///
/// Edges point from dependency to dependent: a node is *ready* when it has
/// zero inbound edges.
#[derive(Debug, Clone)]
pub struct DirectedGraph<T> {
    graph: StableDiGraph<NodeSlot<T>, ()>,
    index: HashMap<String, NodeIndex>,
}

impl<T> Default for DirectedGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DirectedGraph<T> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Number of nodes currently in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Whether a node with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Add a node with the given id and payload.
    pub fn add_node(&mut self, id: impl Into<String>, item: T) -> Result<(), GraphError> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let idx = self.graph.add_node(NodeSlot {
            id: id.clone(),
            item,
        });
        self.index.insert(id, idx);
        Ok(())
    }

    /// Add an edge from `from` to `to`. Adding the same edge twice is a no-op.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from_idx = self.resolve(from)?;
        let to_idx = self.resolve(to)?;
        self.graph.update_edge(from_idx, to_idx, ());
        Ok(())
    }

    /// The payload of the node with this id, if present.
    pub fn item(&self, id: &str) -> Option<&T> {
        let idx = self.index.get(id)?;
        self.graph.node_weight(*idx).map(|slot| &slot.item)
    }

    /// Remove the node with this id (and all its edges), returning its
    /// payload.
    pub fn remove_node(&mut self, id: &str) -> Result<T, GraphError> {
        let idx = self
            .index
            .remove(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        let slot = self
            .graph
            .remove_node(idx)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        Ok(slot.item)
    }

    /// All node ids, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of all nodes with zero inbound edges, sorted.
    pub fn nodes_without_inbound(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx).map(|slot| slot.id.clone()))
            .collect();
        ready.sort();
        ready
    }

    /// Ids of the nodes with an edge into `id`, sorted.
    pub fn inbound_of(&self, id: &str) -> Result<Vec<String>, GraphError> {
        let idx = self.resolve(id)?;
        let mut inbound: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).map(|slot| slot.id.clone()))
            .collect();
        inbound.sort();
        Ok(inbound)
    }

    /// Verify the graph is acyclic.
    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|slot| slot.id.clone())
                .unwrap_or_default();
            GraphError::CycleDetected(id)
        })?;
        Ok(())
    }

    /// Render the graph as a Mermaid `flowchart TD` document, suitable for
    /// logging or embedding in documentation.
    pub fn mermaid(&self) -> String {
        let mut lines: Vec<String> = self
            .graph
            .edge_references()
            .filter_map(|edge| {
                let from = self.graph.node_weight(edge.source())?;
                let to = self.graph.node_weight(edge.target())?;
                Some(format!("\t{} --> {}", from.id, to.id))
            })
            .collect();
        for idx in self.graph.node_indices() {
            if self.graph.neighbors_undirected(idx).next().is_none() {
                if let Some(slot) = self.graph.node_weight(idx) {
                    lines.push(format!("\t{}", slot.id));
                }
            }
        }
        lines.sort();
        let mut out = String::from("flowchart TD\n");
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn resolve(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
