/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Loaded working set of the citation graph.
//!
//! Core structures:
//! - `LoadedGraph`: arena backed by petgraph::StableGraph plus an id index
//! - `Node`: paper node with position, degree and tree metadata
//! - `Edge`: tree (backbone) or extra (cross-link) edge
//!
//! Nodes refer to each other only by stable string id; `NodeKey`s are an
//! internal arena handle and never leave the loader.

use std::collections::HashMap;

use euclid::default::Point2D;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::{Directed, Direction};
use tokio::time::Instant;

use crate::fetch::NodeRecord;
use crate::render::RenderEvent;

pub mod spatial;

/// Arena handle for a loaded node (stable while the node stays loaded)
pub type NodeKey = NodeIndex;

/// Arena handle for a loaded edge
pub type EdgeKey = EdgeIndex;

/// A loaded paper node
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable id (paper id)
    pub id: String,

    /// Display label
    pub label: String,

    /// Position in world space (supplied by the backend layout)
    pub position: Point2D<f64>,

    /// Citation count
    pub degree: u32,

    pub cluster_id: i64,

    /// Distance from the root; roots have level 0
    pub tree_level: u32,

    /// Ordered parent ids
    pub parent_ids: Vec<String>,

    /// Tree-critical: never evicted
    pub retained: bool,

    /// Retention score from the last eviction pass
    pub importance: f64,

    /// Last time a fragment carried this node
    pub last_seen: Instant,
}

impl Node {
    pub fn from_record(record: &NodeRecord, now: Instant) -> Self {
        let mut parent_ids: Vec<String> = Vec::with_capacity(record.parent_ids.len());
        for parent in &record.parent_ids {
            if parent != &record.id && !parent_ids.contains(parent) {
                parent_ids.push(parent.clone());
            }
        }
        Self {
            id: record.id.clone(),
            label: if record.label.is_empty() {
                record.id.clone()
            } else {
                record.label.clone()
            },
            position: Point2D::new(record.x, record.y),
            degree: record.degree,
            cluster_id: record.cluster_id,
            tree_level: record.tree_level,
            parent_ids,
            retained: record.tree_level == 0,
            importance: 0.0,
            last_seen: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.tree_level == 0
    }
}

/// Edge payload. Direction is stored in the arena (source -> target); for
/// tree edges the source is the parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Backbone edge; never flips back to false
    pub is_tree_edge: bool,
    pub weight: f64,
}

impl Edge {
    pub fn tree(weight: f64) -> Self {
        Self {
            is_tree_edge: true,
            weight,
        }
    }

    pub fn extra(weight: f64) -> Self {
        Self {
            is_tree_edge: false,
            weight,
        }
    }
}

/// Read-only view of an edge
#[derive(Debug, Clone, Copy)]
pub struct EdgeView {
    pub key: EdgeKey,
    pub source: NodeKey,
    pub target: NodeKey,
    pub edge: Edge,
}

/// Result of inserting an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMerge {
    /// A new edge was created
    Added(EdgeKey),

    /// An extra edge between the pair was promoted to a tree edge
    Upgraded(EdgeKey),

    /// An equivalent (or stronger) edge already existed
    Existing(EdgeKey),
}

/// The loaded working set
#[derive(Debug, Clone, Default)]
pub struct LoadedGraph {
    inner: StableGraph<Node, Edge, Directed>,

    /// id to arena key
    id_to_node: HashMap<String, NodeKey>,

    /// Render journal, drained by the embedder
    events: Vec<RenderEvent>,
}

impl LoadedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_node.contains_key(id)
    }

    pub fn key_of(&self, id: &str) -> Option<NodeKey> {
        self.id_to_node.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.inner.node_weight(self.key_of(id)?)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        let key = self.key_of(id)?;
        self.inner.node_weight_mut(key)
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.inner.node_weight(key)
    }

    /// Iterate over all nodes as (key, node) pairs
    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &Node)> {
        self.inner
            .node_indices()
            .map(move |idx| (idx, &self.inner[idx]))
    }

    /// Iterate over all edges
    pub fn edges(&self) -> impl Iterator<Item = EdgeView> + '_ {
        self.inner.edge_references().map(|e| EdgeView {
            key: e.id(),
            source: e.source(),
            target: e.target(),
            edge: *e.weight(),
        })
    }

    pub fn edge(&self, key: EdgeKey) -> Option<EdgeView> {
        let (source, target) = self.inner.edge_endpoints(key)?;
        Some(EdgeView {
            key,
            source,
            target,
            edge: *self.inner.edge_weight(key)?,
        })
    }

    /// Add a node. Returns `None` if the id is already loaded.
    pub fn add_node(&mut self, node: Node) -> Option<NodeKey> {
        if self.id_to_node.contains_key(&node.id) {
            return None;
        }
        let id = node.id.clone();
        self.events.push(RenderEvent::NodeAdded {
            id: id.clone(),
            position: node.position,
            cluster_id: node.cluster_id,
            degree: node.degree,
        });
        let key = self.inner.add_node(node);
        self.id_to_node.insert(id, key);
        Some(key)
    }

    /// Remove a node and all of its incident edges.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let key = self.id_to_node.remove(id)?;
        for edge_key in self.incident_edges(key) {
            self.journal_edge_removed(edge_key);
        }
        let node = self.inner.remove_node(key)?;
        self.events.push(RenderEvent::NodeRemoved {
            id: node.id.clone(),
        });
        Some(node)
    }

    /// Find the edge between two nodes in either direction
    pub fn find_edge(&self, a: NodeKey, b: NodeKey) -> Option<EdgeKey> {
        self.inner
            .find_edge(a, b)
            .or_else(|| self.inner.find_edge(b, a))
    }

    /// Add an edge between two loaded nodes.
    ///
    /// At most one edge exists per unordered pair. A tree edge replaces an
    /// existing extra edge (taking the tree direction); an extra edge never
    /// replaces anything. Returns `None` if an endpoint is not loaded or the
    /// edge is a self-loop.
    pub fn add_edge(&mut self, source: &str, target: &str, edge: Edge) -> Option<EdgeMerge> {
        let from = self.key_of(source)?;
        let to = self.key_of(target)?;
        if from == to {
            return None;
        }

        if let Some(existing) = self.find_edge(from, to) {
            let current = *self.inner.edge_weight(existing)?;
            if current.is_tree_edge || !edge.is_tree_edge {
                return Some(EdgeMerge::Existing(existing));
            }
            self.remove_edge(existing);
            let key = self.insert_edge(from, to, edge);
            return Some(EdgeMerge::Upgraded(key));
        }

        Some(EdgeMerge::Added(self.insert_edge(from, to, edge)))
    }

    /// Remove a single edge
    pub fn remove_edge(&mut self, key: EdgeKey) -> Option<Edge> {
        self.journal_edge_removed(key);
        self.inner.remove_edge(key)
    }

    /// All edges touching `key`, in both directions
    pub fn incident_edges(&self, key: NodeKey) -> Vec<EdgeKey> {
        self.inner
            .edges_directed(key, Direction::Outgoing)
            .chain(self.inner.edges_directed(key, Direction::Incoming))
            .map(|e| e.id())
            .collect()
    }

    /// Neighbours reachable over tree edges, in both directions
    pub fn tree_neighbors(&self, key: NodeKey) -> impl Iterator<Item = NodeKey> + '_ {
        self.inner
            .edges_directed(key, Direction::Outgoing)
            .filter(|e| e.weight().is_tree_edge)
            .map(|e| e.target())
            .chain(
                self.inner
                    .edges_directed(key, Direction::Incoming)
                    .filter(|e| e.weight().is_tree_edge)
                    .map(|e| e.source()),
            )
    }

    pub fn tree_edge_count(&self) -> usize {
        self.edges().filter(|e| e.edge.is_tree_edge).count()
    }

    pub(crate) fn set_importance(&mut self, key: NodeKey, importance: f64) {
        if let Some(node) = self.inner.node_weight_mut(key) {
            node.importance = importance;
        }
    }

    /// Drain the render journal
    pub fn take_events(&mut self) -> Vec<RenderEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn insert_edge(&mut self, from: NodeKey, to: NodeKey, edge: Edge) -> EdgeKey {
        self.events.push(RenderEvent::EdgeAdded {
            source: self.inner[from].id.clone(),
            target: self.inner[to].id.clone(),
            is_tree_edge: edge.is_tree_edge,
        });
        self.inner.add_edge(from, to, edge)
    }

    fn journal_edge_removed(&mut self, key: EdgeKey) {
        if let Some((from, to)) = self.inner.edge_endpoints(key) {
            self.events.push(RenderEvent::EdgeRemoved {
                source: self.inner[from].id.clone(),
                target: self.inner[to].id.clone(),
            });
        }
    }
}
