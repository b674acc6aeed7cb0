/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Connectivity-preserving fragment merge.
//!
//! Every loaded non-root node must have a loaded parent exactly one level
//! closer to the root. `add_fragment` checks this before touching the graph,
//! and `remove_node` refuses to remove the last such parent of a loaded child.

pub mod broken;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, trace};
use tokio::time::Instant;

use self::broken::{BrokenEdge, BrokenEdgeIndex};
use crate::error::{ConnectivityViolation, ViolationKind};
use crate::fetch::{EdgeRecord, NodeRecord};
use crate::graph::{Edge, EdgeMerge, LoadedGraph, Node};
use crate::render::RenderEvent;

/// What a successful merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids of nodes that were not loaded before, in fragment order
    pub added_nodes: Vec<String>,
    /// Already-loaded nodes whose `last_seen` was refreshed
    pub refreshed_nodes: usize,
    pub tree_edges_added: usize,
    /// Extra edges promoted to tree edges
    pub tree_edges_upgraded: usize,
    pub extra_edges_added: usize,
    pub broken_recorded: usize,
    pub broken_promoted: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.added_nodes.is_empty() &&
            self.tree_edges_added == 0 &&
            self.tree_edges_upgraded == 0 &&
            self.extra_edges_added == 0 &&
            self.broken_recorded == 0 &&
            self.broken_promoted == 0
    }
}

/// Owns the loaded graph and keeps it rooted.
#[derive(Debug, Default)]
pub struct TreeConnectivityManager {
    graph: LoadedGraph,
    broken: BrokenEdgeIndex,
    /// parent id -> loaded nodes listing it as a parent
    children: HashMap<String, BTreeSet<String>>,
}

impl TreeConnectivityManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &LoadedGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut LoadedGraph {
        &mut self.graph
    }

    pub fn broken_edges(&self) -> &BrokenEdgeIndex {
        &self.broken
    }

    pub fn take_events(&mut self) -> Vec<RenderEvent> {
        self.graph.take_events()
    }

    /// Validate and merge one fragment. Nothing is merged if validation fails.
    pub fn add_fragment(
        &mut self,
        nodes: &[NodeRecord],
        tree_edges: &[EdgeRecord],
        extra_edges: &[EdgeRecord],
        now: Instant,
    ) -> Result<MergeReport, ConnectivityViolation> {
        self.validate(nodes, tree_edges)?;

        let mut report = MergeReport::default();

        for record in nodes {
            if let Some(existing) = self.graph.get_mut(&record.id) {
                existing.last_seen = now;
                report.refreshed_nodes += 1;
                continue;
            }
            let node = Node::from_record(record, now);
            for parent in &node.parent_ids {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
            if self.graph.add_node(node).is_some() {
                report.added_nodes.push(record.id.clone());
            }
        }

        for edge in tree_edges {
            match self
                .graph
                .add_edge(&edge.source, &edge.target, Edge::tree(edge.weight))
            {
                Some(EdgeMerge::Added(_)) => report.tree_edges_added += 1,
                Some(EdgeMerge::Upgraded(_)) => report.tree_edges_upgraded += 1,
                Some(EdgeMerge::Existing(_)) | None => {},
            }
        }

        for id in &report.added_nodes {
            for pending in self.broken.take_for_missing(id) {
                let (source, target) = pending.endpoints();
                if let Some(EdgeMerge::Added(_)) =
                    self.graph
                        .add_edge(source, target, Edge::extra(pending.weight))
                {
                    report.broken_promoted += 1;
                }
            }
        }

        for edge in extra_edges {
            match self.merge_extra_edge(edge) {
                ExtraMerge::Added => report.extra_edges_added += 1,
                ExtraMerge::Broken => report.broken_recorded += 1,
                ExtraMerge::Skipped => {},
            }
        }

        debug!(
            "Merged fragment: {} new node(s), {} refreshed, {} tree edge(s), {} extra edge(s), {} broken promoted",
            report.added_nodes.len(),
            report.refreshed_nodes,
            report.tree_edges_added + report.tree_edges_upgraded,
            report.extra_edges_added,
            report.broken_promoted
        );
        Ok(report)
    }

    /// Merge best-effort extra edges (enrichment). Never fails.
    pub fn add_extra_edges(&mut self, extra_edges: &[EdgeRecord]) -> MergeReport {
        let mut report = MergeReport::default();
        for edge in extra_edges {
            match self.merge_extra_edge(edge) {
                ExtraMerge::Added => report.extra_edges_added += 1,
                ExtraMerge::Broken => report.broken_recorded += 1,
                ExtraMerge::Skipped => {},
            }
        }
        report
    }

    /// Remove a node unless it is the last valid parent of a loaded child.
    ///
    /// Extra edges to still-loaded neighbours become broken edges owned by the
    /// neighbour, so they come back if the node is loaded again. Broken edges
    /// owned by the node are dropped.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        if self.is_tree_critical(id) {
            return None;
        }
        let key = self.graph.key_of(id)?;

        for edge_key in self.graph.incident_edges(key) {
            let Some(view) = self.graph.edge(edge_key) else {
                continue;
            };
            if view.edge.is_tree_edge {
                continue;
            }
            let outgoing = view.target == key;
            let neighbour = if outgoing { view.source } else { view.target };
            if let Some(neighbour) = self.graph.node(neighbour) {
                self.broken.record(BrokenEdge {
                    node_id: neighbour.id.clone(),
                    missing_endpoint_id: id.to_string(),
                    weight: view.edge.weight,
                    outgoing,
                });
            }
        }
        self.broken.drop_owner(id);

        let node = self.graph.remove_node(id)?;
        for parent in &node.parent_ids {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.remove(id);
                if siblings.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        trace!("Removed node {id}");
        Some(node)
    }

    /// The first parent of `node` that is loaded exactly one level up.
    pub fn valid_parent<'a>(&'a self, node: &'a Node) -> Option<&'a str> {
        if node.is_root() {
            return None;
        }
        node.parent_ids
            .iter()
            .find(|parent| self.is_valid_parent_of(parent, node))
            .map(String::as_str)
    }

    /// True if removing `id` would leave some loaded child without a valid
    /// parent.
    pub fn is_tree_critical(&self, id: &str) -> bool {
        let Some(children) = self.children.get(id) else {
            return false;
        };
        let Some(node) = self.graph.get(id) else {
            return false;
        };
        children.iter().any(|child_id| {
            let Some(child) = self.graph.get(child_id) else {
                return false;
            };
            node.tree_level + 1 == child.tree_level &&
                !child
                    .parent_ids
                    .iter()
                    .any(|other| other != id && self.is_valid_parent_of(other, child))
        })
    }

    /// Loaded nodes that list `id` as a parent.
    pub fn children_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(id)
            .into_iter()
            .flatten()
            .filter(|child| self.graph.contains(child))
            .map(String::as_str)
    }

    /// Breadth-first walk over tree edges in both directions, up to `depth`
    /// hops, excluding the start node. Unknown ids yield nothing.
    pub fn tree_neighbors(&self, id: &str, depth: usize) -> Vec<String> {
        let Some(start) = self.graph.key_of(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut found = Vec::new();

        while let Some((key, hops)) = queue.pop_front() {
            if hops == depth {
                continue;
            }
            for next in self.graph.tree_neighbors(key) {
                if seen.insert(next) {
                    if let Some(node) = self.graph.node(next) {
                        found.push(node.id.clone());
                    }
                    queue.push_back((next, hops + 1));
                }
            }
        }
        found
    }

    /// Chain from `id` up to a root following valid parents, starting with
    /// `id` itself. Empty if `id` is not loaded.
    pub fn ancestor_path(&self, id: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self.graph.get(id);
        while let Some(node) = current {
            path.push(node.id.clone());
            current = self.valid_parent(node).and_then(|p| self.graph.get(p));
        }
        path
    }

    /// First loaded node that breaks the connectivity invariant, if any.
    pub fn check_invariant(&self) -> Option<String> {
        self.graph
            .nodes()
            .find(|(_, node)| !node.is_root() && self.valid_parent(node).is_none())
            .map(|(_, node)| node.id.clone())
    }

    fn is_valid_parent_of(&self, parent_id: &str, child: &Node) -> bool {
        self.graph
            .get(parent_id)
            .is_some_and(|parent| parent.tree_level + 1 == child.tree_level)
    }

    fn validate(
        &self,
        nodes: &[NodeRecord],
        tree_edges: &[EdgeRecord],
    ) -> Result<(), ConnectivityViolation> {
        let mut incoming: HashMap<&str, &NodeRecord> = HashMap::with_capacity(nodes.len());
        for record in nodes {
            incoming.entry(record.id.as_str()).or_insert(record);
        }

        for record in nodes {
            if record.tree_level == 0 || self.graph.contains(&record.id) {
                continue;
            }
            let wanted = record.tree_level - 1;
            // A loaded parent keeps its own metadata, so a fragment's copy of
            // it cannot vouch for a child.
            let anchored = record.parent_ids.iter().any(|parent| {
                parent != &record.id &&
                    match self.graph.get(parent) {
                        Some(loaded) => loaded.tree_level == wanted,
                        None => incoming
                            .get(parent.as_str())
                            .is_some_and(|p| p.tree_level == wanted),
                    }
            });
            if !anchored {
                return Err(ConnectivityViolation {
                    node_id: record.id.clone(),
                    kind: ViolationKind::MissingParent {
                        parent_ids: record.parent_ids.clone(),
                    },
                });
            }
        }

        for edge in tree_edges {
            let known = |id: &str| incoming.contains_key(id) || self.graph.contains(id);
            if !known(&edge.source) || !known(&edge.target) {
                let node_id = if known(&edge.source) {
                    edge.target.clone()
                } else {
                    edge.source.clone()
                };
                return Err(ConnectivityViolation {
                    node_id,
                    kind: ViolationKind::DanglingTreeEdge {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                    },
                });
            }
        }
        Ok(())
    }

    fn merge_extra_edge(&mut self, edge: &EdgeRecord) -> ExtraMerge {
        if edge.source == edge.target {
            return ExtraMerge::Skipped;
        }
        let source_loaded = self.graph.contains(&edge.source);
        let target_loaded = self.graph.contains(&edge.target);
        match (source_loaded, target_loaded) {
            (true, true) => {
                match self
                    .graph
                    .add_edge(&edge.source, &edge.target, Edge::extra(edge.weight))
                {
                    Some(EdgeMerge::Added(_)) => ExtraMerge::Added,
                    _ => ExtraMerge::Skipped,
                }
            },
            (true, false) | (false, true) => {
                let (owner, missing) = if source_loaded {
                    (&edge.source, &edge.target)
                } else {
                    (&edge.target, &edge.source)
                };
                let recorded = self.broken.record(BrokenEdge {
                    node_id: owner.clone(),
                    missing_endpoint_id: missing.clone(),
                    weight: edge.weight,
                    outgoing: source_loaded,
                });
                if recorded {
                    ExtraMerge::Broken
                } else {
                    ExtraMerge::Skipped
                }
            },
            (false, false) => ExtraMerge::Skipped,
        }
    }
}

enum ExtraMerge {
    Added,
    Broken,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, level: u32, parents: &[&str]) -> NodeRecord {
        NodeRecord::new(id, level as f64 * 10.0, 0.0, level, parents)
    }

    fn tree(source: &str, target: &str) -> EdgeRecord {
        EdgeRecord::new(source, target, 1.0)
    }

    fn base() -> TreeConnectivityManager {
        let mut manager = TreeConnectivityManager::new();
        manager
            .add_fragment(
                &[rec("A", 0, &[]), rec("B", 1, &["A"])],
                &[tree("A", "B")],
                &[],
                Instant::now(),
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_orphan_fragment_is_rejected_atomically() {
        let mut manager = base();
        manager.take_events();

        let err = manager
            .add_fragment(&[rec("C", 1, &["Z"])], &[], &[], Instant::now())
            .unwrap_err();
        assert_eq!(err.node_id, "C");
        assert!(matches!(err.kind, ViolationKind::MissingParent { .. }));
        assert_eq!(manager.graph().node_count(), 2);
        assert!(!manager.graph().contains("C"));
        assert_eq!(manager.graph().pending_events(), 0);
    }

    #[test]
    fn test_partial_violation_merges_nothing() {
        let mut manager = base();
        let err = manager
            .add_fragment(
                &[rec("C", 2, &["B"]), rec("D", 2, &["Q"])],
                &[tree("B", "C")],
                &[],
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err.node_id, "D");
        assert!(!manager.graph().contains("C"));
    }

    #[test]
    fn test_parent_must_be_one_level_up() {
        let mut manager = base();
        let err = manager
            .add_fragment(&[rec("C", 3, &["B"])], &[], &[], Instant::now())
            .unwrap_err();
        assert_eq!(err.node_id, "C");
    }

    #[test]
    fn test_relisted_parent_cannot_change_its_level() {
        let mut manager = base();
        manager.take_events();
        let err = manager
            .add_fragment(
                &[rec("B", 2, &["A"]), rec("C", 3, &["B"])],
                &[tree("B", "C")],
                &[],
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err.node_id, "C");
        assert!(!manager.graph().contains("C"));
        assert_eq!(manager.graph().get("B").unwrap().tree_level, 1);
        assert!(manager.take_events().is_empty());
        assert_eq!(manager.check_invariant(), None);

        // The loaded level still anchors children.
        manager
            .add_fragment(
                &[rec("B", 2, &["A"]), rec("C", 2, &["B"])],
                &[tree("B", "C")],
                &[],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(manager.check_invariant(), None);
    }

    #[test]
    fn test_parent_chain_inside_fragment() {
        let mut manager = TreeConnectivityManager::new();
        let report = manager
            .add_fragment(
                &[rec("C", 2, &["B"]), rec("B", 1, &["A"]), rec("A", 0, &[])],
                &[tree("A", "B"), tree("B", "C")],
                &[],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(report.added_nodes, vec!["C", "B", "A"]);
        assert_eq!(report.tree_edges_added, 2);
        assert_eq!(manager.check_invariant(), None);
    }

    #[test]
    fn test_non_root_without_parents_is_rejected() {
        let mut manager = TreeConnectivityManager::new();
        let err = manager
            .add_fragment(&[rec("X", 1, &[])], &[], &[], Instant::now())
            .unwrap_err();
        assert_eq!(
            err.kind,
            ViolationKind::MissingParent {
                parent_ids: Vec::new()
            }
        );
    }

    #[test]
    fn test_dangling_tree_edge_is_rejected() {
        let mut manager = base();
        let err = manager
            .add_fragment(&[], &[tree("B", "ghost")], &[], Instant::now())
            .unwrap_err();
        assert_eq!(err.node_id, "ghost");
        assert!(matches!(err.kind, ViolationKind::DanglingTreeEdge { .. }));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut manager = base();
        let later = Instant::now() + std::time::Duration::from_secs(5);
        let report = manager
            .add_fragment(
                &[rec("A", 0, &[]), rec("B", 1, &["A"])],
                &[tree("A", "B")],
                &[],
                later,
            )
            .unwrap();

        assert!(report.is_noop());
        assert_eq!(report.refreshed_nodes, 2);
        assert_eq!(manager.graph().node_count(), 2);
        assert_eq!(manager.graph().edge_count(), 1);
        assert_eq!(manager.graph().get("B").unwrap().last_seen, later);
    }

    #[test]
    fn test_reloaded_node_keeps_tree_metadata() {
        let mut manager = base();
        manager
            .add_fragment(&[rec("B", 1, &["A", "other"])], &[], &[], Instant::now())
            .unwrap();
        assert_eq!(manager.graph().get("B").unwrap().parent_ids, vec!["A"]);
    }

    #[test]
    fn test_extra_edges_and_broken_promotion() {
        let mut manager = base();
        let report = manager
            .add_fragment(
                &[],
                &[],
                &[
                    EdgeRecord::new("B", "A", 0.5),
                    EdgeRecord::new("B", "C", 0.7),
                    EdgeRecord::new("X", "Y", 0.1),
                ],
                Instant::now(),
            )
            .unwrap();
        assert_eq!(report.extra_edges_added, 0);
        assert_eq!(report.broken_recorded, 1);
        assert!(manager.broken_edges().contains("B", "C"));

        let report = manager
            .add_fragment(&[rec("C", 1, &["A"])], &[tree("A", "C")], &[], Instant::now())
            .unwrap();
        assert_eq!(report.broken_promoted, 1);
        assert!(manager.broken_edges().is_empty());

        let b = manager.graph().key_of("B").unwrap();
        let c = manager.graph().key_of("C").unwrap();
        let edge = manager.graph().find_edge(b, c).unwrap();
        let view = manager.graph().edge(edge).unwrap();
        assert!(!view.edge.is_tree_edge);
        assert_eq!(view.source, b);
        assert_eq!(view.edge.weight, 0.7);
    }

    #[test]
    fn test_tree_edge_upgrades_extra_edge() {
        let mut manager = base();
        manager
            .add_fragment(&[rec("C", 1, &["A"])], &[], &[EdgeRecord::new("C", "A", 0.2)], Instant::now())
            .unwrap();
        let report = manager
            .add_fragment(&[], &[tree("A", "C")], &[], Instant::now())
            .unwrap();
        assert_eq!(report.tree_edges_upgraded, 1);
        assert_eq!(manager.graph().tree_edge_count(), 2);
    }

    #[test]
    fn test_parent_of_only_child_is_critical() {
        let manager = base();
        assert!(manager.is_tree_critical("A"));
        assert!(!manager.is_tree_critical("B"));
        assert_eq!(manager.children_of("A").collect::<Vec<_>>(), vec!["B"]);
    }

    #[test]
    fn test_second_parent_lifts_criticality() {
        let mut manager = TreeConnectivityManager::new();
        manager
            .add_fragment(
                &[
                    rec("R", 0, &[]),
                    rec("P", 1, &["R"]),
                    rec("Q", 1, &["R"]),
                    rec("C", 2, &["P", "Q"]),
                ],
                &[tree("R", "P"), tree("R", "Q"), tree("P", "C")],
                &[],
                Instant::now(),
            )
            .unwrap();
        assert!(!manager.is_tree_critical("P"));
        assert!(manager.remove_node("P").is_some());
        assert!(manager.is_tree_critical("Q"));
        assert!(manager.remove_node("Q").is_none());
        assert_eq!(manager.check_invariant(), None);
    }

    #[test]
    fn test_remove_refuses_critical_node() {
        let mut manager = base();
        assert!(manager.remove_node("A").is_none());
        assert!(manager.remove_node("B").is_some());
        assert!(manager.remove_node("A").is_some());
        assert_eq!(manager.graph().node_count(), 0);
    }

    #[test]
    fn test_removal_turns_extra_edges_into_broken_edges() {
        let mut manager = base();
        manager
            .add_fragment(
                &[rec("C", 1, &["A"])],
                &[tree("A", "C")],
                &[EdgeRecord::new("C", "B", 0.4)],
                Instant::now(),
            )
            .unwrap();
        assert!(manager.remove_node("C").is_some());
        assert!(manager.broken_edges().contains("B", "C"));

        let report = manager
            .add_fragment(&[rec("C", 1, &["A"])], &[tree("A", "C")], &[], Instant::now())
            .unwrap();
        assert_eq!(report.broken_promoted, 1);
        let b = manager.graph().key_of("B").unwrap();
        let c = manager.graph().key_of("C").unwrap();
        let view = manager
            .graph()
            .edge(manager.graph().find_edge(b, c).unwrap())
            .unwrap();
        assert_eq!(view.source, c);
    }

    #[test]
    fn test_removal_drops_owned_broken_edges() {
        let mut manager = base();
        manager.add_extra_edges(&[EdgeRecord::new("B", "far", 1.0)]);
        assert_eq!(manager.broken_edges().len(), 1);
        manager.remove_node("B");
        assert!(manager.broken_edges().is_empty());
    }

    #[test]
    fn test_tree_neighbors_bfs() {
        let mut manager = TreeConnectivityManager::new();
        manager
            .add_fragment(
                &[
                    rec("R", 0, &[]),
                    rec("A", 1, &["R"]),
                    rec("B", 1, &["R"]),
                    rec("A1", 2, &["A"]),
                    rec("A2", 2, &["A"]),
                ],
                &[tree("R", "A"), tree("R", "B"), tree("A", "A1"), tree("A", "A2")],
                &[EdgeRecord::new("A1", "B", 1.0)],
                Instant::now(),
            )
            .unwrap();

        assert_eq!(manager.tree_neighbors("A1", 1), vec!["A"]);
        let mut two = manager.tree_neighbors("A1", 2);
        assert_eq!(two[0], "A");
        two[1..].sort();
        assert_eq!(two, vec!["A", "A2", "R"]);
        assert_eq!(manager.tree_neighbors("A1", 3).len(), 4);
        assert!(manager.tree_neighbors("A1", 0).is_empty());
        assert!(manager.tree_neighbors("missing", 5).is_empty());
    }

    #[test]
    fn test_ancestor_path_reaches_root() {
        let mut manager = base();
        manager
            .add_fragment(&[rec("C", 2, &["B"])], &[tree("B", "C")], &[], Instant::now())
            .unwrap();
        assert_eq!(manager.ancestor_path("C"), vec!["C", "B", "A"]);
        assert_eq!(manager.ancestor_path("A"), vec!["A"]);
        assert!(manager.ancestor_path("nope").is_empty());
    }
}
