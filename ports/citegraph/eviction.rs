/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Node and edge cap enforcement.

use std::cmp::Ordering;

use euclid::default::Point2D;
use log::{debug, info};

use crate::graph::EdgeKey;
use crate::importance::NodeImportanceScorer;
use crate::tree::TreeConnectivityManager;

/// Outcome of one `enforce_limits` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    /// Evicted node ids, in eviction order
    pub evicted_nodes: Vec<String>,

    /// Positions of the evicted nodes, parallel to `evicted_nodes`
    pub evicted_positions: Vec<Point2D<f64>>,

    /// Extra edges dropped by the edge cap (not counting edges that went away
    /// with an evicted node)
    pub evicted_edges: usize,

    /// A cap could not be met because every remaining node or edge is
    /// protected. Soft condition; the loader keeps running.
    pub over_capacity: bool,
}

/// Running totals across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub runs: u64,
    pub nodes_evicted: u64,
    pub edges_evicted: u64,
    pub capacity_exceeded: u64,
}

#[derive(Debug, Default)]
pub struct MemoryEvictionManager {
    stats: EvictionStats,
}

impl MemoryEvictionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> EvictionStats {
        self.stats
    }

    /// Bring the loaded graph under `max_nodes` and `max_edges`.
    ///
    /// Nodes go lowest score first. Nodes with an infinite score and nodes
    /// that are the last valid parent of a loaded child are never evicted;
    /// evicting a leaf can expose its parent, so candidates are recollected
    /// until the cap holds or a pass evicts nothing. Then extra edges go in
    /// ascending `(weight, weaker endpoint score)` order. Tree edges only ever
    /// leave with an endpoint.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn enforce_limits(
        &mut self,
        tree: &mut TreeConnectivityManager,
        scorer: &NodeImportanceScorer,
        center: Point2D<f64>,
        max_nodes: usize,
        max_edges: usize,
    ) -> EvictionReport {
        self.stats.runs += 1;
        let mut report = EvictionReport::default();

        let scores: Vec<_> = tree
            .graph()
            .nodes()
            .map(|(key, node)| (key, scorer.score(node, center)))
            .collect();
        for (key, score) in scores {
            tree.graph_mut().set_importance(key, score);
        }

        while tree.graph().node_count() > max_nodes {
            let mut candidates: Vec<(f64, String)> = tree
                .graph()
                .nodes()
                .filter(|(_, node)| node.importance.is_finite())
                .filter(|(_, node)| !tree.is_tree_critical(&node.id))
                .map(|(_, node)| (node.importance, node.id.clone()))
                .collect();
            candidates.sort_by(candidate_order);

            let mut evicted_this_pass = 0;
            for (_, id) in candidates {
                if tree.graph().node_count() <= max_nodes {
                    break;
                }
                // Evicting a co-parent can make its sibling critical.
                if let Some(node) = tree.remove_node(&id) {
                    report.evicted_positions.push(node.position);
                    report.evicted_nodes.push(id);
                    evicted_this_pass += 1;
                }
            }
            if evicted_this_pass == 0 {
                report.over_capacity = true;
                break;
            }
        }

        if tree.graph().edge_count() > max_edges {
            let excess = tree.graph().edge_count() - max_edges;
            let graph = tree.graph();
            let mut extra: Vec<(f64, f64, EdgeKey)> = graph
                .edges()
                .filter(|view| !view.edge.is_tree_edge)
                .map(|view| {
                    let importance = |key| graph.node(key).map_or(0.0, |n| n.importance);
                    let weaker = importance(view.source).min(importance(view.target));
                    (view.edge.weight, weaker, view.key)
                })
                .collect();
            extra.sort_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.total_cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            });
            if extra.len() < excess {
                report.over_capacity = true;
            }
            for (_, _, key) in extra.into_iter().take(excess) {
                if tree.graph_mut().remove_edge(key).is_some() {
                    report.evicted_edges += 1;
                }
            }
        }

        self.stats.nodes_evicted += report.evicted_nodes.len() as u64;
        self.stats.edges_evicted += report.evicted_edges as u64;
        if report.over_capacity {
            self.stats.capacity_exceeded += 1;
            info!(
                "Capacity exceeded: {} node(s), {} edge(s) loaded against caps of {max_nodes}/{max_edges}",
                tree.graph().node_count(),
                tree.graph().edge_count()
            );
        }
        if !report.evicted_nodes.is_empty() || report.evicted_edges > 0 {
            debug!(
                "Evicted {} node(s) and {} extra edge(s)",
                report.evicted_nodes.len(),
                report.evicted_edges
            );
        }
        report
    }
}

/// Lowest score first, ties broken by id so runs are deterministic.
fn candidate_order(a: &(f64, String), b: &(f64, String)) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::fetch::{EdgeRecord, NodeRecord};

    fn rec(id: &str, level: u32, parents: &[&str], x: f64, degree: u32) -> NodeRecord {
        NodeRecord::new(id, x, 0.0, level, parents).with_degree(degree)
    }

    fn tree(source: &str, target: &str) -> EdgeRecord {
        EdgeRecord::new(source, target, 1.0)
    }

    fn star(leaves: usize) -> TreeConnectivityManager {
        let mut manager = TreeConnectivityManager::new();
        let mut nodes = vec![rec("R", 0, &[], 0.0, 100)];
        let mut edges = Vec::new();
        for i in 0..leaves {
            let id = format!("L{i}");
            nodes.push(rec(&id, 1, &["R"], (i as f64 + 1.0) * 100.0, 1));
            edges.push(tree("R", &id));
        }
        manager
            .add_fragment(&nodes, &edges, &[], Instant::now())
            .unwrap();
        manager
    }

    #[test]
    fn test_evicts_farthest_leaves_first() {
        let mut manager = star(5);
        let mut eviction = MemoryEvictionManager::new();
        let report = eviction.enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            4,
            usize::MAX,
        );

        assert_eq!(report.evicted_nodes, vec!["L4", "L3"]);
        assert!(!report.over_capacity);
        assert_eq!(manager.graph().node_count(), 4);
        assert_eq!(manager.check_invariant(), None);
        assert_eq!(eviction.stats().nodes_evicted, 2);
    }

    #[test]
    fn test_single_root_and_child_under_cap_of_one() {
        let mut manager = TreeConnectivityManager::new();
        manager
            .add_fragment(
                &[rec("A", 0, &[], 0.0, 0), rec("B", 1, &["A"], 1.0, 0)],
                &[tree("A", "B")],
                &[],
                Instant::now(),
            )
            .unwrap();
        let report = MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            1,
            usize::MAX,
        );

        assert_eq!(report.evicted_nodes, vec!["B"]);
        assert_eq!(manager.graph().node_count(), 1);
        assert!(manager.graph().contains("A"));
        assert_eq!(manager.check_invariant(), None);
    }

    #[test]
    fn test_chain_is_peeled_from_the_leaf() {
        let mut manager = TreeConnectivityManager::new();
        manager
            .add_fragment(
                &[
                    rec("A", 0, &[], 0.0, 0),
                    rec("B", 1, &["A"], 1.0, 1000),
                    rec("C", 2, &["B"], 2.0, 0),
                    rec("D", 3, &["C"], 3.0, 1000),
                ],
                &[tree("A", "B"), tree("B", "C"), tree("C", "D")],
                &[],
                Instant::now(),
            )
            .unwrap();
        let report = MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            2,
            usize::MAX,
        );

        assert_eq!(report.evicted_nodes, vec!["D", "C"]);
        assert_eq!(manager.check_invariant(), None);
    }

    #[test]
    fn test_protected_path_survives() {
        let mut manager = star(3);
        let mut scorer = NodeImportanceScorer::default();
        scorer.set_protected(["L2".to_string(), "R".to_string()]);
        let report = MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &scorer,
            Point2D::origin(),
            2,
            usize::MAX,
        );

        assert!(manager.graph().contains("L2"));
        assert_eq!(report.evicted_nodes, vec!["L1", "L0"]);
    }

    #[test]
    fn test_over_capacity_when_everything_is_protected() {
        let mut manager = star(2);
        let mut scorer = NodeImportanceScorer::default();
        scorer.set_protected(["L0".to_string(), "L1".to_string()]);
        let mut eviction = MemoryEvictionManager::new();
        let report =
            eviction.enforce_limits(&mut manager, &scorer, Point2D::origin(), 1, usize::MAX);

        assert!(report.over_capacity);
        assert!(report.evicted_nodes.is_empty());
        assert_eq!(manager.graph().node_count(), 3);
        assert_eq!(eviction.stats().capacity_exceeded, 1);
    }

    #[test]
    fn test_importance_is_recorded() {
        let mut manager = star(1);
        MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            10,
            10,
        );
        assert_eq!(manager.graph().get("R").unwrap().importance, f64::INFINITY);
        assert!(manager.graph().get("L0").unwrap().importance.is_finite());
    }

    #[test]
    fn test_edge_cap_drops_light_extra_edges_only() {
        let mut manager = star(3);
        manager.add_extra_edges(&[
            EdgeRecord::new("L0", "L1", 0.9),
            EdgeRecord::new("L1", "L2", 0.1),
            EdgeRecord::new("L0", "L2", 0.5),
        ]);
        assert_eq!(manager.graph().edge_count(), 6);

        let report = MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            usize::MAX,
            4,
        );
        assert_eq!(report.evicted_edges, 2);
        assert!(!report.over_capacity);
        assert_eq!(manager.graph().tree_edge_count(), 3);
        let remaining: Vec<f64> = manager
            .graph()
            .edges()
            .filter(|e| !e.edge.is_tree_edge)
            .map(|e| e.edge.weight)
            .collect();
        assert_eq!(remaining, vec![0.9]);
    }

    #[test]
    fn test_edge_cap_below_tree_edges_is_over_capacity() {
        let mut manager = star(3);
        let report = MemoryEvictionManager::new().enforce_limits(
            &mut manager,
            &NodeImportanceScorer::default(),
            Point2D::origin(),
            usize::MAX,
            1,
        );
        assert!(report.over_capacity);
        assert_eq!(manager.graph().edge_count(), 3);
    }

    #[test]
    fn test_candidate_order_breaks_ties_by_id() {
        let mut candidates = vec![(1.0, "b".to_string()), (1.0, "a".to_string()), (0.5, "z".to_string())];
        candidates.sort_by(candidate_order);
        let ids: Vec<_> = candidates.iter().map(|c| c.1.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }
}
