/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fetch boundary between the loader and the graph backend.
//!
//! Two request kinds, in priority order:
//! - `FragmentRequest`: nodes plus tree edges in a box. Mandatory and atomic.
//! - `ExtraEdgesRequest`: cross-links for a node set. Best effort.
//!
//! Field names follow the backend's camelCase JSON.

pub mod coordinator;

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::input::ViewportBounds;
use crate::lod::EdgeMode;

/// A node as delivered by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub degree: u32,
    #[serde(default)]
    pub cluster_id: i64,
    pub tree_level: u32,
    /// Ordered; the first parent one level up is the canonical one
    #[serde(default)]
    pub parent_ids: Vec<String>,
}

impl NodeRecord {
    /// Convenience constructor for roots and tests.
    pub fn new(id: &str, x: f64, y: f64, tree_level: u32, parent_ids: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            x,
            y,
            degree: 0,
            cluster_id: 0,
            tree_level,
            parent_ids: parent_ids.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_degree(mut self, degree: u32) -> Self {
        self.degree = degree;
        self
    }
}

fn default_weight() -> f64 {
    1.0
}

/// An edge as delivered by the backend. For tree edges `source` is the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub source: String,
    pub target: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl EdgeRecord {
    pub fn new(source: &str, target: &str, weight: f64) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            weight,
        }
    }
}

/// Nodes and tree edges within a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRequest {
    pub bounds: ViewportBounds,
    pub lod_tier: String,
    pub min_degree: u32,
    pub max_nodes: usize,
    pub offset: usize,
    pub edge_mode: EdgeMode,
    /// Cluster ids the user has hidden
    #[serde(default)]
    pub hidden_clusters: Vec<i64>,
}

/// Atomic fragment: its nodes and tree edges are applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentResponse {
    pub nodes: Vec<NodeRecord>,
    pub tree_edges: Vec<EdgeRecord>,
    pub has_more: bool,
    pub total_in_box: usize,
}

impl FragmentResponse {
    /// Append a later page, skipping nodes and edges already present.
    pub fn absorb(&mut self, page: FragmentResponse) {
        let mut seen: std::collections::HashSet<String> =
            self.nodes.iter().map(|n| n.id.clone()).collect();
        for node in page.nodes {
            if seen.insert(node.id.clone()) {
                self.nodes.push(node);
            }
        }
        let mut seen_edges: std::collections::HashSet<(String, String)> = self
            .tree_edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        for edge in page.tree_edges {
            if seen_edges.insert((edge.source.clone(), edge.target.clone())) {
                self.tree_edges.push(edge);
            }
        }
        self.has_more = page.has_more;
        self.total_in_box = self.total_in_box.max(page.total_in_box);
    }
}

/// Extra edges touching a node set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraEdgesRequest {
    pub node_ids: Vec<String>,
    pub max_edges: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// At least one extra edge touching the node was returned
    pub enriched: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraEdgesResponse {
    pub extra_edges: Vec<EdgeRecord>,
    pub node_flags: HashMap<String, NodeFlags>,
}

/// Tree context around a single node (search result focus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContextRequest {
    pub node_id: String,
    pub radius: usize,
    pub max_nodes: usize,
}

/// The backend as seen from the loader.
///
/// Implementations must make a fragment response self-contained: every
/// non-root node must come with a parent chain that is either in the same
/// response or may already be loaded on the client.
pub trait GraphBackend: Send + Sync + 'static {
    fn fetch_fragment(
        &self,
        request: FragmentRequest,
    ) -> impl Future<Output = Result<FragmentResponse, FetchError>> + Send;

    fn fetch_extra_edges(
        &self,
        request: ExtraEdgesRequest,
    ) -> impl Future<Output = Result<ExtraEdgesResponse, FetchError>> + Send;

    fn fetch_node_context(
        &self,
        request: NodeContextRequest,
    ) -> impl Future<Output = Result<FragmentResponse, FetchError>> + Send;
}
