/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-memory citation graph served by the local backend.
//!
//! Loaded from JSON (`{ nodes, treeEdges, extraEdges }`) or generated. Box
//! queries go through a spatial grid; every fragment is closed under the
//! canonical parent chain so the client can always anchor it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::f64::consts::TAU;
use std::path::Path;

use euclid::default::Point2D;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::pool::QueryContext;
use crate::error::{DatasetError, QueryError};
use crate::fetch::{
    EdgeRecord, ExtraEdgesRequest, ExtraEdgesResponse, FragmentRequest, FragmentResponse,
    NodeContextRequest, NodeFlags, NodeRecord,
};
use crate::graph::spatial::SpatialGrid;
use crate::input::ViewportBounds;
use crate::search::fuzzy_rank;

/// On-disk dataset layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFile {
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub tree_edges: Vec<EdgeRecord>,
    #[serde(default)]
    pub extra_edges: Vec<EdgeRecord>,
}

/// Calls `checkpoint` every `interval` steps of a scan.
struct Checkpoints<'a> {
    context: &'a QueryContext,
    interval: usize,
    steps: usize,
}

impl<'a> Checkpoints<'a> {
    fn new(context: &'a QueryContext, interval: usize) -> Self {
        Self {
            context,
            interval: interval.max(1),
            steps: 0,
        }
    }

    fn step(&mut self) -> Result<(), QueryError> {
        self.steps += 1;
        if self.steps % self.interval == 0 {
            self.context.checkpoint()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GraphDataset {
    nodes: Vec<NodeRecord>,
    index: HashMap<String, usize>,
    grid: SpatialGrid<usize>,
    /// Parents one level up, in `parent_ids` order; the first is canonical
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    /// (parent, child) -> weight
    tree_weights: HashMap<(usize, usize), f64>,
    extra_edges: Vec<EdgeRecord>,
    /// node -> indices into `extra_edges`
    extra_by_node: Vec<Vec<usize>>,
    bounds: Option<ViewportBounds>,
    checkpoint_interval: usize,
}

impl GraphDataset {
    /// Read a JSON dataset.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: DatasetFile = serde_json::from_str(&contents)?;
        let dataset = Self::from_file(file)?;
        info!(
            "Loaded dataset {} with {} node(s), {} extra edge(s)",
            path.display(),
            dataset.len(),
            dataset.extra_edges.len()
        );
        Ok(dataset)
    }

    /// Index a dataset. Every non-root node needs a parent one level up.
    pub fn from_file(file: DatasetFile) -> Result<Self, DatasetError> {
        let DatasetFile {
            nodes,
            tree_edges,
            extra_edges,
        } = file;

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(DatasetError::DuplicateNode(node.id.clone()));
            }
        }
        if !nodes.iter().any(|node| node.tree_level == 0) {
            return Err(DatasetError::NoRoot);
        }

        let mut parents = vec![Vec::new(); nodes.len()];
        let mut children = vec![Vec::new(); nodes.len()];
        let mut tree_weights = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if node.tree_level == 0 {
                continue;
            }
            for parent_id in &node.parent_ids {
                let Some(&p) = index.get(parent_id) else {
                    continue;
                };
                if nodes[p].tree_level + 1 == node.tree_level && !parents[i].contains(&p) {
                    parents[i].push(p);
                    children[p].push(i);
                    tree_weights.insert((p, i), 1.0);
                }
            }
            if parents[i].is_empty() {
                return Err(DatasetError::Orphan(node.id.clone()));
            }
        }
        for edge in &tree_edges {
            if let (Some(&p), Some(&c)) = (index.get(&edge.source), index.get(&edge.target)) {
                if let Some(weight) = tree_weights.get_mut(&(p, c)) {
                    *weight = edge.weight;
                }
            }
        }

        let mut kept_extra = Vec::with_capacity(extra_edges.len());
        let mut extra_by_node = vec![Vec::new(); nodes.len()];
        for edge in extra_edges {
            let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue;
            };
            if s == t || tree_weights.contains_key(&(s, t)) || tree_weights.contains_key(&(t, s))
            {
                continue;
            }
            extra_by_node[s].push(kept_extra.len());
            extra_by_node[t].push(kept_extra.len());
            kept_extra.push(edge);
        }

        let bounds = bounds_of(&nodes);
        let cell_size = bounds
            .map(|b| (b.width().max(b.height()) / 128.0).max(1.0))
            .unwrap_or(1.0);
        let mut grid = SpatialGrid::new(cell_size);
        for (i, node) in nodes.iter().enumerate() {
            grid.insert(i, Point2D::new(node.x, node.y));
        }

        debug!(
            "Indexed {} node(s) in a grid of {cell_size:.1} world units",
            nodes.len()
        );
        Ok(Self {
            nodes,
            index,
            grid,
            parents,
            children,
            tree_weights,
            extra_edges: kept_extra,
            extra_by_node,
            bounds,
            checkpoint_interval: 256,
        })
    }

    /// Deterministic random citation forest.
    ///
    /// One root at the origin; each later node picks a random earlier node as
    /// its parent and is placed around it, closer for deeper levels. About
    /// one node in twenty gets a second parent on the same level. Extra edges
    /// are random citations to earlier nodes.
    pub fn synthetic(count: usize, seed: u64) -> Self {
        let count = count.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes: Vec<NodeRecord> = Vec::with_capacity(count);
        let mut by_level: Vec<Vec<usize>> = vec![vec![0]];
        let mut tree_edges = Vec::with_capacity(count);

        let mut root = NodeRecord::new("n0", 0.0, 0.0, 0, &[]);
        root.label = "Paper 0".to_string();
        root.degree = 1000;
        nodes.push(root);

        for i in 1..count {
            let parent = rng.gen_range(0..i);
            let level = nodes[parent].tree_level + 1;
            let radius = 4000.0 / level as f64 * rng.gen_range(0.5..1.5);
            let angle = rng.gen_range(0.0..TAU);

            let mut parent_ids = vec![nodes[parent].id.clone()];
            let peers = &by_level[level as usize - 1];
            if peers.len() > 1 && rng.gen_bool(0.05) {
                let other = peers[rng.gen_range(0..peers.len())];
                if other != parent {
                    parent_ids.push(nodes[other].id.clone());
                }
            }

            let id = format!("n{i}");
            let anchor = &nodes[parent];
            let cluster_id = if level == 1 {
                (i % 12) as i64
            } else {
                anchor.cluster_id
            };
            let record = NodeRecord {
                label: format!("Paper {i}"),
                x: anchor.x + radius * angle.cos(),
                y: anchor.y + radius * angle.sin(),
                degree: (rng.r#gen::<f64>().powi(3) * 500.0) as u32,
                cluster_id,
                tree_level: level,
                parent_ids,
                id: id.clone(),
            };
            tree_edges.push(EdgeRecord::new(&anchor.id, &id, 1.0));
            nodes.push(record);

            if by_level.len() <= level as usize {
                by_level.push(Vec::new());
            }
            by_level[level as usize].push(i);
        }

        let mut extra_edges = Vec::with_capacity(count * 2);
        let mut seen = HashSet::new();
        for i in 1..count {
            for _ in 0..rng.gen_range(0..4) {
                let target = rng.gen_range(0..i);
                if seen.insert((i, target)) {
                    extra_edges.push(EdgeRecord::new(
                        &nodes[i].id,
                        &nodes[target].id,
                        rng.gen_range(0.1..1.0),
                    ));
                }
            }
        }

        let file = DatasetFile {
            nodes,
            tree_edges,
            extra_edges,
        };
        match Self::from_file(file) {
            Ok(dataset) => dataset,
            // Generated data always has a root and anchored parents.
            Err(err) => unreachable!("synthetic dataset is well formed: {err}"),
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Bounding box of every node position.
    pub fn bounds(&self) -> Option<ViewportBounds> {
        self.bounds
    }

    pub fn roots(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter().filter(|node| node.tree_level == 0)
    }

    /// Nodes inside the request box, densest first, plus their ancestors.
    pub fn nodes_in_box(
        &self,
        request: &FragmentRequest,
        context: &QueryContext,
    ) -> Result<FragmentResponse, QueryError> {
        if !request.bounds.is_valid() {
            return Err(QueryError::Invalid("bounds must be finite and ordered".into()));
        }
        let mut checkpoints = Checkpoints::new(context, self.checkpoint_interval);
        let hidden: HashSet<i64> = request.hidden_clusters.iter().copied().collect();

        let mut matches = Vec::new();
        for i in self.grid.query_box(&request.bounds) {
            checkpoints.step()?;
            let node = &self.nodes[i];
            if request.bounds.contains(Point2D::new(node.x, node.y)) &&
                node.degree >= request.min_degree &&
                !hidden.contains(&node.cluster_id)
            {
                matches.push(i);
            }
        }
        matches.sort_by(|&a, &b| {
            self.nodes[b]
                .degree
                .cmp(&self.nodes[a].degree)
                .then_with(|| self.nodes[a].id.cmp(&self.nodes[b].id))
        });

        let total_in_box = matches.len();
        let end = request
            .offset
            .saturating_add(request.max_nodes)
            .min(total_in_box);
        let page: Vec<usize> = matches
            .get(request.offset.min(total_in_box)..end)
            .unwrap_or_default()
            .to_vec();
        let has_more = end < total_in_box;

        let members = self.with_ancestors(page, &mut checkpoints)?;
        Ok(FragmentResponse {
            tree_edges: if request.edge_mode.includes_tree() {
                self.tree_edges_among(&members)
            } else {
                Vec::new()
            },
            nodes: members.iter().map(|&i| self.nodes[i].clone()).collect(),
            has_more,
            total_in_box,
        })
    }

    /// Extra edges touching the requested nodes, heaviest first.
    pub fn extra_edges(
        &self,
        request: &ExtraEdgesRequest,
        context: &QueryContext,
    ) -> Result<ExtraEdgesResponse, QueryError> {
        let mut checkpoints = Checkpoints::new(context, self.checkpoint_interval);
        let mut edge_ids = HashSet::new();
        for id in &request.node_ids {
            if let Some(&i) = self.index.get(id) {
                for &edge in &self.extra_by_node[i] {
                    checkpoints.step()?;
                    edge_ids.insert(edge);
                }
            }
        }

        let mut edges: Vec<&EdgeRecord> = edge_ids.into_iter().map(|e| &self.extra_edges[e]).collect();
        edges.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.target.cmp(&b.target))
        });
        edges.truncate(request.max_edges);

        let mut node_flags: HashMap<String, NodeFlags> = request
            .node_ids
            .iter()
            .map(|id| (id.clone(), NodeFlags::default()))
            .collect();
        for edge in &edges {
            for endpoint in [&edge.source, &edge.target] {
                if let Some(flags) = node_flags.get_mut(endpoint) {
                    flags.enriched = true;
                }
            }
        }

        Ok(ExtraEdgesResponse {
            extra_edges: edges.into_iter().cloned().collect(),
            node_flags,
        })
    }

    /// A node, its tree neighbourhood within `radius`, and the ancestors of
    /// everything included.
    pub fn node_context(
        &self,
        request: &NodeContextRequest,
        context: &QueryContext,
    ) -> Result<FragmentResponse, QueryError> {
        let Some(&start) = self.index.get(&request.node_id) else {
            return Err(QueryError::NotFound(request.node_id.clone()));
        };
        let mut checkpoints = Checkpoints::new(context, self.checkpoint_interval);
        let limit = request.max_nodes.max(1);

        let mut seen = HashSet::from([start]);
        let mut around = vec![start];
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((i, hops)) = queue.pop_front() {
            if hops == request.radius {
                continue;
            }
            for &next in self.parents[i].iter().chain(&self.children[i]) {
                checkpoints.step()?;
                if around.len() >= limit {
                    break;
                }
                if seen.insert(next) {
                    around.push(next);
                    queue.push_back((next, hops + 1));
                }
            }
        }

        let members = self.with_ancestors(around, &mut checkpoints)?;
        let total_in_box = members.len();
        Ok(FragmentResponse {
            tree_edges: self.tree_edges_among(&members),
            nodes: members.iter().map(|&i| self.nodes[i].clone()).collect(),
            has_more: false,
            total_in_box,
        })
    }

    /// Best matches for `query` by label or id.
    pub fn search(&self, query: &str, limit: usize) -> Vec<NodeRecord> {
        let ranked = fuzzy_rank(
            self.nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (i, format!("{} {}", node.label, node.id))),
            query,
        );
        ranked
            .into_iter()
            .take(limit)
            .map(|i| self.nodes[i].clone())
            .collect()
    }

    /// `seeds` followed by their canonical ancestors, without duplicates.
    fn with_ancestors(
        &self,
        seeds: Vec<usize>,
        checkpoints: &mut Checkpoints<'_>,
    ) -> Result<Vec<usize>, QueryError> {
        let mut seen: HashSet<usize> = seeds.iter().copied().collect();
        let mut members = seeds;
        let mut cursor = 0;
        while cursor < members.len() {
            checkpoints.step()?;
            if let Some(&parent) = self.parents[members[cursor]].first() {
                if seen.insert(parent) {
                    members.push(parent);
                }
            }
            cursor += 1;
        }
        Ok(members)
    }

    fn tree_edges_among(&self, members: &[usize]) -> Vec<EdgeRecord> {
        let set: HashSet<usize> = members.iter().copied().collect();
        let mut edges = Vec::new();
        for &child in members {
            for &parent in &self.parents[child] {
                if set.contains(&parent) {
                    let weight = self.tree_weights.get(&(parent, child)).copied().unwrap_or(1.0);
                    edges.push(EdgeRecord::new(
                        &self.nodes[parent].id,
                        &self.nodes[child].id,
                        weight,
                    ));
                }
            }
        }
        edges
    }
}

fn bounds_of(nodes: &[NodeRecord]) -> Option<ViewportBounds> {
    let first = nodes.first()?;
    let mut bounds = ViewportBounds::new(first.x, first.x, first.y, first.y, 1.0);
    for node in nodes {
        bounds.min_x = bounds.min_x.min(node.x);
        bounds.max_x = bounds.max_x.max(node.x);
        bounds.min_y = bounds.min_y.min(node.y);
        bounds.max_y = bounds.max_y.max(node.y);
    }
    Some(bounds)
}
