/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Edges waiting for their far endpoint to load.

use std::collections::{HashMap, HashSet};

/// An extra edge whose owner is loaded but whose other endpoint is not.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenEdge {
    /// Loaded endpoint
    pub node_id: String,

    /// Endpoint that is not loaded yet
    pub missing_endpoint_id: String,

    pub weight: f64,

    /// The owner was the edge's source
    pub outgoing: bool,
}

impl BrokenEdge {
    /// (source, target) in the edge's original direction.
    pub fn endpoints(&self) -> (&str, &str) {
        if self.outgoing {
            (&self.node_id, &self.missing_endpoint_id)
        } else {
            (&self.missing_endpoint_id, &self.node_id)
        }
    }
}

/// Broken edges indexed both by the missing endpoint (for promotion when it
/// loads) and by the owner (for cleanup when the owner is evicted).
#[derive(Debug, Clone, Default)]
pub struct BrokenEdgeIndex {
    by_missing: HashMap<String, Vec<BrokenEdge>>,
    by_owner: HashMap<String, HashSet<String>>,
    len: usize,
}

impl BrokenEdgeIndex {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, owner: &str, missing: &str) -> bool {
        self.by_owner
            .get(owner)
            .is_some_and(|missing_ids| missing_ids.contains(missing))
    }

    /// Record a broken edge. Returns false if the pair is already recorded.
    pub fn record(&mut self, edge: BrokenEdge) -> bool {
        let owned = self.by_owner.entry(edge.node_id.clone()).or_default();
        if !owned.insert(edge.missing_endpoint_id.clone()) {
            return false;
        }
        self.by_missing
            .entry(edge.missing_endpoint_id.clone())
            .or_default()
            .push(edge);
        self.len += 1;
        true
    }

    /// Remove and return every broken edge pointing at `missing`.
    pub fn take_for_missing(&mut self, missing: &str) -> Vec<BrokenEdge> {
        let Some(edges) = self.by_missing.remove(missing) else {
            return Vec::new();
        };
        for edge in &edges {
            if let Some(owned) = self.by_owner.get_mut(&edge.node_id) {
                owned.remove(missing);
                if owned.is_empty() {
                    self.by_owner.remove(&edge.node_id);
                }
            }
        }
        self.len -= edges.len();
        edges
    }

    /// Forget every broken edge owned by `owner`. Returns how many were dropped.
    pub fn drop_owner(&mut self, owner: &str) -> usize {
        let Some(missing_ids) = self.by_owner.remove(owner) else {
            return 0;
        };
        for missing in &missing_ids {
            if let Some(edges) = self.by_missing.get_mut(missing) {
                edges.retain(|edge| edge.node_id != owner);
                if edges.is_empty() {
                    self.by_missing.remove(missing);
                }
            }
        }
        self.len -= missing_ids.len();
        missing_ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrokenEdge> {
        self.by_missing.values().flatten()
    }
}
