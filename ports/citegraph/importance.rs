/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Retention scores for eviction.

use std::collections::HashSet;

use euclid::default::Point2D;
use serde::{Deserialize, Serialize};

use crate::graph::Node;

/// Score weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight of `ln(degree + 1)`
    pub degree: f64,
    /// Weight of the distance to the viewport center, subtracted
    pub distance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            degree: 1.0,
            distance: 0.01,
        }
    }
}

/// `score = w1 * ln(degree + 1) - w2 * distance(position, center)`.
///
/// Retained nodes, roots and protected nodes (the path to the current
/// selection) score `f64::INFINITY`.
#[derive(Debug, Clone, Default)]
pub struct NodeImportanceScorer {
    weights: ScoringWeights,
    protected: HashSet<String>,
}

impl NodeImportanceScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            protected: HashSet::new(),
        }
    }

    pub fn score(&self, node: &Node, center: Point2D<f64>) -> f64 {
        if node.retained || node.is_root() || self.protected.contains(&node.id) {
            return f64::INFINITY;
        }
        let degree_term = (node.degree as f64 + 1.0).ln();
        let distance = node.position.distance_to(center);
        self.weights.degree * degree_term - self.weights.distance * distance
    }

    /// Replace the protected set.
    pub fn set_protected<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.protected = ids.into_iter().collect();
    }

    pub fn clear_protected(&mut self) {
        self.protected.clear();
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.protected.contains(id)
    }
}
