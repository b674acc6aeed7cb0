/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Level-of-detail policy: zoom ratio to detail tier.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which edges a tier loads alongside its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeMode {
    /// Nodes only
    None,

    /// Tree backbone only
    Tree,

    /// Backbone plus extra edges for newly loaded nodes
    TreePlusExtra,

    /// Backbone plus extra edges for every loaded node in view
    All,
}

impl EdgeMode {
    pub fn includes_tree(self) -> bool {
        !matches!(self, EdgeMode::None)
    }

    pub fn includes_extra(self) -> bool {
        matches!(self, EdgeMode::TreePlusExtra | EdgeMode::All)
    }
}

/// One detail tier.
///
/// A tier applies from `min_ratio` (inclusive) up to the next tier's
/// `min_ratio` (exclusive). Larger ratios are more zoomed out, so a ratio that
/// sits exactly on a boundary belongs to the coarser tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodTier {
    pub name: String,

    /// Zoom ratio at which this tier starts
    pub min_ratio: f64,

    /// Node budget for one fragment request
    pub max_nodes: usize,

    /// Minimum degree (citation count) of nodes fetched at this tier
    pub min_degree: u32,

    pub edge_mode: EdgeMode,

    /// Extra-edge budget for one enrichment request
    pub max_extra_edges: usize,

    /// Region cache grid cell size in world units; coarser tiers use larger cells
    pub cell_size: f64,
}

impl LodTier {
    pub fn new(
        name: &str,
        min_ratio: f64,
        max_nodes: usize,
        min_degree: u32,
        edge_mode: EdgeMode,
        max_extra_edges: usize,
        cell_size: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_ratio,
            max_nodes,
            min_degree,
            edge_mode,
            max_extra_edges,
            cell_size,
        }
    }
}

/// Default tiers, finest first.
pub fn default_tiers() -> Vec<LodTier> {
    vec![
        LodTier::new("detail", 0.0, 5000, 0, EdgeMode::All, 4000, 250.0),
        LodTier::new("medium", 0.5, 2500, 5, EdgeMode::TreePlusExtra, 1500, 1000.0),
        LodTier::new("overview", 2.0, 1000, 10, EdgeMode::Tree, 0, 4000.0),
        LodTier::new("galaxy", 8.0, 500, 20, EdgeMode::None, 0, 16000.0),
    ]
}

/// Maps zoom ratios to tiers. Pure and deterministic.
#[derive(Debug, Clone)]
pub struct LodPolicy {
    tiers: Vec<LodTier>,
}

impl LodPolicy {
    /// Build a policy, validating that tiers are non-empty, start at ratio 0
    /// and are strictly ascending.
    pub fn new(tiers: Vec<LodTier>) -> Result<Self, ConfigError> {
        validate_tiers(&tiers)?;
        Ok(Self { tiers })
    }

    /// Tier for a zoom ratio. Non-finite or non-positive ratios map to the
    /// finest tier.
    pub fn tier_for(&self, ratio: f64) -> &LodTier {
        let index = self.rank_for(ratio);
        &self.tiers[index]
    }

    /// Coarseness rank of the tier for `ratio`; 0 is the finest.
    pub fn rank_for(&self, ratio: f64) -> usize {
        if !ratio.is_finite() || ratio <= 0.0 {
            return 0;
        }
        self.tiers
            .iter()
            .rposition(|tier| ratio >= tier.min_ratio)
            .unwrap_or(0)
    }

    pub fn tiers(&self) -> &[LodTier] {
        &self.tiers
    }

    /// Look up a tier by name.
    pub fn tier_named(&self, name: &str) -> Option<&LodTier> {
        self.tiers.iter().find(|tier| tier.name == name)
    }
}

impl Default for LodPolicy {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

pub(crate) fn validate_tiers(tiers: &[LodTier]) -> Result<(), ConfigError> {
    let Some(first) = tiers.first() else {
        return Err(ConfigError::Invalid("at least one LOD tier is required".into()));
    };
    if first.min_ratio != 0.0 {
        return Err(ConfigError::Invalid(format!(
            "first LOD tier '{}' must start at ratio 0",
            first.name
        )));
    }
    for pair in tiers.windows(2) {
        if !(pair[1].min_ratio > pair[0].min_ratio) {
            return Err(ConfigError::Invalid(format!(
                "LOD tier '{}' must start above '{}'",
                pair[1].name, pair[0].name
            )));
        }
    }
    for tier in tiers {
        if !(tier.cell_size.is_finite() && tier.cell_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "LOD tier '{}' needs a positive cell size",
                tier.name
            )));
        }
        if tier.max_nodes == 0 {
            return Err(ConfigError::Invalid(format!(
                "LOD tier '{}' needs a non-zero node budget",
                tier.name
            )));
        }
    }
    let mut names: Vec<&str> = tiers.iter().map(|tier| tier.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != tiers.len() {
        return Err(ConfigError::Invalid("LOD tier names must be unique".into()));
    }
    Ok(())
}
