/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Spatial region cache.
//!
//! Remembers which (bounds, tier) pairs have already been fetched so that a
//! logically identical request does not hit the network again. Bounds are
//! quantized onto a grid whose cell size comes from the tier, and the loader
//! fetches the *snapped* rectangle, so every bounds that hashes to a cached
//! key is covered by data that was actually loaded.
//!
//! Expiry is lazy: stale entries stay in the map until `sweep` or FIFO
//! eviction removes them, but lookups treat them as absent.

use std::time::Duration;

use euclid::default::Point2D;
use indexmap::IndexMap;
use log::debug;
use tokio::time::Instant;

use crate::graph::spatial::cell_coord;
use crate::input::ViewportBounds;
use crate::lod::LodTier;

/// Quantized cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub tier: String,
    pub min_cell_x: i64,
    pub min_cell_y: i64,
    pub max_cell_x: i64,
    pub max_cell_y: i64,
}

/// A region whose full fragment has been merged.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRegion {
    /// Snapped bounds that were fetched
    pub bounds: ViewportBounds,
    pub lod_tier: String,
    pub spatial_hash: RegionKey,
    pub timestamp: Instant,
    pub node_count: usize,
}

/// Observability counters. Nothing reads these for control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub expired_lookups: u64,
    pub evictions: u64,
    pub swept: u64,
    pub invalidated: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct SpatialRegionCache {
    /// Insertion order is FIFO order
    regions: IndexMap<RegionKey, CachedRegion>,
    ttl: Duration,
    max_regions: usize,
    stats: CacheStats,
}

impl SpatialRegionCache {
    pub fn new(ttl: Duration, max_regions: usize) -> Self {
        Self {
            regions: IndexMap::new(),
            ttl,
            max_regions: max_regions.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Quantize bounds for a tier. Min corners floor, max corners ceil.
    pub fn key(bounds: &ViewportBounds, tier: &LodTier) -> RegionKey {
        let cell = tier.cell_size;
        RegionKey {
            tier: tier.name.clone(),
            min_cell_x: cell_coord(bounds.min_x, cell),
            min_cell_y: cell_coord(bounds.min_y, cell),
            max_cell_x: ceil_coord(bounds.max_x, cell),
            max_cell_y: ceil_coord(bounds.max_y, cell),
        }
    }

    /// The grid-aligned rectangle for `bounds`' key. Always covers `bounds`.
    pub fn snap(bounds: &ViewportBounds, tier: &LodTier) -> ViewportBounds {
        let key = Self::key(bounds, tier);
        let cell = tier.cell_size;
        ViewportBounds {
            min_x: key.min_cell_x as f64 * cell,
            max_x: key.max_cell_x as f64 * cell,
            min_y: key.min_cell_y as f64 * cell,
            max_y: key.max_cell_y as f64 * cell,
            ratio: bounds.ratio,
        }
    }

    /// True iff a non-expired region with the same key and tier exists.
    pub fn is_cached(&mut self, bounds: &ViewportBounds, tier: &LodTier, now: Instant) -> bool {
        if !bounds.is_valid() {
            self.stats.misses += 1;
            return false;
        }
        let key = Self::key(bounds, tier);
        let hit = match self.regions.get(&key) {
            Some(region) if region.lod_tier != tier.name => false,
            Some(region) if self.is_expired(region, now) => {
                self.stats.expired_lookups += 1;
                false
            },
            Some(_) => true,
            None => false,
        };
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        hit
    }

    /// Record that a region's fragment has been merged.
    ///
    /// Called on every successful merge, including merges that added no new
    /// nodes. Re-marking a key refreshes its timestamp and FIFO position.
    pub fn mark_loaded(
        &mut self,
        bounds: &ViewportBounds,
        tier: &LodTier,
        node_count: usize,
        now: Instant,
    ) {
        if !bounds.is_valid() {
            return;
        }
        let key = Self::key(bounds, tier);
        self.regions.shift_remove(&key);
        self.regions.insert(
            key.clone(),
            CachedRegion {
                bounds: Self::snap(bounds, tier),
                lod_tier: tier.name.clone(),
                spatial_hash: key,
                timestamp: now,
                node_count,
            },
        );
        self.stats.inserts += 1;

        while self.regions.len() > self.max_regions {
            if let Some((evicted, _)) = self.regions.shift_remove_index(0) {
                debug!("Region cache full, dropping oldest region {evicted:?}");
                self.stats.evictions += 1;
            }
        }
    }

    /// Drop every expired region. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.regions.len();
        let ttl = self.ttl;
        self.regions
            .retain(|_, region| now.saturating_duration_since(region.timestamp) < ttl);
        let removed = before - self.regions.len();
        self.stats.swept += removed as u64;
        removed
    }

    /// Drop every region whose bounds contain `point`, whatever its tier.
    ///
    /// Called for each evicted node: a region that lost data must be fetched
    /// again rather than reported as cached.
    pub fn invalidate_containing(&mut self, point: Point2D<f64>) -> usize {
        let before = self.regions.len();
        self.regions
            .retain(|_, region| !region.bounds.contains(point));
        let removed = before - self.regions.len();
        self.stats.invalidated += removed as u64;
        removed
    }

    /// Forget every region (e.g. after a filter change).
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Physical entry count, including not-yet-swept expired regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn regions(&self) -> impl Iterator<Item = &CachedRegion> {
        self.regions.values()
    }

    fn is_expired(&self, region: &CachedRegion, now: Instant) -> bool {
        now.saturating_duration_since(region.timestamp) >= self.ttl
    }
}

fn ceil_coord(value: f64, cell_size: f64) -> i64 {
    (value / cell_size).ceil() as i64
}
