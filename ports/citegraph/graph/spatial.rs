/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Uniform spatial hash grid.
//!
//! Used by the backend dataset to answer box queries without scanning every
//! node, and by the region cache to quantize viewport bounds.

use std::collections::HashMap;

use euclid::default::Point2D;

use crate::input::ViewportBounds;

/// Grid cell index of a coordinate for the given cell size.
pub fn cell_coord(value: f64, cell_size: f64) -> i64 {
    (value / cell_size).floor() as i64
}

/// Spatial hash grid over arbitrary copyable keys
#[derive(Debug, Clone)]
pub struct SpatialGrid<K> {
    /// Cell size in world units
    cell_size: f64,

    /// Grid cells: (x, y) -> keys whose position falls in that cell
    cells: HashMap<(i64, i64), Vec<K>>,

    len: usize,
}

impl<K: Copy> SpatialGrid<K> {
    /// Create a new spatial grid with the given cell size
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: cell_size.max(f64::EPSILON),
            cells: HashMap::new(),
            len: 0,
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear all cells
    pub fn clear(&mut self) {
        self.cells.clear();
        self.len = 0;
    }

    /// Insert a key at a position
    pub fn insert(&mut self, key: K, position: Point2D<f64>) {
        let cell = self.position_to_cell(position);
        self.cells.entry(cell).or_default().push(key);
        self.len += 1;
    }

    /// Keys in every cell overlapping `bounds`.
    ///
    /// This is a superset of the keys inside `bounds`; callers filter on exact
    /// position. Falls back to scanning occupied cells when the box spans more
    /// cells than are occupied.
    pub fn query_box(&self, bounds: &ViewportBounds) -> Vec<K> {
        if !bounds.is_valid() {
            return Vec::new();
        }
        let min_cx = cell_coord(bounds.min_x, self.cell_size);
        let max_cx = cell_coord(bounds.max_x, self.cell_size);
        let min_cy = cell_coord(bounds.min_y, self.cell_size);
        let max_cy = cell_coord(bounds.max_y, self.cell_size);

        let span = max_cx
            .saturating_sub(min_cx)
            .saturating_add(1)
            .saturating_mul(max_cy.saturating_sub(min_cy).saturating_add(1));
        let mut found = Vec::new();
        if span > self.cells.len() as i64 {
            for (&(cx, cy), keys) in &self.cells {
                if (min_cx..=max_cx).contains(&cx) && (min_cy..=max_cy).contains(&cy) {
                    found.extend_from_slice(keys);
                }
            }
        } else {
            for cx in min_cx..=max_cx {
                for cy in min_cy..=max_cy {
                    if let Some(keys) = self.cells.get(&(cx, cy)) {
                        found.extend_from_slice(keys);
                    }
                }
            }
        }
        found
    }

    /// Convert a position to a grid cell coordinate
    fn position_to_cell(&self, position: Point2D<f64>) -> (i64, i64) {
        (
            cell_coord(position.x, self.cell_size),
            cell_coord(position.y, self.cell_size),
        )
    }
}
