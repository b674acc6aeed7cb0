/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Render surface boundary.
//!
//! The loader never queries the renderer. Every structural change to the
//! loaded graph is journaled as a `RenderEvent`; the embedder drains the
//! journal once per frame and forwards it to whatever draws the graph.

use euclid::default::Point2D;

/// A structural change the renderer must mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    NodeAdded {
        id: String,
        position: Point2D<f64>,
        cluster_id: i64,
        degree: u32,
    },
    NodeRemoved {
        id: String,
    },
    EdgeAdded {
        source: String,
        target: String,
        is_tree_edge: bool,
    },
    EdgeRemoved {
        source: String,
        target: String,
    },
}

/// Receiver of render events.
pub trait RenderSink {
    fn apply(&mut self, event: RenderEvent);
}

impl RenderSink for Vec<RenderEvent> {
    fn apply(&mut self, event: RenderEvent) {
        self.push(event);
    }
}

/// Counts events by kind; used by the replay CLI instead of a real canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTally {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
}

impl RenderTally {
    /// Nodes the renderer currently shows, assuming it started empty.
    pub fn visible_nodes(&self) -> usize {
        self.nodes_added.saturating_sub(self.nodes_removed)
    }

    pub fn visible_edges(&self) -> usize {
        self.edges_added.saturating_sub(self.edges_removed)
    }
}

impl RenderSink for RenderTally {
    fn apply(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::NodeAdded { .. } => self.nodes_added += 1,
            RenderEvent::NodeRemoved { .. } => self.nodes_removed += 1,
            RenderEvent::EdgeAdded { .. } => self.edges_added += 1,
            RenderEvent::EdgeRemoved { .. } => self.edges_removed += 1,
        }
    }
}
