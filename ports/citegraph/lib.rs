/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Viewport-driven incremental loader for large spatial citation graphs.
//!
//! The loader keeps a bounded working set of nodes and edges on the client
//! while the user pans and zooms, and guarantees that every loaded node stays
//! connected to a root through tree edges.
//!
//! Pipeline for one viewport change:
//! - `input`: camera state to debounced world bounds with a generation counter
//! - `lod`: zoom ratio to detail tier
//! - `cache`: skip regions already satisfied at the same tier
//! - `fetch`: cancellable, prioritized backend requests
//! - `tree`: atomic, connectivity-checked fragment merge
//! - `eviction`: enforce node/edge caps without breaking the backbone
//!
//! `orchestrator::GraphLoadOrchestrator` sequences all of the above.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod fetch;
pub mod graph;
pub mod importance;
pub mod input;
pub mod lod;
pub mod orchestrator;
pub mod render;
pub mod search;
pub mod tree;

pub use config::EngineConfig;
pub use error::{ConnectivityViolation, FetchError, LoadError};
pub use orchestrator::{GraphLoadOrchestrator, LoaderContext};
