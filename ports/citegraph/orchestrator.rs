/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Sequences one viewport change from camera to merged, capped graph.
//!
//! State only changes in the sync methods. A load is split into
//! `prepare` (sync), `PendingFragment::fetch` (async, owns everything it
//! needs) and `commit` (sync), so a driver can drop an in-flight fetch at
//! any time and start the next generation. `load_viewport` runs the whole
//! sequence for drivers that do not need that control.

use std::collections::BTreeSet;
use std::sync::Arc;

use euclid::default::Point2D;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::cache::{CacheStats, SpatialRegionCache};
use crate::config::{EngineConfig, LoaderStrategy};
use crate::error::{ConfigError, FetchError, LoadError};
use crate::eviction::{EvictionReport, EvictionStats, MemoryEvictionManager};
use crate::fetch::coordinator::{Dispatcher, FetchFailure, RequestCoordinator, Ticket};
use crate::fetch::{
    ExtraEdgesRequest, ExtraEdgesResponse, FragmentRequest, FragmentResponse, GraphBackend,
    NodeContextRequest,
};
use crate::graph::LoadedGraph;
use crate::importance::NodeImportanceScorer;
use crate::input::{Camera, ViewportBounds, ViewportTracker, ViewportUpdate};
use crate::lod::{EdgeMode, LodPolicy, LodTier};
use crate::render::{RenderEvent, RenderSink};
use crate::search::search_loaded;
use crate::tree::{MergeReport, TreeConnectivityManager};

/// Loader-wide filter state handed to the orchestrator at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderContext {
    /// Cluster ids excluded from future fragment requests
    hidden_clusters: BTreeSet<i64>,
}

impl LoaderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hidden_clusters(clusters: impl IntoIterator<Item = i64>) -> Self {
        Self {
            hidden_clusters: clusters.into_iter().collect(),
        }
    }

    pub fn hidden_clusters(&self) -> Vec<i64> {
        self.hidden_clusters.iter().copied().collect()
    }

    pub fn is_hidden(&self, cluster_id: i64) -> bool {
        self.hidden_clusters.contains(&cluster_id)
    }

    /// Replace the hidden set. Returns whether it changed.
    fn set_hidden_clusters(&mut self, clusters: impl IntoIterator<Item = i64>) -> bool {
        let clusters: BTreeSet<i64> = clusters.into_iter().collect();
        if clusters == self.hidden_clusters {
            return false;
        }
        self.hidden_clusters = clusters;
        true
    }
}

/// Degraded-state signal for persistent mandatory fetch failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LoadHealth {
    #[default]
    Healthy,
    Degraded {
        consecutive_failures: u32,
        last_error: LoadError,
    },
}

impl LoadHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, LoadHealth::Healthy)
    }
}

/// Result of one viewport load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    /// Request generation the load ran under
    pub generation: u64,

    /// Generation of the viewport update that triggered it
    pub viewport_generation: u64,

    pub tier: LodTier,

    /// Grid-aligned bounds that were fetched (or found cached)
    pub bounds: ViewportBounds,

    /// Served from the region cache; nothing was fetched
    pub cached: bool,

    /// Fragment pages fetched
    pub pages: usize,

    pub merge: MergeReport,
    pub eviction: EvictionReport,

    /// Extra edges merged by enrichment, if it ran and succeeded
    pub enrichment: Option<MergeReport>,
}

impl LoadOutcome {
    fn cached(ticket: &Ticket, update: &ViewportUpdate, tier: LodTier, bounds: ViewportBounds) -> Self {
        Self {
            generation: ticket.generation(),
            viewport_generation: update.generation,
            tier,
            bounds,
            cached: true,
            pages: 0,
            merge: MergeReport::default(),
            eviction: EvictionReport::default(),
            enrichment: None,
        }
    }
}

/// What `prepare` decided.
#[derive(Debug)]
pub enum LoadStep<B> {
    Cached(LoadOutcome),
    Fetch(PendingFragment<B>),
}

/// A fragment fetch that has been planned but not started.
#[derive(Debug)]
pub struct PendingFragment<B> {
    ticket: Ticket,
    dispatcher: Dispatcher<B>,
    request: FragmentRequest,
    max_pages: usize,
    update: ViewportUpdate,
    tier: LodTier,
}

impl<B: GraphBackend> PendingFragment<B> {
    pub fn generation(&self) -> u64 {
        self.ticket.generation()
    }

    pub fn request(&self) -> &FragmentRequest {
        &self.request
    }

    /// Fetch the fragment, following `has_more` pages up to the strategy's
    /// page limit. A failed page fails the whole fragment.
    pub async fn fetch(self) -> FetchedFragment {
        let PendingFragment {
            ticket,
            dispatcher,
            mut request,
            max_pages,
            update,
            tier,
        } = self;

        let mut pages = 1;
        let mut result = dispatcher.fetch_fragment(&ticket, request.clone()).await;
        while pages < max_pages && matches!(&result, Ok(response) if response.has_more) {
            request.offset += request.max_nodes;
            pages += 1;
            let page = dispatcher.fetch_fragment(&ticket, request.clone()).await;
            result = result.and_then(|mut response| {
                page.map(|page| {
                    response.absorb(page);
                    response
                })
            });
        }

        FetchedFragment {
            ticket,
            bounds: request.bounds,
            update,
            tier,
            pages,
            result,
        }
    }
}

/// A finished fragment fetch, ready for `commit`.
#[derive(Debug)]
pub struct FetchedFragment {
    ticket: Ticket,
    /// Grid-aligned bounds that were fetched
    bounds: ViewportBounds,
    update: ViewportUpdate,
    tier: LodTier,
    pages: usize,
    result: Result<FragmentResponse, FetchFailure>,
}

impl FetchedFragment {
    pub fn generation(&self) -> u64 {
        self.ticket.generation()
    }
}

/// A best-effort extra-edge fetch for a committed load.
#[derive(Debug)]
pub struct PendingEnrichment<B> {
    ticket: Ticket,
    dispatcher: Dispatcher<B>,
    request: ExtraEdgesRequest,
}

impl<B: GraphBackend> PendingEnrichment<B> {
    pub fn request(&self) -> &ExtraEdgesRequest {
        &self.request
    }

    pub async fn fetch(self) -> FetchedEnrichment {
        let result = self
            .dispatcher
            .fetch_extra_edges(&self.ticket, self.request)
            .await;
        FetchedEnrichment {
            ticket: self.ticket,
            result,
        }
    }
}

#[derive(Debug)]
pub struct FetchedEnrichment {
    ticket: Ticket,
    result: Result<ExtraEdgesResponse, FetchError>,
}

/// Snapshot of loader counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoaderStats {
    pub nodes: usize,
    pub edges: usize,
    pub tree_edges: usize,
    pub broken_edges: usize,
    pub generation: u64,
    pub loads: u64,
    pub cached_loads: u64,
    pub failed_loads: u64,
    pub cache: CacheStats,
    pub eviction: EvictionStats,
}

/// Drives viewport changes through tier selection, the region cache, the
/// backend, the connectivity gate and eviction.
pub struct GraphLoadOrchestrator<B> {
    config: Arc<EngineConfig>,
    context: LoaderContext,
    lod: LodPolicy,
    tracker: ViewportTracker,

    /// Last camera seen, for forced reloads
    camera: Camera,

    cache: SpatialRegionCache,
    coordinator: RequestCoordinator<B>,
    tree: TreeConnectivityManager,
    scorer: NodeImportanceScorer,
    eviction: MemoryEvictionManager,

    /// Currently selected node; its ancestor path is protected from eviction
    selected: Option<String>,

    health: LoadHealth,
    loads: u64,
    cached_loads: u64,
    failed_loads: u64,
}

impl<B: GraphBackend> GraphLoadOrchestrator<B> {
    pub fn new(
        config: Arc<EngineConfig>,
        backend: Arc<B>,
        context: LoaderContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let lod = LodPolicy::new(config.lod.tiers.clone())?;
        let tracker = ViewportTracker::new(config.debounce(), config.viewport.world_units_per_pixel);
        let cache = SpatialRegionCache::new(config.cache_ttl(), config.cache.max_regions);
        let coordinator = RequestCoordinator::new(
            backend,
            config.fetch.retry_policy(),
            config.fetch.extra_edges_timeout(),
        );
        let scorer = NodeImportanceScorer::new(config.scoring);
        info!(
            "Loader ready: {} tier(s), strategy {:?}, caps {} nodes / {} edges",
            lod.tiers().len(),
            config.strategy,
            config.memory.max_nodes,
            config.memory.max_edges
        );

        Ok(Self {
            config,
            context,
            lod,
            tracker,
            camera: Camera::default(),
            cache,
            coordinator,
            tree: TreeConnectivityManager::new(),
            scorer,
            eviction: MemoryEvictionManager::new(),
            selected: None,
            health: LoadHealth::Healthy,
            loads: 0,
            cached_loads: 0,
            failed_loads: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &LoaderContext {
        &self.context
    }

    pub fn strategy(&self) -> LoaderStrategy {
        self.config.strategy
    }

    pub fn lod(&self) -> &LodPolicy {
        &self.lod
    }

    pub fn graph(&self) -> &LoadedGraph {
        self.tree.graph()
    }

    pub fn tree(&self) -> &TreeConnectivityManager {
        &self.tree
    }

    pub fn cache(&self) -> &SpatialRegionCache {
        &self.cache
    }

    pub fn health(&self) -> &LoadHealth {
        &self.health
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn stats(&self) -> LoaderStats {
        let graph = self.tree.graph();
        LoaderStats {
            nodes: graph.node_count(),
            edges: graph.edge_count(),
            tree_edges: graph.tree_edge_count(),
            broken_edges: self.tree.broken_edges().len(),
            generation: self.coordinator.current_generation(),
            loads: self.loads,
            cached_loads: self.cached_loads,
            failed_loads: self.failed_loads,
            cache: self.cache.stats(),
            eviction: self.eviction.stats(),
        }
    }

    /// Feed a camera sample into the debouncer.
    pub fn observe_camera(&mut self, camera: Camera, now: Instant) {
        self.camera = camera;
        self.tracker.observe(camera, now);
    }

    /// A debounced viewport update, if one is due.
    pub fn poll_viewport(&mut self, now: Instant) -> Option<ViewportUpdate> {
        self.tracker.poll(now)
    }

    pub fn next_viewport_deadline(&self) -> Option<Instant> {
        self.tracker.next_deadline()
    }

    /// Emit an update for the last camera right away (initial load, filter
    /// change).
    pub fn force_viewport(&mut self, now: Instant) -> ViewportUpdate {
        self.tracker.force_emit(self.camera, now)
    }

    /// Start a new generation for `update` and decide whether it needs a
    /// fetch. Any load still in flight is superseded.
    pub fn prepare(&mut self, update: &ViewportUpdate) -> LoadStep<B> {
        let ticket = self.coordinator.supersede();
        let tier = self.lod.tier_for(update.bounds.ratio).clone();
        let bounds = SpatialRegionCache::snap(&update.bounds, &tier);
        let now = Instant::now();

        if self.cache.is_cached(&update.bounds, &tier, now) {
            self.loads += 1;
            self.cached_loads += 1;
            debug!(
                "Generation {} served from cache at tier {}",
                ticket.generation(),
                tier.name
            );
            return LoadStep::Cached(LoadOutcome::cached(&ticket, update, tier, bounds));
        }

        let request = FragmentRequest {
            bounds,
            lod_tier: tier.name.clone(),
            min_degree: tier.min_degree,
            max_nodes: tier.max_nodes,
            offset: 0,
            edge_mode: tier.edge_mode,
            hidden_clusters: self.context.hidden_clusters(),
        };
        LoadStep::Fetch(PendingFragment {
            ticket,
            dispatcher: self.coordinator.dispatcher(),
            request,
            max_pages: self.config.strategy.max_pages(),
            update: *update,
            tier,
        })
    }

    /// Apply a fetched fragment.
    ///
    /// Stale generations are dropped without touching any state. A merged
    /// fragment marks its region loaded, even when it brought nothing new,
    /// and is then followed by eviction; regions holding evicted nodes are
    /// forgotten again.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(generation = fetched.generation())))]
    pub fn commit(&mut self, fetched: FetchedFragment) -> Result<LoadOutcome, LoadError> {
        let FetchedFragment {
            ticket,
            bounds,
            update,
            tier,
            pages,
            result,
        } = fetched;
        let generation = ticket.generation();

        if !ticket.is_current() {
            debug!("Dropping fragment for superseded generation {generation}");
            return Err(LoadError::FetchCancelled { generation });
        }
        let response = match result {
            Ok(response) => response,
            Err(failure) => return Err(self.record_failure(generation, failure)),
        };

        let now = Instant::now();
        let merge = match self
            .tree
            .add_fragment(&response.nodes, &response.tree_edges, &[], now)
        {
            Ok(merge) => merge,
            Err(violation) => {
                warn!("Rejected fragment for generation {generation}: {violation}");
                return Err(violation.into());
            },
        };
        self.health = LoadHealth::Healthy;

        self.cache.sweep(now);
        // Keyed by the requested bounds, the same key `prepare` looks up.
        // Marked before eviction so a region that loses nodes right away is
        // invalidated with the rest.
        self.cache
            .mark_loaded(&update.bounds, &tier, response.nodes.len(), now);
        let eviction = self.enforce_limits(bounds.center());
        self.loads += 1;

        debug!(
            "Generation {generation} tier {}: {} page(s), {} new node(s), {} evicted, {} loaded",
            tier.name,
            pages,
            merge.added_nodes.len(),
            eviction.evicted_nodes.len(),
            self.tree.graph().node_count()
        );
        Ok(LoadOutcome {
            generation,
            viewport_generation: update.generation,
            tier,
            bounds,
            cached: false,
            pages,
            merge,
            eviction,
            enrichment: None,
        })
    }

    /// Plan the extra-edge fetch for a committed load, if its tier and the
    /// strategy call for one and its generation is still current.
    pub fn prepare_enrichment(&self, outcome: &LoadOutcome) -> Option<PendingEnrichment<B>> {
        if outcome.cached ||
            !self.config.strategy.enriches() ||
            !outcome.tier.edge_mode.includes_extra() ||
            outcome.tier.max_extra_edges == 0
        {
            return None;
        }
        let ticket = self.coordinator.current_ticket();
        if ticket.generation() != outcome.generation || !ticket.is_current() {
            return None;
        }

        let node_ids: Vec<String> = match outcome.tier.edge_mode {
            EdgeMode::All => self
                .tree
                .graph()
                .nodes()
                .filter(|(_, node)| outcome.bounds.contains(node.position))
                .map(|(_, node)| node.id.clone())
                .collect(),
            _ => outcome
                .merge
                .added_nodes
                .iter()
                .filter(|id| self.tree.graph().contains(id))
                .cloned()
                .collect(),
        };
        if node_ids.is_empty() {
            return None;
        }

        Some(PendingEnrichment {
            ticket,
            dispatcher: self.coordinator.dispatcher(),
            request: ExtraEdgesRequest {
                node_ids,
                max_edges: outcome.tier.max_extra_edges,
            },
        })
    }

    /// Merge enrichment results. Failures and stale results are dropped
    /// quietly; enrichment never affects health.
    pub fn commit_enrichment(&mut self, fetched: FetchedEnrichment) -> Option<MergeReport> {
        let generation = fetched.ticket.generation();
        if !fetched.ticket.is_current() {
            debug!("Dropping enrichment for superseded generation {generation}");
            return None;
        }
        let response = match fetched.result {
            Ok(response) => response,
            Err(err) => {
                debug!("Enrichment for generation {generation} failed: {err}");
                return None;
            },
        };

        let report = self.tree.add_extra_edges(&response.extra_edges);
        self.enforce_limits(self.camera_center());
        debug!(
            "Generation {generation} enrichment: {} extra edge(s), {} broken",
            report.extra_edges_added, report.broken_recorded
        );
        Some(report)
    }

    /// Full load for one update: prepare, fetch, commit, then enrich.
    pub async fn load_viewport(&mut self, update: &ViewportUpdate) -> Result<LoadOutcome, LoadError> {
        let mut outcome = match self.prepare(update) {
            LoadStep::Cached(outcome) => return Ok(outcome),
            LoadStep::Fetch(pending) => {
                let fetched = pending.fetch().await;
                self.commit(fetched)?
            },
        };
        if let Some(enrichment) = self.prepare_enrichment(&outcome) {
            let fetched = enrichment.fetch().await;
            outcome.enrichment = self.commit_enrichment(fetched);
        }
        Ok(outcome)
    }

    /// Load the tree context of `id`, select it, and return its loaded tree
    /// neighbourhood within `depth`.
    ///
    /// Supersedes any viewport load in flight.
    pub async fn focus_node(&mut self, id: &str, depth: usize) -> Result<Vec<String>, LoadError> {
        let ticket = self.coordinator.supersede();
        let generation = ticket.generation();
        let request = NodeContextRequest {
            node_id: id.to_string(),
            radius: depth.max(self.config.fetch.context_radius),
            max_nodes: self.config.fetch.context_max_nodes,
        };
        let result = self
            .coordinator
            .dispatcher()
            .fetch_node_context(&ticket, request)
            .await;

        if !ticket.is_current() {
            return Err(LoadError::FetchCancelled { generation });
        }
        let response = result.map_err(|failure| self.record_failure(generation, failure))?;
        self.tree
            .add_fragment(&response.nodes, &response.tree_edges, &[], Instant::now())
            .inspect_err(|violation| warn!("Rejected context of {id}: {violation}"))?;
        self.health = LoadHealth::Healthy;

        self.select(id);
        let center = self
            .tree
            .graph()
            .get(id)
            .map_or_else(|| self.camera_center(), |node| node.position);
        self.enforce_limits(center);
        Ok(self.tree.tree_neighbors(id, depth))
    }

    /// Select a loaded node. Its path to the root is protected from
    /// eviction until the selection changes.
    pub fn select(&mut self, id: &str) -> bool {
        if !self.tree.graph().contains(id) {
            return false;
        }
        self.selected = Some(id.to_string());
        self.refresh_protection();
        true
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
        self.scorer.clear_protected();
    }

    /// Pin or unpin a loaded node. Pinned nodes are never evicted. Roots stay
    /// retained regardless.
    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> bool {
        match self.tree.graph_mut().get_mut(id) {
            Some(node) => {
                node.retained = pinned || node.is_root();
                true
            },
            None => false,
        }
    }

    /// Loaded node ids matching `query`, best first.
    pub fn search_loaded(&self, query: &str) -> Vec<String> {
        search_loaded(self.tree.graph(), query)
    }

    /// Change the hidden-cluster filter for future fetches.
    ///
    /// Cached regions were fetched under the old filter, so the cache is
    /// cleared and the active generation cancelled. Already loaded nodes
    /// stay. Returns whether the filter changed.
    pub fn set_hidden_clusters(&mut self, clusters: impl IntoIterator<Item = i64>) -> bool {
        if !self.context.set_hidden_clusters(clusters) {
            return false;
        }
        self.cache.clear();
        self.coordinator.cancel_all();
        info!("Hidden clusters now {:?}", self.context.hidden_clusters());
        true
    }

    /// Cancel whatever is in flight without starting a new load.
    pub fn cancel_pending(&mut self) {
        self.coordinator.cancel_all();
    }

    /// Drain queued render events.
    pub fn take_render_events(&mut self) -> Vec<RenderEvent> {
        self.tree.take_events()
    }

    /// Forward queued render events to `sink`. Returns how many were sent.
    pub fn flush_render_events(&mut self, sink: &mut impl RenderSink) -> usize {
        let events = self.tree.take_events();
        let count = events.len();
        for event in events {
            sink.apply(event);
        }
        count
    }

    fn camera_center(&self) -> Point2D<f64> {
        self.camera.center
    }

    fn refresh_protection(&mut self) {
        match &self.selected {
            Some(id) if self.tree.graph().contains(id) => {
                self.scorer.set_protected(self.tree.ancestor_path(id));
            },
            Some(_) => {
                self.selected = None;
                self.scorer.clear_protected();
            },
            None => self.scorer.clear_protected(),
        }
    }

    fn enforce_limits(&mut self, center: Point2D<f64>) -> EvictionReport {
        self.refresh_protection();
        let memory = &self.config.memory;
        let report = self.eviction.enforce_limits(
            &mut self.tree,
            &self.scorer,
            center,
            memory.max_nodes,
            memory.max_edges,
        );
        debug_assert!(
            self.tree.check_invariant().is_none(),
            "connectivity broken after eviction: {:?}",
            self.tree.check_invariant()
        );
        let invalidated: usize = report
            .evicted_positions
            .iter()
            .map(|position| self.cache.invalidate_containing(*position))
            .sum();
        if invalidated > 0 {
            debug!("Eviction invalidated {invalidated} cached region(s)");
        }
        report
    }

    fn record_failure(&mut self, generation: u64, failure: FetchFailure) -> LoadError {
        let error = match failure.error {
            FetchError::Cancelled => return LoadError::FetchCancelled { generation },
            FetchError::Timeout => LoadError::FetchTimeout {
                attempts: failure.attempts,
            },
            FetchError::Backend(message) | FetchError::Rejected(message) => {
                LoadError::BackendUnavailable(message)
            },
        };
        self.failed_loads += 1;
        let consecutive_failures = match &self.health {
            LoadHealth::Degraded {
                consecutive_failures,
                ..
            } => consecutive_failures + 1,
            LoadHealth::Healthy => 1,
        };
        warn!(
            "Generation {generation} failed after {} attempt(s): {error}",
            failure.attempts
        );
        self.health = LoadHealth::Degraded {
            consecutive_failures,
            last_error: error.clone(),
        };
        error
    }
}
