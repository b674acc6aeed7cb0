/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Replays a scripted pan/zoom session against a local dataset and reports
//! what the loader did at each step.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bpaf::Bpaf;
use citegraph::backend::LocalBackend;
use citegraph::backend::dataset::GraphDataset;
use citegraph::config::EngineConfig;
use citegraph::error::{ConfigError, DatasetError, LoadError};
use citegraph::input::Camera;
use citegraph::render::RenderTally;
use citegraph::{GraphLoadOrchestrator, LoaderContext};
use euclid::default::Size2D;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::Instant;

/// Command line options
#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
struct Options {
    /// Load the graph from a JSON dataset instead of generating one
    #[bpaf(long, argument("PATH"))]
    dataset: Option<PathBuf>,

    /// Size of the generated graph
    #[bpaf(long, argument("NODES"), fallback(20_000), display_fallback)]
    synthetic: usize,

    /// Engine config file (defaults to the user config directory)
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Camera moves to replay
    #[bpaf(long, argument("N"), fallback(40), display_fallback)]
    steps: usize,

    /// Seed for the generated graph and the camera script
    #[bpaf(long, argument("N"), fallback(7), display_fallback)]
    seed: u64,

    /// Print the effective engine config as TOML and exit
    #[bpaf(long("dump-config"), switch)]
    dump_config: bool,

    /// After the replay, search the dataset and focus the best match
    #[bpaf(long, argument("QUERY"))]
    focus: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("failed to start: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset is empty")]
    EmptyDataset,
}

fn main() -> ExitCode {
    init_logging();
    let options = options().run();
    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        },
    }
}

#[cfg(feature = "tracing")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(not(feature = "tracing"))]
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn run(options: Options) -> Result<(), CliError> {
    let config = match &options.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load(),
    };
    if options.dump_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let dataset = match &options.dataset {
        Some(path) => GraphDataset::load(path)?,
        None => {
            info!(
                "Generating {} node(s) with seed {}",
                options.synthetic, options.seed
            );
            GraphDataset::synthetic(options.synthetic, options.seed)
        },
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(replay(Arc::new(config), dataset, &options))
}

async fn replay(
    config: Arc<EngineConfig>,
    dataset: GraphDataset,
    options: &Options,
) -> Result<(), CliError> {
    let world = dataset.bounds().ok_or(CliError::EmptyDataset)?;
    let backend = Arc::new(LocalBackend::new(dataset, &config.backend)?);
    let mut orchestrator =
        GraphLoadOrchestrator::new(config.clone(), backend.clone(), LoaderContext::new())?;
    let mut tally = RenderTally::default();
    let mut rng = StdRng::seed_from_u64(options.seed);

    let canvas = Size2D::new(1280.0, 800.0);
    let mut camera = Camera::fit(&world, canvas, config.viewport.world_units_per_pixel);
    let mut now = Instant::now();
    orchestrator.observe_camera(camera, now);
    let initial = orchestrator.force_viewport(now);
    report(0, orchestrator.load_viewport(&initial).await);
    orchestrator.flush_render_events(&mut tally);

    for step in 1..=options.steps {
        if rng.gen_bool(0.35) {
            camera.zoom_by(if rng.gen_bool(0.6) { 0.5 } else { 2.0 });
        } else {
            camera.pan(rng.gen_range(-600.0..600.0), rng.gen_range(-400.0..400.0));
        }
        orchestrator.observe_camera(camera, now);
        // The script never moves faster than the debounce window.
        now += config.debounce();

        let Some(update) = orchestrator.poll_viewport(now) else {
            continue;
        };
        report(step, orchestrator.load_viewport(&update).await);
        orchestrator.flush_render_events(&mut tally);
    }

    if let Some(query) = &options.focus {
        match backend.search(query, 1).await {
            Ok(hits) => match hits.first() {
                Some(hit) => match orchestrator.focus_node(&hit.id, 2).await {
                    Ok(neighbours) => info!(
                        "Focused {} ({}) with {} tree neighbour(s)",
                        hit.id,
                        hit.label,
                        neighbours.len()
                    ),
                    Err(err) => warn!("Could not focus {}: {err}", hit.id),
                },
                None => warn!("No node matches {query:?}"),
            },
            Err(err) => warn!("Search failed: {err}"),
        }
        orchestrator.flush_render_events(&mut tally);
    }

    let stats = orchestrator.stats();
    info!(
        "Loaded {} node(s), {} edge(s) ({} tree), {} broken pending",
        stats.nodes, stats.edges, stats.tree_edges, stats.broken_edges
    );
    info!(
        "{} load(s), {} from cache, {} failed; cache hit rate {:.0}%",
        stats.loads,
        stats.cached_loads,
        stats.failed_loads,
        stats.cache.hit_rate() * 100.0
    );
    info!(
        "Evicted {} node(s) and {} edge(s) over {} run(s); renderer shows {} node(s), {} edge(s)",
        stats.eviction.nodes_evicted,
        stats.eviction.edges_evicted,
        stats.eviction.runs,
        tally.visible_nodes(),
        tally.visible_edges()
    );
    if let Some(id) = orchestrator.tree().check_invariant() {
        error!("Node {id} lost its path to a root");
    }
    Ok(())
}

fn report(step: usize, result: Result<citegraph::orchestrator::LoadOutcome, LoadError>) {
    match result {
        Ok(outcome) if outcome.cached => {
            info!("[{step}] tier {} cached", outcome.tier.name);
        },
        Ok(outcome) => info!(
            "[{step}] tier {}: +{} node(s), -{} evicted, {} extra edge(s)",
            outcome.tier.name,
            outcome.merge.added_nodes.len(),
            outcome.eviction.evicted_nodes.len(),
            outcome
                .enrichment
                .map_or(0, |enrichment| enrichment.extra_edges_added)
        ),
        Err(err) if err.is_silent() => {},
        Err(err) => warn!("[{step}] load failed: {err}"),
    }
}
