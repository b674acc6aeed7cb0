/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Engine configuration (`engine.toml`).
//!
//! Read once at startup and shared as `Arc<EngineConfig>`; nothing mutates it
//! afterwards. Every section and field has a default, so a partial file only
//! overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fetch::coordinator::RetryPolicy;
use crate::importance::ScoringWeights;
use crate::lod::{LodTier, default_tiers, validate_tiers};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Quiet period before a camera change is emitted
    pub debounce_ms: u64,

    /// World units covered by one screen pixel at ratio 1.0
    pub world_units_per_pixel: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 350,
            world_units_per_pixel: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    pub tiers: Vec<LodTier>,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_regions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            max_regions: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_nodes: usize,
    pub max_edges: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_nodes: 10_000,
            max_edges: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub extra_edges_timeout_ms: u64,
    /// Tree radius loaded around a focused node
    pub context_radius: usize,
    pub context_max_nodes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 2_000,
            extra_edges_timeout_ms: 3_000,
            context_radius: 2,
            context_max_nodes: 200,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn extra_edges_timeout(&self) -> Duration {
        Duration::from_millis(self.extra_edges_timeout_ms)
    }
}

/// Local backend query pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub workers: usize,
    pub query_deadline_ms: u64,
    /// Rows scanned between cancellation checkpoints
    pub checkpoint_interval: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            query_deadline_ms: 4_000,
            checkpoint_interval: 256,
        }
    }
}

/// How a viewport change is loaded. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LoaderStrategy {
    /// One fragment page, no enrichment
    Standard,

    /// Fragment first, then best-effort extra edges if `enrich`
    TreeFirst { enrich: bool },

    /// Like `TreeFirst`, but follows `has_more` for up to `max_pages` pages
    Enhanced { max_pages: usize, enrich: bool },
}

impl Default for LoaderStrategy {
    fn default() -> Self {
        LoaderStrategy::TreeFirst { enrich: true }
    }
}

impl LoaderStrategy {
    pub fn enriches(self) -> bool {
        match self {
            LoaderStrategy::Standard => false,
            LoaderStrategy::TreeFirst { enrich } | LoaderStrategy::Enhanced { enrich, .. } => {
                enrich
            },
        }
    }

    pub fn max_pages(self) -> usize {
        match self {
            LoaderStrategy::Enhanced { max_pages, .. } => max_pages.max(1),
            _ => 1,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub viewport: ViewportConfig,
    pub lod: LodConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub fetch: FetchConfig,
    pub scoring: ScoringWeights,
    pub backend: BackendConfig,
    pub strategy: LoaderStrategy,
}

impl EngineConfig {
    /// Load from the user config directory, falling back to defaults if the
    /// file is missing or invalid.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        if !config_path.exists() {
            return Self::default();
        }
        match Self::load_from(&config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Ignoring {}: {err}", config_path.display());
                Self::default()
            },
        }
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, self.to_toml_string()?).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_tiers(&self.lod.tiers)?;
        if !(self.viewport.world_units_per_pixel.is_finite() &&
            self.viewport.world_units_per_pixel > 0.0)
        {
            return Err(ConfigError::Invalid(
                "viewport.world_units_per_pixel must be positive".into(),
            ));
        }
        if self.cache.max_regions == 0 {
            return Err(ConfigError::Invalid("cache.max_regions must be at least 1".into()));
        }
        if self.memory.max_nodes == 0 {
            return Err(ConfigError::Invalid("memory.max_nodes must be at least 1".into()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid("fetch.max_attempts must be at least 1".into()));
        }
        if self.fetch.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fetch.attempt_timeout_ms must be positive".into()));
        }
        if self.backend.workers == 0 {
            return Err(ConfigError::Invalid("backend.workers must be at least 1".into()));
        }
        if let LoaderStrategy::Enhanced { max_pages: 0, .. } = self.strategy {
            return Err(ConfigError::Invalid("strategy.max_pages must be at least 1".into()));
        }
        if !(self.scoring.degree.is_finite() && self.scoring.distance.is_finite()) {
            return Err(ConfigError::Invalid("scoring weights must be finite".into()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.viewport.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.backend.query_deadline_ms)
    }

    /// Path of the engine config file
    pub fn config_path() -> PathBuf {
        super::config_dir().join("engine.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lod::EdgeMode;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(350));
        assert_eq!(config.cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.cache.max_regions, 100);
        assert_eq!(config.backend.workers, 4);
        assert_eq!(config.fetch.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_partial_file_overrides_named_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            [memory]
            max_nodes = 42

            [strategy]
            kind = "enhanced"
            max_pages = 3
            enrich = false
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.max_nodes, 42);
        assert_eq!(config.memory.max_edges, 50_000);
        assert_eq!(
            config.strategy,
            LoaderStrategy::Enhanced {
                max_pages: 3,
                enrich: false
            }
        );
        assert_eq!(config.lod.tiers.len(), 4);
    }

    #[test]
    fn test_custom_tiers() {
        let config = EngineConfig::from_toml_str(
            r#"
            [[lod.tiers]]
            name = "near"
            min_ratio = 0.0
            max_nodes = 100
            min_degree = 0
            edge_mode = "all"
            max_extra_edges = 50
            cell_size = 10.0

            [[lod.tiers]]
            name = "far"
            min_ratio = 4.0
            max_nodes = 10
            min_degree = 3
            edge_mode = "tree-plus-extra"
            max_extra_edges = 5
            cell_size = 100.0
            "#,
        )
        .unwrap();
        assert_eq!(config.lod.tiers[1].edge_mode, EdgeMode::TreePlusExtra);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("[backend]\nworkers = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[lod]\ntiers = []\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[cache\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.memory.max_nodes = 7;
        config.strategy = LoaderStrategy::Standard;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_strategy_helpers() {
        assert!(!LoaderStrategy::Standard.enriches());
        assert_eq!(LoaderStrategy::Standard.max_pages(), 1);
        assert!(LoaderStrategy::default().enriches());
        assert_eq!(
            LoaderStrategy::Enhanced {
                max_pages: 4,
                enrich: true
            }
            .max_pages(),
            4
        );
    }
}
