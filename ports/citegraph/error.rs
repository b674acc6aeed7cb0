/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Error types shared across the loader.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single backend fetch, as seen by the request coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The attempt did not finish within its deadline.
    #[error("fetch timed out")]
    Timeout,

    /// The request belonged to a superseded generation. Never user-visible.
    #[error("fetch cancelled")]
    Cancelled,

    /// Transient backend failure; worth retrying.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend refused the request; retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl FetchError {
    /// Whether the coordinator should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Timeout | FetchError::Backend(_))
    }
}

/// Why a fragment failed the connectivity gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// None of the node's parents is in the fragment or already loaded one
    /// level above it.
    MissingParent { parent_ids: Vec<String> },

    /// A tree edge references a node that is neither in the fragment nor loaded.
    DanglingTreeEdge { source: String, target: String },
}

/// A fragment was rejected because merging it would orphan a node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("connectivity violation at node {node_id}: {kind}")]
pub struct ConnectivityViolation {
    pub node_id: String,
    pub kind: ViolationKind,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::MissingParent { parent_ids } if parent_ids.is_empty() => {
                write!(f, "non-root node without parents")
            },
            ViolationKind::MissingParent { parent_ids } => {
                write!(f, "no loaded parent among [{}]", parent_ids.join(", "))
            },
            ViolationKind::DanglingTreeEdge { source, target } => {
                write!(f, "tree edge {source} -> {target} has an unknown endpoint")
            },
        }
    }
}

/// Outcome of a failed viewport load, as surfaced by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    /// The mandatory fragment fetch timed out on every attempt.
    #[error("fragment fetch timed out after {attempts} attempt(s)")]
    FetchTimeout { attempts: u32 },

    /// The load was superseded by a newer generation.
    #[error("load for generation {generation} was superseded")]
    FetchCancelled { generation: u64 },

    /// The fragment was rejected; the region stays un-cached so it is retried.
    #[error(transparent)]
    ConnectivityViolation(#[from] ConnectivityViolation),

    /// The backend failed for a reason other than a timeout.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl LoadError {
    /// Cancellation is expected during rapid panning and should stay silent.
    pub fn is_silent(&self) -> bool {
        matches!(self, LoadError::FetchCancelled { .. })
    }
}

/// Errors raised by backend queries running on the worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    DeadlineExceeded,

    #[error("query pool is shut down")]
    PoolClosed,

    #[error("unknown node {0}")]
    NotFound(String),

    #[error("invalid query: {0}")]
    Invalid(String),
}

impl From<QueryError> for FetchError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Cancelled => FetchError::Cancelled,
            QueryError::DeadlineExceeded => FetchError::Timeout,
            QueryError::PoolClosed => FetchError::Backend(err.to_string()),
            QueryError::NotFound(_) | QueryError::Invalid(_) => {
                FetchError::Rejected(err.to_string())
            },
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors while loading a graph dataset for the local backend.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate node id {0}")]
    DuplicateNode(String),

    #[error("dataset has no root node (tree level 0)")]
    NoRoot,

    #[error("node {0} has no parent one tree level up")]
    Orphan(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_maps_to_fetch_error() {
        assert_eq!(FetchError::from(QueryError::Cancelled), FetchError::Cancelled);
        assert_eq!(
            FetchError::from(QueryError::DeadlineExceeded),
            FetchError::Timeout
        );
        assert!(matches!(
            FetchError::from(QueryError::NotFound("x".into())),
            FetchError::Rejected(_)
        ));
        assert!(FetchError::from(QueryError::PoolClosed).is_retryable());
    }

    #[test]
    fn test_violation_display_names_parents() {
        let violation = ConnectivityViolation {
            node_id: "C".into(),
            kind: ViolationKind::MissingParent {
                parent_ids: vec!["Z".into()],
            },
        };
        let text = violation.to_string();
        assert!(text.contains("C"));
        assert!(text.contains("[Z]"));
    }

    #[test]
    fn test_cancelled_is_silent() {
        assert!(LoadError::FetchCancelled { generation: 3 }.is_silent());
        assert!(!LoadError::FetchTimeout { attempts: 3 }.is_silent());
    }
}
