/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-process graph backend.
//!
//! `LocalBackend` serves a `GraphDataset` through the `GraphBackend` trait,
//! running every query on a `QueryPool` worker under a deadline.

pub mod dataset;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use log::trace;

use self::dataset::GraphDataset;
use self::pool::QueryPool;
use crate::config::BackendConfig;
use crate::error::{FetchError, QueryError};
use crate::fetch::{
    ExtraEdgesRequest, ExtraEdgesResponse, FragmentRequest, FragmentResponse, GraphBackend,
    NodeContextRequest, NodeRecord,
};

pub struct LocalBackend {
    dataset: Arc<GraphDataset>,
    pool: QueryPool,
    deadline: Duration,
}

impl LocalBackend {
    pub fn new(dataset: GraphDataset, config: &BackendConfig) -> std::io::Result<Self> {
        let dataset = dataset.with_checkpoint_interval(config.checkpoint_interval);
        Ok(Self {
            dataset: Arc::new(dataset),
            pool: QueryPool::new(config.workers)?,
            deadline: Duration::from_millis(config.query_deadline_ms),
        })
    }

    pub fn dataset(&self) -> &GraphDataset {
        &self.dataset
    }

    pub fn pool(&self) -> &QueryPool {
        &self.pool
    }

    /// Fuzzy search over the whole dataset, not only what is loaded.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<NodeRecord>, QueryError> {
        let dataset = self.dataset.clone();
        let query = query.to_string();
        self.pool
            .run(self.deadline, move |ctx| {
                ctx.checkpoint()?;
                Ok(dataset.search(&query, limit))
            })
            .await
    }
}

impl GraphBackend for LocalBackend {
    async fn fetch_fragment(&self, request: FragmentRequest) -> Result<FragmentResponse, FetchError> {
        trace!(
            "Fragment query tier={} offset={} max={}",
            request.lod_tier, request.offset, request.max_nodes
        );
        let dataset = self.dataset.clone();
        let response = self
            .pool
            .run(self.deadline, move |ctx| dataset.nodes_in_box(&request, ctx))
            .await?;
        Ok(response)
    }

    async fn fetch_extra_edges(
        &self,
        request: ExtraEdgesRequest,
    ) -> Result<ExtraEdgesResponse, FetchError> {
        let dataset = self.dataset.clone();
        let response = self
            .pool
            .run(self.deadline, move |ctx| dataset.extra_edges(&request, ctx))
            .await?;
        Ok(response)
    }

    async fn fetch_node_context(
        &self,
        request: NodeContextRequest,
    ) -> Result<FragmentResponse, FetchError> {
        let dataset = self.dataset.clone();
        let response = self
            .pool
            .run(self.deadline, move |ctx| dataset.node_context(&request, ctx))
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ViewportBounds;
    use crate::lod::EdgeMode;

    fn backend() -> LocalBackend {
        LocalBackend::new(GraphDataset::synthetic(300, 1), &BackendConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fragment_through_pool() {
        let backend = backend();
        let bounds = backend.dataset().bounds().unwrap();
        let response = backend
            .fetch_fragment(FragmentRequest {
                bounds,
                lod_tier: "overview".into(),
                min_degree: 0,
                max_nodes: 50,
                offset: 0,
                edge_mode: EdgeMode::Tree,
                hidden_clusters: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.total_in_box, 300);
        assert!(response.has_more);
        assert!(response.nodes.len() >= 50);
        assert_eq!(backend.pool().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let backend = backend();
        let err = backend
            .fetch_fragment(FragmentRequest {
                bounds: ViewportBounds::new(1.0, 0.0, 0.0, 1.0, 1.0),
                lod_tier: "detail".into(),
                min_degree: 0,
                max_nodes: 10,
                offset: 0,
                edge_mode: EdgeMode::All,
                hidden_clusters: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Rejected(_)));

        let err = backend
            .fetch_node_context(NodeContextRequest {
                node_id: "missing".into(),
                radius: 1,
                max_nodes: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_search_whole_dataset() {
        let backend = backend();
        let found = backend.search("n123", 5).await.unwrap();
        assert_eq!(found.first().map(|n| n.id.as_str()), Some("n123"));
    }
}
