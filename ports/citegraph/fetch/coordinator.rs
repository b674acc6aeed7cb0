/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Request cancellation and retry around the backend.
//!
//! Every load is tagged with a `Ticket`. Starting a new load supersedes the
//! previous ticket: its token is cancelled, its in-flight backend future is
//! dropped at the next poll, and any response that still arrives is
//! discarded because the generation no longer matches.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use super::{
    ExtraEdgesRequest, ExtraEdgesResponse, FragmentRequest, FragmentResponse, GraphBackend,
    NodeContextRequest,
};
use crate::error::FetchError;

/// Retry settings for mandatory fetches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_max)
    }
}

/// A failed fetch together with how many attempts were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub error: FetchError,
    pub attempts: u32,
}

/// Identifies one load generation.
#[derive(Debug, Clone)]
pub struct Ticket {
    generation: u64,
    token: CancellationToken,
    current: Arc<AtomicU64>,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Still the active generation and not cancelled.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.current.load(Ordering::Acquire) == self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Issues generation-tagged tickets and cancels superseded ones.
#[derive(Debug)]
pub struct RequestCoordinator<B> {
    dispatcher: Dispatcher<B>,
    current: Arc<AtomicU64>,
    active: CancellationToken,
}

impl<B: GraphBackend> RequestCoordinator<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy, extra_edges_timeout: Duration) -> Self {
        Self {
            dispatcher: Dispatcher {
                backend,
                retry,
                extra_edges_timeout,
            },
            current: Arc::new(AtomicU64::new(0)),
            active: CancellationToken::new(),
        }
    }

    /// Start a new generation, cancelling everything tagged with older ones.
    pub fn supersede(&mut self) -> Ticket {
        self.active.cancel();
        self.active = CancellationToken::new();
        let generation = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Request generation {generation} supersedes {}", generation - 1);
        Ticket {
            generation,
            token: self.active.clone(),
            current: self.current.clone(),
        }
    }

    /// Ticket for the active generation, e.g. for enrichment of the load that
    /// just committed.
    pub fn current_ticket(&self) -> Ticket {
        Ticket {
            generation: self.current.load(Ordering::Acquire),
            token: self.active.clone(),
            current: self.current.clone(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Cancel the active generation without starting a new one.
    pub fn cancel_all(&mut self) {
        self.active.cancel();
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// Cloneable handle that performs the actual backend calls.
    pub fn dispatcher(&self) -> Dispatcher<B> {
        self.dispatcher.clone()
    }
}

/// Performs fetches on behalf of a ticket. Holds no coordinator state, so a
/// fetch future can outlive a borrow of the coordinator.
#[derive(Debug)]
pub struct Dispatcher<B> {
    backend: Arc<B>,
    retry: RetryPolicy,
    extra_edges_timeout: Duration,
}

impl<B> Clone for Dispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            retry: self.retry,
            extra_edges_timeout: self.extra_edges_timeout,
        }
    }
}

impl<B: GraphBackend> Dispatcher<B> {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Mandatory fetch of nodes and tree edges, retried with backoff.
    pub async fn fetch_fragment(
        &self,
        ticket: &Ticket,
        request: FragmentRequest,
    ) -> Result<FragmentResponse, FetchFailure> {
        self.with_retry(ticket, || self.backend.fetch_fragment(request.clone()))
            .await
    }

    /// Mandatory fetch of a node's tree context, retried with backoff.
    pub async fn fetch_node_context(
        &self,
        ticket: &Ticket,
        request: NodeContextRequest,
    ) -> Result<FragmentResponse, FetchFailure> {
        self.with_retry(ticket, || self.backend.fetch_node_context(request.clone()))
            .await
    }

    /// Best-effort enrichment: one attempt, never retried.
    pub async fn fetch_extra_edges(
        &self,
        ticket: &Ticket,
        request: ExtraEdgesRequest,
    ) -> Result<ExtraEdgesResponse, FetchError> {
        attempt(
            ticket,
            self.extra_edges_timeout,
            self.backend.fetch_extra_edges(request),
        )
        .await
    }

    async fn with_retry<T, F, Fut>(&self, ticket: &Ticket, mut call: F) -> Result<T, FetchFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt(ticket, self.retry.attempt_timeout, call()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempts);
                    debug!(
                        "Generation {} attempt {attempts} failed ({error}), retrying in {delay:?}",
                        ticket.generation
                    );
                    tokio::select! {
                        biased;
                        _ = ticket.token.cancelled() => {
                            return Err(FetchFailure {
                                error: FetchError::Cancelled,
                                attempts,
                            });
                        },
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                Err(error) => return Err(FetchFailure { error, attempts }),
            }
        }
    }
}

/// One guarded backend call: generation checked before dispatch and after
/// the response, raced against cancellation and a timeout.
async fn attempt<T>(
    ticket: &Ticket,
    timeout: Duration,
    call: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    if !ticket.is_current() {
        return Err(FetchError::Cancelled);
    }
    let result = tokio::select! {
        biased;
        _ = ticket.token.cancelled() => Err(FetchError::Cancelled),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        },
    };
    if !ticket.is_current() {
        return Err(FetchError::Cancelled);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::input::ViewportBounds;
    use crate::lod::EdgeMode;

    /// Backend whose fragment calls fail a scripted number of times.
    struct ScriptedBackend {
        calls: AtomicU32,
        failures: Mutex<Vec<FetchError>>,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn new(failures: Vec<FetchError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures: Mutex::new(failures),
                delay,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(&self) -> Result<FragmentResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let failure = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match failure {
                Some(error) => Err(error),
                None => Ok(FragmentResponse {
                    total_in_box: 1,
                    ..FragmentResponse::default()
                }),
            }
        }
    }

    impl GraphBackend for ScriptedBackend {
        async fn fetch_fragment(
            &self,
            _request: FragmentRequest,
        ) -> Result<FragmentResponse, FetchError> {
            self.respond().await
        }

        async fn fetch_extra_edges(
            &self,
            _request: ExtraEdgesRequest,
        ) -> Result<ExtraEdgesResponse, FetchError> {
            tokio::time::sleep(self.delay).await;
            Err(FetchError::Backend("flaky".into()))
        }

        async fn fetch_node_context(
            &self,
            _request: NodeContextRequest,
        ) -> Result<FragmentResponse, FetchError> {
            self.respond().await
        }
    }

    fn request() -> FragmentRequest {
        FragmentRequest {
            bounds: ViewportBounds::new(0.0, 1.0, 0.0, 1.0, 1.0),
            lod_tier: "detail".into(),
            min_degree: 0,
            max_nodes: 10,
            offset: 0,
            edge_mode: EdgeMode::Tree,
            hidden_clusters: Vec::new(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(150),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(1600));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(60), Duration::from_secs(2));
    }

    #[test]
    fn test_supersede_invalidates_previous_ticket() {
        let backend = ScriptedBackend::new(Vec::new(), Duration::ZERO);
        let mut coordinator = RequestCoordinator::new(backend, policy(), Duration::from_secs(1));
        let first = coordinator.supersede();
        assert!(first.is_current());

        let second = coordinator.supersede();
        assert!(!first.is_current());
        assert!(first.token().is_cancelled());
        assert!(second.is_current());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(coordinator.current_ticket().generation(), second.generation());

        coordinator.cancel_all();
        assert!(!second.is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let backend = ScriptedBackend::new(
            vec![FetchError::Timeout, FetchError::Backend("busy".into())],
            Duration::from_millis(10),
        );
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let ticket = coordinator.supersede();

        let response = coordinator
            .dispatcher()
            .fetch_fragment(&ticket, request())
            .await
            .unwrap();
        assert_eq!(response.total_in_box, 1);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let backend = ScriptedBackend::new(
            vec![FetchError::Timeout; 5],
            Duration::from_millis(10),
        );
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let ticket = coordinator.supersede();

        let failure = coordinator
            .dispatcher()
            .fetch_fragment(&ticket, request())
            .await
            .unwrap_err();
        assert_eq!(failure.error, FetchError::Timeout);
        assert_eq!(failure.attempts, 3);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let backend = ScriptedBackend::new(
            vec![FetchError::Rejected("bad".into())],
            Duration::ZERO,
        );
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let ticket = coordinator.supersede();

        let failure = coordinator
            .dispatcher()
            .fetch_node_context(
                &ticket,
                NodeContextRequest {
                    node_id: "x".into(),
                    radius: 1,
                    max_nodes: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(failure.error, FetchError::Rejected(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let backend = ScriptedBackend::new(Vec::new(), Duration::from_secs(10));
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let ticket = coordinator.supersede();

        let failure = coordinator
            .dispatcher()
            .fetch_fragment(&ticket, request())
            .await
            .unwrap_err();
        assert_eq!(failure.error, FetchError::Timeout);
        assert_eq!(failure.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersession_cancels_in_flight_fetch() {
        let backend = ScriptedBackend::new(Vec::new(), Duration::from_millis(300));
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let stale = coordinator.supersede();
        let dispatcher = coordinator.dispatcher();

        let in_flight = tokio::spawn({
            let stale = stale.clone();
            async move { dispatcher.fetch_fragment(&stale, request()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = coordinator.supersede();

        let failure = in_flight.await.unwrap().unwrap_err();
        assert_eq!(failure.error, FetchError::Cancelled);
        assert_eq!(failure.attempts, 1);
        assert!(fresh.is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_never_dispatches() {
        let backend = ScriptedBackend::new(Vec::new(), Duration::ZERO);
        let mut coordinator =
            RequestCoordinator::new(backend.clone(), policy(), Duration::from_secs(1));
        let stale = coordinator.supersede();
        coordinator.supersede();

        let failure = coordinator
            .dispatcher()
            .fetch_fragment(&stale, request())
            .await
            .unwrap_err();
        assert_eq!(failure.error, FetchError::Cancelled);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_edges_single_attempt() {
        let backend = ScriptedBackend::new(Vec::new(), Duration::from_millis(5));
        let mut coordinator =
            RequestCoordinator::new(backend, policy(), Duration::from_secs(1));
        let ticket = coordinator.supersede();

        let error = coordinator
            .dispatcher()
            .fetch_extra_edges(
                &ticket,
                ExtraEdgesRequest {
                    node_ids: vec!["a".into()],
                    max_edges: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::Backend(_)));
    }
}
