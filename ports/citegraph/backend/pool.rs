/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Bounded worker pool for backend queries.
//!
//! Queries run on a fixed set of OS threads fed by a crossbeam channel. Each
//! query gets a request id, a deadline and a cancel flag registered in a
//! shared registry. Query bodies call `QueryContext::checkpoint` while they
//! scan, so a cancel or an expired deadline stops them within one checkpoint
//! interval. Dropping the future returned by `QueryPool::run` cancels the
//! query.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::QueryError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Command to send to a pool worker
enum PoolCommand {
    /// Run a query job
    Run(Job),

    /// Shutdown the worker
    Shutdown,
}

/// Handed to a running query so it can stop early.
#[derive(Debug, Clone)]
pub struct QueryContext {
    id: Uuid,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl QueryContext {
    /// A context that belongs to no pool; only its deadline can stop it.
    pub fn detached(deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            deadline: Instant::now() + deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fails once the query has been cancelled or its deadline has passed.
    pub fn checkpoint(&self) -> Result<(), QueryError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(QueryError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(QueryError::DeadlineExceeded);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct QueryEntry {
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
}

type Registry = Arc<Mutex<HashMap<Uuid, QueryEntry>>>;

/// Unregisters a query when its client future finishes or is dropped. A
/// drop before completion also raises the cancel flag.
struct Registration {
    registry: Registry,
    id: Uuid,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.finished {
            self.cancelled.store(true, Ordering::Release);
            trace!("Query {} abandoned by its caller", self.id);
        }
        self.registry.lock().remove(&self.id);
    }
}

/// Worker pool that runs backend queries off the async runtime
pub struct QueryPool {
    command_tx: Sender<PoolCommand>,
    workers: Vec<JoinHandle<()>>,
    registry: Registry,
}

impl QueryPool {
    /// Create and start `workers` worker threads
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let command_rx = command_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("citegraph-query-{index}"))
                .spawn(move || run_query_worker(command_rx))?;
            handles.push(handle);
        }
        debug!("Started query pool with {} worker(s)", handles.len());
        Ok(Self {
            command_tx,
            workers: handles,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queries currently registered (queued or running)
    pub fn in_flight(&self) -> usize {
        self.registry.lock().len()
    }

    /// Ids of registered queries
    pub fn query_ids(&self) -> Vec<Uuid> {
        self.registry.lock().keys().copied().collect()
    }

    /// Raise the cancel flag of a registered query. Returns false if the id
    /// is unknown (already finished or never registered).
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.registry.lock().get(&id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Release);
                true
            },
            None => false,
        }
    }

    /// Cancel every query whose deadline has passed. Returns how many were
    /// flagged.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let registry = self.registry.lock();
        let mut flagged = 0;
        for entry in registry.values() {
            if entry.deadline <= now && !entry.cancelled.swap(true, Ordering::AcqRel) {
                flagged += 1;
            }
        }
        flagged
    }

    /// Run `query` on a worker and await its result.
    ///
    /// The query is checkpointed once before it starts, so a query that sat
    /// in the queue past its deadline never runs.
    pub async fn run<T, F>(&self, deadline: Duration, query: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&QueryContext) -> Result<T, QueryError> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let context = QueryContext {
            id,
            deadline: Instant::now() + deadline,
            cancelled: cancelled.clone(),
        };
        self.registry.lock().insert(
            id,
            QueryEntry {
                cancelled: cancelled.clone(),
                deadline: context.deadline,
            },
        );
        let mut registration = Registration {
            registry: self.registry.clone(),
            id,
            cancelled,
            finished: false,
        };

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let job: Job = Box::new(move || {
            let result = context.checkpoint().and_then(|()| query(&context));
            let _ = result_tx.send(result);
        });
        if self.command_tx.send(PoolCommand::Run(job)).is_err() {
            registration.finished = true;
            return Err(QueryError::PoolClosed);
        }

        let result = result_rx.await.unwrap_or(Err(QueryError::PoolClosed));
        registration.finished = true;
        result
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        for entry in self.registry.lock().values() {
            entry.cancelled.store(true, Ordering::Release);
        }
        for _ in &self.workers {
            let _ = self.command_tx.send(PoolCommand::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Worker loop: run jobs until told to stop
fn run_query_worker(command_rx: Receiver<PoolCommand>) {
    while let Ok(command) = command_rx.recv() {
        match command {
            PoolCommand::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Query panicked on {:?}", thread::current().name());
                }
            },
            PoolCommand::Shutdown => return,
        }
    }
}
