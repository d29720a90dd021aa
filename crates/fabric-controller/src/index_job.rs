// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Director index job.
//!
//! Pulls the `(key, chunk, sub-chunk)` dump of every chunk of a database's
//! director table from the workers holding a replica and hands each dump to
//! an [`IndexSink`]. Chunks go to the least loaded worker holding them, with
//! at most `max_requests_per_worker` INDEX requests in flight per worker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use fabric_protocol::messages::{
    IndexRequest, QueuedRequestType, QueuedResponse, Status, StatusExt,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::WorkerClient;
use crate::error::{ControllerError, Result};

/// Consumer of index dumps.
#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Load the dump of `chunk` taken from `worker`. The error text is
    /// recorded against the chunk.
    async fn load(
        &self,
        chunk: u32,
        worker: &str,
        data: Vec<u8>,
    ) -> std::result::Result<(), String>;
}

/// Outcome for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunk: u32,
    /// Worker the chunk was extracted from; empty when none was asked.
    pub worker: String,
    pub status: Status,
    pub status_ext: StatusExt,
    pub error: String,
}

impl ChunkResult {
    fn new(
        chunk: u32,
        worker: &str,
        status: Status,
        status_ext: StatusExt,
        error: impl Into<String>,
    ) -> Self {
        Self {
            chunk,
            worker: worker.to_string(),
            status,
            status_ext,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexJobResult {
    /// `Success` only when every chunk succeeded.
    pub status: Status,
    pub chunks: BTreeMap<u32, ChunkResult>,
}

impl IndexJobResult {
    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkResult> {
        self.chunks.values().filter(|c| c.status != Status::Success)
    }
}

pub struct DirectorIndexJob {
    client: Arc<WorkerClient>,
    database: String,
    /// Chunk -> workers holding a good replica of it.
    replicas: BTreeMap<u32, Vec<String>>,
    transaction_id: Option<u32>,
    max_requests_per_worker: usize,
    priority: i32,
    sink: Arc<dyn IndexSink>,
    cancel: CancellationToken,
}

impl DirectorIndexJob {
    pub fn new(
        client: Arc<WorkerClient>,
        database: impl Into<String>,
        replicas: BTreeMap<u32, Vec<String>>,
        sink: Arc<dyn IndexSink>,
    ) -> Self {
        Self {
            client,
            database: database.into(),
            replicas,
            transaction_id: None,
            max_requests_per_worker: 1,
            priority: 0,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Restrict the dumps to rows of one super-transaction.
    pub fn with_transaction(mut self, transaction_id: u32) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_max_requests_per_worker(mut self, n: usize) -> Self {
        self.max_requests_per_worker = n.max(1);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Cancelling stops new requests and stops those in flight.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn request(&self, chunk: u32) -> IndexRequest {
        IndexRequest {
            database: self.database.clone(),
            chunk,
            has_transactions: self.transaction_id.is_some(),
            transaction_id: self.transaction_id.unwrap_or(0),
        }
    }

    #[instrument(skip(self), fields(database = %self.database, chunks = self.replicas.len()))]
    pub async fn run(&self) -> Result<IndexJobResult> {
        let info = self
            .client
            .messenger()
            .config()
            .database_info(&self.database)?;
        if info.director_table.is_empty() {
            return Err(ControllerError::InvalidParam(format!(
                "database {} has no director table",
                self.database
            )));
        }

        info!(
            max_requests_per_worker = self.max_requests_per_worker,
            "Director index job started"
        );

        let mut results: BTreeMap<u32, ChunkResult> = BTreeMap::new();
        let mut pending: VecDeque<u32> = VecDeque::new();
        for (chunk, workers) in &self.replicas {
            if workers.is_empty() {
                let result = ChunkResult::new(
                    *chunk,
                    "",
                    Status::Failed,
                    StatusExt::None,
                    "no replica available",
                );
                results.insert(*chunk, result);
            } else {
                pending.push_back(*chunk);
            }
        }

        let mut load: HashMap<String, usize> = HashMap::new();
        // Request id -> (worker, chunk) of everything in flight.
        let mut outstanding: HashMap<String, (String, u32)> = HashMap::new();
        let mut tasks: JoinSet<(String, ChunkResult)> = JoinSet::new();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            if !cancelled {
                self.dispatch(&mut pending, &mut load, &mut outstanding, &mut tasks);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!(outstanding = outstanding.len(), "Director index job cancelled");
                    self.stop_outstanding(&outstanding).await;
                }

                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((id, result)) => {
                            outstanding.remove(&id);
                            if let Some(n) = load.get_mut(&result.worker) {
                                *n = n.saturating_sub(1);
                            }
                            debug!(
                                chunk = result.chunk,
                                worker = %result.worker,
                                status = ?result.status,
                                "chunk finished"
                            );
                            results.insert(result.chunk, result);
                        }
                        Err(e) => warn!(error = %e, "index task failed"),
                    }
                }
            }
        }

        for chunk in pending {
            let result = if cancelled {
                ChunkResult::new(chunk, "", Status::Cancelled, StatusExt::None, "job cancelled")
            } else {
                ChunkResult::new(chunk, "", Status::Failed, StatusExt::None, "no worker available")
            };
            results.insert(chunk, result);
        }
        // Chunks whose task died without reporting.
        for chunk in self.replicas.keys() {
            results.entry(*chunk).or_insert_with(|| {
                ChunkResult::new(
                    *chunk,
                    "",
                    Status::Failed,
                    StatusExt::OtherException,
                    "index task failed",
                )
            });
        }

        let status = if cancelled {
            Status::Cancelled
        } else if results.values().all(|r| r.status == Status::Success) {
            Status::Success
        } else {
            Status::Failed
        };
        info!(
            status = ?status,
            failed = results.values().filter(|r| r.status != Status::Success).count(),
            "Director index job finished"
        );
        Ok(IndexJobResult {
            status,
            chunks: results,
        })
    }

    /// Start requests for every pending chunk that has a worker with spare
    /// capacity.
    fn dispatch(
        &self,
        pending: &mut VecDeque<u32>,
        load: &mut HashMap<String, usize>,
        outstanding: &mut HashMap<String, (String, u32)>,
        tasks: &mut JoinSet<(String, ChunkResult)>,
    ) {
        let mut waiting = VecDeque::with_capacity(pending.len());
        while let Some(chunk) = pending.pop_front() {
            let workers = self
                .replicas
                .get(&chunk)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let Some(worker) = pick_worker(workers, load, self.max_requests_per_worker) else {
                waiting.push_back(chunk);
                continue;
            };
            *load.entry(worker.clone()).or_default() += 1;

            let id = WorkerClient::new_id();
            outstanding.insert(id.clone(), (worker.clone(), chunk));
            tasks.spawn(extract(
                self.client.clone(),
                self.sink.clone(),
                self.cancel.clone(),
                worker,
                id,
                self.priority,
                self.request(chunk),
            ));
        }
        *pending = waiting;
    }

    async fn stop_outstanding(&self, outstanding: &HashMap<String, (String, u32)>) {
        for (id, (worker, chunk)) in outstanding {
            if let Err(e) = self.client.stop(worker, id, QueuedRequestType::Index).await {
                warn!(worker = %worker, chunk, error = %e, "failed to stop index request");
            }
        }
    }
}

/// The least loaded worker below `max` requests, ties broken by name.
fn pick_worker(workers: &[String], load: &HashMap<String, usize>, max: usize) -> Option<String> {
    workers
        .iter()
        .map(|w| (load.get(w).copied().unwrap_or(0), w))
        .filter(|(n, _)| *n < max)
        .min()
        .map(|(_, w)| w.clone())
}

async fn extract(
    client: Arc<WorkerClient>,
    sink: Arc<dyn IndexSink>,
    cancel: CancellationToken,
    worker: String,
    id: String,
    priority: i32,
    body: IndexRequest,
) -> (String, ChunkResult) {
    let chunk = body.chunk;
    let work = async {
        let submitted = client.submit_as(&worker, &id, priority, &body).await?;
        if submitted.response.outcome().0.is_terminal() {
            return Ok(submitted.response);
        }
        client.track_until_finished::<IndexRequest>(&worker, &id).await
    };
    let outcome = tokio::select! {
        outcome = work => outcome,
        _ = cancel.cancelled() => Err(ControllerError::Cancelled),
    };

    let result = match outcome {
        Ok(response) => {
            let (status, status_ext) = response.outcome();
            if status == Status::Success {
                match sink.load(chunk, &worker, response.data).await {
                    Ok(()) => {
                        ChunkResult::new(chunk, &worker, Status::Success, StatusExt::None, "")
                    }
                    Err(e) => ChunkResult::new(
                        chunk,
                        &worker,
                        Status::Failed,
                        StatusExt::OtherException,
                        e,
                    ),
                }
            } else {
                ChunkResult::new(chunk, &worker, status, status_ext, response.error)
            }
        }
        Err(ControllerError::Cancelled) => {
            ChunkResult::new(chunk, &worker, Status::Cancelled, StatusExt::None, "job cancelled")
        }
        Err(e) => {
            ChunkResult::new(chunk, &worker, Status::Failed, StatusExt::None, e.to_string())
        }
    };
    (id, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pick_least_loaded() {
        let load = HashMap::from([("a".to_string(), 2), ("b".to_string(), 1)]);
        assert_eq!(pick_worker(&names(&["a", "b"]), &load, 3), Some("b".to_string()));
    }

    #[test]
    fn test_pick_ties_by_name() {
        let load = HashMap::new();
        assert_eq!(pick_worker(&names(&["c", "a", "b"]), &load, 1), Some("a".to_string()));
    }

    #[test]
    fn test_pick_respects_capacity() {
        let load = HashMap::from([("a".to_string(), 1), ("b".to_string(), 1)]);
        assert_eq!(pick_worker(&names(&["a", "b"]), &load, 1), None);
        assert_eq!(pick_worker(&names(&["a", "b", "z"]), &load, 1), Some("z".to_string()));
    }
}
