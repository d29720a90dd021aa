// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Priority queue and processing pool of the worker.
//!
//! Requests move through three containers guarded by one mutex:
//! `new` (a priority heap), `in_progress` and `finished`. A fixed number of
//! processing tasks take the highest-priority request (FIFO among equal
//! priorities), execute it step by step, and park it in `finished` where
//! controllers can still query it until it is disposed or expires.
//!
//! The service cycles through `Running -> Stopping -> Stopped`: stopping
//! lets the tasks finish their current step and exit, and requests
//! interrupted between steps go back to the queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fabric_config::{ConfigError, GeneralSettings};
use fabric_protocol::messages::{
    DisposedId, ServiceResponse, ServiceState, Status, StatusExt, StatusResponse,
};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::now_ms;
use crate::request::{RequestCancelled, RequestContext, RequestKind, ResponseBody, WorkerRequest};

/// Storage technology reported in service status.
const TECHNOLOGY: &str = "FS";

/// Configuration for the worker processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of processing tasks.
    pub num_threads: usize,
    /// How long an idle task waits for work before re-checking the state.
    pub fetch_timeout: Duration,
    /// Finished requests older than this are forgotten.
    pub finished_max_age: Duration,
    /// How often finished requests are checked for expiry.
    pub housekeeping_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_general(&GeneralSettings::default())
    }
}

impl ProcessorConfig {
    pub fn from_general(general: &GeneralSettings) -> Self {
        Self {
            num_threads: general.worker_num_processing_threads.max(1),
            fetch_timeout: Duration::from_secs(1),
            finished_max_age: Duration::from_secs(general.worker_finished_request_max_age_sec),
            housekeeping_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Running,
    Stopping,
    Stopped,
}

impl From<ProcessorState> for ServiceState {
    fn from(state: ProcessorState) -> Self {
        match state {
            ProcessorState::Running => ServiceState::Running,
            ProcessorState::Stopping => ServiceState::SuspendInProgress,
            ProcessorState::Stopped => ServiceState::Suspended,
        }
    }
}

/// Heap entry: higher priority first, then earlier arrival.
struct Queued {
    priority: i32,
    sequence: u64,
    request: Arc<WorkerRequest>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Inner {
    state: ProcessorState,
    new_requests: BinaryHeap<Queued>,
    /// Arrival sequence kept so a refused request regains its place.
    in_progress: HashMap<String, (u64, Arc<WorkerRequest>)>,
    finished: HashMap<String, Arc<WorkerRequest>>,
    next_sequence: u64,
    active_tasks: usize,
}

impl Inner {
    fn find(&self, id: &str) -> Option<Arc<WorkerRequest>> {
        self.new_requests
            .iter()
            .find(|q| q.request.id() == id)
            .map(|q| q.request.clone())
            .or_else(|| self.in_progress.get(id).map(|(_, r)| r.clone()))
            .or_else(|| self.finished.get(id).cloned())
    }
}

pub struct WorkerProcessor {
    ctx: Arc<RequestContext>,
    config: ProcessorConfig,
    inner: Mutex<Inner>,
    /// Signalled on new requests and on state changes.
    changed: Notify,
    start_time: u64,
    shutdown: Arc<Notify>,
}

impl WorkerProcessor {
    /// Create a stopped processor; call [`run`](Self::run) to start the
    /// processing tasks.
    pub fn new(ctx: Arc<RequestContext>, config: ProcessorConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            inner: Mutex::new(Inner {
                state: ProcessorState::Stopped,
                new_requests: BinaryHeap::new(),
                in_progress: HashMap::new(),
                finished: HashMap::new(),
                next_sequence: 0,
                active_tasks: 0,
            }),
            changed: Notify::new(),
            start_time: now_ms(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.ctx
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Get a handle that can be used to stop housekeeping.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ProcessorState {
        self.lock().state
    }

    // ========================================================================
    // Queued requests
    // ========================================================================

    /// Queue a new request and return its initial response.
    #[instrument(skip(self, kind), fields(kind = ?kind.queued_type()))]
    pub fn enqueue(&self, id: &str, priority: i32, kind: RequestKind) -> ResponseBody {
        let queued_type = kind.queued_type();
        let request = Arc::new(WorkerRequest::new(id, priority, kind));
        {
            let mut inner = self.lock();
            if inner.find(id).is_some() {
                return ResponseBody::rejected(
                    queued_type,
                    Status::Bad,
                    StatusExt::InvalidId,
                    format!("request {id} already exists"),
                );
            }
            request.mark_queued();
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.new_requests.push(Queued {
                priority,
                sequence,
                request: request.clone(),
            });
        }
        self.changed.notify_waiters();
        debug!(priority, "request queued");
        request.response()
    }

    /// Remove a queued request (it becomes `CANCELLED`) or flag a running
    /// one for cancellation. Finished requests are left as they are.
    ///
    /// A request that was interrupted mid-copy and sits in the queue has its
    /// temporary files removed.
    pub async fn dequeue_or_cancel(&self, id: &str) -> Option<Arc<WorkerRequest>> {
        let request = self.cancel_by_id(id)?;
        request.discard_abandoned_copy().await;
        Some(request)
    }

    fn cancel_by_id(&self, id: &str) -> Option<Arc<WorkerRequest>> {
        let mut inner = self.lock();

        let mut dequeued = None;
        inner.new_requests.retain(|q| {
            if q.request.id() == id {
                dequeued = Some(q.request.clone());
                false
            } else {
                true
            }
        });
        if let Some(request) = dequeued {
            request.cancel();
            inner.finished.insert(id.to_string(), request.clone());
            debug!(id, "queued request cancelled");
            return Some(request);
        }

        if let Some((_, request)) = inner.in_progress.get(id) {
            request.cancel();
            debug!(id, "running request flagged for cancellation");
            return Some(request.clone());
        }

        inner.finished.get(id).cloned()
    }

    pub fn find(&self, id: &str) -> Option<Arc<WorkerRequest>> {
        self.lock().find(id)
    }

    /// Status of a known request.
    pub fn check_status(&self, id: &str) -> Option<StatusResponse> {
        self.find(id).map(|r| r.status_response())
    }

    /// Full typed response of a known request.
    pub fn track(&self, id: &str) -> Option<ResponseBody> {
        self.find(id).map(|r| r.response())
    }

    /// Forget finished requests. Unknown and unfinished ids are reported as
    /// not disposed.
    pub fn dispose(&self, ids: &[String]) -> Vec<DisposedId> {
        let mut inner = self.lock();
        ids.iter()
            .map(|id| DisposedId {
                id: id.clone(),
                disposed: inner.finished.remove(id).is_some(),
            })
            .collect()
    }

    /// Drop finished requests older than `max_age`; returns how many.
    pub fn expire_finished(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut inner = self.lock();
        let before = inner.finished.len();
        inner
            .finished
            .retain(|_, r| r.performance().finish_time >= cutoff);
        before - inner.finished.len()
    }

    // ========================================================================
    // Processing tasks
    // ========================================================================

    /// Wait up to `timeout` for the next request and move it to
    /// `in_progress`. Returns `None` on timeout or when not running.
    pub async fn fetch_next_for_processing(&self, timeout: Duration) -> Option<Arc<WorkerRequest>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.state != ProcessorState::Running {
                    return None;
                }
                if let Some(queued) = inner.new_requests.pop() {
                    queued.request.start();
                    inner.in_progress.insert(
                        queued.request.id().to_string(),
                        (queued.sequence, queued.request.clone()),
                    );
                    return Some(queued.request);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Move a request that reached a terminal state to `finished`.
    fn processing_finished(&self, request: &Arc<WorkerRequest>) {
        let mut inner = self.lock();
        inner.in_progress.remove(request.id());
        inner
            .finished
            .insert(request.id().to_string(), request.clone());
    }

    /// Return a request interrupted by a stopping processor to the queue.
    /// A request flagged for cancellation is cancelled instead.
    pub fn processing_refused(&self, request: &Arc<WorkerRequest>) {
        let mut inner = self.lock();
        let Some((sequence, _)) = inner.in_progress.remove(request.id()) else {
            return;
        };
        if request.check_cancelled().is_err() {
            inner
                .finished
                .insert(request.id().to_string(), request.clone());
            return;
        }
        request.requeue();
        inner.new_requests.push(Queued {
            priority: request.priority(),
            sequence,
            request: request.clone(),
        });
        debug!(id = request.id(), "request returned to the queue");
    }

    async fn process(&self, request: Arc<WorkerRequest>) {
        loop {
            match request.execute(&self.ctx).await {
                Ok(true) => {
                    self.processing_finished(&request);
                    return;
                }
                Err(RequestCancelled) => {
                    request.discard_abandoned_copy().await;
                    self.processing_finished(&request);
                    return;
                }
                Ok(false) => {
                    if self.state() != ProcessorState::Running {
                        self.processing_refused(&request);
                        request.discard_abandoned_copy().await;
                        return;
                    }
                }
            }
        }
    }

    async fn processing_loop(self: Arc<Self>, task: usize) {
        debug!(task, "processing task started");
        while self.state() == ProcessorState::Running {
            if let Some(request) = self.fetch_next_for_processing(self.config.fetch_timeout).await {
                self.process(request).await;
            }
        }

        {
            let mut inner = self.lock();
            inner.active_tasks -= 1;
            if inner.active_tasks == 0 && inner.state == ProcessorState::Stopping {
                inner.state = ProcessorState::Stopped;
                info!("Worker processor stopped");
            }
        }
        self.changed.notify_waiters();
        debug!(task, "processing task exited");
    }

    // ========================================================================
    // Service control
    // ========================================================================

    /// Start the processing tasks. Waits for a stop in progress to complete
    /// first; a no-op when already running.
    pub async fn run(self: &Arc<Self>) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                match inner.state {
                    ProcessorState::Running => return,
                    ProcessorState::Stopped => {
                        inner.state = ProcessorState::Running;
                        inner.active_tasks = self.config.num_threads;
                        drop(inner);

                        for task in 0..self.config.num_threads {
                            tokio::spawn(self.clone().processing_loop(task));
                        }
                        info!(
                            num_threads = self.config.num_threads,
                            "Worker processor started"
                        );
                        return;
                    }
                    ProcessorState::Stopping => {}
                }
            }

            notified.await;
        }
    }

    /// Let the processing tasks finish their current step and exit.
    pub fn stop(&self) {
        {
            let mut inner = self.lock();
            if inner.state != ProcessorState::Running {
                return;
            }
            inner.state = if inner.active_tasks == 0 {
                ProcessorState::Stopped
            } else {
                ProcessorState::Stopping
            };
        }
        self.changed.notify_waiters();
        info!("Worker processor stopping");
    }

    /// Cancel every queued and running request.
    pub async fn drain(&self) {
        let cancelled: Vec<Arc<WorkerRequest>> = {
            let mut inner = self.lock();
            let queued = std::mem::take(&mut inner.new_requests);
            let cancelled: Vec<_> = queued.into_iter().map(|q| q.request).collect();
            for request in &cancelled {
                request.cancel();
                inner
                    .finished
                    .insert(request.id().to_string(), request.clone());
            }
            for (_, request) in inner.in_progress.values() {
                request.cancel();
            }
            info!(
                queued = cancelled.len(),
                in_progress = inner.in_progress.len(),
                "Worker processor drained"
            );
            cancelled
        };
        for request in cancelled {
            request.discard_abandoned_copy().await;
        }
    }

    /// Re-read the registry file the worker was started with.
    pub fn reconfig(&self) -> Result<(), ConfigError> {
        match &self.ctx.config_path {
            Some(path) => {
                self.ctx.config.reload(path)?;
                info!(path = %path.display(), "Configuration reloaded");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Service summary; `extended` adds the per-request lists.
    pub fn service_status(&self, extended: bool) -> ServiceResponse {
        let inner = self.lock();
        let mut response = ServiceResponse {
            status: Status::Success as i32,
            status_ext: StatusExt::None as i32,
            service_state: ServiceState::from(inner.state) as i32,
            technology: TECHNOLOGY.to_string(),
            start_time: self.start_time,
            num_new_requests: inner.new_requests.len() as u32,
            num_in_progress_requests: inner.in_progress.len() as u32,
            num_finished_requests: inner.finished.len() as u32,
            ..Default::default()
        };
        if extended {
            let mut queued: Vec<&Queued> = inner.new_requests.iter().collect();
            queued.sort_by(|a, b| b.cmp(a));
            response.new_requests = queued.iter().map(|q| q.request.info()).collect();
            response.in_progress_requests =
                inner.in_progress.values().map(|(_, r)| r.info()).collect();
            response.finished_requests = inner.finished.values().map(|r| r.info()).collect();
        }
        response
    }

    /// Periodically expire old finished requests until shutdown.
    pub async fn run_housekeeping(&self) {
        info!(
            interval_secs = self.config.housekeeping_interval.as_secs(),
            max_age_secs = self.config.finished_max_age.as_secs(),
            "Request housekeeping started"
        );
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Request housekeeping received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.housekeeping_interval) => {
                    let expired = self.expire_finished(self.config.finished_max_age);
                    if expired > 0 {
                        debug!(expired, "expired finished requests");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ScriptedDatabase;
    use crate::request::chunk_file_names;
    use fabric_config::{Configuration, DatabaseFamilyInfo, DatabaseInfo, WorkerInfo};
    use fabric_protocol::messages::{EchoRequest, ReplicateRequest};
    use std::path::Path;
    use tempfile::TempDir;

    fn processor(num_threads: usize) -> Arc<WorkerProcessor> {
        let config = Configuration::new(GeneralSettings::default());
        config
            .add_worker(WorkerInfo::new("worker-a", "127.0.0.1", 25000))
            .unwrap();
        let ctx = RequestContext {
            worker: "worker-a".into(),
            config: Arc::new(config),
            pool: Arc::new(ScriptedDatabase::new()),
            config_path: None,
        };
        WorkerProcessor::new(
            Arc::new(ctx),
            ProcessorConfig {
                num_threads,
                fetch_timeout: Duration::from_millis(50),
                ..ProcessorConfig::default()
            },
        )
    }

    fn gaia() -> DatabaseInfo {
        let mut info = DatabaseInfo::new("gaia", "production");
        info.partitioned_tables = vec!["Object".into()];
        info
    }

    /// A stopped processor on `worker-a` able to copy chunk 7 of `gaia`
    /// from `worker-b`.
    fn replica_processor() -> (Arc<WorkerProcessor>, TempDir, TempDir) {
        let data_a = TempDir::new().unwrap();
        let data_b = TempDir::new().unwrap();
        let config = Configuration::new(GeneralSettings::default());
        config
            .add_family(DatabaseFamilyInfo {
                name: "production".into(),
                replication_level: 2,
                num_stripes: 340,
                num_sub_stripes: 3,
                overlap: 0.01667,
            })
            .unwrap();
        config.add_database(gaia()).unwrap();
        for (name, dir) in [("worker-a", &data_a), ("worker-b", &data_b)] {
            let mut worker = WorkerInfo::new(name, "127.0.0.1", 25000);
            worker.data_dir = dir.path().to_path_buf();
            config.add_worker(worker).unwrap();
        }

        let source = data_b.path().join("gaia");
        std::fs::create_dir_all(&source).unwrap();
        for name in chunk_file_names(&gaia(), 7) {
            std::fs::write(source.join(&name), vec![7u8; 4096]).unwrap();
        }

        let ctx = RequestContext {
            worker: "worker-a".into(),
            config: Arc::new(config),
            pool: Arc::new(ScriptedDatabase::new()),
            config_path: None,
        };
        let processor = WorkerProcessor::new(Arc::new(ctx), ProcessorConfig::default());
        (processor, data_a, data_b)
    }

    fn replicate() -> RequestKind {
        RequestKind::Replicate(ReplicateRequest {
            database: "gaia".into(),
            chunk: 7,
            worker: "worker-b".into(),
        })
    }

    fn temp_files(data_dir: &Path) -> Vec<String> {
        std::fs::read_dir(data_dir.join("gaia"))
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with('_'))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Take the queued replicate and copy its first file.
    async fn copy_one_file(processor: &Arc<WorkerProcessor>) -> Arc<WorkerRequest> {
        processor.lock().state = ProcessorState::Running;
        let request = processor
            .fetch_next_for_processing(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(request.execute(&processor.ctx).await, Ok(false));
        request
    }

    fn echo(delay: u64) -> RequestKind {
        RequestKind::Echo(EchoRequest {
            data: "ping".into(),
            delay,
        })
    }

    async fn wait_for(processor: &WorkerProcessor, id: &str, status: Status) {
        for _ in 0..200 {
            if processor.find(id).is_some_and(|r| r.status() == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_priority_order() {
        let processor = processor(1);
        for (id, priority) in [("low", 1), ("high", 5), ("mid", 3)] {
            processor.enqueue(id, priority, echo(0));
        }
        processor.lock().state = ProcessorState::Running;

        let mut order = Vec::new();
        for _ in 0..3 {
            let request = processor
                .fetch_next_for_processing(Duration::from_millis(10))
                .await
                .unwrap();
            order.push(request.id().to_string());
        }
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert!(processor
            .fetch_next_for_processing(Duration::from_millis(10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_fifo_among_equal_priorities() {
        let processor = processor(1);
        for id in ["a", "b", "c"] {
            processor.enqueue(id, 2, echo(0));
        }
        processor.lock().state = ProcessorState::Running;

        let first = processor
            .fetch_next_for_processing(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.id(), "a");

        // A refused request regains its place ahead of later arrivals.
        processor.processing_refused(&first);
        assert_eq!(first.status(), Status::Queued);
        let again = processor
            .fetch_next_for_processing(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(again.id(), "a");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let processor = processor(1);
        processor.enqueue("r", 0, echo(0));
        let response = processor.enqueue("r", 0, echo(0));
        assert_eq!(response.outcome(), (Status::Bad, StatusExt::InvalidId));
        assert_eq!(processor.service_status(false).num_new_requests, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_is_idempotent() {
        let processor = processor(1);
        processor.enqueue("r", 0, echo(0));

        let request = processor.dequeue_or_cancel("r").await.unwrap();
        assert_eq!(request.status(), Status::Cancelled);
        let again = processor.dequeue_or_cancel("r").await.unwrap();
        assert_eq!(again.status(), Status::Cancelled);

        let status = processor.service_status(false);
        assert_eq!(status.num_new_requests, 0);
        assert_eq!(status.num_finished_requests, 1);
        assert!(processor.dequeue_or_cancel("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_requests_run_to_completion() {
        let processor = processor(2);
        processor.run().await;
        processor.enqueue("r", 0, echo(0));
        wait_for(&processor, "r", Status::Success).await;

        let Some(ResponseBody::Echo(response)) = processor.track("r") else {
            panic!("expected an echo response");
        };
        assert_eq!(response.data, "ping");
        processor.stop();
    }

    #[tokio::test]
    async fn test_cancel_running_request() {
        let processor = processor(1);
        processor.run().await;
        processor.enqueue("slow", 0, echo(5_000));
        wait_for(&processor, "slow", Status::InProgress).await;

        let request = processor.dequeue_or_cancel("slow").await.unwrap();
        assert_eq!(request.status(), Status::IsCancelling);
        wait_for(&processor, "slow", Status::Cancelled).await;
        assert_eq!(processor.service_status(false).num_finished_requests, 1);
        processor.stop();
    }

    #[tokio::test]
    async fn test_stop_and_resume() {
        let processor = processor(2);
        processor.run().await;
        assert_eq!(processor.state(), ProcessorState::Running);

        processor.stop();
        for _ in 0..100 {
            if processor.state() == ProcessorState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.state(), ProcessorState::Stopped);

        // Requests queue up while stopped and run after resuming.
        processor.enqueue("r", 0, echo(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.find("r").unwrap().status(), Status::Queued);

        processor.run().await;
        assert_eq!(processor.state(), ProcessorState::Running);
        wait_for(&processor, "r", Status::Success).await;
        processor.stop();
    }

    #[tokio::test]
    async fn test_drain() {
        let processor = processor(1);
        processor.run().await;
        processor.enqueue("running", 10, echo(5_000));
        wait_for(&processor, "running", Status::InProgress).await;
        processor.stop();
        for id in ["q1", "q2"] {
            processor.enqueue(id, 0, echo(0));
        }

        processor.drain().await;
        assert_eq!(processor.find("q1").unwrap().status(), Status::Cancelled);
        assert_eq!(processor.find("q2").unwrap().status(), Status::Cancelled);
        wait_for(&processor, "running", Status::Cancelled).await;
        assert_eq!(processor.service_status(false).num_new_requests, 0);
    }

    #[tokio::test]
    async fn test_cancel_requeued_copy_removes_temporary_files() {
        let (processor, data_a, _data_b) = replica_processor();
        processor.enqueue("copy", 0, replicate());
        let request = copy_one_file(&processor).await;
        assert_eq!(temp_files(data_a.path()).len(), 1);

        // Interrupted by a stop, then cancelled while back in the queue.
        processor.processing_refused(&request);
        assert_eq!(request.status(), Status::Queued);
        assert_eq!(temp_files(data_a.path()).len(), 1);

        let cancelled = processor.dequeue_or_cancel("copy").await.unwrap();
        assert_eq!(cancelled.status(), Status::Cancelled);
        assert!(temp_files(data_a.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_copy_removes_temporary_files() {
        let (processor, data_a, _data_b) = replica_processor();
        processor.enqueue("copy", 0, replicate());
        let request = copy_one_file(&processor).await;

        assert_eq!(request.cancel(), Status::IsCancelling);
        processor.process(request.clone()).await;
        assert_eq!(request.status(), Status::Cancelled);
        assert!(temp_files(data_a.path()).is_empty());
        assert_eq!(processor.service_status(false).num_finished_requests, 1);
    }

    #[tokio::test]
    async fn test_drain_removes_temporary_files_of_requeued_copy() {
        let (processor, data_a, _data_b) = replica_processor();
        processor.enqueue("copy", 0, replicate());
        let request = copy_one_file(&processor).await;
        processor.processing_refused(&request);

        processor.drain().await;
        assert_eq!(request.status(), Status::Cancelled);
        assert!(temp_files(data_a.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_copy_removes_temporary_files() {
        let (processor, data_a, data_b) = replica_processor();
        processor.enqueue("copy", 0, replicate());
        let request = copy_one_file(&processor).await;

        let second = &chunk_file_names(&gaia(), 7)[1];
        std::fs::remove_file(data_b.path().join("gaia").join(second)).unwrap();
        assert_eq!(request.execute(&processor.ctx).await, Ok(true));

        assert_eq!(request.status(), Status::Failed);
        assert_eq!(request.status_ext(), StatusExt::FileStat);
        assert!(temp_files(data_a.path()).is_empty());
    }

    #[tokio::test]
    async fn test_dispose_only_finished() {
        let processor = processor(1);
        processor.enqueue("queued", 0, echo(0));
        processor.enqueue("done", 0, echo(0));
        processor.dequeue_or_cancel("done").await;

        let disposed = processor.dispose(&["queued".into(), "done".into(), "nope".into()]);
        let flags: Vec<bool> = disposed.iter().map(|d| d.disposed).collect();
        assert_eq!(flags, vec![false, true, false]);
        assert!(processor.find("done").is_none());
        assert!(processor.find("queued").is_some());
    }

    #[tokio::test]
    async fn test_expire_finished() {
        let processor = processor(1);
        processor.enqueue("old", 0, echo(0));
        processor.dequeue_or_cancel("old").await;

        assert_eq!(processor.expire_finished(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(processor.expire_finished(Duration::from_millis(1)), 1);
        assert!(processor.find("old").is_none());
    }

    #[tokio::test]
    async fn test_service_status_lists() {
        let processor = processor(1);
        processor.enqueue("a", 1, echo(0));
        processor.enqueue("b", 7, echo(0));

        let brief = processor.service_status(false);
        assert_eq!(brief.service_state, ServiceState::Suspended as i32);
        assert!(brief.new_requests.is_empty());

        let full = processor.service_status(true);
        let ids: Vec<&str> = full.new_requests.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(full.technology, "FS");
    }
}
