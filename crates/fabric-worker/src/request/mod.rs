// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Requests executed by the worker processor.
//!
//! A [`WorkerRequest`] carries the decoded body of one queued request
//! ([`RequestKind`]) and its mutable progress: status, extended status,
//! error text, timeline and the kind-specific result. Processing tasks call
//! [`WorkerRequest::execute`] until it reports completion:
//! - `Ok(true)`: the request reached a terminal state
//! - `Ok(false)`: more steps remain (replication copies one file per step)
//! - `Err(RequestCancelled)`: a cancellation was observed and the request
//!   is now `CANCELLED`

mod echo;
mod index;
mod replica;
mod sql;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use fabric_config::Configuration;
use fabric_protocol::FrameError;
use fabric_protocol::ProtocolBuffer;
use fabric_protocol::messages::{
    DeleteRequest, DeleteResponse, EchoRequest, EchoResponse, FindAllRequest, FindAllResponse,
    FindRequest, FindResponse, IndexRequest, IndexResponse, Performance, QueuedRequestType,
    QueuedResponse, ReplicaInfo, ReplicateRequest, ReplicateResponse, ServiceRequestInfo,
    SqlRequest, SqlResponse, SqlResultSet, Status, StatusExt, StatusResponse,
};
use thiserror::Error;
use tracing::debug;

use crate::database::Database;
use crate::now_ms;

pub use replica::{chunk_file_names, parse_chunk_file_name};

/// Everything a request needs to run on this worker.
pub struct RequestContext {
    /// Name of this worker in the registry
    pub worker: String,
    pub config: Arc<Configuration>,
    /// Pooled sessions with the worker's database server
    pub pool: Arc<dyn Database>,
    /// Registry file re-read on `SERVICE_RECONFIG`
    pub config_path: Option<PathBuf>,
}

/// Decoded body of a queued request.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Echo(EchoRequest),
    Replicate(ReplicateRequest),
    Delete(DeleteRequest),
    Find(FindRequest),
    FindAll(FindAllRequest),
    Index(IndexRequest),
    Sql(SqlRequest),
}

impl RequestKind {
    pub fn queued_type(&self) -> QueuedRequestType {
        match self {
            Self::Echo(_) => QueuedRequestType::TestEcho,
            Self::Replicate(_) => QueuedRequestType::ReplicaCreate,
            Self::Delete(_) => QueuedRequestType::ReplicaDelete,
            Self::Find(_) => QueuedRequestType::ReplicaFind,
            Self::FindAll(_) => QueuedRequestType::ReplicaFindAll,
            Self::Index(_) => QueuedRequestType::Index,
            Self::Sql(_) => QueuedRequestType::Sql,
        }
    }
}

/// The request observed a cancellation and is now `CANCELLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request cancelled")]
pub struct RequestCancelled;

/// Result produced by a finished request.
#[derive(Debug, Clone, Default)]
pub(crate) enum Payload {
    #[default]
    None,
    Echo(String),
    Replica(ReplicaInfo),
    Replicas(Vec<ReplicaInfo>),
    Index(Vec<u8>),
    Sql(Vec<SqlResultSet>),
}

/// A failure to report: extended status plus message.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub ext: StatusExt,
    pub error: String,
}

impl Failure {
    pub fn new(ext: StatusExt, error: impl Into<String>) -> Self {
        Self {
            ext,
            error: error.into(),
        }
    }
}

#[derive(Debug)]
struct State {
    status: Status,
    status_ext: StatusExt,
    error: String,
    performance: Performance,
    payload: Payload,
    copy: Option<replica::CopyPlan>,
}

#[derive(Debug)]
pub struct WorkerRequest {
    id: String,
    priority: i32,
    kind: RequestKind,
    state: Mutex<State>,
}

impl WorkerRequest {
    pub fn new(id: impl Into<String>, priority: i32, kind: RequestKind) -> Self {
        Self {
            id: id.into(),
            priority,
            kind,
            state: Mutex::new(State {
                status: Status::Created,
                status_ext: StatusExt::None,
                error: String::new(),
                performance: Performance {
                    receive_time: now_ms(),
                    start_time: 0,
                    finish_time: 0,
                },
                payload: Payload::None,
                copy: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn queued_type(&self) -> QueuedRequestType {
        self.kind.queued_type()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn status_ext(&self) -> StatusExt {
        self.lock().status_ext
    }

    pub fn error(&self) -> String {
        self.lock().error.clone()
    }

    pub fn performance(&self) -> Performance {
        self.lock().performance.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Transitions driven by the processor
    // ========================================================================

    pub(crate) fn mark_queued(&self) {
        let mut state = self.lock();
        state.status = Status::Queued;
    }

    pub(crate) fn start(&self) {
        let mut state = self.lock();
        state.status = Status::InProgress;
        if state.performance.start_time == 0 {
            state.performance.start_time = now_ms();
        }
    }

    /// Put a request taken back from a stopping task into the queue state.
    /// Progress made so far (copied files) is kept.
    pub(crate) fn requeue(&self) {
        let mut state = self.lock();
        if state.status == Status::InProgress {
            state.status = Status::Queued;
        }
    }

    /// Request cancellation and return the resulting status.
    ///
    /// Queued requests are cancelled at once, running ones are flagged and
    /// finish cancelling at their next step, finished ones are unchanged.
    pub fn cancel(&self) -> Status {
        let mut state = self.lock();
        match state.status {
            Status::Created | Status::Queued => {
                state.status = Status::Cancelled;
                state.performance.finish_time = now_ms();
            }
            Status::InProgress => state.status = Status::IsCancelling,
            _ => {}
        }
        state.status
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Advance the request by one step.
    pub async fn execute(&self, ctx: &RequestContext) -> Result<bool, RequestCancelled> {
        match self.status() {
            Status::InProgress => {}
            Status::IsCancelling => {
                self.check_cancelled()?;
            }
            status => {
                debug!(id = %self.id, ?status, "request is not runnable");
                return Ok(true);
            }
        }
        match &self.kind {
            RequestKind::Echo(body) => echo::execute(self, body).await,
            RequestKind::Replicate(body) => replica::replicate(self, ctx, body).await,
            RequestKind::Delete(body) => replica::delete(self, ctx, body).await,
            RequestKind::Find(body) => replica::find(self, ctx, body).await,
            RequestKind::FindAll(body) => replica::find_all(self, ctx, body).await,
            RequestKind::Index(body) => index::execute(self, ctx, body).await,
            RequestKind::Sql(body) => sql::execute(self, ctx, body).await,
        }
    }

    /// Turn a pending cancellation into `CANCELLED`.
    pub(crate) fn check_cancelled(&self) -> Result<(), RequestCancelled> {
        let mut state = self.lock();
        if state.status == Status::IsCancelling {
            state.status = Status::Cancelled;
            state.performance.finish_time = now_ms();
            return Err(RequestCancelled);
        }
        Ok(())
    }

    fn finish(&self, status: Status, failure: Option<Failure>, payload: Payload) {
        let mut state = self.lock();
        state.status = status;
        match failure {
            Some(f) => {
                state.status_ext = f.ext;
                state.error = f.error;
            }
            None => {
                state.status_ext = StatusExt::None;
                state.error.clear();
            }
        }
        state.payload = payload;
        state.copy = None;
        state.performance.finish_time = now_ms();
    }

    pub(crate) fn succeed(&self, payload: Payload) {
        self.finish(Status::Success, None, payload);
    }

    pub(crate) fn fail(&self, failure: Failure) {
        debug!(id = %self.id, ext = ?failure.ext, error = %failure.error, "request failed");
        self.finish(Status::Failed, Some(failure), Payload::None);
    }

    /// Fail while still reporting a partial result (SQL batches).
    pub(crate) fn fail_with(&self, failure: Failure, payload: Payload) {
        self.finish(Status::Failed, Some(failure), payload);
    }

    fn with_copy<T>(&self, f: impl FnOnce(&mut Option<replica::CopyPlan>) -> T) -> T {
        f(&mut self.lock().copy)
    }

    /// Remove the temporary files of a copy interrupted by cancellation.
    /// Progress of a request that may still resume is left alone.
    pub(crate) async fn discard_abandoned_copy(&self) {
        let plan = {
            let mut state = self.lock();
            if state.status != Status::Cancelled {
                return;
            }
            state.copy.take()
        };
        if let Some(plan) = plan {
            debug!(id = %self.id, "discarding interrupted copy");
            plan.discard().await;
        }
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Typed response reflecting the current state.
    pub fn response(&self) -> ResponseBody {
        let state = self.lock();
        let mut body = ResponseBody::empty(self.queued_type());
        body.set_outcome(state.status, state.status_ext, state.error.clone());
        body.set_performance(state.performance.clone());
        match (&mut body, &state.payload) {
            (ResponseBody::Echo(r), Payload::Echo(data)) => r.data = data.clone(),
            (ResponseBody::Replicate(r), Payload::Replica(info)) => {
                r.replica_info = Some(info.clone())
            }
            (ResponseBody::Delete(r), Payload::Replica(info)) => {
                r.replica_info = Some(info.clone())
            }
            (ResponseBody::Find(r), Payload::Replica(info)) => r.replica_info = Some(info.clone()),
            (ResponseBody::FindAll(r), Payload::Replicas(infos)) => {
                r.replica_info_many = infos.clone()
            }
            (ResponseBody::Index(r), Payload::Index(data)) => r.data = data.clone(),
            (ResponseBody::Sql(r), Payload::Sql(sets)) => r.result_sets = sets.clone(),
            _ => {}
        }
        body
    }

    /// Status-only view for `REQUEST_STATUS` and `REQUEST_STOP`.
    pub fn status_response(&self) -> StatusResponse {
        let state = self.lock();
        StatusResponse {
            status: state.status as i32,
            status_ext: state.status_ext as i32,
            error: state.error.clone(),
            performance: Some(state.performance.clone()),
        }
    }

    pub fn info(&self) -> ServiceRequestInfo {
        ServiceRequestInfo {
            id: self.id.clone(),
            queued_type: self.queued_type() as i32,
            priority: self.priority,
            status: self.status() as i32,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Response body matching a queued request type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Echo(EchoResponse),
    Replicate(ReplicateResponse),
    Delete(DeleteResponse),
    Find(FindResponse),
    FindAll(FindAllResponse),
    Index(IndexResponse),
    Sql(SqlResponse),
}

macro_rules! each_body {
    ($body:expr, $r:ident => $e:expr) => {
        match $body {
            ResponseBody::Echo($r) => $e,
            ResponseBody::Replicate($r) => $e,
            ResponseBody::Delete($r) => $e,
            ResponseBody::Find($r) => $e,
            ResponseBody::FindAll($r) => $e,
            ResponseBody::Index($r) => $e,
            ResponseBody::Sql($r) => $e,
        }
    };
}

impl ResponseBody {
    pub fn empty(queued_type: QueuedRequestType) -> Self {
        match queued_type {
            QueuedRequestType::TestEcho => Self::Echo(Default::default()),
            QueuedRequestType::ReplicaCreate => Self::Replicate(Default::default()),
            QueuedRequestType::ReplicaDelete => Self::Delete(Default::default()),
            QueuedRequestType::ReplicaFind => Self::Find(Default::default()),
            QueuedRequestType::ReplicaFindAll => Self::FindAll(Default::default()),
            QueuedRequestType::Index => Self::Index(Default::default()),
            QueuedRequestType::Sql => Self::Sql(Default::default()),
        }
    }

    /// A response that reports `status` without any request behind it.
    pub fn rejected(
        queued_type: QueuedRequestType,
        status: Status,
        status_ext: StatusExt,
        error: impl Into<String>,
    ) -> Self {
        let mut body = Self::empty(queued_type);
        body.set_outcome(status, status_ext, error.into());
        body
    }

    pub fn queued_type(&self) -> QueuedRequestType {
        match self {
            Self::Echo(_) => QueuedRequestType::TestEcho,
            Self::Replicate(_) => QueuedRequestType::ReplicaCreate,
            Self::Delete(_) => QueuedRequestType::ReplicaDelete,
            Self::Find(_) => QueuedRequestType::ReplicaFind,
            Self::FindAll(_) => QueuedRequestType::ReplicaFindAll,
            Self::Index(_) => QueuedRequestType::Index,
            Self::Sql(_) => QueuedRequestType::Sql,
        }
    }

    pub fn outcome(&self) -> (Status, StatusExt) {
        each_body!(self, r => r.outcome())
    }

    fn set_outcome(&mut self, status: Status, status_ext: StatusExt, error: String) {
        each_body!(self, r => r.set_outcome(status, status_ext, error))
    }

    fn set_performance(&mut self, performance: Performance) {
        each_body!(self, r => r.set_performance(performance))
    }

    /// Append the body as one frame.
    pub fn serialize_into(&self, buf: &mut ProtocolBuffer) -> Result<(), FrameError> {
        each_body!(self, r => buf.serialize(r))
    }
}
