// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed requests to workers.
//!
//! Every request is a header frame plus a body frame sent through the
//! worker's connector. Queued requests answer immediately with their
//! current state; [`WorkerClient::track_until_finished`] keeps asking with
//! `REQUEST_TRACK` until the worker reports a terminal status.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_protocol::messages::{
    DeleteRequest, DeleteResponse, DisposeRequest, DisposeResponse, EchoRequest, EchoResponse,
    FindAllRequest, FindAllResponse, FindRequest, FindResponse, HeaderType, IndexRequest,
    IndexResponse, ManagementRequest, ManagementRequestType, QueuedRequestType, QueuedResponse,
    ReplicateRequest, ReplicateResponse, RequestHeader, ServiceRequest, ServiceRequestType,
    ServiceResponse, SqlRequest, SqlResponse, Status, StatusResponse,
};
use fabric_protocol::{Messenger, ProtocolBuffer};
use prost::Message;
use tracing::{debug, instrument};

use crate::error::Result;

/// A queued request body and the response it is answered with.
pub trait TypedRequest: Message + Sized {
    type Response: QueuedResponse;
    const TYPE: QueuedRequestType;
}

macro_rules! typed_request {
    ($($req:ty => $resp:ty, $kind:ident;)*) => {
        $(
            impl TypedRequest for $req {
                type Response = $resp;
                const TYPE: QueuedRequestType = QueuedRequestType::$kind;
            }
        )*
    };
}

typed_request! {
    EchoRequest => EchoResponse, TestEcho;
    ReplicateRequest => ReplicateResponse, ReplicaCreate;
    DeleteRequest => DeleteResponse, ReplicaDelete;
    FindRequest => FindResponse, ReplicaFind;
    FindAllRequest => FindAllResponse, ReplicaFindAll;
    IndexRequest => IndexResponse, Index;
    SqlRequest => SqlResponse, Sql;
}

/// A queued request accepted by a worker.
#[derive(Debug, Clone)]
pub struct Submitted<R> {
    pub worker: String,
    pub id: String,
    /// The worker's answer at submission time.
    pub response: R,
}

/// Sends typed requests to workers of one fabric instance.
pub struct WorkerClient {
    messenger: Arc<Messenger>,
    instance_id: String,
    tracking_interval: Duration,
}

impl WorkerClient {
    pub fn new(messenger: Arc<Messenger>, instance_id: impl Into<String>) -> Self {
        let tracking_interval = Duration::from_millis(
            messenger
                .config()
                .general()
                .controller_tracking_interval_ms
                .max(1),
        );
        Self {
            messenger,
            instance_id: instance_id.into(),
            tracking_interval,
        }
    }

    pub fn with_tracking_interval(mut self, interval: Duration) -> Self {
        self.tracking_interval = interval;
        self
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// A fresh request id.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn header(&self, id: &str, r#type: HeaderType) -> RequestHeader {
        RequestHeader {
            id: id.to_string(),
            r#type: r#type as i32,
            instance_id: self.instance_id.clone(),
            ..Default::default()
        }
    }

    fn frame(header: &RequestHeader, body: &impl Message) -> Result<Bytes> {
        let mut buf = ProtocolBuffer::new(header.encoded_len() + body.encoded_len() + 8);
        buf.serialize(header)?;
        buf.serialize(body)?;
        Ok(buf.to_bytes())
    }

    async fn call<R>(&self, worker: &str, header: RequestHeader, body: &impl Message) -> Result<R>
    where
        R: Message + Default + Send + 'static,
    {
        let request = Self::frame(&header, body)?;
        Ok(self.messenger.request(worker, &header.id, request).await?)
    }

    // ========================================================================
    // Queued requests
    // ========================================================================

    /// Queue `body` on `worker` under a fresh id.
    pub async fn submit<B: TypedRequest>(
        &self,
        worker: &str,
        priority: i32,
        body: &B,
    ) -> Result<Submitted<B::Response>> {
        self.submit_as(worker, &Self::new_id(), priority, body).await
    }

    /// Queue `body` on `worker` under `id`.
    #[instrument(skip(self, body), fields(queued_type = ?B::TYPE))]
    pub async fn submit_as<B: TypedRequest>(
        &self,
        worker: &str,
        id: &str,
        priority: i32,
        body: &B,
    ) -> Result<Submitted<B::Response>> {
        let header = RequestHeader {
            queued_type: B::TYPE as i32,
            priority,
            ..self.header(id, HeaderType::Queued)
        };
        let response: B::Response = self.call(worker, header, body).await?;
        debug!(status = ?response.outcome().0, "request submitted");
        Ok(Submitted {
            worker: worker.to_string(),
            id: id.to_string(),
            response,
        })
    }

    /// Re-issue `REQUEST_TRACK` every tracking interval until the request
    /// leaves `QUEUED`/`IN_PROGRESS`/`IS_CANCELLING`.
    #[instrument(skip(self), fields(queued_type = ?B::TYPE))]
    pub async fn track_until_finished<B: TypedRequest>(
        &self,
        worker: &str,
        id: &str,
    ) -> Result<B::Response> {
        loop {
            let response = self.track::<B>(worker, id).await?;
            let (status, _) = response.outcome();
            if !matches!(
                status,
                Status::Created | Status::Queued | Status::InProgress | Status::IsCancelling
            ) {
                return Ok(response);
            }
            tokio::time::sleep(self.tracking_interval).await;
        }
    }

    /// Submit `body` and wait for its final response.
    pub async fn execute<B: TypedRequest>(
        &self,
        worker: &str,
        priority: i32,
        body: &B,
    ) -> Result<B::Response> {
        let submitted = self.submit(worker, priority, body).await?;
        if submitted.response.outcome().0.is_terminal() {
            return Ok(submitted.response);
        }
        self.track_until_finished::<B>(worker, &submitted.id).await
    }

    pub async fn echo(&self, worker: &str, data: &str, delay: u64) -> Result<EchoResponse> {
        let body = EchoRequest {
            data: data.to_string(),
            delay,
        };
        self.execute(worker, 0, &body).await
    }

    pub async fn replicate(
        &self,
        worker: &str,
        source_worker: &str,
        database: &str,
        chunk: u32,
        priority: i32,
    ) -> Result<ReplicateResponse> {
        let body = ReplicateRequest {
            database: database.to_string(),
            chunk,
            worker: source_worker.to_string(),
        };
        self.execute(worker, priority, &body).await
    }

    pub async fn delete_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        priority: i32,
    ) -> Result<DeleteResponse> {
        let body = DeleteRequest {
            database: database.to_string(),
            chunk,
        };
        self.execute(worker, priority, &body).await
    }

    pub async fn find_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        compute_cs: bool,
        priority: i32,
    ) -> Result<FindResponse> {
        let body = FindRequest {
            database: database.to_string(),
            chunk,
            compute_cs,
        };
        self.execute(worker, priority, &body).await
    }

    pub async fn find_all_replicas(
        &self,
        worker: &str,
        database: &str,
        priority: i32,
    ) -> Result<FindAllResponse> {
        let body = FindAllRequest {
            database: database.to_string(),
        };
        self.execute(worker, priority, &body).await
    }

    pub async fn sql(&self, worker: &str, body: &SqlRequest, priority: i32) -> Result<SqlResponse> {
        self.execute(worker, priority, body).await
    }

    // ========================================================================
    // Management requests
    // ========================================================================

    async fn manage<R>(
        &self,
        worker: &str,
        kind: ManagementRequestType,
        target: &str,
        queued_type: QueuedRequestType,
    ) -> Result<R>
    where
        R: Message + Default + Send + 'static,
    {
        let header = RequestHeader {
            management_type: kind as i32,
            ..self.header(&Self::new_id(), HeaderType::Request)
        };
        let body = ManagementRequest {
            id: target.to_string(),
            queued_type: queued_type as i32,
        };
        self.call(worker, header, &body).await
    }

    /// Current state of a queued request, without its result.
    pub async fn status(
        &self,
        worker: &str,
        id: &str,
        queued_type: QueuedRequestType,
    ) -> Result<StatusResponse> {
        self.manage(worker, ManagementRequestType::RequestStatus, id, queued_type)
            .await
    }

    /// Cancel a queued or running request.
    pub async fn stop(
        &self,
        worker: &str,
        id: &str,
        queued_type: QueuedRequestType,
    ) -> Result<StatusResponse> {
        self.manage(worker, ManagementRequestType::RequestStop, id, queued_type)
            .await
    }

    /// Current state of a queued request, with its result once finished.
    pub async fn track<B: TypedRequest>(&self, worker: &str, id: &str) -> Result<B::Response> {
        self.manage(worker, ManagementRequestType::RequestTrack, id, B::TYPE)
            .await
    }

    /// Forget finished requests on the worker.
    pub async fn dispose(&self, worker: &str, ids: &[String]) -> Result<DisposeResponse> {
        let header = RequestHeader {
            management_type: ManagementRequestType::RequestDispose as i32,
            ..self.header(&Self::new_id(), HeaderType::Request)
        };
        let body = DisposeRequest { ids: ids.to_vec() };
        self.call(worker, header, &body).await
    }

    // ========================================================================
    // Service requests
    // ========================================================================

    pub async fn service(&self, worker: &str, kind: ServiceRequestType) -> Result<ServiceResponse> {
        let header = RequestHeader {
            service_type: kind as i32,
            ..self.header(&Self::new_id(), HeaderType::Service)
        };
        self.call(worker, header, &ServiceRequest {}).await
    }

    pub async fn suspend(&self, worker: &str) -> Result<ServiceResponse> {
        self.service(worker, ServiceRequestType::ServiceSuspend).await
    }

    pub async fn resume(&self, worker: &str) -> Result<ServiceResponse> {
        self.service(worker, ServiceRequestType::ServiceResume).await
    }

    pub async fn service_status(&self, worker: &str, extended: bool) -> Result<ServiceResponse> {
        let kind = if extended {
            ServiceRequestType::ServiceRequests
        } else {
            ServiceRequestType::ServiceStatus
        };
        self.service(worker, kind).await
    }

    pub async fn drain(&self, worker: &str) -> Result<ServiceResponse> {
        self.service(worker, ServiceRequestType::ServiceDrain).await
    }

    pub async fn reconfig(&self, worker: &str) -> Result<ServiceResponse> {
        self.service(worker, ServiceRequestType::ServiceReconfig).await
    }
}
