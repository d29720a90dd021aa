// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller-facing server of the worker.
//!
//! Each accepted connection is served by a [`WorkerServerConnection`] that
//! reads one request (header frame plus body frame), hands it to the
//! [`WorkerProcessor`] and writes the response (header frame plus body
//! frame) before reading the next one.

use std::net::SocketAddr;
use std::sync::Arc;

use fabric_protocol::messages::{
    DeleteRequest, DisposeRequest, DisposeResponse, DisposedId, EchoRequest, FindAllRequest,
    FindRequest, HeaderType, IndexRequest, ManagementRequest, ManagementRequestType,
    QueuedRequestType, ReplicateRequest, RequestHeader, ResponseHeader, ServiceRequest,
    ServiceRequestType, ServiceResponse, SqlRequest, Status, StatusExt, StatusResponse,
};
use fabric_protocol::{FrameError, ProtocolBuffer, WorkerServer, read_message, write_buffer};
use prost::Message;
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, WorkerError};
use crate::processor::WorkerProcessor;
use crate::request::{RequestKind, ResponseBody};

/// Serve controller connections until the listener fails.
#[instrument(skip_all)]
pub async fn run_worker_server(
    server: WorkerServer,
    processor: Arc<WorkerProcessor>,
    instance_id: String,
) -> Result<()> {
    info!(addr = %server.local_addr()?, instance_id = %instance_id, "Worker server starting");

    let instance_id: Arc<str> = instance_id.into();
    server
        .run(move |stream: TcpStream, remote: SocketAddr| {
            let processor = processor.clone();
            let instance_id = instance_id.clone();
            async move {
                WorkerServerConnection::new(processor, instance_id, stream, remote)
                    .run()
                    .await;
            }
        })
        .await?;

    Ok(())
}

fn protocol_error(what: &str, value: i32) -> WorkerError {
    WorkerError::Protocol(format!("unknown {what} {value}"))
}

/// One controller connection.
pub struct WorkerServerConnection {
    processor: Arc<WorkerProcessor>,
    instance_id: Arc<str>,
    stream: TcpStream,
    remote: SocketAddr,
    buf: ProtocolBuffer,
}

impl WorkerServerConnection {
    pub fn new(
        processor: Arc<WorkerProcessor>,
        instance_id: Arc<str>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Self {
        let capacity = processor.context().config.general().request_buf_size_bytes;
        Self {
            processor,
            instance_id,
            stream,
            remote,
            buf: ProtocolBuffer::new(capacity),
        }
    }

    /// Serve requests until the peer disconnects or misbehaves.
    #[instrument(skip(self), fields(remote = %self.remote))]
    pub async fn run(mut self) {
        debug!("controller connected");
        loop {
            match self.serve_one().await {
                Ok(()) => {}
                Err(WorkerError::Frame(FrameError::ConnectionClosed)) => {
                    debug!("controller disconnected");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "dropping controller connection");
                    break;
                }
            }
        }
    }

    async fn read_body<M: Message + Default>(&mut self) -> Result<M> {
        Ok(read_message(&mut self.stream, &mut self.buf).await?)
    }

    async fn serve_one(&mut self) -> Result<()> {
        let header: RequestHeader = self.read_body().await?;
        let header_type = HeaderType::try_from(header.r#type)
            .map_err(|_| protocol_error("request type", header.r#type))?;

        let foreign = header.instance_id != *self.instance_id;
        if foreign {
            warn!(
                id = %header.id,
                instance_id = %header.instance_id,
                "request from a foreign instance"
            );
        }

        let mut out = ProtocolBuffer::new(self.buf.size().max(64));
        out.serialize(&ResponseHeader {
            id: header.id.clone(),
        })?;
        match header_type {
            HeaderType::Queued => self.process_queued(&header, foreign, &mut out).await?,
            HeaderType::Request => self.process_management(&header, foreign, &mut out).await?,
            HeaderType::Service => self.process_service(&header, foreign, &mut out).await?,
        }
        write_buffer(&mut self.stream, out.data()).await?;
        Ok(())
    }

    fn foreign_message(&self, header: &RequestHeader) -> String {
        format!(
            "request instance '{}' does not match worker instance '{}'",
            header.instance_id, self.instance_id
        )
    }

    async fn process_queued(
        &mut self,
        header: &RequestHeader,
        foreign: bool,
        out: &mut ProtocolBuffer,
    ) -> Result<()> {
        let queued_type = QueuedRequestType::try_from(header.queued_type)
            .map_err(|_| protocol_error("queued request type", header.queued_type))?;

        let kind = match queued_type {
            QueuedRequestType::TestEcho => RequestKind::Echo(self.read_body::<EchoRequest>().await?),
            QueuedRequestType::ReplicaCreate => {
                RequestKind::Replicate(self.read_body::<ReplicateRequest>().await?)
            }
            QueuedRequestType::ReplicaDelete => {
                RequestKind::Delete(self.read_body::<DeleteRequest>().await?)
            }
            QueuedRequestType::ReplicaFind => RequestKind::Find(self.read_body::<FindRequest>().await?),
            QueuedRequestType::ReplicaFindAll => {
                RequestKind::FindAll(self.read_body::<FindAllRequest>().await?)
            }
            QueuedRequestType::Index => RequestKind::Index(self.read_body::<IndexRequest>().await?),
            QueuedRequestType::Sql => RequestKind::Sql(self.read_body::<SqlRequest>().await?),
        };

        let response = if foreign {
            ResponseBody::rejected(
                queued_type,
                Status::Failed,
                StatusExt::ForeignInstance,
                self.foreign_message(header),
            )
        } else {
            self.processor.enqueue(&header.id, header.priority, kind)
        };
        response.serialize_into(out)?;
        Ok(())
    }

    async fn process_management(
        &mut self,
        header: &RequestHeader,
        foreign: bool,
        out: &mut ProtocolBuffer,
    ) -> Result<()> {
        let management_type = ManagementRequestType::try_from(header.management_type)
            .map_err(|_| protocol_error("management request type", header.management_type))?;

        match management_type {
            ManagementRequestType::RequestDispose => {
                let body: DisposeRequest = self.read_body().await?;
                let ids = if foreign {
                    body.ids
                        .into_iter()
                        .map(|id| DisposedId {
                            id,
                            disposed: false,
                        })
                        .collect()
                } else {
                    self.processor.dispose(&body.ids)
                };
                out.serialize(&DisposeResponse { ids })?;
            }
            ManagementRequestType::RequestStatus | ManagementRequestType::RequestStop => {
                let body: ManagementRequest = self.read_body().await?;
                let response = if foreign {
                    StatusResponse {
                        status: Status::Failed as i32,
                        status_ext: StatusExt::ForeignInstance as i32,
                        error: self.foreign_message(header),
                        performance: None,
                    }
                } else {
                    let found = if management_type == ManagementRequestType::RequestStop {
                        self.processor
                            .dequeue_or_cancel(&body.id)
                            .await
                            .map(|r| r.status_response())
                    } else {
                        self.processor.check_status(&body.id)
                    };
                    found.unwrap_or_else(|| StatusResponse {
                        status: Status::Bad as i32,
                        status_ext: StatusExt::InvalidId as i32,
                        error: format!("unknown request {}", body.id),
                        performance: None,
                    })
                };
                out.serialize(&response)?;
            }
            ManagementRequestType::RequestTrack => {
                let body: ManagementRequest = self.read_body().await?;
                let queued_type = QueuedRequestType::try_from(body.queued_type)
                    .map_err(|_| protocol_error("queued request type", body.queued_type))?;
                let response = if foreign {
                    ResponseBody::rejected(
                        queued_type,
                        Status::Failed,
                        StatusExt::ForeignInstance,
                        self.foreign_message(header),
                    )
                } else {
                    match self.processor.track(&body.id) {
                        Some(response) if response.queued_type() == queued_type => response,
                        Some(response) => ResponseBody::rejected(
                            queued_type,
                            Status::Bad,
                            StatusExt::InvalidParam,
                            format!(
                                "request {} is a {:?} request",
                                body.id,
                                response.queued_type()
                            ),
                        ),
                        None => ResponseBody::rejected(
                            queued_type,
                            Status::Bad,
                            StatusExt::InvalidId,
                            format!("unknown request {}", body.id),
                        ),
                    }
                };
                response.serialize_into(out)?;
            }
        }
        Ok(())
    }

    async fn process_service(
        &mut self,
        header: &RequestHeader,
        foreign: bool,
        out: &mut ProtocolBuffer,
    ) -> Result<()> {
        let service_type = ServiceRequestType::try_from(header.service_type)
            .map_err(|_| protocol_error("service request type", header.service_type))?;
        // The body carries no fields; it is read to keep the stream framed.
        self.read_body::<ServiceRequest>().await?;

        let processor = &self.processor;
        let mut response = if foreign {
            ServiceResponse {
                status: Status::Failed as i32,
                status_ext: StatusExt::ForeignInstance as i32,
                ..processor.service_status(false)
            }
        } else {
            match service_type {
                ServiceRequestType::ServiceSuspend => {
                    processor.stop();
                    processor.service_status(false)
                }
                ServiceRequestType::ServiceResume => {
                    processor.run().await;
                    processor.service_status(false)
                }
                ServiceRequestType::ServiceStatus => processor.service_status(false),
                ServiceRequestType::ServiceRequests => processor.service_status(true),
                ServiceRequestType::ServiceDrain => {
                    processor.drain().await;
                    processor.service_status(true)
                }
                ServiceRequestType::ServiceReconfig => match processor.reconfig() {
                    Ok(()) => processor.service_status(false),
                    Err(e) => {
                        error!(error = %e, "reconfiguration failed");
                        ServiceResponse {
                            status: Status::Failed as i32,
                            status_ext: StatusExt::OtherException as i32,
                            ..processor.service_status(false)
                        }
                    }
                },
            }
        };
        response.instance_id = self.instance_id.to_string();
        out.serialize(&response)?;
        Ok(())
    }
}
