// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Worker - request processing service of a worker node
//!
//! The worker accepts typed requests from controllers over the framed
//! protocol, queues them by priority in the [`WorkerProcessor`] and runs
//! them on a fixed pool of processing tasks:
//! - Replica management (create/delete/find/find-all) on the data directory
//! - SQL operations against the local MySQL server, optionally batched
//! - Director index extraction (`SELECT ... INTO OUTFILE`)
//! - Echo, for testing the pipeline end to end
//!
//! Controllers follow a request through `REQUEST_STATUS` / `REQUEST_TRACK`
//! and manage the service itself through `SERVICE_*` requests.

pub mod config;
pub mod database;
pub mod error;
pub mod processor;
pub mod request;
pub mod server;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use processor::{ProcessorConfig, ProcessorState, WorkerProcessor};
pub use request::{RequestContext, RequestKind, WorkerRequest};
pub use server::{WorkerServerConnection, run_worker_server};

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
