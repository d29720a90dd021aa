// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Controller - the requesting side of the worker protocol
//!
//! [`WorkerClient`] frames typed requests for a worker, sends them through
//! the shared [`fabric_protocol::Messenger`] and follows queued requests
//! with `REQUEST_TRACK` until they finish. [`DirectorIndexJob`] builds on it
//! to pull the director index contribution of every chunk of a database
//! from the workers holding its replicas.

pub mod client;
pub mod error;
pub mod index_job;

pub use client::{Submitted, TypedRequest, WorkerClient};
pub use error::{ControllerError, Result};
pub use index_job::{ChunkResult, DirectorIndexJob, IndexJobResult, IndexSink};
