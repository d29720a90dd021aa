// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fabric-worker.
//!
//! Execution failures of individual requests never surface here: they are
//! recorded in the request's status and extended status instead.

use fabric_config::ConfigError;
use fabric_protocol::{FrameError, ServerError};
use thiserror::Error;

/// Result type using WorkerError
pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),
}
