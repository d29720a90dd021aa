// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the chunker.

use thiserror::Error;

/// Result type using ChunkerError
pub type Result<T> = std::result::Result<T, ChunkerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChunkerError {
    /// The partitioning parameters describe an impossible layout.
    #[error("invalid partitioning configuration: {0}")]
    Configuration(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
