// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration errors.

use thiserror::Error;

/// Result type using ConfigError
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown database family: {0}")]
    UnknownFamily(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// The registry contents contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}
