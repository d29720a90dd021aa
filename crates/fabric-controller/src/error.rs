// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller errors.

use fabric_config::ConfigError;
use fabric_protocol::{FrameError, MessengerError};
use thiserror::Error;

/// Result type using ControllerError
pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("cancelled")]
    Cancelled,
}
