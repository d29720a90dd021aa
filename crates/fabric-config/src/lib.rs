// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Config - shared registry of workers, database families and databases
//!
//! A [`Configuration`] is built once at process start (from a JSON document
//! or programmatically) and handed to every component as
//! `Arc<Configuration>`. Records are read through `is_known_*` / `*_info`
//! pairs; the few mutations that happen at runtime (disabling a worker,
//! moving its service port) go through lock-protected setters.

pub mod configuration;
pub mod error;
pub mod records;

pub use configuration::{Configuration, GeneralSettings};
pub use error::{ConfigError, Result};
pub use records::{DatabaseFamilyInfo, DatabaseInfo, WorkerInfo};
