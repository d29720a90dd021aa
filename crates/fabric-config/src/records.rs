// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_svc_port() -> u16 {
    25000
}

fn default_db_port() -> u16 {
    3306
}

fn default_db_user() -> String {
    "qsmaster".to_string()
}

/// A worker node: where its request service listens and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_read_only: bool,
    pub svc_host: String,
    #[serde(default = "default_svc_port")]
    pub svc_port: u16,
    /// Root of the worker's MySQL data directory (one sub-directory per database).
    pub data_dir: PathBuf,
    #[serde(default)]
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    #[serde(default = "default_db_user")]
    pub db_user: String,
}

impl WorkerInfo {
    /// Minimal record for a worker listening on `svc_host:svc_port`.
    pub fn new(name: impl Into<String>, svc_host: impl Into<String>, svc_port: u16) -> Self {
        let svc_host = svc_host.into();
        Self {
            name: name.into(),
            is_enabled: true,
            is_read_only: false,
            db_host: svc_host.clone(),
            svc_host,
            svc_port,
            data_dir: PathBuf::from("/qserv/data/mysql"),
            db_port: default_db_port(),
            db_user: default_db_user(),
        }
    }

    /// `host:port` of the worker request service.
    pub fn svc_addr(&self) -> String {
        format!("{}:{}", self.svc_host, self.svc_port)
    }
}

/// Partitioning parameters shared by every database of a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseFamilyInfo {
    pub name: String,
    pub replication_level: u32,
    pub num_stripes: i32,
    pub num_sub_stripes: i32,
    pub overlap: f64,
}

/// A database: its family and which of its tables are partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub family: String,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub partitioned_tables: Vec<String>,
    #[serde(default)]
    pub regular_tables: Vec<String>,
    /// The director table and its key/partitioning columns (used by the
    /// secondary index).
    #[serde(default)]
    pub director_table: String,
    #[serde(default)]
    pub director_key: String,
    #[serde(default = "default_chunk_id_col")]
    pub chunk_id_col: String,
    #[serde(default = "default_sub_chunk_id_col")]
    pub sub_chunk_id_col: String,
}

fn default_chunk_id_col() -> String {
    "chunkId".to_string()
}

fn default_sub_chunk_id_col() -> String {
    "subChunkId".to_string()
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            is_published: false,
            partitioned_tables: Vec::new(),
            regular_tables: Vec::new(),
            director_table: String::new(),
            director_key: String::new(),
            chunk_id_col: default_chunk_id_col(),
            sub_chunk_id_col: default_sub_chunk_id_col(),
        }
    }

    /// Partitioned tables first, then regular ones.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.partitioned_tables
            .iter()
            .chain(self.regular_tables.iter())
            .map(String::as_str)
    }

    pub fn is_partitioned(&self, table: &str) -> bool {
        self.partitioned_tables.iter().any(|t| t == table)
    }
}
