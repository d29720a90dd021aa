// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access to the worker's database server.
//!
//! Requests run their statements in transactions obtained from a
//! [`Database`]. Two backends are available:
//! - [`MySqlDatabase`]: a sqlx `MySqlPool` against MySQL/MariaDB
//! - [`ScriptedDatabase`]: in-process backend replaying scripted replies

mod mysql;
mod scripted;

pub use mysql::MySqlDatabase;
pub use scripted::{ScriptedDatabase, ScriptedReply};

use async_trait::async_trait;
use fabric_protocol::messages::StatusExt;
use thiserror::Error;
use tracing::warn;

/// Errors reported by the database server, classified by the conditions
/// requests react to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbError {
    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("table is not partitioned: {0}")]
    NotPartitionedTable(String),

    #[error("no such partition: {0}")]
    NoSuchPartition(String),

    #[error("duplicate key name: {0}")]
    DuplicateKeyName(String),

    #[error("can't drop field or key: {0}")]
    CantDropFieldOrKey(String),

    #[error("MySQL error {code}: {message}")]
    Mysql { code: u16, message: String },

    /// The server could not be reached or the session broke.
    #[error("database connection error: {0}")]
    Connect(String),
}

impl DbError {
    /// Classify a server error number.
    pub fn from_mysql(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            1146 => Self::NoSuchTable(message),
            1505 => Self::NotPartitionedTable(message),
            1507 | 1735 => Self::NoSuchPartition(message),
            1061 => Self::DuplicateKeyName(message),
            1091 => Self::CantDropFieldOrKey(message),
            _ => Self::Mysql { code, message },
        }
    }

    /// Extended status reported to controllers for this error.
    pub fn status_ext(&self) -> StatusExt {
        match self {
            Self::NoSuchTable(_) => StatusExt::NoSuchTable,
            Self::NotPartitionedTable(_) => StatusExt::NotPartitionedTable,
            Self::NoSuchPartition(_) => StatusExt::NoSuchPartition,
            Self::DuplicateKeyName(_) => StatusExt::DuplicateKey,
            Self::CantDropFieldOrKey(_) => StatusExt::CantDropKey,
            Self::Mysql { .. } | Self::Connect(_) => StatusExt::MysqlError,
        }
    }
}

/// Column of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Field {
    pub name: String,
    pub type_name: String,
}

/// One row; `None` cells are SQL NULLs.
pub type Row = Vec<Option<Vec<u8>>>;

/// Materialized result of one statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn has_result(&self) -> bool {
        !self.fields.is_empty() || !self.rows.is_empty()
    }
}

/// A transaction on a pooled session.
///
/// Dropping an unfinished transaction rolls it back and returns the session
/// to the pool.
#[async_trait]
pub trait Transaction: Send {
    /// Execute one statement (or a `;`-separated script) and collect the
    /// rows of its last result.
    async fn execute(&mut self, query: &str) -> Result<QueryResult, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// The worker's database server, reached through a bounded pool of sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Take a session from the pool and start a transaction on it. Waits
    /// while every session is in use.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Run `queries` in one transaction and return the result of the last
    /// one. Any failure rolls the transaction back.
    async fn transaction(&self, queries: &[String]) -> Result<QueryResult, DbError> {
        let mut tx = self.begin().await?;
        let mut last = QueryResult::default();
        for query in queries {
            match tx.execute(query).await {
                Ok(result) => last = result,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(last)
    }
}

// ============================================================================
// Escaping
// ============================================================================

/// Quote an identifier: `` `name` ``.
pub fn sql_id(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a database-qualified identifier: `` `db`.`table` ``.
pub fn sql_qualified(database: &str, name: &str) -> String {
    format!("{}.{}", sql_id(database), sql_id(name))
}

/// Quote a string literal.
pub fn sql_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// `` `column`='value' ``
pub fn sql_equal(column: &str, value: &str) -> String {
    format!("{}={}", sql_id(column), sql_value(value))
}
