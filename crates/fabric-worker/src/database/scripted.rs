// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process database backend that replays scripted replies.
//!
//! Used for dry runs of a worker without a database server and by the test
//! suites. Every statement is recorded; the first rule whose pattern occurs
//! in a statement decides the reply, otherwise the statement succeeds with
//! an empty result.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Database, DbError, QueryResult, Transaction};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Rows(QueryResult),
    Error(DbError),
    /// Write the bytes to the file named by the statement's
    /// `INTO OUTFILE '...'` clause, as the server would.
    Outfile(Vec<u8>),
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, ScriptedReply)>,
    log: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedDatabase {
    script: Arc<Mutex<Script>>,
    transactions: AtomicUsize,
}

impl ScriptedDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` to every statement containing `pattern`.
    pub fn on(&self, pattern: impl Into<String>, reply: ScriptedReply) {
        lock(&self.script).rules.push((pattern.into(), reply));
    }

    /// Statements executed so far, transaction control included.
    pub fn log(&self) -> Vec<String> {
        lock(&self.script).log.clone()
    }

    /// Number of transactions started.
    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }
}

fn lock(script: &Mutex<Script>) -> std::sync::MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Database for ScriptedDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        let mut tx = ScriptedTransaction {
            script: self.script.clone(),
            open: true,
        };
        tx.record("BEGIN");
        Ok(Box::new(tx))
    }
}

struct ScriptedTransaction {
    script: Arc<Mutex<Script>>,
    open: bool,
}

impl ScriptedTransaction {
    fn record(&mut self, query: &str) -> Option<ScriptedReply> {
        let mut script = lock(&self.script);
        script.log.push(query.to_string());
        script
            .rules
            .iter()
            .find(|(pattern, _)| query.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
    }

    fn finish(&mut self, statement: &str) {
        self.open = false;
        self.record(statement);
    }
}

impl Drop for ScriptedTransaction {
    fn drop(&mut self) {
        if self.open {
            self.finish("ROLLBACK");
        }
    }
}

fn outfile_path(query: &str) -> Option<PathBuf> {
    let start = query.find("INTO OUTFILE '")? + "INTO OUTFILE '".len();
    let end = query[start..].find('\'')?;
    Some(PathBuf::from(&query[start..start + end]))
}

#[async_trait]
impl Transaction for ScriptedTransaction {
    async fn execute(&mut self, query: &str) -> Result<QueryResult, DbError> {
        match self.record(query) {
            None => Ok(QueryResult::default()),
            Some(ScriptedReply::Rows(result)) => Ok(result),
            Some(ScriptedReply::Error(e)) => Err(e),
            Some(ScriptedReply::Outfile(bytes)) => {
                let path = outfile_path(query).ok_or_else(|| DbError::Mysql {
                    code: 1064,
                    message: "statement has no INTO OUTFILE clause".into(),
                })?;
                if path.exists() {
                    return Err(DbError::Mysql {
                        code: 1086,
                        message: format!("File '{}' already exists", path.display()),
                    });
                }
                tokio::fs::write(&path, bytes).await.map_err(|e| DbError::Mysql {
                    code: 1,
                    message: e.to_string(),
                })?;
                Ok(QueryResult::default())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("COMMIT");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("ROLLBACK");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outfile_path() {
        assert_eq!(
            outfile_path("SELECT 1 INTO OUTFILE '/tmp/x.tsv' FIELDS"),
            Some(PathBuf::from("/tmp/x.tsv"))
        );
        assert_eq!(outfile_path("SELECT 1"), None);
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let db = ScriptedDatabase::new();
        db.on("Source_1", ScriptedReply::Error(DbError::from_mysql(1146, "gone")));
        db.on("Source", ScriptedReply::Rows(QueryResult::default()));
        let mut tx = db.begin().await.unwrap();

        assert!(tx.execute("DROP TABLE Source_1").await.is_err());
        assert!(tx.execute("DROP TABLE Source_2").await.is_ok());
        tx.commit().await.unwrap();
        assert_eq!(
            db.log(),
            vec!["BEGIN", "DROP TABLE Source_1", "DROP TABLE Source_2", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let db = ScriptedDatabase::new();
        {
            let mut tx = db.begin().await.unwrap();
            tx.execute("INSERT INTO t VALUES (1)").await.unwrap();
        }
        assert_eq!(db.log(), vec!["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = ScriptedDatabase::new();
        db.on("DROP", ScriptedReply::Error(DbError::from_mysql(1146, "no such table")));

        let err = db
            .transaction(&["DROP TABLE a".to_string(), "SELECT 1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoSuchTable(_)));
        assert_eq!(db.log(), vec!["BEGIN", "DROP TABLE a", "ROLLBACK"]);
        assert_eq!(db.transactions(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let db = ScriptedDatabase::new();
        let result = db
            .transaction(&["CREATE TABLE a (x INT)".to_string()])
            .await
            .unwrap();
        assert!(!result.has_result());
        assert_eq!(db.log(), vec!["BEGIN", "CREATE TABLE a (x INT)", "COMMIT"]);
    }
}
