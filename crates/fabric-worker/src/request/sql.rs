// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL requests against the worker's database server.
//!
//! Every target (the database, one table, or each table of a batch) runs
//! in its own transaction on a pooled session and produces one result
//! set. In batch mode a failing table does not stop the batch; the request
//! fails afterwards, with `MULTIPLE` when the tables failed for different
//! reasons.

use std::collections::BTreeSet;

use fabric_protocol::messages::{
    SqlField, SqlIndexSpec, SqlRequest, SqlRequestType, SqlResultSet, SqlRow, StatusExt,
};
use tracing::{debug, instrument};

use super::{Failure, Payload, RequestCancelled, RequestContext, WorkerRequest};
use crate::database::{DbError, QueryResult, sql_equal, sql_id, sql_qualified, sql_value};

/// Per-worker bookkeeping of published databases.
const WORKER_DB: &str = "qservw_worker";

#[instrument(skip_all, fields(id = %request.id()))]
pub(super) async fn execute(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &SqlRequest,
) -> Result<bool, RequestCancelled> {
    request.check_cancelled()?;

    let targets = match targets(body) {
        Ok(targets) => targets,
        Err(f) => {
            request.fail(f);
            return Ok(true);
        }
    };

    let mut result_sets = Vec::with_capacity(targets.len());
    let mut failures: BTreeSet<StatusExt> = BTreeSet::new();
    let mut num_failed = 0usize;

    for target in &targets {
        request.check_cancelled()?;

        // The flag marks failures that make the rest of a batch pointless.
        let outcome: Result<QueryResult, (Failure, bool)> = match statements(body, target) {
            Ok(queries) => {
                debug!(scope = %target.scope, statements = queries.len(), "running SQL");
                match ctx.pool.transaction(&queries).await {
                    Ok(result) => cap_rows(result, body.max_rows).map_err(|f| (f, false)),
                    Err(e) => Err((
                        Failure::new(e.status_ext(), e.to_string()),
                        matches!(e, DbError::Connect(_)),
                    )),
                }
            }
            Err(f) => Err((f, false)),
        };

        match outcome {
            Ok(result) => result_sets.push(result_set(&target.scope, body, result)),
            Err((f, fatal)) => {
                num_failed += 1;
                failures.insert(f.ext);
                result_sets.push(SqlResultSet {
                    error: f.error.clone(),
                    status_ext: f.ext as i32,
                    scope: target.scope.clone(),
                    char_set_name: body.charset_name.clone(),
                    ..Default::default()
                });
                if !body.batch_mode || fatal {
                    request.fail_with(f, Payload::Sql(result_sets));
                    return Ok(true);
                }
            }
        }
    }

    if num_failed == 0 {
        request.succeed(Payload::Sql(result_sets));
    } else {
        let ext = if failures.len() == 1 {
            failures.into_iter().next().unwrap_or(StatusExt::Multiple)
        } else {
            StatusExt::Multiple
        };
        let error = format!("{num_failed} of {} tables failed", targets.len());
        request.fail_with(Failure::new(ext, error), Payload::Sql(result_sets));
    }
    Ok(true)
}

/// One unit of work: a table, or the whole database/query when `table` is
/// `None`.
#[derive(Debug)]
struct Target {
    table: Option<String>,
    scope: String,
}

fn request_type(body: &SqlRequest) -> Result<SqlRequestType, Failure> {
    SqlRequestType::try_from(body.r#type).map_err(|_| {
        Failure::new(
            StatusExt::InvalidParam,
            format!("unknown SQL request type {}", body.r#type),
        )
    })
}

fn is_table_operation(kind: SqlRequestType) -> bool {
    !matches!(
        kind,
        SqlRequestType::Query
            | SqlRequestType::CreateDatabase
            | SqlRequestType::DropDatabase
            | SqlRequestType::EnableDatabase
            | SqlRequestType::DisableDatabase
            | SqlRequestType::GrantAccess
    )
}

fn targets(body: &SqlRequest) -> Result<Vec<Target>, Failure> {
    let kind = request_type(body)?;
    if kind != SqlRequestType::Query && body.database.is_empty() {
        return Err(Failure::new(StatusExt::InvalidParam, "database name is required"));
    }
    if !is_table_operation(kind) {
        if body.batch_mode {
            return Err(Failure::new(
                StatusExt::InvalidParam,
                format!("{kind:?} can not run in batch mode"),
            ));
        }
        return Ok(vec![Target {
            table: None,
            scope: body.database.clone(),
        }]);
    }

    let tables: Vec<String> = if body.batch_mode {
        body.tables.clone()
    } else {
        vec![body.table.clone()]
    };
    if tables.is_empty() || tables.iter().any(String::is_empty) {
        return Err(Failure::new(StatusExt::InvalidParam, "table name is required"));
    }
    Ok(tables
        .into_iter()
        .map(|table| Target {
            scope: table.clone(),
            table: Some(table),
        })
        .collect())
}

/// Statements implementing the request for one target.
fn statements(body: &SqlRequest, target: &Target) -> Result<Vec<String>, Failure> {
    let kind = request_type(body)?;
    let db = &body.database;
    let table = || {
        target
            .table
            .as_deref()
            .map(|t| sql_qualified(db, t))
            .ok_or_else(|| Failure::new(StatusExt::InvalidParam, "table name is required"))
    };

    let queries = match kind {
        SqlRequestType::Query => {
            if body.query.trim().is_empty() {
                return Err(Failure::new(StatusExt::InvalidParam, "empty query"));
            }
            vec![body.query.clone()]
        }
        SqlRequestType::CreateDatabase => {
            vec![format!("CREATE DATABASE IF NOT EXISTS {}", sql_id(db))]
        }
        SqlRequestType::DropDatabase => {
            vec![format!("DROP DATABASE IF EXISTS {}", sql_id(db))]
        }
        SqlRequestType::EnableDatabase => vec![format!(
            "INSERT IGNORE INTO {} ({}) VALUES ({})",
            sql_qualified(WORKER_DB, "Dbs"),
            sql_id("db"),
            sql_value(db)
        )],
        SqlRequestType::DisableDatabase => vec![
            format!(
                "DELETE FROM {} WHERE {}",
                sql_qualified(WORKER_DB, "Chunks"),
                sql_equal("db", db)
            ),
            format!(
                "DELETE FROM {} WHERE {}",
                sql_qualified(WORKER_DB, "Dbs"),
                sql_equal("db", db)
            ),
        ],
        SqlRequestType::GrantAccess => {
            if body.user.is_empty() {
                return Err(Failure::new(StatusExt::InvalidParam, "user name is required"));
            }
            vec![format!(
                "GRANT ALL ON {}.* TO {}@'localhost'",
                sql_id(db),
                sql_value(&body.user)
            )]
        }
        SqlRequestType::CreateTable => vec![create_table(body, &table()?)?],
        SqlRequestType::DropTable => vec![format!("DROP TABLE IF EXISTS {}", table()?)],
        SqlRequestType::RemoveTablePartitioning => {
            vec![format!("ALTER TABLE {} REMOVE PARTITIONING", table()?)]
        }
        SqlRequestType::DropTablePartition => vec![format!(
            "ALTER TABLE {} DROP PARTITION {}",
            table()?,
            sql_id(&format!("p{}", body.transaction_id))
        )],
        SqlRequestType::GetTableIndex => vec![format!("SHOW INDEXES FROM {}", table()?)],
        SqlRequestType::CreateTableIndex => vec![create_index(body, &table()?)?],
        SqlRequestType::DropTableIndex => {
            if body.index_name.is_empty() {
                return Err(Failure::new(StatusExt::InvalidParam, "index name is required"));
            }
            vec![format!("DROP INDEX {} ON {}", sql_id(&body.index_name), table()?)]
        }
        SqlRequestType::AlterTables => {
            if body.alter_spec.trim().is_empty() {
                return Err(Failure::new(StatusExt::InvalidParam, "empty ALTER specification"));
            }
            vec![format!("ALTER TABLE {} {}", table()?, body.alter_spec)]
        }
        SqlRequestType::TableRowStats => vec![format!(
            "SELECT {}, COUNT(*) AS {} FROM {} GROUP BY {}",
            sql_id("qserv_trans_id"),
            sql_id("num_rows"),
            table()?,
            sql_id("qserv_trans_id")
        )],
    };
    Ok(queries)
}

fn create_table(body: &SqlRequest, table: &str) -> Result<String, Failure> {
    if body.columns.is_empty() {
        return Err(Failure::new(StatusExt::InvalidParam, "table has no columns"));
    }
    let columns = body
        .columns
        .iter()
        .map(|c| format!("{} {}", sql_id(&c.name), c.r#type))
        .collect::<Vec<_>>()
        .join(",");
    let engine = if body.engine.is_empty() {
        "MyISAM"
    } else {
        body.engine.as_str()
    };
    let mut query = format!("CREATE TABLE IF NOT EXISTS {table} ({columns}) ENGINE={engine}");
    if !body.charset_name.is_empty() {
        query.push_str(&format!(" DEFAULT CHARSET={}", body.charset_name));
    }
    if !body.partition_by_column.is_empty() {
        query.push_str(&format!(
            " PARTITION BY LIST ({}) (PARTITION {} VALUES IN (0))",
            sql_id(&body.partition_by_column),
            sql_id("p0")
        ));
    }
    Ok(query)
}

fn create_index(body: &SqlRequest, table: &str) -> Result<String, Failure> {
    if body.index_name.is_empty() || body.index_columns.is_empty() {
        return Err(Failure::new(
            StatusExt::InvalidParam,
            "index name and columns are required",
        ));
    }
    let spec = match SqlIndexSpec::try_from(body.index_spec).unwrap_or(SqlIndexSpec::Default) {
        SqlIndexSpec::Default => "",
        SqlIndexSpec::Unique => "UNIQUE ",
        SqlIndexSpec::Fulltext => "FULLTEXT ",
        SqlIndexSpec::Spatial => "SPATIAL ",
    };
    let columns = body
        .index_columns
        .iter()
        .map(|c| {
            let mut column = sql_id(&c.name);
            if c.length > 0 {
                column.push_str(&format!("({})", c.length));
            }
            column.push_str(if c.ascending { " ASC" } else { " DESC" });
            column
        })
        .collect::<Vec<_>>()
        .join(",");
    let mut query = format!(
        "CREATE {spec}INDEX {} ON {table} ({columns})",
        sql_id(&body.index_name)
    );
    if !body.index_comment.is_empty() {
        query.push_str(&format!(" COMMENT {}", sql_value(&body.index_comment)));
    }
    Ok(query)
}

fn cap_rows(result: QueryResult, max_rows: u64) -> Result<QueryResult, Failure> {
    if max_rows > 0 && result.rows.len() as u64 > max_rows {
        return Err(Failure::new(
            StatusExt::LargeResult,
            format!("result has {} rows, limit is {max_rows}", result.rows.len()),
        ));
    }
    Ok(result)
}

fn result_set(scope: &str, body: &SqlRequest, result: QueryResult) -> SqlResultSet {
    SqlResultSet {
        has_result: result.has_result(),
        fields: result
            .fields
            .into_iter()
            .map(|f| SqlField {
                name: f.name,
                type_name: f.type_name,
            })
            .collect(),
        rows: result
            .rows
            .into_iter()
            .map(|row| SqlRow {
                nulls: row.iter().map(Option::is_none).collect(),
                cells: row.into_iter().map(Option::unwrap_or_default).collect(),
            })
            .collect(),
        scope: scope.to_string(),
        char_set_name: body.charset_name.clone(),
        ..Default::default()
    }
}
