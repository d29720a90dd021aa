// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! INDEX: dump the director-index contribution of one chunk.
//!
//! The database server writes `(key, chunk, sub-chunk)` rows of the chunk's
//! director table into a scratch file (`SELECT ... INTO OUTFILE`), which is
//! read back as the response payload and removed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fabric_protocol::messages::{IndexRequest, StatusExt};
use tracing::{debug, instrument, warn};

use super::{Failure, Payload, RequestCancelled, RequestContext, WorkerRequest};
use crate::database::{sql_id, sql_qualified, sql_value};

#[instrument(skip_all, fields(id = %request.id(), database = %body.database, chunk = body.chunk))]
pub(super) async fn execute(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &IndexRequest,
) -> Result<bool, RequestCancelled> {
    request.check_cancelled()?;
    match dump(ctx, body).await {
        Ok(data) => {
            debug!(bytes = data.len(), "index extracted");
            request.succeed(Payload::Index(data));
        }
        Err(f) => request.fail(f),
    }
    Ok(true)
}

/// Name of the scratch file for one extraction.
fn scratch_path(tmp_dir: &Path, body: &IndexRequest, table: &str) -> PathBuf {
    let mut name = format!("{}-{}-{}", body.database, table, body.chunk);
    if body.has_transactions {
        name.push_str(&format!("-p{}", body.transaction_id));
    }
    name.push_str(&format!("-{}.tsv", uuid::Uuid::new_v4()));
    tmp_dir.join(name)
}

/// The extraction statement.
fn query(body: &IndexRequest, table: &str, key: &str, sub_chunk_col: &str, path: &Path) -> String {
    let partition = if body.has_transactions {
        format!(" PARTITION ({})", sql_id(&format!("p{}", body.transaction_id)))
    } else {
        String::new()
    };
    format!(
        "SELECT {},{},{} FROM {}{} INTO OUTFILE {}",
        sql_id(key),
        body.chunk,
        sql_id(sub_chunk_col),
        sql_qualified(&body.database, &format!("{table}_{}", body.chunk)),
        partition,
        sql_value(&path.to_string_lossy())
    )
}

async fn dump(ctx: &RequestContext, body: &IndexRequest) -> Result<Vec<u8>, Failure> {
    let info = ctx
        .config
        .database_info(&body.database)
        .map_err(|e| Failure::new(StatusExt::InvalidParam, e.to_string()))?;
    if info.director_table.is_empty() || info.director_key.is_empty() {
        return Err(Failure::new(
            StatusExt::InvalidParam,
            format!("database {} has no director table", info.name),
        ));
    }
    if !info.is_partitioned(&info.director_table) {
        return Err(Failure::new(
            StatusExt::InvalidParam,
            format!("director table {} is not partitioned", info.director_table),
        ));
    }

    let tmp_dir = &ctx.config.general().worker_tmp_dir;
    tokio::fs::create_dir_all(tmp_dir).await.map_err(|e| {
        Failure::new(
            StatusExt::FolderCreate,
            format!("{}: {e}", tmp_dir.display()),
        )
    })?;

    let path = scratch_path(tmp_dir, body, &info.director_table);
    match tokio::fs::metadata(&path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Ok(_) => {
            return Err(Failure::new(
                StatusExt::FileCreate,
                format!("{}: file already exists", path.display()),
            ));
        }
        Err(e) => {
            return Err(Failure::new(
                StatusExt::FileCreate,
                format!("{}: {e}", path.display()),
            ));
        }
    }

    let statement = query(
        body,
        &info.director_table,
        &info.director_key,
        &info.sub_chunk_id_col,
        &path,
    );
    let result = async {
        ctx.pool
            .transaction(&[statement])
            .await
            .map_err(|e| Failure::new(e.status_ext(), e.to_string()))?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Failure::new(StatusExt::FileRead, format!("{}: {e}", path.display())))
    }
    .await;

    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove index dump");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_without_transaction() {
        let body = IndexRequest {
            database: "gaia".into(),
            chunk: 57,
            ..Default::default()
        };
        assert_eq!(
            query(&body, "Object", "objectId", "subChunkId", Path::new("/tmp/x.tsv")),
            "SELECT `objectId`,57,`subChunkId` FROM `gaia`.`Object_57` INTO OUTFILE '/tmp/x.tsv'"
        );
    }

    #[test]
    fn test_query_restricted_to_transaction() {
        let body = IndexRequest {
            database: "gaia".into(),
            chunk: 57,
            has_transactions: true,
            transaction_id: 3,
        };
        let statement = query(&body, "Object", "objectId", "subChunkId", Path::new("/tmp/x.tsv"));
        assert!(statement.contains("FROM `gaia`.`Object_57` PARTITION (`p3`) INTO OUTFILE"));
    }

    #[test]
    fn test_scratch_paths_are_unique() {
        let body = IndexRequest {
            database: "gaia".into(),
            chunk: 7,
            has_transactions: true,
            transaction_id: 2,
        };
        let a = scratch_path(Path::new("/tmp"), &body, "Object");
        let b = scratch_path(Path::new("/tmp"), &body, "Object");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("gaia-Object-7-p2-"));
        assert!(name.ends_with(".tsv"));
    }
}
