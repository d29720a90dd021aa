// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replica management on the worker's data directory.
//!
//! A chunk replica of a database is the set of MyISAM files
//! `<table>_<chunk>.{frm,MYD,MYI}` and `<table>FullOverlap_<chunk>.{frm,MYD,MYI}`
//! for every partitioned table, stored in `<data_dir>/<database>/`.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fabric_config::DatabaseInfo;
use fabric_protocol::messages::{
    DeleteRequest, FileInfo, FindAllRequest, FindRequest, ReplicaInfo, ReplicaStatus,
    ReplicateRequest, StatusExt,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{Failure, Payload, RequestCancelled, RequestContext, WorkerRequest};
use crate::now_ms;

const EXTENSIONS: [&str; 3] = ["frm", "MYD", "MYI"];

/// Prefix of files being copied into place.
const TEMP_PREFIX: &str = "_";

/// File names making up a replica of `chunk`.
pub fn chunk_file_names(info: &DatabaseInfo, chunk: u32) -> Vec<String> {
    let mut names = Vec::with_capacity(info.partitioned_tables.len() * 2 * EXTENSIONS.len());
    for table in &info.partitioned_tables {
        for base in [format!("{table}_{chunk}"), format!("{table}FullOverlap_{chunk}")] {
            for ext in EXTENSIONS {
                names.push(format!("{base}.{ext}"));
            }
        }
    }
    names
}

/// Chunk number of a replica file of `info`, if `name` is one.
pub fn parse_chunk_file_name(info: &DatabaseInfo, name: &str) -> Option<u32> {
    let (stem, ext) = name.rsplit_once('.')?;
    if !EXTENSIONS.contains(&ext) {
        return None;
    }
    let (table, chunk) = stem.rsplit_once('_')?;
    if chunk.is_empty() || !chunk.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let chunk: u32 = chunk.parse().ok()?;
    let table = match table.strip_suffix("FullOverlap") {
        Some(base) if info.is_partitioned(base) => base,
        _ => table,
    };
    info.is_partitioned(table).then_some(chunk)
}

fn replica_status(found: usize, expected: usize) -> ReplicaStatus {
    if found == 0 {
        ReplicaStatus::NotFound
    } else if found == expected {
        ReplicaStatus::Complete
    } else {
        ReplicaStatus::Incomplete
    }
}

fn mtime(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn checksum(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Database record and directory of `database` on this worker.
fn locate(ctx: &RequestContext, database: &str) -> Result<(DatabaseInfo, PathBuf), Failure> {
    let info = ctx
        .config
        .database_info(database)
        .map_err(|e| Failure::new(StatusExt::InvalidParam, e.to_string()))?;
    let worker = ctx
        .config
        .worker_info(&ctx.worker)
        .map_err(|e| Failure::new(StatusExt::InvalidParam, e.to_string()))?;
    Ok((info, worker.data_dir.join(database)))
}

/// Describe the replica of `chunk` found in `dir`.
async fn scan_chunk(
    worker: &str,
    info: &DatabaseInfo,
    dir: &Path,
    chunk: u32,
    compute_cs: bool,
) -> Result<ReplicaInfo, Failure> {
    let names = chunk_file_names(info, chunk);
    let mut files = Vec::new();
    for name in &names {
        let path = dir.join(name);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(Failure::new(
                    StatusExt::FileStat,
                    format!("{}: {e}", path.display()),
                ));
            }
        };
        let cs = if compute_cs {
            checksum(&path).await.map_err(|e| {
                Failure::new(StatusExt::FileRead, format!("{}: {e}", path.display()))
            })?
        } else {
            String::new()
        };
        files.push(FileInfo {
            name: name.clone(),
            size: meta.len(),
            mtime: mtime(&meta),
            cs,
            ..Default::default()
        });
    }
    Ok(ReplicaInfo {
        status: replica_status(files.len(), names.len()) as i32,
        worker: worker.to_string(),
        database: info.name.clone(),
        chunk,
        verify_time: now_ms(),
        file_info_many: files,
    })
}

// ============================================================================
// REPLICA_FIND / REPLICA_FIND_ALL
// ============================================================================

pub(super) async fn find(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &FindRequest,
) -> Result<bool, RequestCancelled> {
    request.check_cancelled()?;
    let result = match locate(ctx, &body.database) {
        Ok((info, dir)) => scan_chunk(&ctx.worker, &info, &dir, body.chunk, body.compute_cs).await,
        Err(f) => Err(f),
    };
    match result {
        Ok(replica) => request.succeed(Payload::Replica(replica)),
        Err(f) => request.fail(f),
    }
    Ok(true)
}

pub(super) async fn find_all(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &FindAllRequest,
) -> Result<bool, RequestCancelled> {
    request.check_cancelled()?;
    match scan_database(ctx, &body.database).await {
        Ok(replicas) => request.succeed(Payload::Replicas(replicas)),
        Err(f) => request.fail(f),
    }
    Ok(true)
}

async fn scan_database(ctx: &RequestContext, database: &str) -> Result<Vec<ReplicaInfo>, Failure> {
    let (info, dir) = locate(ctx, database)?;
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Failure::new(
                StatusExt::NoFolder,
                format!("{}: no such directory", dir.display()),
            ));
        }
        Err(e) => {
            return Err(Failure::new(
                StatusExt::FolderRead,
                format!("{}: {e}", dir.display()),
            ));
        }
    };

    let mut chunks: BTreeMap<u32, Vec<FileInfo>> = BTreeMap::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return Err(Failure::new(
                    StatusExt::FolderRead,
                    format!("{}: {e}", dir.display()),
                ));
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(chunk) = parse_chunk_file_name(&info, &name) else {
            continue;
        };
        let meta = entry
            .metadata()
            .await
            .map_err(|e| Failure::new(StatusExt::FileStat, format!("{name}: {e}")))?;
        chunks.entry(chunk).or_default().push(FileInfo {
            name,
            size: meta.len(),
            mtime: mtime(&meta),
            ..Default::default()
        });
    }

    let verify_time = now_ms();
    Ok(chunks
        .into_iter()
        .map(|(chunk, mut files)| {
            files.sort_by(|a, b| a.name.cmp(&b.name));
            let expected = chunk_file_names(&info, chunk).len();
            ReplicaInfo {
                status: replica_status(files.len(), expected) as i32,
                worker: ctx.worker.clone(),
                database: info.name.clone(),
                chunk,
                verify_time,
                file_info_many: files,
            }
        })
        .collect())
}

// ============================================================================
// REPLICA_DELETE
// ============================================================================

pub(super) async fn delete(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &DeleteRequest,
) -> Result<bool, RequestCancelled> {
    request.check_cancelled()?;
    match delete_chunk(ctx, body).await {
        Ok(replica) => request.succeed(Payload::Replica(replica)),
        Err(f) => request.fail(f),
    }
    Ok(true)
}

async fn delete_chunk(ctx: &RequestContext, body: &DeleteRequest) -> Result<ReplicaInfo, Failure> {
    let (info, dir) = locate(ctx, &body.database)?;
    let replica = scan_chunk(&ctx.worker, &info, &dir, body.chunk, false).await?;
    for file in &replica.file_info_many {
        let path = dir.join(&file.name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Failure::new(
                    StatusExt::FileDelete,
                    format!("{}: {e}", path.display()),
                ));
            }
        }
    }
    debug!(
        database = %body.database,
        chunk = body.chunk,
        files = replica.file_info_many.len(),
        "replica deleted"
    );
    Ok(replica)
}

// ============================================================================
// REPLICA_CREATE
// ============================================================================

/// Progress of a replication kept between execution steps.
#[derive(Debug)]
pub(crate) struct CopyPlan {
    source_dir: PathBuf,
    dest_dir: PathBuf,
    files: Vec<String>,
    copied: Vec<FileInfo>,
}

impl CopyPlan {
    fn temp_path(&self, name: &str) -> PathBuf {
        self.dest_dir.join(format!("{TEMP_PREFIX}{name}"))
    }

    fn is_done(&self) -> bool {
        self.copied.len() == self.files.len()
    }

    async fn prepare(ctx: &RequestContext, body: &ReplicateRequest) -> Result<Self, Failure> {
        if body.worker == ctx.worker {
            return Err(Failure::new(
                StatusExt::InvalidParam,
                "source worker is the destination worker",
            ));
        }
        let (info, dest_dir) = locate(ctx, &body.database)?;
        let source = ctx
            .config
            .worker_info(&body.worker)
            .map_err(|e| Failure::new(StatusExt::InvalidParam, e.to_string()))?;
        let source_dir = source.data_dir.join(&body.database);

        match tokio::fs::metadata(&source_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Failure::new(
                    StatusExt::NoFolder,
                    format!("{}: not a directory", source_dir.display()),
                ));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Failure::new(
                    StatusExt::NoFolder,
                    format!("{}: no such directory", source_dir.display()),
                ));
            }
            Err(e) => {
                return Err(Failure::new(
                    StatusExt::FolderStat,
                    format!("{}: {e}", source_dir.display()),
                ));
            }
        }

        let files = chunk_file_names(&info, body.chunk);
        for name in &files {
            let path = source_dir.join(name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => {
                    return Err(Failure::new(
                        StatusExt::BadFileType,
                        format!("{}: not a regular file", path.display()),
                    ));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Failure::new(
                        StatusExt::NoSuchFile,
                        format!("{}: no such file", path.display()),
                    ));
                }
                Err(e) => {
                    return Err(Failure::new(
                        StatusExt::FileStat,
                        format!("{}: {e}", path.display()),
                    ));
                }
            }
        }

        tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| {
            Failure::new(
                StatusExt::FolderCreate,
                format!("{}: {e}", dest_dir.display()),
            )
        })?;

        Ok(Self {
            source_dir,
            dest_dir,
            copied: Vec::with_capacity(files.len()),
            files,
        })
    }

    /// Copy the next file into its temporary name.
    async fn copy_next(&mut self) -> Result<(), Failure> {
        let name = self.files[self.copied.len()].clone();
        let source = self.source_dir.join(&name);
        let temp = self.temp_path(&name);

        let in_size = tokio::fs::metadata(&source)
            .await
            .map_err(|e| Failure::new(StatusExt::FileStat, format!("{}: {e}", source.display())))?
            .len();
        let begin_transfer_time = now_ms();
        let size = tokio::fs::copy(&source, &temp).await.map_err(|e| {
            Failure::new(
                StatusExt::FileCopy,
                format!("{} -> {}: {e}", source.display(), temp.display()),
            )
        })?;
        if size != in_size {
            return Err(Failure::new(
                StatusExt::FileSize,
                format!("{}: copied {size} of {in_size} bytes", source.display()),
            ));
        }

        self.copied.push(FileInfo {
            name,
            size,
            begin_transfer_time,
            end_transfer_time: now_ms(),
            in_size,
            ..Default::default()
        });
        Ok(())
    }

    /// Rename every temporary file into place.
    async fn commit(mut self, worker: &str, body: &ReplicateRequest) -> Result<ReplicaInfo, Failure> {
        for file in &mut self.copied {
            let temp = self.dest_dir.join(format!("{TEMP_PREFIX}{}", file.name));
            let path = self.dest_dir.join(&file.name);
            tokio::fs::rename(&temp, &path).await.map_err(|e| {
                Failure::new(
                    StatusExt::FileRename,
                    format!("{} -> {}: {e}", temp.display(), path.display()),
                )
            })?;
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                file.mtime = mtime(&meta);
            }
        }
        Ok(ReplicaInfo {
            status: ReplicaStatus::Complete as i32,
            worker: worker.to_string(),
            database: body.database.clone(),
            chunk: body.chunk,
            verify_time: now_ms(),
            file_info_many: self.copied,
        })
    }

    /// Remove temporary files left by an abandoned copy.
    pub(super) async fn discard(&self) {
        for file in &self.copied {
            let temp = self.temp_path(&file.name);
            if let Err(e) = tokio::fs::remove_file(&temp).await
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %temp.display(), error = %e, "failed to remove temporary file");
            }
        }
    }
}

pub(super) async fn replicate(
    request: &WorkerRequest,
    ctx: &RequestContext,
    body: &ReplicateRequest,
) -> Result<bool, RequestCancelled> {
    let pending = request.with_copy(Option::take);
    if let Err(cancelled) = request.check_cancelled() {
        if let Some(plan) = pending {
            plan.discard().await;
        }
        return Err(cancelled);
    }

    let mut plan = match pending {
        Some(plan) => plan,
        None => match CopyPlan::prepare(ctx, body).await {
            Ok(plan) => plan,
            Err(f) => {
                request.fail(f);
                return Ok(true);
            }
        },
    };

    if !plan.is_done() {
        if let Err(f) = plan.copy_next().await {
            plan.discard().await;
            // The failed copy may have left a partial file behind.
            if let Some(name) = plan.files.get(plan.copied.len()) {
                let temp = plan.temp_path(name);
                if let Err(e) = tokio::fs::remove_file(&temp).await
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!(path = %temp.display(), error = %e, "failed to remove partial copy");
                }
            }
            request.fail(f);
            return Ok(true);
        }
        if !plan.is_done() {
            request.with_copy(|slot| *slot = Some(plan));
            return Ok(false);
        }
    }

    match plan.commit(&ctx.worker, body).await {
        Ok(replica) => {
            debug!(
                database = %body.database,
                chunk = body.chunk,
                source = %body.worker,
                "replica created"
            );
            request.succeed(Payload::Replica(replica));
        }
        Err(f) => request.fail(f),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaia() -> DatabaseInfo {
        let mut info = DatabaseInfo::new("gaia", "production");
        info.partitioned_tables = vec!["Object".into(), "Source_v2".into()];
        info.regular_tables = vec!["Filter".into()];
        info
    }

    #[test]
    fn test_chunk_file_names() {
        let names = chunk_file_names(&gaia(), 57);
        assert_eq!(names.len(), 12);
        assert!(names.contains(&"Object_57.frm".to_string()));
        assert!(names.contains(&"ObjectFullOverlap_57.MYI".to_string()));
        assert!(names.contains(&"Source_v2FullOverlap_57.MYD".to_string()));
    }

    #[test]
    fn test_parse_chunk_file_name() {
        let info = gaia();
        assert_eq!(parse_chunk_file_name(&info, "Object_57.MYD"), Some(57));
        assert_eq!(parse_chunk_file_name(&info, "ObjectFullOverlap_57.frm"), Some(57));
        assert_eq!(parse_chunk_file_name(&info, "Source_v2_1234.MYI"), Some(1234));
        assert_eq!(parse_chunk_file_name(&info, "Filter_1.MYD"), None);
        assert_eq!(parse_chunk_file_name(&info, "Object_57.txt"), None);
        assert_eq!(parse_chunk_file_name(&info, "Object_x.MYD"), None);
        assert_eq!(parse_chunk_file_name(&info, "Object_+5.MYD"), None);
        assert_eq!(parse_chunk_file_name(&info, "_Object_57.MYD"), None);
    }

    #[test]
    fn test_replica_status() {
        assert_eq!(replica_status(0, 6), ReplicaStatus::NotFound);
        assert_eq!(replica_status(3, 6), ReplicaStatus::Incomplete);
        assert_eq!(replica_status(6, 6), ReplicaStatus::Complete);
    }

    #[tokio::test]
    async fn test_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            checksum(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
