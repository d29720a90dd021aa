// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller requests and the director index job against in-process
//! workers backed by scripted databases.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabric_config::{Configuration, DatabaseFamilyInfo, DatabaseInfo, GeneralSettings, WorkerInfo};
use fabric_controller::{DirectorIndexJob, IndexSink, WorkerClient};
use fabric_protocol::messages::{ServiceState, Status, StatusExt};
use fabric_protocol::{Messenger, WorkerServer};
use fabric_worker::database::{DbError, ScriptedDatabase, ScriptedReply};
use fabric_worker::{ProcessorConfig, RequestContext, WorkerProcessor, run_worker_server};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const INSTANCE: &str = "fabric-test";

struct Cluster {
    client: Arc<WorkerClient>,
    databases: Vec<Arc<ScriptedDatabase>>,
    servers: Vec<JoinHandle<()>>,
    processors: Vec<Arc<WorkerProcessor>>,
    _tmp: TempDir,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.client.messenger().stop();
        for processor in &self.processors {
            processor.stop();
        }
        for server in &self.servers {
            server.abort();
        }
    }
}

/// Two workers, `worker-a` and `worker-b`, sharing one registry.
async fn cluster() -> Cluster {
    let tmp = TempDir::new().unwrap();
    let config = Configuration::new(GeneralSettings {
        worker_tmp_dir: tmp.path().to_path_buf(),
        controller_tracking_interval_ms: 20,
        ..GeneralSettings::default()
    });
    config
        .add_family(DatabaseFamilyInfo {
            name: "production".into(),
            replication_level: 2,
            num_stripes: 340,
            num_sub_stripes: 3,
            overlap: 0.01667,
        })
        .unwrap();
    let mut gaia = DatabaseInfo::new("gaia", "production");
    gaia.partitioned_tables = vec!["Object".into()];
    gaia.director_table = "Object".into();
    gaia.director_key = "objectId".into();
    config.add_database(gaia).unwrap();

    let mut bound = Vec::new();
    for name in ["worker-a", "worker-b"] {
        let server = WorkerServer::localhost().unwrap();
        let port = server.local_addr().unwrap().port();
        let mut worker = WorkerInfo::new(name, "127.0.0.1", port);
        worker.data_dir = tmp.path().join(name);
        config.add_worker(worker).unwrap();
        bound.push((name, server));
    }
    let config = Arc::new(config);

    let mut databases = Vec::new();
    let mut servers = Vec::new();
    let mut processors = Vec::new();
    for (name, server) in bound {
        let db = Arc::new(ScriptedDatabase::new());
        let ctx = RequestContext {
            worker: name.into(),
            config: config.clone(),
            pool: db.clone(),
            config_path: None,
        };
        let processor = WorkerProcessor::new(
            Arc::new(ctx),
            ProcessorConfig {
                num_threads: 2,
                fetch_timeout: Duration::from_millis(50),
                ..ProcessorConfig::default()
            },
        );
        processor.run().await;
        let server_processor = processor.clone();
        servers.push(tokio::spawn(async move {
            let _ = run_worker_server(server, server_processor, INSTANCE.to_string()).await;
        }));
        databases.push(db);
        processors.push(processor);
    }

    let client = WorkerClient::new(Arc::new(Messenger::new(config)), INSTANCE);
    Cluster {
        client: Arc::new(client),
        databases,
        servers,
        processors,
        _tmp: tmp,
    }
}

#[derive(Default)]
struct CollectingSink {
    loaded: Mutex<BTreeMap<u32, (String, Vec<u8>)>>,
}

#[async_trait]
impl IndexSink for CollectingSink {
    async fn load(&self, chunk: u32, worker: &str, data: Vec<u8>) -> Result<(), String> {
        self.loaded
            .lock()
            .unwrap()
            .insert(chunk, (worker.to_string(), data));
        Ok(())
    }
}

fn replicas(entries: &[(u32, &[&str])]) -> BTreeMap<u32, Vec<String>> {
    entries
        .iter()
        .map(|(chunk, workers)| (*chunk, workers.iter().map(|w| w.to_string()).collect()))
        .collect()
}

fn script_dump(cluster: &Cluster, worker: usize, data: &[u8]) {
    cluster.databases[worker].on("INTO OUTFILE", ScriptedReply::Outfile(data.to_vec()));
}

#[tokio::test]
async fn test_echo_through_client() {
    let cluster = cluster().await;
    let response = cluster.client.echo("worker-a", "hello", 30).await.unwrap();
    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.data, "hello");

    let status = cluster.client.service_status("worker-a", true).await.unwrap();
    assert_eq!(status.service_state(), ServiceState::Running);
    assert_eq!(status.num_finished_requests, 1);
    assert_eq!(status.instance_id, INSTANCE);
}

#[tokio::test]
async fn test_index_job_collects_every_chunk() {
    let cluster = cluster().await;
    script_dump(&cluster, 0, b"from-a\n");
    script_dump(&cluster, 1, b"from-b\n");

    let sink = Arc::new(CollectingSink::default());
    let job = DirectorIndexJob::new(
        cluster.client.clone(),
        "gaia",
        replicas(&[
            (1, &["worker-a", "worker-b"]),
            (2, &["worker-a"]),
            (3, &["worker-b"]),
            (4, &["worker-b", "worker-a"]),
        ]),
        sink.clone(),
    );
    let result = job.run().await.unwrap();

    assert_eq!(result.status, Status::Success);
    assert_eq!(result.chunks.len(), 4);
    let loaded = sink.loaded.lock().unwrap();
    assert_eq!(loaded.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    for (chunk, (worker, data)) in loaded.iter() {
        let expected: &[u8] = if worker == "worker-a" { b"from-a\n" } else { b"from-b\n" };
        assert_eq!(data.as_slice(), expected, "chunk {chunk}");
    }
    assert_eq!(loaded[&2].0, "worker-a");
    assert_eq!(loaded[&3].0, "worker-b");
}

#[tokio::test]
async fn test_index_job_reports_failed_chunks() {
    let cluster = cluster().await;
    cluster.databases[1].on(
        "`gaia`.`Object_3`",
        ScriptedReply::Error(DbError::from_mysql(1146, "Table 'gaia.Object_3' doesn't exist")),
    );
    script_dump(&cluster, 0, b"a\n");
    script_dump(&cluster, 1, b"b\n");

    let sink = Arc::new(CollectingSink::default());
    let job = DirectorIndexJob::new(
        cluster.client.clone(),
        "gaia",
        replicas(&[(2, &["worker-a"]), (3, &["worker-b"]), (5, &[])]),
        sink.clone(),
    )
    .with_max_requests_per_worker(2);
    let result = job.run().await.unwrap();

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.chunks[&2].status, Status::Success);
    assert_eq!(result.chunks[&3].status, Status::Failed);
    assert_eq!(result.chunks[&3].status_ext, StatusExt::NoSuchTable);
    assert_eq!(result.chunks[&3].worker, "worker-b");
    assert_eq!(result.chunks[&5].status, Status::Failed);
    let failed: Vec<u32> = result.failed_chunks().map(|c| c.chunk).collect();
    assert_eq!(failed, vec![3, 5]);
    assert_eq!(sink.loaded.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_index_job_cancelled_before_start() {
    let cluster = cluster().await;
    let sink = Arc::new(CollectingSink::default());
    let job = DirectorIndexJob::new(
        cluster.client.clone(),
        "gaia",
        replicas(&[(1, &["worker-a"]), (2, &["worker-b"])]),
        sink.clone(),
    );
    job.cancel_token().cancel();
    let result = job.run().await.unwrap();

    assert_eq!(result.status, Status::Cancelled);
    assert!(result.chunks.values().all(|c| c.status == Status::Cancelled));
    assert!(sink.loaded.lock().unwrap().is_empty());
    assert!(cluster.databases[0].log().is_empty());
}

#[tokio::test]
async fn test_index_job_requires_director_table() {
    let cluster = cluster().await;
    let mut plain = DatabaseInfo::new("plain", "production");
    plain.regular_tables = vec!["Filter".into()];
    cluster.client.messenger().config().add_database(plain).unwrap();

    let job = DirectorIndexJob::new(
        cluster.client.clone(),
        "plain",
        replicas(&[(1, &["worker-a"])]),
        Arc::new(CollectingSink::default()),
    );
    assert!(job.run().await.is_err());
}
