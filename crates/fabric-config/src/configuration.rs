// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The configuration registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::records::{DatabaseFamilyInfo, DatabaseInfo, WorkerInfo};

/// Process-wide tunables that never change after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Initial capacity of the per-connection protocol buffers.
    pub request_buf_size_bytes: usize,
    /// Fixed delay before a messenger connector retries a failed connect.
    pub retry_timeout_sec: u64,
    /// Interval at which controllers poll workers for request status.
    pub controller_tracking_interval_ms: u64,
    /// Number of processing tasks in each worker's request pool.
    pub worker_num_processing_threads: usize,
    /// Maximum number of pooled database connections per worker.
    pub worker_num_db_connections: usize,
    /// Scratch directory for files produced by the worker's database server.
    pub worker_tmp_dir: PathBuf,
    /// Finished requests older than this are forgotten by the worker.
    pub worker_finished_request_max_age_sec: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            request_buf_size_bytes: 131_072,
            retry_timeout_sec: 1,
            controller_tracking_interval_ms: 1_000,
            worker_num_processing_threads: 4,
            worker_num_db_connections: 4,
            worker_tmp_dir: PathBuf::from("/qserv/data/ingest"),
            worker_finished_request_max_age_sec: 3_600,
        }
    }
}

/// On-disk shape of the registry.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Document {
    general: GeneralSettings,
    workers: Vec<WorkerInfo>,
    families: Vec<DatabaseFamilyInfo>,
    databases: Vec<DatabaseInfo>,
}

#[derive(Debug, Default)]
struct Registry {
    workers: BTreeMap<String, WorkerInfo>,
    families: BTreeMap<String, DatabaseFamilyInfo>,
    databases: BTreeMap<String, DatabaseInfo>,
}

/// Registry of workers, database families and databases.
///
/// Readers get owned copies of the records so no lock is held across an
/// await point. Writers take the registry lock for the duration of one
/// setter call.
#[derive(Debug)]
pub struct Configuration {
    general: GeneralSettings,
    registry: RwLock<Registry>,
}

impl Configuration {
    /// An empty registry with the given general settings.
    pub fn new(general: GeneralSettings) -> Self {
        Self {
            general,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Parse a JSON document of the form
    /// `{"general": {...}, "workers": [...], "families": [...], "databases": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(json)?;
        let config = Self::new(doc.general);
        for family in doc.families {
            config.add_family(family)?;
        }
        for database in doc.databases {
            config.add_database(database)?;
        }
        for worker in doc.workers {
            config.add_worker(worker)?;
        }
        Ok(config)
    }

    /// Load the registry from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            workers = config.all_workers().len(),
            databases = config.databases(None).len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Serialize the current registry back to JSON.
    pub fn to_json(&self) -> Result<String> {
        let registry = self.read();
        let doc = Document {
            general: self.general.clone(),
            workers: registry.workers.values().cloned().collect(),
            families: registry.families.values().cloned().collect(),
            databases: registry.databases.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn general(&self) -> &GeneralSettings {
        &self.general
    }

    /// Replace workers, families and databases with the contents of the
    /// JSON file at `path`. General settings are kept: they never change
    /// after the process started.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let fresh = Self::load(path)?;
        let registry = std::mem::take(&mut *fresh.write());
        *self.write() = registry;
        Ok(())
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Names of the workers with the given state. Read-only workers are
    /// only reported for `enabled == true`.
    pub fn workers(&self, enabled: bool, read_only: bool) -> Vec<String> {
        self.read()
            .workers
            .values()
            .filter(|w| {
                if enabled {
                    w.is_enabled && w.is_read_only == read_only
                } else {
                    !w.is_enabled
                }
            })
            .map(|w| w.name.clone())
            .collect()
    }

    /// Names of every registered worker regardless of state.
    pub fn all_workers(&self) -> Vec<String> {
        self.read().workers.keys().cloned().collect()
    }

    pub fn is_known_worker(&self, name: &str) -> bool {
        self.read().workers.contains_key(name)
    }

    pub fn worker_info(&self, name: &str) -> Result<WorkerInfo> {
        self.read()
            .workers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownWorker(name.to_string()))
    }

    pub fn add_worker(&self, info: WorkerInfo) -> Result<()> {
        let mut registry = self.write();
        if registry.workers.contains_key(&info.name) {
            return Err(ConfigError::Inconsistent(format!(
                "worker {} is already registered",
                info.name
            )));
        }
        debug!(worker = %info.name, addr = %info.svc_addr(), "Worker registered");
        registry.workers.insert(info.name.clone(), info);
        Ok(())
    }

    pub fn delete_worker(&self, name: &str) -> Result<WorkerInfo> {
        self.write()
            .workers
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownWorker(name.to_string()))
    }

    /// Mark a worker as disabled and return its updated record.
    pub fn disable_worker(&self, name: &str) -> Result<WorkerInfo> {
        self.update_worker(name, |w| w.is_enabled = false)
    }

    pub fn enable_worker(&self, name: &str) -> Result<WorkerInfo> {
        self.update_worker(name, |w| w.is_enabled = true)
    }

    pub fn set_worker_read_only(&self, name: &str, read_only: bool) -> Result<WorkerInfo> {
        self.update_worker(name, |w| w.is_read_only = read_only)
    }

    pub fn set_worker_svc_port(&self, name: &str, port: u16) -> Result<WorkerInfo> {
        self.update_worker(name, |w| w.svc_port = port)
    }

    fn update_worker(&self, name: &str, f: impl FnOnce(&mut WorkerInfo)) -> Result<WorkerInfo> {
        let mut registry = self.write();
        let worker = registry
            .workers
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownWorker(name.to_string()))?;
        f(worker);
        Ok(worker.clone())
    }

    // ========================================================================
    // Families and databases
    // ========================================================================

    pub fn families(&self) -> Vec<String> {
        self.read().families.keys().cloned().collect()
    }

    pub fn is_known_family(&self, name: &str) -> bool {
        self.read().families.contains_key(name)
    }

    pub fn family_info(&self, name: &str) -> Result<DatabaseFamilyInfo> {
        self.read()
            .families
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownFamily(name.to_string()))
    }

    pub fn add_family(&self, info: DatabaseFamilyInfo) -> Result<()> {
        if info.num_stripes < 1 || info.num_sub_stripes < 1 || info.replication_level < 1 {
            return Err(ConfigError::Inconsistent(format!(
                "family {} needs positive stripes, sub-stripes and replication level",
                info.name
            )));
        }
        let mut registry = self.write();
        if registry.families.contains_key(&info.name) {
            return Err(ConfigError::Inconsistent(format!(
                "family {} is already registered",
                info.name
            )));
        }
        registry.families.insert(info.name.clone(), info);
        Ok(())
    }

    /// Names of the databases, optionally restricted to one family.
    pub fn databases(&self, family: Option<&str>) -> Vec<String> {
        self.read()
            .databases
            .values()
            .filter(|d| family.is_none_or(|f| d.family == f))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn is_known_database(&self, name: &str) -> bool {
        self.read().databases.contains_key(name)
    }

    pub fn database_info(&self, name: &str) -> Result<DatabaseInfo> {
        self.read()
            .databases
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDatabase(name.to_string()))
    }

    /// Register a database. Its family must already be known.
    pub fn add_database(&self, info: DatabaseInfo) -> Result<()> {
        let mut registry = self.write();
        if !registry.families.contains_key(&info.family) {
            return Err(ConfigError::UnknownFamily(info.family.clone()));
        }
        if registry.databases.contains_key(&info.name) {
            return Err(ConfigError::Inconsistent(format!(
                "database {} is already registered",
                info.name
            )));
        }
        registry.databases.insert(info.name.clone(), info);
        Ok(())
    }

    pub fn publish_database(&self, name: &str) -> Result<DatabaseInfo> {
        let mut registry = self.write();
        let database = registry
            .databases
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownDatabase(name.to_string()))?;
        database.is_published = true;
        Ok(database.clone())
    }

    // Lock poisoning only happens if a setter closure panicked; the registry
    // maps are still structurally valid, so keep serving them.
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "general": { "retry_timeout_sec": 2, "worker_num_processing_threads": 8 },
        "workers": [
            { "name": "worker-a", "svc_host": "10.0.0.1", "data_dir": "/data/a" },
            { "name": "worker-b", "svc_host": "10.0.0.2", "svc_port": 26000,
              "data_dir": "/data/b", "is_enabled": false },
            { "name": "worker-c", "svc_host": "10.0.0.3", "data_dir": "/data/c",
              "is_read_only": true }
        ],
        "families": [
            { "name": "production", "replication_level": 2,
              "num_stripes": 340, "num_sub_stripes": 3, "overlap": 0.01667 }
        ],
        "databases": [
            { "name": "gaia", "family": "production",
              "partitioned_tables": ["Source", "Object"], "regular_tables": ["Filter"],
              "director_table": "Object", "director_key": "objectId" }
        ]
    }"#;

    #[test]
    fn test_from_json() {
        let config = Configuration::from_json(DOC).unwrap();
        assert_eq!(config.general().retry_timeout_sec, 2);
        assert_eq!(config.general().worker_num_processing_threads, 8);
        assert_eq!(config.general().request_buf_size_bytes, 131_072);

        let a = config.worker_info("worker-a").unwrap();
        assert_eq!(a.svc_port, 25000);
        assert_eq!(a.svc_addr(), "10.0.0.1:25000");
        assert!(a.is_enabled);

        assert_eq!(config.workers(true, false), vec!["worker-a"]);
        assert_eq!(config.workers(true, true), vec!["worker-c"]);
        assert_eq!(config.workers(false, false), vec!["worker-b"]);

        let db = config.database_info("gaia").unwrap();
        assert!(db.is_partitioned("Source"));
        assert!(!db.is_partitioned("Filter"));
        assert_eq!(db.tables().collect::<Vec<_>>(), vec!["Source", "Object", "Filter"]);
        assert_eq!(db.chunk_id_col, "chunkId");
        assert_eq!(config.databases(Some("production")), vec!["gaia"]);
        assert!(config.databases(Some("other")).is_empty());
    }

    #[test]
    fn test_unknown_names_fail() {
        let config = Configuration::from_json(DOC).unwrap();
        assert!(!config.is_known_worker("nope"));
        assert!(matches!(
            config.worker_info("nope"),
            Err(ConfigError::UnknownWorker(_))
        ));
        assert!(matches!(
            config.database_info("nope"),
            Err(ConfigError::UnknownDatabase(_))
        ));
        assert!(matches!(
            config.family_info("nope"),
            Err(ConfigError::UnknownFamily(_))
        ));
        assert!(config.disable_worker("nope").is_err());
    }

    #[test]
    fn test_setters() {
        let config = Configuration::from_json(DOC).unwrap();
        let a = config.disable_worker("worker-a").unwrap();
        assert!(!a.is_enabled);
        assert!(!config.worker_info("worker-a").unwrap().is_enabled);

        config.set_worker_svc_port("worker-b", 27000).unwrap();
        assert_eq!(config.worker_info("worker-b").unwrap().svc_port, 27000);

        config.enable_worker("worker-b").unwrap();
        assert_eq!(config.workers(true, false), vec!["worker-b"]);
    }

    #[test]
    fn test_database_requires_known_family() {
        let config = Configuration::new(GeneralSettings::default());
        let err = config
            .add_database(DatabaseInfo::new("db", "missing"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFamily(_)));
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let config = Configuration::new(GeneralSettings::default());
        config.add_worker(WorkerInfo::new("w", "localhost", 1)).unwrap();
        assert!(config.add_worker(WorkerInfo::new("w", "localhost", 2)).is_err());
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let config = Configuration::from_json(DOC).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.json");
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let reloaded = Configuration::load(&path).unwrap();
        assert_eq!(reloaded.general(), config.general());
        assert_eq!(
            reloaded.worker_info("worker-b").unwrap(),
            config.worker_info("worker-b").unwrap()
        );
    }

    #[test]
    fn test_reload_replaces_registry() {
        let config = Configuration::from_json(DOC).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"general": {"retry_timeout_sec": 9}, "workers": [{"name": "worker-z", "svc_host": "z"}]}"#,
        )
        .unwrap();

        config.reload(file.path()).unwrap();
        assert_eq!(config.all_workers(), vec!["worker-z".to_string()]);
        assert!(config.databases(None).is_empty());
        assert_eq!(config.general().retry_timeout_sec, GeneralSettings::default().retry_timeout_sec);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            Configuration::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
