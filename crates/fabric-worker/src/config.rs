// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process configuration for fabric-worker.

use std::path::PathBuf;

use fabric_config::ConfigError;

const DEFAULT_INSTANCE_ID: &str = "fabric";

/// Worker process configuration loaded from environment variables.
///
/// Everything about the fabric itself (other workers, databases, general
/// tunables) lives in the registry file named by `config_path`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of this worker in the registry
    pub worker_name: String,
    /// Registry JSON file
    pub config_path: PathBuf,
    /// MySQL URL of the worker's database server
    pub database_url: String,
    /// Fabric instance this worker belongs to
    pub instance_id: String,
    /// Overrides the registry's processing thread count when set
    pub num_threads: Option<usize>,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FABRIC_WORKER_NAME`
    /// - `FABRIC_CONFIG_PATH`
    /// - `FABRIC_DATABASE_URL`
    ///
    /// Optional:
    /// - `FABRIC_INSTANCE_ID` (default: `fabric`)
    /// - `FABRIC_WORKER_THREADS` (default: from the registry)
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_name = std::env::var("FABRIC_WORKER_NAME")
            .map_err(|_| ConfigError::Missing("FABRIC_WORKER_NAME"))?;

        let config_path = std::env::var("FABRIC_CONFIG_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("FABRIC_CONFIG_PATH"))?;

        let database_url = std::env::var("FABRIC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FABRIC_DATABASE_URL"))?;

        let instance_id = std::env::var("FABRIC_INSTANCE_ID")
            .unwrap_or_else(|_| DEFAULT_INSTANCE_ID.to_string());

        let num_threads = match std::env::var("FABRIC_WORKER_THREADS") {
            Ok(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(ConfigError::Invalid(
                        "FABRIC_WORKER_THREADS",
                        "expected a positive integer",
                    ));
                }
            },
            Err(_) => None,
        };

        Ok(Self {
            worker_name,
            config_path,
            database_url,
            instance_id,
            num_threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn required(guard: &mut EnvGuard) {
        guard.set("FABRIC_WORKER_NAME", "worker-a");
        guard.set("FABRIC_CONFIG_PATH", "/etc/fabric/registry.json");
        guard.set("FABRIC_DATABASE_URL", "mysql://qsmaster@127.0.0.1:3306");
    }

    #[test]
    fn test_from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        required(&mut guard);
        guard.remove("FABRIC_INSTANCE_ID");
        guard.remove("FABRIC_WORKER_THREADS");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.worker_name, "worker-a");
        assert_eq!(config.config_path, PathBuf::from("/etc/fabric/registry.json"));
        assert_eq!(config.instance_id, "fabric");
        assert_eq!(config.num_threads, None);
    }

    #[test]
    fn test_from_env_missing_name() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        required(&mut guard);
        guard.remove("FABRIC_WORKER_NAME");

        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::Missing("FABRIC_WORKER_NAME"))
        ));
    }

    #[test]
    fn test_from_env_threads() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        required(&mut guard);
        guard.set("FABRIC_WORKER_THREADS", "8");
        guard.set("FABRIC_INSTANCE_ID", "qserv-prod");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.num_threads, Some(8));
        assert_eq!(config.instance_id, "qserv-prod");

        guard.set("FABRIC_WORKER_THREADS", "0");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::Invalid("FABRIC_WORKER_THREADS", _))
        ));
    }
}
