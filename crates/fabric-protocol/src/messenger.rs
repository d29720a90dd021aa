// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing of requests to per-worker connectors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use fabric_config::Configuration;
use prost::Message;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::connector::{ConnectorError, MessengerConnector};

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// The request never produced a usable response (transport failure or
    /// the connector was stopped).
    #[error("request {id} to worker {worker} failed")]
    Failed { worker: String, id: String },

    /// The request was cancelled before a response arrived.
    #[error("request {id} to worker {worker} was cancelled")]
    Cancelled { worker: String, id: String },
}

/// One [`MessengerConnector`] per worker, created on first use.
pub struct Messenger {
    config: Arc<Configuration>,
    connectors: Mutex<HashMap<String, MessengerConnector>>,
}

impl Messenger {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            connectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Connector of a registered worker.
    pub fn connector(&self, worker: &str) -> Result<MessengerConnector, MessengerError> {
        let mut connectors = self.connectors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(connector) = connectors.get(worker) {
            return Ok(connector.clone());
        }
        if !self.config.is_known_worker(worker) {
            return Err(MessengerError::UnknownWorker(worker.to_string()));
        }
        let connector = MessengerConnector::new(worker, self.config.clone());
        connectors.insert(worker.to_string(), connector.clone());
        Ok(connector)
    }

    /// See [`MessengerConnector::send`].
    pub fn send<R, F>(&self, worker: &str, id: &str, request: Bytes, on_finish: F) -> Result<(), MessengerError>
    where
        R: Message + Default + Send + 'static,
        F: FnOnce(String, bool, R) + Send + 'static,
    {
        Ok(self.connector(worker)?.send(id, request, on_finish)?)
    }

    /// See [`MessengerConnector::cancel`].
    pub fn cancel(&self, worker: &str, id: &str) -> Result<(), MessengerError> {
        self.connector(worker)?.cancel(id);
        Ok(())
    }

    /// See [`MessengerConnector::exists`].
    pub fn exists(&self, worker: &str, id: &str) -> Result<bool, MessengerError> {
        Ok(self.connector(worker)?.exists(id))
    }

    /// Send a request and wait for its response.
    pub async fn request<R>(&self, worker: &str, id: &str, request: Bytes) -> Result<R, MessengerError>
    where
        R: Message + Default + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send::<R, _>(worker, id, request, move |_, success, response| {
            let _ = tx.send((success, response));
        })?;
        match rx.await {
            Ok((true, response)) => Ok(response),
            Ok((false, _)) => Err(MessengerError::Failed {
                worker: worker.to_string(),
                id: id.to_string(),
            }),
            // The callback was dropped unfired: the request got cancelled.
            Err(_) => Err(MessengerError::Cancelled {
                worker: worker.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Stop every connector.
    pub fn stop(&self) {
        let connectors: Vec<MessengerConnector> = self
            .connectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for connector in connectors {
            connector.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EchoResponse;
    use fabric_config::{GeneralSettings, WorkerInfo};

    fn messenger() -> Messenger {
        let config = Configuration::new(GeneralSettings::default());
        config
            .add_worker(WorkerInfo::new("w1", "127.0.0.1", 1))
            .unwrap();
        Messenger::new(Arc::new(config))
    }

    #[test]
    fn test_unknown_worker() {
        let messenger = messenger();
        assert!(matches!(
            messenger.connector("nope"),
            Err(MessengerError::UnknownWorker(_))
        ));
        assert!(messenger.connector("w1").is_ok());
    }

    #[tokio::test]
    async fn test_request_fails_when_stopped() {
        let messenger = Arc::new(messenger());
        let m = messenger.clone();
        let pending = tokio::spawn(async move {
            m.request::<EchoResponse>("w1", "r1", Bytes::new()).await
        });
        while !messenger.exists("w1", "r1").unwrap() {
            tokio::task::yield_now().await;
        }
        messenger.stop();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(MessengerError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_request_reports_cancellation() {
        let messenger = Arc::new(messenger());
        let m = messenger.clone();
        let pending = tokio::spawn(async move {
            m.request::<EchoResponse>("w1", "r1", Bytes::new()).await
        });
        while !messenger.exists("w1", "r1").unwrap() {
            tokio::task::yield_now().await;
        }
        messenger.cancel("w1", "r1").unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(MessengerError::Cancelled { .. })));
        messenger.stop();
    }
}
