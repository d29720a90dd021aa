// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP accept loop for worker services.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::frame::FrameError;

/// Errors that can occur in the worker server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("server closed")]
    Closed,
}

/// Configuration for the worker server
#[derive(Debug, Clone)]
pub struct WorkerServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Listen backlog
    pub backlog: i32,
    /// TCP receive buffer size in bytes (0 for OS default)
    pub recv_buffer_size: usize,
    /// TCP send buffer size in bytes (0 for OS default)
    pub send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for WorkerServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 25000)),
            backlog: 1024,
            recv_buffer_size: 0,
            send_buffer_size: 0,
            max_concurrent_handlers: 0, // unlimited by default
        }
    }
}

impl WorkerServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `FABRIC_SERVER_BACKLOG`: Listen backlog (default: 1024)
    /// - `FABRIC_SERVER_RECV_BUFFER`: TCP receive buffer size in bytes (default: OS)
    /// - `FABRIC_SERVER_SEND_BUFFER`: TCP send buffer size in bytes (default: OS)
    /// - `FABRIC_SERVER_MAX_HANDLERS`: Max concurrent connections, 0 for unlimited (default: 0)
    pub fn from_env(bind_addr: SocketAddr) -> Self {
        let default = Self::default();

        Self {
            bind_addr,
            backlog: std::env::var("FABRIC_SERVER_BACKLOG")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.backlog),
            recv_buffer_size: std::env::var("FABRIC_SERVER_RECV_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.recv_buffer_size),
            send_buffer_size: std::env::var("FABRIC_SERVER_SEND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.send_buffer_size),
            max_concurrent_handlers: std::env::var("FABRIC_SERVER_MAX_HANDLERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_concurrent_handlers),
        }
    }
}

/// TCP server accepting controller connections.
pub struct WorkerServer {
    listener: TcpListener,
    config: WorkerServerConfig,
}

impl WorkerServer {
    /// Bind a listener with the given configuration. Must be called from
    /// within a tokio runtime.
    pub fn new(config: WorkerServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        if config.recv_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size)
        {
            warn!(
                size = config.recv_buffer_size,
                error = %e,
                "Failed to set TCP receive buffer size"
            );
        }
        if config.send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.send_buffer_size)
        {
            warn!(
                size = config.send_buffer_size,
                error = %e,
                "Failed to set TCP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        socket.listen(config.backlog)?;
        socket.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        info!(
            addr = %config.bind_addr,
            backlog = config.backlog,
            max_handlers = config.max_concurrent_handlers,
            "Worker server bound"
        );

        Ok(Self { listener, config })
    }

    /// Bind to an ephemeral port on the loopback interface.
    pub fn localhost() -> Result<Self, ServerError> {
        Self::new(WorkerServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..WorkerServerConfig::default()
        })
    }

    /// Get the server configuration
    pub fn config(&self) -> &WorkerServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server, spawning `handler` for every accepted connection.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Worker server running");

        // Create semaphore for backpressure if configured
        let semaphore = if self.config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_handlers as usize,
            )))
        } else {
            None
        };

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%remote_addr, error = %e, "failed to set TCP_NODELAY");
            }

            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                // Acquire permit if semaphore is configured
                let _permit = if let Some(ref sem) = semaphore {
                    match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    }
                } else {
                    None
                };

                debug!(%remote_addr, "accepted connection");
                handler(stream, remote_addr).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_localhost_binds_ephemeral_port() {
        let server = WorkerServer::localhost().unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_run_dispatches_connections() {
        let server = WorkerServer::localhost().unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = server
                .run(|mut stream: TcpStream, _| async move {
                    let mut byte = [0u8; 1];
                    if stream.read_exact(&mut byte).await.is_ok() {
                        let _ = stream.write_all(&[byte[0] + 1]).await;
                    }
                })
                .await;
        });

        for value in [1u8, 41] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[value]).await.unwrap();
            let mut reply = [0u8; 1];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[0], value + 1);
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerServerConfig::default();
        assert_eq!(config.bind_addr.port(), 25000);
        assert_eq!(config.max_concurrent_handlers, 0);
    }
}
