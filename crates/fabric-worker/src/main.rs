// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Worker - request processing service of a worker node
//!
//! The worker is responsible for:
//! - Replicas of chunk tables in its data directory
//! - SQL and director index requests against its MySQL server
//! - Reporting request and service status to controllers

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use fabric_config::Configuration;
use fabric_protocol::{WorkerServer, WorkerServerConfig};
use fabric_worker::database::MySqlDatabase;
use fabric_worker::{ProcessorConfig, RequestContext, WorkerConfig, WorkerProcessor, run_worker_server};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fabric_worker=info".parse()?),
        )
        .init();

    info!("Starting Fabric Worker");

    // Load configuration
    let config = WorkerConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let registry = Arc::new(Configuration::load(&config.config_path).map_err(|e| {
        error!(path = %config.config_path.display(), "Registry error: {}", e);
        e
    })?);
    let worker = registry.worker_info(&config.worker_name)?;

    info!(
        worker = %worker.name,
        svc_port = worker.svc_port,
        data_dir = %worker.data_dir.display(),
        instance_id = %config.instance_id,
        "Configuration loaded"
    );

    let general = registry.general().clone();
    // Connect to database
    info!("Connecting to database...");
    let max_connections = u32::try_from(general.worker_num_db_connections).unwrap_or(u32::MAX);
    let pool = Arc::new(MySqlDatabase::connect(&config.database_url, max_connections).await?);

    let ctx = Arc::new(RequestContext {
        worker: worker.name.clone(),
        config: registry.clone(),
        pool,
        config_path: Some(config.config_path.clone()),
    });

    let mut processor_config = ProcessorConfig::from_general(&general);
    if let Some(n) = config.num_threads {
        processor_config.num_threads = n;
    }
    let processor = WorkerProcessor::new(ctx, processor_config);
    processor.run().await;

    // Expire finished requests in the background
    let housekeeping = processor.clone();
    let housekeeping_handle = tokio::spawn(async move {
        housekeeping.run_housekeeping().await;
    });

    // Start the controller-facing server
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], worker.svc_port));
    let server = WorkerServer::new(WorkerServerConfig::from_env(bind_addr))?;
    let server_processor = processor.clone();
    let instance_id = config.instance_id.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_worker_server(server, server_processor, instance_id).await {
            error!("Worker server error: {}", e);
        }
    });

    info!("Fabric Worker initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    server_handle.abort();
    processor.stop();
    processor.shutdown_handle().notify_one();
    let _ = housekeeping_handle.await;

    info!("Shutdown complete");

    Ok(())
}
