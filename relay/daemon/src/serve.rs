//! Worker process
//!
//! Wires the AMQP broker and the llama.cpp backend into a [`Worker`] and runs
//! it until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use relay_core::transport::AmqpBroker;
use relay_core::{LlamaCppBackend, LlmBackend, RelayConfig, Worker};

/// Run the worker until a shutdown signal arrives
pub async fn run(config: &RelayConfig) -> Result<()> {
    let backend = Arc::new(LlamaCppBackend::new(config.backend.clone()));
    if backend.health_check().await {
        info!(url = %config.backend.url, "llama.cpp backend is healthy");
    } else {
        // The worker still starts; requests fail with backend errors until it is up
        warn!(url = %config.backend.url, "llama.cpp backend is not responding");
    }

    let broker = Arc::new(AmqpBroker::new(config.broker.clone()));
    let worker = Worker::new(broker, backend, config.worker_config());
    worker.run(shutdown_signal()).await?;
    Ok(())
}

/// Completes on SIGTERM or SIGINT
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT, initiating shutdown"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl-C, waiting for SIGTERM");
                sigterm.recv().await;
            }
        },
    }
}
