//! `strata serve`: the HTTP API plus background housekeeping.

use std::sync::Arc;
use strata_memory::MemorySubstrate;
use strata_types::config::SubstrateConfig;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn cmd_serve(config: SubstrateConfig, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.api_listen.clone());
    let substrate = Arc::new(MemorySubstrate::open(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = substrate.start_background(shutdown_rx.clone());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    let served = strata_api::server::run_server(substrate, &listen, shutdown_rx).await;
    for handle in background {
        let _ = handle.await;
    }
    served?;
    info!("Strata stopped");
    Ok(())
}
