//! tallyd: Tally series server over reliable datagrams.

use std::sync::Arc;

use anyhow::{Context, Result};

use tally_core::config::{StorageBackend, TallyConfig};
use tally_services::{MemoryStore, SeriesStore};
use tallyd::{Server, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TallyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TallyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TallyConfig::default()
    });

    let store: Arc<dyn SeriesStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            let path = &config.storage.path;
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            tracing::info!(path = %path.display(), "sqlite store ready");
            Arc::new(store)
        }
        StorageBackend::Memory => {
            tracing::warn!("memory store selected, data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let server = Server::bind(config, store)
        .await
        .context("failed to bind server socket")?;
    let handle = server.spawn()?;
    tracing::info!(addr = %handle.local_addr(), "tallyd listening");

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = handle.subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        _ = shutdown_rx.recv()      => tracing::error!("server stopped unexpectedly"),
    }

    handle.shutdown().await
}
