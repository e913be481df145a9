//! Quire sync server binary.
//!
//! Configuration comes from `QUIRE_*` environment variables, logging from
//! `RUST_LOG`. `QUIRE_SEED_DOCS=id[=Name],...` creates documents on startup.

use std::sync::Arc;

use log::info;
use quire_sync::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting Quire sync server on {} (quiescence {:?}, storage {})",
        config.bind_addr,
        config.quiescence,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );

    let server = Arc::new(SyncServer::open(config)?);
    let seeded = server.seed_documents().await?;
    let documents = server.list_documents().await?;
    info!("{} documents available ({seeded} seeded)", documents.len());
    if documents.is_empty() {
        log::warn!("No documents exist; every connection will be rejected. Set QUIRE_SEED_DOCS");
    }

    let listener = server.bind().await?;
    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    tokio::select! {
        result = &mut serving => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    server.shutdown();
    serving.await??;
    info!("Bye");
    Ok(())
}
