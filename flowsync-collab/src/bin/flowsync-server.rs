//! Standalone sync server.
//!
//! Configured from `FLOWSYNC_BIND`, `FLOWSYNC_STORAGE`, `FLOWSYNC_JWT_SECRET`
//! and `FLOWSYNC_CHECKPOINT_INTERVAL`; log level from `RUST_LOG`.

use flowsync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting flowsync server (storage: {}, auth: {})",
        config
            .storage_path
            .as_ref()
            .map_or("memory".to_string(), |p| p.display().to_string()),
        if config.jwt_secret.is_some() { "jwt" } else { "anonymous" }
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
