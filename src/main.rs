//! Sync daemon: keeps the local queue flowing to the sync server until
//! interrupted.

use offline_sync::sync::{HttpBackend, HttpProbe};
use offline_sync::{Database, EngineConfig, NetworkMonitor, SyncEngine};
use std::sync::Arc;

const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

fn fatal(message: &str) -> ! {
    log::error!("{}", message);
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // Load .env file for server settings
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_dir = match directories::ProjectDirs::from("com", "offline-sync", "offline-sync") {
        Some(dirs) => dirs,
        None => fatal("Failed to get app directories. Please ensure HOME environment variable is set."),
    };

    let data_dir = app_dir.data_dir();
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        fatal(&format!("Failed to create data directory at {:?}: {}", data_dir, e));
    }

    let db_path = data_dir.join("sync.db");
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => db,
        Err(e) => fatal(&format!("Database initialization failed: {}", e)),
    };

    let api_url = match std::env::var("SYNC_API_URL") {
        Ok(url) => url,
        Err(_) => fatal("SYNC_API_URL is not set"),
    };
    let backend = match HttpBackend::new(&api_url) {
        Ok(backend) => backend,
        Err(e) => fatal(&format!("Invalid sync server URL: {}", e)),
    };
    if let Ok(token) = std::env::var("SYNC_API_TOKEN") {
        backend.set_token(token).await;
    }

    let probe_url = std::env::var("SYNC_PROBE_URL").unwrap_or_else(|_| DEFAULT_PROBE_URL.to_string());
    let probe = match HttpProbe::new(&probe_url) {
        Ok(probe) => probe,
        Err(e) => fatal(&format!("Invalid probe URL: {}", e)),
    };

    let engine = SyncEngine::new(
        Arc::new(db),
        Arc::new(backend),
        NetworkMonitor::new(Arc::new(probe)),
    );

    if let Err(e) = engine.initialize(EngineConfig::from_env()).await {
        fatal(&format!("Sync engine initialization failed: {}", e));
    }

    engine.subscribe_stats(|stats| {
        log::debug!(
            "Stats: pending={} completed={} failed={} online={}",
            stats.pending_count,
            stats.completed_count,
            stats.failed_count,
            stats.online
        );
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    log::info!("Shutting down");
    if let Err(e) = engine.shutdown() {
        log::error!("Failed to flush sync state on shutdown: {}", e);
    }
}
