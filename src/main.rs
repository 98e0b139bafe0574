//! `invoxd`: runs the processing workers, the retry worker and the
//! recovery sweeps against a local database and blob directory.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use invox::config::Settings;
use invox::db::Database;
use invox::services::{recovery, retry, worker};
use invox::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = std::env::var("INVOX_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db = Database::new(data_dir.join("invox.sqlite")).context("opening database")?;
    let settings = Settings::load(&db);
    info!(
        workers = settings.worker_count,
        match_threshold = settings.match_threshold,
        "starting invoice pipeline"
    );

    let state = AppState::new(db, settings, data_dir.join("blobs"));

    for _ in 0..state.settings.worker_count {
        tokio::spawn(worker::run_worker(state.clone()));
    }
    tokio::spawn(retry::run_retry_worker(state.clone()));
    tokio::spawn(recovery::run_recovery_worker(state.clone()));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
