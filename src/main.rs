use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use quotaboard::config::{ConfigProvider, JsonConfigStore};
use quotaboard::engine::CollectorEngine;
use quotaboard::scheduler::Scheduler;
use quotaboard::secrets::{self, SecretsStore};
use quotaboard::state::RunStateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotaboard=info".into()),
        )
        .init();

    info!("Quotaboard starting...");

    let data_dir: PathBuf = std::env::var("QUOTABOARD_DATA_DIR")
        .unwrap_or_else(|_| "./data".to_string())
        .into();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let master_key = match std::env::var("QUOTABOARD_ENCRYPTION_KEY") {
        Ok(key) => key,
        Err(_) => {
            let key = secrets::generate_key();
            eprintln!("QUOTABOARD_ENCRYPTION_KEY is not set.");
            eprintln!("Generated one for you — export it before the next start:");
            eprintln!("  export QUOTABOARD_ENCRYPTION_KEY={key}");
            anyhow::bail!("missing encryption key");
        }
    };

    let secrets = Arc::new(SecretsStore::open(data_dir.join("secrets.db"), &master_key)?);
    let states = Arc::new(RunStateStore::open(data_dir.join("state.db"))?);
    let config: Arc<dyn ConfigProvider> = Arc::new(JsonConfigStore::new(&data_dir));

    let engine = Arc::new(CollectorEngine::new(
        Arc::clone(&config),
        secrets,
        states,
    ));
    let scheduler = Scheduler::new(Arc::clone(&engine), config);
    scheduler.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}
