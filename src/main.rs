use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medialinker::app::AppContext;
use medialinker::config::Config;
use medialinker::db::Database;
use medialinker::services::{ShutdownMode, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medialinker=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting medialinker");

    let db = Database::connect(&config.database_path).await?;
    db.migrate().await?;
    tracing::info!(path = %config.database_path.display(), "Database ready");

    let ctx = AppContext::build(Arc::clone(&config), db)?;

    ctx.worker_pool
        .start(WorkerSettings::from_config(&config))
        .await?;
    ctx.watcher.start()?;
    let scheduler = Arc::clone(&ctx.scanner).start_schedule().await?;

    // One scan at startup so a cold library does not wait for the first cron
    // tick
    let scanner = Arc::clone(&ctx.scanner);
    tokio::spawn(async move {
        if let Err(err) = scanner.scan().await {
            tracing::error!(error = %err, "Initial scan failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let mut scheduler = scheduler;
    if let Err(err) = scheduler.shutdown().await {
        tracing::warn!(error = %err, "Scheduler shutdown failed");
    }
    ctx.worker_pool.stop(ShutdownMode::Graceful).await;

    Ok(())
}
