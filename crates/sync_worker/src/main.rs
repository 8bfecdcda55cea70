//! Background worker that keeps rental calendars in sync.
//! Runs the respectful sync scheduler on its cron triggers until interrupted.

use std::sync::Arc;

use anyhow::Context;
use calendar_sync::{PgPropertyStore, RemoteExtractionClient, SyncConfig, SyncScheduler, SystemClock};
use postgres::database::*;

mod cron_manager;
use cron_manager::{CronTriggers, report_health};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("🚀 Starting calendar sync worker...");

    let config = SyncConfig::from_env().context("Invalid calendar sync configuration")?;
    if !config.sync_enabled {
        log::warn!("Calendar sync is disabled, scheduled batches will be skipped");
    }

    let pool = create_connection_pool()
        .await
        .context("Failed to create database pool")?;
    log::info!("🗃️ Database pool created successfully");
    if let Err(e) = test_connection(&pool).await {
        log::error!("❌ Database connection test failed: {}", e);
    }

    let extractor =
        RemoteExtractionClient::new(&config.extraction_service_url, config.extraction_timeout)
            .context("Failed to create extraction client")?;
    log::info!(
        "🔗 Using calendar extraction service at {}",
        config.extraction_service_url
    );

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::new(PgPropertyStore::new(pool)),
        Arc::new(extractor),
        Arc::new(SystemClock),
        config,
    ));
    report_health(&scheduler).await;

    let mut triggers = CronTriggers::new(scheduler.clone());
    triggers.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Shutdown requested, draining calendar sync");

    triggers.stop().await?;
    scheduler.emergency_stop(Some("worker shutting down")).await;

    log::info!("Calendar sync worker stopped");
    Ok(())
}
