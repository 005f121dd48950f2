//! Folio background worker
//!
//! Runs the scheduled payment sweeps against the shared database.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use anyhow::Context;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

mod config;
mod payment_sweeper;

use config::WorkerConfig;
use folio_api::telemetry::init_tracing;
use folio_billing::BillingService;
use payment_sweeper::PaymentSweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let pool = folio_shared::db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    let billing = BillingService::from_env(pool).context("Failed to configure billing")?;
    let sweeper = Arc::new(PaymentSweeper::new(billing));

    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;

    let reconcile_sweeper = sweeper.clone();
    let min_age = config.reconcile_min_age;
    scheduler
        .add(
            Job::new_async(config.reconcile_cron.as_str(), move |_id, _lock| {
                let sweeper = reconcile_sweeper.clone();
                Box::pin(async move {
                    sweeper.reconcile(min_age).await;
                })
            })
            .context("Invalid RECONCILE_CRON")?,
        )
        .await
        .context("Failed to schedule reconcile job")?;

    let expiry_sweeper = sweeper.clone();
    scheduler
        .add(
            Job::new_async(config.expiry_cron.as_str(), move |_id, _lock| {
                let sweeper = expiry_sweeper.clone();
                Box::pin(async move {
                    sweeper.expire().await;
                })
            })
            .context("Invalid EXPIRY_CRON")?,
        )
        .await
        .context("Failed to schedule expiry job")?;

    scheduler.start().await.context("Failed to start scheduler")?;
    tracing::info!(
        reconcile_cron = %config.reconcile_cron,
        expiry_cron = %config.expiry_cron,
        "Folio worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down worker");
    let mut scheduler = scheduler;
    scheduler.shutdown().await.context("Failed to stop scheduler")?;
    Ok(())
}
