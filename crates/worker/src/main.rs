// Worker clippy configuration
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger Background Worker
//!
//! Handles scheduled jobs:
//! - Drift resync of every known customer from Stripe (every 6 hours by default)
//! - Heartbeat (every 5 minutes)

mod resync;

use std::sync::Arc;

use anyhow::Context;
use subledger_billing::BillingService;
use subledger_shared::{create_pool, run_migrations, AccountLocks, AccountStore, PgAccountStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::resync::{log_resync_report, ResyncJob};

/// Default schedule: minute 0 past every 6th hour
const DEFAULT_RESYNC_CRON: &str = "0 0 */6 * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,subledger_worker=debug")),
        )
        .init();

    info!("Starting Subledger Worker");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for the worker")?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let store: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool));
    let billing = BillingService::from_env(store.clone(), AccountLocks::new())?;
    let job = Arc::new(ResyncJob::new(store, billing.webhooks.clone()));

    let resync_cron =
        std::env::var("RESYNC_CRON").unwrap_or_else(|_| DEFAULT_RESYNC_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drift resync
    let resync_job = job.clone();
    scheduler
        .add(Job::new_async(resync_cron.as_str(), move |_uuid, _l| {
            let job = resync_job.clone();
            Box::pin(async move {
                info!("Running scheduled customer resync from Stripe");
                let report = job.run().await;
                log_resync_report(&report);
            })
        })?)
        .await?;
    info!(cron = %resync_cron, "Scheduled: Customer resync");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, waiting for jobs...");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    Ok(())
}
