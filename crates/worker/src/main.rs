//! MyHealth Guide Background Worker
//!
//! Handles scheduled jobs including:
//! - App-level trial expiry (hourly)
//! - Agency mirror audit (daily at 4:00 AM UTC)
//! - Worker heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use myhealthguide_billing::BillingService;
use myhealthguide_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting MyHealth Guide Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire app-level trials
    // Cron: At minute 0 of every hour
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                info!("Running scheduled trial expiry");
                jobs::expire_trials(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry (hourly)");

    // Job 2: Agency mirror audit
    // Cron: At 04:00 every day
    let audit_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let billing = audit_billing.clone();
            Box::pin(async move {
                info!("Running agency mirror audit");
                let violations = jobs::audit_agency_mirrors(&billing).await;
                info!(violations = violations, "Agency mirror audit complete");
            })
        })?)
        .await?;
    info!("Scheduled: Agency mirror audit (04:00 UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("MyHealth Guide Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
