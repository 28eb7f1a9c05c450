//! Bulldogo background worker
//!
//! Runs the plan expiry sweep and the inactive account purge on cron
//! schedules. Schedules are evaluated in UTC.

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use bulldogo_billing::{
    AccountPurge, AccountStore, ExpiryEnforcer, IdentityProvider, PgPlanStore, PlanStore,
    SupabaseIdentity,
};
use bulldogo_shared::{create_pool, init_tracing};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::WorkerConfig;
use crate::jobs::WorkerContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("bulldogo_worker=info,bulldogo_billing=info");

    let config = WorkerConfig::from_env().context("Invalid configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to create database pool")?;
    let store = Arc::new(PgPlanStore::new(pool));

    let plan_store: Arc<dyn PlanStore> = store.clone();
    let enforcer = ExpiryEnforcer::new(plan_store);

    let purge = if config.enable_account_purge {
        match SupabaseIdentity::from_env() {
            Ok(identity) => {
                let account_store: Arc<dyn AccountStore> = store.clone();
                let identity: Arc<dyn IdentityProvider> = Arc::new(identity);
                Some(AccountPurge::new(account_store, identity))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Account purge enabled but identity provider is not configured");
                None
            }
        }
    } else {
        None
    };

    let context = WorkerContext::new(enforcer, purge);
    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;

    let sweep_context = context.clone();
    scheduler
        .add(
            Job::new_async(config.sweep_schedule.as_str(), move |_id, _scheduler| {
                let context = sweep_context.clone();
                Box::pin(async move {
                    context.run_expiry_sweep(OffsetDateTime::now_utc()).await;
                })
            })
            .context("Invalid sweep schedule")?,
        )
        .await
        .context("Failed to schedule expiry sweep")?;
    tracing::info!(schedule = %config.sweep_schedule, "Expiry sweep scheduled");

    if context.has_purge() {
        let purge_context = context.clone();
        scheduler
            .add(
                Job::new_async(config.purge_schedule.as_str(), move |_id, _scheduler| {
                    let context = purge_context.clone();
                    Box::pin(async move {
                        context.run_account_purge(OffsetDateTime::now_utc()).await;
                    })
                })
                .context("Invalid purge schedule")?,
            )
            .await
            .context("Failed to schedule account purge")?;
        tracing::info!(schedule = %config.purge_schedule, "Inactive account purge scheduled");
    }

    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;
    tracing::info!("Bulldogo worker started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping worker");

    let mut scheduler = scheduler;
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Scheduler shutdown failed");
    }

    Ok(())
}
