//! Scheduled jobs
//!
//! Each job runs against an explicit `now` and logs its own report. A run
//! that is still in progress when the next tick fires makes that tick a no-op.

use std::sync::Arc;

use bulldogo_billing::{AccountPurge, ExpiryEnforcer, PurgeReport, SweepReport};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Services the scheduled jobs run with
#[derive(Clone)]
pub struct WorkerContext {
    enforcer: Arc<ExpiryEnforcer>,
    purge: Option<Arc<AccountPurge>>,
    sweep_lock: Arc<Mutex<()>>,
    purge_lock: Arc<Mutex<()>>,
}

impl WorkerContext {
    pub fn new(enforcer: ExpiryEnforcer, purge: Option<AccountPurge>) -> Self {
        Self {
            enforcer: Arc::new(enforcer),
            purge: purge.map(Arc::new),
            sweep_lock: Arc::new(Mutex::new(())),
            purge_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn has_purge(&self) -> bool {
        self.purge.is_some()
    }

    /// Run one expiry sweep; `None` when skipped or failed
    pub async fn run_expiry_sweep(&self, now: OffsetDateTime) -> Option<SweepReport> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            warn!("Previous expiry sweep still running, skipping tick");
            return None;
        };

        match self.enforcer.sweep(now).await {
            Ok(report) => {
                if report.failures.is_empty() {
                    info!(
                        processed = report.processed,
                        marked_expired = report.marked_expired,
                        inactivated = report.inactivated,
                        deleted = report.deleted,
                        renewed = report.renewed,
                        "Expiry sweep completed"
                    );
                } else {
                    warn!(
                        processed = report.processed,
                        inactivated = report.inactivated,
                        deleted = report.deleted,
                        renewed = report.renewed,
                        failures = report.failures.len(),
                        "Expiry sweep completed with failures"
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Expiry sweep failed");
                None
            }
        }
    }

    /// Run one inactive account purge; `None` when disabled, skipped or failed
    pub async fn run_account_purge(&self, now: OffsetDateTime) -> Option<PurgeReport> {
        let purge = self.purge.as_ref()?;
        let Ok(_guard) = self.purge_lock.try_lock() else {
            warn!("Previous account purge still running, skipping tick");
            return None;
        };

        match purge.run(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Inactive account purge failed");
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bulldogo_billing::{AccountPlanRecord, InMemoryStore, Listing};
    use bulldogo_shared::{AccountId, ListingStatus, PlanId, PLAN_EXPIRED_REASON};
    use time::macros::datetime;
    use time::Duration;

    #[tokio::test]
    async fn test_sweep_job_enforces_expiry() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let end = datetime!(2024-01-01 00:00 UTC);
        store
            .insert_plan(AccountPlanRecord {
                plan_id: PlanId::Hobby,
                period_start: Some(end - Duration::days(30)),
                period_end: Some(end),
                ..AccountPlanRecord::empty(account.clone())
            })
            .await;
        let listing = store.insert_listing(Listing::new(account.clone())).await;

        let context = WorkerContext::new(ExpiryEnforcer::new(store.clone()), None);
        let report = context
            .run_expiry_sweep(datetime!(2024-01-02 00:00 UTC))
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.inactivated, 1);
        let listing = store.listing(listing).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Inactive);
        assert_eq!(listing.inactive_reason.as_deref(), Some(PLAN_EXPIRED_REASON));
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let context = WorkerContext::new(ExpiryEnforcer::new(store), None);

        let _held = context.sweep_lock.lock().await;
        assert!(context
            .run_expiry_sweep(OffsetDateTime::now_utc())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_purge_disabled_without_identity_provider() {
        let store = Arc::new(InMemoryStore::new());
        let context = WorkerContext::new(ExpiryEnforcer::new(store), None);
        assert!(!context.has_purge());
        assert!(context
            .run_account_purge(OffsetDateTime::now_utc())
            .await
            .is_none());
    }
}
