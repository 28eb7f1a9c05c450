//! Expiry Enforcer
//!
//! Periodic sweep over plan records whose period has ended. Each pass:
//!
//! 1. marks the plan record expired (`plan_id = none`, `expired_at` anchored
//!    to the period end, first touch wins);
//! 2. deactivates the account's active listings with reason `plan_expired`;
//! 3. hard-deletes listings whose grace window has elapsed, reviews first;
//! 4. hands accounts that are active again to the renewal reconciler.
//!
//! Every write is idempotent, so overlapping or repeated runs converge. The
//! cross-account query is only a candidate list: each plan record is read
//! again before it is expired, and the expiry write itself only applies while
//! the period is still over. A failure on one account or listing is recorded
//! in the [`SweepReport`] and the sweep moves on.

use std::sync::Arc;

use bulldogo_shared::{AccountId, ListingId, ListingStatus, PLAN_EXPIRED_REASON};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::error::{BillingError, BillingResult};
use crate::plan_state::AccountPlanRecord;
use crate::records::Listing;
use crate::renewal::RenewalReconciler;
use crate::store::{
    delete_listing_with_reviews, FieldChange, ListingPatch, PlanStore, WriteOp, MAX_BATCH_WRITES,
};
use crate::visibility::{classify_for_expiry, ExpiryAction};

/// Stage of the sweep a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStage {
    MarkExpired,
    LoadListings,
    UpdateListing,
    DeleteListing,
    Renewal,
}

/// One isolated failure inside a sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    /// `None` for failures of a cross-account query
    pub account_id: Option<AccountId>,
    pub listing_id: Option<ListingId>,
    pub stage: SweepStage,
    pub error: String,
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Expired plan records looked at
    pub processed: usize,
    /// Plan records newly marked expired
    pub marked_expired: usize,
    /// Listings switched from active to inactive
    pub inactivated: usize,
    /// Plan-expired listings whose missing `inactive_at` was anchored
    pub anchored: usize,
    /// Listings hard-deleted after the grace window
    pub deleted: usize,
    pub reviews_deleted: usize,
    /// Accounts cleared by the renewal reconciler
    pub renewed: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(
        &mut self,
        account_id: Option<&AccountId>,
        listing_id: Option<ListingId>,
        stage: SweepStage,
        err: &BillingError,
    ) {
        error!(
            account_id = ?account_id,
            listing_id = ?listing_id,
            stage = ?stage,
            error = %err,
            "Expiry sweep step failed"
        );
        self.failures.push(SweepFailure {
            account_id: account_id.cloned(),
            listing_id,
            stage,
            error: err.to_string(),
        });
    }
}

/// A pending listing update and what it counts as
struct PendingUpdate {
    listing_id: ListingId,
    action: ExpiryAction,
    op: WriteOp,
}

/// Expiry Enforcer
pub struct ExpiryEnforcer {
    store: Arc<dyn PlanStore>,
    reconciler: RenewalReconciler,
}

impl ExpiryEnforcer {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        let reconciler = RenewalReconciler::new(store.clone());
        Self { store, reconciler }
    }

    /// Run one sweep as of `now`.
    ///
    /// Only the initial expiry query can fail the whole sweep.
    pub async fn sweep(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let mut report = SweepReport::default();

        let candidates = self.store.plans_ending_before(now).await?;
        for candidate in candidates {
            let account_id = &candidate.account_id;
            let record = match self.store.plan(account_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    report.processed += 1;
                    report.fail(Some(account_id), None, SweepStage::MarkExpired, &e);
                    continue;
                }
            };
            if !has_lapsed(&record, now) {
                info!(account_id = %account_id, "Plan renewed since the expiry query, skipping");
                continue;
            }
            report.processed += 1;
            self.expire_account(&record, now, &mut report).await;
        }

        self.reconcile_renewals(now, &mut report).await;

        info!(
            processed = report.processed,
            marked_expired = report.marked_expired,
            inactivated = report.inactivated,
            anchored = report.anchored,
            deleted = report.deleted,
            renewed = report.renewed,
            failures = report.failures.len(),
            "Expiry sweep finished"
        );

        Ok(report)
    }

    async fn expire_account(
        &self,
        record: &AccountPlanRecord,
        now: OffsetDateTime,
        report: &mut SweepReport,
    ) {
        let account_id = &record.account_id;

        if let Some(expired_at) = record.expired_at.or(record.period_end) {
            if !record.is_expired_as(expired_at) {
                match self.store.expire_plan(account_id, expired_at, now).await {
                    Ok(true) => {
                        report.marked_expired += 1;
                        info!(account_id = %account_id, expired_at = %expired_at, "Plan marked expired");
                    }
                    Ok(false) => {
                        info!(account_id = %account_id, "Plan renewed before expiry was written, skipping");
                        return;
                    }
                    Err(e) => {
                        report.fail(Some(account_id), None, SweepStage::MarkExpired, &e);
                        return;
                    }
                }
            }
        }

        let listings = match self.store.listings(account_id).await {
            Ok(listings) => listings,
            Err(e) => {
                report.fail(Some(account_id), None, SweepStage::LoadListings, &e);
                return;
            }
        };

        let mut updates = Vec::new();
        let mut deletions = Vec::new();
        for listing in &listings {
            let action = classify_for_expiry(listing, now);
            match action {
                ExpiryAction::Inactivate | ExpiryAction::AnchorInactiveAt => {
                    updates.push(PendingUpdate {
                        listing_id: listing.id,
                        action,
                        op: expiry_update(listing, action, now),
                    });
                }
                ExpiryAction::Delete => deletions.push(listing.id),
                ExpiryAction::Skip | ExpiryAction::Wait | ExpiryAction::ForeignReason => {}
            }
        }

        for chunk in updates.chunks(MAX_BATCH_WRITES) {
            self.commit_updates(account_id, chunk, report).await;
        }

        if (!updates.is_empty() || !deletions.is_empty())
            && self.reconcile_if_renewed(account_id, now, report).await
        {
            return;
        }

        for listing_id in deletions {
            match delete_listing_with_reviews(self.store.as_ref(), account_id, listing_id).await {
                Ok(reviews) => {
                    report.deleted += 1;
                    report.reviews_deleted += reviews;
                    info!(
                        account_id = %account_id,
                        listing_id = %listing_id,
                        reviews,
                        "Deleted listing after plan expiry grace window"
                    );
                }
                Err(e) => report.fail(Some(account_id), Some(listing_id), SweepStage::DeleteListing, &e),
            }
        }
    }

    /// Commit one batch; on failure retry its writes one by one so a single
    /// bad listing does not hold back the rest
    async fn commit_updates(
        &self,
        account_id: &AccountId,
        chunk: &[PendingUpdate],
        report: &mut SweepReport,
    ) {
        let ops = chunk.iter().map(|u| u.op.clone()).collect();
        match self.store.commit(ops).await {
            Ok(()) => {
                for update in chunk {
                    count_update(report, update.action);
                }
            }
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    size = chunk.len(),
                    error = %e,
                    "Listing batch failed, retrying writes individually"
                );
                for update in chunk {
                    match self.store.commit(vec![update.op.clone()]).await {
                        Ok(()) => count_update(report, update.action),
                        Err(e) => report.fail(
                            Some(account_id),
                            Some(update.listing_id),
                            SweepStage::UpdateListing,
                            &e,
                        ),
                    }
                }
            }
        }
    }

    /// An activation can land while the listings above are being written.
    /// Returns true when the account turned out to be active again.
    async fn reconcile_if_renewed(
        &self,
        account_id: &AccountId,
        now: OffsetDateTime,
        report: &mut SweepReport,
    ) -> bool {
        match self.store.plan(account_id).await {
            Ok(Some(record)) if record.is_active(now) => {
                info!(account_id = %account_id, "Plan renewed during expiry sweep, clearing markers");
                match self.reconciler.clear_expiry_markers(account_id, now).await {
                    Ok(_) => report.renewed += 1,
                    Err(e) => report.fail(Some(account_id), None, SweepStage::Renewal, &e),
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                report.fail(Some(account_id), None, SweepStage::Renewal, &e);
                true
            }
        }
    }

    async fn reconcile_renewals(&self, now: OffsetDateTime, report: &mut SweepReport) {
        let marked = match self.store.plans_with_expiry_marker().await {
            Ok(marked) => marked,
            Err(e) => {
                report.fail(None, None, SweepStage::Renewal, &e);
                return;
            }
        };
        for record in marked.iter().filter(|r| r.is_active(now)) {
            match self
                .reconciler
                .clear_expiry_markers(&record.account_id, now)
                .await
            {
                Ok(_) => report.renewed += 1,
                Err(e) => report.fail(Some(&record.account_id), None, SweepStage::Renewal, &e),
            }
        }
    }
}

/// Period over and no paid plan covering `now`
fn has_lapsed(record: &AccountPlanRecord, now: OffsetDateTime) -> bool {
    !record.is_active(now) && record.period_end.is_some_and(|end| end < now)
}

fn expiry_update(listing: &Listing, action: ExpiryAction, now: OffsetDateTime) -> WriteOp {
    let patch = match action {
        ExpiryAction::Inactivate => ListingPatch {
            status: Some(ListingStatus::Inactive),
            inactive_reason: FieldChange::Set(PLAN_EXPIRED_REASON.to_string()),
            inactive_at: if listing.inactive_at.is_none() {
                FieldChange::Set(now)
            } else {
                FieldChange::Keep
            },
            updated_at: Some(now),
        },
        _ => ListingPatch {
            inactive_at: FieldChange::Set(now),
            updated_at: Some(now),
            ..Default::default()
        },
    };
    WriteOp::UpdateListing {
        account_id: listing.account_id.clone(),
        listing_id: listing.id,
        patch,
    }
}

fn count_update(report: &mut SweepReport, action: ExpiryAction) {
    match action {
        ExpiryAction::Inactivate => report.inactivated += 1,
        ExpiryAction::AnchorInactiveAt => report.anchored += 1,
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use bulldogo_shared::PlanId;
    use time::macros::datetime;
    use time::Duration;

    fn expired_plan(account: &AccountId, end: OffsetDateTime) -> AccountPlanRecord {
        AccountPlanRecord {
            plan_id: PlanId::Hobby,
            period_start: Some(end - Duration::days(30)),
            period_end: Some(end),
            ..AccountPlanRecord::empty(account.clone())
        }
    }

    #[tokio::test]
    async fn test_active_plans_are_not_touched() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let now = datetime!(2024-01-02 00:00 UTC);
        store.insert_plan(expired_plan(&account, now + Duration::days(3))).await;
        let listing = store.insert_listing(Listing::new(account.clone())).await;

        let report = ExpiryEnforcer::new(store.clone()).sweep(now).await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(store.listing(listing).await.unwrap().status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn test_existing_expired_at_is_kept() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let end = datetime!(2024-01-01 00:00 UTC);
        let first_touch = datetime!(2023-12-31 00:00 UTC);
        let mut record = expired_plan(&account, end);
        record.expired_at = Some(first_touch);
        store.insert_plan(record).await;

        ExpiryEnforcer::new(store.clone())
            .sweep(datetime!(2024-01-02 00:00 UTC))
            .await
            .unwrap();

        let plan = store.plan_record(&account).await.unwrap();
        assert_eq!(plan.expired_at, Some(first_touch));
        assert_eq!(plan.plan_id, PlanId::None);
    }

    #[tokio::test]
    async fn test_anchors_missing_inactive_at() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let now = datetime!(2024-01-02 00:00 UTC);
        store
            .insert_plan(expired_plan(&account, datetime!(2024-01-01 00:00 UTC)))
            .await;
        let listing = store
            .insert_listing(Listing {
                status: ListingStatus::Inactive,
                inactive_reason: Some(PLAN_EXPIRED_REASON.to_string()),
                ..Listing::new(account.clone())
            })
            .await;

        let report = ExpiryEnforcer::new(store.clone()).sweep(now).await.unwrap();

        assert_eq!(report.anchored, 1);
        assert_eq!(store.listing(listing).await.unwrap().inactive_at, Some(now));
    }

    #[tokio::test]
    async fn test_failing_listing_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let now = datetime!(2024-01-02 00:00 UTC);
        store
            .insert_plan(expired_plan(&account, datetime!(2024-01-01 00:00 UTC)))
            .await;
        let bad = store.insert_listing(Listing::new(account.clone())).await;
        let good = store.insert_listing(Listing::new(account.clone())).await;
        store.fail_listing(bad).await;

        let report = ExpiryEnforcer::new(store.clone()).sweep(now).await.unwrap();

        assert_eq!(report.inactivated, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].listing_id, Some(bad));
        assert_eq!(report.failures[0].stage, SweepStage::UpdateListing);
        assert_eq!(store.listing(good).await.unwrap().status, ListingStatus::Inactive);
        assert_eq!(store.listing(bad).await.unwrap().status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn test_failing_account_does_not_stop_sweep() {
        let store = Arc::new(InMemoryStore::new());
        let now = datetime!(2024-01-02 00:00 UTC);
        let end = datetime!(2024-01-01 00:00 UTC);
        let first = AccountId::from("acc-a");
        let second = AccountId::from("acc-b");
        store.insert_plan(expired_plan(&first, end)).await;
        store.insert_plan(expired_plan(&second, end)).await;
        store.fail_operation("listings").await;

        let report = ExpiryEnforcer::new(store.clone()).sweep(now).await.unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.marked_expired, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.stage == SweepStage::LoadListings));
    }

    #[tokio::test]
    async fn test_failed_renewal_query_keeps_report() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let now = datetime!(2024-01-02 00:00 UTC);
        store
            .insert_plan(expired_plan(&account, datetime!(2024-01-01 00:00 UTC)))
            .await;
        store.insert_listing(Listing::new(account.clone())).await;
        store.fail_operation("plans_with_expiry_marker").await;

        let report = ExpiryEnforcer::new(store.clone()).sweep(now).await.unwrap();

        assert_eq!(report.marked_expired, 1);
        assert_eq!(report.inactivated, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, SweepStage::Renewal);
        assert_eq!(report.failures[0].account_id, None);
    }

    #[tokio::test]
    async fn test_expiry_write_skips_renewed_record() {
        let store = InMemoryStore::new();
        let account = AccountId::from("acc");
        let now = datetime!(2024-01-02 00:00 UTC);
        store
            .insert_plan(expired_plan(&account, now + Duration::days(30)))
            .await;

        let written = store
            .expire_plan(&account, datetime!(2024-01-01 00:00 UTC), now)
            .await
            .unwrap();

        assert!(!written);
        let plan = store.plan_record(&account).await.unwrap();
        assert_eq!(plan.plan_id, PlanId::Hobby);
        assert_eq!(plan.expired_at, None);
    }
}

