//! Renewal Reconciler
//!
//! Undoes expiry enforcement once an account is active again: removes the
//! plan record's expiry markers and the `plan_expired` tag from its listings.
//! Listing status is left as is; owners re-publish themselves.

use std::sync::Arc;

use bulldogo_shared::{AccountId, PLAN_EXPIRED_REASON};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{BatchWriter, FieldChange, ListingPatch, PlanStore, PlanUpdate, WriteOp};

/// Outcome of clearing one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalResult {
    pub listings_cleared: usize,
}

/// Renewal Reconciler
pub struct RenewalReconciler {
    store: Arc<dyn PlanStore>,
}

impl RenewalReconciler {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self { store }
    }

    /// Clear expiry markers of an account and its plan-expired listings
    pub async fn clear_expiry_markers(
        &self,
        account_id: &AccountId,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalResult> {
        self.store
            .merge_plan(account_id, &PlanUpdate::clear_expiry_markers())
            .await?;

        let listings = self
            .store
            .listings_with_reason(account_id, PLAN_EXPIRED_REASON)
            .await?;

        let mut writer = BatchWriter::new(self.store.as_ref());
        for listing in &listings {
            writer
                .push(WriteOp::UpdateListing {
                    account_id: account_id.clone(),
                    listing_id: listing.id,
                    patch: ListingPatch {
                        status: None,
                        inactive_reason: FieldChange::Clear,
                        inactive_at: FieldChange::Clear,
                        updated_at: Some(now),
                    },
                })
                .await?;
        }
        writer.flush().await?;

        if !listings.is_empty() {
            tracing::info!(
                account_id = %account_id,
                listings = listings.len(),
                "Cleared plan expiry markers"
            );
        }

        Ok(RenewalResult {
            listings_cleared: writer.committed(),
        })
    }
}
