//! Plan management for account owners: view, cancel at period end, undo.

use std::sync::Arc;

use bulldogo_shared::AccountId;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{BillingError, BillingResult};
use crate::plan_state::PlanView;
use crate::store::{FieldChange, PlanStore, PlanUpdate};

/// Plan Service
pub struct PlanService {
    store: Arc<dyn PlanStore>,
}

impl PlanService {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self { store }
    }

    /// Current plan as shown to the account owner
    pub async fn view(&self, account_id: &AccountId, now: OffsetDateTime) -> BillingResult<PlanView> {
        let record = self.store.plan(account_id).await?;
        Ok(PlanView::from_record(record.as_ref(), now))
    }

    /// Schedule cancellation at the end of the paid period
    pub async fn schedule_cancel(
        &self,
        account_id: &AccountId,
        now: OffsetDateTime,
    ) -> BillingResult<PlanView> {
        let record = self
            .store
            .plan(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No plan for account {}", account_id)))?;

        let period_end = record.period_end.ok_or_else(|| {
            BillingError::InvalidInput("Plan has no period end to cancel at".to_string())
        })?;

        let update = PlanUpdate {
            cancel_at: FieldChange::Set(period_end),
            updated_at: Some(now),
            ..Default::default()
        };
        self.store.merge_plan(account_id, &update).await?;

        info!(account_id = %account_id, cancel_at = %period_end, "Plan cancellation scheduled");
        self.view(account_id, now).await
    }

    /// Withdraw a scheduled cancellation
    pub async fn undo_cancel(&self, account_id: &AccountId, now: OffsetDateTime) -> BillingResult<PlanView> {
        if self.store.plan(account_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "No plan for account {}",
                account_id
            )));
        }

        let update = PlanUpdate {
            cancel_at: FieldChange::Clear,
            updated_at: Some(now),
            ..Default::default()
        };
        self.store.merge_plan(account_id, &update).await?;

        info!(account_id = %account_id, "Plan cancellation withdrawn");
        self.view(account_id, now).await
    }
}
