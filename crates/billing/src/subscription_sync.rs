//! Provider Subscription Sync
//!
//! Writes a recurring-billing subscription, as re-fetched from Stripe, into
//! the account's plan record. Active subscriptions renew the plan and clear
//! expiry markers; any other status ends the plan and leaves the listings to
//! the expiry enforcer.

use std::collections::HashMap;
use std::sync::Arc;

use bulldogo_shared::{normalize_timestamp, AccountId, PlanId};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::plan_state::PlanPeriod;
use crate::renewal::RenewalReconciler;
use crate::store::{FieldChange, PlanStore, PlanUpdate};

/// Metadata keys that may carry the account id
const ACCOUNT_METADATA_KEYS: [&str; 3] = ["firebaseUID", "account_id", "user_id"];

/// Provider-side subscription, normalized at ingress
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub id: String,
    pub account_id: Option<AccountId>,
    /// `active` or `trialing`
    pub active: bool,
    pub status: String,
    pub price_ids: Vec<String>,
    /// Plan named in subscription metadata (`plan`)
    pub metadata_plan: Option<String>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub cancel_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl ProviderSubscription {
    pub fn from_stripe(sub: &stripe::Subscription) -> BillingResult<Self> {
        let active = matches!(
            sub.status,
            stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing
        );

        let price_ids = sub
            .items
            .data
            .iter()
            .filter_map(|item| item.price.as_ref().map(|p| p.id.as_str().to_string()))
            .collect();

        Ok(Self {
            id: sub.id.as_str().to_string(),
            account_id: account_from_metadata(&sub.metadata),
            active,
            status: sub.status.as_str().to_string(),
            price_ids,
            metadata_plan: sub.metadata.get("plan").cloned(),
            period_start: unix_timestamp(sub.current_period_start)?,
            period_end: unix_timestamp(sub.current_period_end)?,
            cancel_at: sub.cancel_at.map(unix_timestamp).transpose()?,
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }

    /// Cancellation intent: explicit `cancel_at`, else the period end when
    /// cancelling at period end
    pub fn cancellation(&self) -> Option<OffsetDateTime> {
        self.cancel_at
            .or(self.cancel_at_period_end.then_some(self.period_end))
    }
}

fn account_from_metadata(metadata: &HashMap<String, String>) -> Option<AccountId> {
    ACCOUNT_METADATA_KEYS
        .iter()
        .find_map(|key| metadata.get(*key))
        .filter(|v| !v.is_empty())
        .map(|v| AccountId::new(v.clone()))
}

fn unix_timestamp(seconds: i64) -> BillingResult<OffsetDateTime> {
    normalize_timestamp(&Value::from(seconds))?
        .ok_or_else(|| BillingError::InvalidInput("Missing subscription timestamp".to_string()))
}

/// What a sync did
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Plan written from an active subscription
    Renewed { account_id: AccountId, plan: PlanId },
    /// Subscription is no longer active; plan ended
    Ended { account_id: AccountId },
    /// No account id in the subscription metadata
    UnknownAccount,
    /// Active subscription whose price maps to no plan
    UnknownPlan { account_id: AccountId },
}

/// Subscription Sync
pub struct SubscriptionSync {
    store: Arc<dyn PlanStore>,
    reconciler: RenewalReconciler,
    config: StripeConfig,
}

impl SubscriptionSync {
    pub fn new(store: Arc<dyn PlanStore>, config: StripeConfig) -> Self {
        let reconciler = RenewalReconciler::new(store.clone());
        Self {
            store,
            reconciler,
            config,
        }
    }

    fn plan_for(&self, sub: &ProviderSubscription) -> Option<PlanId> {
        sub.price_ids
            .iter()
            .find_map(|price| self.config.plan_for_price_id(price))
            .or_else(|| {
                sub.metadata_plan
                    .as_deref()
                    .and_then(|p| p.parse::<PlanId>().ok())
                    .filter(PlanId::is_paid)
            })
    }

    /// Write a subscription into the plan record
    pub async fn apply(&self, sub: &ProviderSubscription, now: OffsetDateTime) -> BillingResult<SyncOutcome> {
        let Some(account_id) = sub.account_id.clone() else {
            warn!(subscription_id = %sub.id, "Subscription has no account id in metadata");
            return Ok(SyncOutcome::UnknownAccount);
        };

        if !sub.active {
            // End the period now at the latest so the next sweep picks it up
            let period_end = sub.period_end.min(now);
            let update = PlanUpdate {
                plan_id: Some(PlanId::None),
                period_end: FieldChange::Set(period_end),
                cancel_at: FieldChange::Clear,
                updated_at: Some(now),
                ..Default::default()
            };
            self.store.merge_plan(&account_id, &update).await?;
            info!(
                account_id = %account_id,
                subscription_id = %sub.id,
                status = %sub.status,
                "Subscription no longer active, plan ended"
            );
            return Ok(SyncOutcome::Ended { account_id });
        }

        let Some(plan) = self.plan_for(sub) else {
            warn!(
                account_id = %account_id,
                subscription_id = %sub.id,
                price_ids = ?sub.price_ids,
                "Subscription price maps to no plan"
            );
            return Ok(SyncOutcome::UnknownPlan { account_id });
        };

        let period = PlanPeriod::between(sub.period_start, sub.period_end);
        let mut update = PlanUpdate::activate(plan, plan.label().to_string(), period, now);
        if let Some(cancel_at) = sub.cancellation() {
            update.cancel_at = FieldChange::Set(cancel_at);
        }
        self.store.merge_plan(&account_id, &update).await?;

        if let Err(e) = self.reconciler.clear_expiry_markers(&account_id, now).await {
            warn!(account_id = %account_id, error = %e, "Failed to clear expiry markers after renewal");
        }

        info!(
            account_id = %account_id,
            subscription_id = %sub.id,
            plan = %plan,
            period_end = %period.end,
            "Plan synced from subscription"
        );
        Ok(SyncOutcome::Renewed { account_id, plan })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::PriceIds;
    use crate::plan_state::AccountPlanRecord;
    use crate::records::Listing;
    use crate::store::InMemoryStore;
    use bulldogo_shared::{ListingStatus, PLAN_EXPIRED_REASON};
    use time::macros::datetime;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                hobby: Some("price_hobby".to_string()),
                business: Some("price_business".to_string()),
            },
        }
    }

    fn subscription(active: bool) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_1".to_string(),
            account_id: Some(AccountId::from("acc")),
            active,
            status: if active { "active" } else { "canceled" }.to_string(),
            price_ids: vec!["price_business".to_string()],
            metadata_plan: None,
            period_start: datetime!(2024-02-01 00:00 UTC),
            period_end: datetime!(2024-03-01 00:00 UTC),
            cancel_at: None,
            cancel_at_period_end: false,
        }
    }

    #[test]
    fn test_cancellation_from_period_end_flag() {
        let mut sub = subscription(true);
        assert_eq!(sub.cancellation(), None);
        sub.cancel_at_period_end = true;
        assert_eq!(sub.cancellation(), Some(sub.period_end));
    }

    #[test]
    fn test_account_from_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("firebaseUID".to_string(), "uid-1".to_string());
        assert_eq!(account_from_metadata(&metadata), Some(AccountId::from("uid-1")));
        assert_eq!(account_from_metadata(&HashMap::new()), None);
    }

    #[tokio::test]
    async fn test_active_subscription_renews_and_clears_markers() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::from("acc");
        let at = datetime!(2024-01-01 00:00 UTC);
        store
            .insert_plan(AccountPlanRecord {
                period_end: Some(at),
                expired_at: Some(at),
                expired_processed_at: Some(at),
                ..AccountPlanRecord::empty(account.clone())
            })
            .await;
        let listing = store
            .insert_listing(Listing {
                status: ListingStatus::Inactive,
                inactive_reason: Some(PLAN_EXPIRED_REASON.to_string()),
                inactive_at: Some(at),
                ..Listing::new(account.clone())
            })
            .await;
        let sync = SubscriptionSync::new(store.clone(), config());

        let outcome = sync
            .apply(&subscription(true), datetime!(2024-02-01 00:05 UTC))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Renewed {
                account_id: account.clone(),
                plan: PlanId::Business
            }
        );
        let plan = store.plan_record(&account).await.unwrap();
        assert_eq!(plan.plan_id, PlanId::Business);
        assert_eq!(plan.period_end, Some(datetime!(2024-03-01 00:00 UTC)));
        assert_eq!(plan.duration_days, Some(29));
        assert_eq!(plan.expired_at, None);
        assert_eq!(store.listing(listing).await.unwrap().inactive_reason, None);
    }

    #[tokio::test]
    async fn test_canceled_subscription_ends_plan() {
        let store = Arc::new(InMemoryStore::new());
        let sync = SubscriptionSync::new(store.clone(), config());
        let now = datetime!(2024-02-10 00:00 UTC);

        let outcome = sync.apply(&subscription(false), now).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Ended { .. }));
        let plan = store.plan_record(&AccountId::from("acc")).await.unwrap();
        assert_eq!(plan.plan_id, PlanId::None);
        assert_eq!(plan.period_end, Some(now));
    }

    #[tokio::test]
    async fn test_unknown_price_falls_back_to_metadata_plan() {
        let store = Arc::new(InMemoryStore::new());
        let sync = SubscriptionSync::new(store.clone(), config());
        let mut sub = subscription(true);
        sub.price_ids = vec!["price_legacy".to_string()];
        sub.metadata_plan = Some("hobby".to_string());

        let outcome = sync.apply(&sub, datetime!(2024-02-01 00:00 UTC)).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Renewed { plan: PlanId::Hobby, .. }));

        sub.metadata_plan = None;
        let outcome = sync.apply(&sub, datetime!(2024-02-01 00:00 UTC)).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::UnknownPlan { .. }));
    }
}
