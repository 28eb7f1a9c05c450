//! In-memory plan store
//!
//! Backs tests and local runs without Postgres. All state lives behind one
//! async mutex, so every trait method is atomic with respect to the others.
//! Failure injection hooks let tests exercise partial-failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bulldogo_shared::{AccountId, ListingId, OrderNumber, ReviewId};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{check_batch_size, AccountStore, PlanGrant, PlanStore, PlanUpdate, WriteOp};
use crate::error::{BillingError, BillingResult};
use crate::plan_state::AccountPlanRecord;
use crate::records::{
    AccountSummary, ActivationClaim, DeliveryPath, Listing, PaymentRecord, PaymentStateUpdate,
};

#[derive(Debug, Clone)]
struct StoredReview {
    id: ReviewId,
    listing_id: ListingId,
    author: Option<AccountId>,
}

#[derive(Debug, Clone)]
struct StoredAccountReview {
    reviewed: AccountId,
    author: Option<AccountId>,
}

#[derive(Debug, Clone)]
struct PaymentTimestamps {
    last_checked_at: Option<OffsetDateTime>,
    notification_received_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Inner {
    plans: HashMap<AccountId, AccountPlanRecord>,
    listings: BTreeMap<ListingId, Listing>,
    reviews: Vec<StoredReview>,
    account_reviews: Vec<StoredAccountReview>,
    messages: Vec<AccountId>,
    accounts: HashMap<AccountId, AccountSummary>,
    payments: HashMap<OrderNumber, PaymentRecord>,
    payment_timestamps: HashMap<OrderNumber, PaymentTimestamps>,
    plan_writes: usize,
    commit_sizes: Vec<usize>,
    failing_listings: HashSet<ListingId>,
    failing_review_listings: HashSet<ListingId>,
    failing_operations: HashSet<&'static str>,
}

impl Inner {
    fn fail_if_injected(&self, operation: &'static str) -> BillingResult<()> {
        if self.failing_operations.contains(operation) {
            return Err(BillingError::Database(format!("injected failure: {}", operation)));
        }
        Ok(())
    }
}

/// Plan store held entirely in memory
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_plan(&self, record: AccountPlanRecord) {
        let mut inner = self.inner.lock().await;
        inner.plans.insert(record.account_id.clone(), record);
    }

    pub async fn insert_listing(&self, listing: Listing) -> ListingId {
        let id = listing.id;
        self.inner.lock().await.listings.insert(id, listing);
        id
    }

    pub async fn insert_review(&self, listing_id: ListingId, author: Option<AccountId>) -> ReviewId {
        let id = ReviewId::new();
        self.inner.lock().await.reviews.push(StoredReview {
            id,
            listing_id,
            author,
        });
        id
    }

    pub async fn insert_account_review(&self, reviewed: AccountId, author: Option<AccountId>) {
        self.inner
            .lock()
            .await
            .account_reviews
            .push(StoredAccountReview { reviewed, author });
    }

    pub async fn insert_message(&self, account_id: AccountId) {
        self.inner.lock().await.messages.push(account_id);
    }

    pub async fn add_account(&self, account: AccountSummary) {
        let mut inner = self.inner.lock().await;
        inner.accounts.insert(account.account_id.clone(), account);
    }

    pub async fn plan_record(&self, account_id: &AccountId) -> Option<AccountPlanRecord> {
        self.inner.lock().await.plans.get(account_id).cloned()
    }

    pub async fn listing(&self, id: ListingId) -> Option<Listing> {
        self.inner.lock().await.listings.get(&id).cloned()
    }

    pub async fn review_count(&self, listing_id: ListingId) -> usize {
        self.inner
            .lock()
            .await
            .reviews
            .iter()
            .filter(|r| r.listing_id == listing_id)
            .count()
    }

    pub async fn account_review_count(&self, account_id: &AccountId) -> usize {
        self.inner
            .lock()
            .await
            .account_reviews
            .iter()
            .filter(|r| &r.reviewed == account_id || r.author.as_ref() == Some(account_id))
            .count()
    }

    pub async fn message_count(&self, account_id: &AccountId) -> usize {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| *m == account_id)
            .count()
    }

    pub async fn has_account(&self, account_id: &AccountId) -> bool {
        self.inner.lock().await.accounts.contains_key(account_id)
    }

    pub async fn payment_record(&self, order_number: &OrderNumber) -> Option<PaymentRecord> {
        self.inner.lock().await.payments.get(order_number).cloned()
    }

    /// `(last_checked_at, notification_received_at)` of a payment
    pub async fn payment_delivery_times(
        &self,
        order_number: &OrderNumber,
    ) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        self.inner
            .lock()
            .await
            .payment_timestamps
            .get(order_number)
            .map(|t| (t.last_checked_at, t.notification_received_at))
            .unwrap_or((None, None))
    }

    /// Number of plan merges performed
    pub async fn plan_writes(&self) -> usize {
        self.inner.lock().await.plan_writes
    }

    /// Size of every successful commit, in order
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.inner.lock().await.commit_sizes.clone()
    }

    /// Make every commit touching this listing fail
    pub async fn fail_listing(&self, id: ListingId) {
        self.inner.lock().await.failing_listings.insert(id);
    }

    /// Make review deletions of this listing fail
    pub async fn fail_review_deletion(&self, listing_id: ListingId) {
        self.inner.lock().await.failing_review_listings.insert(listing_id);
    }

    /// Make a named store operation fail (e.g. `"merge_plan"`, `"delete_messages"`)
    pub async fn fail_operation(&self, operation: &'static str) {
        self.inner.lock().await.failing_operations.insert(operation);
    }

    pub async fn clear_failures(&self) {
        let mut inner = self.inner.lock().await;
        inner.failing_listings.clear();
        inner.failing_review_listings.clear();
        inner.failing_operations.clear();
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn health_check(&self) -> BillingResult<()> {
        self.inner.lock().await.fail_if_injected("health_check")
    }

    async fn plan(&self, account_id: &AccountId) -> BillingResult<Option<AccountPlanRecord>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("plan")?;
        Ok(inner.plans.get(account_id).cloned())
    }

    async fn merge_plan(&self, account_id: &AccountId, update: &PlanUpdate) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("merge_plan")?;
        let record = inner
            .plans
            .entry(account_id.clone())
            .or_insert_with(|| AccountPlanRecord::empty(account_id.clone()));
        update.apply_to(record);
        inner.plan_writes += 1;
        Ok(())
    }

    async fn plans_ending_before(&self, now: OffsetDateTime) -> BillingResult<Vec<AccountPlanRecord>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("plans_ending_before")?;
        let mut plans: Vec<_> = inner
            .plans
            .values()
            .filter(|p| p.period_end.is_some_and(|end| end < now))
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(plans)
    }

    async fn plans_with_expiry_marker(&self) -> BillingResult<Vec<AccountPlanRecord>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("plans_with_expiry_marker")?;
        let mut plans: Vec<_> = inner
            .plans
            .values()
            .filter(|p| p.expired_at.is_some())
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(plans)
    }

    async fn listings(&self, account_id: &AccountId) -> BillingResult<Vec<Listing>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("listings")?;
        Ok(inner
            .listings
            .values()
            .filter(|l| &l.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn listings_with_reason(
        &self,
        account_id: &AccountId,
        reason: &str,
    ) -> BillingResult<Vec<Listing>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("listings_with_reason")?;
        Ok(inner
            .listings
            .values()
            .filter(|l| &l.account_id == account_id && l.inactive_reason.as_deref() == Some(reason))
            .cloned()
            .collect())
    }

    async fn review_ids(&self, listing_id: ListingId) -> BillingResult<Vec<ReviewId>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("review_ids")?;
        Ok(inner
            .reviews
            .iter()
            .filter(|r| r.listing_id == listing_id)
            .map(|r| r.id)
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> BillingResult<()> {
        check_batch_size(&ops)?;
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("commit")?;

        // Validate the whole batch before touching anything
        for op in &ops {
            let failing = match op {
                WriteOp::UpdateListing { listing_id, .. } | WriteOp::DeleteListing { listing_id, .. } => {
                    inner.failing_listings.contains(listing_id)
                }
                WriteOp::DeleteReview { listing_id, .. } => {
                    inner.failing_review_listings.contains(listing_id)
                }
            };
            if failing {
                return Err(BillingError::Database("injected commit failure".to_string()));
            }
        }

        let size = ops.len();
        for op in ops {
            match op {
                WriteOp::UpdateListing {
                    listing_id, patch, ..
                } => {
                    if let Some(listing) = inner.listings.get_mut(&listing_id) {
                        patch.apply_to(listing);
                    }
                }
                WriteOp::DeleteListing { listing_id, .. } => {
                    inner.listings.remove(&listing_id);
                }
                WriteOp::DeleteReview { review_id, .. } => {
                    inner.reviews.retain(|r| r.id != review_id);
                }
            }
        }
        inner.commit_sizes.push(size);
        Ok(())
    }

    async fn payment(&self, order_number: &OrderNumber) -> BillingResult<Option<PaymentRecord>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("payment")?;
        Ok(inner.payments.get(order_number).cloned())
    }

    async fn payment_by_gateway_id(&self, gateway_id: i64) -> BillingResult<Option<PaymentRecord>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("payment_by_gateway_id")?;
        Ok(inner
            .payments
            .values()
            .find(|p| p.gateway_id == Some(gateway_id))
            .cloned())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("insert_payment")?;
        if inner.payments.contains_key(&payment.order_number) {
            return Err(BillingError::AlreadyExists(format!(
                "payment {}",
                payment.order_number
            )));
        }
        inner
            .payments
            .insert(payment.order_number.clone(), payment.clone());
        Ok(())
    }

    async fn record_payment_state(
        &self,
        order_number: &OrderNumber,
        update: &PaymentStateUpdate,
    ) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("record_payment_state")?;
        let payment = inner
            .payments
            .get_mut(order_number)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", order_number)))?;
        payment.state = update.state.clone();
        if update.gateway_response.is_some() {
            payment.gateway_response = update.gateway_response.clone();
        }
        payment.updated_at = update.observed_at;

        let times = inner
            .payment_timestamps
            .entry(order_number.clone())
            .or_insert(PaymentTimestamps {
                last_checked_at: None,
                notification_received_at: None,
            });
        match update.path {
            DeliveryPath::Notification => times.notification_received_at = Some(update.observed_at),
            DeliveryPath::StatusCheck => times.last_checked_at = Some(update.observed_at),
            DeliveryPath::Redirect => {}
        }
        Ok(())
    }

    async fn activate_payment(
        &self,
        order_number: &OrderNumber,
        at: OffsetDateTime,
    ) -> BillingResult<ActivationClaim> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("activate_payment")?;
        let Some(payment) = inner.payments.get(order_number) else {
            return Ok(ActivationClaim::NotFound);
        };
        if !payment.state.is_paid() {
            return Ok(ActivationClaim::NotPaid(payment.state.clone()));
        }
        if payment.plan_activated {
            return Ok(ActivationClaim::AlreadyActivated);
        }
        let Some(grant) = PlanGrant::for_payment(payment, at) else {
            return Ok(ActivationClaim::MissingPlan);
        };
        let account_id = payment.account_id.clone();

        let record = inner
            .plans
            .entry(account_id.clone())
            .or_insert_with(|| AccountPlanRecord::empty(account_id));
        grant.update.apply_to(record);
        inner.plan_writes += 1;

        let Some(payment) = inner.payments.get_mut(order_number) else {
            return Ok(ActivationClaim::NotFound);
        };
        payment.plan_activated = true;
        payment.plan_activated_at = Some(at);
        payment.updated_at = at;

        Ok(ActivationClaim::Activated {
            payment: payment.clone(),
            plan: grant.plan,
            period: grant.period,
        })
    }

    async fn expire_plan(
        &self,
        account_id: &AccountId,
        expired_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("expire_plan")?;
        let Some(record) = inner.plans.get_mut(account_id) else {
            return Ok(false);
        };
        if !record.period_end.is_some_and(|end| end < now) {
            return Ok(false);
        }
        PlanUpdate::expire(expired_at, now).apply_to(record);
        inner.plan_writes += 1;
        Ok(true)
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn accounts_inactive_since(&self, cutoff: OffsetDateTime) -> BillingResult<Vec<AccountSummary>> {
        let inner = self.inner.lock().await;
        inner.fail_if_injected("accounts_inactive_since")?;
        let mut accounts: Vec<_> = inner
            .accounts
            .values()
            .filter(|a| a.last_activity() < cutoff)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(accounts)
    }

    async fn delete_plan_record(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete_plan_record")?;
        Ok(inner.plans.remove(account_id).map(|_| 1).unwrap_or(0))
    }

    async fn delete_profile_reviews(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete_profile_reviews")?;
        let before = inner.account_reviews.len();
        inner.account_reviews.retain(|r| &r.reviewed != account_id);
        Ok((before - inner.account_reviews.len()) as u64)
    }

    async fn delete_reviews_by_author(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete_reviews_by_author")?;
        let before = inner.account_reviews.len() + inner.reviews.len();
        inner
            .account_reviews
            .retain(|r| r.author.as_ref() != Some(account_id));
        inner.reviews.retain(|r| r.author.as_ref() != Some(account_id));
        Ok((before - inner.account_reviews.len() - inner.reviews.len()) as u64)
    }

    async fn delete_messages(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete_messages")?;
        let before = inner.messages.len();
        inner.messages.retain(|m| m != account_id);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn delete_account(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete_account")?;
        Ok(inner.accounts.remove(account_id).map(|_| 1).unwrap_or(0))
    }
}
