//! Plan Store
//!
//! Storage boundary of the plan lifecycle. Everything the enforcer, the
//! reconciler and the payment bridge persist goes through [`PlanStore`];
//! the account purge additionally needs [`AccountStore`].
//!
//! Two backends exist: [`PgPlanStore`] for production and [`InMemoryStore`]
//! for tests and local runs.
//!
//! ## Batching
//! Multi-document writes are committed through [`PlanStore::commit`], which is
//! atomic and refuses batches larger than [`MAX_BATCH_WRITES`]. Callers use
//! [`BatchWriter`] to split work into sequential commits.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgPlanStore;

use async_trait::async_trait;
use bulldogo_shared::{AccountId, ListingId, ListingStatus, OrderNumber, PlanId, ReviewId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plan_state::{AccountPlanRecord, PlanPeriod};
use crate::records::{
    AccountSummary, ActivationClaim, Listing, PaymentRecord, PaymentStateUpdate,
};

/// Maximum number of writes in a single commit
pub const MAX_BATCH_WRITES: usize = 450;

/// Change to one nullable field in a merge update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange<T> {
    /// Leave the stored value untouched
    Keep,
    Set(T),
    /// Delete the field
    Clear,
}

impl<T> Default for FieldChange<T> {
    fn default() -> Self {
        FieldChange::Keep
    }
}

impl<T: Clone> FieldChange<T> {
    pub fn apply(&self, current: &mut Option<T>) {
        match self {
            FieldChange::Keep => {}
            FieldChange::Set(value) => *current = Some(value.clone()),
            FieldChange::Clear => *current = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldChange::Keep)
    }

    /// Value to bind for a SQL merge; `None` both for `Keep` and `Clear`
    pub fn value(&self) -> Option<T> {
        match self {
            FieldChange::Set(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Merge update of an account plan record (upsert, untouched fields kept)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanUpdate {
    pub plan_id: Option<PlanId>,
    pub plan_name: FieldChange<String>,
    pub period_start: FieldChange<OffsetDateTime>,
    pub period_end: FieldChange<OffsetDateTime>,
    pub duration_days: FieldChange<i64>,
    pub cancel_at: FieldChange<OffsetDateTime>,
    pub expired_at: FieldChange<OffsetDateTime>,
    pub expired_processed_at: FieldChange<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

impl PlanUpdate {
    /// New paid period from an activation; clears any scheduled cancellation
    pub fn activate(plan: PlanId, plan_name: String, period: PlanPeriod, now: OffsetDateTime) -> Self {
        Self {
            plan_id: Some(plan),
            plan_name: FieldChange::Set(plan_name),
            period_start: FieldChange::Set(period.start),
            period_end: FieldChange::Set(period.end),
            duration_days: FieldChange::Set(period.duration_days),
            cancel_at: FieldChange::Clear,
            updated_at: Some(now),
            ..Default::default()
        }
    }

    /// Expiry marking written by the enforcer
    pub fn expire(expired_at: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            plan_id: Some(PlanId::None),
            cancel_at: FieldChange::Clear,
            expired_at: FieldChange::Set(expired_at),
            expired_processed_at: FieldChange::Set(now),
            ..Default::default()
        }
    }

    /// Field deletion of both expiry markers
    pub fn clear_expiry_markers() -> Self {
        Self {
            expired_at: FieldChange::Clear,
            expired_processed_at: FieldChange::Clear,
            ..Default::default()
        }
    }

    pub fn apply_to(&self, record: &mut AccountPlanRecord) {
        if let Some(plan) = self.plan_id {
            record.plan_id = plan;
        }
        self.plan_name.apply(&mut record.plan_name);
        self.period_start.apply(&mut record.period_start);
        self.period_end.apply(&mut record.period_end);
        self.duration_days.apply(&mut record.duration_days);
        self.cancel_at.apply(&mut record.cancel_at);
        self.expired_at.apply(&mut record.expired_at);
        self.expired_processed_at.apply(&mut record.expired_processed_at);
        if let Some(at) = self.updated_at {
            record.updated_at = Some(at);
        }
    }
}

/// Plan write granted by a paid order
#[derive(Debug, Clone, PartialEq)]
pub struct PlanGrant {
    pub plan: PlanId,
    pub period: PlanPeriod,
    pub update: PlanUpdate,
}

impl PlanGrant {
    /// 30-day period from `at`; `None` when the payment names no paid plan
    pub fn for_payment(payment: &PaymentRecord, at: OffsetDateTime) -> Option<Self> {
        let plan = payment.plan_id.filter(PlanId::is_paid)?;
        let period = PlanPeriod::starting_at(at);
        let plan_name = payment
            .plan_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| plan.label().to_string());
        Some(Self {
            plan,
            period,
            update: PlanUpdate::activate(plan, plan_name, period, at),
        })
    }
}

/// Partial update of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPatch {
    pub status: Option<ListingStatus>,
    pub inactive_reason: FieldChange<String>,
    pub inactive_at: FieldChange<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

impl ListingPatch {
    pub fn apply_to(&self, listing: &mut Listing) {
        if let Some(status) = self.status {
            listing.status = status;
        }
        self.inactive_reason.apply(&mut listing.inactive_reason);
        self.inactive_at.apply(&mut listing.inactive_at);
        if let Some(at) = self.updated_at {
            listing.updated_at = Some(at);
        }
    }
}

/// One write inside a batch commit
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpdateListing {
        account_id: AccountId,
        listing_id: ListingId,
        patch: ListingPatch,
    },
    DeleteListing {
        account_id: AccountId,
        listing_id: ListingId,
    },
    DeleteReview {
        listing_id: ListingId,
        review_id: ReviewId,
    },
}

/// Persistence used by the plan lifecycle
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn health_check(&self) -> BillingResult<()>;

    async fn plan(&self, account_id: &AccountId) -> BillingResult<Option<AccountPlanRecord>>;

    /// Upsert a plan record, keeping every field the update does not touch
    async fn merge_plan(&self, account_id: &AccountId, update: &PlanUpdate) -> BillingResult<()>;

    /// Plan records whose period ended strictly before `now`
    async fn plans_ending_before(&self, now: OffsetDateTime) -> BillingResult<Vec<AccountPlanRecord>>;

    /// Plan records carrying an `expired_at` marker
    async fn plans_with_expiry_marker(&self) -> BillingResult<Vec<AccountPlanRecord>>;

    async fn listings(&self, account_id: &AccountId) -> BillingResult<Vec<Listing>>;

    async fn listings_with_reason(
        &self,
        account_id: &AccountId,
        reason: &str,
    ) -> BillingResult<Vec<Listing>>;

    async fn review_ids(&self, listing_id: ListingId) -> BillingResult<Vec<ReviewId>>;

    /// Apply all writes atomically. Fails with `BatchTooLarge` above the cap.
    async fn commit(&self, ops: Vec<WriteOp>) -> BillingResult<()>;

    async fn payment(&self, order_number: &OrderNumber) -> BillingResult<Option<PaymentRecord>>;

    async fn payment_by_gateway_id(&self, gateway_id: i64) -> BillingResult<Option<PaymentRecord>>;

    /// Fails with `AlreadyExists` when the order number is taken
    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()>;

    /// Record a state observed on the gateway. Fails with `NotFound`.
    async fn record_payment_state(
        &self,
        order_number: &OrderNumber,
        update: &PaymentStateUpdate,
    ) -> BillingResult<()>;

    /// Flip `plan_activated` false → true for a paid payment and write the
    /// granted plan in the same atomic step. Either both land or neither.
    async fn activate_payment(
        &self,
        order_number: &OrderNumber,
        at: OffsetDateTime,
    ) -> BillingResult<ActivationClaim>;

    /// Write the expiry marking only while the period is still over at `now`.
    /// Returns `false` when the record was renewed since it was read.
    async fn expire_plan(
        &self,
        account_id: &AccountId,
        expired_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Account-wide deletions used by the inactive account purge
#[async_trait]
pub trait AccountStore: PlanStore {
    /// Accounts whose last activity is strictly before `cutoff`
    async fn accounts_inactive_since(&self, cutoff: OffsetDateTime) -> BillingResult<Vec<AccountSummary>>;

    async fn delete_plan_record(&self, account_id: &AccountId) -> BillingResult<u64>;

    /// Reviews written about the account profile
    async fn delete_profile_reviews(&self, account_id: &AccountId) -> BillingResult<u64>;

    /// Reviews the account wrote, on listings and on profiles
    async fn delete_reviews_by_author(&self, account_id: &AccountId) -> BillingResult<u64>;

    async fn delete_messages(&self, account_id: &AccountId) -> BillingResult<u64>;

    async fn delete_account(&self, account_id: &AccountId) -> BillingResult<u64>;
}

/// Splits writes into sequential commits of at most [`MAX_BATCH_WRITES`]
pub struct BatchWriter<'a, S: PlanStore + ?Sized> {
    store: &'a S,
    pending: Vec<WriteOp>,
    committed: usize,
}

impl<'a, S: PlanStore + ?Sized> BatchWriter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            pending: Vec::new(),
            committed: 0,
        }
    }

    /// Queue a write; commits the pending batch once it is full
    pub async fn push(&mut self, op: WriteOp) -> BillingResult<()> {
        self.pending.push(op);
        if self.pending.len() >= MAX_BATCH_WRITES {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commit whatever is pending. A failed batch is dropped.
    pub async fn flush(&mut self) -> BillingResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let size = batch.len();
        self.store.commit(batch).await?;
        self.committed += size;
        Ok(())
    }

    /// Writes committed so far
    pub fn committed(&self) -> usize {
        self.committed
    }
}

/// Hard-delete a listing: reviews first, then the listing itself.
///
/// If any review batch fails the listing is left in place so a later pass
/// can retry. Returns the number of reviews deleted.
pub async fn delete_listing_with_reviews<S: PlanStore + ?Sized>(
    store: &S,
    account_id: &AccountId,
    listing_id: ListingId,
) -> BillingResult<usize> {
    let review_ids = store.review_ids(listing_id).await?;
    let review_count = review_ids.len();

    let mut writer = BatchWriter::new(store);
    for review_id in review_ids {
        writer
            .push(WriteOp::DeleteReview {
                listing_id,
                review_id,
            })
            .await?;
    }
    writer.flush().await?;

    store
        .commit(vec![WriteOp::DeleteListing {
            account_id: account_id.clone(),
            listing_id,
        }])
        .await?;

    Ok(review_count)
}

pub(crate) fn check_batch_size(ops: &[WriteOp]) -> BillingResult<()> {
    if ops.len() > MAX_BATCH_WRITES {
        return Err(BillingError::BatchTooLarge {
            size: ops.len(),
            limit: MAX_BATCH_WRITES,
        });
    }
    Ok(())
}
