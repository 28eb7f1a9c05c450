//! Postgres plan store

use async_trait::async_trait;
use bulldogo_shared::{AccountId, ListingId, ListingStatus, OrderNumber, PaymentState, PlanId, ReviewId};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{check_batch_size, AccountStore, PlanGrant, PlanStore, PlanUpdate, WriteOp};
use crate::error::{BillingError, BillingResult};
use crate::plan_state::AccountPlanRecord;
use crate::records::{
    AccountSummary, ActivationClaim, Listing, PaymentRecord, PaymentStateUpdate,
};

const PLAN_COLUMNS: &str = "account_id, plan_id, plan_name, period_start, period_end, \
     duration_days, cancel_at, expired_at, expired_processed_at, updated_at";

const LISTING_COLUMNS: &str = "id, account_id, status, inactive_reason, inactive_at, updated_at";

const PAYMENT_COLUMNS: &str = "order_number, gateway_id, account_id, plan_id, plan_name, \
     amount_minor, currency, state, plan_activated, plan_activated_at, gateway_response, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PlanRow {
    account_id: String,
    plan_id: Option<String>,
    plan_name: Option<String>,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    duration_days: Option<i64>,
    cancel_at: Option<OffsetDateTime>,
    expired_at: Option<OffsetDateTime>,
    expired_processed_at: Option<OffsetDateTime>,
    updated_at: Option<OffsetDateTime>,
}

impl From<PlanRow> for AccountPlanRecord {
    fn from(row: PlanRow) -> Self {
        Self {
            account_id: AccountId::new(row.account_id),
            plan_id: PlanId::from_stored(row.plan_id.as_deref()),
            plan_name: row.plan_name,
            period_start: row.period_start,
            period_end: row.period_end,
            duration_days: row.duration_days,
            cancel_at: row.cancel_at,
            expired_at: row.expired_at,
            expired_processed_at: row.expired_processed_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    account_id: String,
    status: Option<String>,
    inactive_reason: Option<String>,
    inactive_at: Option<OffsetDateTime>,
    updated_at: Option<OffsetDateTime>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Self {
            id: ListingId(row.id),
            account_id: AccountId::new(row.account_id),
            status: ListingStatus::from_stored(row.status.as_deref()),
            inactive_reason: row.inactive_reason,
            inactive_at: row.inactive_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    order_number: String,
    gateway_id: Option<i64>,
    account_id: String,
    plan_id: Option<String>,
    plan_name: String,
    amount_minor: i64,
    currency: String,
    state: String,
    plan_activated: bool,
    plan_activated_at: Option<OffsetDateTime>,
    gateway_response: Option<Value>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        let plan_id = row
            .plan_id
            .as_deref()
            .and_then(|p| p.parse::<PlanId>().ok())
            .filter(PlanId::is_paid);
        Self {
            order_number: OrderNumber::new(row.order_number),
            gateway_id: row.gateway_id,
            account_id: AccountId::new(row.account_id),
            plan_id,
            plan_name: Some(row.plan_name).filter(|n| !n.is_empty()),
            amount_minor: row.amount_minor,
            currency: row.currency,
            state: PaymentState::from(row.state),
            plan_activated: row.plan_activated,
            plan_activated_at: row.plan_activated_at,
            gateway_response: row.gateway_response,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Upsert of a plan record. Each nullable column takes a value and a keep
/// flag; a false flag with a NULL value deletes the field.
fn plan_upsert<'q>(account_id: &'q AccountId, update: &'q PlanUpdate) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO account_plans (
            account_id, plan_id, plan_name, period_start, period_end, duration_days,
            cancel_at, expired_at, expired_processed_at, updated_at
        )
        VALUES ($1, $3, $4, $6, $8, $10, $12, $14, $16, $18)
        ON CONFLICT (account_id) DO UPDATE SET
            plan_id = CASE WHEN $2 THEN account_plans.plan_id ELSE EXCLUDED.plan_id END,
            plan_name = CASE WHEN $5 THEN account_plans.plan_name ELSE EXCLUDED.plan_name END,
            period_start = CASE WHEN $7 THEN account_plans.period_start ELSE EXCLUDED.period_start END,
            period_end = CASE WHEN $9 THEN account_plans.period_end ELSE EXCLUDED.period_end END,
            duration_days = CASE WHEN $11 THEN account_plans.duration_days ELSE EXCLUDED.duration_days END,
            cancel_at = CASE WHEN $13 THEN account_plans.cancel_at ELSE EXCLUDED.cancel_at END,
            expired_at = CASE WHEN $15 THEN account_plans.expired_at ELSE EXCLUDED.expired_at END,
            expired_processed_at = CASE WHEN $17 THEN account_plans.expired_processed_at ELSE EXCLUDED.expired_processed_at END,
            updated_at = COALESCE(EXCLUDED.updated_at, account_plans.updated_at)
        "#,
    )
    .bind(account_id.as_str())
    .bind(update.plan_id.is_none())
    .bind(update.plan_id.and_then(|p| p.to_stored()))
    .bind(update.plan_name.value())
    .bind(update.plan_name.is_keep())
    .bind(update.period_start.value())
    .bind(update.period_start.is_keep())
    .bind(update.period_end.value())
    .bind(update.period_end.is_keep())
    .bind(update.duration_days.value())
    .bind(update.duration_days.is_keep())
    .bind(update.cancel_at.value())
    .bind(update.cancel_at.is_keep())
    .bind(update.expired_at.value())
    .bind(update.expired_at.is_keep())
    .bind(update.expired_processed_at.value())
    .bind(update.expired_processed_at.is_keep())
    .bind(update.updated_at)
}

/// Plan store backed by Postgres
#[derive(Clone)]
pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PlanStore for PgPlanStore {
    async fn health_check(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn plan(&self, account_id: &AccountId) -> BillingResult<Option<AccountPlanRecord>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM account_plans WHERE account_id = $1",
            PLAN_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn merge_plan(&self, account_id: &AccountId, update: &PlanUpdate) -> BillingResult<()> {
        plan_upsert(account_id, update).execute(&self.pool).await?;
        Ok(())
    }

    async fn plans_ending_before(&self, now: OffsetDateTime) -> BillingResult<Vec<AccountPlanRecord>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM account_plans WHERE period_end < $1 ORDER BY account_id",
            PLAN_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn plans_with_expiry_marker(&self) -> BillingResult<Vec<AccountPlanRecord>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM account_plans WHERE expired_at IS NOT NULL ORDER BY account_id",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn listings(&self, account_id: &AccountId) -> BillingResult<Vec<Listing>> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM listings WHERE account_id = $1 ORDER BY id",
            LISTING_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn listings_with_reason(
        &self,
        account_id: &AccountId,
        reason: &str,
    ) -> BillingResult<Vec<Listing>> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM listings WHERE account_id = $1 AND inactive_reason = $2 ORDER BY id",
            LISTING_COLUMNS
        ))
        .bind(account_id.as_str())
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn review_ids(&self, listing_id: ListingId) -> BillingResult<Vec<ReviewId>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM listing_reviews WHERE listing_id = $1")
                .bind(listing_id.0)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| ReviewId(id)).collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> BillingResult<()> {
        check_batch_size(&ops)?;
        let mut tx = self.pool.begin().await?;

        for op in ops {
            match op {
                WriteOp::UpdateListing {
                    account_id,
                    listing_id,
                    patch,
                } => {
                    sqlx::query(
                        r#"
                        UPDATE listings SET
                            status = COALESCE($3, status),
                            inactive_reason = CASE WHEN $5 THEN inactive_reason ELSE $4 END,
                            inactive_at = CASE WHEN $7 THEN inactive_at ELSE $6 END,
                            updated_at = COALESCE($8, updated_at)
                        WHERE id = $1 AND account_id = $2
                        "#,
                    )
                    .bind(listing_id.0)
                    .bind(account_id.as_str())
                    .bind(patch.status.map(|s| s.as_str()))
                    .bind(patch.inactive_reason.value())
                    .bind(patch.inactive_reason.is_keep())
                    .bind(patch.inactive_at.value())
                    .bind(patch.inactive_at.is_keep())
                    .bind(patch.updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::DeleteListing {
                    account_id,
                    listing_id,
                } => {
                    sqlx::query("DELETE FROM listings WHERE id = $1 AND account_id = $2")
                        .bind(listing_id.0)
                        .bind(account_id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
                WriteOp::DeleteReview {
                    listing_id,
                    review_id,
                } => {
                    sqlx::query("DELETE FROM listing_reviews WHERE id = $1 AND listing_id = $2")
                        .bind(review_id.0)
                        .bind(listing_id.0)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn payment(&self, order_number: &OrderNumber) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE order_number = $1",
            PAYMENT_COLUMNS
        ))
        .bind(order_number.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn payment_by_gateway_id(&self, gateway_id: i64) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE gateway_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (
                order_number, gateway_id, account_id, plan_id, plan_name, amount_minor,
                currency, state, plan_activated, plan_activated_at, gateway_response,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (order_number) DO NOTHING
            "#,
        )
        .bind(payment.order_number.as_str())
        .bind(payment.gateway_id)
        .bind(payment.account_id.as_str())
        .bind(payment.plan_id.and_then(|p| p.to_stored()))
        .bind(payment.plan_name.clone().unwrap_or_default())
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment.state.as_str())
        .bind(payment.plan_activated)
        .bind(payment.plan_activated_at)
        .bind(&payment.gateway_response)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::AlreadyExists(format!(
                "payment {}",
                payment.order_number
            )));
        }
        Ok(())
    }

    async fn record_payment_state(
        &self,
        order_number: &OrderNumber,
        update: &PaymentStateUpdate,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                state = $2,
                gateway_response = COALESCE($3, gateway_response),
                updated_at = $4,
                notification_received_at = CASE WHEN $5 = 'notification' THEN $4 ELSE notification_received_at END,
                last_checked_at = CASE WHEN $5 = 'status_check' THEN $4 ELSE last_checked_at END
            WHERE order_number = $1
            "#,
        )
        .bind(order_number.as_str())
        .bind(update.state.as_str())
        .bind(&update.gateway_response)
        .bind(update.observed_at)
        .bind(update.path.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("payment {}", order_number)));
        }
        Ok(())
    }

    async fn activate_payment(
        &self,
        order_number: &OrderNumber,
        at: OffsetDateTime,
    ) -> BillingResult<ActivationClaim> {
        let mut tx = self.pool.begin().await?;

        // Concurrent deliveries queue on the row lock; the loser re-reads
        // plan_activated = TRUE and matches nothing.
        let claimed: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET plan_activated = TRUE, plan_activated_at = $2, updated_at = $2
            WHERE order_number = $1
              AND state = 'PAID'
              AND plan_activated = FALSE
              AND plan_id IS NOT NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(order_number.as_str())
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = claimed {
            let payment = PaymentRecord::from(row);
            let Some(grant) = PlanGrant::for_payment(&payment, at) else {
                tx.rollback().await?;
                return Ok(ActivationClaim::MissingPlan);
            };
            plan_upsert(&payment.account_id, &grant.update)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(ActivationClaim::Activated {
                payment,
                plan: grant.plan,
                period: grant.period,
            });
        }
        tx.rollback().await?;

        // Nothing claimed; classify why
        let Some(payment) = self.payment(order_number).await? else {
            return Ok(ActivationClaim::NotFound);
        };
        if !payment.state.is_paid() {
            return Ok(ActivationClaim::NotPaid(payment.state));
        }
        if payment.plan_activated {
            return Ok(ActivationClaim::AlreadyActivated);
        }
        Ok(ActivationClaim::MissingPlan)
    }

    async fn expire_plan(
        &self,
        account_id: &AccountId,
        expired_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE account_plans SET
                plan_id = NULL,
                cancel_at = NULL,
                expired_at = $2,
                expired_processed_at = $3
            WHERE account_id = $1 AND period_end < $3
            "#,
        )
        .bind(account_id.as_str())
        .bind(expired_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AccountStore for PgPlanStore {
    async fn accounts_inactive_since(&self, cutoff: OffsetDateTime) -> BillingResult<Vec<AccountSummary>> {
        let rows: Vec<(String, Option<String>, OffsetDateTime, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT id, email, created_at, last_sign_in_at
            FROM accounts
            WHERE COALESCE(last_sign_in_at, created_at) < $1
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, email, created_at, last_sign_in_at)| AccountSummary {
                account_id: AccountId::new(id),
                email,
                created_at,
                last_sign_in_at,
            })
            .collect())
    }

    async fn delete_plan_record(&self, account_id: &AccountId) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM account_plans WHERE account_id = $1")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_profile_reviews(&self, account_id: &AccountId) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM account_reviews WHERE reviewed_account_id = $1")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_reviews_by_author(&self, account_id: &AccountId) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;
        let profile = sqlx::query("DELETE FROM account_reviews WHERE author_account_id = $1")
            .bind(account_id.as_str())
            .execute(&mut *tx)
            .await?;
        let listing = sqlx::query("DELETE FROM listing_reviews WHERE author_account_id = $1")
            .bind(account_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(profile.rows_affected() + listing.rows_affected())
    }

    async fn delete_messages(&self, account_id: &AccountId) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE account_id = $1")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_account(&self, account_id: &AccountId) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
