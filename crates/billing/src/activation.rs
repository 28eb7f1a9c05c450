//! Payment Bridge
//!
//! Turns a gateway confirmation into a plan activation, exactly once per
//! order. The three delivery paths (gateway notification, client status
//! check, browser redirect) all converge on [`PaymentBridge::apply_gateway_status`].
//!
//! ## Idempotency
//! The `plan_activated` flag of the payment is claimed and the plan written
//! in one atomic store operation. Concurrent deliveries of the same order
//! race on that claim; exactly one wins. A failed or interrupted activation
//! leaves the order unclaimed, so a later delivery retries.
//!
//! A gateway payment is only applied to the order it belongs to.

use std::sync::Arc;

use bulldogo_shared::{AccountId, OrderNumber, PaymentState, PlanId};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::error::{BillingError, BillingResult};
use crate::gopay::GatewayPayment;
use crate::plan_state::PlanPeriod;
use crate::records::{
    ActivationClaim, DeliveryPath, PaymentRecord, PaymentStateUpdate, DEFAULT_CURRENCY,
};
use crate::renewal::RenewalReconciler;
use crate::store::PlanStore;

/// Result of an activation attempt. None of these are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Activated {
        account_id: AccountId,
        plan: PlanId,
        period: PlanPeriod,
    },
    /// No payment with this order number
    NotFound,
    /// Payment exists but is not paid yet
    NotYetConfirmed(PaymentState),
    /// A previous delivery already activated the plan
    AlreadyProcessed,
    /// Paid, but no plan to activate
    MissingPlan,
    /// The gateway payment belongs to a different order
    OrderMismatch,
}

impl ActivationOutcome {
    pub fn is_activated(&self) -> bool {
        matches!(self, ActivationOutcome::Activated { .. })
    }
}

/// Outcome of a gateway delivery that is matched by gateway payment id
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    /// Order matched to the gateway payment, if any
    pub order_number: Option<OrderNumber>,
    pub state: PaymentState,
    pub outcome: ActivationOutcome,
}

/// Data of a payment just created on the gateway
#[derive(Debug, Clone)]
pub struct CheckoutRecord {
    pub order_number: OrderNumber,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub amount_minor: i64,
    pub currency: Option<String>,
}

/// Payment Bridge
pub struct PaymentBridge {
    store: Arc<dyn PlanStore>,
    reconciler: RenewalReconciler,
}

impl PaymentBridge {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        let reconciler = RenewalReconciler::new(store.clone());
        Self { store, reconciler }
    }

    /// Persist the payment record for a payment created on the gateway
    pub async fn record_checkout(
        &self,
        checkout: CheckoutRecord,
        gateway: &GatewayPayment,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentRecord> {
        let record = PaymentRecord {
            order_number: checkout.order_number,
            gateway_id: Some(gateway.id),
            account_id: checkout.account_id,
            plan_id: Some(checkout.plan_id).filter(PlanId::is_paid),
            plan_name: Some(checkout.plan_name),
            amount_minor: checkout.amount_minor,
            currency: checkout
                .currency
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            state: gateway.state.clone(),
            plan_activated: false,
            plan_activated_at: None,
            gateway_response: Some(gateway.raw.clone()),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payment(&record).await?;

        info!(
            order_number = %record.order_number,
            account_id = %record.account_id,
            payment_id = gateway.id,
            "Payment record created"
        );
        Ok(record)
    }

    /// Activate the plan bought by an order, at most once
    pub async fn activate(
        &self,
        order_number: &OrderNumber,
        now: OffsetDateTime,
    ) -> BillingResult<ActivationOutcome> {
        let (payment, plan, period) = match self.store.activate_payment(order_number, now).await {
            Ok(ActivationClaim::Activated {
                payment,
                plan,
                period,
            }) => (payment, plan, period),
            Ok(ActivationClaim::NotFound) => {
                warn!(order_number = %order_number, "Payment not found for activation");
                return Ok(ActivationOutcome::NotFound);
            }
            Ok(ActivationClaim::NotPaid(state)) => {
                info!(order_number = %order_number, state = %state, "Payment not paid yet");
                return Ok(ActivationOutcome::NotYetConfirmed(state));
            }
            Ok(ActivationClaim::AlreadyActivated) => {
                info!(order_number = %order_number, "Plan already activated for order");
                return Ok(ActivationOutcome::AlreadyProcessed);
            }
            Ok(ActivationClaim::MissingPlan) => {
                warn!(order_number = %order_number, "Paid payment has no plan id");
                return Ok(ActivationOutcome::MissingPlan);
            }
            Err(e) => {
                error!(order_number = %order_number, error = %e, "Plan activation failed");
                return Err(e);
            }
        };

        if let Err(e) = self
            .reconciler
            .clear_expiry_markers(&payment.account_id, now)
            .await
        {
            warn!(
                account_id = %payment.account_id,
                error = %e,
                "Failed to clear plan expiry markers after activation"
            );
        }

        info!(
            order_number = %order_number,
            account_id = %payment.account_id,
            plan = %plan,
            period_end = %period.end,
            "Plan activated"
        );

        Ok(ActivationOutcome::Activated {
            account_id: payment.account_id,
            plan,
            period,
        })
    }

    /// Record a gateway-observed state on an order and activate if paid.
    ///
    /// The gateway payment must belong to the order: its order number, when
    /// present, and the stored gateway id must both match. A mismatch records
    /// nothing and answers [`ActivationOutcome::OrderMismatch`].
    pub async fn apply_gateway_status(
        &self,
        order_number: &OrderNumber,
        gateway: &GatewayPayment,
        path: DeliveryPath,
        now: OffsetDateTime,
    ) -> BillingResult<ActivationOutcome> {
        let payment = self
            .store
            .payment(order_number)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", order_number)))?;

        if !belongs_to(gateway, &payment) {
            warn!(
                order_number = %order_number,
                payment_id = gateway.id,
                gateway_order = ?gateway.order_number,
                stored_payment_id = ?payment.gateway_id,
                path = path.as_str(),
                "Gateway payment does not belong to order, ignoring"
            );
            return Ok(ActivationOutcome::OrderMismatch);
        }

        let update = PaymentStateUpdate {
            state: gateway.state.clone(),
            gateway_response: Some(gateway.raw.clone()),
            path,
            observed_at: now,
        };
        self.store.record_payment_state(order_number, &update).await?;

        tracing::debug!(
            order_number = %order_number,
            state = %gateway.state,
            path = path.as_str(),
            "Recorded gateway payment state"
        );

        if gateway.state.is_paid() {
            self.activate(order_number, now).await
        } else {
            Ok(ActivationOutcome::NotYetConfirmed(gateway.state.clone()))
        }
    }

    /// Match a gateway payment to its order by gateway id, then apply it
    pub async fn apply_gateway_payment(
        &self,
        gateway: &GatewayPayment,
        path: DeliveryPath,
        now: OffsetDateTime,
    ) -> BillingResult<DeliveryResult> {
        let Some(payment) = self.store.payment_by_gateway_id(gateway.id).await? else {
            warn!(payment_id = gateway.id, path = path.as_str(), "No payment record for gateway payment");
            return Ok(DeliveryResult {
                order_number: None,
                state: gateway.state.clone(),
                outcome: ActivationOutcome::NotFound,
            });
        };

        let outcome = self
            .apply_gateway_status(&payment.order_number, gateway, path, now)
            .await?;
        Ok(DeliveryResult {
            order_number: Some(payment.order_number),
            state: gateway.state.clone(),
            outcome,
        })
    }
}

/// Whether a fetched gateway payment is the one recorded for this order
fn belongs_to(gateway: &GatewayPayment, payment: &PaymentRecord) -> bool {
    let order_matches = gateway
        .order_number
        .as_ref()
        .map_or(true, |order| *order == payment.order_number);
    let id_matches = payment.gateway_id.map_or(true, |id| id == gateway.id);
    order_matches && id_matches
}
