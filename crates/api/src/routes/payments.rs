//! GoPay payment routes
//!
//! Payment creation plus the three delivery paths of a gateway confirmation:
//! the server-to-server notification, the client status check and the browser
//! redirect. Every path re-fetches the payment from GoPay and hands it to the
//! payment bridge, which activates the plan at most once per order.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use bulldogo_billing::{
    gopay::{to_minor_units, NewPayment, PayerContact, PaymentItem},
    records::DEFAULT_CURRENCY,
    ActivationOutcome, CheckoutRecord, DeliveryPath, GatewayPayment, GoPayClient,
};
use bulldogo_shared::{AccountId, OrderNumber, PlanId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

fn gateway(state: &AppState) -> ApiResult<&GoPayClient> {
    state.gopay.as_deref().ok_or_else(|| {
        tracing::warn!("Payment request received but GoPay is not configured");
        ApiError::ServiceUnavailable
    })
}

// =============================================================================
// Create
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    /// Amount in major units (CZK)
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub order_number: Option<String>,
    pub order_description: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub payer_email: Option<String>,
    pub payer_phone: Option<String>,
    pub payer_first_name: Option<String>,
    pub payer_last_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub success: bool,
    pub payment_id: i64,
    pub order_number: String,
    pub gw_url: Option<String>,
    pub state: String,
}

fn required(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Create a GoPay payment for a plan purchase
pub async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentRequest>,
) -> ApiResult<Json<CreatePaymentResponse>> {
    let (
        Some(amount),
        Some(order_number),
        Some(order_description),
        Some(user_id),
        Some(plan_id),
        Some(plan_name),
    ) = (
        body.amount,
        required(body.order_number),
        required(body.order_description),
        required(body.user_id),
        required(body.plan_id),
        required(body.plan_name),
    )
    else {
        return Err(ApiError::Validation(
            "Missing required fields: amount, orderNumber, orderDescription, userId, planId, planName"
                .to_string(),
        ));
    };

    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::Validation("Amount must be greater than 0".to_string()));
    }

    let plan: PlanId = plan_id.parse().map_err(ApiError::Validation)?;
    if !plan.is_paid() {
        return Err(ApiError::Validation("planId must be a paid plan".to_string()));
    }

    let gopay = gateway(&state)?;
    let order_number = OrderNumber::new(order_number);

    if state.billing.store.payment(&order_number).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "Payment for order {} already exists",
            order_number
        )));
    }

    let amount_minor = to_minor_units(amount);
    let currency = required(body.currency).unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let payment = NewPayment {
        order_number: order_number.clone(),
        order_description,
        amount_minor,
        currency: currency.clone(),
        items: vec![PaymentItem {
            name: plan_name.clone(),
            amount: amount_minor,
            count: 1,
        }],
        contact: PayerContact {
            email: required(body.payer_email),
            phone: required(body.payer_phone),
            first_name: required(body.payer_first_name),
            last_name: required(body.payer_last_name),
        },
        return_url: state.config.return_url(),
        notification_url: state.config.notification_url(),
    };

    let created = gopay.create_payment(&payment).await.map_err(|e| {
        tracing::error!(order_number = %order_number, error = %e, "Failed to create payment");
        ApiError::from(e)
    })?;

    let checkout = CheckoutRecord {
        order_number: order_number.clone(),
        account_id: AccountId::new(user_id),
        plan_id: plan,
        plan_name,
        amount_minor,
        currency: Some(currency),
    };
    state
        .billing
        .payments
        .record_checkout(checkout, &created, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(CreatePaymentResponse {
        success: true,
        payment_id: created.id,
        order_number: order_number.to_string(),
        gw_url: created.gw_url,
        state: created.state.to_string(),
    }))
}

// =============================================================================
// Check
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPaymentQuery {
    pub payment_id: Option<String>,
    pub order_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckPaymentResponse {
    pub success: bool,
    pub payment: PaymentSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub id: i64,
    pub order_number: Option<String>,
    pub state: String,
    /// Amount in major units
    pub amount: f64,
    pub currency: Option<String>,
}

impl From<&GatewayPayment> for PaymentSummary {
    fn from(payment: &GatewayPayment) -> Self {
        Self {
            id: payment.id,
            order_number: payment.order_number.as_ref().map(ToString::to_string),
            state: payment.state.to_string(),
            amount: payment.amount_major(),
            currency: payment.currency.clone(),
        }
    }
}

/// Client-initiated payment status check
pub async fn check_payment(
    State(state): State<AppState>,
    Query(query): Query<CheckPaymentQuery>,
) -> ApiResult<Json<CheckPaymentResponse>> {
    let payment_id = required(query.payment_id);
    let order_number = required(query.order_number).map(OrderNumber::new);

    let gateway_id = match (&payment_id, &order_number) {
        (Some(id), _) => id
            .parse::<i64>()
            .map_err(|_| ApiError::Validation("paymentId must be numeric".to_string()))?,
        (None, Some(order)) => state
            .billing
            .store
            .payment(order)
            .await?
            .and_then(|p| p.gateway_id)
            .ok_or(ApiError::NotFound)?,
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Missing paymentId or orderNumber".to_string(),
            ))
        }
    };

    let gopay = gateway(&state)?;
    let payment = gopay.payment_status(gateway_id).await.map_err(|e| {
        tracing::error!(payment_id = gateway_id, error = %e, "Failed to check payment");
        ApiError::from(e)
    })?;

    if let Some(order) = &order_number {
        let outcome = state
            .billing
            .payments
            .apply_gateway_status(order, &payment, DeliveryPath::StatusCheck, OffsetDateTime::now_utc())
            .await?;
        if outcome == ActivationOutcome::OrderMismatch {
            return Err(ApiError::Validation(
                "paymentId does not belong to orderNumber".to_string(),
            ));
        }
        tracing::info!(
            order_number = %order,
            payment_id = payment.id,
            state = %payment.state,
            activated = outcome.is_activated(),
            "Payment status checked"
        );
    }

    Ok(Json(CheckPaymentResponse {
        success: true,
        payment: PaymentSummary::from(&payment),
    }))
}

// =============================================================================
// Notification
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub id: Option<String>,
}

/// Read a gateway payment id from a JSON body (`{"id": 123}` or `{"id": "123"}`)
fn payment_id_from_body(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// GoPay server-to-server notification.
///
/// Only the payment id is taken from the request; the state is re-fetched
/// from GoPay. Processing errors are logged and answered with 200 so the
/// gateway does not keep retrying.
pub async fn gopay_notification(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let payment_id = payment_id_from_body(&body)
        .or_else(|| query.id.as_deref().and_then(|id| id.trim().parse().ok()));

    let Some(payment_id) = payment_id else {
        tracing::warn!("GoPay notification without payment id");
        return (StatusCode::BAD_REQUEST, "Missing payment id in notification");
    };

    tracing::info!(payment_id, "GoPay notification received");

    let Some(gopay) = state.gopay.as_deref() else {
        tracing::error!(payment_id, "GoPay notification received but GoPay is not configured");
        return (StatusCode::OK, "OK");
    };

    let result = match gopay.payment_status(payment_id).await {
        Ok(payment) => {
            state
                .billing
                .payments
                .apply_gateway_payment(&payment, DeliveryPath::Notification, OffsetDateTime::now_utc())
                .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(delivery) => tracing::info!(
            payment_id,
            order_number = ?delivery.order_number,
            state = %delivery.state,
            activated = delivery.outcome.is_activated(),
            "GoPay notification processed"
        ),
        Err(e) => tracing::error!(payment_id, error = %e, "GoPay notification error"),
    }

    (StatusCode::OK, "OK")
}

// =============================================================================
// Return
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReturnQuery {
    pub id_payment_session: Option<String>,
    pub state: Option<String>,
}

/// Keep a redirect query value to a safe character set
fn query_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Browser return from the GoPay payment page
pub async fn payment_return(
    State(state): State<AppState>,
    Query(query): Query<PaymentReturnQuery>,
) -> Redirect {
    let packages = state.config.packages_url();
    let reported_state = query
        .state
        .as_deref()
        .map(query_value)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let Some(payment_id) = query
        .id_payment_session
        .as_deref()
        .and_then(|id| id.trim().parse::<i64>().ok())
    else {
        return Redirect::to(&format!("{}?payment={}", packages, reported_state));
    };

    let Some(gopay) = state.gopay.as_deref() else {
        tracing::error!(payment_id, "Payment return received but GoPay is not configured");
        return Redirect::to(&format!("{}?payment=error", packages));
    };

    let delivery = match gopay.payment_status(payment_id).await {
        Ok(payment) => {
            state
                .billing
                .payments
                .apply_gateway_payment(&payment, DeliveryPath::Redirect, OffsetDateTime::now_utc())
                .await
        }
        Err(e) => Err(e),
    };

    match delivery {
        Ok(delivery) if delivery.outcome == ActivationOutcome::OrderMismatch => {
            Redirect::to(&format!("{}?payment=error", packages))
        }
        Ok(delivery) => match delivery.order_number {
            Some(order_number) => Redirect::to(&format!(
                "{}?payment={}&orderNumber={}&paymentId={}",
                packages,
                query_value(delivery.state.as_str()),
                query_value(order_number.as_str()),
                payment_id
            )),
            None => Redirect::to(&format!("{}?payment={}", packages, reported_state)),
        },
        Err(e) => {
            tracing::warn!(payment_id, error = %e, "Payment return processing failed");
            Redirect::to(&format!("{}?payment={}", packages, reported_state))
        }
    }
}
