//! Stripe webhook route

use axum::{extract::State, http::HeaderMap, http::StatusCode};
use bulldogo_billing::WebhookOutcome;
use time::OffsetDateTime;

use crate::{error::ApiError, state::AppState};

/// Handle Stripe subscription webhooks
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let webhooks = state
        .billing
        .webhooks
        .as_ref()
        .ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Stripe retries on non-2xx; processing failures are only logged
    match webhooks.handle_event(event, OffsetDateTime::now_utc()).await {
        Ok(WebhookOutcome::Synced(outcome)) => {
            tracing::info!(outcome = ?outcome, "Stripe webhook processed successfully")
        }
        Ok(WebhookOutcome::Ignored(event_type)) => {
            tracing::debug!(event_type = %event_type, "Stripe webhook event ignored")
        }
        Err(e) => tracing::error!(error = %e, "Webhook handling error"),
    }

    Ok(StatusCode::OK)
}
