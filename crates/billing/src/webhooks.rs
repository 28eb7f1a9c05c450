//! Stripe webhook handling
//!
//! Signatures are verified by hand (HMAC-SHA256 over `{t}.{payload}`) instead
//! of through `stripe::Webhook`, whose event parsing is pinned to one API
//! version. Only the subscription id is taken from the event; the subscription
//! itself is re-fetched from Stripe before anything is written.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use stripe::SubscriptionId;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscription_sync::{ProviderSubscription, SubscriptionSync, SyncOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Minimal view of a Stripe event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    /// Id of the object the event is about
    pub fn object_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(Value::as_str)
    }

    pub fn is_subscription_event(&self) -> bool {
        matches!(
            self.type_.as_str(),
            "customer.subscription.created"
                | "customer.subscription.updated"
                | "customer.subscription.deleted"
        )
    }
}

/// Verify a `Stripe-Signature` header against a payload at a given time
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        warn!(timestamp, now = now_unix, "Stripe webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let expected = mac.finalize().into_bytes();

    let matched = signatures.iter().any(|sig| {
        hex::decode(sig)
            .map(|bytes| constant_time_eq(&bytes, &expected))
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// What a webhook delivery resulted in
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Synced(SyncOutcome),
    Ignored(String),
}

/// Stripe webhook handler
pub struct StripeWebhookHandler {
    stripe: StripeClient,
    sync: SubscriptionSync,
}

impl StripeWebhookHandler {
    pub fn new(stripe: StripeClient, sync: SubscriptionSync) -> Self {
        Self { stripe, sync }
    }

    /// Verify the signature and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.stripe.config().webhook_secret, now)?;
        serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("Invalid webhook payload: {}", e)))
    }

    /// Handle a verified event
    pub async fn handle_event(&self, event: WebhookEvent, now: OffsetDateTime) -> BillingResult<WebhookOutcome> {
        if !event.is_subscription_event() {
            return Ok(WebhookOutcome::Ignored(event.type_));
        }

        let subscription_id = event
            .object_id()
            .ok_or_else(|| BillingError::InvalidInput("Event has no subscription id".to_string()))?
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription =
            stripe::Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;
        let subscription = ProviderSubscription::from_stripe(&subscription)?;

        let outcome = self.sync.apply(&subscription, now).await?;
        info!(
            event_id = %event.id,
            event_type = %event.type_,
            subscription_id = %subscription_id,
            "Stripe subscription event handled"
        );
        Ok(WebhookOutcome::Synced(outcome))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, t: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", t, payload).as_bytes());
        format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1","type":"customer.subscription.updated","data":{"object":{"id":"sub_1"}}}"#;
        let header = sign(payload, "whsec_abc", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_abc", 1_700_000_100).is_ok());
    }

    #[test]
    fn test_rejects_tampered_payload_and_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_abc", 1_700_000_000);
        assert!(verify_signature(r#"{"id":"evt_2"}"#, &header, "whsec_abc", 1_700_000_000).is_err());
        assert!(verify_signature(payload, &header, "whsec_other", 1_700_000_000).is_err());
    }

    #[test]
    fn test_rejects_stale_and_malformed_headers() {
        let payload = "{}";
        let header = sign(payload, "whsec_abc", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_abc", 1_700_000_301).is_err());
        assert!(verify_signature(payload, "v1=deadbeef", "whsec_abc", 1_700_000_000).is_err());
        assert!(verify_signature(payload, "t=1700000000", "whsec_abc", 1_700_000_000).is_err());
    }

    #[test]
    fn test_event_parsing() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"id":"evt_1","type":"customer.subscription.deleted","data":{"object":{"id":"sub_9"}}}"#,
        )
        .unwrap();
        assert!(event.is_subscription_event());
        assert_eq!(event.object_id(), Some("sub_9"));

        let other: WebhookEvent =
            serde_json::from_str(r#"{"id":"evt_2","type":"invoice.paid","data":{"object":{}}}"#).unwrap();
        assert!(!other.is_subscription_event());
    }
}
