//! GoPay payment gateway client
//!
//! Thin REST client over the GoPay API: OAuth2 client-credentials tokens,
//! payment creation and payment status. Calls are not retried; every request
//! carries a timeout.

use std::time::Duration;

use bulldogo_shared::{OrderNumber, PaymentState};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::error::{BillingError, BillingResult};

/// GoPay sandbox API
pub const SANDBOX_API_URL: &str = "https://gw.sandbox.gopay.com/api";
/// GoPay production API
pub const PRODUCTION_API_URL: &str = "https://gate.gopay.cz/api";

/// Timeout for token exchange and payment creation
const CREATE_TIMEOUT: Duration = Duration::from_secs(8);
/// Timeout for payment status lookups
const STATUS_TIMEOUT: Duration = Duration::from_secs(7);

/// Token scope for creating payments
pub const SCOPE_PAYMENT_CREATE: &str = "payment-create";
/// Token scope for reading payments
pub const SCOPE_PAYMENT_ALL: &str = "payment-all";

/// Configuration for the GoPay gateway
#[derive(Debug, Clone)]
pub struct GoPayConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Merchant account id (GoID)
    pub goid: i64,
    pub api_url: String,
    pub is_test: bool,
}

impl GoPayConfig {
    /// Create config from environment variables.
    ///
    /// Test credentials (`GOPAY_TEST_*`) are used unless `GOPAY_ENV=production`.
    pub fn from_env() -> BillingResult<Self> {
        let is_test = !matches!(
            std::env::var("GOPAY_ENV").as_deref(),
            Ok("production") | Ok("prod")
        ) || std::env::var("GOPAY_USE_TEST").as_deref() == Ok("true");

        let (id_var, secret_var, url_var, default_url) = if is_test {
            (
                "GOPAY_TEST_CLIENT_ID",
                "GOPAY_TEST_CLIENT_SECRET",
                "GOPAY_TEST_API_URL",
                SANDBOX_API_URL,
            )
        } else {
            (
                "GOPAY_CLIENT_ID",
                "GOPAY_CLIENT_SECRET",
                "GOPAY_API_URL",
                PRODUCTION_API_URL,
            )
        };

        let client_id = std::env::var(id_var)
            .map_err(|_| BillingError::Config(format!("{} not set", id_var)))?;
        let client_secret = std::env::var(secret_var)
            .map_err(|_| BillingError::Config(format!("{} not set", secret_var)))?;

        let goid = std::env::var("GOPAY_GOID")
            .unwrap_or_else(|_| client_id.clone())
            .parse::<i64>()
            .map_err(|_| BillingError::Config("GOPAY_GOID must be numeric".to_string()))?;

        Ok(Self {
            client_id,
            client_secret,
            goid,
            api_url: std::env::var(url_var).unwrap_or_else(|_| default_url.to_string()),
            is_test,
        })
    }
}

/// Payer contact details passed to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayerContact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "phone_number", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// One line item of a payment, amount in minor units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentItem {
    pub name: String,
    pub amount: i64,
    pub count: u32,
}

/// A payment to create on the gateway
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_number: OrderNumber,
    pub order_description: String,
    /// Amount in minor units
    pub amount_minor: i64,
    pub currency: String,
    pub items: Vec<PaymentItem>,
    pub contact: PayerContact,
    pub return_url: String,
    pub notification_url: String,
}

#[derive(Debug, Serialize)]
struct CreatePaymentRequest<'a> {
    amount: i64,
    currency: &'a str,
    order_number: &'a str,
    order_description: &'a str,
    items: &'a [PaymentItem],
    payer: Payer<'a>,
    target: Target,
    return_url: &'a str,
    notification_url: &'a str,
    lang: &'static str,
}

#[derive(Debug, Serialize)]
struct Payer<'a> {
    allowed_payment_instruments: [&'static str; 2],
    default_payment_instrument: &'static str,
    contact: &'a PayerContact,
}

#[derive(Debug, Serialize)]
struct Target {
    #[serde(rename = "type")]
    kind: &'static str,
    goid: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RawPayment {
    id: i64,
    #[serde(default)]
    order_number: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    gw_url: Option<String>,
}

/// Payment as reported by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayment {
    pub id: i64,
    pub order_number: Option<OrderNumber>,
    pub state: PaymentState,
    /// Amount in minor units
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub gw_url: Option<String>,
    /// Full response body, kept on the payment record
    pub raw: Value,
}

impl GatewayPayment {
    fn from_value(raw: Value) -> BillingResult<Self> {
        let parsed: RawPayment = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::Gateway(format!("Unexpected payment payload: {}", e)))?;
        Ok(Self {
            id: parsed.id,
            order_number: parsed.order_number.map(OrderNumber::new),
            state: parsed
                .state
                .map(PaymentState::from)
                .unwrap_or(PaymentState::Created),
            amount_minor: parsed.amount.unwrap_or(0),
            currency: parsed.currency,
            gw_url: parsed.gw_url,
            raw,
        })
    }

    /// Amount in major units
    pub fn amount_major(&self) -> f64 {
        self.amount_minor as f64 / 100.0
    }
}

/// Convert a major-unit amount to minor units, rounding to the nearest unit
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// GoPay REST client
#[derive(Clone)]
pub struct GoPayClient {
    client: Client,
    config: GoPayConfig,
}

impl GoPayClient {
    pub fn new(config: GoPayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(GoPayConfig::from_env()?))
    }

    pub fn config(&self) -> &GoPayConfig {
        &self.config
    }

    /// Exchange client credentials for an access token
    pub async fn access_token(&self, scope: &str) -> BillingResult<String> {
        let response = self
            .client
            .post(format!("{}/oauth2/token", self.config.api_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .query(&[("grant_type", "client_credentials"), ("scope", scope)])
            .header("Accept", "application/json")
            .timeout(CREATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "GoPay OAuth2 error");
            return Err(BillingError::Gateway(format!(
                "Failed to get GoPay access token: {}",
                gateway_message(&body).unwrap_or_else(|| status.to_string())
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Invalid token response: {}", e)))?;
        Ok(token.access_token)
    }

    /// Create a payment and return the gateway's view of it
    pub async fn create_payment(&self, payment: &NewPayment) -> BillingResult<GatewayPayment> {
        let token = self.access_token(SCOPE_PAYMENT_CREATE).await?;

        let request = CreatePaymentRequest {
            amount: payment.amount_minor,
            currency: &payment.currency,
            order_number: payment.order_number.as_str(),
            order_description: &payment.order_description,
            items: &payment.items,
            payer: Payer {
                allowed_payment_instruments: ["PAYMENT_CARD", "BANK_ACCOUNT"],
                default_payment_instrument: "PAYMENT_CARD",
                contact: &payment.contact,
            },
            target: Target {
                kind: "ACCOUNT",
                goid: self.config.goid,
            },
            return_url: &payment.return_url,
            notification_url: &payment.notification_url,
            lang: "cs",
        };

        let response = self
            .client
            .post(format!("{}/payments/payment", self.config.api_url))
            .bearer_auth(&token)
            .json(&request)
            .timeout(CREATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Create payment request failed: {}", e)))?;

        let created = self.read_payment(response).await?;
        info!(
            order_number = %payment.order_number,
            payment_id = created.id,
            state = %created.state,
            "GoPay payment created"
        );
        Ok(created)
    }

    /// Fetch the current state of a payment by gateway id
    pub async fn payment_status(&self, payment_id: i64) -> BillingResult<GatewayPayment> {
        let token = self.access_token(SCOPE_PAYMENT_ALL).await?;

        let response = self
            .client
            .get(format!("{}/payments/payment/{}", self.config.api_url, payment_id))
            .bearer_auth(&token)
            .header("Accept", "application/json")
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Payment status request failed: {}", e)))?;

        self.read_payment(response).await
    }

    async fn read_payment(&self, response: reqwest::Response) -> BillingResult<GatewayPayment> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "GoPay payment API error");
            return Err(BillingError::Gateway(
                gateway_message(&body).unwrap_or_else(|| format!("GoPay returned {}", status)),
            ));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Invalid payment response: {}", e)))?;
        GatewayPayment::from_value(raw)
    }
}

/// First error message of a GoPay error body (`{"errors":[{"message":..}]}`)
fn gateway_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("errors")?
        .get(0)?
        .get("message")
        .or_else(|| value.get("errors")?.get(0)?.get("error_name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
