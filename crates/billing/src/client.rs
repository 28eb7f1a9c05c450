//! Stripe client configuration

use bulldogo_shared::PlanId;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe recurring billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each plan
    pub price_ids: PriceIds,
}

/// Stripe price IDs of the paid plans
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub hobby: Option<String>,
    pub business: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                hobby: std::env::var("STRIPE_PRICE_HOBBY").ok(),
                business: std::env::var("STRIPE_PRICE_BUSINESS").ok(),
            },
        })
    }

    /// Get plan from price ID
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanId> {
        if self.price_ids.hobby.as_deref() == Some(price_id) {
            Some(PlanId::Hobby)
        } else if self.price_ids.business.as_deref() == Some(price_id) {
            Some(PlanId::Business)
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
