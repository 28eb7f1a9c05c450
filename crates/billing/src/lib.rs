//! Bulldogo Billing
//!
//! Subscription plan lifecycle: payment confirmation, plan activation,
//! scheduled expiry enforcement, renewal reconciliation, recurring billing
//! sync and the inactive account purge.

pub mod account_purge;
pub mod activation;
pub mod client;
pub mod enforcer;
pub mod error;
pub mod gopay;
pub mod identity;
pub mod management;
pub mod plan_state;
pub mod records;
pub mod renewal;
pub mod store;
pub mod subscription_sync;
pub mod visibility;
pub mod webhooks;

use std::sync::Arc;

pub use account_purge::{AccountPurge, AccountPurgeResult, CleanupStep, PurgeReport, StepResult};
pub use activation::{ActivationOutcome, CheckoutRecord, DeliveryResult, PaymentBridge};
pub use client::{StripeClient, StripeConfig};
pub use enforcer::{ExpiryEnforcer, SweepFailure, SweepReport, SweepStage};
pub use error::{BillingError, BillingResult};
pub use gopay::{GatewayPayment, GoPayClient, GoPayConfig};
pub use identity::{IdentityProvider, SupabaseIdentity};
pub use management::PlanService;
pub use plan_state::{is_plan_active, AccountPlanRecord, PlanPeriod, PlanView, BILLING_PERIOD_DAYS};
pub use records::{DeliveryPath, Listing, PaymentRecord};
pub use renewal::RenewalReconciler;
pub use store::{AccountStore, InMemoryStore, PgPlanStore, PlanStore};
pub use subscription_sync::{ProviderSubscription, SubscriptionSync, SyncOutcome};
pub use webhooks::{StripeWebhookHandler, WebhookEvent, WebhookOutcome};

/// Billing services wired over one store
pub struct BillingService {
    pub store: Arc<dyn PlanStore>,
    pub payments: PaymentBridge,
    pub plans: PlanService,
    pub enforcer: ExpiryEnforcer,
    /// Present when Stripe is configured
    pub webhooks: Option<StripeWebhookHandler>,
}

impl BillingService {
    pub fn new(store: Arc<dyn PlanStore>, stripe: Option<StripeConfig>) -> Self {
        let webhooks = stripe.map(|config| {
            let sync = SubscriptionSync::new(store.clone(), config.clone());
            StripeWebhookHandler::new(StripeClient::new(config), sync)
        });

        Self {
            payments: PaymentBridge::new(store.clone()),
            plans: PlanService::new(store.clone()),
            enforcer: ExpiryEnforcer::new(store.clone()),
            webhooks,
            store,
        }
    }
}
