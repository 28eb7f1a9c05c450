//! Persisted documents other than the plan record

use bulldogo_shared::{AccountId, ListingId, ListingStatus, OrderNumber, PaymentState, PlanId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::plan_state::PlanPeriod;

/// A listing as seen by the enforcer and the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub account_id: AccountId,
    pub status: ListingStatus,
    pub inactive_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub inactive_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Listing {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            id: ListingId::new(),
            account_id,
            status: ListingStatus::Active,
            inactive_reason: None,
            inactive_at: None,
            updated_at: None,
        }
    }
}

/// Payment record, one per order number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub order_number: OrderNumber,
    /// GoPay payment id
    pub gateway_id: Option<i64>,
    pub account_id: AccountId,
    pub plan_id: Option<PlanId>,
    pub plan_name: Option<String>,
    /// Amount in minor units (haléř)
    pub amount_minor: i64,
    pub currency: String,
    pub state: PaymentState,
    pub plan_activated: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub plan_activated_at: Option<OffsetDateTime>,
    pub gateway_response: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Default currency of the marketplace
pub const DEFAULT_CURRENCY: &str = "CZK";

/// Which delivery path observed a payment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Gateway webhook
    Notification,
    /// Client polling
    StatusCheck,
    /// Browser redirect back from the gateway
    Redirect,
}

impl DeliveryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::StatusCheck => "status_check",
            Self::Redirect => "redirect",
        }
    }
}

/// State observed on the gateway, to be recorded on the payment
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStateUpdate {
    pub state: PaymentState,
    pub gateway_response: Option<Value>,
    pub path: DeliveryPath,
    pub observed_at: OffsetDateTime,
}

/// Result of trying to claim the activation guard of a payment
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationClaim {
    /// The guard flipped false → true for this caller and the plan was written
    Activated {
        payment: PaymentRecord,
        plan: PlanId,
        period: PlanPeriod,
    },
    NotFound,
    NotPaid(PaymentState),
    AlreadyActivated,
    /// Paid, but the payment does not name a plan
    MissingPlan,
}

/// Account directory entry used by the purge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub email: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_sign_in_at: Option<OffsetDateTime>,
}

impl AccountSummary {
    /// Last sign-in, else creation time
    pub fn last_activity(&self) -> OffsetDateTime {
        self.last_sign_in_at.unwrap_or(self.created_at)
    }
}
