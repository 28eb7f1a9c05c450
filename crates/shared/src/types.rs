//! Common types used across Bulldogo

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Account ID wrapper
///
/// Account ids are issued by the managed identity provider and are opaque
/// strings, not UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Listing ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub Uuid);

impl ListingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListingId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ListingId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Review ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(pub Uuid);

impl ReviewId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReviewId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ReviewId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Order number, the caller-assigned idempotency key of a payment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(pub String);

impl OrderNumber {
    pub fn new(order: impl Into<String>) -> Self {
        Self(order.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    /// No subscription
    #[default]
    None,
    /// Individual tier
    Hobby,
    /// Company tier
    Business,
}

impl PlanId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Hobby => "hobby",
            Self::Business => "business",
        }
    }

    /// Display label shown to account owners
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "Žádný",
            Self::Hobby => "Hobby",
            Self::Business => "Firma",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Map a nullable stored value; unknown and missing values read as `None`
    pub fn from_stored(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or(Self::None)
    }

    /// Stored representation; `None` is persisted as NULL
    pub fn to_stored(&self) -> Option<&'static str> {
        if self.is_paid() {
            Some(self.as_str())
        } else {
            None
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "hobby" => Ok(Self::Hobby),
            "business" | "firma" => Ok(Self::Business),
            other => Err(format!("Unknown plan: {}", other)),
        }
    }
}

// =============================================================================
// Listings
// =============================================================================

/// Inactivation reason written by the expiry enforcer
pub const PLAN_EXPIRED_REASON: &str = "plan_expired";

/// Publication status of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    #[default]
    Active,
    Inactive,
    Archived,
    Deleted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Map a stored value; missing or unknown status reads as active
    pub fn from_stored(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("Unknown listing status: {}", other)),
        }
    }
}

// =============================================================================
// Payments
// =============================================================================

/// Gateway payment state
///
/// GoPay defines more states than the ones listed; anything else is kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentState {
    Created,
    PaymentMethodChosen,
    Authorized,
    Paid,
    Canceled,
    Timeouted,
    Refunded,
    PartiallyRefunded,
    Other(String),
}

impl PaymentState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "CREATED",
            Self::PaymentMethodChosen => "PAYMENT_METHOD_CHOSEN",
            Self::Authorized => "AUTHORIZED",
            Self::Paid => "PAID",
            Self::Canceled => "CANCELED",
            Self::Timeouted => "TIMEOUTED",
            Self::Refunded => "REFUNDED",
            Self::PartiallyRefunded => "PARTIALLY_REFUNDED",
            Self::Other(s) => s.as_str(),
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl From<String> for PaymentState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CREATED" => Self::Created,
            "PAYMENT_METHOD_CHOSEN" => Self::PaymentMethodChosen,
            "AUTHORIZED" => Self::Authorized,
            "PAID" => Self::Paid,
            "CANCELED" => Self::Canceled,
            "TIMEOUTED" => Self::Timeouted,
            "REFUNDED" => Self::Refunded,
            "PARTIALLY_REFUNDED" => Self::PartiallyRefunded,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for PaymentState {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<PaymentState> for String {
    fn from(state: PaymentState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_id_parsing() {
        assert_eq!("hobby".parse::<PlanId>().unwrap(), PlanId::Hobby);
        assert_eq!("Business".parse::<PlanId>().unwrap(), PlanId::Business);
        assert_eq!("".parse::<PlanId>().unwrap(), PlanId::None);
        assert!("gold".parse::<PlanId>().is_err());
    }

    #[test]
    fn test_plan_id_stored_roundtrip() {
        assert_eq!(PlanId::from_stored(None), PlanId::None);
        assert_eq!(PlanId::from_stored(Some("garbage")), PlanId::None);
        assert_eq!(PlanId::None.to_stored(), None);
        assert_eq!(PlanId::Hobby.to_stored(), Some("hobby"));
        assert_eq!(PlanId::Business.label(), "Firma");
    }

    #[test]
    fn test_listing_status_defaults_to_active() {
        assert_eq!(ListingStatus::from_stored(None), ListingStatus::Active);
        assert_eq!(
            ListingStatus::from_stored(Some("archived")),
            ListingStatus::Archived
        );
    }

    #[test]
    fn test_payment_state_keeps_unknown_values() {
        let state = PaymentState::from("PAID");
        assert!(state.is_paid());

        let other: PaymentState = serde_json::from_str("\"ON_HOLD\"").unwrap();
        assert_eq!(other, PaymentState::Other("ON_HOLD".to_string()));
        assert_eq!(serde_json::to_string(&other).unwrap(), "\"ON_HOLD\"");
    }
}
