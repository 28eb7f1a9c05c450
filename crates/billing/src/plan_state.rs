//! Plan State
//!
//! The canonical subscription record of an account and the activity predicate
//! every other component derives from.
//!
//! ## Activity predicate
//!
//! A record grants entitlement iff it names a paid plan and its period has not
//! ended (`periodEnd` unset or `now < periodEnd`). A scheduled cancellation
//! (`cancelAt`) does not shorten the paid period: cancelling schedules the
//! cancellation at `periodEnd`, so the plan stays active until then.

use bulldogo_shared::{days_until_ceil, AccountId, PlanId};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Fixed billing granularity of a plan activation
pub const BILLING_PERIOD_DAYS: i64 = 30;

/// Subscription record of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPlanRecord {
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub plan_name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub duration_days: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    /// Start of the grace window; set once per expiry episode
    #[serde(with = "time::serde::rfc3339::option")]
    pub expired_at: Option<OffsetDateTime>,
    /// Last enforcement pass that wrote this record
    #[serde(with = "time::serde::rfc3339::option")]
    pub expired_processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl AccountPlanRecord {
    /// A record with no plan and no markers
    pub fn empty(account_id: AccountId) -> Self {
        Self {
            account_id,
            plan_id: PlanId::None,
            plan_name: None,
            period_start: None,
            period_end: None,
            duration_days: None,
            cancel_at: None,
            expired_at: None,
            expired_processed_at: None,
            updated_at: None,
        }
    }

    /// The activity predicate
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        if !self.plan_id.is_paid() {
            return false;
        }
        match self.period_end {
            Some(end) => now < end,
            None => true,
        }
    }

    /// Plan the account is entitled to right now
    pub fn effective_plan(&self, now: OffsetDateTime) -> PlanId {
        if self.is_active(now) {
            self.plan_id
        } else {
            PlanId::None
        }
    }

    /// Whether the enforcer has marked this record as expired
    pub fn is_marked_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    /// Whether the record already carries exactly the given expiry marking,
    /// i.e. an enforcement write would change nothing but the progress stamp
    pub fn is_expired_as(&self, expired_at: OffsetDateTime) -> bool {
        !self.plan_id.is_paid() && self.cancel_at.is_none() && self.expired_at == Some(expired_at)
    }
}

/// Activity predicate over an optional record; a missing record is inactive
pub fn is_plan_active(record: Option<&AccountPlanRecord>, now: OffsetDateTime) -> bool {
    record.map(|r| r.is_active(now)).unwrap_or(false)
}

/// A paid period granted by one activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub duration_days: i64,
}

impl PlanPeriod {
    /// Period of `BILLING_PERIOD_DAYS` starting at `now`
    pub fn starting_at(now: OffsetDateTime) -> Self {
        Self {
            start: now,
            end: now + Duration::days(BILLING_PERIOD_DAYS),
            duration_days: BILLING_PERIOD_DAYS,
        }
    }

    /// Period given explicit bounds (provider-driven renewals)
    pub fn between(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self {
            start,
            end,
            duration_days: days_until_ceil(start, end),
        }
    }
}

/// Account-facing view of the plan record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanView {
    pub plan: PlanId,
    pub label: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    pub duration_days: Option<i64>,
    pub remaining_days: Option<i64>,
    /// Whether a cancel request can be made (active plan, nothing scheduled)
    pub can_cancel: bool,
}

impl PlanView {
    pub fn from_record(record: Option<&AccountPlanRecord>, now: OffsetDateTime) -> Self {
        let Some(record) = record else {
            return Self::none();
        };

        let active = record.is_active(now);
        let plan = record.effective_plan(now);
        // An ended period hides any scheduled cancellation
        let cancel_at = if active { record.cancel_at } else { None };

        let duration_days = record.duration_days.or_else(|| match (record.period_start, record.period_end) {
            (Some(start), Some(end)) => Some(days_until_ceil(start, end)),
            _ => None,
        });

        let label = if active {
            record
                .plan_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| plan.label().to_string())
        } else {
            PlanId::None.label().to_string()
        };

        Self {
            plan,
            label,
            active,
            period_end: record.period_end,
            cancel_at,
            duration_days,
            remaining_days: record.period_end.map(|end| days_until_ceil(now, end)),
            can_cancel: active && cancel_at.is_none(),
        }
    }

    fn none() -> Self {
        Self {
            plan: PlanId::None,
            label: PlanId::None.label().to_string(),
            active: false,
            period_end: None,
            cancel_at: None,
            duration_days: None,
            remaining_days: None,
            can_cancel: false,
        }
    }
}
