//! Ad Visibility Gate
//!
//! Public visibility of a listing is a pure function of its status. The gate
//! also decides what the expiry enforcer may do with a listing of an expired
//! account, and which listings the renewal reconciler owns.

use bulldogo_shared::{ListingStatus, PLAN_EXPIRED_REASON};
use time::{Duration, OffsetDateTime};

use crate::records::Listing;

/// Days between the first plan-expiry inactivation and hard deletion
pub const GRACE_PERIOD_DAYS: i64 = 30;

/// Whether a listing is shown publicly
pub fn is_publicly_visible(listing: &Listing) -> bool {
    listing.status == ListingStatus::Active
}

/// Whether the listing was deactivated by the expiry enforcer
pub fn is_plan_expired_marked(listing: &Listing) -> bool {
    listing.inactive_reason.as_deref() == Some(PLAN_EXPIRED_REASON)
}

/// What the enforcer does with one listing of an expired account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Deleted or archived; never touched
    Skip,
    /// Active listing: set inactive with reason `plan_expired`
    Inactivate,
    /// Already inactive for plan expiry but missing its timestamp
    AnchorInactiveAt,
    /// Grace window elapsed: delete reviews then the listing
    Delete,
    /// Already inactive for plan expiry, still within grace
    Wait,
    /// Inactive for another reason (e.g. `manual_pause`); left alone
    ForeignReason,
}

/// Classify a listing of an expired account
pub fn classify_for_expiry(listing: &Listing, now: OffsetDateTime) -> ExpiryAction {
    match listing.status {
        ListingStatus::Deleted | ListingStatus::Archived => ExpiryAction::Skip,
        ListingStatus::Active => ExpiryAction::Inactivate,
        ListingStatus::Inactive if !is_plan_expired_marked(listing) => ExpiryAction::ForeignReason,
        ListingStatus::Inactive => match listing.inactive_at {
            None => ExpiryAction::AnchorInactiveAt,
            Some(at) if at <= now - Duration::days(GRACE_PERIOD_DAYS) => ExpiryAction::Delete,
            Some(_) => ExpiryAction::Wait,
        },
    }
}
