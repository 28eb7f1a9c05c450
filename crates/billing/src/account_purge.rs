//! Inactive Account Purge
//!
//! Deletes accounts nobody has signed in to for [`INACTIVITY_DAYS`]. Each
//! account is removed through a fixed, ordered list of [`CleanupStep`]s;
//! every step reports its own result and a failing step does not stop the
//! ones after it. The identity user goes last.

use std::sync::Arc;

use bulldogo_shared::AccountId;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::error::BillingResult;
use crate::identity::IdentityProvider;
use crate::store::{delete_listing_with_reviews, AccountStore};

/// Six billing months without a sign-in
pub const INACTIVITY_DAYS: i64 = 6 * 30;

/// One deletion step of an account purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    PlanRecord,
    /// Listings with their reviews
    Listings,
    /// Reviews written about the account
    ProfileReviews,
    /// Reviews the account wrote
    AuthoredReviews,
    Messages,
    AccountRoot,
    IdentityUser,
}

impl CleanupStep {
    /// Execution order
    pub const ORDER: [CleanupStep; 7] = [
        CleanupStep::PlanRecord,
        CleanupStep::Listings,
        CleanupStep::ProfileReviews,
        CleanupStep::AuthoredReviews,
        CleanupStep::Messages,
        CleanupStep::AccountRoot,
        CleanupStep::IdentityUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanRecord => "plan_record",
            Self::Listings => "listings",
            Self::ProfileReviews => "profile_reviews",
            Self::AuthoredReviews => "authored_reviews",
            Self::Messages => "messages",
            Self::AccountRoot => "account_root",
            Self::IdentityUser => "identity_user",
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: CleanupStep,
    pub deleted: u64,
    pub error: Option<String>,
}

/// Results of purging one account, in execution order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountPurgeResult {
    pub account_id: AccountId,
    pub steps: Vec<StepResult>,
}

impl AccountPurgeResult {
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn failed_steps(&self) -> Vec<CleanupStep> {
        self.steps
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.step)
            .collect()
    }
}

/// Summary of one purge run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeReport {
    pub candidates: usize,
    pub purged: usize,
    pub partial: usize,
    pub accounts: Vec<AccountPurgeResult>,
}

/// Inactive Account Purge
pub struct AccountPurge {
    store: Arc<dyn AccountStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl AccountPurge {
    pub fn new(store: Arc<dyn AccountStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { store, identity }
    }

    /// Purge every account inactive for longer than [`INACTIVITY_DAYS`]
    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<PurgeReport> {
        let cutoff = now - Duration::days(INACTIVITY_DAYS);
        let candidates = self.store.accounts_inactive_since(cutoff).await?;

        let mut report = PurgeReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for account in candidates {
            info!(
                account_id = %account.account_id,
                last_activity = %account.last_activity(),
                "Purging inactive account"
            );
            let result = self.purge_account(&account.account_id).await;
            if result.is_complete() {
                report.purged += 1;
            } else {
                report.partial += 1;
                warn!(
                    account_id = %account.account_id,
                    failed_steps = ?result.failed_steps(),
                    "Account purge incomplete"
                );
            }
            report.accounts.push(result);
        }

        info!(
            candidates = report.candidates,
            purged = report.purged,
            partial = report.partial,
            "Inactive account purge finished"
        );
        Ok(report)
    }

    /// Run every cleanup step for one account
    pub async fn purge_account(&self, account_id: &AccountId) -> AccountPurgeResult {
        let mut steps = Vec::with_capacity(CleanupStep::ORDER.len());
        for step in CleanupStep::ORDER {
            let result = match self.run_step(step, account_id).await {
                Ok(deleted) => StepResult {
                    step,
                    deleted,
                    error: None,
                },
                Err(e) => {
                    error!(
                        account_id = %account_id,
                        step = step.as_str(),
                        error = %e,
                        "Purge step failed"
                    );
                    StepResult {
                        step,
                        deleted: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            steps.push(result);
        }
        AccountPurgeResult {
            account_id: account_id.clone(),
            steps,
        }
    }

    async fn run_step(&self, step: CleanupStep, account_id: &AccountId) -> BillingResult<u64> {
        match step {
            CleanupStep::PlanRecord => self.store.delete_plan_record(account_id).await,
            CleanupStep::Listings => self.delete_listings(account_id).await,
            CleanupStep::ProfileReviews => self.store.delete_profile_reviews(account_id).await,
            CleanupStep::AuthoredReviews => self.store.delete_reviews_by_author(account_id).await,
            CleanupStep::Messages => self.store.delete_messages(account_id).await,
            CleanupStep::AccountRoot => self.store.delete_account(account_id).await,
            CleanupStep::IdentityUser => {
                self.identity.delete_user(account_id).await?;
                Ok(1)
            }
        }
    }

    /// Delete listings one by one; the first failure fails the step after
    /// the remaining listings were attempted
    async fn delete_listings(&self, account_id: &AccountId) -> BillingResult<u64> {
        let listings = self.store.listings(account_id).await?;
        let mut deleted = 0;
        let mut first_error = None;
        for listing in listings {
            match delete_listing_with_reviews(self.store.as_ref(), account_id, listing.id).await {
                Ok(_) => deleted += 1,
                Err(e) => {
                    warn!(account_id = %account_id, listing_id = %listing.id, error = %e, "Listing deletion failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }
}
