//! Managed identity provider boundary
//!
//! The purge deletes the identity user last, through this trait only.

use std::time::Duration;

use async_trait::async_trait;
use bulldogo_shared::AccountId;
use reqwest::{Client, StatusCode};
use tracing::{debug, error};

use crate::error::{BillingError, BillingResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations on the managed identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Delete the user behind an account. A missing user is not an error.
    async fn delete_user(&self, account_id: &AccountId) -> BillingResult<()>;
}

/// Supabase Auth admin API
#[derive(Clone)]
pub struct SupabaseIdentity {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseIdentity {
    pub fn new(base_url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_role_key: service_role_key.into(),
        }
    }

    /// Create from `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`
    pub fn from_env() -> BillingResult<Self> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| BillingError::Config("SUPABASE_URL not set".to_string()))?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| BillingError::Config("SUPABASE_SERVICE_ROLE_KEY not set".to_string()))?;
        Ok(Self::new(url, key))
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn delete_user(&self, account_id: &AccountId) -> BillingResult<()> {
        let response = self
            .client
            .delete(format!("{}/auth/v1/admin/users/{}", self.base_url, account_id))
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| BillingError::Identity(format!("Delete user request failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(account_id = %account_id, "Identity user already gone");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(account_id = %account_id, status = %status, body = %body, "Identity user deletion failed");
                Err(BillingError::Identity(format!(
                    "Delete user returned {}",
                    status
                )))
            }
        }
    }
}
