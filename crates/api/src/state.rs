//! Shared application state

use std::sync::Arc;

use bulldogo_billing::{BillingService, GoPayClient};

use crate::{auth::JwtManager, config::Config};

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    /// Present when GoPay credentials are configured
    pub gopay: Option<Arc<GoPayClient>>,
    pub jwt: JwtManager,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService, gopay: Option<GoPayClient>) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret);
        Self {
            config: Arc::new(config),
            billing: Arc::new(billing),
            gopay: gopay.map(Arc::new),
            jwt,
        }
    }
}
