//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    /// Externally reachable base URL, used for gateway return and notification URLs
    pub public_url: String,
    /// Marketing site that payment redirects land on
    pub frontend_url: String,
    pub cors_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Feature flags
    pub enable_payments: bool,
    pub enable_stripe_sync: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let frontend_url = env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "https://bulldogo.cz".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec![frontend_url.clone()]),
            frontend_url,

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            // Authentication
            jwt_secret: {
                let secret = env::var("SUPABASE_JWT_SECRET")
                    .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "SUPABASE_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Feature flags
            enable_payments: env::var("ENABLE_PAYMENTS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            enable_stripe_sync: env::var("ENABLE_STRIPE_SYNC")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }

    /// URL the gateway calls with payment state changes
    pub fn notification_url(&self) -> String {
        format!("{}/gopay/notification", self.public_url)
    }

    /// URL the payer's browser comes back to
    pub fn return_url(&self) -> String {
        format!("{}/payments/return", self.public_url)
    }

    /// Packages page that payment results are shown on
    pub fn packages_url(&self) -> String {
        format!("{}/packages.html", self.frontend_url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
