//! Bulldogo API Library
//!
//! HTTP surface of the plan lifecycle: GoPay checkout and confirmation
//! paths, the Stripe subscription webhook and plan management.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
