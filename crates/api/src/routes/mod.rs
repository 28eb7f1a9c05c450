//! API routes

pub mod health;
pub mod payments;
pub mod plan;
pub mod stripe;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Gateway callbacks and checkout, no bearer token
    let payment_routes = Router::new()
        .route("/payments", post(payments::create_payment))
        .route("/payments/check", get(payments::check_payment))
        .route("/payments/return", get(payments::payment_return))
        .route(
            "/gopay/notification",
            post(payments::gopay_notification).get(payments::gopay_notification),
        )
        .route("/stripe/webhook", post(stripe::webhook));

    let plan_routes = Router::new()
        .route("/plan", get(plan::get_plan))
        .route("/plan/cancel", post(plan::cancel_plan))
        .route("/plan/cancel/undo", post(plan::undo_cancel_plan))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(health_routes)
        .merge(payment_routes)
        .merge(plan_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
