//! Bulldogo API server

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use bulldogo_api::{create_router, AppState, Config};
use bulldogo_billing::{BillingService, GoPayClient, PgPlanStore, PlanStore, StripeConfig};
use bulldogo_shared::{create_migration_pool, create_pool, init_tracing, run_migrations};
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("bulldogo_api=info,bulldogo_billing=info,tower_http=info");

    let config = Config::from_env().context("Invalid configuration")?;

    {
        let migration_pool = create_migration_pool(&config.database_url)
            .await
            .context("Failed to connect for migrations")?;
        run_migrations(&migration_pool)
            .await
            .context("Failed to run migrations")?;
    }

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to create database pool")?;
    let store: Arc<dyn PlanStore> = Arc::new(PgPlanStore::new(pool));

    let stripe = if config.enable_stripe_sync {
        match StripeConfig::from_env() {
            Ok(stripe) => Some(stripe),
            Err(e) => {
                tracing::warn!(error = %e, "Stripe sync enabled but not configured");
                None
            }
        }
    } else {
        None
    };

    let gopay = if config.enable_payments {
        match GoPayClient::from_env() {
            Ok(client) => {
                tracing::info!(
                    api_url = %client.config().api_url,
                    test_mode = client.config().is_test,
                    "GoPay configured"
                );
                Some(client)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Payments enabled but GoPay is not configured");
                None
            }
        }
    } else {
        None
    };

    let billing = BillingService::new(store, stripe);
    let bind_address = config.bind_address.clone();
    let cors = cors_layer(&config.cors_origins);
    let state = AppState::new(config, billing, gopay);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Bulldogo API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received terminate signal, shutting down"),
    }
}
