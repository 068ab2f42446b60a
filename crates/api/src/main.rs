// API server clippy configuration
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Resell API Server
//!
//! Serves the dialogue, repayment and owner routes for the chat adapter.

use std::{net::SocketAddr, sync::Arc};

use axum::http::{header, HeaderName, Method};
use resell_api::{create_router, AppState};
use resell_ledger::ResellerService;
use resell_shared::{create_pool, run_migrations, Config};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,resell_api=debug,resell_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Resell API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    let Some(api_key) = config.api_key.clone() else {
        anyhow::bail!("API_KEY must be set for the API server");
    };
    tracing::info!(
        owner_telegram_id = config.owner_telegram_id,
        admins = config.admin_ids.len(),
        tariffs = config.tariffs.all().len(),
        gateway = %config.gateway.base_url,
        "Configuration loaded"
    );
    if config.owner_telegram_id == 0 {
        tracing::warn!("OWNER_TELEGRAM_ID not set - transfer requests cannot be decided");
    }

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database connection established");

    let config = Arc::new(config);
    let reseller = ResellerService::connect(pool, config.clone())?;
    let state = AppState::new(reseller, &api_key);

    // The adapter normally calls server-to-server; browsers only from the allowlist
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-telegram-id"),
            HeaderName::from_static("x-telegram-name"),
            HeaderName::from_static("x-telegram-username"),
        ]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
