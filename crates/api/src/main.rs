//! Folio API server

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use folio_api::{
    config::Config,
    illustrations::{IllustrationService, OpenAiImageClient},
    routes::create_router,
    state::AppState,
    telemetry::init_tracing,
};
use folio_billing::BillingService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(bind_address = %config.bind_address, "Starting Folio API");

    let migration_pool = folio_shared::db::create_migration_pool(&config.database_url)
        .await
        .context("Failed to connect to database for migrations")?;
    folio_shared::db::run_migrations(&migration_pool)
        .await
        .context("Failed to run migrations")?;
    migration_pool.close().await;

    let pool = folio_shared::db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let billing = BillingService::from_env(pool.clone()).context("Failed to configure billing")?;

    let image_client =
        OpenAiImageClient::from_config(&config).context("Failed to build image client")?;
    if config.image_api_key.is_none() {
        tracing::warn!("IMAGE_API_KEY not set, illustration generation is disabled");
    }
    let illustrations =
        IllustrationService::new(pool.clone(), Arc::new(image_client), config.illustration_cost);

    let cors = build_cors(&config.cors_allowed_origins);
    let bind_address = config.bind_address.clone();

    let state = AppState::new(pool, config, billing, illustrations);
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(parsed)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
