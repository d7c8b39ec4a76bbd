mod auth;
mod config;
mod coordinator;
mod error;
mod rate_limit;
mod routes;
mod validation;


use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use tandem_core::db::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandem_api=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting tandem-api with config: {:?}", config);

    let db = Arc::new(Database::open_target(&config.database).await?);
    tracing::info!(remote = db.is_remote(), "Opened record store");

    let state = AppState::new(config, db);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("tandem-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
