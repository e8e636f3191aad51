use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::AppState;
use waitlist_core::config::{
    catalog_file_from_env_value, data_dir_from_env_value, rest_addr_from_env_value,
};
use waitlist_core::{CoreConfig, WaitlistService};

/// Main entry point for the waitlist server
///
/// Opens the on-disk store and audit log, then serves the REST API with Swagger UI.
///
/// # Environment Variables
/// - `WAITLIST_DATA_DIR`: Directory holding the store and audit log (default: "waitlist_data")
/// - `WAITLIST_CATALOG_FILE`: Optional YAML directory of external patients, procedures,
///   specialties and physicians
/// - `WAITLIST_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
///
/// # Errors
/// Returns an error if the configuration is invalid, the store or audit log cannot be opened,
/// or the server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("waitlist_run=info".parse()?)
                .add_directive("waitlist_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(CoreConfig::new(
        data_dir_from_env_value(std::env::var("WAITLIST_DATA_DIR").ok()),
        catalog_file_from_env_value(std::env::var("WAITLIST_CATALOG_FILE").ok()),
        rest_addr_from_env_value(std::env::var("WAITLIST_REST_ADDR").ok())?,
    )?);

    let service = Arc::new(WaitlistService::from_config(&cfg)?);
    let app = api_rest::router(AppState::new(service));

    tracing::info!("++ Starting waitlist REST on {}", cfg.rest_addr());

    let listener = tokio::net::TcpListener::bind(cfg.rest_addr()).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
    }
    tracing::info!("-- Shutting down waitlist REST");
}
