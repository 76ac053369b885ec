//! mailrelay binary entry point

use mailrelay::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("MAILRELAY__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "mailrelay=info,tower_http=debug".into())
    };

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting mailrelay...");

    // 2. Initialize metrics
    mailrelay::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        database = %config.database.path.display(),
        gmail_api = %config.gmail.api_base_url,
        whatsapp_api = %config.whatsapp.api_base_url,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    spawn_retention_task(state.clone());

    // 5. Build Axum router
    let app = mailrelay::build_router(state);

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Spawn background sweep of old delivery records
fn spawn_retention_task(state: AppState) {
    let retention_days = state.config.dispatch.retention_days;

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(state.config.dispatch.retention_sweep_interval());

        loop {
            interval.tick().await;

            match state.sweep_delivery_records().await {
                Ok(0) => tracing::debug!("No delivery records to prune"),
                Ok(removed) => tracing::info!(removed, "Pruned old delivery records"),
                Err(error) => tracing::error!(%error, "Delivery record sweep failed"),
            }
        }
    });

    tracing::info!(retention_days, "Retention task spawned");
}

/// Resolve on Ctrl-C so in-flight pipeline runs get a chance to finish
async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
