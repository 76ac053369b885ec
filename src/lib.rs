//! mailrelay - forwards matching Gmail messages to WhatsApp
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Gmail push endpoint                                      │
//! │  - Rule / WhatsApp / Gmail account endpoints                │
//! │  - Admin endpoints                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Forwarding Pipeline                        │
//! │  - Notification intake (Gmail REST API)                     │
//! │  - Rule matching and template rendering                     │
//! │  - Idempotent dispatch (WhatsApp Cloud API)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Delivery ledger keyed by (email, rule)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `forwarding`: Matching, templating, dispatch and the pipeline run
//! - `mail`: Push decoding and Gmail message intake
//! - `whatsapp`: Delivery transport
//! - `data`: Database layer
//! - `auth`: Session tokens and extractors
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod forwarding;
pub mod mail;
pub mod metrics;
pub mod whatsapp;

use std::sync::Arc;

use forwarding::{DispatchPolicy, Dispatcher, Pipeline};
use mail::{GmailClient, MessageFilter, NotificationIntake};
use whatsapp::{DeliveryTransport, WhatsAppCloudClient};

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and outbound clients.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Forwarding pipeline run for each push notification
    pub pipeline: Arc<Pipeline>,

    /// WhatsApp transport, also used for test messages
    pub transport: Arc<dyn DeliveryTransport>,

    /// HTTP client for Gmail and WhatsApp
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client and provider clients
    /// 3. Assemble the forwarding pipeline
    /// 4. Ensure the bootstrap admin exists
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("mailrelay/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(
                    config.whatsapp.request_timeout_seconds,
                ))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let transport: Arc<dyn DeliveryTransport> = Arc::new(WhatsAppCloudClient::new(
            http_client.clone(),
            &config.whatsapp,
        ));
        let mail_provider = Arc::new(GmailClient::new(http_client.clone(), &config.gmail));

        // 3. Assemble the pipeline
        let intake = NotificationIntake::new(
            mail_provider,
            MessageFilter::from(&config.gmail),
            config.gmail.fetch_concurrency,
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            db.clone(),
            transport.clone(),
            DispatchPolicy::from(&config.dispatch),
        );
        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            intake,
            dispatcher,
            config.dispatch.concurrency,
        ));

        // 4. Initialize admin user
        if let Some(email) = config.auth.bootstrap_admin_email.as_deref() {
            Self::ensure_admin_user(&db, email).await?;
        }

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            pipeline,
            transport,
            http_client,
        })
    }

    /// Prune finished delivery records older than `dispatch.retention_days`.
    pub async fn sweep_delivery_records(&self) -> Result<u64, error::AppError> {
        let cutoff = chrono::Utc::now() - self.config.dispatch.retention();
        self.db.prune_delivery_attempts(cutoff).await
    }

    /// Create or promote the configured admin user
    async fn ensure_admin_user(db: &data::Database, email: &str) -> Result<(), error::AppError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Ok(());
        }

        if let Some(user) = db.get_user_by_email(&email).await? {
            if data::UserRole::parse(&user.role) != Some(data::UserRole::Admin) {
                db.update_user_role(&user.id, data::UserRole::Admin).await?;
                tracing::info!(user_id = %user.id, "Bootstrap admin promoted");
            } else {
                tracing::info!(user_id = %user.id, "Bootstrap admin exists");
            }
            return Ok(());
        }

        let now = chrono::Utc::now();
        let user = data::User {
            id: data::EntityId::new().0,
            email,
            name: None,
            role: data::UserRole::Admin.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        db.upsert_user(&user).await?;
        tracing::info!(user_id = %user.id, "Bootstrap admin created");

        Ok(())
    }
}

/// Maximum accepted request body (push envelopes are a few hundred bytes)
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower::ServiceBuilder;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api", api::api_router())
        .nest("/admin", api::admin_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer)
                .layer(CompressionLayer::new()),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    let Some(origin) = server.public_origin.as_deref() else {
        return CorsLayer::permissive();
    };

    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %origin,
                "Failed to parse server.public_origin; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
