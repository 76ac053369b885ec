//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub gmail: GmailConfig,
    pub whatsapp: WhatsAppApiConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Dashboard origin allowed for cross-origin requests; any origin when unset
    #[serde(default)]
    pub public_origin: Option<String>,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Session token verification
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret shared with the session issuer (32+ bytes)
    pub session_secret: String,
    /// User created (or promoted) as admin on startup
    #[serde(default)]
    pub bootstrap_admin_email: Option<String>,
}

/// Gmail REST API access
#[derive(Debug, Clone, Deserialize)]
pub struct GmailConfig {
    /// API root, e.g. "https://gmail.googleapis.com"
    pub api_base_url: String,
    /// Search query used to list candidate messages
    pub query: String,
    /// Page size for message listing
    pub max_results: u32,
    /// Concurrent message fetches per notification
    pub fetch_concurrency: usize,
    /// Shared token expected as `?token=` on the push endpoint
    pub webhook_token: Option<String>,
    /// Only mail received in the last N days is listed (`newer_than:Nd`)
    pub listing_window_days: u32,
}

/// WhatsApp Cloud API access
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppApiConfig {
    /// Graph API root, e.g. "https://graph.facebook.com"
    pub api_base_url: String,
    /// Graph API version segment
    pub api_version: String,
    /// HTTP client timeout for Graph API calls
    pub request_timeout_seconds: u64,
}

/// Dispatch retry and concurrency policy
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Transport attempts per (email, rule) before giving up
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff delay
    pub max_backoff_ms: u64,
    /// Timeout applied to each transport call
    pub transport_timeout_seconds: u64,
    /// How long a claimed delivery stays owned by a run
    pub lease_seconds: u64,
    /// Concurrent dispatches per notification
    pub concurrency: usize,
    /// Body characters kept when rendering a message
    pub max_body_chars: usize,
    /// Finished delivery records older than this are pruned
    pub retention_days: u32,
    /// How often the retention sweep runs
    pub retention_sweep_seconds: u64,
}

impl DispatchConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_seconds)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_seconds)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            transport_timeout_seconds: 10,
            lease_seconds: 300,
            concurrency: 4,
            max_body_chars: crate::forwarding::template::DEFAULT_MAX_BODY_CHARS,
            retention_days: 30,
            retention_sweep_seconds: 3_600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (MAILRELAY_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/mailrelay.db")?
            .set_default("gmail.api_base_url", "https://gmail.googleapis.com")?
            .set_default("gmail.query", "is:unread")?
            .set_default("gmail.max_results", 10)?
            .set_default("gmail.fetch_concurrency", 4)?
            .set_default("gmail.listing_window_days", 7)?
            .set_default("whatsapp.api_base_url", "https://graph.facebook.com")?
            .set_default("whatsapp.api_version", "v18.0")?
            .set_default("whatsapp.request_timeout_seconds", 10)?
            .set_default("dispatch.max_attempts", 3)?
            .set_default("dispatch.initial_backoff_ms", 500)?
            .set_default("dispatch.max_backoff_ms", 8000)?
            .set_default("dispatch.transport_timeout_seconds", 10)?
            .set_default("dispatch.lease_seconds", 300)?
            .set_default("dispatch.concurrency", 4)?
            .set_default("dispatch.max_body_chars", 500)?
            .set_default("dispatch.retention_days", 30)?
            .set_default("dispatch.retention_sweep_seconds", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (MAILRELAY_*)
            .add_source(
                Environment::with_prefix("MAILRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        const MIN_SESSION_SECRET_BYTES: usize = 32;

        if self.auth.session_secret.as_bytes().len() < MIN_SESSION_SECRET_BYTES {
            return Err(AppError::Config(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SESSION_SECRET_BYTES
            )));
        }

        for (key, value) in [
            ("gmail.api_base_url", &self.gmail.api_base_url),
            ("whatsapp.api_base_url", &self.whatsapp.api_base_url),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(AppError::Config(format!("{key} must be an absolute URL")));
            }
        }

        if !(1..=500).contains(&self.gmail.max_results) {
            return Err(AppError::Config(
                "gmail.max_results must be between 1 and 500".to_string(),
            ));
        }

        if self.gmail.fetch_concurrency == 0 || self.dispatch.concurrency == 0 {
            return Err(AppError::Config(
                "gmail.fetch_concurrency and dispatch.concurrency must be greater than 0"
                    .to_string(),
            ));
        }

        if self.dispatch.max_attempts == 0 {
            return Err(AppError::Config(
                "dispatch.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.max_backoff_ms < self.dispatch.initial_backoff_ms {
            return Err(AppError::Config(
                "dispatch.max_backoff_ms must not be less than dispatch.initial_backoff_ms"
                    .to_string(),
            ));
        }

        if self.dispatch.transport_timeout_seconds == 0 {
            return Err(AppError::Config(
                "dispatch.transport_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        // A lease shorter than one full retry cycle would let a second run
        // reclaim a delivery that is still being retried.
        let retry_cycle_ms = u64::from(self.dispatch.max_attempts)
            * (self.dispatch.transport_timeout_seconds * 1_000 + self.dispatch.max_backoff_ms);
        if self.dispatch.lease_seconds * 1_000 < retry_cycle_ms {
            return Err(AppError::Config(format!(
                "dispatch.lease_seconds must cover a full retry cycle ({} ms)",
                retry_cycle_ms
            )));
        }

        if self.gmail.listing_window_days == 0 {
            return Err(AppError::Config(
                "gmail.listing_window_days must be greater than 0".to_string(),
            ));
        }

        // Pruning a record for mail that can still be listed would resend it.
        if self.dispatch.retention_days <= self.gmail.listing_window_days {
            return Err(AppError::Config(
                "dispatch.retention_days must exceed gmail.listing_window_days".to_string(),
            ));
        }

        if self.dispatch.retention_sweep_seconds == 0 {
            return Err(AppError::Config(
                "dispatch.retention_sweep_seconds must be greater than 0".to_string(),
            ));
        }

        if self.gmail.webhook_token.as_deref() == Some("") {
            tracing::warn!("gmail.webhook_token is empty; push endpoint is unauthenticated");
        }

        Ok(())
    }
}
