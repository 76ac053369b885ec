//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Users
// =============================================================================

/// A registered user
///
/// Created by the external auth service (or an admin); owns rules,
/// a WhatsApp config and a linked Gmail account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    /// "user" or "admin"
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

// =============================================================================
// Gmail account link
// =============================================================================

/// Mailbox watched for push notifications
///
/// Tokens are written by the OAuth collaborator; the pipeline only reads.
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GmailAccount {
    pub user_id: String,
    /// Mailbox address named by push notifications
    pub email_address: String,
    /// OAuth access token for the Gmail API
    pub access_token: String,
    /// Last history ID seen in a push notification.
    ///
    /// Shown on `GET /api/gmail/account` so operators can tell whether
    /// pushes are arriving. Intake lists by query and does not read it.
    pub last_history_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for GmailAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailAccount")
            .field("user_id", &self.user_id)
            .field("email_address", &self.email_address)
            .field("access_token", &"[REDACTED]")
            .field("last_history_id", &self.last_history_id)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// =============================================================================
// Forwarding rules
// =============================================================================

/// Subject filter + message template owned by one user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ForwardingRule {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    /// Case-insensitive substring matched against the subject
    pub subject_filter: String,
    /// Text with `{subject}`, `{from}` and `{body}` placeholders
    pub message_template: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// WhatsApp configuration
// =============================================================================

/// WhatsApp Business credentials and destination for one user
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WhatsAppConfig {
    pub user_id: String,
    /// Graph API access token
    pub access_token: String,
    /// Business phone number ID used as the sender
    pub phone_number_id: String,
    /// Destination number in E.164 format
    pub target_number: String,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for WhatsAppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppConfig")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("phone_number_id", &self.phone_number_id)
            .field("target_number", &self.target_number)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// =============================================================================
// Delivery attempts
// =============================================================================

/// Outcome of dispatching one email for one rule
///
/// Keyed by `(email_id, rule_id)`; at most one row per key ever reaches
/// `Sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub email_id: String,
    pub rule_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    /// Message ID returned by the transport on success
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    FailedRetryable,
    FailedPermanent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// No further transport call will be made for this key
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::FailedPermanent)
    }
}

/// Result of trying to claim a delivery key
#[derive(Debug, Clone)]
pub enum DeliveryClaim {
    /// This caller owns the key and must dispatch
    Acquired(DeliveryAttempt),
    /// The key was already handled or is owned by another run
    Held(DeliveryAttempt),
}

// =============================================================================
// Admin statistics
// =============================================================================

/// Aggregate counts for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub total_users: i64,
    pub total_rules: i64,
    pub active_rules: i64,
    /// Users created in the last 7 days
    pub recent_signups: i64,
    pub deliveries_sent: i64,
    pub deliveries_failed: i64,
}
