//! API request and response DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{DeliveryAttempt, ForwardingRule, GmailAccount, User, WhatsAppConfig};

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Latest delivery recorded for a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub email_id: String,
    /// "pending", "sent", "failed_retryable" or "failed_permanent"
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryAttempt> for DeliveryResponse {
    fn from(attempt: DeliveryAttempt) -> Self {
        Self {
            email_id: attempt.email_id,
            status: attempt.status.as_str().to_string(),
            attempt_count: attempt.attempt_count,
            last_error: attempt.last_error,
            provider_message_id: attempt.provider_message_id,
            updated_at: attempt.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResponse {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    pub subject_filter: String,
    pub message_template: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_delivery: Option<DeliveryResponse>,
}

impl RuleResponse {
    pub fn new(rule: ForwardingRule, last_delivery: Option<DeliveryAttempt>) -> Self {
        Self {
            id: rule.id,
            owner_user_id: rule.owner_user_id,
            name: rule.name,
            subject_filter: rule.subject_filter,
            message_template: rule.message_template,
            is_active: rule.is_active,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
            last_delivery: last_delivery.map(DeliveryResponse::from),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub subject_filter: String,
    /// Defaults to the standard "New email received" template
    pub message_template: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub subject_filter: Option<String>,
    pub message_template: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RuleStatusRequest {
    pub is_active: bool,
}

// =============================================================================
// WhatsApp
// =============================================================================

/// WhatsApp settings without the access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfigResponse {
    pub phone_number_id: String,
    pub target_number: String,
    pub has_access_token: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<WhatsAppConfig> for WhatsAppConfigResponse {
    fn from(config: WhatsAppConfig) -> Self {
        Self {
            phone_number_id: config.phone_number_id,
            target_number: config.target_number,
            has_access_token: !config.access_token.is_empty(),
            updated_at: config.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppConfigRequest {
    /// May be omitted to keep the stored token
    pub access_token: Option<String>,
    pub phone_number_id: String,
    pub target_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMessageResponse {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

// =============================================================================
// Gmail
// =============================================================================

/// Linked mailbox without the access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailAccountResponse {
    pub email_address: String,
    pub last_history_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<GmailAccount> for GmailAccountResponse {
    fn from(account: GmailAccount) -> Self {
        Self {
            email_address: account.email_address,
            last_history_id: account.last_history_id,
            updated_at: account.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GmailAccountRequest {
    pub email_address: String,
    pub access_token: String,
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: Option<String>,
    /// Defaults to "user"
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: String,
}
