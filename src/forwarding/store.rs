//! Store seams used by the pipeline
//!
//! The pipeline never touches SQL directly: it reads rules and configs
//! through [`RuleStore`] and records delivery outcomes through
//! [`DeliveryLedger`]. [`Database`] implements both.

use std::time::Duration;

use async_trait::async_trait;

use crate::data::{
    Database, DeliveryAttempt, DeliveryClaim, ForwardingRule, GmailAccount, WhatsAppConfig,
};
use crate::error::AppError;

/// Read-only access to rules and per-user delivery settings
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules ordered by `created_at` ascending.
    ///
    /// Any failure is a [`AppError::StoreUnavailable`].
    async fn load_active_rules(
        &self,
        owner_user_id: Option<&str>,
    ) -> Result<Vec<ForwardingRule>, AppError>;

    async fn whatsapp_config(&self, user_id: &str) -> Result<Option<WhatsAppConfig>, AppError>;

    async fn gmail_account_by_address(
        &self,
        email_address: &str,
    ) -> Result<Option<GmailAccount>, AppError>;

    async fn record_history_id(&self, user_id: &str, history_id: &str) -> Result<(), AppError>;
}

/// Idempotency record keyed by `(email_id, rule_id)`
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Atomically take ownership of a key, or report who has it.
    async fn claim(
        &self,
        email_id: &str,
        rule_id: &str,
        lease: Duration,
    ) -> Result<DeliveryClaim, AppError>;

    /// Persist progress on an owned key, extending the lease unless terminal.
    async fn record(&self, attempt: &DeliveryAttempt, lease: Duration) -> Result<(), AppError>;

    /// Persist a non-terminal state and let other runs reclaim the key now.
    async fn release(&self, attempt: &DeliveryAttempt) -> Result<(), AppError>;
}

#[async_trait]
impl RuleStore for Database {
    async fn load_active_rules(
        &self,
        owner_user_id: Option<&str>,
    ) -> Result<Vec<ForwardingRule>, AppError> {
        self.list_active_rules(owner_user_id)
            .await
            .map_err(AppError::into_store_unavailable)
    }

    async fn whatsapp_config(&self, user_id: &str) -> Result<Option<WhatsAppConfig>, AppError> {
        self.get_whatsapp_config(user_id)
            .await
            .map_err(AppError::into_store_unavailable)
    }

    async fn gmail_account_by_address(
        &self,
        email_address: &str,
    ) -> Result<Option<GmailAccount>, AppError> {
        self.get_gmail_account_by_address(email_address)
            .await
            .map_err(AppError::into_store_unavailable)
    }

    async fn record_history_id(&self, user_id: &str, history_id: &str) -> Result<(), AppError> {
        self.update_gmail_history_id(user_id, history_id).await
    }
}

#[async_trait]
impl DeliveryLedger for Database {
    async fn claim(
        &self,
        email_id: &str,
        rule_id: &str,
        lease: Duration,
    ) -> Result<DeliveryClaim, AppError> {
        self.claim_delivery_attempt(email_id, rule_id, lease).await
    }

    async fn record(&self, attempt: &DeliveryAttempt, lease: Duration) -> Result<(), AppError> {
        self.record_delivery_attempt(attempt, lease).await
    }

    async fn release(&self, attempt: &DeliveryAttempt) -> Result<(), AppError> {
        self.release_delivery_attempt(attempt).await
    }
}
