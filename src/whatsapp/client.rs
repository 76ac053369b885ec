//! WhatsApp Cloud API delivery
//!
//! Sends text messages through `POST /{version}/{phone_number_id}/messages`
//! and classifies failures as transient (worth retrying) or permanent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::WhatsAppApiConfig;
use crate::data::WhatsAppConfig;

/// Body of the message sent by the "test configuration" endpoint
pub const TEST_MESSAGE: &str =
    "🧪 Test message from Gmail-WhatsApp Forwarder\n\nYour configuration is working correctly!";

/// Sender credentials for one Graph API call
#[derive(Clone)]
pub struct WhatsAppCredentials {
    pub access_token: String,
    pub phone_number_id: String,
}

impl fmt::Debug for WhatsAppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppCredentials")
            .field("access_token", &"[REDACTED]")
            .field("phone_number_id", &self.phone_number_id)
            .finish()
    }
}

impl From<&WhatsAppConfig> for WhatsAppCredentials {
    fn from(config: &WhatsAppConfig) -> Self {
        Self {
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
        }
    }
}

/// Successful send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// `wamid.*` identifier assigned by WhatsApp, when returned
    pub message_id: Option<String>,
}

/// Failed send, split by whether a retry can help
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network error, timeout, rate limit or server error
    #[error("{detail}")]
    Transient {
        detail: String,
        /// Provider-requested delay before retrying
        retry_after: Option<Duration>,
    },
    /// Rejected request or credentials
    #[error("{detail}")]
    Permanent { detail: String },
}

impl TransportError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient {
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Permanent {
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Outbound message delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Send `message_text` to `target_number` using `credentials`.
    async fn send(
        &self,
        target_number: &str,
        message_text: &str,
        credentials: &WhatsAppCredentials,
    ) -> Result<DeliveryReceipt, TransportError>;
}

/// Graph API client
pub struct WhatsAppCloudClient {
    http_client: Arc<reqwest::Client>,
    api_base_url: String,
    api_version: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

impl WhatsAppCloudClient {
    pub fn new(http_client: Arc<reqwest::Client>, config: &WhatsAppApiConfig) -> Self {
        Self {
            http_client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        }
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!(
            "{}/{}/{}/messages",
            self.api_base_url, self.api_version, phone_number_id
        )
    }
}

#[async_trait]
impl DeliveryTransport for WhatsAppCloudClient {
    async fn send(
        &self,
        target_number: &str,
        message_text: &str,
        credentials: &WhatsAppCredentials,
    ) -> Result<DeliveryReceipt, TransportError> {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": target_number,
            "type": "text",
            "text": {
                "body": message_text,
            },
        });

        let response = self
            .http_client
            .post(self.messages_url(&credentials.phone_number_id))
            .bearer_auth(&credentials.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        // A 2xx without a parsable body still means WhatsApp accepted it.
        let message_id = response
            .json::<SendResponse>()
            .await
            .ok()
            .and_then(|body| body.messages.into_iter().next())
            .map(|message| message.id);

        tracing::debug!(
            phone_number_id = %credentials.phone_number_id,
            message_id = ?message_id,
            "WhatsApp message accepted"
        );

        Ok(DeliveryReceipt { message_id })
    }
}

fn classify_request_error(error: &reqwest::Error) -> TransportError {
    if error.is_builder() {
        return TransportError::permanent(format!("invalid WhatsApp request: {error}"));
    }
    if error.is_timeout() {
        return TransportError::transient("WhatsApp API request timed out");
    }
    TransportError::transient(format!("WhatsApp API unreachable: {error}"))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-2xx Graph API response to a transport error
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TransportError {
    let reason = serde_json::from_str::<GraphErrorBody>(body)
        .map(|parsed| match parsed.error.code {
            Some(code) => format!("{} (code {})", parsed.error.message, code),
            None => parsed.error.message,
        })
        .unwrap_or_else(|_| body.chars().take(200).collect());

    let detail = if reason.is_empty() {
        format!("WhatsApp API returned HTTP {}", status.as_u16())
    } else {
        format!("WhatsApp API returned HTTP {}: {}", status.as_u16(), reason)
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransportError::Transient {
            detail,
            retry_after,
        }
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransportError::permanent(format!("WhatsApp credentials rejected: {detail}"))
    } else {
        TransportError::permanent(detail)
    }
}
