//! Gmail REST API client

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GmailConfig;
use crate::data::GmailAccount;
use crate::error::AppError;

/// Message listing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    /// Gmail search query, e.g. "is:unread newer_than:7d"
    pub query: String,
    pub max_results: u32,
}

impl From<&GmailConfig> for MessageFilter {
    /// The configured query, bounded to the listing window.
    ///
    /// Delivery records are pruned only after they fall out of this window.
    fn from(config: &GmailConfig) -> Self {
        let window = format!("newer_than:{}d", config.listing_window_days);
        let query = match config.query.trim() {
            "" => window,
            query => format!("{query} {window}"),
        };
        Self {
            query,
            max_results: config.max_results,
        }
    }
}

/// A message as returned by `users.messages.get?format=full`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    /// Milliseconds since the epoch, as a decimal string
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
}

/// One MIME part; the top-level payload is itself a part
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Encoded part content
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartBody {
    /// base64url data
    #[serde(default)]
    pub data: Option<String>,
}

impl MessagePart {
    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Encoded body data, when non-empty
    pub fn data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.data.as_deref())
            .filter(|data| !data.is_empty())
    }
}

/// Source of mailbox messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Ids of messages matching `filter`, newest first.
    async fn list_recent_messages(
        &self,
        account: &GmailAccount,
        filter: &MessageFilter,
    ) -> Result<Vec<String>, AppError>;

    /// Full message content.
    async fn get_message(
        &self,
        account: &GmailAccount,
        message_id: &str,
    ) -> Result<RawMessage, AppError>;
}

/// [`MailProvider`] over the Gmail REST API
pub struct GmailClient {
    http_client: Arc<reqwest::Client>,
    api_base_url: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

impl GmailClient {
    pub fn new(http_client: Arc<reqwest::Client>, config: &GmailConfig) -> Self {
        Self {
            http_client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/me/messages", self.api_base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, AppError> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::ProviderFetch(format!("{what}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::ProviderFetch(format!(
                "{what}: Gmail API returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::ProviderFetch(format!("{what}: invalid response: {e}")))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_recent_messages(
        &self,
        account: &GmailAccount,
        filter: &MessageFilter,
    ) -> Result<Vec<String>, AppError> {
        let request = self
            .http_client
            .get(self.messages_url())
            .bearer_auth(&account.access_token)
            .query(&[
                ("q", filter.query.clone()),
                ("maxResults", filter.max_results.to_string()),
            ]);

        let listing: ListResponse = self.get_json(request, "list messages").await?;
        Ok(listing.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(
        &self,
        account: &GmailAccount,
        message_id: &str,
    ) -> Result<RawMessage, AppError> {
        let request = self
            .http_client
            .get(format!("{}/{}", self.messages_url(), message_id))
            .bearer_auth(&account.access_token)
            .query(&[("format", "full")]);

        self.get_json(request, &format!("get message {message_id}"))
            .await
    }
}
