//! Notification intake
//!
//! Lists candidate messages for a mailbox, fetches them with bounded
//! concurrency and normalizes each into an [`Email`]. One bad message
//! never sinks the batch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use super::gmail::{MailProvider, MessageFilter, MessagePart, RawMessage};
use super::{Email, decode_base64url};
use crate::data::GmailAccount;
use crate::error::AppError;
use crate::metrics::{EMAIL_FETCH_FAILURES_TOTAL, EMAILS_FETCHED_TOTAL};

/// Bodies are cut to this many bytes (at a char boundary) on intake
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// A message that could not be fetched or decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub message_id: String,
    pub reason: String,
}

/// Result of one intake run
#[derive(Debug, Default)]
pub struct IntakeBatch {
    /// Normalized emails in listing order
    pub emails: Vec<Email>,
    pub failures: Vec<FetchFailure>,
}

/// Fetches and normalizes new mail for one account
pub struct NotificationIntake {
    provider: Arc<dyn MailProvider>,
    filter: MessageFilter,
    fetch_concurrency: usize,
}

impl NotificationIntake {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        filter: MessageFilter,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            filter,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// List and fetch candidate messages for `account`.
    ///
    /// # Errors
    /// A listing failure is an [`AppError::ProviderFetch`]; per-message
    /// failures are collected in [`IntakeBatch::failures`] instead.
    pub async fn intake(&self, account: &GmailAccount) -> Result<IntakeBatch, AppError> {
        let ids = self
            .provider
            .list_recent_messages(account, &self.filter)
            .await
            .map_err(|e| match e {
                AppError::ProviderFetch(_) => e,
                other => AppError::ProviderFetch(other.to_string()),
            })?;

        tracing::debug!(
            mailbox = %account.email_address,
            candidates = ids.len(),
            "Listed candidate messages"
        );

        let provider = &self.provider;
        let results: Vec<(String, Result<Email, AppError>)> = stream::iter(ids)
            .map(|id| async move {
                let result = provider
                    .get_message(account, &id)
                    .await
                    .and_then(normalize);
                (id, result)
            })
            .buffered(self.fetch_concurrency)
            .collect()
            .await;

        let mut batch = IntakeBatch::default();
        for (message_id, result) in results {
            match result {
                Ok(email) => {
                    EMAILS_FETCHED_TOTAL.inc();
                    batch.emails.push(email);
                }
                Err(e) => {
                    EMAIL_FETCH_FAILURES_TOTAL.inc();
                    tracing::warn!(
                        mailbox = %account.email_address,
                        message_id = %message_id,
                        error = %e,
                        "Failed to fetch message"
                    );
                    batch.failures.push(FetchFailure {
                        message_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }
}

/// Normalize a raw provider message.
pub(crate) fn normalize(message: RawMessage) -> Result<Email, AppError> {
    let payload = &message.payload;
    let subject = payload.header("Subject").unwrap_or_default().trim().to_string();
    let sender = payload.header("From").unwrap_or_default().trim().to_string();
    let body = extract_body(payload)
        .map_err(|reason| AppError::ProviderFetch(format!("message {}: {reason}", message.id)))?;

    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Email {
        id: message.id,
        subject,
        sender,
        body: cap_body(body),
        received_at,
    })
}

/// First `text/plain` part, else first `text/html` part as text, else the
/// top-level body.
fn extract_body(payload: &MessagePart) -> Result<String, String> {
    if let Some(data) = find_part(payload, "text/plain") {
        return decode_text(data);
    }
    if let Some(data) = find_part(payload, "text/html") {
        return decode_text(data).map(|html| html_to_text(&html));
    }
    match payload.data() {
        Some(data) if payload.mime_type.eq_ignore_ascii_case("text/html") => {
            decode_text(data).map(|html| html_to_text(&html))
        }
        Some(data) => decode_text(data),
        None => Ok(String::new()),
    }
}

/// Depth-first search for a part with data and the given MIME type
fn find_part<'a>(part: &'a MessagePart, mime_type: &str) -> Option<&'a str> {
    part.parts.iter().find_map(|child| {
        if child.mime_type.eq_ignore_ascii_case(mime_type) {
            if let Some(data) = child.data() {
                return Some(data);
            }
        }
        find_part(child, mime_type)
    })
}

fn decode_text(data: &str) -> Result<String, String> {
    let bytes = decode_base64url(data).map_err(|e| format!("invalid body encoding: {e}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Strip markup and decode entities.
fn html_to_text(html: &str) -> String {
    let stripped = ammonia::Builder::default()
        .tags(HashSet::new())
        .clean(html)
        .to_string();
    let decoded = html_escape::decode_html_entities(&stripped);
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn cap_body(mut body: String) -> String {
    if body.len() > MAX_BODY_BYTES {
        let mut end = MAX_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
