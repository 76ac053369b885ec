//! Pub/Sub push envelope decoding

use serde::Deserialize;

use super::decode_base64_any;
use crate::error::AppError;

/// Mailbox change announced by a Gmail watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxNotification {
    /// Mailbox that changed
    pub email_address: String,
    /// Gmail history id at the time of the change
    pub history_id: String,
    /// Pub/Sub message id, when present
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: Option<String>,
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxChange {
    email_address: Option<String>,
    history_id: Option<serde_json::Value>,
}

/// Decode a raw push request body.
///
/// Every failure is an [`AppError::MalformedNotification`].
pub fn decode_notification(raw: &[u8]) -> Result<MailboxNotification, AppError> {
    let envelope: PushEnvelope = serde_json::from_slice(raw)
        .map_err(|e| AppError::MalformedNotification(format!("invalid envelope JSON: {e}")))?;

    let message = envelope
        .message
        .ok_or_else(|| AppError::MalformedNotification("missing message".to_string()))?;

    let data = message
        .data
        .filter(|data| !data.trim().is_empty())
        .ok_or_else(|| AppError::MalformedNotification("missing message.data".to_string()))?;

    let decoded = decode_base64_any(&data)
        .map_err(|e| AppError::MalformedNotification(format!("invalid base64 data: {e}")))?;

    let change: MailboxChange = serde_json::from_slice(&decoded)
        .map_err(|e| AppError::MalformedNotification(format!("invalid data JSON: {e}")))?;

    let email_address = change
        .email_address
        .map(|address| address.trim().to_string())
        .filter(|address| !address.is_empty())
        .ok_or_else(|| AppError::MalformedNotification("missing emailAddress".to_string()))?;

    // Gmail sends historyId as a number; tolerate strings as well.
    let history_id = match change.history_id {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => {
            return Err(AppError::MalformedNotification(
                "missing historyId".to_string(),
            ));
        }
    };

    Ok(MailboxNotification {
        email_address,
        history_id,
        message_id: message.message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    fn envelope(data: &str) -> Vec<u8> {
        serde_json::json!({
            "message": {
                "data": data,
                "messageId": "2070443601311540",
                "publishTime": "2021-02-26T19:13:55.749Z"
            },
            "subscription": "projects/myproject/subscriptions/mysubscription"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn decodes_standard_base64_payload() {
        let data = STANDARD.encode(r#"{"emailAddress":"user@example.com","historyId":9876543210}"#);
        let notification = decode_notification(&envelope(&data)).unwrap();
        assert_eq!(notification.email_address, "user@example.com");
        assert_eq!(notification.history_id, "9876543210");
        assert_eq!(notification.message_id.as_deref(), Some("2070443601311540"));
    }

    #[test]
    fn decodes_url_safe_base64_payload() {
        let data = URL_SAFE_NO_PAD.encode(r#"{"emailAddress":"user@example.com","historyId":"42"}"#);
        let notification = decode_notification(&envelope(&data)).unwrap();
        assert_eq!(notification.history_id, "42");
    }

    #[test]
    fn rejects_invalid_envelopes() {
        let cases: Vec<Vec<u8>> = vec![
            b"not json".to_vec(),
            b"{}".to_vec(),
            br#"{"message":{}}"#.to_vec(),
            envelope("%%%not-base64%%%"),
            envelope(&STANDARD.encode("not json")),
            envelope(&STANDARD.encode(r#"{"historyId":1}"#)),
            envelope(&STANDARD.encode(r#"{"emailAddress":"  ","historyId":1}"#)),
            envelope(&STANDARD.encode(r#"{"emailAddress":"user@example.com"}"#)),
        ];
        for raw in cases {
            let result = decode_notification(&raw);
            assert!(
                matches!(result, Err(AppError::MalformedNotification(_))),
                "expected malformed for {:?}",
                String::from_utf8_lossy(&raw)
            );
        }
    }
}
