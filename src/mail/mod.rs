//! Mail intake
//!
//! Turns Gmail push notifications into normalized [`Email`] values:
//! - Decoding Pub/Sub push envelopes
//! - Listing and fetching messages through [`MailProvider`]
//! - Extracting subject, sender and a plain-text body

mod gmail;
mod intake;
mod notification;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[cfg(test)]
pub use gmail::MockMailProvider;
pub use gmail::{
    GmailClient, MailProvider, MessageFilter, MessageHeader, MessagePart, PartBody, RawMessage,
};
pub use intake::{FetchFailure, IntakeBatch, MAX_BODY_BYTES, NotificationIntake};
pub use notification::{MailboxNotification, decode_notification};

/// A normalized inbound email
///
/// Only the fields rules and templates need. `id` is the provider's
/// message id and is stable across notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Email {
    pub id: String,
    pub subject: String,
    /// Raw `From` header, e.g. `"Ops <ops@x.com>"`
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Decode base64 in either the standard or URL-safe alphabet, padding optional
pub(crate) fn decode_base64_any(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let data = data.trim();
    STANDARD_LENIENT
        .decode(data)
        .or_else(|_| URL_SAFE_LENIENT.decode(data))
}

/// Decode Gmail body data (base64url, padding optional)
pub(crate) fn decode_base64url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_LENIENT.decode(data.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_alphabets_with_or_without_padding() {
        // "??>" encodes to "Pz8+" (standard) and "Pz8-" (url-safe)
        assert_eq!(decode_base64_any("Pz8+").unwrap(), b"??>");
        assert_eq!(decode_base64_any("Pz8-").unwrap(), b"??>");
        assert_eq!(decode_base64_any("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64_any("aGk").unwrap(), b"hi");
    }

    #[test]
    fn rejects_non_base64() {
        assert!(decode_base64_any("not base64!").is_err());
        assert!(decode_base64url("Pz8+").is_err());
    }
}
