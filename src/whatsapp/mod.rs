//! WhatsApp delivery transport
//!
//! Handles:
//! - Sending text messages through the WhatsApp Cloud API
//! - Classifying send failures as transient or permanent
//! - Validating per-user WhatsApp configs

mod client;
mod validation;

#[cfg(test)]
pub use client::MockDeliveryTransport;
pub use client::{
    DeliveryReceipt, DeliveryTransport, TEST_MESSAGE, TransportError, WhatsAppCloudClient,
    WhatsAppCredentials,
};
pub use validation::{is_valid_e164, validate_config};
