//! WhatsApp config validation

use lazy_static::lazy_static;
use regex::Regex;

use crate::data::WhatsAppConfig;

lazy_static! {
    static ref E164: Regex = Regex::new(r"^\+[1-9][0-9]{1,14}$").expect("E.164 pattern compiles");
}

/// Whether `number` is an E.164 phone number such as "+15551234567"
pub fn is_valid_e164(number: &str) -> bool {
    E164.is_match(number)
}

/// Check that a config has everything needed to send.
///
/// Returns a human-readable reason on failure; never includes the token.
pub fn validate_config(config: &WhatsAppConfig) -> Result<(), String> {
    let mut missing = Vec::new();
    if config.access_token.trim().is_empty() {
        missing.push("access token");
    }
    if config.phone_number_id.trim().is_empty() {
        missing.push("phone number ID");
    }
    if config.target_number.trim().is_empty() {
        missing.push("target number");
    }
    if !missing.is_empty() {
        return Err(format!("WhatsApp config is missing {}", missing.join(", ")));
    }

    if !config.phone_number_id.chars().all(|c| c.is_ascii_digit()) {
        return Err("WhatsApp phone number ID must be numeric".to_string());
    }

    if !is_valid_e164(&config.target_number) {
        return Err(format!(
            "WhatsApp target number '{}' is not in E.164 format",
            config.target_number
        ));
    }

    Ok(())
}
