//! Session tokens
//!
//! HMAC-signed bearer tokens issued by the sign-in service, which shares
//! `auth.session_secret` with us. No server-side session storage needed.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::data::UserRole;
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Signed session claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// `users.id` of the signed-in user
    pub user_id: String,
    pub email: String,
    /// "user" or "admin"
    pub role: String,
    /// When session was created
    pub created_at: DateTime<Utc>,
    /// When session expires
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Check if session is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_admin(&self) -> bool {
        UserRole::parse(&self.role) == Some(UserRole::Admin)
    }
}

fn sign(payload_b64: &str, secret: &str) -> Result<HmacSha256, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    mac.update(payload_b64.as_bytes());
    Ok(mac)
}

/// Create a signed session token
///
/// Token format: base64(payload).base64(hmac_sha256(payload))
pub fn create_session_token(session: &Session, secret: &str) -> Result<String, AppError> {
    let payload = serde_json::to_string(session).map_err(|e| AppError::Internal(e.into()))?;
    let payload_b64 = general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes());

    let signature = sign(&payload_b64, secret)?.finalize().into_bytes();
    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{}.{}", payload_b64, signature_b64))
}

/// Verify and decode a session token
///
/// # Errors
/// - [`AppError::InvalidSignature`] if the signature does not match
/// - [`AppError::Unauthorized`] if the token is malformed or expired
pub fn verify_session_token(token: &str, secret: &str) -> Result<Session, AppError> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(AppError::Unauthorized)?;
    if signature_b64.contains('.') {
        return Err(AppError::Unauthorized);
    }

    let signature = general_purpose::URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AppError::Unauthorized)?;
    sign(payload_b64, secret)?
        .verify_slice(&signature)
        .map_err(|_| AppError::InvalidSignature)?;

    let payload = general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Unauthorized)?;
    let session: Session =
        serde_json::from_slice(&payload).map_err(|_| AppError::Unauthorized)?;

    if session.is_expired() {
        return Err(AppError::Unauthorized);
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn session(role: &str, ttl: Duration) -> Session {
        let now = Utc::now();
        Session {
            user_id: "01HZX0000000000000000000AA".to_string(),
            email: "alice@example.com".to_string(),
            role: role.to_string(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    #[test]
    fn token_round_trip() {
        let token = create_session_token(&session("admin", Duration::hours(1)), SECRET).unwrap();
        let verified = verify_session_token(&token, SECRET).unwrap();
        assert_eq!(verified.email, "alice@example.com");
        assert!(verified.is_admin());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_session_token(&session("user", Duration::hours(1)), SECRET).unwrap();
        let result = verify_session_token(&token, "another-secret-another-secret-xx");
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = create_session_token(&session("user", Duration::hours(1)), SECRET).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged_payload = general_purpose::URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&session("admin", Duration::hours(1))).unwrap(),
        );
        let forged = format!("{forged_payload}.{signature}");
        assert!(verify_session_token(&forged, SECRET).is_err());
    }

    #[test]
    fn expired_and_malformed_tokens_are_rejected() {
        let token = create_session_token(&session("user", Duration::hours(-1)), SECRET).unwrap();
        assert!(matches!(
            verify_session_token(&token, SECRET),
            Err(AppError::Unauthorized)
        ));
        assert!(verify_session_token("no-dot", SECRET).is_err());
        assert!(verify_session_token("a.b.c", SECRET).is_err());
    }

    #[test]
    fn unknown_role_is_not_admin() {
        assert!(!session("root", Duration::hours(1)).is_admin());
        assert!(!session("user", Duration::hours(1)).is_admin());
    }
}
