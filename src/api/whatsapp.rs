//! WhatsApp configuration endpoints

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::Utc;

use super::dto::{TestMessageResponse, WhatsAppConfigRequest, WhatsAppConfigResponse};
use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::WhatsAppConfig;
use crate::error::AppError;
use crate::whatsapp::{TEST_MESSAGE, WhatsAppCredentials, validate_config};

/// Create WhatsApp router
///
/// Routes:
/// - GET /api/whatsapp/config - Current config (token omitted)
/// - PUT /api/whatsapp/config - Create or replace config
/// - DELETE /api/whatsapp/config - Remove config
/// - POST /api/whatsapp/test - Send a test message
pub fn whatsapp_router() -> Router<AppState> {
    Router::new()
        .route(
            "/whatsapp/config",
            get(get_config).put(put_config).delete(delete_config),
        )
        .route("/whatsapp/test", post(send_test_message))
}

/// GET /api/whatsapp/config
async fn get_config(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<Json<WhatsAppConfigResponse>, AppError> {
    let config = state
        .db
        .get_whatsapp_config(&session.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(config.into()))
}

/// PUT /api/whatsapp/config
async fn put_config(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Json(req): Json<WhatsAppConfigRequest>,
) -> Result<Json<WhatsAppConfigResponse>, AppError> {
    let access_token = match req.access_token.filter(|token| !token.trim().is_empty()) {
        Some(token) => token.trim().to_string(),
        None => state
            .db
            .get_whatsapp_config(&session.user_id)
            .await?
            .map(|existing| existing.access_token)
            .unwrap_or_default(),
    };

    let config = WhatsAppConfig {
        user_id: session.user_id.clone(),
        access_token,
        phone_number_id: req.phone_number_id.trim().to_string(),
        target_number: req.target_number.trim().to_string(),
        updated_at: Utc::now(),
    };
    validate_config(&config).map_err(AppError::Validation)?;

    state.db.upsert_whatsapp_config(&config).await?;
    tracing::info!(user_id = %session.user_id, "WhatsApp config saved");

    Ok(Json(config.into()))
}

/// DELETE /api/whatsapp/config
async fn delete_config(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<StatusCode, AppError> {
    if !state.db.delete_whatsapp_config(&session.user_id).await? {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/whatsapp/test
///
/// Sends [`TEST_MESSAGE`] once, without retries. A provider failure is
/// reported as 502 with the provider's reason.
async fn send_test_message(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<(StatusCode, Json<TestMessageResponse>), AppError> {
    let config = state
        .db
        .get_whatsapp_config(&session.user_id)
        .await?
        .ok_or_else(|| AppError::ConfigInvalid("WhatsApp is not configured".to_string()))?;
    validate_config(&config).map_err(AppError::ConfigInvalid)?;

    let credentials = WhatsAppCredentials::from(&config);
    match state
        .transport
        .send(&config.target_number, TEST_MESSAGE, &credentials)
        .await
    {
        Ok(receipt) => Ok((
            StatusCode::OK,
            Json(TestMessageResponse {
                success: true,
                message_id: receipt.message_id,
                error: None,
            }),
        )),
        Err(e) => {
            tracing::warn!(user_id = %session.user_id, error = %e, "Test message failed");
            Ok((
                StatusCode::BAD_GATEWAY,
                Json(TestMessageResponse {
                    success: false,
                    message_id: None,
                    error: Some(e.to_string()),
                }),
            ))
        }
    }
}
