//! Gmail account link and push endpoints

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;

use super::dto::{GmailAccountRequest, GmailAccountResponse};
use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::GmailAccount;
use crate::error::AppError;

/// Create Gmail router
///
/// Routes:
/// - POST /api/gmail/webhook - Pub/Sub push endpoint
/// - GET /api/gmail/account - Linked mailbox (token omitted)
/// - PUT /api/gmail/account - Store mailbox address and access token
/// - DELETE /api/gmail/account - Unlink mailbox
pub fn gmail_router() -> Router<AppState> {
    Router::new()
        .route("/gmail/webhook", post(receive_push))
        .route(
            "/gmail/account",
            get(get_account).put(put_account).delete(delete_account),
        )
}

#[derive(Debug, Deserialize)]
struct PushParams {
    token: Option<String>,
}

/// POST /api/gmail/webhook
///
/// Acknowledges immediately and runs the pipeline in the background.
/// Pub/Sub redelivers anything not acknowledged, and a redelivered
/// notification is harmless, so failures are logged rather than returned.
async fn receive_push(
    State(state): State<AppState>,
    Query(params): Query<PushParams>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if let Some(expected) = state
        .config
        .gmail
        .webhook_token
        .as_deref()
        .filter(|token| !token.is_empty())
    {
        if params.token.as_deref() != Some(expected) {
            tracing::warn!("Push notification with missing or wrong token");
            return Err(AppError::Unauthorized);
        }
    }

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        match pipeline.process_notification(&body).await {
            Ok(summary) => tracing::debug!(?summary, "Push notification handled"),
            Err(AppError::MalformedNotification(reason)) => {
                tracing::warn!(%reason, "Ignoring malformed push notification")
            }
            Err(error) => tracing::error!(%error, "Pipeline run failed"),
        }
    });

    Ok(StatusCode::OK)
}

/// GET /api/gmail/account
async fn get_account(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<Json<GmailAccountResponse>, AppError> {
    let account = state
        .db
        .get_gmail_account(&session.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(account.into()))
}

/// PUT /api/gmail/account
///
/// Called by the OAuth flow once it holds a Gmail access token.
async fn put_account(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Json(req): Json<GmailAccountRequest>,
) -> Result<Json<GmailAccountResponse>, AppError> {
    let email_address = req.email_address.trim().to_string();
    if email_address.is_empty() || !email_address.contains('@') {
        return Err(AppError::Validation(
            "A valid Gmail address is required".to_string(),
        ));
    }
    if req.access_token.trim().is_empty() {
        return Err(AppError::Validation(
            "Access token cannot be empty".to_string(),
        ));
    }

    if let Some(existing) = state.db.get_gmail_account_by_address(&email_address).await? {
        if existing.user_id != session.user_id {
            return Err(AppError::Validation(
                "Mailbox is already linked to another user".to_string(),
            ));
        }
    }

    // Relinking the same mailbox keeps its history position
    let last_history_id = state
        .db
        .get_gmail_account(&session.user_id)
        .await?
        .filter(|previous| previous.email_address.eq_ignore_ascii_case(&email_address))
        .and_then(|previous| previous.last_history_id);
    let account = GmailAccount {
        user_id: session.user_id.clone(),
        email_address,
        access_token: req.access_token.trim().to_string(),
        last_history_id,
        updated_at: Utc::now(),
    };
    state.db.upsert_gmail_account(&account).await?;
    tracing::info!(user_id = %session.user_id, mailbox = %account.email_address, "Gmail account linked");

    Ok(Json(account.into()))
}

/// DELETE /api/gmail/account
async fn delete_account(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<StatusCode, AppError> {
    if !state.db.delete_gmail_account(&session.user_id).await? {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}
