//! Forwarding rule endpoints
//!
//! Users only ever see and modify their own rules; someone else's rule
//! id is reported as not found.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch},
};
use chrono::Utc;

use super::dto::{CreateRuleRequest, RuleResponse, RuleStatusRequest, UpdateRuleRequest};
use crate::AppState;
use crate::auth::{CurrentUser, Session};
use crate::data::{EntityId, ForwardingRule};
use crate::error::AppError;
use crate::forwarding::template::{DEFAULT_MESSAGE_TEMPLATE, validate_template};

/// Create rules router
///
/// Routes:
/// - GET /api/rules - List own rules with their latest delivery
/// - POST /api/rules - Create rule
/// - GET /api/rules/:id - Get rule
/// - PATCH /api/rules/:id - Update rule
/// - DELETE /api/rules/:id - Delete rule
/// - PATCH /api/rules/:id/status - Activate or deactivate rule
pub fn rules_router() -> Router<AppState> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/:id",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/rules/:id/status", patch(set_rule_status))
}

/// Check rule fields before they reach the store.
pub(crate) fn validate_rule(rule: &ForwardingRule) -> Result<(), AppError> {
    if rule.name.trim().is_empty() {
        return Err(AppError::Validation("Rule name cannot be empty".to_string()));
    }
    if rule.subject_filter.trim().is_empty() {
        return Err(AppError::Validation(
            "Subject filter cannot be empty".to_string(),
        ));
    }
    if rule.message_template.trim().is_empty() {
        return Err(AppError::Validation(
            "Message template cannot be empty".to_string(),
        ));
    }
    validate_template(&rule.message_template)
        .map_err(|e| AppError::Validation(format!("Invalid message template: {e}")))
}

pub(crate) async fn rule_response(
    state: &AppState,
    rule: ForwardingRule,
) -> Result<RuleResponse, AppError> {
    let last_delivery = state.db.latest_delivery_for_rule(&rule.id).await?;
    Ok(RuleResponse::new(rule, last_delivery))
}

async fn owned_rule(state: &AppState, session: &Session, id: &str) -> Result<ForwardingRule, AppError> {
    state
        .db
        .get_rule(id)
        .await?
        .filter(|rule| rule.owner_user_id == session.user_id)
        .ok_or(AppError::NotFound)
}

/// GET /api/rules
async fn list_rules(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<Json<Vec<RuleResponse>>, AppError> {
    let rules = state.db.list_rules_for_user(&session.user_id).await?;

    let mut response = Vec::with_capacity(rules.len());
    for rule in rules {
        response.push(rule_response(&state, rule).await?);
    }

    Ok(Json(response))
}

/// POST /api/rules
async fn create_rule(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Json(req): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<RuleResponse>), AppError> {
    let now = Utc::now();
    let rule = ForwardingRule {
        id: EntityId::new().0,
        owner_user_id: session.user_id.clone(),
        name: req.name.trim().to_string(),
        subject_filter: req.subject_filter.trim().to_string(),
        message_template: req
            .message_template
            .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string()),
        is_active: req.is_active.unwrap_or(true),
        created_at: now,
        updated_at: now,
    };
    validate_rule(&rule)?;

    state.db.insert_rule(&rule).await?;
    tracing::info!(rule_id = %rule.id, user_id = %session.user_id, "Rule created");

    Ok((StatusCode::CREATED, Json(RuleResponse::new(rule, None))))
}

/// GET /api/rules/:id
async fn get_rule(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<RuleResponse>, AppError> {
    let rule = owned_rule(&state, &session, &id).await?;
    Ok(Json(rule_response(&state, rule).await?))
}

/// PATCH /api/rules/:id
async fn update_rule(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<RuleResponse>, AppError> {
    let mut rule = owned_rule(&state, &session, &id).await?;

    if let Some(name) = req.name {
        rule.name = name.trim().to_string();
    }
    if let Some(subject_filter) = req.subject_filter {
        rule.subject_filter = subject_filter.trim().to_string();
    }
    if let Some(message_template) = req.message_template {
        rule.message_template = message_template;
    }
    if let Some(is_active) = req.is_active {
        rule.is_active = is_active;
    }
    rule.updated_at = Utc::now();
    validate_rule(&rule)?;

    if !state.db.update_rule(&rule).await? {
        return Err(AppError::NotFound);
    }

    Ok(Json(rule_response(&state, rule).await?))
}

/// DELETE /api/rules/:id
async fn delete_rule(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let rule = owned_rule(&state, &session, &id).await?;
    state.db.delete_rule(&rule.id).await?;
    tracing::info!(rule_id = %rule.id, user_id = %session.user_id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/rules/:id/status
async fn set_rule_status(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<RuleStatusRequest>,
) -> Result<Json<RuleResponse>, AppError> {
    let rule = owned_rule(&state, &session, &id).await?;
    state.db.set_rule_active(&rule.id, req.is_active).await?;

    let rule = state.db.get_rule(&rule.id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(rule_response(&state, rule).await?))
}
