//! Admin API endpoints
//!
//! Operator dashboard: user and rule management, aggregate stats and a
//! synchronous pipeline trigger. All routes require the admin role.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, patch, post},
};
use chrono::Utc;

use super::dto::{
    CreateUserRequest, RuleResponse, RuleStatusRequest, UpdateRoleRequest, UserResponse,
};
use super::rules::rule_response;
use crate::AppState;
use crate::auth::AdminUser;
use crate::data::{DatabaseStats, EntityId, User, UserRole};
use crate::error::AppError;
use crate::forwarding::PipelineSummary;

/// Create admin router
///
/// Routes:
/// - GET /admin/stats - Aggregate counts
/// - GET /admin/users - List users
/// - POST /admin/users - Create user
/// - PATCH /admin/users/:id/role - Change role
/// - DELETE /admin/users/:id - Delete user and everything they own
/// - GET /admin/rules - List every rule
/// - PATCH /admin/rules/:id/status - Activate or deactivate any rule
/// - DELETE /admin/rules/:id - Delete any rule
/// - POST /admin/pipeline/run - Process a push envelope synchronously
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id/role", patch(update_user_role))
        .route("/users/:id", delete(delete_user))
        .route("/rules", get(list_rules))
        .route("/rules/:id/status", patch(set_rule_status))
        .route("/rules/:id", delete(delete_rule))
        .route("/pipeline/run", post(run_pipeline))
}

/// GET /admin/stats
async fn get_stats(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<DatabaseStats>, AppError> {
    Ok(Json(state.db.get_stats().await?))
}

// =============================================================================
// Users
// =============================================================================

/// GET /admin/users
async fn list_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<UserResponse>>, AppError> {
    let users = state.db.list_users().await?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

fn parse_role(role: &str) -> Result<UserRole, AppError> {
    UserRole::parse(role.trim()).ok_or_else(|| {
        AppError::Validation("Invalid role. Must be 'user' or 'admin'".to_string())
    })
}

/// POST /admin/users
async fn create_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Validation("A valid email is required".to_string()));
    }
    let role = parse_role(req.role.as_deref().unwrap_or("user"))?;

    if state.db.get_user_by_email(&email).await?.is_some() {
        return Err(AppError::Validation(format!(
            "User with email {email} already exists"
        )));
    }

    let now = Utc::now();
    let user = User {
        id: EntityId::new().0,
        email,
        name: req.name.map(|name| name.trim().to_string()).filter(|n| !n.is_empty()),
        role: role.as_str().to_string(),
        created_at: now,
        updated_at: now,
    };
    state.db.upsert_user(&user).await?;
    tracing::info!(user_id = %user.id, admin_id = %admin.user_id, "User created");

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// PATCH /admin/users/:id/role
async fn update_user_role(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let role = parse_role(&req.role)?;
    if id == admin.user_id && role != UserRole::Admin {
        return Err(AppError::Validation(
            "Admins cannot remove their own admin role".to_string(),
        ));
    }

    if !state.db.update_user_role(&id, role).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(user_id = %id, role = role.as_str(), admin_id = %admin.user_id, "User role updated");

    let user = state.db.get_user(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(user.into()))
}

/// DELETE /admin/users/:id
async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if id == admin.user_id {
        return Err(AppError::Validation(
            "Admins cannot delete themselves".to_string(),
        ));
    }
    if !state.db.delete_user(&id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(user_id = %id, admin_id = %admin.user_id, "User deleted");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Rules
// =============================================================================

/// GET /admin/rules
async fn list_rules(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<RuleResponse>>, AppError> {
    let rules = state.db.list_all_rules().await?;

    let mut response = Vec::with_capacity(rules.len());
    for rule in rules {
        response.push(rule_response(&state, rule).await?);
    }

    Ok(Json(response))
}

/// PATCH /admin/rules/:id/status
async fn set_rule_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<RuleStatusRequest>,
) -> Result<Json<RuleResponse>, AppError> {
    if !state.db.set_rule_active(&id, req.is_active).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(rule_id = %id, is_active = req.is_active, admin_id = %admin.user_id, "Rule status set");

    let rule = state.db.get_rule(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(rule_response(&state, rule).await?))
}

/// DELETE /admin/rules/:id
async fn delete_rule(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.db.delete_rule(&id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(rule_id = %id, admin_id = %admin.user_id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Pipeline
// =============================================================================

/// POST /admin/pipeline/run
///
/// Takes the same envelope as the push endpoint and waits for the run.
async fn run_pipeline(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    body: Bytes,
) -> Result<Json<PipelineSummary>, AppError> {
    tracing::info!(admin_id = %admin.user_id, "Manual pipeline run");
    let summary = state.pipeline.process_notification(&body).await?;
    Ok(Json(summary))
}
