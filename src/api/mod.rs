//! API layer
//!
//! HTTP handlers for:
//! - Gmail push notifications and account link
//! - Forwarding rules
//! - WhatsApp configuration
//! - Admin API
//! - Metrics (Prometheus)

mod admin;
mod dto;
mod gmail;
pub mod metrics;
mod rules;
mod whatsapp;

pub use dto::*;

pub use admin::admin_router;
pub use metrics::metrics_router;

use axum::Router;

use crate::AppState;

/// Create the user-facing API router, nested under `/api`
pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(gmail::gmail_router())
        .merge(rules::rules_router())
        .merge(whatsapp::whatsapp_router())
}
