//! Forwarding pipeline
//!
//! Handles:
//! - Matching emails against subject-filter rules
//! - Rendering message templates
//! - Idempotent dispatch with retries
//! - Running one pipeline pass per push notification

pub mod dispatch;
pub mod matcher;
pub mod pipeline;
pub mod store;
pub mod template;

pub use dispatch::{DispatchOutcome, DispatchPolicy, Dispatcher};
pub use matcher::match_rules;
pub use pipeline::{Pipeline, PipelineSummary};
pub use store::{DeliveryLedger, RuleStore};
pub use template::{TemplateError, TemplateFields, render, render_with_limit, validate_template};
