//! Session authentication
//!
//! Handles:
//! - Signed session tokens
//! - User and admin extractors

mod middleware;
pub mod session;

pub use middleware::{AdminUser, CurrentUser};
pub use session::{Session, create_session_token, verify_session_token};
