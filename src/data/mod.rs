//! Data layer module
//!
//! Handles all data persistence:
//! - Users and their linked Gmail accounts
//! - Forwarding rules and WhatsApp configs
//! - Delivery attempt ledger

mod database;
mod models;

pub use database::Database;
pub use models::*;
