//! Database operations for the Tavola `PostgreSQL` database.
//!
//! ## Tables
//!
//! - `sessions` / `session_items` - storefront cart state
//! - `orders` - finalized purchases
//! - `email_templates` - admin-editable automated email copy
//! - `newsletters` / `newsletter_sends` - campaigns and their audit trail
//! - `customer_newsletter_preferences` - subscriber opt-ins and segments
//! - `email_automation_log` - the dedupe ledger for automated emails
//!
//! # Migrations
//!
//! Migrations are embedded from `crates/server/migrations/` and run at
//! process start by `main`.

pub mod automation_log;
pub mod newsletters;
pub mod orders;
pub mod sessions;
pub mod store;
pub mod templates;

use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use automation_log::AutomationLogRepository;
pub use newsletters::NewsletterRepository;
pub use orders::OrderRepository;
pub use sessions::SessionRepository;
pub use store::PgAutomationStore;
pub use templates::TemplateRepository;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
