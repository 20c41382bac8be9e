//! The dedupe ledger for automated emails.
//!
//! An append-only table with a unique constraint over
//! `(email_type, recipient_email, session_key, sent_on)`. The insert is
//! the gate: `ON CONFLICT DO NOTHING` means a rerun or a racing replica
//! simply loses the insert and sends nothing, with no check-then-insert
//! window.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tavola_core::Email;

use super::RepositoryError;
use crate::models::EmailType;

/// Repository for the email automation ledger.
pub struct AutomationLogRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> AutomationLogRepository<'a> {
    /// Create a new ledger repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Record a send, returning `false` if an identical send was already
    /// logged for the same calendar day.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the insert fails for any
    /// reason other than the unique constraint.
    pub async fn record(
        &self,
        email_type: EmailType,
        recipient: &Email,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            INSERT INTO email_automation_log
                (email_type, recipient_email, session_key, sent_on, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email_type, recipient_email, session_key, sent_on)
                DO NOTHING
            ",
        )
        .bind(email_type.as_str())
        .bind(recipient.as_str())
        .bind(session_key)
        .bind(now.date_naive())
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete ledger rows created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM email_automation_log
            WHERE created_at < $1
            ",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
