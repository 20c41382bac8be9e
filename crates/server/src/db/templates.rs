//! Email template lookups.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tavola_core::TemplateId;

use super::RepositoryError;
use crate::models::EmailTemplate;

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    id: i64,
    name: String,
    subject: String,
    body_html: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TemplateRow> for EmailTemplate {
    fn from(row: TemplateRow) -> Self {
        Self {
            id: TemplateId::new(row.id),
            name: row.name,
            subject: row.subject,
            body_html: row.body_html,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for stored email templates.
pub struct TemplateRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> TemplateRepository<'a> {
    /// Create a new template repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Get the active template with the given name, if any.
    ///
    /// Inactive templates are invisible here on purpose: deactivating a
    /// template in the admin is how staff pause an automated email.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get_active(&self, name: &str) -> Result<Option<EmailTemplate>, RepositoryError> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r"
            SELECT id, name, subject, body_html, is_active, created_at, updated_at
            FROM email_templates
            WHERE name = $1 AND is_active
            ",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}
