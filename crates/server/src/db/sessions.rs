//! Cart session queries for the abandonment scans and cleanup.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tavola_core::{Email, Price, SessionId};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::{AbandonedCart, CartItem, EmailType};
use crate::services::automation::CartWindow;

/// Internal row type for session queries.
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: Uuid,
    customer_email: String,
    customer_name: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    session_id: Uuid,
    dish_name: String,
    quantity: i32,
    unit_price: Decimal,
}

/// Repository for cart session queries.
pub struct SessionRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> SessionRepository<'a> {
    /// Create a new session repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Carts eligible for the first abandonment email.
    ///
    /// Selects sessions with a customer email and at least one item whose
    /// `updated_at` lies inside `window`, excluding carts that converted
    /// (a later order for the same email) and carts already emailed (a
    /// `cart-abandoned` ledger row after `updated_at`).
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if a query fails, or
    /// `RepositoryError::DataCorruption` for an unparseable stored email.
    pub async fn find_abandoned(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT s.session_id, s.customer_email, s.customer_name, s.updated_at
            FROM sessions s
            WHERE s.customer_email IS NOT NULL
              AND s.updated_at > $1
              AND s.updated_at < $2
              AND EXISTS (
                  SELECT 1 FROM session_items i WHERE i.session_id = s.session_id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM orders o
                  WHERE o.customer_email = s.customer_email
                    AND o.created_at > s.updated_at
              )
              AND NOT EXISTS (
                  SELECT 1 FROM email_automation_log l
                  WHERE l.email_type = $3
                    AND l.recipient_email = s.customer_email
                    AND l.created_at > s.updated_at
              )
            ORDER BY s.updated_at
            LIMIT $4
            ",
        )
        .bind(window.updated_after)
        .bind(window.updated_before)
        .bind(EmailType::CartAbandoned.as_str())
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        self.attach_items(rows).await
    }

    /// Carts eligible for the stage-two reminder: the first email was
    /// logged, the reminder was not.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::find_abandoned`].
    pub async fn find_reminder_candidates(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT s.session_id, s.customer_email, s.customer_name, s.updated_at
            FROM sessions s
            WHERE s.customer_email IS NOT NULL
              AND s.updated_at > $1
              AND s.updated_at < $2
              AND EXISTS (
                  SELECT 1 FROM session_items i WHERE i.session_id = s.session_id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM orders o
                  WHERE o.customer_email = s.customer_email
                    AND o.created_at > s.updated_at
              )
              AND EXISTS (
                  SELECT 1 FROM email_automation_log l
                  WHERE l.email_type = $3
                    AND l.recipient_email = s.customer_email
                    AND l.created_at > s.updated_at
              )
              AND NOT EXISTS (
                  SELECT 1 FROM email_automation_log l
                  WHERE l.email_type = $4
                    AND l.recipient_email = s.customer_email
                    AND l.created_at > s.updated_at
              )
            ORDER BY s.updated_at
            LIMIT $5
            ",
        )
        .bind(window.updated_after)
        .bind(window.updated_before)
        .bind(EmailType::CartAbandoned.as_str())
        .bind(EmailType::CartReminder.as_str())
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        self.attach_items(rows).await
    }

    /// Delete sessions idle since before `cutoff` that never converted.
    /// Items go with them via `ON DELETE CASCADE`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the delete fails.
    pub async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM sessions s
            WHERE s.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM orders o
                  WHERE o.customer_email = s.customer_email
                    AND o.created_at > s.updated_at
              )
            ",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Load items for a batch of sessions and assemble the cart models.
    async fn attach_items(
        &self,
        rows: Vec<SessionRow>,
    ) -> Result<Vec<AbandonedCart>, RepositoryError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.session_id).collect();
        let item_rows = sqlx::query_as::<_, ItemRow>(
            r"
            SELECT session_id, dish_name, quantity, unit_price
            FROM session_items
            WHERE session_id = ANY($1)
            ORDER BY id
            ",
        )
        .bind(&ids)
        .fetch_all(self.pool)
        .await?;

        let mut items_by_session: HashMap<Uuid, Vec<CartItem>> = HashMap::new();
        for item in item_rows {
            items_by_session
                .entry(item.session_id)
                .or_default()
                .push(CartItem {
                    dish_name: item.dish_name,
                    quantity: item.quantity,
                    unit_price: Price::new(item.unit_price),
                });
        }

        rows.into_iter()
            .map(|row| {
                let customer_email = Email::parse(&row.customer_email).map_err(|e| {
                    RepositoryError::DataCorruption(format!("invalid email in sessions: {e}"))
                })?;
                Ok(AbandonedCart {
                    session_id: SessionId::from_uuid(row.session_id),
                    customer_email,
                    customer_name: row.customer_name,
                    updated_at: row.updated_at,
                    items: items_by_session.remove(&row.session_id).unwrap_or_default(),
                })
            })
            .collect()
    }
}
