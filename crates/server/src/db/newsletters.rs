//! Newsletter repository: CRUD for the admin API, the due-schedule query,
//! audience resolution, and the atomic send reservation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tavola_core::{Email, NewsletterId, NewsletterSendId};

use super::RepositoryError;
use crate::models::{
    CreateNewsletter, Newsletter, NewsletterStats, Recipient, TargetAudience, UpdateNewsletter,
};
use crate::services::automation::NEWSLETTER_SCAN_WINDOW_MINUTES;
use crate::services::newsletter::{NewsletterError, RateLimitPolicy, check_rate_limit};

/// Internal row type for newsletter queries.
#[derive(Debug, sqlx::FromRow)]
struct NewsletterRow {
    id: i64,
    title: String,
    subject: String,
    body_html: String,
    is_active: bool,
    is_scheduled: bool,
    scheduled_date: Option<DateTime<Utc>>,
    target_audience: Value,
    customer_segments: Value,
    max_sends_per_month: Option<i32>,
    min_days_between_sends: Option<i32>,
    total_sent: i64,
    last_sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<NewsletterRow> for Newsletter {
    type Error = RepositoryError;

    fn try_from(row: NewsletterRow) -> Result<Self, Self::Error> {
        let target_audience: TargetAudience = serde_json::from_value(row.target_audience)
            .map_err(|e| {
                RepositoryError::DataCorruption(format!("invalid target_audience: {e}"))
            })?;
        let customer_segments: Vec<String> = serde_json::from_value(row.customer_segments)
            .map_err(|e| {
                RepositoryError::DataCorruption(format!("invalid customer_segments: {e}"))
            })?;

        Ok(Self {
            id: NewsletterId::new(row.id),
            title: row.title,
            subject: row.subject,
            body_html: row.body_html,
            is_active: row.is_active,
            is_scheduled: row.is_scheduled,
            scheduled_date: row.scheduled_date,
            target_audience,
            customer_segments,
            max_sends_per_month: row.max_sends_per_month,
            min_days_between_sends: row.min_days_between_sends,
            total_sent: row.total_sent,
            last_sent_at: row.last_sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const NEWSLETTER_COLUMNS: &str = r"
    id, title, subject, body_html, is_active, is_scheduled, scheduled_date,
    target_audience, customer_segments, max_sends_per_month,
    min_days_between_sends, total_sent, last_sent_at, created_at, updated_at
";

/// Repository for newsletter campaigns.
pub struct NewsletterRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> NewsletterRepository<'a> {
    /// Create a new newsletter repository.
    #[must_use]
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// List all newsletters, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn list(&self) -> Result<Vec<Newsletter>, RepositoryError> {
        let rows = sqlx::query_as::<_, NewsletterRow>(&format!(
            "SELECT {NEWSLETTER_COLUMNS} FROM newsletters ORDER BY created_at DESC"
        ))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Get a newsletter by id.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn get(&self, id: NewsletterId) -> Result<Option<Newsletter>, RepositoryError> {
        let row = sqlx::query_as::<_, NewsletterRow>(&format!(
            "SELECT {NEWSLETTER_COLUMNS} FROM newsletters WHERE id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Create a newsletter draft (inactive, unscheduled).
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the insert fails.
    pub async fn create(&self, input: CreateNewsletter) -> Result<Newsletter, RepositoryError> {
        let audience = serde_json::to_value(input.target_audience)
            .map_err(|e| RepositoryError::DataCorruption(e.to_string()))?;
        let segments = serde_json::to_value(&input.customer_segments)
            .map_err(|e| RepositoryError::DataCorruption(e.to_string()))?;

        let row = sqlx::query_as::<_, NewsletterRow>(&format!(
            r"
            INSERT INTO newsletters
                (title, subject, body_html, target_audience, customer_segments,
                 max_sends_per_month, min_days_between_sends)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {NEWSLETTER_COLUMNS}
            "
        ))
        .bind(&input.title)
        .bind(&input.subject)
        .bind(&input.body_html)
        .bind(audience)
        .bind(segments)
        .bind(input.max_sends_per_month)
        .bind(input.min_days_between_sends)
        .fetch_one(self.pool)
        .await?;

        row.try_into()
    }

    /// Apply a partial update and return the new state.
    ///
    /// Reads the current row, merges the patch in memory, and writes all
    /// columns back; newsletters are edited rarely enough that dynamic
    /// SQL is not worth its complexity.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the id is unknown.
    pub async fn update(
        &self,
        id: NewsletterId,
        patch: UpdateNewsletter,
    ) -> Result<Newsletter, RepositoryError> {
        let mut newsletter = self.get(id).await?.ok_or(RepositoryError::NotFound)?;

        if let Some(title) = patch.title {
            newsletter.title = title;
        }
        if let Some(subject) = patch.subject {
            newsletter.subject = subject;
        }
        if let Some(body_html) = patch.body_html {
            newsletter.body_html = body_html;
        }
        if let Some(is_active) = patch.is_active {
            newsletter.is_active = is_active;
        }
        if let Some(is_scheduled) = patch.is_scheduled {
            newsletter.is_scheduled = is_scheduled;
        }
        if let Some(scheduled_date) = patch.scheduled_date {
            newsletter.scheduled_date = scheduled_date;
        }
        if let Some(target_audience) = patch.target_audience {
            newsletter.target_audience = target_audience;
        }
        if let Some(customer_segments) = patch.customer_segments {
            newsletter.customer_segments = customer_segments;
        }
        if let Some(max_sends) = patch.max_sends_per_month {
            newsletter.max_sends_per_month = max_sends;
        }
        if let Some(min_days) = patch.min_days_between_sends {
            newsletter.min_days_between_sends = min_days;
        }

        let audience = serde_json::to_value(newsletter.target_audience)
            .map_err(|e| RepositoryError::DataCorruption(e.to_string()))?;
        let segments = serde_json::to_value(&newsletter.customer_segments)
            .map_err(|e| RepositoryError::DataCorruption(e.to_string()))?;

        let row = sqlx::query_as::<_, NewsletterRow>(&format!(
            r"
            UPDATE newsletters
            SET title = $2, subject = $3, body_html = $4, is_active = $5,
                is_scheduled = $6, scheduled_date = $7, target_audience = $8,
                customer_segments = $9, max_sends_per_month = $10,
                min_days_between_sends = $11, updated_at = NOW()
            WHERE id = $1
            RETURNING {NEWSLETTER_COLUMNS}
            "
        ))
        .bind(id.as_i64())
        .bind(&newsletter.title)
        .bind(&newsletter.subject)
        .bind(&newsletter.body_html)
        .bind(newsletter.is_active)
        .bind(newsletter.is_scheduled)
        .bind(newsletter.scheduled_date)
        .bind(audience)
        .bind(segments)
        .bind(newsletter.max_sends_per_month)
        .bind(newsletter.min_days_between_sends)
        .fetch_one(self.pool)
        .await?;

        row.try_into()
    }

    /// Delete a newsletter and its send history.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the id is unknown.
    pub async fn delete(&self, id: NewsletterId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM newsletters WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    /// Active scheduled newsletters due within the scan window, excluding
    /// any already sent near their schedule (double-fire guard across
    /// overlapping scan windows).
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Newsletter>, RepositoryError> {
        let window_start = now - chrono::Duration::minutes(NEWSLETTER_SCAN_WINDOW_MINUTES);

        let rows = sqlx::query_as::<_, NewsletterRow>(&format!(
            r"
            SELECT {NEWSLETTER_COLUMNS}
            FROM newsletters n
            WHERE n.is_active
              AND n.is_scheduled
              AND n.scheduled_date IS NOT NULL
              AND n.scheduled_date > $1
              AND n.scheduled_date <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM newsletter_sends ns
                  WHERE ns.newsletter_id = n.id
                    AND ns.sent_at > n.scheduled_date - INTERVAL '1 hour'
              )
            ORDER BY n.scheduled_date
            "
        ))
        .bind(window_start)
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Resolve the recipient list for an audience.
    ///
    /// `all_customers` means every distinct email that has placed an
    /// order; `newsletter_subscribers` means opted-in preference rows.
    /// A non-empty segment list narrows either audience through the
    /// preferences table.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails, or
    /// `RepositoryError::DataCorruption` for an unparseable stored email.
    pub async fn recipients(
        &self,
        audience: TargetAudience,
        segments: &[String],
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let filter_segments = !segments.is_empty();

        let rows = match audience {
            TargetAudience::AllCustomers => {
                sqlx::query(
                    r"
                    SELECT DISTINCT ON (o.customer_email)
                           o.customer_email AS email, o.customer_name AS name
                    FROM orders o
                    LEFT JOIN customer_newsletter_preferences p
                        ON p.email = o.customer_email
                    WHERE NOT $1 OR p.segment = ANY($2)
                    ORDER BY o.customer_email, o.created_at DESC
                    ",
                )
                .bind(filter_segments)
                .bind(segments)
                .fetch_all(self.pool)
                .await?
            }
            TargetAudience::NewsletterSubscribers => {
                sqlx::query(
                    r"
                    SELECT p.email AS email, p.name AS name
                    FROM customer_newsletter_preferences p
                    WHERE p.subscribed
                      AND (NOT $1 OR p.segment = ANY($2))
                    ORDER BY p.email
                    ",
                )
                .bind(filter_segments)
                .bind(segments)
                .fetch_all(self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                let email: String = row.try_get("email")?;
                let name: Option<String> = row.try_get("name")?;
                let email = Email::parse(&email).map_err(|e| {
                    RepositoryError::DataCorruption(format!("invalid recipient email: {e}"))
                })?;
                Ok(Recipient { email, name })
            })
            .collect()
    }

    /// Atomically check the rate limit and reserve a send.
    ///
    /// One transaction: lock the newsletter row, count this calendar
    /// month's audit rows, run the policy check, then insert the audit
    /// row and bump `last_sent_at`. A concurrent reservation blocks on
    /// the row lock and sees this send, so it fails the policy check
    /// instead of double-sending.
    ///
    /// # Errors
    ///
    /// Returns [`NewsletterError::NotFound`], [`NewsletterError::RateLimited`],
    /// or a wrapped repository error. Any failure rolls the whole
    /// transaction back, so no partial audit row survives.
    pub async fn reserve_send(
        &self,
        id: NewsletterId,
        recipient_count: i32,
        now: DateTime<Utc>,
    ) -> Result<NewsletterSendId, NewsletterError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let locked = sqlx::query(
            r"
            SELECT max_sends_per_month, min_days_between_sends, last_sent_at
            FROM newsletters
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(RepositoryError::from)?
        .ok_or(NewsletterError::NotFound)?;

        let policy = RateLimitPolicy {
            max_sends_per_month: locked
                .try_get("max_sends_per_month")
                .map_err(RepositoryError::from)?,
            min_days_between_sends: locked
                .try_get("min_days_between_sends")
                .map_err(RepositoryError::from)?,
        };
        let last_sent_at: Option<DateTime<Utc>> = locked
            .try_get("last_sent_at")
            .map_err(RepositoryError::from)?;

        // Bucket in UTC regardless of the server's session time zone, so
        // the cap uses the same calendar month as the policy check.
        let sends_this_month: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*)
            FROM newsletter_sends
            WHERE newsletter_id = $1
              AND date_trunc('month', sent_at AT TIME ZONE 'UTC')
                  = date_trunc('month', $2::timestamptz AT TIME ZONE 'UTC')
            ",
        )
        .bind(id.as_i64())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        check_rate_limit(&policy, sends_this_month, last_sent_at, now)?;

        let send_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO newsletter_sends
                (newsletter_id, sent_at, recipient_count, delivered_count, error_count)
            VALUES ($1, $2, $3, 0, 0)
            RETURNING id
            ",
        )
        .bind(id.as_i64())
        .bind(now)
        .bind(recipient_count)
        .fetch_one(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        sqlx::query(
            r"
            UPDATE newsletters
            SET last_sent_at = $2, updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(id.as_i64())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(NewsletterSendId::new(send_id))
    }

    /// Fill in the outcome of a reserved send and bump the newsletter's
    /// rolling delivery total.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the updates fail.
    pub async fn complete_send(
        &self,
        send_id: NewsletterSendId,
        delivered: i32,
        errors: i32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let newsletter_id: i64 = sqlx::query_scalar(
            r"
            UPDATE newsletter_sends
            SET delivered_count = $2, error_count = $3
            WHERE id = $1
            RETURNING newsletter_id
            ",
        )
        .bind(send_id.as_i64())
        .bind(delivered)
        .bind(errors)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r"
            UPDATE newsletters
            SET total_sent = total_sent + $2
            WHERE id = $1
            ",
        )
        .bind(newsletter_id)
        .bind(i64::from(delivered))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Aggregate totals for the admin stats endpoint.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Database` if the query fails.
    pub async fn stats(&self) -> Result<NewsletterStats, RepositoryError> {
        let row = sqlx::query(
            r"
            SELECT
                (SELECT COUNT(*) FROM newsletters) AS newsletter_count,
                (SELECT COUNT(*) FROM newsletters WHERE is_active) AS active_count,
                (SELECT COUNT(*) FROM newsletters
                  WHERE is_active AND is_scheduled) AS scheduled_count,
                (SELECT COUNT(*) FROM newsletter_sends) AS send_count,
                (SELECT COALESCE(SUM(delivered_count), 0)
                   FROM newsletter_sends) AS total_delivered,
                (SELECT COALESCE(SUM(error_count), 0)
                   FROM newsletter_sends) AS total_errors
            ",
        )
        .fetch_one(self.pool)
        .await?;

        Ok(NewsletterStats {
            newsletter_count: row.try_get("newsletter_count")?,
            active_count: row.try_get("active_count")?,
            scheduled_count: row.try_get("scheduled_count")?,
            send_count: row.try_get("send_count")?,
            total_delivered: row.try_get("total_delivered")?,
            total_errors: row.try_get("total_errors")?,
        })
    }
}
