//! Postgres-backed implementation of the automation service's store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tavola_core::{Email, NewsletterId, NewsletterSendId, OrderId};

use super::{
    AutomationLogRepository, NewsletterRepository, OrderRepository, RepositoryError,
    SessionRepository, TemplateRepository,
};
use crate::models::{
    AbandonedCart, CreateNewsletter, EmailTemplate, EmailType, Newsletter, NewsletterStats, Order,
    Recipient, TargetAudience, UpdateNewsletter,
};
use crate::services::automation::{
    AutomationStore, CartWindow, CleanupStats, LOG_RETENTION_DAYS, SESSION_RETENTION_DAYS,
};
use crate::services::newsletter::{NewsletterAdmin, NewsletterError};

/// `AutomationStore` and `NewsletterAdmin` over the shared connection
/// pool, delegating each call to the matching repository.
#[derive(Clone)]
pub struct PgAutomationStore {
    pool: PgPool,
}

impl PgAutomationStore {
    /// Create a store over the shared pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationStore for PgAutomationStore {
    async fn abandoned_carts(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError> {
        SessionRepository::new(&self.pool)
            .find_abandoned(window, limit)
            .await
    }

    async fn reminder_carts(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError> {
        SessionRepository::new(&self.pool)
            .find_reminder_candidates(window, limit)
            .await
    }

    async fn record_automated_send(
        &self,
        email_type: EmailType,
        recipient: &Email,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        AutomationLogRepository::new(&self.pool)
            .record(email_type, recipient, session_key, now)
            .await
    }

    async fn active_template(&self, name: &str) -> Result<Option<EmailTemplate>, RepositoryError> {
        TemplateRepository::new(&self.pool).get_active(name).await
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        OrderRepository::new(&self.pool).get(id).await
    }

    async fn due_scheduled_newsletters(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Newsletter>, RepositoryError> {
        NewsletterRepository::new(&self.pool).due_scheduled(now).await
    }

    async fn newsletter(&self, id: NewsletterId) -> Result<Option<Newsletter>, RepositoryError> {
        NewsletterRepository::new(&self.pool).get(id).await
    }

    async fn newsletter_recipients(
        &self,
        audience: TargetAudience,
        segments: &[String],
    ) -> Result<Vec<Recipient>, RepositoryError> {
        NewsletterRepository::new(&self.pool)
            .recipients(audience, segments)
            .await
    }

    async fn reserve_newsletter_send(
        &self,
        id: NewsletterId,
        recipient_count: i32,
        now: DateTime<Utc>,
    ) -> Result<NewsletterSendId, NewsletterError> {
        NewsletterRepository::new(&self.pool)
            .reserve_send(id, recipient_count, now)
            .await
    }

    async fn complete_newsletter_send(
        &self,
        send_id: NewsletterSendId,
        delivered: i32,
        errors: i32,
    ) -> Result<(), RepositoryError> {
        NewsletterRepository::new(&self.pool)
            .complete_send(send_id, delivered, errors)
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<CleanupStats, RepositoryError> {
        let sessions_deleted = SessionRepository::new(&self.pool)
            .delete_stale(now - chrono::Duration::days(SESSION_RETENTION_DAYS))
            .await?;
        let log_rows_deleted = AutomationLogRepository::new(&self.pool)
            .purge_older_than(now - chrono::Duration::days(LOG_RETENTION_DAYS))
            .await?;

        Ok(CleanupStats {
            sessions_deleted,
            log_rows_deleted,
        })
    }
}

#[async_trait]
impl NewsletterAdmin for PgAutomationStore {
    async fn list(&self) -> Result<Vec<Newsletter>, RepositoryError> {
        NewsletterRepository::new(&self.pool).list().await
    }

    async fn get(&self, id: NewsletterId) -> Result<Option<Newsletter>, RepositoryError> {
        NewsletterRepository::new(&self.pool).get(id).await
    }

    async fn create(&self, input: CreateNewsletter) -> Result<Newsletter, RepositoryError> {
        NewsletterRepository::new(&self.pool).create(input).await
    }

    async fn update(
        &self,
        id: NewsletterId,
        patch: UpdateNewsletter,
    ) -> Result<Newsletter, RepositoryError> {
        NewsletterRepository::new(&self.pool).update(id, patch).await
    }

    async fn delete(&self, id: NewsletterId) -> Result<(), RepositoryError> {
        NewsletterRepository::new(&self.pool).delete(id).await
    }

    async fn stats(&self) -> Result<NewsletterStats, RepositoryError> {
        NewsletterRepository::new(&self.pool).stats().await
    }
}
