//! The email automation service.
//!
//! A recurring batch notifier: scans for abandoned carts and due scheduled
//! newsletters on cron cadences, sends tiered reminder emails deduplicated
//! through an append-only ledger, and exposes manual trigger hooks the
//! order-lifecycle code calls for transactional notifications.
//!
//! The service is constructed once at bootstrap with its dependencies
//! injected behind [`AutomationStore`] and [`Mailer`], held in application
//! state, and driven by the [`crate::services::scheduler::Scheduler`].
//! Tests call the scan methods directly with in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use tavola_core::{Email, NewsletterId, NewsletterSendId, OrderId};
use thiserror::Error;

use crate::db::RepositoryError;
use crate::models::{
    AbandonedCart, DelayInfo, EmailTemplate, EmailType, Newsletter, Order, Recipient,
    TargetAudience,
};
use crate::services::email::{MailTrace, Mailer, OutgoingEmail};
use crate::services::newsletter::{NewsletterError, SendOutcome};
use crate::services::scheduler::JobSpec;
use crate::services::template::{Vars, render};

/// Max carts processed per scan tick, bounding load and outbound rate.
pub const SCAN_BATCH_LIMIT: i64 = 50;

/// Abandoned-cart scan window: 1 to 25 hours since last cart activity.
const ABANDONED_MIN_AGE_HOURS: i64 = 1;
const ABANDONED_MAX_AGE_HOURS: i64 = 25;

/// Reminder scan window: 24 to 48 hours since last cart activity.
const REMINDER_MIN_AGE_HOURS: i64 = 24;
const REMINDER_MAX_AGE_HOURS: i64 = 48;

/// Sessions idle longer than this are garbage-collected.
pub const SESSION_RETENTION_DAYS: i64 = 7;

/// Ledger rows older than this are purged.
pub const LOG_RETENTION_DAYS: i64 = 30;

/// How far back the newsletter dispatcher looks for due schedules.
pub const NEWSLETTER_SCAN_WINDOW_MINUTES: i64 = 15;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Time window over a cart's `updated_at`.
#[derive(Debug, Clone, Copy)]
pub struct CartWindow {
    /// Exclusive lower bound on `updated_at` (the older edge).
    pub updated_after: DateTime<Utc>,
    /// Exclusive upper bound on `updated_at` (the newer edge).
    pub updated_before: DateTime<Utc>,
}

/// What the daily cleanup removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Stale sessions (and their items) deleted.
    pub sessions_deleted: u64,
    /// Expired ledger rows deleted.
    pub log_rows_deleted: u64,
}

/// Counters from one scan tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Rows the scan query matched.
    pub matched: usize,
    /// Emails accepted by the transport.
    pub sent: usize,
    /// Matches skipped by the dedupe gate or a rate limit.
    pub skipped: usize,
    /// Per-recipient failures (batch continued).
    pub failed: usize,
}

/// Failures surfaced by scan ticks and trigger internals.
#[derive(Debug, Error)]
pub enum AutomationError {
    /// Persistence failure.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Newsletter routine failure.
    #[error(transparent)]
    Newsletter(#[from] NewsletterError),

    /// No active template stored under the required name.
    #[error("no active email template named '{0}'")]
    TemplateMissing(String),

    /// The transport refused or timed out on a send.
    #[error("send failed: {0}")]
    Send(String),
}

/// Persistence port for the automation service.
///
/// The production implementation is `PgAutomationStore` over `sqlx`; tests
/// use an in-memory fake. Every method is one logical unit of work; the
/// implementations own transaction boundaries.
#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Carts eligible for the first abandonment email: customer email set,
    /// `updated_at` inside `window`, no later order for that email, and no
    /// `cart-abandoned` ledger row since `updated_at`.
    async fn abandoned_carts(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError>;

    /// Carts eligible for the stage-two reminder: same shape as
    /// [`Self::abandoned_carts`] but requires that a `cart-abandoned`
    /// ledger row exists and no `cart-reminder` row does.
    async fn reminder_carts(
        &self,
        window: CartWindow,
        limit: i64,
    ) -> Result<Vec<AbandonedCart>, RepositoryError>;

    /// Insert-or-ignore dedupe gate on the ledger's unique constraint.
    ///
    /// Returns `Ok(false)` when a row for `(email_type, recipient,
    /// session_key, day-of(now))` already exists - a rerun or a lost race
    /// with another replica - in which case the caller must not send.
    async fn record_automated_send(
        &self,
        email_type: EmailType,
        recipient: &Email,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Fetch an active template by name.
    async fn active_template(&self, name: &str) -> Result<Option<EmailTemplate>, RepositoryError>;

    /// Load an order for the manual trigger hooks.
    async fn order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError>;

    /// Active, scheduled newsletters whose `scheduled_date` falls within
    /// the last scan window up to `now`, excluding any with a send record
    /// after `scheduled_date - 1h` (double-fire guard across overlapping
    /// scan windows).
    async fn due_scheduled_newsletters(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Newsletter>, RepositoryError>;

    /// Fetch a newsletter by id.
    async fn newsletter(&self, id: NewsletterId) -> Result<Option<Newsletter>, RepositoryError>;

    /// Resolve the recipient list for an audience, optionally filtered by
    /// segments.
    async fn newsletter_recipients(
        &self,
        audience: TargetAudience,
        segments: &[String],
    ) -> Result<Vec<Recipient>, RepositoryError>;

    /// Atomically check the rate limit and reserve the send: one
    /// transaction locks the newsletter row, counts this calendar month's
    /// sends, checks the spacing policy, then writes the audit row and
    /// bumps `last_sent_at`. A concurrent attempt fails here rather than
    /// double-sending.
    async fn reserve_newsletter_send(
        &self,
        id: NewsletterId,
        recipient_count: i32,
        now: DateTime<Utc>,
    ) -> Result<NewsletterSendId, NewsletterError>;

    /// Fill in delivered/error counts on a reserved send.
    async fn complete_newsletter_send(
        &self,
        send_id: NewsletterSendId,
        delivered: i32,
        errors: i32,
    ) -> Result<(), RepositoryError>;

    /// Retention housekeeping: delete sessions idle past
    /// [`SESSION_RETENTION_DAYS`] with no later order, and ledger rows
    /// older than [`LOG_RETENTION_DAYS`].
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<CleanupStats, RepositoryError>;
}

/// The automation service proper.
pub struct EmailAutomationService {
    store: Arc<dyn AutomationStore>,
    mailer: Arc<dyn Mailer>,
    /// Public base URL used to build cart and unsubscribe links.
    base_url: String,
    send_timeout: Duration,
}

impl EmailAutomationService {
    /// Create the service with injected dependencies.
    #[must_use]
    pub fn new(store: Arc<dyn AutomationStore>, mailer: Arc<dyn Mailer>, base_url: String) -> Self {
        Self {
            store,
            mailer,
            base_url: base_url.trim_end_matches('/').to_owned(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Override the per-send timeout (tests use a short one).
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// The declarative cron table driving this service.
    ///
    /// Handlers are plain method calls so tests can invoke them without
    /// timers.
    #[must_use]
    pub fn jobs(self: Arc<Self>) -> Vec<JobSpec> {
        vec![
            JobSpec::new("abandoned-cart-scan", "0 * * * *", {
                let service = Arc::clone(&self);
                move || {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        service.run_abandoned_cart_scan().await?;
                        Ok(())
                    })
                }
            }),
            JobSpec::new("cart-reminder-scan", "0 */6 * * *", {
                let service = Arc::clone(&self);
                move || {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        service.run_cart_reminder_scan().await?;
                        Ok(())
                    })
                }
            }),
            JobSpec::new("scheduled-newsletter-scan", "*/15 * * * *", {
                let service = Arc::clone(&self);
                move || {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        service.run_newsletter_scan().await?;
                        Ok(())
                    })
                }
            }),
            JobSpec::new("retention-cleanup", "0 2 * * *", {
                let service = Arc::clone(&self);
                move || {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        service.run_cleanup().await?;
                        Ok(())
                    })
                }
            }),
        ]
    }

    // ------------------------------------------------------------------
    // Scan ticks
    // ------------------------------------------------------------------

    /// Hourly scan for carts abandoned 1-25 hours ago.
    ///
    /// Deactivating the template pauses the scan: the tick becomes a
    /// logged no-op until staff re-activate it.
    ///
    /// # Errors
    ///
    /// Returns an error only for scan-level failures (store unreachable);
    /// per-recipient send failures are counted in the outcome instead.
    pub async fn run_abandoned_cart_scan(&self) -> Result<ScanOutcome, AutomationError> {
        let Some(template) = self.scan_template(EmailType::CartAbandoned).await? else {
            return Ok(ScanOutcome::default());
        };

        let now = Utc::now();
        let window = CartWindow {
            updated_after: now - chrono::Duration::hours(ABANDONED_MAX_AGE_HOURS),
            updated_before: now - chrono::Duration::hours(ABANDONED_MIN_AGE_HOURS),
        };
        let carts = self.store.abandoned_carts(window, SCAN_BATCH_LIMIT).await?;

        let mut outcome = ScanOutcome {
            matched: carts.len(),
            ..ScanOutcome::default()
        };

        for cart in carts {
            let vars = self.cart_vars(&cart, None);
            self.send_cart_email(EmailType::CartAbandoned, &cart, &template, &vars, now, &mut outcome)
                .await?;
        }

        tracing::info!(
            matched = outcome.matched,
            sent = outcome.sent,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Abandoned-cart scan finished"
        );
        Ok(outcome)
    }

    /// Six-hourly scan for carts abandoned 24-48 hours ago that already
    /// received the first email. The reminder carries a discount code.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::run_abandoned_cart_scan`].
    pub async fn run_cart_reminder_scan(&self) -> Result<ScanOutcome, AutomationError> {
        let Some(template) = self.scan_template(EmailType::CartReminder).await? else {
            return Ok(ScanOutcome::default());
        };

        let now = Utc::now();
        let window = CartWindow {
            updated_after: now - chrono::Duration::hours(REMINDER_MAX_AGE_HOURS),
            updated_before: now - chrono::Duration::hours(REMINDER_MIN_AGE_HOURS),
        };
        let carts = self.store.reminder_carts(window, SCAN_BATCH_LIMIT).await?;

        let mut outcome = ScanOutcome {
            matched: carts.len(),
            ..ScanOutcome::default()
        };

        for cart in carts {
            let code = generate_discount_code();
            let vars = self.cart_vars(&cart, Some(&code));
            self.send_cart_email(EmailType::CartReminder, &cart, &template, &vars, now, &mut outcome)
                .await?;
        }

        tracing::info!(
            matched = outcome.matched,
            sent = outcome.sent,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Cart-reminder scan finished"
        );
        Ok(outcome)
    }

    /// Quarter-hourly dispatcher for scheduled newsletters.
    ///
    /// Rate-limited newsletters are skipped (logged, retried at their next
    /// eligible window); other per-newsletter failures are logged and do
    /// not abort the tick.
    ///
    /// # Errors
    ///
    /// Returns an error only if the due-newsletter query itself fails.
    pub async fn run_newsletter_scan(&self) -> Result<ScanOutcome, AutomationError> {
        let now = Utc::now();
        let due = self.store.due_scheduled_newsletters(now).await?;

        let mut outcome = ScanOutcome {
            matched: due.len(),
            ..ScanOutcome::default()
        };

        for newsletter in due {
            match self.send_newsletter(newsletter.id).await {
                Ok(sent) => {
                    outcome.sent += sent.delivered;
                    outcome.failed += sent.errors;
                    tracing::info!(
                        newsletter_id = %newsletter.id,
                        delivered = sent.delivered,
                        errors = sent.errors,
                        "Scheduled newsletter dispatched"
                    );
                }
                Err(NewsletterError::RateLimited(reason)) => {
                    outcome.skipped += 1;
                    tracing::warn!(
                        newsletter_id = %newsletter.id,
                        %reason,
                        "Scheduled newsletter skipped by rate limit"
                    );
                }
                Err(e) => {
                    outcome.skipped += 1;
                    tracing::error!(
                        newsletter_id = %newsletter.id,
                        error = %e,
                        "Scheduled newsletter failed"
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Daily retention housekeeping. Safe to skip or fail; the next run
    /// catches up.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletes fail.
    pub async fn run_cleanup(&self) -> Result<CleanupStats, AutomationError> {
        let stats = self.store.purge_expired(Utc::now()).await?;
        tracing::info!(
            sessions = stats.sessions_deleted,
            log_rows = stats.log_rows_deleted,
            "Retention cleanup finished"
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Newsletter send routine (shared by the dispatcher and the admin API)
    // ------------------------------------------------------------------

    /// Send a newsletter to its resolved audience.
    ///
    /// The rate limit is enforced atomically inside the store's
    /// reservation; per-recipient failures are isolated and counted.
    ///
    /// # Errors
    ///
    /// Returns [`NewsletterError::NotFound`], [`NewsletterError::NotActive`],
    /// [`NewsletterError::RateLimited`], or a repository error. Recipient
    /// failures never surface here.
    pub async fn send_newsletter(&self, id: NewsletterId) -> Result<SendOutcome, NewsletterError> {
        let newsletter = self
            .store
            .newsletter(id)
            .await?
            .ok_or(NewsletterError::NotFound)?;
        if !newsletter.is_active {
            return Err(NewsletterError::NotActive);
        }

        let recipients = self
            .store
            .newsletter_recipients(newsletter.target_audience, &newsletter.customer_segments)
            .await?;

        let now = Utc::now();
        let recipient_count = i32::try_from(recipients.len()).unwrap_or(i32::MAX);
        let send_id = self
            .store
            .reserve_newsletter_send(id, recipient_count, now)
            .await?;

        let mut delivered = 0_usize;
        let mut errors = 0_usize;

        for recipient in &recipients {
            let mut vars = Vars::new();
            vars.insert("name".into(), name_or_friend(recipient.name.as_deref()));
            vars.insert("email".into(), Value::String(recipient.email.to_string()));

            let email = OutgoingEmail {
                to: recipient.email.clone(),
                subject: render(&newsletter.subject, &vars),
                html: render(&newsletter.body_html, &vars),
                trace: MailTrace {
                    newsletter_id: Some(newsletter.id.as_i64()),
                    unsubscribe_url: Some(format!(
                        "{}/newsletter/unsubscribe?email={}",
                        self.base_url, recipient.email
                    )),
                    ..MailTrace::default()
                },
            };

            match self.send_with_timeout(email).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    errors += 1;
                    tracing::error!(
                        newsletter_id = %newsletter.id,
                        recipient = %recipient.email,
                        error = %e,
                        "Newsletter recipient failed"
                    );
                }
            }
        }

        self.store
            .complete_newsletter_send(
                send_id,
                i32::try_from(delivered).unwrap_or(i32::MAX),
                i32::try_from(errors).unwrap_or(i32::MAX),
            )
            .await?;

        Ok(SendOutcome {
            recipients: recipients.len(),
            delivered,
            errors,
        })
    }

    // ------------------------------------------------------------------
    // Manual trigger hooks
    // ------------------------------------------------------------------

    /// Notify the customer their order is ready for pickup.
    ///
    /// Called synchronously from order-lifecycle code; never fails the
    /// caller. A missing order is a silent no-op.
    pub async fn notify_order_ready(&self, order_id: OrderId) {
        self.trigger_order_email(order_id, EmailType::OrderReady, None)
            .await;
    }

    /// Notify the customer their delivery has left the restaurant.
    pub async fn notify_delivery_started(&self, order_id: OrderId) {
        self.trigger_order_email(order_id, EmailType::DeliveryStarted, None)
            .await;
    }

    /// Notify the customer their delivery is running late.
    pub async fn notify_delivery_delayed(&self, order_id: OrderId, delay: DelayInfo) {
        self.trigger_order_email(order_id, EmailType::DeliveryDelayed, Some(delay))
            .await;
    }

    async fn trigger_order_email(
        &self,
        order_id: OrderId,
        email_type: EmailType,
        delay: Option<DelayInfo>,
    ) {
        if let Err(e) = self.send_order_email(order_id, email_type, delay).await {
            tracing::error!(
                %order_id,
                %email_type,
                error = %e,
                "Order notification failed"
            );
        }
    }

    async fn send_order_email(
        &self,
        order_id: OrderId,
        email_type: EmailType,
        delay: Option<DelayInfo>,
    ) -> Result<(), AutomationError> {
        let Some(order) = self.store.order(order_id).await? else {
            tracing::debug!(%order_id, %email_type, "Order not found, skipping notification");
            return Ok(());
        };

        // Same ledger gate as the scans: at most one email of a given type
        // per order per day, even if lifecycle code fires twice.
        let fresh = self
            .store
            .record_automated_send(
                email_type,
                &order.customer_email,
                &order_id.to_string(),
                Utc::now(),
            )
            .await?;
        if !fresh {
            tracing::debug!(%order_id, %email_type, "Notification already sent today");
            return Ok(());
        }

        let template = self.require_template(email_type).await?;
        let vars = order_vars(&order, delay.as_ref());

        let email = OutgoingEmail {
            to: order.customer_email.clone(),
            subject: render(&template.subject, &vars),
            html: render(&template.body_html, &vars),
            trace: MailTrace {
                email_type: Some(email_type),
                session_id: Some(order_id.to_string()),
                ..MailTrace::default()
            },
        };

        self.send_with_timeout(email)
            .await
            .map_err(AutomationError::Send)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn require_template(
        &self,
        email_type: EmailType,
    ) -> Result<EmailTemplate, AutomationError> {
        self.store
            .active_template(email_type.as_str())
            .await?
            .ok_or_else(|| AutomationError::TemplateMissing(email_type.as_str().to_owned()))
    }

    /// Template lookup for the recurring scans. `None` means the email is
    /// paused (template deactivated or never seeded) and the tick should
    /// do nothing.
    async fn scan_template(
        &self,
        email_type: EmailType,
    ) -> Result<Option<EmailTemplate>, AutomationError> {
        let template = self.store.active_template(email_type.as_str()).await?;
        if template.is_none() {
            tracing::info!(
                template = email_type.as_str(),
                "No active template, scan paused"
            );
        }
        Ok(template)
    }

    /// Gate, render, and send one cart email, updating the tick counters.
    async fn send_cart_email(
        &self,
        email_type: EmailType,
        cart: &AbandonedCart,
        template: &EmailTemplate,
        vars: &Vars,
        now: DateTime<Utc>,
        outcome: &mut ScanOutcome,
    ) -> Result<(), AutomationError> {
        // Gate before sending: with multiple replicas only the insert
        // winner proceeds, so a lost race sends nothing.
        let fresh = self
            .store
            .record_automated_send(
                email_type,
                &cart.customer_email,
                &cart.session_id.to_string(),
                now,
            )
            .await?;
        if !fresh {
            outcome.skipped += 1;
            return Ok(());
        }

        let email = OutgoingEmail {
            to: cart.customer_email.clone(),
            subject: render(&template.subject, vars),
            html: render(&template.body_html, vars),
            trace: MailTrace {
                email_type: Some(email_type),
                session_id: Some(cart.session_id.to_string()),
                ..MailTrace::default()
            },
        };

        match self.send_with_timeout(email).await {
            Ok(()) => outcome.sent += 1,
            Err(e) => {
                outcome.failed += 1;
                tracing::error!(
                    session_id = %cart.session_id,
                    recipient = %cart.customer_email,
                    %email_type,
                    error = %e,
                    "Cart email failed"
                );
            }
        }
        Ok(())
    }

    fn cart_vars(&self, cart: &AbandonedCart, discount_code: Option<&str>) -> Vars {
        let items: Vec<Value> = cart
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.dish_name,
                    "quantity": item.quantity,
                    "unit_price": item.unit_price.format_fixed(),
                    "line_total": item.line_total().format_fixed(),
                })
            })
            .collect();

        let mut vars = Vars::new();
        vars.insert("name".into(), name_or_friend(cart.customer_name.as_deref()));
        vars.insert("items".into(), Value::Array(items));
        vars.insert(
            "total".into(),
            Value::String(cart.total().format_fixed()),
        );
        vars.insert(
            "cart_url".into(),
            Value::String(format!("{}/cart?session={}", self.base_url, cart.session_id)),
        );
        if let Some(code) = discount_code {
            vars.insert("discount_code".into(), Value::String(code.to_owned()));
        }
        vars
    }

    /// Send with the per-send timeout so a stuck SMTP connection cannot
    /// stall the rest of the batch.
    async fn send_with_timeout(&self, email: OutgoingEmail) -> Result<(), String> {
        match tokio::time::timeout(self.send_timeout, self.mailer.send(email)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("send timed out after {:?}", self.send_timeout)),
        }
    }
}

fn name_or_friend(name: Option<&str>) -> Value {
    Value::String(name.unwrap_or("there").to_owned())
}

fn order_vars(order: &Order, delay: Option<&DelayInfo>) -> Vars {
    let mut vars = Vars::new();
    vars.insert("name".into(), Value::String(order.customer_name.clone()));
    vars.insert("order_id".into(), Value::String(order.id.to_string()));
    vars.insert(
        "total".into(),
        Value::String(order.total.format_fixed()),
    );
    vars.insert(
        "status".into(),
        Value::String(order.status.as_str().to_owned()),
    );
    if let Some(address) = &order.delivery_address {
        vars.insert("delivery_address".into(), Value::String(address.clone()));
    }
    if let Some(delay) = delay {
        vars.insert("reason".into(), Value::String(delay.reason.clone()));
        vars.insert(
            "new_estimate".into(),
            Value::String(delay.new_estimate.clone()),
        );
    }
    vars
}

/// Reminder incentive code, e.g. `COMEBACK10-X7K2P9`.
fn generate_discount_code() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("COMEBACK10-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discount_code_format() {
        let code = generate_discount_code();
        let (prefix, suffix) = code.split_once('-').expect("has dash");
        assert_eq!(prefix, "COMEBACK10");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!suffix.chars().any(char::is_lowercase));
    }

    #[test]
    fn test_discount_codes_vary() {
        assert_ne!(generate_discount_code(), generate_discount_code());
    }
}
