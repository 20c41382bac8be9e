//! End-to-end tests for the email automation service over in-memory
//! fakes: scans, dedupe, rate limiting, error isolation, manual
//! triggers, and cleanup.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tavola_core::{NewsletterId, OrderId};
use tavola_server::models::{DelayInfo, EmailType};
use tavola_server::services::{EmailAutomationService, ScanOutcome};
use tavola_server::services::newsletter::NewsletterError;

use tavola_server::services::automation::AutomationStore;

use common::{
    FlakyMailer, InMemoryStore, LedgerRow, RecordingMailer, StoreState, cart, newsletter, order,
    recipient, template,
};

const BASE_URL: &str = "https://tavola.example";

fn service(
    store: Arc<InMemoryStore>,
    mailer: Arc<RecordingMailer>,
) -> EmailAutomationService {
    EmailAutomationService::new(store, mailer, BASE_URL.to_owned())
}

fn cart_templates(state: &mut StoreState) {
    state.templates.insert(
        "cart-abandoned".to_owned(),
        template(
            "cart-abandoned",
            "You left something behind, {{name}}!",
            "<p>Ciao {{name}},</p>\
             <ul>{{#each items}}<li>{{quantity}} x {{name}} - {{line_total}}</li>{{/each}}</ul>\
             <p>Total {{total}}</p><a href=\"{{cart_url}}\">Resume</a>",
        ),
    );
    state.templates.insert(
        "cart-reminder".to_owned(),
        template(
            "cart-reminder",
            "Still hungry?",
            "<p>Use code {{discount_code}} on your {{total}} order.</p>",
        ),
    );
}

// ---------------------------------------------------------------------
// Abandoned-cart scan
// ---------------------------------------------------------------------

#[tokio::test]
async fn abandoned_scan_sends_once_per_cart() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    state.sessions.push(cart("ada@example.com", 3));
    state.sessions.push(cart("bo@example.com", 10));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_abandoned_cart_scan().await.expect("scan");
    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(outcome.failed, 0);

    let sent = mailer.sent_emails();
    assert_eq!(sent.len(), 2);
    // Rendered body carries cart substitutions and the session deep link.
    assert!(sent[0].html.contains("2 x Margherita - 25.00"));
    assert!(sent[0].html.contains("Total 25.00"));
    assert!(sent[0].html.contains(&format!("{BASE_URL}/cart?session=")));
    assert_eq!(sent[0].subject, "You left something behind, Ada!");
    // Each send left a ledger row.
    assert_eq!(store.ledger_len(), 2);
}

#[tokio::test]
async fn abandoned_scan_is_idempotent() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    state.sessions.push(cart("ada@example.com", 3));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    svc.run_abandoned_cart_scan().await.expect("first scan");
    // Rerun: the ledger row written by the first scan excludes the cart
    // from the selection entirely.
    let second = svc.run_abandoned_cart_scan().await.expect("second scan");
    assert_eq!(second.matched, 0);
    assert_eq!(mailer.sent_emails().len(), 1);
    assert_eq!(store.ledger_len(), 1);
}

#[tokio::test]
async fn abandoned_scan_skips_when_ledger_row_preexists() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    let c = cart("ada@example.com", 3);
    // Simulate a racing replica that won the gate today, just before the
    // cart's last activity, so the selection query still matches the
    // cart but the gate refuses.
    state.ledger.push(LedgerRow {
        email_type: EmailType::CartAbandoned,
        recipient: c.customer_email.as_str().to_owned(),
        session_key: c.session_id.to_string(),
        sent_on: Utc::now().date_naive(),
        created_at: c.updated_at - chrono::Duration::minutes(1),
    });
    state.sessions.push(c);

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_abandoned_cart_scan().await.expect("scan");
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.sent, 0);
    assert!(mailer.sent_emails().is_empty());
}

#[tokio::test]
async fn abandoned_scan_is_noop_without_template() {
    let mut state = StoreState::default();
    state.sessions.push(cart("ada@example.com", 3));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_abandoned_cart_scan().await.expect("scan");
    assert_eq!(outcome, ScanOutcome::default());
    assert!(mailer.sent_emails().is_empty());
    assert_eq!(store.ledger_len(), 0);
}

#[tokio::test]
async fn deactivated_template_pauses_reminder_scan() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    // Staff pause the reminder email by deactivating its template.
    if let Some(t) = state.templates.get_mut("cart-reminder") {
        t.is_active = false;
    }
    let c = cart("ada@example.com", 30);
    state.ledger.push(LedgerRow {
        email_type: EmailType::CartAbandoned,
        recipient: c.customer_email.as_str().to_owned(),
        session_key: c.session_id.to_string(),
        sent_on: (Utc::now() - chrono::Duration::days(1)).date_naive(),
        created_at: c.updated_at + chrono::Duration::hours(1),
    });
    state.sessions.push(c);

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_cart_reminder_scan().await.expect("scan");
    assert_eq!(outcome, ScanOutcome::default());
    assert!(mailer.sent_emails().is_empty());
    // Nothing was gated either, so re-activating resumes cleanly.
    assert_eq!(store.ledger_len(), 1);
}

// ---------------------------------------------------------------------
// Reminder scan
// ---------------------------------------------------------------------

#[tokio::test]
async fn reminder_requires_prior_abandoned_email() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    // In the reminder window but never got the first email.
    state.sessions.push(cart("quiet@example.com", 30));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_cart_reminder_scan().await.expect("scan");
    assert_eq!(outcome.matched, 0);
    assert!(mailer.sent_emails().is_empty());
}

#[tokio::test]
async fn reminder_carries_discount_code() {
    let mut state = StoreState::default();
    cart_templates(&mut state);
    let c = cart("ada@example.com", 30);
    let recipient_email = c.customer_email.clone();
    let session_key = c.session_id.to_string();
    state.sessions.push(c);

    let store = Arc::new(InMemoryStore::with_state(state));
    // Stage one already happened, after the cart's last activity.
    store
        .record_automated_send(
            EmailType::CartAbandoned,
            &recipient_email,
            &session_key,
            Utc::now() - chrono::Duration::hours(24),
        )
        .await
        .expect("seed ledger");

    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let outcome = svc.run_cart_reminder_scan().await.expect("scan");
    assert_eq!(outcome.sent, 1);

    let sent = mailer.sent_emails();
    assert!(sent[0].html.contains("COMEBACK10-"));
    assert_eq!(sent[0].trace.email_type, Some(EmailType::CartReminder));
}

// ---------------------------------------------------------------------
// Newsletter sends
// ---------------------------------------------------------------------

#[tokio::test]
async fn newsletter_send_isolates_recipient_failures() {
    let mut state = StoreState::default();
    state.newsletters.insert(1, newsletter(1));
    for i in 0..10 {
        state.recipients.push(recipient(&format!("guest{i}@example.com")));
    }

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(FlakyMailer::rejecting(&["guest4@example.com"]));
    let svc = EmailAutomationService::new(
        store.clone(),
        mailer.clone(),
        BASE_URL.to_owned(),
    );

    let outcome = svc
        .send_newsletter(NewsletterId::new(1))
        .await
        .expect("send");
    assert_eq!(outcome.recipients, 10);
    assert_eq!(outcome.delivered, 9);
    assert_eq!(outcome.errors, 1);

    // Audit row completed with the real counts.
    let sends = store.send_rows();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].recipient_count, 10);
    assert_eq!(sends[0].delivered, 9);
    assert_eq!(sends[0].errors, 1);

    // Delivered mail is personalized and carries an unsubscribe link.
    let sent = mailer.sent_emails();
    assert_eq!(sent.len(), 9);
    assert!(sent[0].html.contains("Ciao Guest!"));
    assert!(
        sent[0]
            .trace
            .unsubscribe_url
            .as_deref()
            .is_some_and(|u| u.starts_with(BASE_URL))
    );
}

#[tokio::test]
async fn newsletter_monthly_cap_blocks_second_send() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.max_sends_per_month = Some(1);
    state.newsletters.insert(1, n);
    state.recipients.push(recipient("guest@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    svc.send_newsletter(NewsletterId::new(1))
        .await
        .expect("first send");
    let err = svc
        .send_newsletter(NewsletterId::new(1))
        .await
        .expect_err("capped");
    assert!(matches!(err, NewsletterError::RateLimited(_)));
    // Only the first send reached anyone.
    assert_eq!(mailer.sent_emails().len(), 1);
    assert_eq!(store.send_rows().len(), 1);
}

#[tokio::test]
async fn monthly_cap_buckets_by_utc_calendar_month() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.max_sends_per_month = Some(1);
    state.newsletters.insert(1, n);

    let store = InMemoryStore::with_state(state);
    let id = NewsletterId::new(1);
    let january = Utc
        .with_ymd_and_hms(2026, 1, 31, 23, 30, 0)
        .single()
        .expect("timestamp");
    let february = Utc
        .with_ymd_and_hms(2026, 2, 1, 0, 30, 0)
        .single()
        .expect("timestamp");

    store
        .reserve_newsletter_send(id, 10, january)
        .await
        .expect("january send");
    // One hour later, but the UTC month has rolled over: the cap resets.
    store
        .reserve_newsletter_send(id, 10, february)
        .await
        .expect("february send");

    let err = store
        .reserve_newsletter_send(id, 10, february + chrono::Duration::hours(2))
        .await
        .expect_err("second february send");
    assert!(matches!(err, NewsletterError::RateLimited(_)));
}

#[tokio::test]
async fn newsletter_spacing_blocks_rapid_resend() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.min_days_between_sends = Some(7);
    n.last_sent_at = Some(Utc::now() - chrono::Duration::days(2));
    state.newsletters.insert(1, n);
    state.recipients.push(recipient("guest@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(store, Arc::clone(&mailer));

    let err = svc
        .send_newsletter(NewsletterId::new(1))
        .await
        .expect_err("too soon");
    assert!(matches!(err, NewsletterError::RateLimited(_)));
    assert!(mailer.sent_emails().is_empty());
}

#[tokio::test]
async fn inactive_newsletter_is_rejected() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.is_active = false;
    state.newsletters.insert(1, n);

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(store, mailer);

    let err = svc
        .send_newsletter(NewsletterId::new(1))
        .await
        .expect_err("draft");
    assert!(matches!(err, NewsletterError::NotActive));

    let missing = svc
        .send_newsletter(NewsletterId::new(99))
        .await
        .expect_err("unknown id");
    assert!(matches!(missing, NewsletterError::NotFound));
}

#[tokio::test]
async fn scheduled_newsletter_dispatches_once() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.is_scheduled = true;
    n.scheduled_date = Some(Utc::now() - chrono::Duration::minutes(5));
    state.newsletters.insert(1, n);
    state.recipients.push(recipient("guest@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    let first = svc.run_newsletter_scan().await.expect("first tick");
    assert_eq!(first.matched, 1);
    assert_eq!(first.sent, 1);

    // The next overlapping tick sees the send record and stays quiet.
    let second = svc.run_newsletter_scan().await.expect("second tick");
    assert_eq!(second.matched, 0);
    assert_eq!(mailer.sent_emails().len(), 1);
}

#[tokio::test]
async fn rate_limited_scheduled_newsletter_is_skipped_not_fatal() {
    let mut state = StoreState::default();
    let mut n = newsletter(1);
    n.is_scheduled = true;
    n.scheduled_date = Some(Utc::now() - chrono::Duration::minutes(5));
    n.min_days_between_sends = Some(7);
    n.last_sent_at = Some(Utc::now() - chrono::Duration::days(1));
    state.newsletters.insert(1, n);
    state.recipients.push(recipient("guest@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(store, Arc::clone(&mailer));

    let outcome = svc.run_newsletter_scan().await.expect("tick survives");
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.skipped, 1);
    assert!(mailer.sent_emails().is_empty());
}

// ---------------------------------------------------------------------
// Manual triggers
// ---------------------------------------------------------------------

#[tokio::test]
async fn order_ready_notification_sends_once_per_day() {
    let mut state = StoreState::default();
    state.templates.insert(
        "order-ready".to_owned(),
        template(
            "order-ready",
            "Order #{{order_id}} is ready!",
            "<p>Ciao {{name}}, your {{total}} order is ready.</p>",
        ),
    );
    state.orders.insert(7, order(7, "ada@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    svc.notify_order_ready(OrderId::new(7)).await;
    // Lifecycle code fired twice; the ledger gate absorbs the second.
    svc.notify_order_ready(OrderId::new(7)).await;

    let sent = mailer.sent_emails();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Order #7 is ready!");
    assert!(sent[0].html.contains("your 31.50 order"));
    assert_eq!(sent[0].trace.session_id.as_deref(), Some("7"));
}

#[tokio::test]
async fn missing_order_trigger_is_silent_noop() {
    let store = Arc::new(InMemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), Arc::clone(&mailer));

    // Never panics, never sends, never writes to the ledger.
    svc.notify_order_ready(OrderId::new(404)).await;
    assert!(mailer.sent_emails().is_empty());
    assert_eq!(store.ledger_len(), 0);
}

#[tokio::test]
async fn delay_notification_renders_delay_details() {
    let mut state = StoreState::default();
    state.templates.insert(
        "delivery-delayed".to_owned(),
        template(
            "delivery-delayed",
            "Update on order #{{order_id}}",
            "<p>{{reason}}; new estimate {{new_estimate}}.</p>",
        ),
    );
    state.orders.insert(9, order(9, "ada@example.com"));

    let store = Arc::new(InMemoryStore::with_state(state));
    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(store, Arc::clone(&mailer));

    svc.notify_delivery_delayed(
        OrderId::new(9),
        DelayInfo {
            reason: "heavy rain".to_owned(),
            new_estimate: "about 20 more minutes".to_owned(),
        },
    )
    .await;

    let sent = mailer.sent_emails();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].html.contains("heavy rain"));
    assert!(sent[0].html.contains("about 20 more minutes"));
}

// ---------------------------------------------------------------------
// Cleanup and the job table
// ---------------------------------------------------------------------

#[tokio::test]
async fn cleanup_purges_stale_sessions_and_old_ledger_rows() {
    let mut state = StoreState::default();
    state.sessions.push(cart("old@example.com", 8 * 24));
    state.sessions.push(cart("fresh@example.com", 6 * 24));

    let store = Arc::new(InMemoryStore::with_state(state));
    store
        .record_automated_send(
            EmailType::CartAbandoned,
            &common::email("old@example.com"),
            "ancient-session",
            Utc::now() - chrono::Duration::days(45),
        )
        .await
        .expect("seed ledger");

    let mailer = Arc::new(RecordingMailer::new());
    let svc = service(Arc::clone(&store), mailer);

    let stats = svc.run_cleanup().await.expect("cleanup");
    assert_eq!(stats.sessions_deleted, 1);
    assert_eq!(stats.log_rows_deleted, 1);
}

#[tokio::test]
async fn job_table_declares_all_four_cadences() {
    let store = Arc::new(InMemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let svc = Arc::new(service(store, mailer));

    let jobs = svc.jobs();
    let table: Vec<(&str, &str)> = jobs.iter().map(|j| (j.name, j.schedule)).collect();
    assert_eq!(
        table,
        vec![
            ("abandoned-cart-scan", "0 * * * *"),
            ("cart-reminder-scan", "0 */6 * * *"),
            ("scheduled-newsletter-scan", "*/15 * * * *"),
            ("retention-cleanup", "0 2 * * *"),
        ]
    );
}
