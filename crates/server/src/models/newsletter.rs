//! Newsletter campaign entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tavola_core::{Email, NewsletterId, NewsletterSendId};

/// Who a newsletter is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetAudience {
    /// Every distinct customer email that has placed an order.
    AllCustomers,
    /// Only opted-in newsletter subscribers.
    #[default]
    NewsletterSubscribers,
}

/// A newsletter campaign.
///
/// Lifecycle: created as an inactive draft, activated, then sent either
/// immediately through the admin API or by the scheduled dispatcher once
/// `scheduled_date` arrives. Rolling stats accumulate across sends.
#[derive(Debug, Clone, Serialize)]
pub struct Newsletter {
    pub id: NewsletterId,
    pub title: String,
    pub subject: String,
    pub body_html: String,
    pub is_active: bool,
    pub is_scheduled: bool,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub target_audience: TargetAudience,
    /// Optional segment filter; empty means no filtering.
    pub customer_segments: Vec<String>,
    /// Monthly send cap; `None` means unlimited.
    pub max_sends_per_month: Option<i32>,
    /// Minimum days between sends; `None` means no spacing requirement.
    pub min_days_between_sends: Option<i32>,
    /// Total emails delivered across all sends.
    pub total_sent: i64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One send event, the audit trail for rate limiting and analytics.
#[derive(Debug, Clone, Serialize)]
pub struct NewsletterSend {
    pub id: NewsletterSendId,
    pub newsletter_id: NewsletterId,
    pub sent_at: DateTime<Utc>,
    pub recipient_count: i32,
    pub delivered_count: i32,
    pub error_count: i32,
}

/// A resolved newsletter recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: Email,
    pub name: Option<String>,
}

/// Aggregate totals for the admin stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewsletterStats {
    pub newsletter_count: i64,
    pub active_count: i64,
    pub scheduled_count: i64,
    pub send_count: i64,
    pub total_delivered: i64,
    pub total_errors: i64,
}

/// Payload for creating a newsletter draft.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNewsletter {
    pub title: String,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub target_audience: TargetAudience,
    #[serde(default)]
    pub customer_segments: Vec<String>,
    pub max_sends_per_month: Option<i32>,
    pub min_days_between_sends: Option<i32>,
}

/// Partial update for a newsletter; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNewsletter {
    pub title: Option<String>,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub is_active: Option<bool>,
    pub is_scheduled: Option<bool>,
    /// Double-option: `Some(None)` clears the schedule.
    #[serde(default, with = "double_option")]
    pub scheduled_date: Option<Option<DateTime<Utc>>>,
    pub target_audience: Option<TargetAudience>,
    pub customer_segments: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    pub max_sends_per_month: Option<Option<i32>>,
    #[serde(default, with = "double_option")]
    pub min_days_between_sends: Option<Option<i32>>,
}

/// Serde helper distinguishing "absent" from "explicitly null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_target_audience_wire_form() {
        assert_eq!(
            serde_json::to_string(&TargetAudience::AllCustomers).unwrap(),
            "\"all_customers\""
        );
        let parsed: TargetAudience = serde_json::from_str("\"newsletter_subscribers\"").unwrap();
        assert_eq!(parsed, TargetAudience::NewsletterSubscribers);
    }

    #[test]
    fn test_update_scheduled_date_absent_vs_null() {
        let absent: UpdateNewsletter = serde_json::from_str("{}").unwrap();
        assert!(absent.scheduled_date.is_none());

        let cleared: UpdateNewsletter =
            serde_json::from_str(r#"{"scheduled_date": null}"#).unwrap();
        assert_eq!(cleared.scheduled_date, Some(None));
    }

    #[test]
    fn test_create_defaults() {
        let create: CreateNewsletter = serde_json::from_str(
            r#"{"title":"Spring menu","subject":"New dishes","body_html":"<p>Hi {{name}}</p>"}"#,
        )
        .unwrap();
        assert_eq!(create.target_audience, TargetAudience::NewsletterSubscribers);
        assert!(create.customer_segments.is_empty());
        assert!(create.max_sends_per_month.is_none());
    }
}
