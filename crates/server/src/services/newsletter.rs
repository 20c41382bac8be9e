//! Newsletter rate limiting and send accounting types.
//!
//! The send routine itself lives on
//! [`crate::services::automation::EmailAutomationService`] since it is
//! shared between the scheduled dispatcher and the admin API. This module
//! holds the policy check as a pure function so the boundary cases are
//! unit-testable without a store.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tavola_core::NewsletterId;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::models::{CreateNewsletter, Newsletter, NewsletterStats, UpdateNewsletter};

/// Per-newsletter send pacing policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitPolicy {
    /// Cap on sends within one calendar month; `None` means unlimited.
    pub max_sends_per_month: Option<i32>,
    /// Minimum days since the previous send; `None` means none required.
    pub min_days_between_sends: Option<i32>,
}

impl From<&Newsletter> for RateLimitPolicy {
    fn from(newsletter: &Newsletter) -> Self {
        Self {
            max_sends_per_month: newsletter.max_sends_per_month,
            min_days_between_sends: newsletter.min_days_between_sends,
        }
    }
}

/// Why a send attempt was refused by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitViolation {
    /// The calendar month's cap is already reached.
    #[error("monthly send cap of {cap} already reached")]
    MonthlyCapReached {
        /// Configured cap.
        cap: i32,
    },

    /// Not enough days have passed since the last send.
    #[error("minimum spacing of {required_days} days not met ({elapsed_days} elapsed)")]
    TooSoon {
        /// Required spacing in days.
        required_days: i32,
        /// Days actually elapsed since the last send.
        elapsed_days: i64,
    },
}

/// Failures surfaced by the newsletter send routine.
#[derive(Debug, Error)]
pub enum NewsletterError {
    /// No newsletter with the requested id.
    #[error("newsletter not found")]
    NotFound,

    /// The newsletter is still a draft.
    #[error("newsletter is not active")]
    NotActive,

    /// Scheduling was requested without a scheduled date.
    #[error("newsletter has no scheduled date")]
    NotScheduled,

    /// The rate limiter refused the send.
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitViolation),

    /// Persistence failure.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Persistence port for the admin newsletter API.
///
/// Split from [`crate::services::automation::AutomationStore`] so the
/// HTTP handlers depend only on the CRUD surface and can be driven over
/// an in-memory store in tests. The production implementation is
/// `PgAutomationStore`.
#[async_trait]
pub trait NewsletterAdmin: Send + Sync {
    /// List all newsletters, newest first.
    async fn list(&self) -> Result<Vec<Newsletter>, RepositoryError>;

    /// Fetch one newsletter.
    async fn get(&self, id: NewsletterId) -> Result<Option<Newsletter>, RepositoryError>;

    /// Create an inactive, unscheduled draft.
    async fn create(&self, input: CreateNewsletter) -> Result<Newsletter, RepositoryError>;

    /// Apply a partial update and return the new state.
    async fn update(
        &self,
        id: NewsletterId,
        patch: UpdateNewsletter,
    ) -> Result<Newsletter, RepositoryError>;

    /// Delete a newsletter and its send history.
    async fn delete(&self, id: NewsletterId) -> Result<(), RepositoryError>;

    /// Aggregate totals for the stats endpoint.
    async fn stats(&self) -> Result<NewsletterStats, RepositoryError>;
}

/// Result of one completed newsletter send.
#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    /// Recipients resolved for the audience.
    pub recipients: usize,
    /// Emails accepted by the transport.
    pub delivered: usize,
    /// Per-recipient failures (batch continued past them).
    pub errors: usize,
}

/// Check a send attempt against the policy.
///
/// `sends_this_month` must be the count of audit rows in the same
/// calendar month as `now`. Callers enforcing atomicity run this inside
/// the reservation transaction with the newsletter row locked.
///
/// # Errors
///
/// Returns the violated rule; the monthly cap is checked first, matching
/// the original behavior of rejecting capped newsletters regardless of
/// spacing.
pub fn check_rate_limit(
    policy: &RateLimitPolicy,
    sends_this_month: i64,
    last_sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), RateLimitViolation> {
    if let Some(cap) = policy.max_sends_per_month
        && sends_this_month >= i64::from(cap)
    {
        return Err(RateLimitViolation::MonthlyCapReached { cap });
    }

    if let Some(required_days) = policy.min_days_between_sends
        && let Some(last) = last_sent_at
    {
        let elapsed_days = (now - last).num_days();
        if elapsed_days < i64::from(required_days) {
            return Err(RateLimitViolation::TooSoon {
                required_days,
                elapsed_days,
            });
        }
    }

    Ok(())
}

/// True if two instants fall in the same calendar month.
///
/// Used by store implementations to bucket audit rows for the cap check.
#[must_use]
pub fn same_calendar_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_monthly_cap_rejects_second_send() {
        let policy = RateLimitPolicy {
            max_sends_per_month: Some(1),
            min_days_between_sends: None,
        };
        let now = at(2025, 3, 20);
        assert!(check_rate_limit(&policy, 0, None, now).is_ok());
        assert_eq!(
            check_rate_limit(&policy, 1, Some(at(2025, 3, 5)), now),
            Err(RateLimitViolation::MonthlyCapReached { cap: 1 })
        );
    }

    #[test]
    fn test_monthly_cap_wins_over_spacing() {
        // Cap of 1 rejects even when the spacing requirement is long met.
        let policy = RateLimitPolicy {
            max_sends_per_month: Some(1),
            min_days_between_sends: Some(1),
        };
        let now = at(2025, 3, 28);
        assert!(matches!(
            check_rate_limit(&policy, 1, Some(at(2025, 3, 1)), now),
            Err(RateLimitViolation::MonthlyCapReached { .. })
        ));
    }

    #[test]
    fn test_min_days_boundary() {
        let policy = RateLimitPolicy {
            max_sends_per_month: None,
            min_days_between_sends: Some(7),
        };
        let sent = at(2025, 3, 1);

        assert_eq!(
            check_rate_limit(&policy, 1, Some(sent), sent + Duration::days(3)),
            Err(RateLimitViolation::TooSoon {
                required_days: 7,
                elapsed_days: 3,
            })
        );
        assert!(check_rate_limit(&policy, 1, Some(sent), sent + Duration::days(8)).is_ok());
        // Exactly the required spacing is allowed.
        assert!(check_rate_limit(&policy, 1, Some(sent), sent + Duration::days(7)).is_ok());
    }

    #[test]
    fn test_no_policy_always_allows() {
        let policy = RateLimitPolicy::default();
        assert!(check_rate_limit(&policy, 1000, Some(at(2025, 3, 1)), at(2025, 3, 1)).is_ok());
    }

    #[test]
    fn test_never_sent_passes_spacing() {
        let policy = RateLimitPolicy {
            max_sends_per_month: None,
            min_days_between_sends: Some(30),
        };
        assert!(check_rate_limit(&policy, 0, None, at(2025, 3, 1)).is_ok());
    }

    #[test]
    fn test_same_calendar_month() {
        assert!(same_calendar_month(at(2025, 3, 1), at(2025, 3, 31)));
        assert!(!same_calendar_month(at(2025, 3, 31), at(2025, 4, 1)));
        assert!(!same_calendar_month(at(2024, 3, 1), at(2025, 3, 1)));
    }
}
