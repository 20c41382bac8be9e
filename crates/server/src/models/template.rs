//! Stored email templates and the automated email taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tavola_core::TemplateId;

/// An admin-editable HTML email template.
///
/// Templates live in the database so the restaurant staff can edit copy
/// without a deploy. Placeholder syntax is handled by
/// [`crate::services::template::render`].
#[derive(Debug, Clone, Serialize)]
pub struct EmailTemplate {
    pub id: TemplateId,
    /// Lookup key, matches an [`EmailType`] name for automated emails.
    pub name: String,
    /// Subject line, may itself contain placeholders.
    pub subject: String,
    pub body_html: String,
    /// Inactive templates are skipped by the scans.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The kinds of automated email the service sends.
///
/// The string form doubles as the template lookup key and the
/// `email_type` column of the dedupe ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmailType {
    CartAbandoned,
    CartReminder,
    OrderReady,
    DeliveryStarted,
    DeliveryDelayed,
}

impl EmailType {
    /// Ledger and template name for this email type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CartAbandoned => "cart-abandoned",
            Self::CartReminder => "cart-reminder",
            Self::OrderReady => "order-ready",
            Self::DeliveryStarted => "delivery-started",
            Self::DeliveryDelayed => "delivery-delayed",
        }
    }
}

impl std::fmt::Display for EmailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
