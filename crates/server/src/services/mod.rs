//! Service layer: template rendering, SMTP transport, the automation
//! service itself, the newsletter send routine, and the cron scheduler.

pub mod automation;
pub mod email;
pub mod newsletter;
pub mod scheduler;
pub mod template;

pub use automation::{AutomationStore, CleanupStats, EmailAutomationService, ScanOutcome};
pub use email::{Mailer, MailerError, OutgoingEmail, SmtpMailer};
pub use newsletter::{NewsletterAdmin, NewsletterError, RateLimitPolicy, SendOutcome};
pub use scheduler::{JobSpec, Scheduler};
