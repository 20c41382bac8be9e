//! SMTP transport abstraction.
//!
//! Uses SMTP via lettre for delivery. The [`Mailer`] trait is the seam the
//! automation service is tested through; production wires in
//! [`SmtpMailer`], tests a recording fake.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::{ContentType, Header, HeaderName, HeaderValue},
    transport::smtp::{Error as SmtpError, authentication::Credentials},
};
use secrecy::ExposeSecret;
use tavola_core::Email;
use thiserror::Error;

use crate::config::EmailConfig;
use crate::models::EmailType;

/// Errors that can occur when sending email.
#[derive(Debug, Error)]
pub enum MailerError {
    /// SMTP transport error.
    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    /// Failed to build email message.
    #[error("Failed to build message: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// The transport refused this recipient.
    #[error("Recipient rejected: {0}")]
    Rejected(String),
}

/// Traceability metadata attached as custom headers.
#[derive(Debug, Clone, Default)]
pub struct MailTrace {
    /// `X-Email-Type` header for automated emails.
    pub email_type: Option<EmailType>,
    /// `X-Newsletter-ID` header for campaign sends.
    pub newsletter_id: Option<i64>,
    /// `X-Session-ID` header tying a cart email back to its session.
    pub session_id: Option<String>,
    /// `List-Unsubscribe` target for bulk email.
    pub unsubscribe_url: Option<String>,
}

/// One outbound email, transport-agnostic.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: Email,
    pub subject: String,
    pub html: String,
    pub trace: MailTrace,
}

/// Outbound mail transport.
///
/// Implementations must fail per-call; the caller owns batch error
/// isolation and timeouts.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send a single email.
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailerError>;
}

macro_rules! trace_header {
    ($type_name:ident, $header_name:literal) => {
        #[derive(Debug, Clone)]
        struct $type_name(String);

        impl Header for $type_name {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($header_name)
            }

            fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(s.to_owned()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

trace_header!(ListUnsubscribe, "List-Unsubscribe");
trace_header!(XEmailType, "X-Email-Type");
trace_header!(XNewsletterId, "X-Newsletter-ID");
trace_header!(XSessionId, "X-Session-ID");

/// SMTP mailer backed by lettre's async transport.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl SmtpMailer {
    /// Create a new mailer from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the relay configuration is invalid.
    pub fn new(config: &EmailConfig) -> Result<Self, SmtpError> {
        let credentials = Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.expose_secret().to_string(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
        })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, MailerError> {
        let mut builder = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|_| MailerError::InvalidAddress(self.from_address.clone()))?,
            )
            .to(email
                .to
                .as_str()
                .parse()
                .map_err(|_| MailerError::InvalidAddress(email.to.to_string()))?)
            .subject(&email.subject);

        if let Some(email_type) = email.trace.email_type {
            builder = builder.header(XEmailType(email_type.to_string()));
        }
        if let Some(newsletter_id) = email.trace.newsletter_id {
            builder = builder.header(XNewsletterId(newsletter_id.to_string()));
        }
        if let Some(session_id) = &email.trace.session_id {
            builder = builder.header(XSessionId(session_id.clone()));
        }
        if let Some(url) = &email.trace.unsubscribe_url {
            builder = builder.header(ListUnsubscribe(format!("<{url}>")));
        }

        Ok(builder
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())?)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailerError> {
        let to = email.to.clone();
        let subject = email.subject.clone();
        let message = self.build_message(&email)?;

        self.transport.send(message).await?;

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}
