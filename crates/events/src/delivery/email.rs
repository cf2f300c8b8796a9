//! Email delivery via SMTP.
//!
//! [`EmailSender`] wraps the `lettre` async SMTP transport (STARTTLS relay).
//! Configuration is loaded from environment variables; if `SMTP_HOST` is not
//! set, [`EmailConfig::from_env`] returns `None` and the email channel stays
//! unregistered. The same sender delivers instant notifications and digests.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use pitchey_core::channels::Channel;

use super::{ChannelSender, OutboundMessage, SendError, SendReceipt};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error building the email sender from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// SMTP transport-level failure (TLS parameters, relay setup).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// The sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
}

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "Pitchey <noreply@pitchey.local>";

/// Subject prefix for every notification email.
const SUBJECT_PREFIX: &str = "[Pitchey]";

/// Configuration for the SMTP relay.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (defaults to 587).
    pub smtp_port: u16,
    /// RFC 5322 "From" address.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl EmailConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMTP_HOST` is not set.
    ///
    /// | Variable        | Required | Default                           |
    /// |-----------------|----------|-----------------------------------|
    /// | `SMTP_HOST`     | yes      |                                   |
    /// | `SMTP_PORT`     | no       | `587`                             |
    /// | `SMTP_FROM`     | no       | `Pitchey <noreply@pitchey.local>` |
    /// | `SMTP_USER`     | no       |                                   |
    /// | `SMTP_PASSWORD` | no       |                                   |
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok().filter(|h| !h.is_empty())?;
        Some(Self {
            smtp_host,
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

// ---------------------------------------------------------------------------
// EmailSender
// ---------------------------------------------------------------------------

/// Sends notification and digest emails through one pooled SMTP transport.
#[derive(Debug)]
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Result<Self, EmailError> {
        let from: Mailbox = config.from_address.parse()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port);
        if let (Some(user), Some(pass)) = (config.smtp_user, config.smtp_password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            host: config.smtp_host,
        })
    }

    fn message_id(&self, message: &OutboundMessage) -> String {
        format!(
            "{}.{}@{}",
            message.notification_id, message.attempt_id, self.host
        )
    }

    fn build(&self, message: &OutboundMessage, message_id: &str) -> Result<Message, SendError> {
        let to: Mailbox = message
            .require_recipient()?
            .parse()
            .map_err(|e| SendError::InvalidRecipient(format!("unparseable email address: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(format!("{SUBJECT_PREFIX} {}", message.title))
            .message_id(Some(format!("<{message_id}>")))
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| SendError::Transport(format!("email build error: {e}")))
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let message_id = self.message_id(message);
        let email = self.build(message, &message_id)?;

        match self.transport.send(email).await {
            Ok(_) => {
                tracing::info!(
                    attempt_id = message.attempt_id,
                    user_id = message.user_id,
                    event_type = %message.event_type,
                    "Notification email sent"
                );
                Ok(SendReceipt {
                    provider_ref: message_id,
                })
            }
            Err(e) if e.is_permanent() => Err(SendError::InvalidRecipient(format!(
                "SMTP permanent rejection: {e}"
            ))),
            Err(e) => Err(SendError::Transport(format!("SMTP error: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
