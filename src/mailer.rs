//! Outbound transactional email.
//!
//! Delivery itself belongs to an external sender behind the [`Mailer`]
//! trait. This module renders the two messages the service sends and
//! retries transient failures a bounded number of times.

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailError(pub String);

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to send email: {}", self.0)
    }
}

impl std::error::Error for MailError {}

pub trait Mailer: Send + Sync {
    fn send<'a>(&'a self, email: &'a OutgoingEmail) -> BoxFuture<'a, Result<(), MailError>>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send<'a>(&'a self, email: &'a OutgoingEmail) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            // Bodies carry live tokens and are only logged at debug.
            info!(to = %email.to, subject = %email.subject, "Email (not delivered)");
            debug!(to = %email.to, body = %email.body, "Email body");
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Send with exponential backoff. Returns the last error once attempts run out.
pub async fn send_with_retry(
    mailer: &dyn Mailer,
    email: &OutgoingEmail,
    policy: RetryPolicy,
) -> Result<(), MailError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match mailer.send(email).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => {
                warn!(to = %email.to, attempts, error = %e, "Giving up on email");
                return Err(e);
            }
            Err(e) => {
                warn!(to = %email.to, attempt, error = %e, "Email send failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

pub fn confirmation_email(
    to: &str,
    public_url: &str,
    token: &str,
    ttl_minutes: i64,
) -> OutgoingEmail {
    let link = format!("{}/confirm?token={}", public_url.trim_end_matches('/'), token);
    OutgoingEmail {
        to: to.to_string(),
        subject: "Confirm your email address".to_string(),
        body: format!(
            "Welcome!\n\nConfirm your email address by opening the link below:\n\n{link}\n\n\
             This link expires in {ttl_minutes} minutes.\n\n\
             If you did not create an account, you can ignore this message.\n"
        ),
    }
}

pub fn password_reset_email(
    to: &str,
    public_url: &str,
    token: &str,
    ttl_minutes: i64,
) -> OutgoingEmail {
    let link = format!("{}/reset-password?token={}", public_url.trim_end_matches('/'), token);
    OutgoingEmail {
        to: to.to_string(),
        subject: "Reset your password".to_string(),
        body: format!(
            "We received a request to reset your password.\n\n\
             Choose a new password by opening the link below:\n\n{link}\n\n\
             This link expires in {ttl_minutes} minutes.\n\n\
             If you did not ask for this, your password stays unchanged.\n"
        ),
    }
}
