//! Error taxonomy for credential operations.
//!
//! The service decides the kind; the transport maps kinds to status codes.

use std::fmt;

use crate::jwt::{JwtError, VerifyError};
use crate::mailer::MailError;

#[derive(Debug)]
pub enum AuthError {
    /// Malformed caller input, rejected before any store access.
    Validation(String),
    /// Bad credentials or an unusable refresh/single-use token.
    Authentication(String),
    /// Access token rejected by the codec or the session version check.
    InvalidToken(VerifyError),
    /// Lockout or cooldown active.
    RateLimited {
        retry_after_secs: i64,
        message: String,
    },
    Conflict(String),
    NotFound(String),
    Forbidden(String),
    /// An outbound collaborator failed, or key material is unusable.
    Dependency(String),
    Store(sqlx::Error),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        AuthError::Validation(message.into())
    }

    pub fn rate_limited(retry_after_secs: i64, message: impl Into<String>) -> Self {
        AuthError::RateLimited {
            retry_after_secs,
            message: message.into(),
        }
    }

    pub fn retry_after(&self) -> Option<i64> {
        match self {
            AuthError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Validation(msg) => write!(f, "{}", msg),
            AuthError::Authentication(msg) => write!(f, "{}", msg),
            AuthError::InvalidToken(e) => write!(f, "{}", e),
            AuthError::RateLimited { message, .. } => write!(f, "{}", message),
            AuthError::Conflict(msg) => write!(f, "{}", msg),
            AuthError::NotFound(msg) => write!(f, "{}", msg),
            AuthError::Forbidden(msg) => write!(f, "{}", msg),
            AuthError::Dependency(msg) => write!(f, "{}", msg),
            AuthError::Store(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::InvalidToken(e) => Some(e),
            AuthError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        AuthError::Store(e)
    }
}

impl From<VerifyError> for AuthError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Store(e) => AuthError::Store(e),
            other => AuthError::InvalidToken(other),
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        AuthError::Dependency(e.to_string())
    }
}

impl From<MailError> for AuthError {
    fn from(e: MailError) -> Self {
        AuthError::Dependency(e.to_string())
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(e: argon2::password_hash::Error) -> Self {
        AuthError::Dependency(format!("Password hashing failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_store_error_is_not_a_token_rejection() {
        let err: AuthError = VerifyError::Store(sqlx::Error::PoolClosed).into();
        assert!(matches!(err, AuthError::Store(_)));

        let err: AuthError = VerifyError::Revoked.into();
        assert!(matches!(err, AuthError::InvalidToken(VerifyError::Revoked)));
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        assert_eq!(AuthError::rate_limited(42, "slow down").retry_after(), Some(42));
        assert_eq!(
            AuthError::Authentication("Invalid email or password".into()).retry_after(),
            None
        );
    }
}
