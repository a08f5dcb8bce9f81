//! Shared error handling for API endpoints.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::error::AuthError;

/// API error type with automatic response conversion.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized {
        message: String,
        reason: Option<&'static str>,
    },
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests {
        message: String,
        retry_after_secs: i64,
    },
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn too_many_requests(msg: impl Into<String>, retry_after_secs: i64) -> Self {
        Self::TooManyRequests {
            message: msg.into(),
            retry_after_secs,
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Validation(msg) => ApiError::BadRequest(msg),
            AuthError::Authentication(message) => ApiError::Unauthorized {
                message,
                reason: None,
            },
            AuthError::InvalidToken(e) => ApiError::Unauthorized {
                message: "Invalid or expired token".to_string(),
                reason: e.reason(),
            },
            AuthError::RateLimited {
                retry_after_secs,
                message,
            } => ApiError::TooManyRequests {
                message,
                retry_after_secs,
            },
            AuthError::Conflict(msg) => ApiError::Conflict(msg),
            AuthError::NotFound(msg) => ApiError::NotFound(msg),
            AuthError::Forbidden(msg) => ApiError::Forbidden(msg),
            AuthError::Dependency(msg) => {
                error!(error = %msg, "Dependency failure");
                ApiError::ServiceUnavailable(msg)
            }
            AuthError::Store(e) => {
                error!(error = %e, "Database error");
                ApiError::Internal("Database error".to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<i64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut reason = None;
        let mut retry_after = None;
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized { message, reason: r } => {
                reason = r;
                (StatusCode::UNAUTHORIZED, message)
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests {
                message,
                retry_after_secs,
            } => {
                retry_after = Some(retry_after_secs);
                (StatusCode::TOO_MANY_REQUESTS, message)
            }
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: message,
                reason,
                retry_after,
            }),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(0)));
        }
        response
    }
}
