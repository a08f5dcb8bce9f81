//! Credential endpoints: registration, confirmation, login, refresh,
//! logout and password management.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    middleware,
    routing::post,
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use super::error::ApiError;
use super::extractors::{AuthUser, ClientIp};
use crate::jwt::IssuedToken;
use crate::rate_limit::{LimiterState, RateLimitConfig, rate_limit};
use crate::service::{RefreshGrant, UserProfile};

/// Create the credential router. Throttled groups get their own limiter.
pub fn router(state: ApiState, limits: &RateLimitConfig) -> Router {
    let login_limiter = LimiterState::new(
        limits.login,
        state.ip_extractor,
        "Too many login attempts. Please wait before trying again.",
    );
    let signup_limiter = LimiterState::new(
        limits.signup,
        state.ip_extractor,
        "Too many signup attempts. Please wait before trying again.",
    );
    let reset_limiter = LimiterState::new(
        limits.password_reset,
        state.ip_extractor,
        "Too many password reset requests. Please wait before trying again.",
    );

    let login_routes = Router::new()
        .route("/login", post(login))
        .route_layer(middleware::from_fn_with_state(login_limiter, rate_limit));

    let signup_routes = Router::new()
        .route("/register", post(register))
        .route("/confirm/resend", post(resend_confirmation))
        .route_layer(middleware::from_fn_with_state(signup_limiter, rate_limit));

    let reset_routes = Router::new()
        .route("/password/forgot", post(forgot_password))
        .route_layer(middleware::from_fn_with_state(reset_limiter, rate_limit));

    Router::new()
        .route("/confirm", post(confirm))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
        .route("/password/reset", post(reset_password))
        .route("/password/change", post(change_password))
        .merge(login_routes)
        .merge(signup_routes)
        .merge(reset_routes)
        .with_state(state)
}

#[derive(Deserialize)]
struct CredentialsRequest {
    email: String,
    password: String,
    #[serde(default)]
    remember: bool,
}

#[derive(Deserialize)]
struct EmailRequest {
    email: String,
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize, Default)]
struct LogoutRequest {
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct ResetPasswordRequest {
    token: String,
    password: String,
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    user_id: String,
    confirmation_expires_at: i64,
}

#[derive(Serialize)]
struct ConfirmResponse {
    confirmed: bool,
    already_confirmed: bool,
}

#[derive(Serialize)]
struct ResendResponse {
    confirmation_expires_at: i64,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserProfile>,
}

impl TokenResponse {
    fn new(access: IssuedToken, refresh: Option<RefreshGrant>, user: Option<UserProfile>) -> Self {
        let (refresh_token, refresh_expires_at) = match refresh {
            Some(grant) => (Some(grant.token), Some(grant.expires_at)),
            None => (None, None),
        };
        Self {
            access_token: access.token,
            token_type: "Bearer",
            expires_at: access.expires_at,
            refresh_token,
            refresh_expires_at,
            user,
        }
    }
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct LogoutAllResponse {
    sessions_revoked: u64,
}

async fn register(
    State(state): State<ApiState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let outcome = state.service.register(&body.email, &body.password).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: outcome.user_id,
            confirmation_expires_at: outcome.confirmation_expires_at,
        }),
    ))
}

async fn confirm(
    State(state): State<ApiState>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let outcome = state.service.confirm_email(&body.token).await?;
    Ok(Json(ConfirmResponse {
        confirmed: true,
        already_confirmed: outcome.already_confirmed,
    }))
}

async fn resend_confirmation(
    State(state): State<ApiState>,
    Json(body): Json<EmailRequest>,
) -> Result<(StatusCode, Json<ResendResponse>), ApiError> {
    let expires_at = state.service.resend_confirmation(&body.email).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ResendResponse {
            confirmation_expires_at: expires_at,
        }),
    ))
}

async fn login(
    State(state): State<ApiState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let outcome = state
        .service
        .login(&body.email, &body.password, &ip, body.remember)
        .await?;
    Ok(Json(TokenResponse::new(
        outcome.access,
        outcome.refresh,
        Some(outcome.user),
    )))
}

async fn refresh(
    State(state): State<ApiState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let outcome = state.service.refresh(&body.refresh_token).await?;
    Ok(Json(TokenResponse::new(
        outcome.access,
        Some(outcome.refresh),
        None,
    )))
}

/// The body is optional: `{"refresh_token": "..."}` also ends that session.
async fn logout(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("Invalid request body"))?
    };

    state
        .service
        .logout(&claims, request.refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout_all(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<LogoutAllResponse>, ApiError> {
    let sessions_revoked = state.service.logout_all(&claims).await?;
    Ok(Json(LogoutAllResponse { sessions_revoked }))
}

async fn forgot_password(
    State(state): State<ApiState>,
    Json(body): Json<EmailRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    state.service.request_password_reset(&body.email).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "If this email is registered, reset instructions were sent",
        }),
    ))
}

async fn reset_password(
    State(state): State<ApiState>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .reset_password(&body.token, &body.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn change_password(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .change_password(&claims, &body.current_password, &body.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/me`
pub(super) async fn me(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<UserProfile>, ApiError> {
    Ok(Json(state.service.current_user(&claims).await?))
}
