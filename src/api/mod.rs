mod auth;
mod error;
mod extractors;
mod ip;
mod jwks;

use axum::{Router, routing::get};

use crate::cli::IpExtractor;
use crate::rate_limit::RateLimitConfig;
use crate::service::CredentialService;

pub use error::ApiError;
pub use extractors::{AuthUser, ClientIp, bearer_token};
pub use ip::extract_client_ip;
pub use jwks::JwksState;

/// State shared by the credential handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: CredentialService,
    pub ip_extractor: Option<IpExtractor>,
}

/// Create the API router, mounted under `/api`.
pub fn create_api_router(state: ApiState, rate_limits: &RateLimitConfig) -> Router {
    Router::new()
        .nest("/auth", auth::router(state.clone(), rate_limits))
        .route("/me", get(auth::me).with_state(state))
}

/// Create the router serving `/.well-known/jwks.json`.
pub fn create_jwks_router(state: JwksState) -> Router {
    jwks::router(state)
}
