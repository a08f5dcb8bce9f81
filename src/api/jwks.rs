//! Public key discovery endpoint.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tracing::error;

use super::error::ApiError;
use crate::jwks::KeyDocumentCache;

/// `None` when tokens are signed with a shared secret and there is nothing to publish.
pub type JwksState = Option<Arc<KeyDocumentCache>>;

pub fn router(state: JwksState) -> Router {
    Router::new()
        .route("/.well-known/jwks.json", get(get_jwks))
        .with_state(state)
}

async fn get_jwks(State(cache): State<JwksState>) -> Response {
    let Some(cache) = cache else {
        return ApiError::service_unavailable("No public key configured").into_response();
    };

    match cache.get_or_refresh().await {
        Ok(document) => {
            let cache_control = format!("public, max-age={}", cache.ttl_secs());
            let mut response = Json(document.as_ref().clone()).into_response();
            if let Ok(value) = HeaderValue::from_str(&cache_control) {
                response.headers_mut().insert(header::CACHE_CONTROL, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to load public key");
            ApiError::service_unavailable("Public key unavailable").into_response()
        }
    }
}
