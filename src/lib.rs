pub mod api;
pub mod cleanup;
pub mod cli;
pub mod clock;
pub mod cooldown;
pub mod db;
pub mod error;
pub mod jwks;
pub mod jwt;
pub mod keys;
pub mod lockout;
pub mod mailer;
pub mod password;
pub mod rate_limit;
pub mod service;

use api::{ApiState, create_api_router, create_jwks_router};
use axum::Router;
use clock::SharedClock;
use db::Database;
use jwks::{DEFAULT_CACHE_TTL_SECS, KeyDocumentCache, KeySource};
use jwt::JwtConfig;
use mailer::Mailer;
use rate_limit::RateLimitConfig;
use service::{AuthSettings, CredentialService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Access token signing and verification keys
    pub jwt: JwtConfig,
    /// Where to read the public key published at `/.well-known/jwks.json` (RS256 only)
    pub public_key: Option<KeySource>,
    /// Token lifetimes, lockout thresholds and mail settings
    pub settings: AuthSettings,
    /// Outbound email transport
    pub mailer: Arc<dyn Mailer>,
    /// Time source for every expiry, lock and cooldown decision
    pub clock: SharedClock,
    /// IP extraction strategy (requires running behind a proxy)
    pub ip_extractor: Option<cli::IpExtractor>,
    /// Per-IP request quotas for the throttled endpoints
    pub rate_limits: RateLimitConfig,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let jwt = Arc::new(config.jwt.clone().with_clock(config.clock.clone()));

    let service = CredentialService::new(
        config.db.clone(),
        jwt.clone(),
        config.mailer.clone(),
        config.clock.clone(),
        config.settings.clone(),
    );

    let api_router = create_api_router(
        ApiState {
            service,
            ip_extractor: config.ip_extractor,
        },
        &config.rate_limits,
    );

    let key_cache = config.public_key.clone().map(|source| {
        Arc::new(KeyDocumentCache::new(
            source,
            jwt.kid().unwrap_or_default(),
            DEFAULT_CACHE_TTL_SECS,
            config.clock.clone(),
        ))
    });

    Router::new()
        .nest("/api", api_router)
        .merge(create_jwks_router(key_cache))
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(db: &Database, clock: &SharedClock) {
    cleanup::run_cleanup(db, clock).await;
    cleanup::spawn_cleanup_scheduler(db.clone(), clock.clone());
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Call `init_cleanup` before this to run cleanup on startup.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task.
/// Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), std::io::Error> {
    init_cleanup(&config.db, &config.clock).await;

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        run_server(config, listener).await.ok();
    });

    Ok((handle, local_addr))
}
