#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response, header};
use credgate::cli::{ClientIpHeader, IpExtractor};
use credgate::clock::{ManualClock, SharedClock};
use credgate::db::Database;
use credgate::jwks::KeySource;
use credgate::jwt::JwtConfig;
use credgate::mailer::{MailError, Mailer, OutgoingEmail, RetryPolicy};
use credgate::rate_limit::RateLimitConfig;
use credgate::service::{AuthSettings, CredentialService};
use credgate::{ServerConfig, create_app};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed starting instant for manual clocks.
pub const START: i64 = 1_700_000_000;

pub const PASSWORD: &str = "correct horse battery";

pub const JWT_SECRET: &[u8] = b"test-jwt-secret-that-is-long-enough";

/// Mailer that records every message and can be told to fail.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    /// Token from the most recent message sent to `to`.
    pub fn last_token_for(&self, to: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|m| m.to == to)
            .and_then(|m| token_from_body(&m.body))
    }
}

impl Mailer for RecordingMailer {
    fn send<'a>(&'a self, email: &'a OutgoingEmail) -> BoxFuture<'a, Result<(), MailError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MailError("relay unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        })
    }
}

fn token_from_body(body: &str) -> Option<String> {
    let start = body.find("token=")? + "token=".len();
    let token: String = body[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!token.is_empty()).then_some(token)
}

pub fn test_settings() -> AuthSettings {
    AuthSettings {
        mail_retry: RetryPolicy {
            attempts: 2,
            base_delay: Duration::ZERO,
        },
        ..AuthSettings::default()
    }
}

pub fn rsa_keypair() -> (Vec<u8>, Vec<u8>) {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    let key = openssl::pkey::PKey::from_rsa(rsa).unwrap();
    (
        key.private_key_to_pem_pkcs8().unwrap(),
        key.public_key_to_pem().unwrap(),
    )
}

/// Service, database and clock wired together the way the server does it.
pub struct TestContext {
    pub db: Database,
    pub clock: ManualClock,
    pub mailer: Arc<RecordingMailer>,
    pub service: CredentialService,
}

impl TestContext {
    /// Register and confirm an account, returning its id.
    pub async fn confirmed_user(&self, email: &str) -> String {
        let outcome = self.service.register(email, PASSWORD).await.unwrap();
        let token = self.mailer.last_token_for(email).unwrap();
        self.service.confirm_email(&token).await.unwrap();
        outcome.user_id
    }
}

pub async fn setup() -> TestContext {
    setup_with(test_settings()).await
}

pub async fn setup_with(settings: AuthSettings) -> TestContext {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let clock = ManualClock::new(START);
    let shared: SharedClock = Arc::new(clock.clone());
    let mailer = Arc::new(RecordingMailer::default());
    let jwt = JwtConfig::hs256(JWT_SECRET).with_clock(shared.clone());
    let service = CredentialService::new(
        db.clone(),
        Arc::new(jwt),
        mailer.clone(),
        shared,
        settings,
    );
    TestContext {
        db,
        clock,
        mailer,
        service,
    }
}

/// A routed app plus handles on its state.
pub struct TestApp {
    pub app: axum::Router,
    pub db: Database,
    pub clock: ManualClock,
    pub mailer: Arc<RecordingMailer>,
}

pub async fn create_test_app() -> TestApp {
    create_test_app_with(
        JwtConfig::hs256(JWT_SECRET),
        None,
        RateLimitConfig::permissive(),
    )
    .await
}

pub async fn create_test_app_with(
    jwt: JwtConfig,
    public_key: Option<KeySource>,
    rate_limits: RateLimitConfig,
) -> TestApp {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let clock = ManualClock::new(START);
    let mailer = Arc::new(RecordingMailer::default());
    let config = ServerConfig {
        db: db.clone(),
        jwt,
        public_key,
        settings: test_settings(),
        mailer: mailer.clone(),
        clock: Arc::new(clock.clone()),
        ip_extractor: Some(IpExtractor::from(ClientIpHeader::XForwardedFor)),
        rate_limits,
    };
    TestApp {
        app: create_app(&config),
        db,
        clock,
        mailer,
    }
}

/// JSON request from a fixed client address.
pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Forwarded-For", "203.0.113.7")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header("X-Forwarded-For", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
