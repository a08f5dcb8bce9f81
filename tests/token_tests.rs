//! Token codec tests against a real revocation registry.
//!
//! Tests cover:
//! - Revocation is checked inside verification
//! - Signature and expiry are judged before revocation
//! - RS256 tokens verify against the published discovery document
//! - Key rotation propagates through the document cache after its TTL

mod common;

use common::{START, rsa_keypair};
use credgate::clock::{ManualClock, SharedClock};
use credgate::db::Database;
use credgate::jwks::{Jwks, KeyDocumentCache, KeySource};
use credgate::jwt::{AccessClaims, JwtConfig, VerifyError};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use std::sync::Arc;

fn manual_clock() -> (ManualClock, SharedClock) {
    let clock = ManualClock::new(START);
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

#[tokio::test]
async fn test_revoked_jti_fails_with_revoked() {
    let db = Database::open(":memory:").await.unwrap();
    let (_, clock) = manual_clock();
    let jwt = JwtConfig::hs256(common::JWT_SECRET).with_clock(clock);
    let revocations = db.revoked_tokens();

    let issued = jwt
        .issue_access_token("user-1", "a@x.com", "user", 1, 3600)
        .unwrap();
    let claims = jwt.verify(Some(&issued.token), &revocations).await.unwrap();
    assert_eq!(claims["jti"], issued.jti.as_str());
    assert_eq!(claims["exp"], issued.expires_at);

    revocations
        .revoke(&issued.jti, "user-1", issued.expires_at, Some("logout"), START)
        .await
        .unwrap();

    let err = jwt
        .verify(Some(&issued.token), &revocations)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Revoked));
    assert_eq!(err.reason(), Some("revoked"));
}

#[tokio::test]
async fn test_revocation_does_not_mask_expiry() {
    let db = Database::open(":memory:").await.unwrap();
    let (clock, shared) = manual_clock();
    let jwt = JwtConfig::hs256(common::JWT_SECRET).with_clock(shared);
    let revocations = db.revoked_tokens();

    let issued = jwt
        .issue_access_token("user-1", "a@x.com", "user", 1, 1)
        .unwrap();
    revocations
        .revoke(&issued.jti, "user-1", issued.expires_at, None, START)
        .await
        .unwrap();

    clock.advance(1);
    let err = jwt
        .verify(Some(&issued.token), &revocations)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), Some("invalid_signature_or_exp"));
}

#[tokio::test]
async fn test_other_tokens_unaffected_by_revocation() {
    let db = Database::open(":memory:").await.unwrap();
    let (_, clock) = manual_clock();
    let jwt = JwtConfig::hs256(common::JWT_SECRET).with_clock(clock);
    let revocations = db.revoked_tokens();

    let first = jwt
        .issue_access_token("user-1", "a@x.com", "user", 1, 3600)
        .unwrap();
    let second = jwt
        .issue_access_token("user-1", "a@x.com", "user", 1, 3600)
        .unwrap();
    assert_ne!(first.jti, second.jti);

    revocations
        .revoke(&first.jti, "user-1", first.expires_at, None, START)
        .await
        .unwrap();

    assert!(jwt.verify(Some(&second.token), &revocations).await.is_ok());
}

#[tokio::test]
async fn test_access_claims_round_trip() {
    let db = Database::open(":memory:").await.unwrap();
    let (_, clock) = manual_clock();
    let jwt = JwtConfig::hs256(common::JWT_SECRET)
        .with_clock(clock)
        .with_issuer(Some("https://auth.example.com".to_string()))
        .with_audience(Some("api".to_string()));

    let issued = jwt
        .issue_access_token("user-1", "a@x.com", "admin", 4, 900)
        .unwrap();
    let claims = jwt
        .verify(Some(&issued.token), &db.revoked_tokens())
        .await
        .unwrap();
    let access = AccessClaims::from_claims(claims).unwrap();

    assert_eq!(access.sub, "user-1");
    assert_eq!(access.role, "admin");
    assert_eq!(access.sv, 4);
    assert_eq!(access.iat, START);
    assert_eq!(access.exp, START + 900);
    assert_eq!(access.iss.as_deref(), Some("https://auth.example.com"));
    assert_eq!(access.aud.as_deref(), Some("api"));

    let map = access.clone().into_claims();
    assert_eq!(map["sub"], "user-1");
    assert_eq!(AccessClaims::from_claims(map).unwrap(), access);
}

#[tokio::test]
async fn test_rs256_token_verifies_with_published_key() {
    let (private, public) = rsa_keypair();
    let (_, clock) = manual_clock();
    let jwt = JwtConfig::rs256(&private, &public, "primary")
        .unwrap()
        .with_clock(clock);

    let issued = jwt
        .issue_access_token("user-1", "a@x.com", "user", 1, 3600)
        .unwrap();

    let public_pem = String::from_utf8(public).unwrap();
    let document = Jwks::from_public_pem(&public_pem, "primary");
    let jwk = document.find_by_kid("primary").unwrap();
    assert_eq!(jwk.kty, "RSA");
    assert_eq!(jwk.alg, "RS256");

    // A third party holding only the document can verify the signature.
    let key = DecodingKey::from_rsa_components(
        jwk.n.as_deref().unwrap(),
        jwk.e.as_deref().unwrap(),
    )
    .unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<serde_json::Value>(&issued.token, &key, &validation).unwrap();
    assert_eq!(data.claims["sub"], "user-1");
    assert_eq!(data.header.kid.as_deref(), Some("primary"));
}

#[tokio::test]
async fn test_rotated_key_file_propagates_after_ttl() {
    let dir = std::env::temp_dir().join(format!("credgate-jwks-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("public.pem");

    let (_, first_public) = rsa_keypair();
    let (_, second_public) = rsa_keypair();
    std::fs::write(&path, &first_public).unwrap();

    let (clock, shared) = manual_clock();
    let cache = KeyDocumentCache::new(KeySource::File(path.clone()), "primary", 300, shared);

    let first = cache.get_or_refresh().await.unwrap();
    assert_eq!(cache.last_fetched().await, Some(START));

    std::fs::write(&path, &second_public).unwrap();
    clock.advance(299);
    let cached = cache.get_or_refresh().await.unwrap();
    assert_eq!(cached.keys[0].n, first.keys[0].n);

    clock.advance(1);
    let refreshed = cache.get_or_refresh().await.unwrap();
    assert_ne!(refreshed.keys[0].n, first.keys[0].n);
    assert_eq!(cache.last_fetched().await, Some(START + 300));

    std::fs::remove_dir_all(&dir).ok();
}
