//! Failed-login lockout through the credential service.
//!
//! Tests cover:
//! - Per-IP lock after five failures, reported on the sixth attempt
//! - Locked logins are refused even with the right password
//! - Per-email lock across many addresses
//! - A successful login resets both counters
//! - Counting restarts once a lock has expired

mod common;

use common::{PASSWORD, setup};
use credgate::error::AuthError;

const EMAIL: &str = "a@x.com";
const IP: &str = "1.2.3.4";

async fn fail_login(ctx: &common::TestContext, ip: &str) -> AuthError {
    ctx.service
        .login(EMAIL, "wrong password", ip, false)
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_ip_lock_after_five_failures() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    for _ in 0..4 {
        assert!(matches!(
            fail_login(&ctx, IP).await,
            AuthError::Authentication(_)
        ));
    }

    // The fifth failure reaches the threshold.
    assert_eq!(fail_login(&ctx, IP).await.retry_after(), Some(900));

    // The sixth attempt is refused before the password is looked at.
    ctx.clock.advance(1);
    let err = ctx
        .service
        .login(EMAIL, PASSWORD, IP, false)
        .await
        .unwrap_err();
    let retry_after = err.retry_after().expect("should be rate limited");
    assert!((retry_after - 900).abs() <= 1, "retry_after = {retry_after}");

    // The lock does not grow while it is active.
    let counter = ctx.db.attempts().get_ip(EMAIL, IP).await.unwrap().unwrap();
    assert_eq!(counter.attempts, 5);
}

#[tokio::test]
async fn test_other_ip_not_locked_by_ip_scope() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    for _ in 0..5 {
        fail_login(&ctx, IP).await;
    }

    let login = ctx
        .service
        .login(EMAIL, PASSWORD, "5.6.7.8", false)
        .await
        .unwrap();
    assert_eq!(login.user.email, EMAIL);
}

#[tokio::test]
async fn test_email_lock_across_addresses() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    for i in 0..9 {
        let err = fail_login(&ctx, &format!("10.0.0.{i}")).await;
        assert!(matches!(err, AuthError::Authentication(_)));
    }
    assert_eq!(
        fail_login(&ctx, "10.0.0.9").await.retry_after(),
        Some(1800)
    );

    let err = ctx
        .service
        .login(EMAIL, PASSWORD, "192.0.2.50", false)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(1800));
}

#[tokio::test]
async fn test_success_clears_counters() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    for _ in 0..3 {
        fail_login(&ctx, IP).await;
    }
    ctx.service.login(EMAIL, PASSWORD, IP, false).await.unwrap();

    let attempts = ctx.db.attempts();
    assert!(attempts.get_ip(EMAIL, IP).await.unwrap().is_none());
    assert!(attempts.get_email(EMAIL).await.unwrap().is_none());

    fail_login(&ctx, IP).await;
    assert_eq!(
        attempts.get_ip(EMAIL, IP).await.unwrap().unwrap().attempts,
        1
    );
    assert_eq!(attempts.get_email(EMAIL).await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_count_restarts_after_lock_expires() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    for _ in 0..5 {
        fail_login(&ctx, IP).await;
    }
    ctx.clock.advance(900);

    assert!(matches!(
        fail_login(&ctx, IP).await,
        AuthError::Authentication(_)
    ));
    let counter = ctx.db.attempts().get_ip(EMAIL, IP).await.unwrap().unwrap();
    assert_eq!(counter.attempts, 1);
    assert_eq!(counter.locked_until, None);
}

#[tokio::test]
async fn test_unknown_email_is_counted_like_a_wrong_password() {
    let ctx = setup().await;

    let err = ctx
        .service
        .login("nobody@x.com", PASSWORD, IP, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthError::Authentication(ref msg) if msg == "Invalid email or password"
    ));

    let counter = ctx
        .db
        .attempts()
        .get_ip("nobody@x.com", IP)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.attempts, 1);
}

#[tokio::test]
async fn test_email_key_is_normalised() {
    let ctx = setup().await;
    ctx.confirmed_user(EMAIL).await;

    ctx.service
        .login("  A@X.com ", "wrong password", IP, false)
        .await
        .unwrap_err();
    let counter = ctx.db.attempts().get_ip(EMAIL, IP).await.unwrap().unwrap();
    assert_eq!(counter.attempts, 1);
}
