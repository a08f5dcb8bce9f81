//! Refresh session rotation tests.
//!
//! Tests cover:
//! - Concurrent rotations of the same token: exactly one wins
//! - Replaying a rotated refresh token through the service
//! - Revoked and expired sessions cannot be rotated or found
//! - Logout of one session leaves the others usable

mod common;

use common::{START, setup};
use credgate::db::{Database, RotateOutcome, generate_token};
use credgate::error::AuthError;

#[tokio::test]
async fn test_concurrent_rotation_exactly_one_wins() {
    let db = Database::open(":memory:").await.unwrap();
    let user_id = db.users().create("a@x.com", "hash", START).await.unwrap();
    let sessions = db.sessions();
    let session = sessions
        .create(&user_id, "old-token", START + 3600, START)
        .await
        .unwrap();

    let first = db.sessions();
    let second = db.sessions();
    let (a, b) = tokio::join!(
        first.rotate(&session.id, "old-token", "new-a", START + 7200, START + 1),
        second.rotate(&session.id, "old-token", "new-b", START + 7200, START + 1),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let rotated = outcomes
        .iter()
        .filter(|o| **o == RotateOutcome::Rotated)
        .count();
    assert_eq!(rotated, 1);
    assert!(outcomes.contains(&RotateOutcome::Conflict));

    let stored = sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, START + 7200);
    assert_eq!(stored.updated_at, START + 1);
    assert!(!stored.revoked);

    assert!(
        sessions
            .find_active_by_token("old-token", START + 2)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_concurrent_rotation_on_file_database() {
    let path = std::env::temp_dir().join(format!("credgate-rotate-{}.db", uuid::Uuid::new_v4()));
    let db = Database::open(path.to_str().unwrap()).await.unwrap();
    let user_id = db.users().create("a@x.com", "hash", START).await.unwrap();
    let session = db
        .sessions()
        .create(&user_id, "shared-token", START + 3600, START)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        let session_id = session.id.clone();
        handles.push(tokio::spawn(async move {
            db.sessions()
                .rotate(
                    &session_id,
                    "shared-token",
                    &generate_token(),
                    START + 7200,
                    START + 1,
                )
                .await
                .unwrap()
        }));
    }

    let mut rotated = 0;
    for handle in handles {
        if handle.await.unwrap() == RotateOutcome::Rotated {
            rotated += 1;
        }
    }
    assert_eq!(rotated, 1);

    db.pool().close().await;
    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_refresh_replay_is_conflict_or_rejected() {
    let ctx = setup().await;
    ctx.confirmed_user("a@x.com").await;

    let login = ctx
        .service
        .login("a@x.com", common::PASSWORD, "1.2.3.4", true)
        .await
        .unwrap();
    let original = login.refresh.unwrap().token;

    let refreshed = ctx.service.refresh(&original).await.unwrap();
    assert_ne!(refreshed.refresh.token, original);

    // The old token no longer matches an active session.
    let err = ctx.service.refresh(&original).await.unwrap_err();
    assert!(matches!(err, AuthError::Authentication(_)));

    // The new one works exactly once.
    let again = ctx.service.refresh(&refreshed.refresh.token).await.unwrap();
    assert!(ctx.service.refresh(&refreshed.refresh.token).await.is_err());
    assert!(ctx.service.refresh(&again.refresh.token).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_service_refresh_single_winner() {
    let ctx = setup().await;
    ctx.confirmed_user("a@x.com").await;
    let login = ctx
        .service
        .login("a@x.com", common::PASSWORD, "1.2.3.4", true)
        .await
        .unwrap();
    let token = login.refresh.unwrap().token;

    let (a, b) = tokio::join!(ctx.service.refresh(&token), ctx.service.refresh(&token));
    let results = [a, b];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        loser,
        AuthError::Conflict(_) | AuthError::Authentication(_)
    ));
}

#[tokio::test]
async fn test_revoked_and_expired_sessions() {
    let db = Database::open(":memory:").await.unwrap();
    let user_id = db.users().create("a@x.com", "hash", START).await.unwrap();
    let sessions = db.sessions();

    let revoked = sessions
        .create(&user_id, "revoked", START + 3600, START)
        .await
        .unwrap();
    assert!(sessions.revoke(&revoked.id, START).await.unwrap());
    assert_eq!(
        sessions
            .rotate(&revoked.id, "revoked", "next", START + 7200, START)
            .await
            .unwrap(),
        RotateOutcome::Conflict
    );

    sessions
        .create(&user_id, "short", START + 10, START)
        .await
        .unwrap();
    assert!(
        sessions
            .find_active_by_token("short", START + 9)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        sessions
            .find_active_by_token("short", START + 10)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_logout_revokes_only_presented_session() {
    let ctx = setup().await;
    ctx.confirmed_user("a@x.com").await;

    let phone = ctx
        .service
        .login("a@x.com", common::PASSWORD, "1.2.3.4", true)
        .await
        .unwrap();
    let laptop = ctx
        .service
        .login("a@x.com", common::PASSWORD, "1.2.3.4", true)
        .await
        .unwrap();

    let claims = ctx
        .service
        .authenticate(Some(&phone.access.token))
        .await
        .unwrap();
    let phone_refresh = phone.refresh.unwrap().token;
    ctx.service
        .logout(&claims, Some(&phone_refresh))
        .await
        .unwrap();

    assert!(ctx.service.refresh(&phone_refresh).await.is_err());
    assert!(
        ctx.service
            .authenticate(Some(&phone.access.token))
            .await
            .is_err()
    );

    assert!(
        ctx.service
            .refresh(&laptop.refresh.unwrap().token)
            .await
            .is_ok()
    );
    assert!(
        ctx.service
            .authenticate(Some(&laptop.access.token))
            .await
            .is_ok()
    );
}
