//! Refresh session storage.
//!
//! Each row backs exactly one live refresh token. Only the hash of the
//! token is stored; rotation swaps the hash with a conditional update so
//! that a given token can be exchanged at most once.

use sqlx::sqlite::SqlitePool;

use super::hash_token;

/// A refresh session record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub refresh_token_hash: String,
    pub expires_at: i64,
    pub revoked: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result of a compare-and-swap rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated,
    /// The presented token was already rotated or the session was revoked.
    Conflict,
}

/// Store for refresh sessions.
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new session for the given plaintext refresh token.
    pub async fn create(
        &self,
        user_id: &str,
        refresh_token: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<Session, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let token_hash = hash_token(refresh_token);

        sqlx::query(
            "INSERT INTO sessions (id, user_id, refresh_token_hash, expires_at, revoked, created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&token_hash)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Session {
            id,
            user_id: user_id.to_string(),
            refresh_token_hash: token_hash,
            expires_at,
            revoked: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up an unrevoked, unexpired session by plaintext token.
    pub async fn find_active_by_token(
        &self,
        refresh_token: &str,
        now: i64,
    ) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, user_id, refresh_token_hash, expires_at, revoked, created_at, updated_at FROM sessions WHERE refresh_token_hash = ? AND revoked = 0 AND expires_at > ?",
        )
        .bind(hash_token(refresh_token))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, user_id, refresh_token_hash, expires_at, revoked, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Replace the session's token only if it still holds `old_token` and is unrevoked.
    pub async fn rotate(
        &self,
        session_id: &str,
        old_token: &str,
        new_token: &str,
        new_expires_at: i64,
        now: i64,
    ) -> Result<RotateOutcome, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET refresh_token_hash = ?, expires_at = ?, updated_at = ? WHERE id = ? AND refresh_token_hash = ? AND revoked = 0",
        )
        .bind(hash_token(new_token))
        .bind(new_expires_at)
        .bind(now)
        .bind(session_id)
        .bind(hash_token(old_token))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            RotateOutcome::Rotated
        } else {
            RotateOutcome::Conflict
        })
    }

    /// Revoke a single session.
    pub async fn revoke(&self, session_id: &str, now: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1, updated_at = ? WHERE id = ? AND revoked = 0",
        )
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke every session of a user (logout everywhere).
    pub async fn revoke_all_by_user(&self, user_id: &str, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1, updated_at = ? WHERE user_id = ? AND revoked = 0",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// List a user's usable sessions, newest first.
    pub async fn list_active_by_user(
        &self,
        user_id: &str,
        now: i64,
    ) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, user_id, refresh_token_hash, expires_at, revoked, created_at, updated_at FROM sessions WHERE user_id = ? AND revoked = 0 AND expires_at > ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Delete expired and revoked sessions.
    pub async fn delete_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ? OR revoked = 1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> (Database, String) {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db.users().create("s@example.com", "h", 0).await.unwrap();
        (db, user_id)
    }

    #[tokio::test]
    async fn test_plaintext_is_never_stored() {
        let (db, user_id) = setup().await;
        let session = db.sessions().create(&user_id, "plain", 1_000, 0).await.unwrap();

        assert_ne!(session.refresh_token_hash, "plain");
        let stored: (String,) = sqlx::query_as("SELECT refresh_token_hash FROM sessions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(stored.0, hash_token("plain"));
    }

    #[tokio::test]
    async fn test_find_active_respects_expiry_and_revocation() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let session = sessions.create(&user_id, "tok", 100, 0).await.unwrap();

        assert!(sessions.find_active_by_token("tok", 99).await.unwrap().is_some());
        assert!(sessions.find_active_by_token("tok", 100).await.unwrap().is_none());
        assert!(sessions.find_active_by_token("other", 0).await.unwrap().is_none());

        sessions.revoke(&session.id, 1).await.unwrap();
        assert!(sessions.find_active_by_token("tok", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_is_single_use() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let session = sessions.create(&user_id, "old", 100, 0).await.unwrap();

        assert_eq!(
            sessions.rotate(&session.id, "old", "new", 200, 1).await.unwrap(),
            RotateOutcome::Rotated
        );
        assert_eq!(
            sessions.rotate(&session.id, "old", "newer", 300, 2).await.unwrap(),
            RotateOutcome::Conflict
        );

        let found = sessions.find_active_by_token("new", 2).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.expires_at, 200);
        assert!(sessions.find_active_by_token("old", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_revoked_session_conflicts() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        let session = sessions.create(&user_id, "old", 100, 0).await.unwrap();
        sessions.revoke(&session.id, 1).await.unwrap();

        assert_eq!(
            sessions.rotate(&session.id, "old", "new", 200, 2).await.unwrap(),
            RotateOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn test_revoke_all_and_cleanup() {
        let (db, user_id) = setup().await;
        let sessions = db.sessions();
        sessions.create(&user_id, "a", 100, 0).await.unwrap();
        sessions.create(&user_id, "b", 100, 1).await.unwrap();
        sessions.create(&user_id, "c", 10, 2).await.unwrap();

        assert_eq!(sessions.list_active_by_user(&user_id, 5).await.unwrap().len(), 3);
        assert_eq!(sessions.delete_expired(50).await.unwrap(), 1);

        assert_eq!(sessions.revoke_all_by_user(&user_id, 60).await.unwrap(), 2);
        assert!(sessions.list_active_by_user(&user_id, 61).await.unwrap().is_empty());
        assert_eq!(sessions.delete_expired(61).await.unwrap(), 2);
    }
}
