//! Access token revocation registry, keyed by `jti`.
//!
//! Rows only need to outlive the token they revoke; once `expires_at` has
//! passed the token fails on expiry alone and the row is purged.

use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct RevokedTokenStore {
    pool: SqlitePool,
}

impl RevokedTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a revocation. Revoking the same `jti` twice is a no-op.
    pub async fn revoke(
        &self,
        jti: &str,
        user_id: &str,
        expires_at: i64,
        reason: Option<&str>,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO revoked_tokens (jti, user_id, revoked_at, expires_at, reason) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(jti)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_revoked(&self, jti: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM revoked_tokens WHERE jti = ?")
            .bind(jti)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Delete records whose token has expired anyway.
    pub async fn purge_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
