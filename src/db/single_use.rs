//! Single-use tokens for email confirmation and password reset.
//!
//! At most one live token per user and purpose. Reissuing replaces the row
//! and stamps `last_sent_at`, which the cooldown gate reads.

use sqlx::sqlite::SqlitePool;

use super::hash_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    Verification,
    Reset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::Verification => "verification",
            TokenPurpose::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SingleUseToken {
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: i64,
    pub used: bool,
    pub used_at: Option<i64>,
    pub created_at: i64,
    pub last_sent_at: i64,
}

impl SingleUseToken {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

struct Queries {
    issue: &'static str,
    find: &'static str,
    mark_used: &'static str,
    delete: &'static str,
    last_sent_at: &'static str,
    purge: &'static str,
}

static VERIFICATION: Queries = Queries {
    issue: "INSERT INTO email_verification_tokens (user_id, token_hash, expires_at, used, used_at, created_at, last_sent_at) VALUES (?, ?, ?, 0, NULL, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET token_hash = excluded.token_hash, expires_at = excluded.expires_at, used = 0, used_at = NULL, created_at = excluded.created_at, last_sent_at = excluded.last_sent_at",
    find: "SELECT user_id, token_hash, expires_at, used, used_at, created_at, last_sent_at FROM email_verification_tokens WHERE token_hash = ?",
    mark_used: "UPDATE email_verification_tokens SET used = 1, used_at = ? WHERE user_id = ? AND used = 0",
    delete: "DELETE FROM email_verification_tokens WHERE user_id = ?",
    last_sent_at: "SELECT last_sent_at FROM email_verification_tokens WHERE user_id = ?",
    // Used rows answer replayed confirmations, so only unused ones expire.
    purge: "DELETE FROM email_verification_tokens WHERE expires_at <= ? AND used = 0",
};

static RESET: Queries = Queries {
    issue: "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at, used, used_at, created_at, last_sent_at) VALUES (?, ?, ?, 0, NULL, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET token_hash = excluded.token_hash, expires_at = excluded.expires_at, used = 0, used_at = NULL, created_at = excluded.created_at, last_sent_at = excluded.last_sent_at",
    find: "SELECT user_id, token_hash, expires_at, used, used_at, created_at, last_sent_at FROM password_reset_tokens WHERE token_hash = ?",
    mark_used: "UPDATE password_reset_tokens SET used = 1, used_at = ? WHERE user_id = ? AND used = 0",
    delete: "DELETE FROM password_reset_tokens WHERE user_id = ?",
    last_sent_at: "SELECT last_sent_at FROM password_reset_tokens WHERE user_id = ?",
    purge: "DELETE FROM password_reset_tokens WHERE expires_at <= ?",
};

pub struct SingleUseTokenStore {
    pool: SqlitePool,
    purpose: TokenPurpose,
}

impl SingleUseTokenStore {
    pub fn new(pool: SqlitePool, purpose: TokenPurpose) -> Self {
        Self { pool, purpose }
    }

    fn queries(&self) -> &'static Queries {
        match self.purpose {
            TokenPurpose::Verification => &VERIFICATION,
            TokenPurpose::Reset => &RESET,
        }
    }

    /// Store a fresh token for the user, replacing any previous one.
    pub async fn issue(
        &self,
        user_id: &str,
        plaintext: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(self.queries().issue)
            .bind(user_id)
            .bind(hash_token(plaintext))
            .bind(expires_at)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_token(
        &self,
        plaintext: &str,
    ) -> Result<Option<SingleUseToken>, sqlx::Error> {
        sqlx::query_as(self.queries().find)
            .bind(hash_token(plaintext))
            .fetch_optional(&self.pool)
            .await
    }

    /// Consume the token and confirm its user in one transaction.
    /// Returns false if the token was already used; nothing is written then.
    pub async fn consume_and_confirm(&self, user_id: &str, now: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        if !self.mark_used_in(&mut tx, user_id, now).await? {
            return Ok(false);
        }
        sqlx::query("UPDATE users SET confirmed = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Consume the token and apply a password reset in one transaction: new
    /// hash, confirmed address, bumped session version and every refresh
    /// session revoked. Returns the number of revoked sessions, or None if
    /// the token was already used.
    pub async fn consume_and_reset(
        &self,
        user_id: &str,
        password_hash: &str,
        now: i64,
    ) -> Result<Option<u64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        if !self.mark_used_in(&mut tx, user_id, now).await? {
            return Ok(None);
        }
        sqlx::query(
            "UPDATE users SET password_hash = ?, confirmed = 1, session_version = session_version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(password_hash)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        let revoked = sqlx::query(
            "UPDATE sessions SET revoked = 1, updated_at = ? WHERE user_id = ? AND revoked = 0",
        )
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(revoked.rows_affected()))
    }

    async fn mark_used_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        now: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(self.queries().mark_used)
            .bind(now)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(self.queries().delete)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// When a token was last sent to this user, if one exists.
    pub async fn last_sent_at(&self, user_id: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(self.queries().last_sent_at)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn purge_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(self.queries().purge)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
