mod attempts;
mod revoked;
mod session;
mod single_use;
mod user;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub use attempts::{AttemptCounter, AttemptStore};
pub use revoked::RevokedTokenStore;
pub use session::{RotateOutcome, Session, SessionStore};
pub use single_use::{SingleUseToken, SingleUseTokenStore, TokenPurpose};
pub use user::{User, UserRole, UserStore};

/// Hash an opaque token for storage: base64url(SHA-256(token)).
pub fn hash_token(plaintext: &str) -> String {
    URL_SAFE_NO_PAD.encode(openssl::sha::sha256(plaintext.as_bytes()))
}

/// Generate a random opaque token (256 bits, base64url).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create a database at the given path.
    /// Use ":memory:" for an in-memory database.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let (url, max_connections) = if path == ":memory:" {
            // Every connection to sqlite::memory: is its own database.
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite:{}?mode=rwc", path), 5)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the current schema version.
    async fn get_version(&self) -> Result<i32, sqlx::Error> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(result.map(|r| r.0).unwrap_or(0))
    }

    /// Set the schema version within a transaction.
    async fn set_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        version: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM schema_version")
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Run database migrations.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let version = self.get_version().await?;

        if version < 1 {
            self.migrate_v1().await?;
        }

        Ok(())
    }

    /// Execute a list of queries in a transaction, then set the version.
    async fn run_migration(
        &self,
        version: i32,
        queries: &[&'static str],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for query in queries {
            sqlx::query(*query).execute(&mut *tx).await?;
        }
        Self::set_version(&mut tx, version).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn migrate_v1(&self) -> Result<(), sqlx::Error> {
        self.run_migration(
            1,
            &[
                "CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    email TEXT UNIQUE NOT NULL COLLATE NOCASE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'user',
                    session_version INTEGER NOT NULL DEFAULT 1,
                    confirmed INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                // One row per live refresh token; only the hash is stored.
                "CREATE TABLE sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    refresh_token_hash TEXT UNIQUE NOT NULL,
                    expires_at INTEGER NOT NULL,
                    revoked INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                "CREATE INDEX idx_sessions_user_id ON sessions(user_id)",
                "CREATE INDEX idx_sessions_expires_at ON sessions(expires_at)",
                "CREATE TABLE revoked_tokens (
                    jti TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    revoked_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    reason TEXT
                )",
                "CREATE INDEX idx_revoked_tokens_expires_at ON revoked_tokens(expires_at)",
                "CREATE TABLE login_attempts_ip (
                    email TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    last_attempt_at INTEGER NOT NULL,
                    locked_until INTEGER,
                    PRIMARY KEY (email, ip)
                )",
                "CREATE TABLE login_attempts_email (
                    email TEXT PRIMARY KEY,
                    attempts INTEGER NOT NULL,
                    last_attempt_at INTEGER NOT NULL,
                    locked_until INTEGER
                )",
                "CREATE TABLE email_verification_tokens (
                    user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                    token_hash TEXT UNIQUE NOT NULL,
                    expires_at INTEGER NOT NULL,
                    used INTEGER NOT NULL DEFAULT 0,
                    used_at INTEGER,
                    created_at INTEGER NOT NULL,
                    last_sent_at INTEGER NOT NULL
                )",
                "CREATE TABLE password_reset_tokens (
                    user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                    token_hash TEXT UNIQUE NOT NULL,
                    expires_at INTEGER NOT NULL,
                    used INTEGER NOT NULL DEFAULT 0,
                    used_at INTEGER,
                    created_at INTEGER NOT NULL,
                    last_sent_at INTEGER NOT NULL
                )",
            ],
        )
        .await
    }

    /// Get the user store.
    pub fn users(&self) -> UserStore {
        UserStore::new(self.pool.clone())
    }

    /// Get the refresh session store.
    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.pool.clone())
    }

    /// Get the access token revocation registry.
    pub fn revoked_tokens(&self) -> RevokedTokenStore {
        RevokedTokenStore::new(self.pool.clone())
    }

    /// Get the failed login attempt counters.
    pub fn attempts(&self) -> AttemptStore {
        AttemptStore::new(self.pool.clone())
    }

    /// Get the single-use token store for one purpose.
    pub fn single_use(&self, purpose: TokenPurpose) -> SingleUseTokenStore {
        SingleUseTokenStore::new(self.pool.clone(), purpose)
    }

    /// Get the underlying connection pool (for tests that need raw SQL access).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
