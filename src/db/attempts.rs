//! Failed login counters in two scopes: per (email, ip) and per email.

use sqlx::sqlite::SqlitePool;

/// One counter row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AttemptCounter {
    pub attempts: i64,
    pub last_attempt_at: i64,
    pub locked_until: Option<i64>,
}

impl AttemptCounter {
    /// Seconds until the lock lifts, if a lock is active at `now`.
    pub fn remaining_lock(&self, now: i64) -> Option<i64> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

pub struct AttemptStore {
    pool: SqlitePool,
}

// A counter whose lock has already lifted starts again from 1.
const INCREMENT_IP: &str = "INSERT INTO login_attempts_ip (email, ip, attempts, last_attempt_at, locked_until) VALUES (?, ?, 1, ?, NULL)
    ON CONFLICT(email, ip) DO UPDATE SET
        attempts = CASE WHEN locked_until IS NOT NULL AND locked_until <= excluded.last_attempt_at THEN 1 ELSE attempts + 1 END,
        locked_until = CASE WHEN locked_until IS NOT NULL AND locked_until <= excluded.last_attempt_at THEN NULL ELSE locked_until END,
        last_attempt_at = excluded.last_attempt_at
    RETURNING attempts, last_attempt_at, locked_until";

const INCREMENT_EMAIL: &str = "INSERT INTO login_attempts_email (email, attempts, last_attempt_at, locked_until) VALUES (?, 1, ?, NULL)
    ON CONFLICT(email) DO UPDATE SET
        attempts = CASE WHEN locked_until IS NOT NULL AND locked_until <= excluded.last_attempt_at THEN 1 ELSE attempts + 1 END,
        locked_until = CASE WHEN locked_until IS NOT NULL AND locked_until <= excluded.last_attempt_at THEN NULL ELSE locked_until END,
        last_attempt_at = excluded.last_attempt_at
    RETURNING attempts, last_attempt_at, locked_until";

impl AttemptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Increment the (email, ip) counter and return it after the update.
    pub async fn increment_ip(
        &self,
        email: &str,
        ip: &str,
        now: i64,
    ) -> Result<AttemptCounter, sqlx::Error> {
        sqlx::query_as(INCREMENT_IP)
            .bind(email)
            .bind(ip)
            .bind(now)
            .fetch_one(&self.pool)
            .await
    }

    /// Increment the email counter and return it after the update.
    pub async fn increment_email(
        &self,
        email: &str,
        now: i64,
    ) -> Result<AttemptCounter, sqlx::Error> {
        sqlx::query_as(INCREMENT_EMAIL)
            .bind(email)
            .bind(now)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_ip(
        &self,
        email: &str,
        ip: &str,
    ) -> Result<Option<AttemptCounter>, sqlx::Error> {
        sqlx::query_as(
            "SELECT attempts, last_attempt_at, locked_until FROM login_attempts_ip WHERE email = ? AND ip = ?",
        )
        .bind(email)
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_email(&self, email: &str) -> Result<Option<AttemptCounter>, sqlx::Error> {
        sqlx::query_as(
            "SELECT attempts, last_attempt_at, locked_until FROM login_attempts_email WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn lock_ip(&self, email: &str, ip: &str, until: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE login_attempts_ip SET locked_until = ? WHERE email = ? AND ip = ?")
            .bind(until)
            .bind(email)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn lock_email(&self, email: &str, until: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE login_attempts_email SET locked_until = ? WHERE email = ?")
            .bind(until)
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the email counter and the (email, ip) counter.
    /// Without an IP, every (email, *) counter is deleted.
    pub async fn clear(&self, email: &str, ip: Option<&str>) -> Result<(), sqlx::Error> {
        match ip {
            Some(ip) => {
                sqlx::query("DELETE FROM login_attempts_ip WHERE email = ? AND ip = ?")
                    .bind(email)
                    .bind(ip)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM login_attempts_ip WHERE email = ?")
                    .bind(email)
                    .execute(&self.pool)
                    .await?;
            }
        }
        sqlx::query("DELETE FROM login_attempts_email WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete unlocked counters idle since before `idle_before`.
    pub async fn purge_stale(&self, idle_before: i64, now: i64) -> Result<u64, sqlx::Error> {
        let ip = sqlx::query(
            "DELETE FROM login_attempts_ip WHERE last_attempt_at < ? AND (locked_until IS NULL OR locked_until <= ?)",
        )
        .bind(idle_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let email = sqlx::query(
            "DELETE FROM login_attempts_email WHERE last_attempt_at < ? AND (locked_until IS NULL OR locked_until <= ?)",
        )
        .bind(idle_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(ip.rows_affected() + email.rows_affected())
    }
}
