//! Failed login tracking and temporary lockout.
//!
//! Two independent scopes are counted on every failure: the (email, ip)
//! pair and the email alone. Either scope locks once it reaches its
//! threshold. [`AttemptTracker::check_locks`] runs before any password
//! comparison and performs no writes.

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::db::Database;
use crate::service::normalize_email;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_per_ip: i64,
    pub lock_ip_secs: i64,
    pub max_per_email: i64,
    pub lock_email_secs: i64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_per_ip: 5,
            lock_ip_secs: 15 * 60,
            max_per_email: 10,
            lock_email_secs: 30 * 60,
        }
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// Still below both thresholds; the caller answers 401.
    UnderThreshold { attempts: i64 },
    /// A scope just locked; the caller answers 429.
    Locked { retry_after_secs: i64 },
}

#[derive(Clone)]
pub struct AttemptTracker {
    db: Database,
    policy: LockoutPolicy,
    clock: SharedClock,
}

impl AttemptTracker {
    pub fn new(db: Database, policy: LockoutPolicy, clock: SharedClock) -> Self {
        Self { db, policy, clock }
    }

    /// Seconds until the login may be retried, if either scope is locked.
    pub async fn check_locks(&self, email: &str, ip: &str) -> Result<Option<i64>, sqlx::Error> {
        let email = normalize_email(email);
        let now = self.clock.now();
        let store = self.db.attempts();

        let ip_lock = store
            .get_ip(&email, ip)
            .await?
            .and_then(|c| c.remaining_lock(now));
        let email_lock = store
            .get_email(&email)
            .await?
            .and_then(|c| c.remaining_lock(now));

        Ok(ip_lock.max(email_lock))
    }

    /// Count a failure in both scopes and lock whichever reached its threshold.
    pub async fn register_failed_attempt(
        &self,
        email: &str,
        ip: &str,
    ) -> Result<AttemptVerdict, sqlx::Error> {
        let email = normalize_email(email);
        let now = self.clock.now();
        let store = self.db.attempts();

        let ip_counter = store.increment_ip(&email, ip, now).await?;
        let email_counter = store.increment_email(&email, now).await?;

        let mut retry_after = None;
        if ip_counter.attempts >= self.policy.max_per_ip {
            store
                .lock_ip(&email, ip, now + self.policy.lock_ip_secs)
                .await?;
            retry_after = Some(self.policy.lock_ip_secs);
        }
        if email_counter.attempts >= self.policy.max_per_email {
            store
                .lock_email(&email, now + self.policy.lock_email_secs)
                .await?;
            retry_after = retry_after.max(Some(self.policy.lock_email_secs));
        }

        Ok(match retry_after {
            Some(retry_after_secs) => {
                warn!(
                    email = %email,
                    ip = %ip,
                    ip_attempts = ip_counter.attempts,
                    email_attempts = email_counter.attempts,
                    retry_after_secs,
                    "Login locked after repeated failures"
                );
                AttemptVerdict::Locked { retry_after_secs }
            }
            None => {
                debug!(
                    email = %email,
                    ip = %ip,
                    attempts = ip_counter.attempts,
                    "Failed login recorded"
                );
                AttemptVerdict::UnderThreshold {
                    attempts: ip_counter.attempts,
                }
            }
        })
    }

    /// Reset counters after a successful authentication. Never fails the caller.
    pub async fn clear_attempts(&self, email: &str, ip: Option<&str>) {
        let email = normalize_email(email);
        if let Err(e) = self.db.attempts().clear(&email, ip).await {
            warn!(email = %email, error = %e, "Failed to clear login attempts");
        }
    }
}
