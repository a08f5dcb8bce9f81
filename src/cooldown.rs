//! Minimum spacing between reissues of a single-use token.
//!
//! Independent of the token's own expiry: the gate only looks at when the
//! previous token was sent.

use crate::clock::SharedClock;
use crate::db::SingleUseTokenStore;

pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Ready,
    Wait { retry_after_secs: i64 },
}

#[derive(Clone)]
pub struct CooldownGate {
    window_secs: i64,
    clock: SharedClock,
}

impl CooldownGate {
    pub fn new(window_secs: i64, clock: SharedClock) -> Self {
        Self { window_secs, clock }
    }

    pub fn check(&self, last_sent_at: Option<i64>) -> CooldownDecision {
        let Some(last_sent_at) = last_sent_at else {
            return CooldownDecision::Ready;
        };
        let elapsed = self.clock.now() - last_sent_at;
        if elapsed >= self.window_secs {
            CooldownDecision::Ready
        } else {
            CooldownDecision::Wait {
                retry_after_secs: self.window_secs - elapsed.max(0),
            }
        }
    }

    /// Read the user's last send time from `store` and decide.
    pub async fn check_user(
        &self,
        store: &SingleUseTokenStore,
        user_id: &str,
    ) -> Result<CooldownDecision, sqlx::Error> {
        Ok(self.check(store.last_sent_at(user_id).await?))
    }
}
