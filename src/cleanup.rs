//! Scheduled cleanup of expired credential rows.

use crate::clock::SharedClock;
use crate::db::{Database, TokenPurpose};
use std::time::Duration;
use tracing::{error, info};

/// Attempt counters idle for this long (and not locked) are dropped.
const STALE_ATTEMPT_AGE_SECS: i64 = 24 * 60 * 60;

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Rows removed by one cleanup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub revoked_tokens: u64,
    pub sessions: u64,
    pub verification_tokens: u64,
    pub reset_tokens: u64,
    pub attempt_counters: u64,
}

/// Run all cleanup tasks once.
pub async fn run_cleanup(db: &Database, clock: &SharedClock) -> CleanupReport {
    let now = clock.now();
    let mut report = CleanupReport::default();

    match db.revoked_tokens().purge_expired(now).await {
        Ok(count) => report.revoked_tokens = count,
        Err(e) => error!("Failed to purge revoked tokens: {}", e),
    }

    match db.sessions().delete_expired(now).await {
        Ok(count) => report.sessions = count,
        Err(e) => error!("Failed to clean up sessions: {}", e),
    }

    match db.single_use(TokenPurpose::Verification).purge_expired(now).await {
        Ok(count) => report.verification_tokens = count,
        Err(e) => error!("Failed to clean up confirmation tokens: {}", e),
    }

    match db.single_use(TokenPurpose::Reset).purge_expired(now).await {
        Ok(count) => report.reset_tokens = count,
        Err(e) => error!("Failed to clean up reset tokens: {}", e),
    }

    match db
        .attempts()
        .purge_stale(now - STALE_ATTEMPT_AGE_SECS, now)
        .await
    {
        Ok(count) => report.attempt_counters = count,
        Err(e) => error!("Failed to clean up login attempts: {}", e),
    }

    if report != CleanupReport::default() {
        info!(
            revoked_tokens = report.revoked_tokens,
            sessions = report.sessions,
            verification_tokens = report.verification_tokens,
            reset_tokens = report.reset_tokens,
            attempt_counters = report.attempt_counters,
            "Cleanup finished"
        );
    }
    report
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(db: Database, clock: SharedClock) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(&db, &clock).await;
        }
    })
}
