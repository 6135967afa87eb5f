use chrono::{DateTime, Utc};
use serde::Serialize;

#[cfg(feature = "web")]
use crate::app::AppState;
use crate::error::StoreError;
use crate::stats::{ArchiveOutcome, StatsRecord};
use crate::store::Database;
#[cfg(feature = "web")]
use std::sync::Arc;

/// Totals of one archive pass over every account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveRun {
    pub users: usize,
    pub weekly_rolled: usize,
    pub monthly_rolled: usize,
    pub failed: usize,
}

fn load(db: &Database, username: &str) -> Result<(crate::auth::User, StatsRecord), StoreError> {
    let user = db
        .user(username)?
        .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
    let stats = db.stats(username)?;
    Ok((user, stats))
}

/// Recomputes a user's stats from their readings and stores the result
pub fn refresh_user(
    db: &Database,
    username: &str,
    now: DateTime<Utc>,
) -> Result<StatsRecord, StoreError> {
    let (user, mut stats) = load(db, username)?;
    let readings = db.readings(username)?;

    let outcome = stats.refresh(&readings, &user.profile.thresholds(), now);
    if outcome.any() {
        log::info!("Rolled stats of {} over: {:?}", username, outcome);
    }
    db.save_stats(username, &stats)?;
    Ok(stats)
}

/// Rolls a user's weekly/monthly stats over if a new period has begun
///
/// Stats are only written back when something rolled.
pub fn archive_user(
    db: &Database,
    username: &str,
    now: DateTime<Utc>,
) -> Result<ArchiveOutcome, StoreError> {
    let (user, mut stats) = load(db, username)?;
    let readings = db.readings(username)?;

    let outcome = stats.archive(&readings, &user.profile.thresholds(), now);
    if outcome.any() {
        db.save_stats(username, &stats)?;
    }
    Ok(outcome)
}

/// Archives every account; a failing account is logged and skipped
pub fn archive_all(db: &Database, now: DateTime<Utc>) -> Result<ArchiveRun, StoreError> {
    let mut run = ArchiveRun::default();

    for username in db.usernames()? {
        run.users += 1;
        match archive_user(db, &username, now) {
            Ok(outcome) => {
                run.weekly_rolled += usize::from(outcome.weekly);
                run.monthly_rolled += usize::from(outcome.monthly);
            }
            Err(e) => {
                log::warn!("Failed to archive stats of {}: {}", username, e);
                run.failed += 1;
            }
        }
    }

    Ok(run)
}

/// Runs [`archive_all`] on a fixed interval for the lifetime of the server
///
/// Expired sessions are purged on the same tick.
#[cfg(feature = "web")]
pub fn spawn_archiver(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = std::time::Duration::from_secs(state.config.archive_interval_seconds);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let task_state = state.clone();
            let result =
                tokio::task::spawn_blocking(move || archive_all(&task_state.db, Utc::now())).await;

            match result {
                Ok(Ok(run)) if run.weekly_rolled + run.monthly_rolled > 0 || run.failed > 0 => {
                    log::info!("Stats archive pass: {:?}", run)
                }
                Ok(Ok(run)) => log::debug!("Stats archive pass: {:?}", run),
                Ok(Err(e)) => log::error!("Stats archive pass failed: {}", e),
                Err(e) => log::error!("Stats archive task panicked: {}", e),
            }

            let purged = state.sessions.purge_expired();
            if purged > 0 {
                log::debug!("Purged {} expired sessions", purged);
            }
        }
    })
}
