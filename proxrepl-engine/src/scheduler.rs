//! Scheduler
//!
//! Single-threaded minute-tick loop: evaluates cron expressions across all
//! job families, dispatches due jobs as background tasks, displaces the
//! next fire time for retry policies and triggers the daily summary.
//! Single-flight is enforced by the pipelines' conditional state updates;
//! a rejected dispatch is only a warning here.

use crate::db::{
    host_backup_jobs, migration_jobs, recovery_jobs, settings, sync_jobs, Database,
};
use crate::hostbackup::HostBackupPipeline;
use crate::migration::MigrationPipeline;
use crate::notify::NotificationTrigger;
use crate::recovery::{RecoveryPipeline, RecoveryScope};
use crate::sync::SyncPipeline;
use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use proxrepl_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Transient running states older than this are considered abandoned at
/// startup (seconds).
pub const CRASH_RECOVERY_HORIZON_SECS: i64 = 24 * 3600;

/// Next fire time of a cron expression strictly after the anchor
pub fn next_fire_after(expr: &str, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = crate::validation::parse_cron(expr).ok()?;
    schedule.after(&anchor).next()
}

/// Per-job schedule entry; the expression text is kept so an edited
/// schedule recomputes its fire time on the next tick.
#[derive(Debug, Clone)]
struct ScheduleEntry {
    expr: String,
    next_fire: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RetryState {
    for_last_run: i64,
    due: DateTime<Utc>,
    dispatched: bool,
}

/// The in-memory next-fire map. Mutated only by the scheduler task, so no
/// locking is required; fire times never regress unless the schedule text
/// changes.
#[derive(Debug, Default)]
pub struct ScheduleBook {
    entries: HashMap<String, ScheduleEntry>,
    retries: HashMap<String, RetryState>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the job keyed by `key` is due now. The first evaluation
    /// anchors on `last_run` when present, otherwise on `now`; on firing
    /// the entry advances by one cron step from `now` (not wall-clock), so
    /// slow ticks do not drift.
    pub fn due(
        &mut self,
        key: &str,
        expr: &str,
        last_run: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        let stale = match self.entries.get(key) {
            Some(entry) => entry.expr != expr,
            None => true,
        };

        if stale {
            let anchor = last_run
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .unwrap_or(now);
            let Some(next_fire) = next_fire_after(expr, anchor) else {
                warn!("Unparseable cron expression for {}: {}", key, expr);
                return false;
            };
            self.entries.insert(
                key.to_string(),
                ScheduleEntry {
                    expr: expr.to_string(),
                    next_fire,
                },
            );
        }

        let entry = self.entries.get_mut(key).expect("entry just ensured");
        if now < entry.next_fire {
            return false;
        }

        match next_fire_after(expr, now) {
            Some(next_fire) => entry.next_fire = next_fire,
            None => {
                self.entries.remove(key);
            }
        }

        true
    }

    /// Current fire time, for introspection and tests
    pub fn next_fire(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.next_fire)
    }

    /// Drop the entry of a removed or disabled job
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.retries.remove(key);
    }

    /// Whether a failed run should be retried now. The retry fires once per
    /// failed run, displaced by the delay from the run's end.
    pub fn retry_due(
        &mut self,
        key: &str,
        last_run: Option<i64>,
        last_status: Option<&str>,
        retry_on_failure: bool,
        consecutive_failures: i64,
        max_retries: i64,
        delay_minutes: i64,
        now: DateTime<Utc>,
    ) -> bool {
        if !retry_on_failure
            || last_status != Some("failed")
            || consecutive_failures == 0
            || consecutive_failures >= max_retries
        {
            self.retries.remove(key);
            return false;
        }

        let Some(last_run) = last_run else {
            return false;
        };
        let Some(run_end) = Utc.timestamp_opt(last_run, 0).single() else {
            return false;
        };

        let state = self.retries.entry(key.to_string()).or_insert(RetryState {
            for_last_run: last_run,
            due: run_end + chrono::Duration::minutes(delay_minutes),
            dispatched: false,
        });

        // A newer failure resets the pending retry
        if state.for_last_run != last_run {
            *state = RetryState {
                for_last_run: last_run,
                due: run_end + chrono::Duration::minutes(delay_minutes),
                dispatched: false,
            };
        }

        if state.dispatched || now < state.due {
            return false;
        }

        state.dispatched = true;
        true
    }
}

/// Daily summary bookkeeping: at most one send per UTC date, in the
/// configured hour.
pub fn summary_due(
    enabled: bool,
    configured_hour: u32,
    last_sent: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> bool {
    enabled && now.hour() == configured_hour && last_sent != Some(now.date_naive())
}

pub struct Scheduler {
    db: Arc<Database>,
    sync: Arc<SyncPipeline>,
    recovery: Arc<RecoveryPipeline>,
    migration: Arc<MigrationPipeline>,
    host_backup: Arc<HostBackupPipeline>,
    notifier: Arc<NotificationTrigger>,
    book: ScheduleBook,
    last_summary_date: Option<NaiveDate>,
    last_maintenance_date: Option<NaiveDate>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        sync: Arc<SyncPipeline>,
        recovery: Arc<RecoveryPipeline>,
        migration: Arc<MigrationPipeline>,
        host_backup: Arc<HostBackupPipeline>,
        notifier: Arc<NotificationTrigger>,
    ) -> Self {
        Self {
            db,
            sync,
            recovery,
            migration,
            host_backup,
            notifier,
            book: ScheduleBook::new(),
            last_summary_date: None,
            last_maintenance_date: None,
        }
    }

    /// Startup pass: force transient running states older than the horizon
    /// to `failed` with an abandonment note.
    pub async fn recover_abandoned(db: &Database, horizon_secs: i64) -> Result<u64> {
        let pool = db.pool();
        let mut total = 0;

        total += sync_jobs::recover_abandoned(pool, horizon_secs).await?;
        total += recovery_jobs::recover_abandoned(pool, horizon_secs).await?;
        total += migration_jobs::recover_abandoned(pool, horizon_secs).await?;
        total += host_backup_jobs::recover_abandoned(pool, horizon_secs).await?;

        if total > 0 {
            warn!(
                "Crash recovery: {} run(s) marked failed (possibly abandoned)",
                total
            );
        }

        Ok(total)
    }

    /// Spawn the minute-tick loop. Process exit is the universal
    /// cancellation; the loop holds no cancellation handles.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler started");
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if let Err(e) = self.tick(Utc::now()).await {
                    error!("Scheduler tick failed: {}", e);
                }
            }
        })
    }

    /// One evaluation pass
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_sync_jobs(now).await?;
        self.check_recovery_jobs(now).await?;
        self.check_migration_jobs(now).await?;
        self.check_host_backup_jobs(now).await?;
        self.check_daily_summary(now).await?;
        self.check_maintenance(now).await?;
        Ok(())
    }

    async fn check_sync_jobs(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pool = self.db.pool().clone();

        for job in sync_jobs::list_scheduled(&pool).await? {
            let Some(expr) = job.schedule.as_deref() else {
                continue;
            };
            let key = format!("sync_{}", job.id);

            let scheduled_due = self.book.due(&key, expr, job.last_run, now);
            let retry_due = self.book.retry_due(
                &format!("retry_{}", key),
                job.last_run,
                job.last_status.as_deref(),
                job.retry_on_failure,
                job.consecutive_failures,
                job.max_retries,
                job.retry_delay_minutes,
                now,
            );

            if scheduled_due || retry_due {
                if retry_due && !scheduled_due {
                    info!(
                        "Retrying sync job '{}' (failure {}/{})",
                        job.name, job.consecutive_failures, job.max_retries
                    );
                } else {
                    info!("Dispatching scheduled sync job '{}'", job.name);
                }

                let pipeline = self.sync.clone();
                let pool = pool.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    match pipeline.run(&pool, job_id, None, true).await {
                        Ok(_) => {}
                        Err(Error::Conflict(msg)) => warn!("{}", msg),
                        Err(e) => error!("Sync job {} failed: {}", job_id, e),
                    }
                });
            }
        }

        Ok(())
    }

    async fn check_recovery_jobs(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pool = self.db.pool().clone();

        for job in recovery_jobs::list_scheduled(&pool).await? {
            let schedules = [
                ("recovery_backup", job.backup_schedule.as_deref(), RecoveryScope::BackupOnly),
                ("recovery_restore", job.restore_schedule.as_deref(), RecoveryScope::RestoreOnly),
            ];

            for (prefix, expr, scope) in schedules {
                let Some(expr) = expr.filter(|e| !e.is_empty()) else {
                    continue;
                };
                let key = format!("{}_{}", prefix, job.id);

                let scheduled_due = self.book.due(&key, expr, job.last_run, now);
                let retry_due = self.book.retry_due(
                    &format!("retry_{}", key),
                    job.last_run,
                    job.last_status.as_deref(),
                    job.retry_on_failure,
                    job.consecutive_failures,
                    job.max_retries,
                    job.retry_delay_minutes,
                    now,
                );

                if scheduled_due || retry_due {
                    info!("Dispatching scheduled recovery job '{}' ({:?})", job.name, scope);
                    let pipeline = self.recovery.clone();
                    let pool = pool.clone();
                    let job_id = job.id;
                    tokio::spawn(async move {
                        match pipeline.run(&pool, job_id, scope, None, true).await {
                            Ok(_) => {}
                            Err(Error::Conflict(msg)) => warn!("{}", msg),
                            Err(e) => error!("Recovery job {} failed: {}", job_id, e),
                        }
                    });
                }
            }
        }

        Ok(())
    }

    async fn check_migration_jobs(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pool = self.db.pool().clone();

        for job in migration_jobs::list_scheduled(&pool).await? {
            let Some(expr) = job.schedule.as_deref() else {
                continue;
            };
            let key = format!("migration_{}", job.id);

            if self.book.due(&key, expr, job.last_run, now) {
                info!("Dispatching scheduled migration job '{}'", job.name);
                let pipeline = self.migration.clone();
                let pool = pool.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    // Scheduled runs overwrite an existing destination guest
                    match pipeline.run(&pool, job_id, true, None, true).await {
                        Ok(_) => {}
                        Err(Error::Conflict(msg)) => warn!("{}", msg),
                        Err(e) => error!("Migration job {} failed: {}", job_id, e),
                    }
                });
            }
        }

        Ok(())
    }

    async fn check_host_backup_jobs(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pool = self.db.pool().clone();

        for job in host_backup_jobs::list_scheduled(&pool).await? {
            let Some(expr) = job.schedule.as_deref() else {
                continue;
            };
            let key = format!("host_backup_{}", job.id);

            if self.book.due(&key, expr, job.last_run, now) {
                info!("Dispatching scheduled host backup job '{}'", job.name);
                let pipeline = self.host_backup.clone();
                let pool = pool.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    match pipeline.run(&pool, job_id, None, true).await {
                        Ok(_) => {}
                        Err(Error::Conflict(msg)) => warn!("{}", msg),
                        Err(e) => error!("Host backup job {} failed: {}", job_id, e),
                    }
                });
            }
        }

        Ok(())
    }

    /// Daily summary: configuration is re-read every tick so changes apply
    /// without a restart; at most one send per UTC date.
    async fn check_daily_summary(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pool = self.db.pool().clone();
        let enabled = settings::get_bool(&pool, "daily_summary_enabled", true).await;
        let hour = settings::get_int(&pool, "daily_summary_hour", 8).await.clamp(0, 23) as u32;

        if !summary_due(enabled, hour, self.last_summary_date, now) {
            return Ok(());
        }

        info!("Sending daily summary");
        match self.notifier.send_daily_summary(&pool).await {
            Ok(summary) => {
                info!(
                    "Daily summary sent: {} run(s), {} failure(s)",
                    summary.total_runs, summary.failures
                );
                self.last_summary_date = Some(now.date_naive());
            }
            Err(e) => error!("Daily summary failed: {}", e),
        }

        Ok(())
    }

    /// Once per day: apply the job log retention policy
    async fn check_maintenance(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.last_maintenance_date == Some(now.date_naive()) {
            return Ok(());
        }
        self.last_maintenance_date = Some(now.date_naive());

        let pool = self.db.pool().clone();
        let retention_days = settings::get_int(&pool, "log_retention_days", 30).await.max(1);
        let purged = crate::db::job_logs::purge_older_than(&pool, retention_days).await?;
        if purged > 0 {
            info!("Purged {} job log row(s) older than {} days", purged, retention_days);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_next_fire_after() {
        let anchor = at(2025, 1, 1, 0, 2);
        let next = next_fire_after("*/5 * * * *", anchor).unwrap();
        assert_eq!(next, at(2025, 1, 1, 0, 5));

        let next = next_fire_after("0 2 * * *", anchor).unwrap();
        assert_eq!(next, at(2025, 1, 1, 2, 0));

        assert!(next_fire_after("garbage", anchor).is_none());
    }

    #[test]
    fn test_book_anchors_on_last_run() {
        let mut book = ScheduleBook::new();
        let now = at(2025, 1, 1, 10, 0);

        // Last run at 09:58 with a 5-minute schedule: due at 10:00
        let last_run = at(2025, 1, 1, 9, 58).timestamp();
        assert!(book.due("sync_1", "*/5 * * * *", Some(last_run), now));

        // After firing, the next fire is one step past `now`
        assert_eq!(book.next_fire("sync_1"), Some(at(2025, 1, 1, 10, 5)));
    }

    #[test]
    fn test_book_not_due_before_next_fire() {
        let mut book = ScheduleBook::new();
        let now = at(2025, 1, 1, 10, 0);

        // No last run: anchor is `now`, so the first fire is in the future
        assert!(!book.due("sync_1", "*/5 * * * *", None, now));
        assert_eq!(book.next_fire("sync_1"), Some(at(2025, 1, 1, 10, 5)));

        // One minute later, still not due
        assert!(!book.due("sync_1", "*/5 * * * *", None, at(2025, 1, 1, 10, 1)));
        // At the fire time, due exactly once
        assert!(book.due("sync_1", "*/5 * * * *", None, at(2025, 1, 1, 10, 5)));
        assert!(!book.due("sync_1", "*/5 * * * *", None, at(2025, 1, 1, 10, 5)));
    }

    #[test]
    fn test_book_monotonic_advancement() {
        let mut book = ScheduleBook::new();
        let mut now = at(2025, 1, 1, 0, 0);
        let mut previous = None;

        for _ in 0..10 {
            now += chrono::Duration::minutes(1);
            book.due("sync_1", "*/2 * * * *", None, now);
            let next = book.next_fire("sync_1").unwrap();
            if let Some(prev) = previous {
                assert!(next >= prev, "next-fire regressed: {} < {}", next, prev);
            }
            previous = Some(next);
        }
    }

    #[test]
    fn test_book_recomputes_on_schedule_edit() {
        let mut book = ScheduleBook::new();
        let now = at(2025, 1, 1, 10, 0);

        assert!(!book.due("sync_1", "*/5 * * * *", None, now));
        assert_eq!(book.next_fire("sync_1"), Some(at(2025, 1, 1, 10, 5)));

        // Editing the schedule recomputes the fire time from the anchor
        assert!(!book.due("sync_1", "0 12 * * *", None, now));
        assert_eq!(book.next_fire("sync_1"), Some(at(2025, 1, 1, 12, 0)));
    }

    #[test]
    fn test_retry_displacement() {
        let mut book = ScheduleBook::new();
        let failed_at = at(2025, 1, 1, 10, 0).timestamp();

        // Not yet due: failure + 15 minutes
        assert!(!book.retry_due(
            "retry_sync_1",
            Some(failed_at),
            Some("failed"),
            true,
            1,
            3,
            15,
            at(2025, 1, 1, 10, 10),
        ));

        // Due after the delay; fires exactly once for this failure
        assert!(book.retry_due(
            "retry_sync_1",
            Some(failed_at),
            Some("failed"),
            true,
            1,
            3,
            15,
            at(2025, 1, 1, 10, 16),
        ));
        assert!(!book.retry_due(
            "retry_sync_1",
            Some(failed_at),
            Some("failed"),
            true,
            1,
            3,
            15,
            at(2025, 1, 1, 10, 17),
        ));

        // A newer failure schedules a fresh retry
        let failed_again = at(2025, 1, 1, 11, 0).timestamp();
        assert!(book.retry_due(
            "retry_sync_1",
            Some(failed_again),
            Some("failed"),
            true,
            2,
            3,
            15,
            at(2025, 1, 1, 11, 20),
        ));
    }

    #[test]
    fn test_retry_respects_limits() {
        let mut book = ScheduleBook::new();
        let failed_at = at(2025, 1, 1, 10, 0).timestamp();
        let later = at(2025, 1, 1, 12, 0);

        // Retries disabled
        assert!(!book.retry_due("k", Some(failed_at), Some("failed"), false, 1, 3, 15, later));
        // Budget exhausted
        assert!(!book.retry_due("k", Some(failed_at), Some("failed"), true, 3, 3, 15, later));
        // Not failed
        assert!(!book.retry_due("k", Some(failed_at), Some("success"), true, 1, 3, 15, later));
    }

    #[test]
    fn test_summary_due() {
        let now = at(2025, 6, 15, 8, 3);

        assert!(summary_due(true, 8, None, now));
        assert!(summary_due(true, 8, Some(at(2025, 6, 14, 8, 0).date_naive()), now));
        // Already sent today
        assert!(!summary_due(true, 8, Some(now.date_naive()), now));
        // Wrong hour
        assert!(!summary_due(true, 9, None, now));
        // Disabled
        assert!(!summary_due(false, 8, None, now));
    }
}
