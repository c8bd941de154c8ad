//! Notification trigger
//!
//! Decides whether a completed run produces an immediate notification or
//! contributes to the daily summary. Transports (SMTP, webhooks, chat) live
//! behind [`NotificationSink`]; the engine itself only triggers.

use crate::db::job_logs::{self, JobLogRecord};
use proxrepl_common::{NotifyMode, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

/// Everything a transport needs to render a job notification.
/// Every parameter is explicit; there is no schema-less payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_name: String,
    pub job_type: String,
    pub job_id: i64,
    pub status: String,
    pub source: String,
    pub destination: String,
    pub duration_seconds: i64,
    pub error: Option<String>,
    pub transferred: Option<String>,
    pub details: Option<String>,
    pub is_scheduled: bool,
    pub notify_mode: NotifyMode,
}

impl JobNotification {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// What the decision matrix says about one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    /// Deliver now through every configured sink
    Immediate,
    /// Leave for the daily summary query window
    Daily,
    /// Drop entirely
    Drop,
}

/// Aggregated view sent once per day
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailySummary {
    pub window_start: i64,
    pub window_end: i64,
    pub total_runs: usize,
    pub successes: usize,
    pub failures: usize,
    pub failed_runs: Vec<SummaryRow>,
    pub rows: Vec<SummaryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub job_type: String,
    pub job_id: i64,
    pub status: String,
    pub node_name: Option<String>,
    pub message: Option<String>,
    pub duration: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Transport seam; implementations deliver, the engine decides.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &JobNotification);
    fn deliver_summary(&self, summary: &DailySummary);
}

/// Default sink: structured log lines. Real transports are registered by
/// the surrounding application.
#[derive(Debug, Default)]
pub struct LogSink {}

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &JobNotification) {
        info!(
            job = %notification.job_name,
            job_type = %notification.job_type,
            status = %notification.status,
            source = %notification.source,
            destination = %notification.destination,
            duration = notification.duration_seconds,
            "job notification"
        );
    }

    fn deliver_summary(&self, summary: &DailySummary) {
        info!(
            total = summary.total_runs,
            successes = summary.successes,
            failures = summary.failures,
            "daily summary"
        );
    }
}

/// The §4.10 decision matrix
pub fn decide(mode: NotifyMode, success: bool) -> NotifyDecision {
    match (mode, success) {
        (NotifyMode::Always, _) => NotifyDecision::Immediate,
        (NotifyMode::Failure, true) => NotifyDecision::Daily,
        (NotifyMode::Failure, false) => NotifyDecision::Immediate,
        (NotifyMode::Daily, _) => NotifyDecision::Daily,
        (NotifyMode::Never, _) => NotifyDecision::Drop,
    }
}

/// Invoked at the end of each pipeline run
pub struct NotificationTrigger {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl NotificationTrigger {
    pub fn new() -> Self {
        Self {
            sinks: vec![Box::new(LogSink::default())],
        }
    }

    pub fn with_sinks(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Apply the decision matrix. Accumulation for the daily summary needs
    /// no queue: the summary is built from the job log store at send time.
    pub fn send_job_notification(&self, notification: &JobNotification) -> NotifyDecision {
        let decision = decide(notification.notify_mode, notification.is_success());

        if decision == NotifyDecision::Immediate {
            for sink in &self.sinks {
                sink.deliver(notification);
            }
        }

        decision
    }

    /// Build the summary over the previous 24h window and deliver it
    pub async fn send_daily_summary(&self, pool: &SqlitePool) -> Result<DailySummary> {
        let now = chrono::Utc::now().timestamp();
        let since = now - 86_400;

        let logs = job_logs::summary_window(pool, since).await?;
        let summary = build_summary(&logs, since, now);

        for sink in &self.sinks {
            sink.deliver_summary(&summary);
        }

        Ok(summary)
    }
}

impl Default for NotificationTrigger {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_summary(logs: &[JobLogRecord], window_start: i64, window_end: i64) -> DailySummary {
    let rows: Vec<SummaryRow> = logs
        .iter()
        .map(|log| SummaryRow {
            job_type: log.job_type.clone(),
            job_id: log.job_id,
            status: log.status.clone(),
            node_name: log.node_name.clone(),
            message: log.message.clone(),
            duration: log.duration,
            completed_at: log.completed_at,
        })
        .collect();

    let successes = rows.iter().filter(|r| r.status == "success").count();
    let failures = rows.iter().filter(|r| r.status == "failed").count();
    let failed_runs = rows.iter().filter(|r| r.status == "failed").cloned().collect();

    DailySummary {
        window_start,
        window_end,
        total_runs: rows.len(),
        successes,
        failures,
        failed_runs,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_decision_matrix() {
        assert_eq!(decide(NotifyMode::Always, true), NotifyDecision::Immediate);
        assert_eq!(decide(NotifyMode::Always, false), NotifyDecision::Immediate);
        assert_eq!(decide(NotifyMode::Failure, true), NotifyDecision::Daily);
        assert_eq!(decide(NotifyMode::Failure, false), NotifyDecision::Immediate);
        assert_eq!(decide(NotifyMode::Daily, true), NotifyDecision::Daily);
        assert_eq!(decide(NotifyMode::Daily, false), NotifyDecision::Daily);
        assert_eq!(decide(NotifyMode::Never, true), NotifyDecision::Drop);
        assert_eq!(decide(NotifyMode::Never, false), NotifyDecision::Drop);
    }

    struct CountingSink {
        delivered: Arc<AtomicUsize>,
    }

    impl NotificationSink for CountingSink {
        fn deliver(&self, _notification: &JobNotification) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        fn deliver_summary(&self, _summary: &DailySummary) {}
    }

    fn notification(mode: NotifyMode, status: &str) -> JobNotification {
        JobNotification {
            job_name: "nightly".to_string(),
            job_type: "sync".to_string(),
            job_id: 1,
            status: status.to_string(),
            source: "pve1:rpool/data".to_string(),
            destination: "pve2:rpool/data".to_string(),
            duration_seconds: 12,
            error: None,
            transferred: Some("1.2 GiB".to_string()),
            details: None,
            is_scheduled: true,
            notify_mode: mode,
        }
    }

    #[test]
    fn test_immediate_delivery_only_for_matrix_hits() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let trigger = NotificationTrigger::with_sinks(vec![Box::new(CountingSink {
            delivered: delivered.clone(),
        })]);

        trigger.send_job_notification(&notification(NotifyMode::Always, "success"));
        trigger.send_job_notification(&notification(NotifyMode::Failure, "failed"));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        trigger.send_job_notification(&notification(NotifyMode::Failure, "success"));
        trigger.send_job_notification(&notification(NotifyMode::Daily, "failed"));
        trigger.send_job_notification(&notification(NotifyMode::Never, "failed"));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_build_summary_counts() {
        let mk = |status: &str| JobLogRecord {
            id: 0,
            run_id: "r".to_string(),
            job_type: "sync".to_string(),
            job_id: 1,
            phase: "main".to_string(),
            status: status.to_string(),
            node_name: None,
            dataset: None,
            message: None,
            output: None,
            error: None,
            command: None,
            exit_code: None,
            bytes_transferred: None,
            backup_id: None,
            triggered_by: None,
            started_at: 0,
            completed_at: Some(10),
            duration: Some(10),
        };

        let logs = vec![mk("success"), mk("success"), mk("failed")];
        let summary = build_summary(&logs, 0, 100);
        assert_eq!(summary.total_runs, 3);
        assert_eq!(summary.successes, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.failed_runs.len(), 1);
    }

    #[tokio::test]
    async fn test_daily_summary_from_store() {
        let db = crate::db::test_db().await;
        let pool = db.pool();

        let id = job_logs::start_log(
            pool,
            &job_logs::NewJobLog {
                run_id: "run-1".to_string(),
                job_type: "sync".to_string(),
                job_id: 1,
                phase: "main".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        job_logs::complete_log(
            pool,
            id,
            proxrepl_common::RunStatus::Failed,
            &job_logs::LogCompletion::default(),
        )
        .await
        .unwrap();

        let trigger = NotificationTrigger::new();
        let summary = trigger.send_daily_summary(pool).await.unwrap();
        assert_eq!(summary.total_runs, 1);
        assert_eq!(summary.failures, 1);
    }
}
