//! Job log database operations
//!
//! A single run produces one main log plus zero or more phase logs, all
//! sharing the same `run_id`. Rows for one run are totally ordered by
//! `started_at`.

use proxrepl_common::{Error, Result, RunStatus};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Per-phase record attached to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogRecord {
    pub id: i64,
    pub run_id: String,
    pub job_type: String,
    pub job_id: i64,
    pub phase: String,
    pub status: String,
    pub node_name: Option<String>,
    pub dataset: Option<String>,
    pub message: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i64>,
    pub bytes_transferred: Option<String>,
    pub backup_id: Option<String>,
    pub triggered_by: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration: Option<i64>,
}

/// Fields for opening a log row
#[derive(Debug, Clone, Default)]
pub struct NewJobLog {
    pub run_id: String,
    pub job_type: String,
    pub job_id: i64,
    pub phase: String,
    pub node_name: Option<String>,
    pub dataset: Option<String>,
    pub message: Option<String>,
    pub triggered_by: Option<String>,
}

/// Fields written when a log row is closed
#[derive(Debug, Clone, Default)]
pub struct LogCompletion {
    pub message: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i64>,
    pub bytes_transferred: Option<String>,
    pub backup_id: Option<String>,
}

/// Query filter for log listings
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub job_type: Option<String>,
    pub job_id: Option<i64>,
    pub status: Option<String>,
    pub since: Option<i64>,
    pub limit: i64,
}

pub async fn start_log(pool: &SqlitePool, log: &NewJobLog) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "INSERT INTO job_logs (run_id, job_type, job_id, phase, status, node_name, dataset,
         message, triggered_by, started_at)
         VALUES (?, ?, ?, ?, 'started', ?, ?, ?, ?, ?)",
    )
    .bind(&log.run_id)
    .bind(&log.job_type)
    .bind(log.job_id)
    .bind(&log.phase)
    .bind(&log.node_name)
    .bind(&log.dataset)
    .bind(&log.message)
    .bind(&log.triggered_by)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to create job log: {}", e)))?;

    Ok(result.last_insert_rowid())
}

pub async fn complete_log(
    pool: &SqlitePool,
    log_id: i64,
    status: RunStatus,
    completion: &LogCompletion,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "UPDATE job_logs SET
            status = ?,
            message = COALESCE(?, message),
            output = ?,
            error = ?,
            command = ?,
            exit_code = ?,
            bytes_transferred = ?,
            backup_id = ?,
            completed_at = ?,
            duration = ? - started_at
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(&completion.message)
    .bind(&completion.output)
    .bind(&completion.error)
    .bind(&completion.command)
    .bind(completion.exit_code)
    .bind(&completion.bytes_transferred)
    .bind(&completion.backup_id)
    .bind(now)
    .bind(now)
    .bind(log_id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to complete job log: {}", e)))?;

    Ok(())
}

pub async fn get_log(pool: &SqlitePool, id: i64) -> Result<JobLogRecord> {
    let row = sqlx::query("SELECT * FROM job_logs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::JobNotFound(format!("job log {}", id)))?;

    Ok(row_to_log(&row))
}

/// All rows of a run ordered by `started_at`, main log first
pub async fn logs_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<JobLogRecord>> {
    let rows = sqlx::query("SELECT * FROM job_logs WHERE run_id = ? ORDER BY started_at, id")
        .bind(run_id)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to load run logs: {}", e)))?;

    Ok(rows.iter().map(row_to_log).collect())
}

pub async fn query_logs(pool: &SqlitePool, filter: &LogFilter) -> Result<Vec<JobLogRecord>> {
    let mut sql = "SELECT * FROM job_logs WHERE 1=1".to_string();

    if filter.job_type.is_some() {
        sql.push_str(" AND job_type = ?");
    }
    if filter.job_id.is_some() {
        sql.push_str(" AND job_id = ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND started_at >= ?");
    }

    sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(job_type) = &filter.job_type {
        query = query.bind(job_type);
    }
    if let Some(job_id) = filter.job_id {
        query = query.bind(job_id);
    }
    if let Some(status) = &filter.status {
        query = query.bind(status);
    }
    if let Some(since) = filter.since {
        query = query.bind(since);
    }
    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    query = query.bind(limit);

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to query job logs: {}", e)))?;

    Ok(rows.iter().map(row_to_log).collect())
}

/// Main-phase rows completed inside the summary window
pub async fn summary_window(pool: &SqlitePool, since: i64) -> Result<Vec<JobLogRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM job_logs
         WHERE phase = 'main' AND completed_at IS NOT NULL AND completed_at >= ?
         ORDER BY completed_at",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to load summary window: {}", e)))?;

    Ok(rows.iter().map(row_to_log).collect())
}

/// Apply the log retention policy
pub async fn purge_older_than(pool: &SqlitePool, days: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - days * 86_400;

    let result = sqlx::query("DELETE FROM job_logs WHERE started_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to purge job logs: {}", e)))?;

    Ok(result.rows_affected())
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> JobLogRecord {
    JobLogRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        job_type: row.get("job_type"),
        job_id: row.get("job_id"),
        phase: row.get("phase"),
        status: row.get("status"),
        node_name: row.get("node_name"),
        dataset: row.get("dataset"),
        message: row.get("message"),
        output: row.get("output"),
        error: row.get("error"),
        command: row.get("command"),
        exit_code: row.get("exit_code"),
        bytes_transferred: row.get("bytes_transferred"),
        backup_id: row.get("backup_id"),
        triggered_by: row.get("triggered_by"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration: row.get("duration"),
    }
}
