//! Host-config backup job database operations

use proxrepl_common::{Error, NotifyMode, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Definition of a recurring host configuration backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBackupJob {
    pub id: i64,
    pub name: String,
    pub node_id: i64,
    pub dest_path: String,
    pub compress: bool,
    pub encrypt: bool,
    pub encrypt_password: Option<String>,
    pub keep_last: i64,
    pub schedule: Option<String>,
    pub is_active: bool,
    pub notify_mode: NotifyMode,
    pub current_status: Option<String>,
    pub last_backup_file: Option<String>,
    pub last_backup_size: Option<i64>,
    pub last_run: Option<i64>,
    pub last_status: Option<String>,
    pub last_duration: Option<i64>,
    pub last_error: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
}

fn validate(job: &HostBackupJob) -> Result<()> {
    crate::validation::validate_name(&job.name)?;
    crate::validation::validate_subvolume_path(&job.dest_path)?;

    if job.encrypt && job.encrypt_password.as_deref().unwrap_or("").is_empty() {
        return Err(Error::Validation(
            "Encryption requires a password".to_string(),
        ));
    }
    if let Some(schedule) = job.schedule.as_deref() {
        if !schedule.is_empty() {
            crate::validation::validate_cron(schedule)?;
        }
    }

    Ok(())
}

pub async fn create_host_backup_job(pool: &SqlitePool, job: &HostBackupJob) -> Result<i64> {
    validate(job)?;

    let result = sqlx::query(
        "INSERT INTO host_backup_jobs (name, node_id, dest_path, compress, encrypt,
         encrypt_password, keep_last, schedule, is_active, notify_mode)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.name)
    .bind(job.node_id)
    .bind(&job.dest_path)
    .bind(job.compress)
    .bind(job.encrypt)
    .bind(&job.encrypt_password)
    .bind(job.keep_last)
    .bind(&job.schedule)
    .bind(job.is_active)
    .bind(job.notify_mode.as_str())
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("Host backup job '{}' already exists", job.name))
        }
        other => Error::System(format!("Failed to create host backup job: {}", other)),
    })?;

    Ok(result.last_insert_rowid())
}

pub async fn get_host_backup_job(pool: &SqlitePool, id: i64) -> Result<HostBackupJob> {
    let row = sqlx::query("SELECT * FROM host_backup_jobs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::JobNotFound(format!("host backup job {}", id)))?;

    Ok(row_to_job(&row))
}

pub async fn list_host_backup_jobs(pool: &SqlitePool) -> Result<Vec<HostBackupJob>> {
    let rows = sqlx::query("SELECT * FROM host_backup_jobs ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list host backup jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

/// Active jobs with a non-empty cron expression, for the scheduler
pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<HostBackupJob>> {
    let rows = sqlx::query(
        "SELECT * FROM host_backup_jobs WHERE is_active = 1 AND schedule IS NOT NULL AND schedule != ''",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to list scheduled host backup jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn delete_host_backup_job(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_logs WHERE job_type = 'host_backup' AND job_id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete host backup job logs: {}", e)))?;

    let result = sqlx::query("DELETE FROM host_backup_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete host backup job: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("host backup job {}", id)));
    }

    Ok(())
}

/// Single-flight guard, same contract as the sync job variant
pub async fn try_mark_running(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "UPDATE host_backup_jobs SET last_status = 'running', current_status = 'running', updated_at = ?
         WHERE id = ? AND (last_status IS NULL OR last_status != 'running')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to mark host backup job running: {}", e)))?;

    if result.rows_affected() == 0 {
        get_host_backup_job(pool, id).await?;
        return Err(Error::Conflict(format!(
            "Host backup job {} is already running",
            id
        )));
    }

    Ok(())
}

pub async fn finish_run(
    pool: &SqlitePool,
    id: i64,
    success: bool,
    duration: i64,
    backup_file: Option<&str>,
    backup_size: Option<i64>,
    error: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let (current, last) = if success {
        ("completed", "success")
    } else {
        ("failed", "failed")
    };

    sqlx::query(
        "UPDATE host_backup_jobs SET
            current_status = ?,
            last_status = ?,
            last_run = ?,
            last_duration = ?,
            last_backup_file = COALESCE(?, last_backup_file),
            last_backup_size = COALESCE(?, last_backup_size),
            last_error = ?,
            run_count = run_count + 1,
            error_count = error_count + (CASE WHEN ? THEN 0 ELSE 1 END),
            consecutive_failures = (CASE WHEN ? THEN 0 ELSE consecutive_failures + 1 END),
            updated_at = ?
         WHERE id = ?",
    )
    .bind(current)
    .bind(last)
    .bind(now)
    .bind(duration)
    .bind(backup_file)
    .bind(backup_size)
    .bind(error)
    .bind(success)
    .bind(success)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to record host backup run: {}", e)))?;

    Ok(())
}

/// Crash recovery: force stale `running` rows to `failed`.
pub async fn recover_abandoned(pool: &SqlitePool, horizon_secs: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - horizon_secs;

    let result = sqlx::query(
        "UPDATE host_backup_jobs SET last_status = 'failed', current_status = 'failed',
            consecutive_failures = consecutive_failures + 1,
            error_count = error_count + 1
         WHERE last_status = 'running' AND (updated_at IS NULL OR updated_at < ?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to recover abandoned host backup jobs: {}", e)))?;

    Ok(result.rows_affected())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> HostBackupJob {
    let notify_str: String = row.get("notify_mode");

    HostBackupJob {
        id: row.get("id"),
        name: row.get("name"),
        node_id: row.get("node_id"),
        dest_path: row.get("dest_path"),
        compress: row.get("compress"),
        encrypt: row.get("encrypt"),
        encrypt_password: row.get("encrypt_password"),
        keep_last: row.get("keep_last"),
        schedule: row.get("schedule"),
        is_active: row.get("is_active"),
        notify_mode: NotifyMode::parse(&notify_str).unwrap_or_default(),
        current_status: row.get("current_status"),
        last_backup_file: row.get("last_backup_file"),
        last_backup_size: row.get("last_backup_size"),
        last_run: row.get("last_run"),
        last_status: row.get("last_status"),
        last_duration: row.get("last_duration"),
        last_error: row.get("last_error"),
        run_count: row.get("run_count"),
        error_count: row.get("error_count"),
        consecutive_failures: row.get("consecutive_failures"),
    }
}

#[cfg(test)]
pub(crate) fn test_host_backup_job(name: &str, node_id: i64) -> HostBackupJob {
    HostBackupJob {
        id: 0,
        name: name.to_string(),
        node_id,
        dest_path: "/var/backups/proxmox-config".to_string(),
        compress: true,
        encrypt: false,
        encrypt_password: None,
        keep_last: 7,
        schedule: None,
        is_active: true,
        notify_mode: NotifyMode::Daily,
        current_status: None,
        last_backup_file: None,
        last_backup_size: None,
        last_run: None,
        last_status: None,
        last_duration: None,
        last_error: None,
        run_count: 0,
        error_count: 0,
        consecutive_failures: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::{create_node, test_node};
    use crate::db::test_db;

    #[tokio::test]
    async fn test_host_backup_job_crud() {
        let db = test_db().await;
        let pool = db.pool();
        let node = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();

        let id = create_host_backup_job(pool, &test_host_backup_job("cfg", node))
            .await
            .unwrap();

        let job = get_host_backup_job(pool, id).await.unwrap();
        assert_eq!(job.keep_last, 7);
        assert!(job.compress);
        assert!(!job.encrypt);

        delete_host_backup_job(pool, id).await.unwrap();
        assert!(get_host_backup_job(pool, id).await.is_err());
    }

    #[tokio::test]
    async fn test_encrypt_without_password_rejected() {
        let db = test_db().await;
        let node = create_node(db.pool(), &test_node("pve1", "10.0.0.11")).await.unwrap();
        let mut job = test_host_backup_job("enc", node);
        job.encrypt = true;
        assert!(matches!(
            create_host_backup_job(db.pool(), &job).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_run_records_file_and_size() {
        let db = test_db().await;
        let pool = db.pool();
        let node = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();
        let id = create_host_backup_job(pool, &test_host_backup_job("cfg", node))
            .await
            .unwrap();

        try_mark_running(pool, id).await.unwrap();
        finish_run(
            pool,
            id,
            true,
            42,
            Some("/var/backups/proxmox-config/proxmox-pve-config-20250101_000000.tar.gz"),
            Some(123456),
            None,
        )
        .await
        .unwrap();

        let job = get_host_backup_job(pool, id).await.unwrap();
        assert_eq!(job.current_status.as_deref(), Some("completed"));
        assert_eq!(job.last_backup_size, Some(123456));
        assert_eq!(job.consecutive_failures, 0);
    }
}
