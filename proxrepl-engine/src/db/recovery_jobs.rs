//! Recovery job database operations (PBS-mediated backup/restore copies)

use proxrepl_common::{
    BackupCompression, BackupMode, Error, GuestType, NotifyMode, RecoveryStatus, Result,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Definition of a PBS-mediated copy plus its live state and run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryJob {
    pub id: i64,
    pub name: String,
    pub source_node_id: i64,
    pub vm_id: u32,
    pub vm_type: GuestType,
    pub pbs_node_id: i64,
    pub datastore: String,
    pub pbs_storage_id: Option<String>,
    pub dest_node_id: i64,
    pub dest_vm_id: Option<u32>,
    pub dest_vm_name_suffix: Option<String>,
    pub dest_storage: Option<String>,
    pub backup_mode: BackupMode,
    pub backup_compress: BackupCompression,
    pub include_all_disks: bool,
    pub start_after: bool,
    pub unique_ids: bool,
    pub overwrite_existing: bool,
    pub backup_schedule: Option<String>,
    pub restore_schedule: Option<String>,
    pub is_active: bool,
    pub retry_on_failure: bool,
    pub max_retries: i64,
    pub retry_delay_minutes: i64,
    pub notify_mode: NotifyMode,
    pub current_status: RecoveryStatus,
    pub last_backup_id: Option<String>,
    pub last_run: Option<i64>,
    pub last_status: Option<String>,
    pub last_duration: Option<i64>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
}

fn validate(job: &RecoveryJob) -> Result<()> {
    crate::validation::validate_name(&job.name)?;
    crate::validation::validate_vmid(job.vm_id)?;
    crate::validation::validate_storage_name(&job.datastore)?;

    if job.source_node_id == job.dest_node_id {
        return Err(Error::Validation(
            "Source and destination node must differ".to_string(),
        ));
    }
    if let Some(storage) = job.pbs_storage_id.as_deref() {
        crate::validation::validate_storage_name(storage)?;
    }
    if let Some(storage) = job.dest_storage.as_deref() {
        crate::validation::validate_storage_name(storage)?;
    }
    if let Some(vm_id) = job.dest_vm_id {
        crate::validation::validate_vmid(vm_id)?;
    }
    for schedule in [job.backup_schedule.as_deref(), job.restore_schedule.as_deref()]
        .into_iter()
        .flatten()
    {
        if !schedule.is_empty() {
            crate::validation::validate_cron(schedule)?;
        }
    }

    Ok(())
}

pub async fn create_recovery_job(pool: &SqlitePool, job: &RecoveryJob) -> Result<i64> {
    validate(job)?;

    let result = sqlx::query(
        "INSERT INTO recovery_jobs (name, source_node_id, vm_id, vm_type, pbs_node_id, datastore,
         pbs_storage_id, dest_node_id, dest_vm_id, dest_vm_name_suffix, dest_storage, backup_mode,
         backup_compress, include_all_disks, start_after, unique_ids, overwrite_existing,
         backup_schedule, restore_schedule, is_active, retry_on_failure, max_retries,
         retry_delay_minutes, notify_mode, current_status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
    )
    .bind(&job.name)
    .bind(job.source_node_id)
    .bind(job.vm_id as i64)
    .bind(job.vm_type.as_str())
    .bind(job.pbs_node_id)
    .bind(&job.datastore)
    .bind(&job.pbs_storage_id)
    .bind(job.dest_node_id)
    .bind(job.dest_vm_id.map(|v| v as i64))
    .bind(&job.dest_vm_name_suffix)
    .bind(&job.dest_storage)
    .bind(job.backup_mode.as_str())
    .bind(job.backup_compress.as_str())
    .bind(job.include_all_disks)
    .bind(job.start_after)
    .bind(job.unique_ids)
    .bind(job.overwrite_existing)
    .bind(&job.backup_schedule)
    .bind(&job.restore_schedule)
    .bind(job.is_active)
    .bind(job.retry_on_failure)
    .bind(job.max_retries)
    .bind(job.retry_delay_minutes)
    .bind(job.notify_mode.as_str())
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("Recovery job '{}' already exists", job.name))
        }
        other => Error::System(format!("Failed to create recovery job: {}", other)),
    })?;

    Ok(result.last_insert_rowid())
}

pub async fn get_recovery_job(pool: &SqlitePool, id: i64) -> Result<RecoveryJob> {
    let row = sqlx::query("SELECT * FROM recovery_jobs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::JobNotFound(format!("recovery job {}", id)))?;

    Ok(row_to_job(&row))
}

pub async fn list_recovery_jobs(pool: &SqlitePool) -> Result<Vec<RecoveryJob>> {
    let rows = sqlx::query("SELECT * FROM recovery_jobs ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list recovery jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

/// Active jobs with a non-empty backup or restore cron expression
pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<RecoveryJob>> {
    let rows = sqlx::query(
        "SELECT * FROM recovery_jobs WHERE is_active = 1
         AND ((backup_schedule IS NOT NULL AND backup_schedule != '')
           OR (restore_schedule IS NOT NULL AND restore_schedule != ''))",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to list scheduled recovery jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn delete_recovery_job(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_logs WHERE job_type = 'recovery' AND job_id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete recovery job logs: {}", e)))?;

    let result = sqlx::query("DELETE FROM recovery_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete recovery job: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("recovery job {}", id)));
    }

    Ok(())
}

/// State-machine gate: only `pending`, `completed` or `failed` may start a
/// new run; every other state rejects the trigger.
pub async fn try_begin(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "UPDATE recovery_jobs SET current_status = 'backing_up', updated_at = ?
         WHERE id = ? AND current_status IN ('pending', 'completed', 'failed')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to begin recovery job: {}", e)))?;

    if result.rows_affected() == 0 {
        let job = get_recovery_job(pool, id).await?;
        return Err(Error::Conflict(format!(
            "Recovery job {} is already in execution (status: {})",
            id, job.current_status
        )));
    }

    Ok(())
}

/// Pin the backup a later restore run should use
pub async fn set_last_backup_id(pool: &SqlitePool, id: i64, backup_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE recovery_jobs SET last_backup_id = ? WHERE id = ?")
        .bind(backup_id)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to set backup id: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("recovery job {}", id)));
    }

    Ok(())
}

/// Advance the live status of an in-flight run
pub async fn set_status(pool: &SqlitePool, id: i64, status: RecoveryStatus) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query("UPDATE recovery_jobs SET current_status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to set recovery status: {}", e)))?;

    Ok(())
}

/// Close a run: final status, run statistics and the most recent backup id
pub async fn finish_run(
    pool: &SqlitePool,
    id: i64,
    success: bool,
    duration: i64,
    backup_id: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let (current, last) = if success {
        ("completed", "success")
    } else {
        ("failed", "failed")
    };

    sqlx::query(
        "UPDATE recovery_jobs SET
            current_status = ?,
            last_status = ?,
            last_run = ?,
            last_duration = ?,
            last_backup_id = COALESCE(?, last_backup_id),
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
    .bind(backup_id)
    .bind(success)
    .bind(success)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to record recovery run: {}", e)))?;

    Ok(())
}

/// Crash recovery: transient states older than the horizon become `failed`.
pub async fn recover_abandoned(pool: &SqlitePool, horizon_secs: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - horizon_secs;

    let result = sqlx::query(
        "UPDATE recovery_jobs SET current_status = 'failed',
            last_status = 'failed',
            consecutive_failures = consecutive_failures + 1,
            error_count = error_count + 1
         WHERE current_status IN ('backing_up', 'restoring', 'registering')
           AND (updated_at IS NULL OR updated_at < ?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to recover abandoned recovery jobs: {}", e)))?;

    Ok(result.rows_affected())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> RecoveryJob {
    let vm_type_str: String = row.get("vm_type");
    let mode_str: String = row.get("backup_mode");
    let compress_str: String = row.get("backup_compress");
    let notify_str: String = row.get("notify_mode");
    let status_str: String = row.get("current_status");

    RecoveryJob {
        id: row.get("id"),
        name: row.get("name"),
        source_node_id: row.get("source_node_id"),
        vm_id: row.get::<i64, _>("vm_id") as u32,
        vm_type: GuestType::parse(&vm_type_str).unwrap_or(GuestType::Qemu),
        pbs_node_id: row.get("pbs_node_id"),
        datastore: row.get("datastore"),
        pbs_storage_id: row.get("pbs_storage_id"),
        dest_node_id: row.get("dest_node_id"),
        dest_vm_id: row.get::<Option<i64>, _>("dest_vm_id").map(|v| v as u32),
        dest_vm_name_suffix: row.get("dest_vm_name_suffix"),
        dest_storage: row.get("dest_storage"),
        backup_mode: BackupMode::parse(&mode_str).unwrap_or(BackupMode::Snapshot),
        backup_compress: BackupCompression::parse(&compress_str).unwrap_or(BackupCompression::Zstd),
        include_all_disks: row.get("include_all_disks"),
        start_after: row.get("start_after"),
        unique_ids: row.get("unique_ids"),
        overwrite_existing: row.get("overwrite_existing"),
        backup_schedule: row.get("backup_schedule"),
        restore_schedule: row.get("restore_schedule"),
        is_active: row.get("is_active"),
        retry_on_failure: row.get("retry_on_failure"),
        max_retries: row.get("max_retries"),
        retry_delay_minutes: row.get("retry_delay_minutes"),
        notify_mode: NotifyMode::parse(&notify_str).unwrap_or_default(),
        current_status: RecoveryStatus::parse(&status_str).unwrap_or_default(),
        last_backup_id: row.get("last_backup_id"),
        last_run: row.get("last_run"),
        last_status: row.get("last_status"),
        last_duration: row.get("last_duration"),
        run_count: row.get("run_count"),
        error_count: row.get("error_count"),
        consecutive_failures: row.get("consecutive_failures"),
    }
}

#[cfg(test)]
pub(crate) fn test_recovery_job(name: &str, source: i64, pbs: i64, dest: i64) -> RecoveryJob {
    RecoveryJob {
        id: 0,
        name: name.to_string(),
        source_node_id: source,
        vm_id: 110,
        vm_type: GuestType::Qemu,
        pbs_node_id: pbs,
        datastore: "ds0".to_string(),
        pbs_storage_id: None,
        dest_node_id: dest,
        dest_vm_id: None,
        dest_vm_name_suffix: None,
        dest_storage: None,
        backup_mode: BackupMode::Snapshot,
        backup_compress: BackupCompression::Zstd,
        include_all_disks: true,
        start_after: false,
        unique_ids: true,
        overwrite_existing: true,
        backup_schedule: None,
        restore_schedule: None,
        is_active: true,
        retry_on_failure: false,
        max_retries: 3,
        retry_delay_minutes: 15,
        notify_mode: NotifyMode::Daily,
        current_status: RecoveryStatus::Pending,
        last_backup_id: None,
        last_run: None,
        last_status: None,
        last_duration: None,
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

    async fn setup() -> (crate::db::Database, i64, i64, i64) {
        let db = test_db().await;
        let src = create_node(db.pool(), &test_node("pve1", "10.0.0.11")).await.unwrap();
        let mut pbs = test_node("pbs1", "10.0.0.20");
        pbs.node_type = Some(proxrepl_common::NodeKind::Pbs);
        let pbs = create_node(db.pool(), &pbs).await.unwrap();
        let dst = create_node(db.pool(), &test_node("pve3", "10.0.0.13")).await.unwrap();
        (db, src, pbs, dst)
    }

    #[tokio::test]
    async fn test_recovery_job_crud() {
        let (db, src, pbs, dst) = setup().await;
        let pool = db.pool();

        let id = create_recovery_job(pool, &test_recovery_job("dr-110", src, pbs, dst))
            .await
            .unwrap();

        let job = get_recovery_job(pool, id).await.unwrap();
        assert_eq!(job.vm_id, 110);
        assert_eq!(job.current_status, RecoveryStatus::Pending);
        assert_eq!(job.backup_mode, BackupMode::Snapshot);
        assert_eq!(job.backup_compress, BackupCompression::Zstd);

        delete_recovery_job(pool, id).await.unwrap();
        assert!(get_recovery_job(pool, id).await.is_err());
    }

    #[tokio::test]
    async fn test_state_machine_gate() {
        let (db, src, pbs, dst) = setup().await;
        let pool = db.pool();
        let id = create_recovery_job(pool, &test_recovery_job("dr", src, pbs, dst))
            .await
            .unwrap();

        try_begin(pool, id).await.unwrap();
        assert!(matches!(try_begin(pool, id).await, Err(Error::Conflict(_))));

        // Transient states reject new triggers
        set_status(pool, id, RecoveryStatus::Restoring).await.unwrap();
        assert!(matches!(try_begin(pool, id).await, Err(Error::Conflict(_))));
        set_status(pool, id, RecoveryStatus::Registering).await.unwrap();
        assert!(matches!(try_begin(pool, id).await, Err(Error::Conflict(_))));

        // Completed and failed allow a restart
        finish_run(pool, id, true, 120, Some("vm/110/2025-01-01T00:00:00Z")).await.unwrap();
        try_begin(pool, id).await.unwrap();

        finish_run(pool, id, false, 30, None).await.unwrap();
        try_begin(pool, id).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_run_statistics() {
        let (db, src, pbs, dst) = setup().await;
        let pool = db.pool();
        let id = create_recovery_job(pool, &test_recovery_job("dr", src, pbs, dst))
            .await
            .unwrap();

        try_begin(pool, id).await.unwrap();
        finish_run(pool, id, false, 10, None).await.unwrap();

        let job = get_recovery_job(pool, id).await.unwrap();
        assert_eq!(job.current_status, RecoveryStatus::Failed);
        assert_eq!(job.consecutive_failures, 1);
        assert_eq!(job.error_count, 1);
        assert!(job.last_backup_id.is_none());

        try_begin(pool, id).await.unwrap();
        finish_run(pool, id, true, 300, Some("vm/110/2025-01-01T00:00:00Z")).await.unwrap();

        let job = get_recovery_job(pool, id).await.unwrap();
        assert_eq!(job.current_status, RecoveryStatus::Completed);
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.last_backup_id.as_deref(), Some("vm/110/2025-01-01T00:00:00Z"));
        assert_eq!(job.run_count, 2);
    }

    #[tokio::test]
    async fn test_recover_abandoned_transient_states() {
        let (db, src, pbs, dst) = setup().await;
        let pool = db.pool();
        let id = create_recovery_job(pool, &test_recovery_job("dr", src, pbs, dst))
            .await
            .unwrap();

        try_begin(pool, id).await.unwrap();
        set_status(pool, id, RecoveryStatus::Restoring).await.unwrap();

        assert_eq!(recover_abandoned(pool, 3600).await.unwrap(), 0);
        assert_eq!(recover_abandoned(pool, -1).await.unwrap(), 1);

        let job = get_recovery_job(pool, id).await.unwrap();
        assert_eq!(job.current_status, RecoveryStatus::Failed);
    }
}
