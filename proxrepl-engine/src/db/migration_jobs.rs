//! Migration job database operations (copy/move of guests between PVE nodes)

use proxrepl_common::{Error, GuestType, MigrationMode, NotifyMode, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Definition of a guest copy/move plus its run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: i64,
    pub name: String,
    pub source_node_id: i64,
    pub vm_id: u32,
    pub vm_type: GuestType,
    pub dest_node_id: i64,
    pub dest_vm_id: Option<u32>,
    pub dest_vm_name_suffix: Option<String>,
    pub mode: MigrationMode,
    pub create_snapshot: bool,
    pub keep_snapshots: i64,
    pub start_after: bool,
    /// JSON hardware remap dictionary, see [`crate::migration::HwConfig`]
    pub hw_config: Option<String>,
    pub schedule: Option<String>,
    pub is_active: bool,
    pub notify_mode: NotifyMode,
    pub last_run: Option<i64>,
    pub last_status: Option<String>,
    pub last_duration: Option<i64>,
    pub last_transferred: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
}

fn validate(job: &MigrationJob) -> Result<()> {
    crate::validation::validate_name(&job.name)?;
    crate::validation::validate_vmid(job.vm_id)?;

    if job.source_node_id == job.dest_node_id {
        return Err(Error::Validation(
            "Source and destination node must differ".to_string(),
        ));
    }
    if let Some(vm_id) = job.dest_vm_id {
        crate::validation::validate_vmid(vm_id)?;
    }
    if let Some(schedule) = job.schedule.as_deref() {
        if !schedule.is_empty() {
            crate::validation::validate_cron(schedule)?;
        }
    }
    if let Some(hw) = job.hw_config.as_deref() {
        serde_json::from_str::<crate::migration::HwConfig>(hw)
            .map_err(|e| Error::Validation(format!("Invalid hw_config: {}", e)))?;
    }

    Ok(())
}

pub async fn create_migration_job(pool: &SqlitePool, job: &MigrationJob) -> Result<i64> {
    validate(job)?;

    let result = sqlx::query(
        "INSERT INTO migration_jobs (name, source_node_id, vm_id, vm_type, dest_node_id,
         dest_vm_id, dest_vm_name_suffix, mode, create_snapshot, keep_snapshots, start_after,
         hw_config, schedule, is_active, notify_mode)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.name)
    .bind(job.source_node_id)
    .bind(job.vm_id as i64)
    .bind(job.vm_type.as_str())
    .bind(job.dest_node_id)
    .bind(job.dest_vm_id.map(|v| v as i64))
    .bind(&job.dest_vm_name_suffix)
    .bind(job.mode.as_str())
    .bind(job.create_snapshot)
    .bind(job.keep_snapshots)
    .bind(job.start_after)
    .bind(&job.hw_config)
    .bind(&job.schedule)
    .bind(job.is_active)
    .bind(job.notify_mode.as_str())
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("Migration job '{}' already exists", job.name))
        }
        other => Error::System(format!("Failed to create migration job: {}", other)),
    })?;

    Ok(result.last_insert_rowid())
}

pub async fn get_migration_job(pool: &SqlitePool, id: i64) -> Result<MigrationJob> {
    let row = sqlx::query("SELECT * FROM migration_jobs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::JobNotFound(format!("migration job {}", id)))?;

    Ok(row_to_job(&row))
}

pub async fn list_migration_jobs(pool: &SqlitePool) -> Result<Vec<MigrationJob>> {
    let rows = sqlx::query("SELECT * FROM migration_jobs ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list migration jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

/// Active jobs with a non-empty cron expression, for the scheduler
pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<MigrationJob>> {
    let rows = sqlx::query(
        "SELECT * FROM migration_jobs WHERE is_active = 1 AND schedule IS NOT NULL AND schedule != ''",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to list scheduled migration jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn delete_migration_job(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_logs WHERE job_type = 'migration' AND job_id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete migration job logs: {}", e)))?;

    let result = sqlx::query("DELETE FROM migration_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete migration job: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("migration job {}", id)));
    }

    Ok(())
}

/// Single-flight guard, same contract as the sync job variant
pub async fn try_mark_running(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "UPDATE migration_jobs SET last_status = 'running', updated_at = ?
         WHERE id = ? AND (last_status IS NULL OR last_status != 'running')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to mark migration job running: {}", e)))?;

    if result.rows_affected() == 0 {
        get_migration_job(pool, id).await?;
        return Err(Error::Conflict(format!(
            "Migration job {} is already running",
            id
        )));
    }

    Ok(())
}

/// A `requires_confirmation` branch is not a run: reset the running marker
/// without touching statistics.
pub async fn clear_running(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE migration_jobs SET last_status = 'pending_confirmation' WHERE id = ? AND last_status = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to clear migration job state: {}", e)))?;

    Ok(())
}

pub async fn finish_run(
    pool: &SqlitePool,
    id: i64,
    success: bool,
    duration: i64,
    transferred: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let status = if success { "success" } else { "failed" };

    sqlx::query(
        "UPDATE migration_jobs SET
            last_run = ?,
            last_status = ?,
            last_duration = ?,
            last_transferred = COALESCE(?, last_transferred),
            run_count = run_count + 1,
            error_count = error_count + (CASE WHEN ? THEN 0 ELSE 1 END),
            consecutive_failures = (CASE WHEN ? THEN 0 ELSE consecutive_failures + 1 END),
            updated_at = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(status)
    .bind(duration)
    .bind(transferred)
    .bind(success)
    .bind(success)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to record migration run: {}", e)))?;

    Ok(())
}

/// Crash recovery: force stale `running` rows to `failed`.
pub async fn recover_abandoned(pool: &SqlitePool, horizon_secs: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - horizon_secs;

    let result = sqlx::query(
        "UPDATE migration_jobs SET last_status = 'failed',
            consecutive_failures = consecutive_failures + 1,
            error_count = error_count + 1
         WHERE last_status = 'running' AND (updated_at IS NULL OR updated_at < ?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to recover abandoned migration jobs: {}", e)))?;

    Ok(result.rows_affected())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> MigrationJob {
    let vm_type_str: String = row.get("vm_type");
    let mode_str: String = row.get("mode");
    let notify_str: String = row.get("notify_mode");

    MigrationJob {
        id: row.get("id"),
        name: row.get("name"),
        source_node_id: row.get("source_node_id"),
        vm_id: row.get::<i64, _>("vm_id") as u32,
        vm_type: GuestType::parse(&vm_type_str).unwrap_or(GuestType::Qemu),
        dest_node_id: row.get("dest_node_id"),
        dest_vm_id: row.get::<Option<i64>, _>("dest_vm_id").map(|v| v as u32),
        dest_vm_name_suffix: row.get("dest_vm_name_suffix"),
        mode: MigrationMode::parse(&mode_str).unwrap_or(MigrationMode::Copy),
        create_snapshot: row.get("create_snapshot"),
        keep_snapshots: row.get("keep_snapshots"),
        start_after: row.get("start_after"),
        hw_config: row.get("hw_config"),
        schedule: row.get("schedule"),
        is_active: row.get("is_active"),
        notify_mode: NotifyMode::parse(&notify_str).unwrap_or_default(),
        last_run: row.get("last_run"),
        last_status: row.get("last_status"),
        last_duration: row.get("last_duration"),
        last_transferred: row.get("last_transferred"),
        run_count: row.get("run_count"),
        error_count: row.get("error_count"),
        consecutive_failures: row.get("consecutive_failures"),
    }
}

#[cfg(test)]
pub(crate) fn test_migration_job(name: &str, source: i64, dest: i64) -> MigrationJob {
    MigrationJob {
        id: 0,
        name: name.to_string(),
        source_node_id: source,
        vm_id: 100,
        vm_type: GuestType::Qemu,
        dest_node_id: dest,
        dest_vm_id: Some(200),
        dest_vm_name_suffix: None,
        mode: MigrationMode::Copy,
        create_snapshot: true,
        keep_snapshots: 1,
        start_after: false,
        hw_config: None,
        schedule: None,
        is_active: true,
        notify_mode: NotifyMode::Daily,
        last_run: None,
        last_status: None,
        last_duration: None,
        last_transferred: None,
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

    async fn setup() -> (crate::db::Database, i64, i64) {
        let db = test_db().await;
        let src = create_node(db.pool(), &test_node("pve1", "10.0.0.11")).await.unwrap();
        let dst = create_node(db.pool(), &test_node("pve2", "10.0.0.12")).await.unwrap();
        (db, src, dst)
    }

    #[tokio::test]
    async fn test_migration_job_crud() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();

        let mut job = test_migration_job("copy-100", src, dst);
        job.hw_config = Some(
            r#"{"memory": 4096, "cores": 4, "network": {"net0": "bridge=vmbr1"}}"#.to_string(),
        );
        let id = create_migration_job(pool, &job).await.unwrap();

        let loaded = get_migration_job(pool, id).await.unwrap();
        assert_eq!(loaded.mode, MigrationMode::Copy);
        assert_eq!(loaded.dest_vm_id, Some(200));
        assert!(loaded.hw_config.is_some());

        delete_migration_job(pool, id).await.unwrap();
        assert!(get_migration_job(pool, id).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_hw_config_rejected() {
        let (db, src, dst) = setup().await;
        let mut job = test_migration_job("bad-hw", src, dst);
        job.hw_config = Some("{not json".to_string());
        assert!(matches!(
            create_migration_job(db.pool(), &job).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_single_flight_and_confirmation_branch() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();
        let id = create_migration_job(pool, &test_migration_job("sf", src, dst))
            .await
            .unwrap();

        try_mark_running(pool, id).await.unwrap();
        assert!(matches!(try_mark_running(pool, id).await, Err(Error::Conflict(_))));

        // The confirmation branch does not consume a run
        clear_running(pool, id).await.unwrap();
        let job = get_migration_job(pool, id).await.unwrap();
        assert_eq!(job.run_count, 0);
        assert_eq!(job.last_status.as_deref(), Some("pending_confirmation"));

        try_mark_running(pool, id).await.unwrap();
        finish_run(pool, id, true, 60, Some("12.3 GB")).await.unwrap();
        let job = get_migration_job(pool, id).await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.last_transferred.as_deref(), Some("12.3 GB"));
    }
}
