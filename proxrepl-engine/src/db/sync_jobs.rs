//! Sync job database operations (ZFS and BTRFS stream replication)

use proxrepl_common::{Error, GuestType, NotifyMode, Result, SyncMethod};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Definition of a recurring stream replication plus its run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub name: String,
    pub source_node_id: i64,
    pub dest_node_id: i64,
    pub source_dataset: String,
    pub dest_dataset: String,
    pub method: SyncMethod,
    pub recursive: bool,
    pub compress: Option<String>,
    pub mbuffer_size: Option<String>,
    pub no_sync_snap: bool,
    pub force_delete: bool,
    pub extra_args: Option<String>,
    pub convert_to_subvolume: bool,
    pub schedule: Option<String>,
    pub is_active: bool,
    pub retention_keep: i64,
    pub prune_source: bool,
    pub register_vm: bool,
    pub vm_id: Option<u32>,
    pub vm_type: Option<GuestType>,
    pub source_storage: Option<String>,
    pub dest_storage: Option<String>,
    pub dest_vm_id: Option<u32>,
    pub vm_group_id: Option<String>,
    pub retry_on_failure: bool,
    pub max_retries: i64,
    pub retry_delay_minutes: i64,
    pub notify_mode: NotifyMode,
    pub last_run: Option<i64>,
    pub last_status: Option<String>,
    pub last_duration: Option<i64>,
    pub last_transferred: Option<String>,
    pub last_sync_type: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
}

fn validate(job: &SyncJob) -> Result<()> {
    crate::validation::validate_name(&job.name)?;
    if job.source_node_id == job.dest_node_id {
        return Err(Error::Validation(
            "Source and destination node must differ".to_string(),
        ));
    }

    match job.method {
        SyncMethod::ZfsSyncoid => {
            crate::validation::validate_dataset(&job.source_dataset)?;
            crate::validation::validate_dataset(&job.dest_dataset)?;
        }
        SyncMethod::BtrfsSend => {
            crate::validation::validate_subvolume_path(&job.source_dataset)?;
            crate::validation::validate_subvolume_path(&job.dest_dataset)?;
        }
    }

    if let Some(schedule) = job.schedule.as_deref() {
        if !schedule.is_empty() {
            crate::validation::validate_cron(schedule)?;
        }
    }
    if let Some(args) = job.extra_args.as_deref() {
        crate::validation::validate_extra_args(args)?;
    }
    if let Some(vm_id) = job.vm_id {
        crate::validation::validate_vmid(vm_id)?;
    }
    if let Some(vm_id) = job.dest_vm_id {
        crate::validation::validate_vmid(vm_id)?;
    }
    if job.register_vm && job.vm_id.is_none() {
        return Err(Error::Validation(
            "VM registration requires a vm_id".to_string(),
        ));
    }

    Ok(())
}

pub async fn create_sync_job(pool: &SqlitePool, job: &SyncJob) -> Result<i64> {
    validate(job)?;

    let result = sqlx::query(
        "INSERT INTO sync_jobs (name, source_node_id, dest_node_id, source_dataset, dest_dataset,
         method, recursive, compress, mbuffer_size, no_sync_snap, force_delete, extra_args,
         convert_to_subvolume, schedule, is_active, retention_keep, prune_source, register_vm,
         vm_id, vm_type, source_storage, dest_storage, dest_vm_id, vm_group_id,
         retry_on_failure, max_retries, retry_delay_minutes, notify_mode)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.name)
    .bind(job.source_node_id)
    .bind(job.dest_node_id)
    .bind(&job.source_dataset)
    .bind(&job.dest_dataset)
    .bind(job.method.as_str())
    .bind(job.recursive)
    .bind(&job.compress)
    .bind(&job.mbuffer_size)
    .bind(job.no_sync_snap)
    .bind(job.force_delete)
    .bind(&job.extra_args)
    .bind(job.convert_to_subvolume)
    .bind(&job.schedule)
    .bind(job.is_active)
    .bind(job.retention_keep)
    .bind(job.prune_source)
    .bind(job.register_vm)
    .bind(job.vm_id.map(|v| v as i64))
    .bind(job.vm_type.map(|t| t.as_str()))
    .bind(&job.source_storage)
    .bind(&job.dest_storage)
    .bind(job.dest_vm_id.map(|v| v as i64))
    .bind(&job.vm_group_id)
    .bind(job.retry_on_failure)
    .bind(job.max_retries)
    .bind(job.retry_delay_minutes)
    .bind(job.notify_mode.as_str())
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("Sync job '{}' already exists", job.name))
        }
        other => Error::System(format!("Failed to create sync job: {}", other)),
    })?;

    Ok(result.last_insert_rowid())
}

pub async fn get_sync_job(pool: &SqlitePool, id: i64) -> Result<SyncJob> {
    let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::JobNotFound(format!("sync job {}", id)))?;

    Ok(row_to_job(&row))
}

pub async fn list_sync_jobs(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query("SELECT * FROM sync_jobs ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list sync jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

/// Active jobs with a non-empty cron expression, for the scheduler
pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(
        "SELECT * FROM sync_jobs WHERE is_active = 1 AND schedule IS NOT NULL AND schedule != ''",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to list scheduled sync jobs: {}", e)))?;

    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn update_sync_job(pool: &SqlitePool, job: &SyncJob) -> Result<()> {
    validate(job)?;

    let result = sqlx::query(
        "UPDATE sync_jobs SET name = ?, source_node_id = ?, dest_node_id = ?, source_dataset = ?,
         dest_dataset = ?, method = ?, recursive = ?, compress = ?, mbuffer_size = ?,
         no_sync_snap = ?, force_delete = ?, extra_args = ?, convert_to_subvolume = ?,
         schedule = ?, is_active = ?, retention_keep = ?, prune_source = ?, register_vm = ?,
         vm_id = ?, vm_type = ?, source_storage = ?, dest_storage = ?, dest_vm_id = ?,
         vm_group_id = ?, retry_on_failure = ?, max_retries = ?, retry_delay_minutes = ?,
         notify_mode = ?
         WHERE id = ?",
    )
    .bind(&job.name)
    .bind(job.source_node_id)
    .bind(job.dest_node_id)
    .bind(&job.source_dataset)
    .bind(&job.dest_dataset)
    .bind(job.method.as_str())
    .bind(job.recursive)
    .bind(&job.compress)
    .bind(&job.mbuffer_size)
    .bind(job.no_sync_snap)
    .bind(job.force_delete)
    .bind(&job.extra_args)
    .bind(job.convert_to_subvolume)
    .bind(&job.schedule)
    .bind(job.is_active)
    .bind(job.retention_keep)
    .bind(job.prune_source)
    .bind(job.register_vm)
    .bind(job.vm_id.map(|v| v as i64))
    .bind(job.vm_type.map(|t| t.as_str()))
    .bind(&job.source_storage)
    .bind(&job.dest_storage)
    .bind(job.dest_vm_id.map(|v| v as i64))
    .bind(&job.vm_group_id)
    .bind(job.retry_on_failure)
    .bind(job.max_retries)
    .bind(job.retry_delay_minutes)
    .bind(job.notify_mode.as_str())
    .bind(job.id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to update sync job: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("sync job {}", job.id)));
    }

    Ok(())
}

pub async fn delete_sync_job(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_logs WHERE job_type = 'sync' AND job_id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete sync job logs: {}", e)))?;

    let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete sync job: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("sync job {}", id)));
    }

    Ok(())
}

/// Single-flight guard: transition to `running` only when no run is active.
pub async fn try_mark_running(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "UPDATE sync_jobs SET last_status = 'running', updated_at = ?
         WHERE id = ? AND (last_status IS NULL OR last_status != 'running')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to mark sync job running: {}", e)))?;

    if result.rows_affected() == 0 {
        // Either missing or already running; disambiguate for the caller
        get_sync_job(pool, id).await?;
        return Err(Error::Conflict(format!("Sync job {} is already running", id)));
    }

    Ok(())
}

/// Write final run statistics. `consecutive_failures` resets on success and
/// grows strictly on failure.
pub async fn finish_run(
    pool: &SqlitePool,
    id: i64,
    success: bool,
    duration: i64,
    transferred: Option<&str>,
    sync_type: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let status = if success { "success" } else { "failed" };

    sqlx::query(
        "UPDATE sync_jobs SET
            last_run = ?,
            last_status = ?,
            last_duration = ?,
            last_transferred = COALESCE(?, last_transferred),
            last_sync_type = COALESCE(?, last_sync_type),
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
    .bind(sync_type)
    .bind(success)
    .bind(success)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to record sync run: {}", e)))?;

    Ok(())
}

/// Crash recovery: force stale `running` rows to `failed`.
pub async fn recover_abandoned(pool: &SqlitePool, horizon_secs: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - horizon_secs;

    let result = sqlx::query(
        "UPDATE sync_jobs SET last_status = 'failed',
            consecutive_failures = consecutive_failures + 1,
            error_count = error_count + 1
         WHERE last_status = 'running' AND (updated_at IS NULL OR updated_at < ?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to recover abandoned sync jobs: {}", e)))?;

    Ok(result.rows_affected())
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SyncJob {
    let method_str: String = row.get("method");
    let notify_str: String = row.get("notify_mode");
    let vm_type_str: Option<String> = row.get("vm_type");

    SyncJob {
        id: row.get("id"),
        name: row.get("name"),
        source_node_id: row.get("source_node_id"),
        dest_node_id: row.get("dest_node_id"),
        source_dataset: row.get("source_dataset"),
        dest_dataset: row.get("dest_dataset"),
        method: SyncMethod::parse(&method_str).unwrap_or(SyncMethod::ZfsSyncoid),
        recursive: row.get("recursive"),
        compress: row.get("compress"),
        mbuffer_size: row.get("mbuffer_size"),
        no_sync_snap: row.get("no_sync_snap"),
        force_delete: row.get("force_delete"),
        extra_args: row.get("extra_args"),
        convert_to_subvolume: row.get("convert_to_subvolume"),
        schedule: row.get("schedule"),
        is_active: row.get("is_active"),
        retention_keep: row.get("retention_keep"),
        prune_source: row.get("prune_source"),
        register_vm: row.get("register_vm"),
        vm_id: row.get::<Option<i64>, _>("vm_id").map(|v| v as u32),
        vm_type: vm_type_str.as_deref().and_then(GuestType::parse),
        source_storage: row.get("source_storage"),
        dest_storage: row.get("dest_storage"),
        dest_vm_id: row.get::<Option<i64>, _>("dest_vm_id").map(|v| v as u32),
        vm_group_id: row.get("vm_group_id"),
        retry_on_failure: row.get("retry_on_failure"),
        max_retries: row.get("max_retries"),
        retry_delay_minutes: row.get("retry_delay_minutes"),
        notify_mode: NotifyMode::parse(&notify_str).unwrap_or_default(),
        last_run: row.get("last_run"),
        last_status: row.get("last_status"),
        last_duration: row.get("last_duration"),
        last_transferred: row.get("last_transferred"),
        last_sync_type: row.get("last_sync_type"),
        run_count: row.get("run_count"),
        error_count: row.get("error_count"),
        consecutive_failures: row.get("consecutive_failures"),
    }
}

#[cfg(test)]
pub(crate) fn test_sync_job(name: &str, source: i64, dest: i64) -> SyncJob {
    SyncJob {
        id: 0,
        name: name.to_string(),
        source_node_id: source,
        dest_node_id: dest,
        source_dataset: "rpool/data/vm-100-disk-0".to_string(),
        dest_dataset: "rpool/data/vm-100-disk-0".to_string(),
        method: SyncMethod::ZfsSyncoid,
        recursive: false,
        compress: Some("lz4".to_string()),
        mbuffer_size: Some("128M".to_string()),
        no_sync_snap: false,
        force_delete: false,
        extra_args: None,
        convert_to_subvolume: false,
        schedule: None,
        is_active: true,
        retention_keep: 0,
        prune_source: false,
        register_vm: false,
        vm_id: None,
        vm_type: None,
        source_storage: None,
        dest_storage: None,
        dest_vm_id: None,
        vm_group_id: None,
        retry_on_failure: false,
        max_retries: 3,
        retry_delay_minutes: 15,
        notify_mode: NotifyMode::Daily,
        last_run: None,
        last_status: None,
        last_duration: None,
        last_transferred: None,
        last_sync_type: None,
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
    async fn test_sync_job_crud() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();

        let mut job = test_sync_job("nightly", src, dst);
        job.schedule = Some("*/5 * * * *".to_string());
        let id = create_sync_job(pool, &job).await.unwrap();

        let loaded = get_sync_job(pool, id).await.unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.method, SyncMethod::ZfsSyncoid);
        assert_eq!(loaded.compress.as_deref(), Some("lz4"));
        assert_eq!(loaded.run_count, 0);

        let scheduled = list_scheduled(pool).await.unwrap();
        assert_eq!(scheduled.len(), 1);

        let mut updated = loaded.clone();
        updated.schedule = None;
        update_sync_job(pool, &updated).await.unwrap();
        assert!(list_scheduled(pool).await.unwrap().is_empty());

        delete_sync_job(pool, id).await.unwrap();
        assert!(get_sync_job(pool, id).await.is_err());
    }

    #[tokio::test]
    async fn test_source_equals_dest_rejected() {
        let (db, src, _) = setup().await;
        let job = test_sync_job("bad", src, src);
        let result = create_sync_job(db.pool(), &job).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let (db, src, dst) = setup().await;
        let mut job = test_sync_job("bad-cron", src, dst);
        job.schedule = Some("every day".to_string());
        assert!(matches!(
            create_sync_job(db.pool(), &job).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();
        let id = create_sync_job(pool, &test_sync_job("sf", src, dst)).await.unwrap();

        try_mark_running(pool, id).await.unwrap();
        let second = try_mark_running(pool, id).await;
        assert!(matches!(second, Err(Error::Conflict(_))));

        finish_run(pool, id, true, 10, Some("1.2 GiB"), Some("full")).await.unwrap();
        try_mark_running(pool, id).await.unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_failures_semantics() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();
        let id = create_sync_job(pool, &test_sync_job("cf", src, dst)).await.unwrap();

        finish_run(pool, id, false, 5, None, None).await.unwrap();
        finish_run(pool, id, false, 5, None, None).await.unwrap();
        let job = get_sync_job(pool, id).await.unwrap();
        assert_eq!(job.consecutive_failures, 2);
        assert_eq!(job.error_count, 2);
        assert_eq!(job.run_count, 2);

        finish_run(pool, id, true, 5, Some("900 MiB"), Some("incremental")).await.unwrap();
        let job = get_sync_job(pool, id).await.unwrap();
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.error_count, 2);
        assert_eq!(job.run_count, 3);
        assert_eq!(job.last_status.as_deref(), Some("success"));
        assert_eq!(job.last_transferred.as_deref(), Some("900 MiB"));
        assert_eq!(job.last_sync_type.as_deref(), Some("incremental"));
    }

    #[tokio::test]
    async fn test_recover_abandoned() {
        let (db, src, dst) = setup().await;
        let pool = db.pool();
        let id = create_sync_job(pool, &test_sync_job("ra", src, dst)).await.unwrap();

        try_mark_running(pool, id).await.unwrap();

        // Fresh running state is inside the horizon and left alone
        let recovered = recover_abandoned(pool, 3600).await.unwrap();
        assert_eq!(recovered, 0);

        // With a zero horizon everything running is stale
        let recovered = recover_abandoned(pool, -1).await.unwrap();
        assert_eq!(recovered, 1);

        let job = get_sync_job(pool, id).await.unwrap();
        assert_eq!(job.last_status.as_deref(), Some("failed"));
        assert_eq!(job.consecutive_failures, 1);
    }
}
