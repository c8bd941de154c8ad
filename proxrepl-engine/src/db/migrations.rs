//! Database migrations

use proxrepl_common::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| proxrepl_common::Error::System(format!("Failed to create migrations table: {}", e)))?;

    // Run migrations in order
    run_migration(pool, "001_create_nodes_table", MIGRATION_001_CREATE_NODES).await?;
    run_migration(pool, "002_create_datasets_table", MIGRATION_002_CREATE_DATASETS).await?;
    run_migration(pool, "003_create_sync_jobs_table", MIGRATION_003_CREATE_SYNC_JOBS).await?;
    run_migration(pool, "004_create_recovery_jobs_table", MIGRATION_004_CREATE_RECOVERY_JOBS).await?;
    run_migration(pool, "005_create_migration_jobs_table", MIGRATION_005_CREATE_MIGRATION_JOBS).await?;
    run_migration(pool, "006_create_host_backup_jobs_table", MIGRATION_006_CREATE_HOST_BACKUP_JOBS).await?;
    run_migration(pool, "007_create_job_logs_table", MIGRATION_007_CREATE_JOB_LOGS).await?;
    run_migration(pool, "008_create_vm_registry_table", MIGRATION_008_CREATE_VM_REGISTRY).await?;
    run_migration(pool, "009_create_system_config_table", MIGRATION_009_CREATE_SYSTEM_CONFIG).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    // Check if migration already ran
    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| proxrepl_common::Error::System(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    // Run migration
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| proxrepl_common::Error::System(format!("Migration {} failed: {}", name, e)))?;

    // Record migration
    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| proxrepl_common::Error::System(format!("Failed to record migration: {}", e)))?;

    tracing::info!("Migration {} completed", name);

    Ok(())
}

const MIGRATION_001_CREATE_NODES: &str = "
CREATE TABLE nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_user TEXT NOT NULL DEFAULT 'root',
    ssh_key_path TEXT NOT NULL DEFAULT '/root/.ssh/id_rsa',
    node_type TEXT NOT NULL DEFAULT 'pve',
    is_active INTEGER NOT NULL DEFAULT 1,
    pbs_datastore TEXT,
    pbs_username TEXT,
    pbs_password TEXT,
    pbs_fingerprint TEXT,
    btrfs_mount TEXT,
    btrfs_snapshot_dir TEXT,
    has_sanoid INTEGER NOT NULL DEFAULT 0,
    has_btrfs INTEGER NOT NULL DEFAULT 0,
    has_pbs_client INTEGER NOT NULL DEFAULT 0,
    has_pbs_server INTEGER NOT NULL DEFAULT 0,
    is_online INTEGER NOT NULL DEFAULT 0,
    last_check INTEGER,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX idx_nodes_name ON nodes(name);
CREATE INDEX idx_nodes_type ON nodes(node_type);
";

const MIGRATION_002_CREATE_DATASETS: &str = "
CREATE TABLE datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    used TEXT,
    available TEXT,
    mountpoint TEXT,
    snapshot_count INTEGER NOT NULL DEFAULT 0,
    last_snapshot INTEGER,
    sanoid_enabled INTEGER NOT NULL DEFAULT 0,
    sanoid_template TEXT,
    hourly INTEGER NOT NULL DEFAULT 24,
    daily INTEGER NOT NULL DEFAULT 30,
    weekly INTEGER NOT NULL DEFAULT 4,
    monthly INTEGER NOT NULL DEFAULT 12,
    yearly INTEGER NOT NULL DEFAULT 0,
    autosnap INTEGER NOT NULL DEFAULT 1,
    autoprune INTEGER NOT NULL DEFAULT 1,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(node_id, name),
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
);

CREATE INDEX idx_datasets_node ON datasets(node_id);
";

const MIGRATION_003_CREATE_SYNC_JOBS: &str = "
CREATE TABLE sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source_node_id INTEGER NOT NULL,
    dest_node_id INTEGER NOT NULL,
    source_dataset TEXT NOT NULL,
    dest_dataset TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'zfs_syncoid',
    recursive INTEGER NOT NULL DEFAULT 0,
    compress TEXT,
    mbuffer_size TEXT,
    no_sync_snap INTEGER NOT NULL DEFAULT 0,
    force_delete INTEGER NOT NULL DEFAULT 0,
    extra_args TEXT,
    convert_to_subvolume INTEGER NOT NULL DEFAULT 0,
    schedule TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    retention_keep INTEGER NOT NULL DEFAULT 0,
    prune_source INTEGER NOT NULL DEFAULT 0,
    register_vm INTEGER NOT NULL DEFAULT 0,
    vm_id INTEGER,
    vm_type TEXT,
    source_storage TEXT,
    dest_storage TEXT,
    dest_vm_id INTEGER,
    vm_group_id TEXT,
    retry_on_failure INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    retry_delay_minutes INTEGER NOT NULL DEFAULT 15,
    notify_mode TEXT NOT NULL DEFAULT 'daily',
    last_run INTEGER,
    last_status TEXT,
    last_duration INTEGER,
    last_transferred TEXT,
    last_sync_type TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at INTEGER,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (dest_node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_sync_jobs_active ON sync_jobs(is_active);
CREATE INDEX idx_sync_jobs_source ON sync_jobs(source_node_id);
CREATE INDEX idx_sync_jobs_dest ON sync_jobs(dest_node_id);
";

const MIGRATION_004_CREATE_RECOVERY_JOBS: &str = "
CREATE TABLE recovery_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source_node_id INTEGER NOT NULL,
    vm_id INTEGER NOT NULL,
    vm_type TEXT NOT NULL DEFAULT 'qemu',
    pbs_node_id INTEGER NOT NULL,
    datastore TEXT NOT NULL,
    pbs_storage_id TEXT,
    dest_node_id INTEGER NOT NULL,
    dest_vm_id INTEGER,
    dest_vm_name_suffix TEXT,
    dest_storage TEXT,
    backup_mode TEXT NOT NULL DEFAULT 'snapshot',
    backup_compress TEXT NOT NULL DEFAULT 'zstd',
    include_all_disks INTEGER NOT NULL DEFAULT 1,
    start_after INTEGER NOT NULL DEFAULT 0,
    unique_ids INTEGER NOT NULL DEFAULT 1,
    overwrite_existing INTEGER NOT NULL DEFAULT 1,
    backup_schedule TEXT,
    restore_schedule TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    retry_on_failure INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    retry_delay_minutes INTEGER NOT NULL DEFAULT 15,
    notify_mode TEXT NOT NULL DEFAULT 'daily',
    current_status TEXT NOT NULL DEFAULT 'pending',
    last_backup_id TEXT,
    last_run INTEGER,
    last_status TEXT,
    last_duration INTEGER,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at INTEGER,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (pbs_node_id) REFERENCES nodes(id),
    FOREIGN KEY (dest_node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_recovery_jobs_active ON recovery_jobs(is_active);
CREATE INDEX idx_recovery_jobs_status ON recovery_jobs(current_status);
";

const MIGRATION_005_CREATE_MIGRATION_JOBS: &str = "
CREATE TABLE migration_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source_node_id INTEGER NOT NULL,
    vm_id INTEGER NOT NULL,
    vm_type TEXT NOT NULL DEFAULT 'qemu',
    dest_node_id INTEGER NOT NULL,
    dest_vm_id INTEGER,
    dest_vm_name_suffix TEXT,
    mode TEXT NOT NULL DEFAULT 'copy',
    create_snapshot INTEGER NOT NULL DEFAULT 1,
    keep_snapshots INTEGER NOT NULL DEFAULT 1,
    start_after INTEGER NOT NULL DEFAULT 0,
    hw_config TEXT,
    schedule TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    notify_mode TEXT NOT NULL DEFAULT 'daily',
    last_run INTEGER,
    last_status TEXT,
    last_duration INTEGER,
    last_transferred TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at INTEGER,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (dest_node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_migration_jobs_active ON migration_jobs(is_active);
";

const MIGRATION_006_CREATE_HOST_BACKUP_JOBS: &str = "
CREATE TABLE host_backup_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    node_id INTEGER NOT NULL,
    dest_path TEXT NOT NULL DEFAULT '/var/backups/proxmox-config',
    compress INTEGER NOT NULL DEFAULT 1,
    encrypt INTEGER NOT NULL DEFAULT 0,
    encrypt_password TEXT,
    keep_last INTEGER NOT NULL DEFAULT 7,
    schedule TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    notify_mode TEXT NOT NULL DEFAULT 'daily',
    current_status TEXT,
    last_backup_file TEXT,
    last_backup_size INTEGER,
    last_run INTEGER,
    last_status TEXT,
    last_duration INTEGER,
    last_error TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at INTEGER,
    FOREIGN KEY (node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_host_backup_jobs_active ON host_backup_jobs(is_active);
";

const MIGRATION_007_CREATE_JOB_LOGS: &str = "
CREATE TABLE job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    job_id INTEGER NOT NULL,
    phase TEXT NOT NULL DEFAULT 'main',
    status TEXT NOT NULL,
    node_name TEXT,
    dataset TEXT,
    message TEXT,
    output TEXT,
    error TEXT,
    command TEXT,
    exit_code INTEGER,
    bytes_transferred TEXT,
    backup_id TEXT,
    triggered_by TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    duration INTEGER
);

CREATE INDEX idx_job_logs_run ON job_logs(run_id);
CREATE INDEX idx_job_logs_job ON job_logs(job_type, job_id);
CREATE INDEX idx_job_logs_started ON job_logs(started_at);
";

const MIGRATION_008_CREATE_VM_REGISTRY: &str = "
CREATE TABLE vm_registry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vm_id INTEGER NOT NULL,
    vm_type TEXT NOT NULL DEFAULT 'qemu',
    source_node_id INTEGER NOT NULL,
    dest_node_id INTEGER NOT NULL,
    source_dataset TEXT,
    dest_dataset TEXT,
    group_id TEXT,
    registered_at INTEGER NOT NULL,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (dest_node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_vm_registry_vm ON vm_registry(vm_id);
CREATE INDEX idx_vm_registry_group ON vm_registry(group_id);
";

const MIGRATION_009_CREATE_SYSTEM_CONFIG: &str = "
CREATE TABLE system_config (
    key TEXT PRIMARY KEY,
    value TEXT,
    value_type TEXT NOT NULL DEFAULT 'string',
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";
