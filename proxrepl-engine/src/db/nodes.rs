//! Node and dataset database operations

use proxrepl_common::{Error, GuestType, NodeKind, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// A managed remote endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub node_type: NodeKind,
    pub is_active: bool,
    pub pbs_datastore: Option<String>,
    pub pbs_username: Option<String>,
    pub pbs_password: Option<String>,
    pub pbs_fingerprint: Option<String>,
    pub btrfs_mount: Option<String>,
    pub btrfs_snapshot_dir: Option<String>,
    pub has_sanoid: bool,
    pub has_btrfs: bool,
    pub has_pbs_client: bool,
    pub has_pbs_server: bool,
    pub is_online: bool,
    pub last_check: Option<i64>,
}

/// Fields settable at node creation
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub node_type: Option<NodeKind>,
    pub pbs_datastore: Option<String>,
    pub pbs_username: Option<String>,
    pub pbs_password: Option<String>,
    pub pbs_fingerprint: Option<String>,
    pub btrfs_mount: Option<String>,
    pub btrfs_snapshot_dir: Option<String>,
}

/// Capability flags written back by the probe
#[derive(Debug, Clone, Default)]
pub struct ProbeUpdate {
    pub is_online: bool,
    pub node_type: Option<NodeKind>,
    pub has_sanoid: bool,
    pub has_btrfs: bool,
    pub has_pbs_client: bool,
    pub has_pbs_server: bool,
}

/// A ZFS dataset or BTRFS subvolume observed on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: i64,
    pub node_id: i64,
    pub name: String,
    pub used: Option<String>,
    pub available: Option<String>,
    pub mountpoint: Option<String>,
    pub snapshot_count: i64,
    pub last_snapshot: Option<i64>,
    pub sanoid_enabled: bool,
    pub sanoid_template: Option<String>,
    pub hourly: i64,
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    pub yearly: i64,
    pub autosnap: bool,
    pub autoprune: bool,
}

pub async fn create_node(pool: &SqlitePool, node: &NewNode) -> Result<i64> {
    crate::validation::validate_name(&node.name)?;
    crate::validation::validate_hostname(&node.hostname)?;

    let result = sqlx::query(
        "INSERT INTO nodes (name, hostname, ssh_port, ssh_user, ssh_key_path, node_type,
         pbs_datastore, pbs_username, pbs_password, pbs_fingerprint, btrfs_mount, btrfs_snapshot_dir)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.name)
    .bind(&node.hostname)
    .bind(node.ssh_port as i64)
    .bind(&node.ssh_user)
    .bind(&node.ssh_key_path)
    .bind(node.node_type.unwrap_or(NodeKind::Pve).as_str())
    .bind(&node.pbs_datastore)
    .bind(&node.pbs_username)
    .bind(&node.pbs_password)
    .bind(&node.pbs_fingerprint)
    .bind(&node.btrfs_mount)
    .bind(&node.btrfs_snapshot_dir)
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            Error::Conflict(format!("Node '{}' already exists", node.name))
        }
        other => Error::System(format!("Failed to create node: {}", other)),
    })?;

    Ok(result.last_insert_rowid())
}

pub async fn get_node(pool: &SqlitePool, id: i64) -> Result<NodeRecord> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::NodeNotFound(id.to_string()))?;

    row_to_node(&row)
}

pub async fn get_node_by_name(pool: &SqlitePool, name: &str) -> Result<NodeRecord> {
    let row = sqlx::query("SELECT * FROM nodes WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|_| Error::NodeNotFound(name.to_string()))?;

    row_to_node(&row)
}

pub async fn list_nodes(pool: &SqlitePool, active_only: bool) -> Result<Vec<NodeRecord>> {
    let sql = if active_only {
        "SELECT * FROM nodes WHERE is_active = 1 ORDER BY name"
    } else {
        "SELECT * FROM nodes ORDER BY name"
    };

    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list nodes: {}", e)))?;

    let mut nodes = Vec::with_capacity(rows.len());
    for row in rows {
        nodes.push(row_to_node(&row)?);
    }

    Ok(nodes)
}

/// Write capability flags and online state observed by the probe.
/// Last-writer-wins; every field is idempotently re-derived by the next probe.
pub async fn update_probe_result(pool: &SqlitePool, id: i64, probe: &ProbeUpdate) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "UPDATE nodes SET is_online = ?, has_sanoid = ?, has_btrfs = ?, has_pbs_client = ?,
         has_pbs_server = ?, node_type = COALESCE(?, node_type), last_check = ?,
         updated_at = CURRENT_TIMESTAMP
         WHERE id = ?",
    )
    .bind(probe.is_online)
    .bind(probe.has_sanoid)
    .bind(probe.has_btrfs)
    .bind(probe.has_pbs_client)
    .bind(probe.has_pbs_server)
    .bind(probe.node_type.map(|t| t.as_str()))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to update probe result: {}", e)))?;

    Ok(())
}

/// Soft-delete: the node stays referencable by existing jobs but is skipped
/// by the scheduler and the dashboards.
pub async fn set_node_active(pool: &SqlitePool, id: i64, active: bool) -> Result<()> {
    let result = sqlx::query("UPDATE nodes SET is_active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to update node: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::NodeNotFound(id.to_string()));
    }

    Ok(())
}

/// Hard delete, rejected while any job references the node.
/// Datasets cascade.
pub async fn delete_node(pool: &SqlitePool, id: i64) -> Result<()> {
    let refs = count_job_references(pool, id).await?;
    if refs > 0 {
        return Err(Error::Conflict(format!(
            "Node {} is referenced by {} job(s) and cannot be deleted",
            id, refs
        )));
    }

    let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to delete node: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::NodeNotFound(id.to_string()));
    }

    Ok(())
}

async fn count_job_references(pool: &SqlitePool, node_id: i64) -> Result<i64> {
    let row = sqlx::query(
        "SELECT
            (SELECT COUNT(*) FROM sync_jobs WHERE source_node_id = ? OR dest_node_id = ?)
          + (SELECT COUNT(*) FROM recovery_jobs WHERE source_node_id = ? OR pbs_node_id = ? OR dest_node_id = ?)
          + (SELECT COUNT(*) FROM migration_jobs WHERE source_node_id = ? OR dest_node_id = ?)
          + (SELECT COUNT(*) FROM host_backup_jobs WHERE node_id = ?) AS refs",
    )
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .bind(node_id)
    .fetch_one(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to count job references: {}", e)))?;

    Ok(row.get("refs"))
}

/// Insert or refresh an observed dataset row
pub async fn upsert_dataset(
    pool: &SqlitePool,
    node_id: i64,
    name: &str,
    used: Option<&str>,
    available: Option<&str>,
    mountpoint: Option<&str>,
    snapshot_count: i64,
    last_snapshot: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO datasets (node_id, name, used, available, mountpoint, snapshot_count, last_snapshot)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(node_id, name) DO UPDATE SET
            used = excluded.used,
            available = excluded.available,
            mountpoint = excluded.mountpoint,
            snapshot_count = excluded.snapshot_count,
            last_snapshot = excluded.last_snapshot,
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(node_id)
    .bind(name)
    .bind(used)
    .bind(available)
    .bind(mountpoint)
    .bind(snapshot_count)
    .bind(last_snapshot)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to upsert dataset: {}", e)))?;

    Ok(())
}

pub async fn list_datasets(pool: &SqlitePool, node_id: i64) -> Result<Vec<DatasetRecord>> {
    let rows = sqlx::query("SELECT * FROM datasets WHERE node_id = ? ORDER BY name")
        .bind(node_id)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to list datasets: {}", e)))?;

    Ok(rows.iter().map(row_to_dataset).collect())
}

/// Update the sanoid retention policy attached to a dataset
pub async fn set_dataset_policy(
    pool: &SqlitePool,
    dataset_id: i64,
    enabled: bool,
    template: Option<&str>,
    hourly: i64,
    daily: i64,
    weekly: i64,
    monthly: i64,
    yearly: i64,
    autosnap: bool,
    autoprune: bool,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE datasets SET sanoid_enabled = ?, sanoid_template = ?, hourly = ?, daily = ?,
         weekly = ?, monthly = ?, yearly = ?, autosnap = ?, autoprune = ?,
         updated_at = CURRENT_TIMESTAMP
         WHERE id = ?",
    )
    .bind(enabled)
    .bind(template)
    .bind(hourly)
    .bind(daily)
    .bind(weekly)
    .bind(monthly)
    .bind(yearly)
    .bind(autosnap)
    .bind(autoprune)
    .bind(dataset_id)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to update dataset policy: {}", e)))?;

    if result.rows_affected() == 0 {
        return Err(Error::JobNotFound(format!("dataset {}", dataset_id)));
    }

    Ok(())
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<NodeRecord> {
    let node_type_str: String = row.get("node_type");

    Ok(NodeRecord {
        id: row.get("id"),
        name: row.get("name"),
        hostname: row.get("hostname"),
        ssh_port: row.get::<i64, _>("ssh_port") as u16,
        ssh_user: row.get("ssh_user"),
        ssh_key_path: row.get("ssh_key_path"),
        node_type: NodeKind::parse(&node_type_str).unwrap_or(NodeKind::Pve),
        is_active: row.get("is_active"),
        pbs_datastore: row.get("pbs_datastore"),
        pbs_username: row.get("pbs_username"),
        pbs_password: row.get("pbs_password"),
        pbs_fingerprint: row.get("pbs_fingerprint"),
        btrfs_mount: row.get("btrfs_mount"),
        btrfs_snapshot_dir: row.get("btrfs_snapshot_dir"),
        has_sanoid: row.get("has_sanoid"),
        has_btrfs: row.get("has_btrfs"),
        has_pbs_client: row.get("has_pbs_client"),
        has_pbs_server: row.get("has_pbs_server"),
        is_online: row.get("is_online"),
        last_check: row.get("last_check"),
    })
}

fn row_to_dataset(row: &sqlx::sqlite::SqliteRow) -> DatasetRecord {
    DatasetRecord {
        id: row.get("id"),
        node_id: row.get("node_id"),
        name: row.get("name"),
        used: row.get("used"),
        available: row.get("available"),
        mountpoint: row.get("mountpoint"),
        snapshot_count: row.get("snapshot_count"),
        last_snapshot: row.get("last_snapshot"),
        sanoid_enabled: row.get("sanoid_enabled"),
        sanoid_template: row.get("sanoid_template"),
        hourly: row.get("hourly"),
        daily: row.get("daily"),
        weekly: row.get("weekly"),
        monthly: row.get("monthly"),
        yearly: row.get("yearly"),
        autosnap: row.get("autosnap"),
        autoprune: row.get("autoprune"),
    }
}

impl NodeRecord {
    /// SSH connection parameters for this node
    pub fn ssh_target(&self) -> crate::ssh::SshTarget {
        crate::ssh::SshTarget::new(
            self.hostname.clone(),
            self.ssh_port,
            self.ssh_user.clone(),
            self.ssh_key_path.clone(),
        )
    }

    /// Guest config path on a PVE node
    pub fn guest_config_path(vm_id: u32, guest_type: GuestType) -> String {
        match guest_type {
            GuestType::Qemu => format!("/etc/pve/qemu-server/{}.conf", vm_id),
            GuestType::Lxc => format!("/etc/pve/lxc/{}.conf", vm_id),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_node(name: &str, hostname: &str) -> NewNode {
    NewNode {
        name: name.to_string(),
        hostname: hostname.to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        ssh_key_path: "/root/.ssh/id_rsa".to_string(),
        node_type: Some(NodeKind::Pve),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn test_node_crud() {
        let db = test_db().await;
        let pool = db.pool();

        let id = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();
        assert!(id > 0);

        let node = get_node(pool, id).await.unwrap();
        assert_eq!(node.name, "pve1");
        assert_eq!(node.hostname, "10.0.0.11");
        assert_eq!(node.ssh_port, 22);
        assert_eq!(node.node_type, NodeKind::Pve);
        assert!(node.is_active);
        assert!(!node.is_online);

        let by_name = get_node_by_name(pool, "pve1").await.unwrap();
        assert_eq!(by_name.id, id);

        let nodes = list_nodes(pool, true).await.unwrap();
        assert_eq!(nodes.len(), 1);

        set_node_active(pool, id, false).await.unwrap();
        let nodes = list_nodes(pool, true).await.unwrap();
        assert!(nodes.is_empty());

        delete_node(pool, id).await.unwrap();
        assert!(get_node(pool, id).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_node_name_rejected() {
        let db = test_db().await;
        let pool = db.pool();

        create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();
        let result = create_node(pool, &test_node("pve1", "10.0.0.12")).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_invalid_hostname_rejected() {
        let db = test_db().await;
        let result = create_node(db.pool(), &test_node("bad", "host; reboot")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_probe_update() {
        let db = test_db().await;
        let pool = db.pool();
        let id = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();

        update_probe_result(
            pool,
            id,
            &ProbeUpdate {
                is_online: true,
                node_type: Some(NodeKind::Pbs),
                has_sanoid: true,
                has_btrfs: false,
                has_pbs_client: true,
                has_pbs_server: true,
            },
        )
        .await
        .unwrap();

        let node = get_node(pool, id).await.unwrap();
        assert!(node.is_online);
        assert!(node.has_sanoid);
        assert!(node.has_pbs_server);
        assert_eq!(node.node_type, NodeKind::Pbs);
        assert!(node.last_check.is_some());
    }

    #[tokio::test]
    async fn test_delete_node_with_job_reference_rejected() {
        let db = test_db().await;
        let pool = db.pool();
        let src = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();
        let dst = create_node(pool, &test_node("pve2", "10.0.0.12")).await.unwrap();

        let job = crate::db::sync_jobs::test_sync_job("job1", src, dst);
        crate::db::sync_jobs::create_sync_job(pool, &job).await.unwrap();

        assert!(matches!(delete_node(pool, src).await, Err(Error::Conflict(_))));
        assert!(matches!(delete_node(pool, dst).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_dataset_upsert_and_cascade() {
        let db = test_db().await;
        let pool = db.pool();
        let id = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();

        upsert_dataset(pool, id, "rpool/data", Some("10G"), Some("90G"), Some("/rpool/data"), 3, None)
            .await
            .unwrap();
        upsert_dataset(pool, id, "rpool/data", Some("11G"), Some("89G"), Some("/rpool/data"), 4, Some(1))
            .await
            .unwrap();

        let datasets = list_datasets(pool, id).await.unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].used.as_deref(), Some("11G"));
        assert_eq!(datasets[0].snapshot_count, 4);

        delete_node(pool, id).await.unwrap();
        let datasets = list_datasets(pool, id).await.unwrap();
        assert!(datasets.is_empty());
    }

    #[test]
    fn test_guest_config_path() {
        assert_eq!(
            NodeRecord::guest_config_path(100, GuestType::Qemu),
            "/etc/pve/qemu-server/100.conf"
        );
        assert_eq!(
            NodeRecord::guest_config_path(200, GuestType::Lxc),
            "/etc/pve/lxc/200.conf"
        );
    }
}
