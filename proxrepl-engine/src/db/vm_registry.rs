//! VM registry database operations
//!
//! Bookkeeping of guests replicated to a destination node, linking source
//! and destination datasets for later automated registration. Disk-group
//! jobs share a group id so the guest config is written only once.

use proxrepl_common::{Error, GuestType, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRegistryEntry {
    pub id: i64,
    pub vm_id: u32,
    pub vm_type: GuestType,
    pub source_node_id: i64,
    pub dest_node_id: i64,
    pub source_dataset: Option<String>,
    pub dest_dataset: Option<String>,
    pub group_id: Option<String>,
    pub registered_at: i64,
}

pub async fn record_registration(
    pool: &SqlitePool,
    vm_id: u32,
    vm_type: GuestType,
    source_node_id: i64,
    dest_node_id: i64,
    source_dataset: Option<&str>,
    dest_dataset: Option<&str>,
    group_id: Option<&str>,
) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        "INSERT INTO vm_registry (vm_id, vm_type, source_node_id, dest_node_id,
         source_dataset, dest_dataset, group_id, registered_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(vm_id as i64)
    .bind(vm_type.as_str())
    .bind(source_node_id)
    .bind(dest_node_id)
    .bind(source_dataset)
    .bind(dest_dataset)
    .bind(group_id)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to record VM registration: {}", e)))?;

    Ok(result.last_insert_rowid())
}

/// Whether a disk group already wrote the guest config on this destination
pub async fn group_registered(pool: &SqlitePool, group_id: &str, dest_node_id: i64) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS count FROM vm_registry WHERE group_id = ? AND dest_node_id = ?",
    )
    .bind(group_id)
    .bind(dest_node_id)
    .fetch_one(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to check VM group registration: {}", e)))?;

    Ok(row.get::<i64, _>("count") > 0)
}

pub async fn list_registrations(pool: &SqlitePool, dest_node_id: Option<i64>) -> Result<Vec<VmRegistryEntry>> {
    let rows = match dest_node_id {
        Some(node) => sqlx::query("SELECT * FROM vm_registry WHERE dest_node_id = ? ORDER BY registered_at DESC")
            .bind(node)
            .fetch_all(pool)
            .await,
        None => sqlx::query("SELECT * FROM vm_registry ORDER BY registered_at DESC")
            .fetch_all(pool)
            .await,
    }
    .map_err(|e| Error::System(format!("Failed to list VM registrations: {}", e)))?;

    Ok(rows.iter().map(row_to_entry).collect())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> VmRegistryEntry {
    let vm_type_str: String = row.get("vm_type");

    VmRegistryEntry {
        id: row.get("id"),
        vm_id: row.get::<i64, _>("vm_id") as u32,
        vm_type: GuestType::parse(&vm_type_str).unwrap_or(GuestType::Qemu),
        source_node_id: row.get("source_node_id"),
        dest_node_id: row.get("dest_node_id"),
        source_dataset: row.get("source_dataset"),
        dest_dataset: row.get("dest_dataset"),
        group_id: row.get("group_id"),
        registered_at: row.get("registered_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::{create_node, test_node};
    use crate::db::test_db;

    #[tokio::test]
    async fn test_group_registration_dedup() {
        let db = test_db().await;
        let pool = db.pool();
        let src = create_node(pool, &test_node("pve1", "10.0.0.11")).await.unwrap();
        let dst = create_node(pool, &test_node("pve2", "10.0.0.12")).await.unwrap();

        assert!(!group_registered(pool, "grp-100", dst).await.unwrap());

        record_registration(
            pool,
            100,
            GuestType::Qemu,
            src,
            dst,
            Some("rpool/data/vm-100-disk-0"),
            Some("rpool/data/vm-100-disk-0"),
            Some("grp-100"),
        )
        .await
        .unwrap();

        assert!(group_registered(pool, "grp-100", dst).await.unwrap());
        assert!(!group_registered(pool, "grp-100", src).await.unwrap());

        let entries = list_registrations(pool, Some(dst)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vm_id, 100);
    }
}
