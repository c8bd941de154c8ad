//! Snapshot management
//!
//! ZFS snapshot CRUD (create, delete, rollback, clone) on remote nodes and
//! the per-guest aggregated snapshot view combining sanoid, syncoid and
//! Proxmox guest snapshots.

use crate::db::nodes::NodeRecord;
use crate::inventory::{RemoteInventory, SnapshotInfo};
use crate::ssh::{SshExecutor, SNAPSHOT_TIMEOUT};
use proxrepl_common::{Error, GuestType, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Where an observed snapshot came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// sanoid `autosnap_*` policy snapshots
    Sanoid,
    /// `syncoid_*` replication snapshots
    Syncoid,
    /// Proxmox guest snapshots (`qm/pct listsnapshot`)
    Guest,
    /// Anything else on the dataset
    Manual,
}

/// One row of the aggregated per-guest view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSnapshot {
    pub source: SnapshotSource,
    pub dataset: Option<String>,
    pub name: String,
    pub creation: Option<i64>,
}

/// Snapshot operations against remote nodes
pub struct SnapshotManager {
    executor: Arc<SshExecutor>,
    inventory: Arc<RemoteInventory>,
}

impl SnapshotManager {
    pub fn new(executor: Arc<SshExecutor>, inventory: Arc<RemoteInventory>) -> Self {
        Self {
            executor,
            inventory,
        }
    }

    /// Create a ZFS snapshot
    pub async fn create_snapshot(&self, node: &NodeRecord, dataset: &str, name: &str) -> Result<()> {
        crate::validation::validate_dataset(dataset)?;
        crate::validation::validate_snapshot_name(name)?;

        let cmd = format!("zfs snapshot '{}@{}'", dataset, name);
        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to create snapshot {}@{}: {}",
                dataset,
                name,
                output.stderr.trim()
            )));
        }

        info!("Created ZFS snapshot {}@{} on {}", dataset, name, node.name);
        Ok(())
    }

    /// Delete a ZFS snapshot
    pub async fn delete_snapshot(&self, node: &NodeRecord, dataset: &str, name: &str) -> Result<()> {
        crate::validation::validate_dataset(dataset)?;
        crate::validation::validate_snapshot_name(name)?;

        let cmd = format!("zfs destroy '{}@{}'", dataset, name);
        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to delete snapshot {}@{}: {}",
                dataset,
                name,
                output.stderr.trim()
            )));
        }

        info!("Deleted ZFS snapshot {}@{} on {}", dataset, name, node.name);
        Ok(())
    }

    /// Roll a dataset back to a snapshot. Destroys more recent snapshots.
    pub async fn rollback_snapshot(&self, node: &NodeRecord, dataset: &str, name: &str) -> Result<()> {
        crate::validation::validate_dataset(dataset)?;
        crate::validation::validate_snapshot_name(name)?;

        let cmd = format!("zfs rollback -r '{}@{}'", dataset, name);
        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to roll back {} to {}: {}",
                dataset,
                name,
                output.stderr.trim()
            )));
        }

        info!("Rolled back {} to snapshot {} on {}", dataset, name, node.name);
        Ok(())
    }

    /// Clone a snapshot into a new dataset
    pub async fn clone_snapshot(
        &self,
        node: &NodeRecord,
        dataset: &str,
        name: &str,
        clone_target: &str,
    ) -> Result<()> {
        crate::validation::validate_dataset(dataset)?;
        crate::validation::validate_snapshot_name(name)?;
        crate::validation::validate_dataset(clone_target)?;

        let cmd = format!("zfs clone '{}@{}' '{}'", dataset, name, clone_target);
        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to clone {}@{} to {}: {}",
                dataset,
                name,
                clone_target,
                output.stderr.trim()
            )));
        }

        info!("Cloned {}@{} to {} on {}", dataset, name, clone_target, node.name);
        Ok(())
    }

    /// Aggregated per-guest snapshot view: the guest's own snapshots plus
    /// every ZFS snapshot on datasets carrying the guest's disks,
    /// classified by naming convention.
    pub async fn vm_snapshot_overview(
        &self,
        node: &NodeRecord,
        vm_id: u32,
        guest_type: GuestType,
    ) -> Result<Vec<AggregatedSnapshot>> {
        crate::validation::validate_vmid(vm_id)?;
        let mut aggregated = Vec::new();

        // Guest snapshots via listsnapshot
        let cmd = format!("{} listsnapshot {} 2>/dev/null", guest_type.tool(), vm_id);
        if let Ok(output) = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await
        {
            if output.success {
                for name in crate::migration::parse_listsnapshot(&output.stdout) {
                    aggregated.push(AggregatedSnapshot {
                        source: SnapshotSource::Guest,
                        dataset: None,
                        name,
                        creation: None,
                    });
                }
            }
        }

        // ZFS snapshots on the guest's datasets; a missing ZFS stack just
        // yields an empty list.
        if let Ok(snapshots) = self.inventory.list_snapshots(node, None).await {
            let marker = format!("-{}-", vm_id);
            for snapshot in snapshots {
                if !snapshot.dataset.contains(&marker) {
                    continue;
                }
                aggregated.push(classify_zfs_snapshot(&snapshot));
            }
        }

        Ok(aggregated)
    }
}

fn classify_zfs_snapshot(snapshot: &SnapshotInfo) -> AggregatedSnapshot {
    let source = if snapshot.name.starts_with("autosnap_") {
        SnapshotSource::Sanoid
    } else if snapshot.name.starts_with("syncoid_") {
        SnapshotSource::Syncoid
    } else {
        SnapshotSource::Manual
    };

    AggregatedSnapshot {
        source,
        dataset: Some(snapshot.dataset.clone()),
        name: snapshot.name.clone(),
        creation: Some(snapshot.creation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(dataset: &str, name: &str) -> SnapshotInfo {
        SnapshotInfo {
            dataset: dataset.to_string(),
            name: name.to_string(),
            full_name: format!("{}@{}", dataset, name),
            used_bytes: 0,
            creation: 1735689600,
        }
    }

    #[test]
    fn test_classify_zfs_snapshot() {
        let classified = classify_zfs_snapshot(&snapshot(
            "rpool/data/vm-100-disk-0",
            "autosnap_2025-01-01_00:00:02_daily",
        ));
        assert_eq!(classified.source, SnapshotSource::Sanoid);

        let classified = classify_zfs_snapshot(&snapshot(
            "rpool/data/vm-100-disk-0",
            "syncoid_pve1_2025-01-01",
        ));
        assert_eq!(classified.source, SnapshotSource::Syncoid);

        let classified =
            classify_zfs_snapshot(&snapshot("rpool/data/vm-100-disk-0", "before-upgrade"));
        assert_eq!(classified.source, SnapshotSource::Manual);
        assert_eq!(classified.creation, Some(1735689600));
    }
}
