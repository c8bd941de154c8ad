//! PBS observation helpers
//!
//! Read-only views of a Proxmox Backup Server: datastores via
//! `proxmox-backup-manager`, backup snapshots via `proxmox-backup-client`
//! (runnable from the PBS node itself or from any PVE node with the client
//! installed).

use crate::db::nodes::NodeRecord;
use crate::ssh::{SshExecutor, INVENTORY_TIMEOUT};
use proxrepl_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreInfo {
    pub name: String,
    pub path: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsBackupInfo {
    /// `vm/<id>` style group identifier
    pub backup_id: String,
    pub backup_time: i64,
    pub size_bytes: Option<u64>,
}

/// Read-only PBS observation operations
pub struct PbsObserver {
    executor: Arc<SshExecutor>,
}

impl PbsObserver {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Datastores configured on a PBS server
    pub async fn list_datastores(&self, pbs: &NodeRecord) -> Result<Vec<DatastoreInfo>> {
        let output = self
            .executor
            .execute(
                &pbs.ssh_target(),
                "proxmox-backup-manager datastore list --output-format json 2>/dev/null",
                INVENTORY_TIMEOUT,
            )
            .await?;

        if !output.success || output.stdout.trim().is_empty() {
            return Err(Error::RemoteTool(format!(
                "Datastore listing failed on {}: {}",
                pbs.name,
                output.stderr.trim()
            )));
        }

        parse_datastore_list(&output.stdout).ok_or_else(|| {
            Error::RemoteTool(format!("Unparseable datastore list from {}", pbs.name))
        })
    }

    /// Backups in a datastore, optionally filtered to one guest. When
    /// `from_node` is given the client runs there (with the PBS
    /// credentials); otherwise directly on the PBS host.
    pub async fn list_backups(
        &self,
        pbs: &NodeRecord,
        datastore: &str,
        vm_id: Option<u32>,
        from_node: Option<&NodeRecord>,
    ) -> Result<Vec<PbsBackupInfo>> {
        crate::validation::validate_storage_name(datastore)?;

        let username = pbs.pbs_username.as_deref().unwrap_or("root@pam");
        let repository = format!("{}@{}:{}", username, pbs.hostname, datastore);

        let mut command = String::new();
        if let Some(password) = pbs.pbs_password.as_deref() {
            command.push_str(&format!("PBS_PASSWORD='{}' ", password));
        }
        command.push_str(&format!(
            "proxmox-backup-client snapshot list --repository {}",
            repository
        ));
        if let Some(fingerprint) = pbs.pbs_fingerprint.as_deref() {
            command.push_str(&format!(" --fingerprint {}", fingerprint));
        }
        command.push_str(" --output-format json 2>/dev/null");

        let target = from_node.unwrap_or(pbs).ssh_target();
        let output = self.executor.execute(&target, &command, INVENTORY_TIMEOUT).await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Backup listing for {} failed: {}",
                datastore,
                output.stderr.trim()
            )));
        }

        let mut backups = parse_backup_list(&output.stdout).unwrap_or_else(|| {
            warn!("Unparseable backup list for datastore {}", datastore);
            Vec::new()
        });

        if let Some(vm_id) = vm_id {
            let prefix = format!("vm/{}", vm_id);
            backups.retain(|b| b.backup_id == prefix || b.backup_id.starts_with(&format!("{}/", prefix)));
        }

        Ok(backups)
    }

    /// The most recent backup of a guest, by backup time
    pub async fn latest_backup(
        &self,
        pbs: &NodeRecord,
        datastore: &str,
        vm_id: u32,
        from_node: Option<&NodeRecord>,
    ) -> Result<Option<PbsBackupInfo>> {
        let mut backups = self.list_backups(pbs, datastore, Some(vm_id), from_node).await?;
        backups.sort_by_key(|b| std::cmp::Reverse(b.backup_time));
        Ok(backups.into_iter().next())
    }
}

pub fn parse_datastore_list(stdout: &str) -> Option<Vec<DatastoreInfo>> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let list = value.as_array()?;

    Some(
        list.iter()
            .filter_map(|entry| {
                Some(DatastoreInfo {
                    name: entry.get("name")?.as_str()?.to_string(),
                    path: entry.get("path").and_then(|p| p.as_str()).map(|p| p.to_string()),
                    comment: entry
                        .get("comment")
                        .and_then(|c| c.as_str())
                        .map(|c| c.to_string()),
                })
            })
            .collect(),
    )
}

pub fn parse_backup_list(stdout: &str) -> Option<Vec<PbsBackupInfo>> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let list = value.as_array()?;

    Some(
        list.iter()
            .filter_map(|entry| {
                let id = entry.get("backup-id")?.as_str()?;
                // Newer clients split the group into backup-type + backup-id
                let backup_id = match entry.get("backup-type").and_then(|t| t.as_str()) {
                    Some(ty) if !id.contains('/') => format!("{}/{}", ty, id),
                    _ => id.to_string(),
                };

                Some(PbsBackupInfo {
                    backup_id,
                    backup_time: entry.get("backup-time").and_then(|t| t.as_i64()).unwrap_or(0),
                    size_bytes: entry.get("size").and_then(|s| s.as_u64()),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datastore_list() {
        let stdout = r#"[
            {"name": "ds0", "path": "/mnt/datastore/ds0", "comment": "primary"},
            {"name": "archive", "path": "/mnt/datastore/archive"}
        ]"#;

        let datastores = parse_datastore_list(stdout).unwrap();
        assert_eq!(datastores.len(), 2);
        assert_eq!(datastores[0].name, "ds0");
        assert_eq!(datastores[0].comment.as_deref(), Some("primary"));
        assert!(datastores[1].comment.is_none());

        assert!(parse_datastore_list("not json").is_none());
    }

    #[test]
    fn test_parse_backup_list_and_filter() {
        let stdout = r#"[
            {"backup-id": "vm/110", "backup-time": 1735689600, "size": 1073741824},
            {"backup-id": "vm/110", "backup-time": 1735776000, "size": 1073741824},
            {"backup-id": "vm/200", "backup-time": 1735689600}
        ]"#;

        let mut backups = parse_backup_list(stdout).unwrap();
        assert_eq!(backups.len(), 3);

        let prefix = "vm/110";
        backups.retain(|b| b.backup_id == prefix);
        assert_eq!(backups.len(), 2);

        backups.sort_by_key(|b| std::cmp::Reverse(b.backup_time));
        assert_eq!(backups[0].backup_time, 1735776000);
    }
}
