//! Host-config backup pipeline
//!
//! Archives the control-plane configuration files of a PVE or PBS node
//! into a timestamped tarball on the node itself, with optional gzip
//! compression and symmetric encryption, then applies keep-N retention.

use crate::db::host_backup_jobs::{self, HostBackupJob};
use crate::db::job_logs::{self, LogCompletion, NewJobLog};
use crate::db::nodes::{self, NodeRecord};
use crate::notify::{JobNotification, NotificationTrigger};
use crate::retention::Pruner;
use crate::ssh::{SshExecutor, SshTarget, INVENTORY_TIMEOUT, SNAPSHOT_TIMEOUT};
use proxrepl_common::{Error, NodeKind, Result, RunStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// Configuration paths archived on a PVE node
pub const PVE_BACKUP_PATHS: &[&str] = &[
    "/etc/pve",
    "/etc/network/interfaces",
    "/etc/network/interfaces.d",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/resolv.conf",
    "/etc/apt/sources.list",
    "/etc/apt/sources.list.d",
    "/etc/modprobe.d",
    "/etc/modules",
    "/etc/sysctl.conf",
    "/etc/sysctl.d",
    "/root/.ssh",
    "/var/spool/cron/crontabs/root",
    "/etc/cron.d",
    "/etc/lvm/lvm.conf",
    "/etc/vzdump.conf",
    "/etc/pve/corosync.conf",
    "/etc/pve/priv",
    "/etc/pve/firewall",
    "/var/lib/pve-cluster",
];

/// Configuration paths archived on a PBS node
pub const PBS_BACKUP_PATHS: &[&str] = &[
    "/etc/proxmox-backup",
    "/etc/network/interfaces",
    "/etc/network/interfaces.d",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/resolv.conf",
    "/etc/apt/sources.list",
    "/etc/apt/sources.list.d",
    "/root/.ssh",
    "/var/spool/cron/crontabs/root",
    "/etc/cron.d",
];

/// Result of one archive creation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostBackupReport {
    pub backup_file: String,
    pub backup_name: String,
    pub size_bytes: i64,
    pub paths_backed_up: usize,
    pub compressed: bool,
    pub encrypted: bool,
}

/// A path entry listed for the operator before running a backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPathInfo {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
}

pub struct HostBackupPipeline {
    executor: Arc<SshExecutor>,
    pruner: Arc<Pruner>,
    notifier: Arc<NotificationTrigger>,
}

impl HostBackupPipeline {
    pub fn new(
        executor: Arc<SshExecutor>,
        pruner: Arc<Pruner>,
        notifier: Arc<NotificationTrigger>,
    ) -> Self {
        Self {
            executor,
            pruner,
            notifier,
        }
    }

    /// Classify the host by its config directory
    pub async fn detect_host_type(&self, target: &SshTarget) -> Result<NodeKind> {
        let cmd = "if [ -d /etc/pve ]; then echo pve; elif [ -d /etc/proxmox-backup ]; then echo pbs; else echo unknown; fi";
        let output = self.executor.execute(target, cmd, INVENTORY_TIMEOUT).await?;

        match output.stdout.trim() {
            "pve" => Ok(NodeKind::Pve),
            "pbs" => Ok(NodeKind::Pbs),
            other => Err(Error::RemoteTool(format!(
                "Host type not recognised ({})",
                other
            ))),
        }
    }

    /// Per-path existence and size, for the operator-facing preview
    pub async fn list_backup_paths(
        &self,
        target: &SshTarget,
        host_type: NodeKind,
    ) -> Result<Vec<BackupPathInfo>> {
        let paths = backup_paths(host_type);

        // One remote loop, one round-trip
        let script = paths
            .iter()
            .map(|p| {
                format!(
                    "if [ -e '{p}' ]; then echo \"{p}|$(du -sb '{p}' 2>/dev/null | cut -f1)\"; else echo \"{p}|MISSING\"; fi",
                    p = p
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let output = self.executor.execute(target, &script, INVENTORY_TIMEOUT).await?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let (path, size) = line.split_once('|')?;
                if size.trim() == "MISSING" {
                    Some(BackupPathInfo {
                        path: path.to_string(),
                        exists: false,
                        size_bytes: 0,
                    })
                } else {
                    Some(BackupPathInfo {
                        path: path.to_string(),
                        exists: true,
                        size_bytes: size.trim().parse().unwrap_or(0),
                    })
                }
            })
            .collect())
    }

    /// Execute one run of a host backup job
    pub async fn run(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        triggered_by: Option<&str>,
        is_scheduled: bool,
    ) -> Result<HostBackupReport> {
        let job = host_backup_jobs::get_host_backup_job(pool, job_id).await?;
        let node = nodes::get_node(pool, job.node_id).await?;
        let target = node.ssh_target();

        host_backup_jobs::try_mark_running(pool, job_id).await?;

        let host_type = self.detect_host_type(&target).await.unwrap_or(node.node_type);

        let run_id = uuid::Uuid::new_v4().to_string();
        let log_id = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id,
                job_type: "host_backup".to_string(),
                job_id,
                phase: "main".to_string(),
                node_name: Some(node.name.clone()),
                dataset: Some(format!("config-{}", host_type)),
                message: Some(format!(
                    "Host configuration backup ({}) started",
                    host_type.as_str().to_uppercase()
                )),
                triggered_by: triggered_by.map(|t| t.to_string()),
            },
        )
        .await?;

        let started = std::time::Instant::now();
        let result = self.create_backup(&target, host_type, &job).await;
        let duration = started.elapsed().as_secs() as i64;

        match result {
            Ok(report) => {
                // Retention failures never fail the run
                if let Err(e) = self
                    .pruner
                    .prune_host_archives(&target, &job.dest_path, host_type, job.keep_last.max(0) as usize)
                    .await
                {
                    warn!("Host backup retention on {} failed: {}", node.name, e);
                }

                host_backup_jobs::finish_run(
                    pool,
                    job_id,
                    true,
                    duration,
                    Some(&report.backup_file),
                    Some(report.size_bytes),
                    None,
                )
                .await?;

                job_logs::complete_log(
                    pool,
                    log_id,
                    RunStatus::Success,
                    &LogCompletion {
                        message: Some(format!(
                            "Backup {} completed: {} ({})",
                            host_type.as_str().to_uppercase(),
                            report.backup_name,
                            crate::migration::human_size(report.size_bytes.max(0) as u64)
                        )),
                        ..Default::default()
                    },
                )
                .await?;

                self.notify(&job, &node, "success", duration, None, Some(&report), is_scheduled);
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                host_backup_jobs::finish_run(pool, job_id, false, duration, None, None, Some(&message))
                    .await?;

                job_logs::complete_log(
                    pool,
                    log_id,
                    RunStatus::Failed,
                    &LogCompletion {
                        message: Some(format!(
                            "Backup {} failed",
                            host_type.as_str().to_uppercase()
                        )),
                        error: Some(message.clone()),
                        ..Default::default()
                    },
                )
                .await?;

                self.notify(&job, &node, "failed", duration, Some(message), None, is_scheduled);
                Err(e)
            }
        }
    }

    /// Create the archive on the node
    pub async fn create_backup(
        &self,
        target: &SshTarget,
        host_type: NodeKind,
        job: &HostBackupJob,
    ) -> Result<HostBackupReport> {
        let paths = backup_paths(host_type);

        let mkdir = format!("mkdir -p {}", job.dest_path);
        self.executor.execute(target, &mkdir, INVENTORY_TIMEOUT).await?;

        // Only archive paths that exist on this node
        let check_script = paths
            .iter()
            .map(|p| format!("test -e '{p}' && echo '{p}'", p = p))
            .collect::<Vec<_>>()
            .join("\n");
        let check = self.executor.execute(target, &check_script, INVENTORY_TIMEOUT).await?;

        let existing: Vec<String> = check
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if existing.is_empty() {
            return Err(Error::RemoteTool(
                "No configuration files found to back up".to_string(),
            ));
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let backup_name = format!("proxmox-{}-config-{}", host_type.as_str(), timestamp);
        let (backup_file, command) = build_archive_command(
            &job.dest_path,
            &backup_name,
            &existing,
            job.compress,
            if job.encrypt {
                job.encrypt_password.as_deref()
            } else {
                None
            },
        );

        info!("Creating host-config archive {}", backup_file);
        let result = self.executor.execute(target, &command, SNAPSHOT_TIMEOUT).await?;

        if !result.success {
            return Err(Error::RemoteTool(format!(
                "Archive creation failed: {}",
                if result.stderr.trim().is_empty() {
                    result.stdout.trim()
                } else {
                    result.stderr.trim()
                }
            )));
        }

        let size_cmd = format!("stat -c %s '{}' 2>/dev/null || echo 0", backup_file);
        let size = self
            .executor
            .execute(target, &size_cmd, INVENTORY_TIMEOUT)
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse::<i64>().ok())
            .unwrap_or(0);

        Ok(HostBackupReport {
            backup_file,
            backup_name,
            size_bytes: size,
            paths_backed_up: existing.len(),
            compressed: job.compress,
            encrypted: job.encrypt && job.encrypt_password.is_some(),
        })
    }

    /// Existing archives in the destination directory, newest first
    pub async fn list_backups(&self, target: &SshTarget, backup_path: &str) -> Result<Vec<(String, u64)>> {
        crate::validation::validate_subvolume_path(backup_path)?;

        let cmd = format!(
            "ls -t {}/proxmox-*-config-*.tar* 2>/dev/null | while read f; do echo \"$f|$(stat -c %s \"$f\")\"; done",
            backup_path
        );
        let output = self.executor.execute(target, &cmd, INVENTORY_TIMEOUT).await?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let (path, size) = line.split_once('|')?;
                Some((path.to_string(), size.trim().parse().unwrap_or(0)))
            })
            .collect())
    }

    /// Delete one archive; the path must stay inside the backup directory
    pub async fn delete_backup(&self, target: &SshTarget, backup_path: &str, archive: &str) -> Result<()> {
        if !archive.starts_with(backup_path) || archive.contains("..") {
            return Err(Error::Validation(format!("Invalid archive path: {}", archive)));
        }

        let output = self
            .executor
            .execute(target, &format!("rm -f '{}'", archive), INVENTORY_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to delete {}: {}",
                archive,
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        job: &HostBackupJob,
        node: &NodeRecord,
        status: &str,
        duration: i64,
        error: Option<String>,
        report: Option<&HostBackupReport>,
        is_scheduled: bool,
    ) {
        self.notifier.send_job_notification(&JobNotification {
            job_name: job.name.clone(),
            job_type: "host_backup".to_string(),
            job_id: job.id,
            status: status.to_string(),
            source: node.name.clone(),
            destination: job.dest_path.clone(),
            duration_seconds: duration,
            error,
            transferred: None,
            details: report.map(|r| {
                format!(
                    "File: {}, Size: {}",
                    r.backup_name,
                    crate::migration::human_size(r.size_bytes.max(0) as u64)
                )
            }),
            is_scheduled,
            notify_mode: job.notify_mode,
        });
    }
}

pub fn backup_paths(host_type: NodeKind) -> &'static [&'static str] {
    match host_type {
        NodeKind::Pve => PVE_BACKUP_PATHS,
        NodeKind::Pbs => PBS_BACKUP_PATHS,
    }
}

/// Compose the archive filename and the tar pipeline.
/// `proxmox-<pve|pbs>-config-<ts>.tar[.gz[.enc]]`
pub fn build_archive_command(
    dest_path: &str,
    backup_name: &str,
    paths: &[String],
    compress: bool,
    encrypt_password: Option<&str>,
) -> (String, String) {
    let quoted: Vec<String> = paths.iter().map(|p| format!("'{}'", p)).collect();
    let paths_str = quoted.join(" ");

    match (compress, encrypt_password) {
        (true, Some(password)) => {
            let file = format!("{}/{}.tar.gz.enc", dest_path, backup_name);
            let cmd = format!(
                "tar czf - {} 2>/dev/null | openssl enc -aes-256-cbc -salt -pbkdf2 -pass pass:'{}' -out '{}'",
                paths_str, password, file
            );
            (file, cmd)
        }
        (true, None) => {
            let file = format!("{}/{}.tar.gz", dest_path, backup_name);
            let cmd = format!("tar czf '{}' {} 2>/dev/null", file, paths_str);
            (file, cmd)
        }
        (false, Some(password)) => {
            let file = format!("{}/{}.tar.enc", dest_path, backup_name);
            let cmd = format!(
                "tar cf - {} 2>/dev/null | openssl enc -aes-256-cbc -salt -pbkdf2 -pass pass:'{}' -out '{}'",
                paths_str, password, file
            );
            (file, cmd)
        }
        (false, None) => {
            let file = format!("{}/{}.tar", dest_path, backup_name);
            let cmd = format!("tar cf '{}' {} 2>/dev/null", file, paths_str);
            (file, cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<String> {
        vec!["/etc/pve".to_string(), "/etc/hosts".to_string()]
    }

    #[test]
    fn test_backup_paths_per_host_type() {
        assert!(backup_paths(NodeKind::Pve).contains(&"/etc/pve"));
        assert!(backup_paths(NodeKind::Pve).contains(&"/var/lib/pve-cluster"));
        assert!(backup_paths(NodeKind::Pbs).contains(&"/etc/proxmox-backup"));
        assert!(!backup_paths(NodeKind::Pbs).contains(&"/etc/pve"));
    }

    #[test]
    fn test_archive_command_plain() {
        let (file, cmd) =
            build_archive_command("/var/backups/proxmox-config", "proxmox-pve-config-20250101_000000", &paths(), false, None);
        assert_eq!(file, "/var/backups/proxmox-config/proxmox-pve-config-20250101_000000.tar");
        assert_eq!(
            cmd,
            "tar cf '/var/backups/proxmox-config/proxmox-pve-config-20250101_000000.tar' '/etc/pve' '/etc/hosts' 2>/dev/null"
        );
    }

    #[test]
    fn test_archive_command_compressed() {
        let (file, cmd) =
            build_archive_command("/var/backups", "proxmox-pve-config-x", &paths(), true, None);
        assert!(file.ends_with(".tar.gz"));
        assert!(cmd.starts_with("tar czf"));
        assert!(!cmd.contains("openssl"));
    }

    #[test]
    fn test_archive_command_compressed_encrypted() {
        let (file, cmd) =
            build_archive_command("/var/backups", "proxmox-pbs-config-x", &paths(), true, Some("s3cret"));
        assert!(file.ends_with(".tar.gz.enc"));
        assert!(cmd.contains("tar czf -"));
        assert!(cmd.contains("openssl enc -aes-256-cbc -salt -pbkdf2"));
        assert!(cmd.contains("pass:'s3cret'"));
    }

    #[test]
    fn test_archive_command_encrypted_only() {
        let (file, cmd) =
            build_archive_command("/var/backups", "proxmox-pve-config-x", &paths(), false, Some("pw"));
        assert!(file.ends_with(".tar.enc"));
        assert!(cmd.contains("tar cf -"));
        assert!(cmd.contains("openssl"));
    }
}
