//! Sync pipeline
//!
//! Drives one replication run: single-flight guard, the method-specific
//! transfer (syncoid or btrfs send/receive), destination-side retention,
//! the optional guest registration side-effect, run statistics and the
//! notification trigger.

pub mod btrfs;
pub mod zfs;

use crate::db::nodes::{self, NodeRecord};
use crate::db::job_logs::{self, LogCompletion, NewJobLog};
use crate::db::sync_jobs::{self, SyncJob};
use crate::db::{settings, vm_registry};
use crate::notify::{JobNotification, NotificationTrigger};
use crate::retention::Pruner;
use crate::ssh::{SshExecutor, INVENTORY_TIMEOUT};
use proxrepl_common::{Error, GuestType, Result, RunStatus, SyncMethod};
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot prefix syncoid stamps on both ends of a replication
pub const SYNCOID_SNAPSHOT_PREFIX: &str = "syncoid_";

static TRANSFERRED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(\d+(?:\.\d+)?\s*[KMGT]i?B?)\s+(?:sent|transferred)").unwrap(),
        Regex::new(r"(?i)total size:\s*(\d+(?:\.\d+)?\s*[KMGT]i?B?)").unwrap(),
        Regex::new(r"(?i)(\d+(?:\.\d+)?\s*[KMGT]i?B?)\s+total").unwrap(),
    ]
});

/// Result of one transfer attempt
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i64>,
    pub transferred: Option<String>,
    pub sync_type: Option<String>,
    pub snapshot_name: Option<String>,
}

impl SyncOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Extract a `transferred <N><unit>` style figure from merged output.
/// Absence is tolerated and recorded as null.
pub fn parse_transferred(output: &str) -> Option<String> {
    TRANSFERRED_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(output))
        .map(|caps| caps.get(1).unwrap().as_str().trim().to_string())
}

/// Last lines of a stream, for the user-visible diagnostics on a log row
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub struct SyncPipeline {
    executor: Arc<SshExecutor>,
    pruner: Arc<Pruner>,
    notifier: Arc<NotificationTrigger>,
}

impl SyncPipeline {
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

    /// Execute one run of a sync job. Returns `Error::Conflict` when a run
    /// is already in flight.
    pub async fn run(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        triggered_by: Option<&str>,
        is_scheduled: bool,
    ) -> Result<SyncOutcome> {
        let job = sync_jobs::get_sync_job(pool, job_id).await?;
        let source_node = nodes::get_node(pool, job.source_node_id).await?;
        let dest_node = nodes::get_node(pool, job.dest_node_id).await?;

        sync_jobs::try_mark_running(pool, job_id).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let log_id = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id,
                job_type: "sync".to_string(),
                job_id,
                phase: "main".to_string(),
                node_name: Some(format!("{} -> {}", source_node.name, dest_node.name)),
                dataset: Some(format!("{} -> {}", job.source_dataset, job.dest_dataset)),
                message: Some("Replication started".to_string()),
                triggered_by: triggered_by.map(|t| t.to_string()),
            },
        )
        .await?;

        let started = std::time::Instant::now();
        let mut outcome = self.transfer(pool, &job, &source_node, &dest_node).await;

        if outcome.success {
            self.apply_retention(&job, &source_node, &dest_node).await;

            if job.register_vm && job.method == SyncMethod::ZfsSyncoid {
                if let Err(e) = self
                    .register_guest(pool, &job, &source_node, &dest_node)
                    .await
                {
                    warn!("Guest registration after sync of job {} failed: {}", job.name, e);
                    outcome.output.push_str(&format!("\nguest registration failed: {}", e));
                }
            }
        }

        let duration = started.elapsed().as_secs() as i64;

        sync_jobs::finish_run(
            pool,
            job_id,
            outcome.success,
            duration,
            outcome.transferred.as_deref(),
            outcome.sync_type.as_deref(),
        )
        .await?;

        let status = if outcome.success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        job_logs::complete_log(
            pool,
            log_id,
            status,
            &LogCompletion {
                message: Some(
                    if outcome.success {
                        "Replication completed".to_string()
                    } else {
                        "Replication failed".to_string()
                    },
                ),
                output: Some(tail(&outcome.output, 200)),
                error: outcome.error.clone(),
                command: outcome.command.clone(),
                exit_code: outcome.exit_code,
                bytes_transferred: outcome.transferred.clone(),
                ..Default::default()
            },
        )
        .await?;

        self.notifier.send_job_notification(&JobNotification {
            job_name: job.name.clone(),
            job_type: "sync".to_string(),
            job_id,
            status: status.as_str().to_string(),
            source: format!("{}:{}", source_node.name, job.source_dataset),
            destination: format!("{}:{}", dest_node.name, job.dest_dataset),
            duration_seconds: duration,
            error: outcome.error.clone(),
            transferred: outcome.transferred.clone(),
            details: outcome
                .transferred
                .as_ref()
                .map(|t| format!("Transferred: {}", t)),
            is_scheduled,
            notify_mode: job.notify_mode,
        });

        Ok(outcome)
    }

    async fn transfer(
        &self,
        pool: &SqlitePool,
        job: &SyncJob,
        source_node: &NodeRecord,
        dest_node: &NodeRecord,
    ) -> SyncOutcome {
        match job.method {
            SyncMethod::ZfsSyncoid => {
                let timeout = settings::get_int(pool, "syncoid_timeout", 3600).await;
                zfs::run_sync(
                    &self.executor,
                    job,
                    source_node,
                    dest_node,
                    Duration::from_secs(timeout.max(60) as u64),
                )
                .await
            }
            SyncMethod::BtrfsSend => {
                let timeout = settings::get_int(pool, "btrfs_sync_timeout", 3600).await;
                let default_dir =
                    settings::get_string(pool, "btrfs_default_snapshot_dir", "/mnt/btrfs-storage/.snapshots")
                        .await;
                let max_snapshots = if job.retention_keep > 0 {
                    job.retention_keep as usize
                } else {
                    settings::get_int(pool, "btrfs_max_snapshots", 5).await.max(1) as usize
                };

                btrfs::run_sync(
                    &self.executor,
                    &self.pruner,
                    job,
                    source_node,
                    dest_node,
                    &default_dir,
                    max_snapshots,
                    Duration::from_secs(timeout.max(60) as u64),
                )
                .await
            }
        }
    }

    /// Keep-N-newest on both ends for the syncoid snapshot prefix.
    /// Failures are logged, never fatal.
    async fn apply_retention(&self, job: &SyncJob, source_node: &NodeRecord, dest_node: &NodeRecord) {
        if job.method != SyncMethod::ZfsSyncoid || job.retention_keep <= 0 {
            return;
        }
        let keep = job.retention_keep as usize;

        if let Err(e) = self
            .pruner
            .prune_zfs_snapshots(
                &dest_node.ssh_target(),
                &job.dest_dataset,
                SYNCOID_SNAPSHOT_PREFIX,
                keep,
            )
            .await
        {
            warn!("Destination retention for job {} failed: {}", job.name, e);
        }

        if job.prune_source {
            if let Err(e) = self
                .pruner
                .prune_zfs_snapshots(
                    &source_node.ssh_target(),
                    &job.source_dataset,
                    SYNCOID_SNAPSHOT_PREFIX,
                    keep,
                )
                .await
            {
                warn!("Source retention for job {} failed: {}", job.name, e);
            }
        }
    }

    /// Read the guest config from the source, rewrite its storage-volume
    /// lines and install it on the destination. Disk-group jobs write the
    /// config only once per group.
    async fn register_guest(
        &self,
        pool: &SqlitePool,
        job: &SyncJob,
        source_node: &NodeRecord,
        dest_node: &NodeRecord,
    ) -> Result<()> {
        let vm_id = job
            .vm_id
            .ok_or_else(|| Error::Validation("register_vm requires vm_id".to_string()))?;
        let guest_type = job.vm_type.unwrap_or(GuestType::Qemu);

        if let Some(group_id) = job.vm_group_id.as_deref() {
            if vm_registry::group_registered(pool, group_id, dest_node.id).await? {
                info!(
                    "Guest {} already registered on {} by group {}",
                    vm_id, dest_node.name, group_id
                );
                return Ok(());
            }
        }

        let config_path = NodeRecord::guest_config_path(vm_id, guest_type);
        let read = self
            .executor
            .execute(
                &source_node.ssh_target(),
                &format!("cat '{}' 2>/dev/null", config_path),
                INVENTORY_TIMEOUT,
            )
            .await?;

        if !read.success || read.stdout.trim().is_empty() {
            return Err(Error::RemoteTool(format!(
                "Guest {} config not readable on {}",
                vm_id, source_node.name
            )));
        }

        let rewritten = rewrite_guest_config(
            &read.stdout,
            job.source_storage.as_deref(),
            job.dest_storage.as_deref(),
            vm_id,
            job.dest_vm_id,
        );

        let dest_vm_id = job.dest_vm_id.unwrap_or(vm_id);
        let dest_path = NodeRecord::guest_config_path(dest_vm_id, guest_type);
        let write_cmd = format!(
            "cat > '{}' << 'PROXREPL_EOF'\n{}\nPROXREPL_EOF",
            dest_path, rewritten
        );

        let write = self
            .executor
            .execute(&dest_node.ssh_target(), &write_cmd, INVENTORY_TIMEOUT)
            .await?;

        if !write.success {
            return Err(Error::RemoteTool(format!(
                "Failed to write guest config on {}: {}",
                dest_node.name,
                write.stderr.trim()
            )));
        }

        vm_registry::record_registration(
            pool,
            dest_vm_id,
            guest_type,
            source_node.id,
            dest_node.id,
            Some(&job.source_dataset),
            Some(&job.dest_dataset),
            job.vm_group_id.as_deref(),
        )
        .await?;

        info!("Guest {} registered on {}", dest_vm_id, dest_node.name);
        Ok(())
    }
}

static CONFIG_DISK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^((?:scsi|sata|virtio|ide)\d+|rootfs|mp\d+):\s*(.+)$").unwrap()
});

/// Rewrite the storage-volume lines of a guest config for the destination:
/// replace the storage prefix, and rename volume identifiers when the
/// destination VMID differs. All other lines pass through untouched.
pub fn rewrite_guest_config(
    config: &str,
    source_storage: Option<&str>,
    dest_storage: Option<&str>,
    vm_id: u32,
    dest_vm_id: Option<u32>,
) -> String {
    config
        .lines()
        .map(|line| {
            let Some(caps) = CONFIG_DISK_LINE.captures(line) else {
                return line.to_string();
            };

            let key = caps.get(1).unwrap().as_str();
            let mut spec = caps.get(2).unwrap().as_str().to_string();

            if let (Some(from), Some(to)) = (source_storage, dest_storage) {
                let prefix = format!("{}:", from);
                if spec.starts_with(&prefix) {
                    spec = format!("{}:{}", to, &spec[prefix.len()..]);
                }
            }

            if let Some(new_id) = dest_vm_id {
                if new_id != vm_id {
                    spec = spec
                        .replace(&format!("vm-{}-", vm_id), &format!("vm-{}-", new_id))
                        .replace(&format!("subvol-{}-", vm_id), &format!("subvol-{}-", new_id));
                }
            }

            format!("{}: {}", key, spec)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transferred_variants() {
        assert_eq!(
            parse_transferred("INFO: 1.24GiB sent in 35 seconds"),
            Some("1.24GiB".to_string())
        );
        assert_eq!(
            parse_transferred("rsync done\ntotal size: 523MiB speedup 1.0"),
            Some("523MiB".to_string())
        );
        assert_eq!(
            parse_transferred("8.00G total estimated size"),
            Some("8.00G".to_string())
        );
        assert_eq!(parse_transferred("no figures here"), None);
        assert_eq!(parse_transferred(""), None);
    }

    #[test]
    fn test_parse_transferred_round_trips_through_log() {
        // The value stored on the log row is exactly what the parser saw
        let output = "syncoid: transferred data\n2.5 GiB transferred in 12s\n";
        let parsed = parse_transferred(output).unwrap();
        assert_eq!(parsed, "2.5 GiB");
        assert_eq!(parse_transferred(&format!("x {} transferred", parsed)).unwrap(), parsed);
    }

    #[test]
    fn test_tail() {
        let text = (1..=10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail(&text, 3), "8\n9\n10");
        assert_eq!(tail(&text, 100), text);
        assert_eq!(tail("", 5), "");
    }

    #[test]
    fn test_rewrite_guest_config_storage() {
        let config = "boot: order=scsi0\n\
                      cores: 4\n\
                      scsi0: local-zfs:vm-100-disk-0,iothread=1,size=32G\n\
                      scsi1: other-store:vm-100-disk-1,size=8G\n\
                      net0: virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0\n";

        let rewritten =
            rewrite_guest_config(config, Some("local-zfs"), Some("tank-zfs"), 100, None);

        assert!(rewritten.contains("scsi0: tank-zfs:vm-100-disk-0,iothread=1,size=32G"));
        // Only the configured source storage is rewritten
        assert!(rewritten.contains("scsi1: other-store:vm-100-disk-1,size=8G"));
        assert!(rewritten.contains("cores: 4"));
        assert!(rewritten.contains("net0: virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"));
    }

    #[test]
    fn test_rewrite_guest_config_vmid_change() {
        let config = "scsi0: local-zfs:vm-100-disk-0,size=32G\n\
                      rootfs: local-zfs:subvol-100-disk-0,size=8G\n";

        let rewritten = rewrite_guest_config(config, None, None, 100, Some(200));
        assert!(rewritten.contains("scsi0: local-zfs:vm-200-disk-0,size=32G"));
        assert!(rewritten.contains("rootfs: local-zfs:subvol-200-disk-0,size=8G"));
    }

    #[test]
    fn test_rewrite_guest_config_same_vmid_untouched() {
        let config = "scsi0: local-zfs:vm-100-disk-0,size=32G";
        let rewritten = rewrite_guest_config(config, None, None, 100, Some(100));
        assert_eq!(rewritten, config);
    }
}
