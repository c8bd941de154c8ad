//! ZFS sync via syncoid
//!
//! The transfer runs on the source host, which owns the data; syncoid in
//! turn reaches the destination over SSH with the source node's key, so key
//! material must already be present there.

use super::{parse_transferred, SyncOutcome};
use crate::db::nodes::NodeRecord;
use crate::db::sync_jobs::SyncJob;
use crate::ssh::{SshExecutor, INVENTORY_TIMEOUT};
use std::time::Duration;
use tracing::info;

/// Compose the syncoid invocation for a job
pub fn build_syncoid_command(job: &SyncJob, dest: &NodeRecord) -> String {
    let mut parts = vec!["syncoid".to_string()];

    if job.recursive {
        parts.push("--recursive".to_string());
    }

    let compress = job.compress.as_deref().unwrap_or("lz4");
    parts.push(format!("--compress={}", compress));

    let mbuffer = job.mbuffer_size.as_deref().unwrap_or("128M");
    parts.push(format!("--mbuffer-size={}", mbuffer));

    if job.no_sync_snap {
        parts.push("--no-sync-snap".to_string());
    }
    if job.force_delete {
        parts.push("--force-delete".to_string());
    }

    if dest.ssh_port != 22 {
        parts.push(format!("--sshport={}", dest.ssh_port));
    }

    if let Some(extra) = job.extra_args.as_deref() {
        if !extra.trim().is_empty() {
            parts.push(extra.trim().to_string());
        }
    }

    parts.push(job.source_dataset.clone());
    parts.push(format!(
        "{}@{}:{}",
        dest.ssh_user, dest.hostname, job.dest_dataset
    ));

    parts.join(" ")
}

/// Decide full vs incremental by looking at the destination dataset:
/// no snapshots there means the first, full run.
pub async fn detect_sync_type(
    executor: &SshExecutor,
    dest: &NodeRecord,
    dest_dataset: &str,
) -> &'static str {
    let cmd = format!(
        "zfs list -t snapshot -H -o name -r '{}' 2>/dev/null",
        dest_dataset
    );

    match executor.execute(&dest.ssh_target(), &cmd, INVENTORY_TIMEOUT).await {
        Ok(output) if output.success && !output.stdout.trim().is_empty() => "incremental",
        _ => "full",
    }
}

/// Run one syncoid replication
pub async fn run_sync(
    executor: &SshExecutor,
    job: &SyncJob,
    source: &NodeRecord,
    dest: &NodeRecord,
    timeout: Duration,
) -> SyncOutcome {
    let sync_type = detect_sync_type(executor, dest, &job.dest_dataset).await;
    let command = build_syncoid_command(job, dest);

    info!(
        "Running {} ZFS sync for job '{}': {}",
        sync_type, job.name, command
    );

    let result = match executor.execute(&source.ssh_target(), &command, timeout).await {
        Ok(result) => result,
        Err(e) => {
            return SyncOutcome {
                command: Some(command),
                sync_type: Some(sync_type.to_string()),
                ..SyncOutcome::failure(e.to_string())
            };
        }
    };

    let merged = result.merged();
    let transferred = parse_transferred(&merged);

    if result.success {
        SyncOutcome {
            success: true,
            output: merged,
            error: None,
            command: Some(command),
            exit_code: Some(result.exit_code as i64),
            transferred,
            sync_type: Some(sync_type.to_string()),
            snapshot_name: None,
        }
    } else {
        let error = if result.timed_out {
            format!("syncoid timed out after {}s", timeout.as_secs())
        } else {
            result.stderr.trim().to_string()
        };

        SyncOutcome {
            success: false,
            output: merged,
            error: Some(error),
            command: Some(command),
            exit_code: Some(result.exit_code as i64),
            transferred,
            sync_type: Some(sync_type.to_string()),
            snapshot_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sync_jobs::test_sync_job;
    use proxrepl_common::NodeKind;

    fn dest_node(port: u16) -> NodeRecord {
        NodeRecord {
            id: 2,
            name: "pve2".to_string(),
            hostname: "10.0.0.12".to_string(),
            ssh_port: port,
            ssh_user: "root".to_string(),
            ssh_key_path: "/root/.ssh/id_rsa".to_string(),
            node_type: NodeKind::Pve,
            is_active: true,
            pbs_datastore: None,
            pbs_username: None,
            pbs_password: None,
            pbs_fingerprint: None,
            btrfs_mount: None,
            btrfs_snapshot_dir: None,
            has_sanoid: true,
            has_btrfs: false,
            has_pbs_client: false,
            has_pbs_server: false,
            is_online: true,
            last_check: None,
        }
    }

    #[test]
    fn test_build_syncoid_command_defaults() {
        let job = test_sync_job("j", 1, 2);
        let cmd = build_syncoid_command(&job, &dest_node(22));

        assert_eq!(
            cmd,
            "syncoid --compress=lz4 --mbuffer-size=128M rpool/data/vm-100-disk-0 \
             root@10.0.0.12:rpool/data/vm-100-disk-0"
        );
    }

    #[test]
    fn test_build_syncoid_command_all_options() {
        let mut job = test_sync_job("j", 1, 2);
        job.recursive = true;
        job.no_sync_snap = true;
        job.force_delete = true;
        job.compress = Some("zstd".to_string());
        job.mbuffer_size = Some("256M".to_string());
        job.extra_args = Some("--identifier=replica".to_string());

        let cmd = build_syncoid_command(&job, &dest_node(2222));

        assert!(cmd.starts_with("syncoid --recursive --compress=zstd --mbuffer-size=256M"));
        assert!(cmd.contains("--no-sync-snap"));
        assert!(cmd.contains("--force-delete"));
        assert!(cmd.contains("--sshport=2222"));
        assert!(cmd.contains("--identifier=replica"));
        assert!(cmd.ends_with("root@10.0.0.12:rpool/data/vm-100-disk-0"));
    }

    #[test]
    fn test_default_port_omits_sshport() {
        let job = test_sync_job("j", 1, 2);
        let cmd = build_syncoid_command(&job, &dest_node(22));
        assert!(!cmd.contains("--sshport"));
    }
}
