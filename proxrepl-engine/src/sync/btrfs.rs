//! BTRFS sync via send/receive
//!
//! Snapshots the source subvolume read-only, streams it to the peer
//! (incrementally when a parent snapshot exists on the source) and prunes
//! timestamped snapshots on both ends.

use super::{parse_transferred, SyncOutcome};
use crate::db::nodes::NodeRecord;
use crate::db::sync_jobs::SyncJob;
use crate::retention::Pruner;
use crate::ssh::{ssh_pipe_prefix, SshExecutor, SshTarget, INVENTORY_TIMEOUT, SNAPSHOT_TIMEOUT};
use std::time::Duration;
use tracing::{info, warn};

/// `<vm_id>_<disk>_<YYYYMMDD-HHMMSS>`
pub fn build_snapshot_name(vm_id: u32, disk: &str, timestamp: &str) -> String {
    format!("{}_{}_{}", vm_id, disk, timestamp)
}

/// Snapshot prefix shared by all runs of one job
pub fn snapshot_prefix(vm_id: u32, disk: &str) -> String {
    format!("{}_{}_", vm_id, disk)
}

/// Pick the parent for an incremental run: the newest existing snapshot
/// that is not the one just created. The listing is lexicographically
/// descending, which matches chronological order for timestamp suffixes.
pub fn choose_parent<'a>(existing_desc: &'a [String], new_snapshot: &str) -> Option<&'a str> {
    existing_desc
        .iter()
        .map(|s| s.as_str())
        .find(|s| *s != new_snapshot)
}

/// `btrfs send [-p parent] <snap> | ssh <dest> "mkdir -p <dir> && btrfs receive <dir>"`
pub fn build_send_command(
    snapshot_path: &str,
    parent: Option<&str>,
    dest: &SshTarget,
    dest_snapshot_dir: &str,
) -> String {
    let send = match parent {
        Some(parent) => format!("btrfs send -p '{}' '{}'", parent, snapshot_path),
        None => format!("btrfs send '{}'", snapshot_path),
    };

    let receive = format!(
        "mkdir -p '{}' && btrfs receive '{}'",
        dest_snapshot_dir, dest_snapshot_dir
    );

    format!("{} | {} \"{}\"", send, ssh_pipe_prefix(dest), receive)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Run one BTRFS replication
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    executor: &SshExecutor,
    pruner: &Pruner,
    job: &SyncJob,
    source: &NodeRecord,
    dest: &NodeRecord,
    default_snapshot_dir: &str,
    max_snapshots: usize,
    timeout: Duration,
) -> SyncOutcome {
    let source_target = source.ssh_target();
    let dest_target = dest.ssh_target();

    let snapshot_dir = source
        .btrfs_snapshot_dir
        .as_deref()
        .unwrap_or(default_snapshot_dir);
    let dest_snapshot_dir = dest
        .btrfs_snapshot_dir
        .as_deref()
        .unwrap_or(default_snapshot_dir);

    let disk_path = &job.source_dataset;
    let disk = basename(disk_path);
    let vm_id = job.vm_id.unwrap_or(0);

    // 1. The source must be a subvolume for send/receive to work
    let show_cmd = format!("btrfs subvolume show '{}' 2>/dev/null", disk_path);
    let is_subvolume = match executor
        .execute(&source_target, &show_cmd, INVENTORY_TIMEOUT)
        .await
    {
        Ok(output) => output.success,
        Err(e) => return SyncOutcome::failure(e.to_string()),
    };

    if !is_subvolume {
        if !job.convert_to_subvolume {
            return SyncOutcome::failure(format!(
                "{} is not a BTRFS subvolume (conversion disabled for this job)",
                disk_path
            ));
        }

        if let Err(error) = convert_to_subvolume(executor, &source_target, disk_path).await {
            return SyncOutcome::failure(error);
        }
    }

    // 2. Read-only timestamped snapshot
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let snapshot_name = build_snapshot_name(vm_id, disk, &timestamp);
    let snapshot_path = format!("{}/{}", snapshot_dir, snapshot_name);

    let snap_cmd = format!(
        "mkdir -p '{}' && btrfs subvolume snapshot -r '{}' '{}'",
        snapshot_dir, disk_path, snapshot_path
    );
    match executor.execute(&source_target, &snap_cmd, SNAPSHOT_TIMEOUT).await {
        Ok(result) if result.success => {
            info!("Created BTRFS snapshot {}", snapshot_name);
        }
        Ok(result) => {
            return SyncOutcome {
                output: result.stdout,
                ..SyncOutcome::failure(format!(
                    "Snapshot creation failed: {}",
                    result.stderr.trim()
                ))
            };
        }
        Err(e) => return SyncOutcome::failure(e.to_string()),
    }

    // 3. Parent lookup for incremental send
    let prefix = snapshot_prefix(vm_id, disk);
    let list_cmd = format!(
        "find '{}' -maxdepth 1 -name '{}*' -type d | sort -r",
        snapshot_dir, prefix
    );
    let existing: Vec<String> = match executor
        .execute(&source_target, &list_cmd, INVENTORY_TIMEOUT)
        .await
    {
        Ok(output) => output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    };

    let parent = choose_parent(&existing, &snapshot_path).map(|p| p.to_string());
    let sync_type = if parent.is_some() { "incremental" } else { "full" };

    // 4. Stream to the peer
    let command = build_send_command(&snapshot_path, parent.as_deref(), &dest_target, dest_snapshot_dir);
    info!("Running {} BTRFS sync for job '{}': {}", sync_type, job.name, command);

    let result = match executor.execute(&source_target, &command, timeout).await {
        Ok(result) => result,
        Err(e) => {
            return SyncOutcome {
                command: Some(command),
                sync_type: Some(sync_type.to_string()),
                snapshot_name: Some(snapshot_name),
                ..SyncOutcome::failure(e.to_string())
            };
        }
    };

    if !result.success {
        let error = if result.timed_out {
            format!("btrfs send timed out after {}s", timeout.as_secs())
        } else {
            result.stderr.trim().to_string()
        };

        return SyncOutcome {
            success: false,
            output: result.merged(),
            error: Some(error),
            command: Some(command),
            exit_code: Some(result.exit_code as i64),
            transferred: None,
            sync_type: Some(sync_type.to_string()),
            snapshot_name: Some(snapshot_name),
        };
    }

    // 5. Prune both ends; a prune failure is a warning, not a run failure
    for (target, dir, side) in [
        (&source_target, snapshot_dir, "source"),
        (&dest_target, dest_snapshot_dir, "destination"),
    ] {
        if let Err(e) = pruner
            .prune_btrfs_snapshots(target, dir, &prefix, max_snapshots)
            .await
        {
            warn!("BTRFS {} pruning for job '{}' failed: {}", side, job.name, e);
        }
    }

    let merged = result.merged();
    let transferred = parse_transferred(&merged);

    SyncOutcome {
        success: true,
        output: merged,
        error: None,
        command: Some(command),
        exit_code: Some(result.exit_code as i64),
        transferred,
        sync_type: Some(sync_type.to_string()),
        snapshot_name: Some(snapshot_name),
    }
}

/// Convert a plain file/directory into a subvolume. Destructive: the
/// original is moved aside and recreated in place.
async fn convert_to_subvolume(
    executor: &SshExecutor,
    target: &SshTarget,
    path: &str,
) -> std::result::Result<(), String> {
    let cmd = format!(
        "TEMP_DIR=$(mktemp -d)\n\
         mv '{path}' \"$TEMP_DIR/\"\n\
         btrfs subvolume create '{path}'\n\
         BASENAME=$(basename '{path}')\n\
         mv \"$TEMP_DIR/$BASENAME\"/* '{path}/' 2>/dev/null || mv \"$TEMP_DIR/$BASENAME\" '{path}/disk.img'\n\
         rmdir \"$TEMP_DIR\" 2>/dev/null || rm -rf \"$TEMP_DIR\"\n\
         echo 'Converted to subvolume'",
        path = path
    );

    match executor.execute(target, &cmd, SNAPSHOT_TIMEOUT).await {
        Ok(result) if result.success => {
            info!("Converted {} to a BTRFS subvolume", path);
            Ok(())
        }
        Ok(result) => Err(format!(
            "Failed to convert {} to a subvolume: {}",
            path,
            result.stderr.trim()
        )),
        Err(e) => Err(e.to_string()),
    }
}
