//! Retention / pruner
//!
//! Three flavours of "keep N newest": ZFS snapshots grouped by dataset and
//! prefix, BTRFS timestamped snapshot subvolumes, and host-config archives.
//! Pruning failures are logged and never fail the calling pipeline.

use crate::ssh::{SshExecutor, SshTarget, INVENTORY_TIMEOUT, SNAPSHOT_TIMEOUT};
use proxrepl_common::{NodeKind, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one pruning pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Applies keep-N-newest policies on remote nodes
pub struct Pruner {
    executor: Arc<SshExecutor>,
}

impl Pruner {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Keep the N newest `<prefix>*` snapshots of a dataset, destroy the rest.
    pub async fn prune_zfs_snapshots(
        &self,
        target: &SshTarget,
        dataset: &str,
        prefix: &str,
        keep: usize,
    ) -> Result<PruneReport> {
        crate::validation::validate_dataset(dataset)?;
        crate::validation::validate_snapshot_name(prefix)?;

        let list_cmd = format!(
            "zfs list -t snapshot -H -p -o name,creation -r '{}' 2>/dev/null",
            dataset
        );
        let output = self.executor.execute(target, &list_cmd, INVENTORY_TIMEOUT).await?;

        if !output.success && output.stdout.trim().is_empty() {
            // Empty dataset or missing: nothing to prune
            return Ok(PruneReport::default());
        }

        let victims = select_zfs_victims(&output.stdout, prefix, keep);
        let mut report = PruneReport {
            examined: output.stdout.lines().count(),
            ..Default::default()
        };

        for snapshot in victims {
            let destroy_cmd = format!("zfs destroy '{}'", snapshot);
            match self.executor.execute(target, &destroy_cmd, SNAPSHOT_TIMEOUT).await {
                Ok(result) if result.success => {
                    info!("Pruned ZFS snapshot {}", snapshot);
                    report.deleted += 1;
                }
                Ok(result) => {
                    warn!("Failed to prune {}: {}", snapshot, result.stderr.trim());
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", snapshot, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Keep the N newest `<prefix>*` snapshot subvolumes under a directory.
    pub async fn prune_btrfs_snapshots(
        &self,
        target: &SshTarget,
        snapshot_dir: &str,
        prefix: &str,
        keep: usize,
    ) -> Result<PruneReport> {
        crate::validation::validate_subvolume_path(snapshot_dir)?;
        crate::validation::validate_snapshot_name(prefix)?;

        let list_cmd = format!(
            "find '{}' -maxdepth 1 -name '{}*' -type d | sort -r",
            snapshot_dir, prefix
        );
        let output = self.executor.execute(target, &list_cmd, INVENTORY_TIMEOUT).await?;

        let snapshots: Vec<String> = output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut report = PruneReport {
            examined: snapshots.len(),
            ..Default::default()
        };

        for snapshot in snapshots.iter().skip(keep) {
            let delete_cmd = format!("btrfs subvolume delete '{}'", snapshot);
            match self.executor.execute(target, &delete_cmd, SNAPSHOT_TIMEOUT).await {
                Ok(result) if result.success => {
                    info!("Pruned BTRFS snapshot {}", snapshot);
                    report.deleted += 1;
                }
                Ok(result) => {
                    warn!("Failed to prune {}: {}", snapshot, result.stderr.trim());
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", snapshot, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Keep the N newest `proxmox-<pve|pbs>-config-*` archives in a directory.
    pub async fn prune_host_archives(
        &self,
        target: &SshTarget,
        directory: &str,
        host_type: NodeKind,
        keep: usize,
    ) -> Result<PruneReport> {
        crate::validation::validate_subvolume_path(directory)?;

        let list_cmd = format!(
            "ls -t {}/proxmox-{}-config-*.tar* 2>/dev/null",
            directory,
            host_type.as_str()
        );
        let output = self.executor.execute(target, &list_cmd, INVENTORY_TIMEOUT).await?;

        let archives: Vec<String> = output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut report = PruneReport {
            examined: archives.len(),
            ..Default::default()
        };

        for archive in archives.iter().skip(keep) {
            // Never step outside the configured directory
            if !archive.starts_with(directory) || archive.contains("..") {
                warn!("Skipping suspicious archive path: {}", archive);
                report.failed += 1;
                continue;
            }

            let rm_cmd = format!("rm -f '{}'", archive);
            match self.executor.execute(target, &rm_cmd, INVENTORY_TIMEOUT).await {
                Ok(result) if result.success => {
                    info!("Pruned host-config archive {}", archive);
                    report.deleted += 1;
                }
                _ => {
                    warn!("Failed to prune archive {}", archive);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Pick the ZFS snapshots to destroy: group `name\tcreation` rows by
/// dataset, filter to the prefix, sort by creation descending and drop
/// everything past index `keep`.
pub fn select_zfs_victims(stdout: &str, prefix: &str, keep: usize) -> Vec<String> {
    let mut by_dataset: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();

    for line in stdout.lines() {
        let parts: Vec<_> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        let Some((dataset, snap_name)) = parts[0].split_once('@') else {
            continue;
        };
        if !snap_name.starts_with(prefix) {
            continue;
        }
        let creation: i64 = parts[1].trim().parse().unwrap_or(0);
        by_dataset
            .entry(dataset.to_string())
            .or_default()
            .push((creation, parts[0].to_string()));
    }

    let mut victims = Vec::new();
    for (_, mut snapshots) in by_dataset {
        snapshots.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        victims.extend(snapshots.into_iter().skip(keep).map(|(_, name)| name));
    }

    victims
}
