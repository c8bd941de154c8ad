//! Migration pipeline
//!
//! Copies or moves a guest between PVE nodes. `move` delegates to the
//! cluster-native `qm migrate`/`pct migrate`; `copy` stages a vzdump
//! archive, transfers it and restores it on the destination, so no cluster
//! membership is required. A VMID conflict on a manual run is a branch the
//! caller must resolve, not a failure.

use crate::db::job_logs::{self, LogCompletion, NewJobLog};
use crate::db::migration_jobs::{self, MigrationJob};
use crate::db::nodes::{self, NodeRecord};
use crate::notify::{JobNotification, NotificationTrigger};
use crate::ssh::{SshExecutor, SshTarget, INVENTORY_TIMEOUT, SNAPSHOT_TIMEOUT, SYNC_TIMEOUT, BACKUP_TIMEOUT};
use proxrepl_common::{GuestType, MigrationMode, Result, RunStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

/// Errors that justify retrying vzdump with the next backup mode. They are
/// guest-start and snapshot-capability problems; everything else is
/// terminal for the phase.
pub const RECOVERABLE_ERRORS: &[&str] = &[
    "bridge",
    "does not exist",
    "not running",
    "snapshot feature is not available",
    "unable to activate",
    "network",
    "vmbr",
    "failed to start",
    "cannot start",
];

/// Backup modes attempted in order during a copy
pub const BACKUP_MODE_ORDER: &[&str] = &["snapshot", "suspend", "stop"];

/// Staging directory candidates, preferred first
pub const STAGING_CANDIDATES: &[&str] = &["/var/lib/vz/dump", "/var/tmp", "/tmp"];

/// Required headroom over the estimated guest size
pub const STAGING_HEADROOM: f64 = 1.5;

static TRANSFER_SIZE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+\.?\d*)\s*(GiB|MiB|KiB|GB|MB|KB)").unwrap());

static DISK_SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:scsi|sata|virtio|ide|mp)\d+:.*?size=(\d+(?:\.\d+)?)([MGT])|^rootfs:.*?size=(\d+(?:\.\d+)?)([MGT])").unwrap()
});

static BRIDGE_FIELD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bridge=[^,\s]+").unwrap());

static NET_IFACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^net\d+$").unwrap());

static DISK_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:scsi|sata|virtio|ide|mp)\d+$|^rootfs$").unwrap());

/// Optional hardware remap applied after the guest lands on the destination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HwConfig {
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub sockets: Option<u32>,
    #[serde(default)]
    pub cpu: Option<String>,
    /// `netN` -> `"bridge=<br>"` or `{"bridge": "<br>", ...}`
    #[serde(default)]
    pub network: Option<BTreeMap<String, serde_json::Value>>,
    /// `diskN` -> `"<storage>[:<volume>]"`
    #[serde(default)]
    pub storage: Option<BTreeMap<String, String>>,
}

impl HwConfig {
    pub fn from_job(job: &MigrationJob) -> Option<Self> {
        job.hw_config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// First storage named in the remap, used for `--storage` style options
    pub fn first_storage(&self) -> Option<String> {
        self.storage.as_ref().and_then(|map| {
            map.values()
                .next()
                .map(|v| v.split(':').next().unwrap_or(v).to_string())
        })
    }
}

/// Result of a completed migration run
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub target_vmid: u32,
    pub duration_seconds: i64,
    pub transferred: Option<String>,
    pub used_mode: Option<String>,
    pub snapshot_created: Option<String>,
}

/// Tagged result: a VMID conflict without confirmation is a branch the
/// caller resolves by re-invoking with `force_overwrite`.
#[derive(Debug, Clone)]
pub enum MigrationOutcome {
    Completed(MigrationReport),
    NeedsConfirmation { existing_vm_id: u32, dest_host: String },
}

#[derive(Debug)]
struct PhaseError {
    phase: &'static str,
    message: String,
    command: Option<String>,
    output: Option<String>,
    exit_code: Option<i64>,
}

impl PhaseError {
    fn new(phase: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            command: None,
            output: None,
            exit_code: None,
        }
    }
}

pub struct MigrationPipeline {
    executor: Arc<SshExecutor>,
    notifier: Arc<NotificationTrigger>,
}

impl MigrationPipeline {
    pub fn new(executor: Arc<SshExecutor>, notifier: Arc<NotificationTrigger>) -> Self {
        Self { executor, notifier }
    }

    /// Execute one migration run. Scheduled dispatches pass
    /// `force_overwrite = true`; manual ones surface the confirmation branch.
    pub async fn run(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        force_overwrite: bool,
        triggered_by: Option<&str>,
        is_scheduled: bool,
    ) -> Result<MigrationOutcome> {
        let job = migration_jobs::get_migration_job(pool, job_id).await?;
        let source = nodes::get_node(pool, job.source_node_id).await?;
        let dest = nodes::get_node(pool, job.dest_node_id).await?;

        migration_jobs::try_mark_running(pool, job_id).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let log_id = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id,
                job_type: "migration".to_string(),
                job_id,
                phase: "main".to_string(),
                node_name: Some(format!("{} -> {}", source.name, dest.name)),
                dataset: Some(format!("vm/{}", job.vm_id)),
                message: Some(format!("Migration ({}) started", job.mode.as_str())),
                triggered_by: triggered_by.map(|t| t.to_string()),
            },
        )
        .await?;

        let started = std::time::Instant::now();

        let result = match job.mode {
            MigrationMode::Move => self.run_move(&job, &source, &dest).await.map(Some),
            MigrationMode::Copy => {
                self.run_copy(&job, &source, &dest, force_overwrite || is_scheduled)
                    .await
            }
        };

        let duration = started.elapsed().as_secs() as i64;

        match result {
            Ok(None) => {
                // VMID conflict awaiting confirmation: not a run, not a failure
                let target_vmid = job.dest_vm_id.unwrap_or(job.vm_id);
                migration_jobs::clear_running(pool, job_id).await?;
                job_logs::complete_log(
                    pool,
                    log_id,
                    RunStatus::PendingConfirmation,
                    &LogCompletion {
                        message: Some(format!(
                            "VM {} already exists on {}; confirmation required",
                            target_vmid, dest.name
                        )),
                        ..Default::default()
                    },
                )
                .await?;

                Ok(MigrationOutcome::NeedsConfirmation {
                    existing_vm_id: target_vmid,
                    dest_host: dest.name.clone(),
                })
            }
            Ok(Some(mut report)) => {
                report.duration_seconds = duration;
                migration_jobs::finish_run(pool, job_id, true, duration, report.transferred.as_deref())
                    .await?;
                job_logs::complete_log(
                    pool,
                    log_id,
                    RunStatus::Success,
                    &LogCompletion {
                        message: Some(format!(
                            "VM {} migrated to {} as {}",
                            job.vm_id, dest.name, report.target_vmid
                        )),
                        bytes_transferred: report.transferred.clone(),
                        ..Default::default()
                    },
                )
                .await?;

                self.notify(&job, &source, &dest, "success", duration, None, report.transferred.clone(), is_scheduled);
                Ok(MigrationOutcome::Completed(report))
            }
            Err(phase_error) => {
                migration_jobs::finish_run(pool, job_id, false, duration, None).await?;
                job_logs::complete_log(
                    pool,
                    log_id,
                    RunStatus::Failed,
                    &LogCompletion {
                        message: Some(format!(
                            "Migration failed in phase {}: {}",
                            phase_error.phase, phase_error.message
                        )),
                        error: Some(phase_error.message.clone()),
                        command: phase_error.command.clone(),
                        exit_code: phase_error.exit_code,
                        output: phase_error.output.as_deref().map(|o| crate::sync::tail(o, 200)),
                        ..Default::default()
                    },
                )
                .await?;

                self.notify(
                    &job,
                    &source,
                    &dest,
                    "failed",
                    duration,
                    Some(phase_error.message.clone()),
                    None,
                    is_scheduled,
                );

                Err(proxrepl_common::Error::RemoteTool(format!(
                    "Migration failed in phase {}: {}",
                    phase_error.phase, phase_error.message
                )))
            }
        }
    }

    /// `move`: one-pass cluster-native migrate
    async fn run_move(
        &self,
        job: &MigrationJob,
        source: &NodeRecord,
        dest: &NodeRecord,
    ) -> std::result::Result<MigrationReport, PhaseError> {
        let tool = job.vm_type.tool();
        let source_target = source.ssh_target();
        let dest_target = dest.ssh_target();

        // The guest must exist on the source
        let check_cmd = format!("{} status {} 2>/dev/null", tool, job.vm_id);
        let check = self
            .execute(&source_target, &check_cmd, INVENTORY_TIMEOUT, "check_source_vm")
            .await?;
        if !check.success {
            return Err(PhaseError {
                phase: "check_source_vm",
                message: format!("VM {} not found on {}", job.vm_id, source.name),
                command: Some(check_cmd),
                output: Some(check.merged()),
                exit_code: Some(check.exit_code as i64),
            });
        }

        let snapshot_created = self.create_pre_migration_snapshot(job, &source_target).await;

        let hw = HwConfig::from_job(job);
        let mut command = format!("{} migrate {} {}", tool, job.vm_id, migrate_target(dest));
        if let Some(new_id) = job.dest_vm_id.filter(|id| *id != job.vm_id) {
            command.push_str(&format!(" --newid {}", new_id));
        }
        if let Some(storage) = hw.as_ref().and_then(|hw| hw.first_storage()) {
            command.push_str(&format!(" --storage {}", storage));
        }

        info!("Migration (move) for job '{}': {}", job.name, command);
        let result = self
            .execute(&source_target, &command, SYNC_TIMEOUT, "migrate_move")
            .await?;

        if !result.success {
            return Err(PhaseError {
                phase: "migrate_move",
                message: specific_error(&result.merged(), &result.stderr),
                command: Some(command),
                output: Some(result.merged()),
                exit_code: Some(result.exit_code as i64),
            });
        }

        let transferred = parse_transfer_size(&result.stdout);
        let target_vmid = job.dest_vm_id.unwrap_or(job.vm_id);

        if let Some(hw) = hw {
            self.apply_hw_config(job, &dest_target, target_vmid, &hw).await;
        }
        if job.keep_snapshots > 0 {
            self.prune_migration_snapshots(job, &source_target).await;
        }
        if job.start_after {
            self.start_guest(job, &dest_target, target_vmid).await;
        }

        Ok(MigrationReport {
            target_vmid,
            transferred,
            snapshot_created,
            ..Default::default()
        })
    }

    /// `copy`: vzdump + transfer + restore; `Ok(None)` is the
    /// confirmation branch.
    async fn run_copy(
        &self,
        job: &MigrationJob,
        source: &NodeRecord,
        dest: &NodeRecord,
        force_overwrite: bool,
    ) -> std::result::Result<Option<MigrationReport>, PhaseError> {
        let tool = job.vm_type.tool();
        let source_target = source.ssh_target();
        let dest_target = dest.ssh_target();
        let target_vmid = job.dest_vm_id.unwrap_or(job.vm_id);

        // 1. Destination conflict handling
        let check_cmd = format!("{} status {} 2>/dev/null", tool, target_vmid);
        let check = self
            .execute(&dest_target, &check_cmd, INVENTORY_TIMEOUT, "check_dest_vm")
            .await?;

        if check.success && !check.stdout.trim().is_empty() {
            if !force_overwrite {
                return Ok(None);
            }

            info!("Destroying existing VM {} on {}", target_vmid, dest.name);
            let stop_cmd = format!("{} stop {} --skiplock 2>/dev/null || true", tool, target_vmid);
            let _ = self
                .execute(&dest_target, &stop_cmd, Duration::from_secs(60), "destroy_existing_vm")
                .await;
            tokio::time::sleep(Duration::from_secs(3)).await;

            let destroy_cmd = format!("{} destroy {} --purge --skiplock", tool, target_vmid);
            let destroy = self
                .execute(&dest_target, &destroy_cmd, Duration::from_secs(120), "destroy_existing_vm")
                .await?;
            if !destroy.success {
                return Err(PhaseError {
                    phase: "destroy_existing_vm",
                    message: format!(
                        "Cannot remove existing VM {} on {}: {}",
                        target_vmid,
                        dest.name,
                        destroy.stderr.trim()
                    ),
                    command: Some(destroy_cmd),
                    output: Some(destroy.merged()),
                    exit_code: Some(destroy.exit_code as i64),
                });
            }
        }

        // 2. Optional pre-migration snapshot
        let snapshot_created = self.create_pre_migration_snapshot(job, &source_target).await;

        // 3. Size estimate and staging directory selection
        let config_cmd = format!("{} config {} 2>/dev/null", tool, job.vm_id);
        let config = self
            .execute(&source_target, &config_cmd, INVENTORY_TIMEOUT, "estimate_size")
            .await?;
        let estimate_gb = estimate_disk_size_gb(&config.stdout);
        info!("Estimated size of VM {}: ~{} GB", job.vm_id, estimate_gb);

        let mut candidates = Vec::new();
        for dir in STAGING_CANDIDATES {
            let space_cmd = format!(
                "df -BG {} 2>/dev/null | tail -1 | awk '{{print $4}}' | tr -d 'G'",
                dir
            );
            if let Ok(output) = self.executor.execute(&source_target, &space_cmd, INVENTORY_TIMEOUT).await {
                if let Ok(avail) = output.stdout.trim().parse::<u64>() {
                    candidates.push((dir.to_string(), avail));
                }
            }
        }

        let staging_dir = choose_staging_dir(estimate_gb, &candidates).ok_or_else(|| {
            PhaseError::new(
                "staging",
                format!(
                    "Insufficient space for staging; at least {} GB free required",
                    (estimate_gb as f64 * STAGING_HEADROOM).ceil() as u64
                ),
            )
        })?;

        // 4. vzdump with mode fallback
        let used_mode = self
            .vzdump_with_fallback(job, &source_target, &staging_dir)
            .await?;

        // 5. Locate the produced archive
        let find_cmd = format!(
            "ls -t {dir}/vzdump-{ty}-{id}-*.vma.zst {dir}/vzdump-{ty}-{id}-*.tar.zst 2>/dev/null | head -1",
            dir = staging_dir,
            ty = job.vm_type.as_str(),
            id = job.vm_id
        );
        let find = self
            .execute(&source_target, &find_cmd, INVENTORY_TIMEOUT, "find_backup_file")
            .await?;
        let archive = find.stdout.trim().to_string();
        if archive.is_empty() {
            return Err(PhaseError {
                phase: "find_backup_file",
                message: format!("Backup archive not found in {}", staging_dir),
                command: Some(find_cmd),
                output: Some(find.merged()),
                exit_code: Some(find.exit_code as i64),
            });
        }

        let size_cmd = format!("stat -c%s {} 2>/dev/null", archive);
        let archive_bytes = self
            .executor
            .execute(&source_target, &size_cmd, INVENTORY_TIMEOUT)
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse::<u64>().ok())
            .unwrap_or(0);
        info!("Backup of VM {} created: {} ({})", job.vm_id, archive, human_size(archive_bytes));

        // 6. Transfer: rsync with progress, scp as fallback
        let remote_archive = format!("/var/tmp/{}", basename(&archive));
        let transfer = self
            .transfer_archive(&source_target, dest, &archive)
            .await;

        if let Err(phase_error) = transfer {
            let _ = self
                .executor
                .execute(&source_target, &format!("rm -f {}", archive), INVENTORY_TIMEOUT)
                .await;
            return Err(phase_error);
        }

        // 7. Destination storage resolution
        let hw = HwConfig::from_job(job);
        let dest_storage = self
            .resolve_dest_storage(&dest_target, hw.as_ref())
            .await
            .ok_or_else(|| PhaseError::new("restore", "No storage supporting 'images' found on destination"))?;

        // 8. Restore; pct restore takes the VMID first
        let restore_cmd = match job.vm_type {
            GuestType::Qemu => format!("qmrestore {} {} --storage {}", remote_archive, target_vmid, dest_storage),
            GuestType::Lxc => format!("pct restore {} {} --storage {}", target_vmid, remote_archive, dest_storage),
        };
        info!("Restoring VM {} on {}: {}", target_vmid, dest.name, restore_cmd);
        let restore = self
            .execute(&dest_target, &restore_cmd, SYNC_TIMEOUT, "restore")
            .await;

        // 9. Cleanup both sides regardless of the restore outcome
        let _ = self
            .executor
            .execute(&dest_target, &format!("rm -f {}", remote_archive), INVENTORY_TIMEOUT)
            .await;
        let _ = self
            .executor
            .execute(&source_target, &format!("rm -f {}", archive), INVENTORY_TIMEOUT)
            .await;

        let restore = restore?;
        if !restore.success {
            return Err(PhaseError {
                phase: "restore",
                message: specific_error(&restore.merged(), &restore.stderr),
                command: Some(restore_cmd),
                output: Some(restore.merged()),
                exit_code: Some(restore.exit_code as i64),
            });
        }

        // 10. Hardware remap and name suffix
        if let Some(hw) = hw {
            self.apply_hw_config(job, &dest_target, target_vmid, &hw).await;
        } else if job.dest_vm_name_suffix.is_some() {
            self.apply_hw_config(job, &dest_target, target_vmid, &HwConfig::default())
                .await;
        }

        // 11. Snapshot pruning and optional start
        if job.keep_snapshots > 0 {
            self.prune_migration_snapshots(job, &source_target).await;
        }
        if job.start_after {
            self.start_guest(job, &dest_target, target_vmid).await;
        }

        let transferred = if archive_bytes > 0 {
            Some(human_size(archive_bytes))
        } else {
            parse_transfer_size(&restore.stdout)
        };

        Ok(Some(MigrationReport {
            target_vmid,
            transferred,
            used_mode: Some(used_mode),
            snapshot_created,
            ..Default::default()
        }))
    }

    /// Try vzdump with mode fallback on recoverable errors only
    async fn vzdump_with_fallback(
        &self,
        job: &MigrationJob,
        source: &SshTarget,
        staging_dir: &str,
    ) -> std::result::Result<String, PhaseError> {
        let mut last_error: Option<String> = None;
        let mut last_output: Option<String> = None;

        for mode in BACKUP_MODE_ORDER {
            let command = format!(
                "vzdump {} --compress zstd --dumpdir {} --mode {} --remove 0",
                job.vm_id, staging_dir, mode
            );
            info!("Backing up VM {} with mode={}", job.vm_id, mode);

            let result = self
                .execute(source, &command, SYNC_TIMEOUT, "backup")
                .await?;

            if result.success {
                info!("Backup of VM {} completed with mode={}", job.vm_id, mode);
                return Ok(mode.to_string());
            }

            let merged = result.merged();
            if is_recoverable_error(&merged) {
                warn!(
                    "Backup mode {} failed with a recoverable error, trying the next mode: {}",
                    mode,
                    result.stderr.trim()
                );
                last_error = Some(result.stderr.trim().to_string());
                last_output = Some(merged);
                continue;
            }

            return Err(PhaseError {
                phase: "backup",
                message: specific_error(&merged, &result.stderr),
                command: Some(command),
                output: Some(merged),
                exit_code: Some(result.exit_code as i64),
            });
        }

        Err(PhaseError {
            phase: "backup",
            message: format!(
                "All backup modes failed (snapshot, suspend, stop). Last error: {}",
                last_error.unwrap_or_else(|| "no details".to_string())
            ),
            command: None,
            output: last_output,
            exit_code: None,
        })
    }

    async fn transfer_archive(
        &self,
        source: &SshTarget,
        dest: &NodeRecord,
        archive: &str,
    ) -> std::result::Result<(), PhaseError> {
        let ssh_opts = format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i {} -p {}",
            source.key_path, dest.ssh_port
        );
        let rsync_cmd = format!(
            "rsync -avz --progress --info=progress2 -e '{}' {} {}@{}:/var/tmp/",
            ssh_opts, archive, dest.ssh_user, dest.hostname
        );

        info!("Transferring {} to {}", archive, dest.name);
        let rsync = self
            .execute(source, &rsync_cmd, BACKUP_TIMEOUT, "transfer")
            .await?;
        if rsync.success {
            return Ok(());
        }

        warn!("rsync failed, retrying with scp: {}", rsync.stderr.trim());
        let scp_cmd = format!(
            "scp -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i {} -P {} {} {}@{}:/var/tmp/",
            source.key_path, dest.ssh_port, archive, dest.ssh_user, dest.hostname
        );
        let scp = self
            .execute(source, &scp_cmd, BACKUP_TIMEOUT, "transfer")
            .await?;

        if scp.success {
            Ok(())
        } else {
            Err(PhaseError {
                phase: "transfer",
                message: format!("Archive transfer failed: {}", scp.stderr.trim()),
                command: Some(scp_cmd),
                output: Some(scp.merged()),
                exit_code: Some(scp.exit_code as i64),
            })
        }
    }

    /// Explicit override wins; else the first storage with `images` content;
    /// else the common fallbacks.
    async fn resolve_dest_storage(
        &self,
        dest: &SshTarget,
        hw: Option<&HwConfig>,
    ) -> Option<String> {
        if let Some(storage) = hw.and_then(|hw| hw.first_storage()) {
            return Some(storage);
        }

        let find_cmd = "pvesm status --content images 2>/dev/null | awk 'NR>1 {print $1}' | head -1";
        if let Ok(output) = self.executor.execute(dest, find_cmd, INVENTORY_TIMEOUT).await {
            let storage = output.stdout.trim().to_string();
            if output.success && !storage.is_empty() {
                return Some(storage);
            }
        }

        for fallback in ["local-lvm", "local-zfs", "zfs", "lvm"] {
            let check_cmd = format!("pvesm status 2>/dev/null | grep -q '^{}' && echo found", fallback);
            if let Ok(output) = self.executor.execute(dest, &check_cmd, INVENTORY_TIMEOUT).await {
                if output.stdout.contains("found") {
                    return Some(fallback.to_string());
                }
            }
        }

        None
    }

    /// Pre-migration snapshot failure is never blocking
    async fn create_pre_migration_snapshot(
        &self,
        job: &MigrationJob,
        source: &SshTarget,
    ) -> Option<String> {
        if !job.create_snapshot {
            return None;
        }

        let snapshot_name = format!("migration-{}", chrono::Utc::now().timestamp());
        let command = format!(
            "{} snapshot {} {} --description 'Pre-migration snapshot'",
            job.vm_type.tool(),
            job.vm_id,
            snapshot_name
        );

        match self.executor.execute(source, &command, SNAPSHOT_TIMEOUT).await {
            Ok(result) if result.success => Some(snapshot_name),
            Ok(result) => {
                warn!(
                    "Pre-migration snapshot of VM {} failed (non-blocking): {}",
                    job.vm_id,
                    result.stderr.trim()
                );
                None
            }
            Err(e) => {
                warn!("Pre-migration snapshot of VM {} failed (non-blocking): {}", job.vm_id, e);
                None
            }
        }
    }

    /// Apply memory/cpu/network/storage remaps and the name suffix.
    /// Remap failures downgrade to warnings; the guest has already landed.
    async fn apply_hw_config(
        &self,
        job: &MigrationJob,
        dest: &SshTarget,
        vm_id: u32,
        hw: &HwConfig,
    ) {
        let tool = job.vm_type.tool();

        if let Some(suffix) = job.dest_vm_name_suffix.as_deref() {
            let key = match job.vm_type {
                GuestType::Qemu => "name",
                GuestType::Lxc => "hostname",
            };
            let get = format!("{} config {} | grep '^{}:'", tool, vm_id, key);
            if let Ok(output) = self.executor.execute(dest, &get, INVENTORY_TIMEOUT).await {
                if let Some(current) = output.stdout.trim().split_once(':').map(|(_, v)| v.trim()) {
                    if !current.is_empty() && !current.contains(suffix) {
                        let set = format!("{} set {} --{} '{}{}'", tool, vm_id, key, current, suffix);
                        let _ = self.executor.execute(dest, &set, INVENTORY_TIMEOUT).await;
                    }
                }
            }
        }

        for (flag, value) in [
            ("memory", hw.memory.map(|v| v.to_string())),
            ("cores", hw.cores.map(|v| v.to_string())),
            ("sockets", hw.sockets.map(|v| v.to_string())),
            ("cpu", hw.cpu.clone()),
        ] {
            if let Some(value) = value {
                let command = format!("{} set {} --{} {}", tool, vm_id, flag, value);
                match self.executor.execute(dest, &command, INVENTORY_TIMEOUT).await {
                    Ok(result) if result.success => info!("Set {}={} on VM {}", flag, value, vm_id),
                    _ => warn!("Failed to set {} on VM {}", flag, vm_id),
                }
            }
        }

        if let Some(network) = &hw.network {
            for (iface, requested) in network {
                if !NET_IFACE_REGEX.is_match(iface) {
                    warn!("Skipping network remap of invalid interface key '{}'", iface);
                    continue;
                }
                self.remap_bridge(job, dest, vm_id, iface, requested).await;
            }
        }

        if let Some(storage) = &hw.storage {
            for (disk, new_storage) in storage {
                if !DISK_KEY_REGEX.is_match(disk) {
                    warn!("Skipping disk move of invalid disk key '{}'", disk);
                    continue;
                }
                let storage_name = new_storage.split(':').next().unwrap_or(new_storage);
                if crate::validation::validate_storage_name(storage_name).is_err() {
                    warn!("Skipping disk move of {}: invalid storage '{}'", disk, storage_name);
                    continue;
                }
                let command = format!("{} disk move {} {} --storage {}", tool, vm_id, disk, storage_name);
                match self
                    .executor
                    .execute(dest, &command, Duration::from_secs(600))
                    .await
                {
                    Ok(result) if result.success => info!("Moved {} of VM {} to {}", disk, vm_id, storage_name),
                    _ => warn!("Failed to move {} of VM {} to {}", disk, vm_id, storage_name),
                }
            }
        }
    }

    /// Merge the new bridge into the existing interface line, preserving
    /// MAC, firewall and the other fields.
    async fn remap_bridge(
        &self,
        job: &MigrationJob,
        dest: &SshTarget,
        vm_id: u32,
        iface: &str,
        requested: &serde_json::Value,
    ) {
        let tool = job.vm_type.tool();

        let get = format!("{} config {} | grep '^{}:'", tool, vm_id, iface);
        let current = match self.executor.execute(dest, &get, INVENTORY_TIMEOUT).await {
            Ok(output) if output.success && !output.stdout.trim().is_empty() => output
                .stdout
                .trim()
                .split_once(':')
                .map(|(_, v)| v.trim().to_string()),
            _ => None,
        };

        let Some(current) = current else {
            warn!("Interface {} not found on VM {}", iface, vm_id);
            return;
        };

        let Some(new_config) = merge_bridge_config(&current, requested) else {
            warn!("No bridge specified for {}", iface);
            return;
        };

        let command = format!("{} set {} --{} {}", tool, vm_id, iface, new_config);
        match self.executor.execute(dest, &command, INVENTORY_TIMEOUT).await {
            Ok(result) if result.success => info!("Remapped {} of VM {}: {}", iface, vm_id, new_config),
            _ => warn!("Failed to remap {} of VM {}", iface, vm_id),
        }
    }

    /// Keep the N newest `migration-*` snapshots, delete the rest
    async fn prune_migration_snapshots(&self, job: &MigrationJob, source: &SshTarget) {
        let tool = job.vm_type.tool();
        let list_cmd = format!("{} listsnapshot {} 2>/dev/null", tool, job.vm_id);

        let output = match self.executor.execute(source, &list_cmd, INVENTORY_TIMEOUT).await {
            Ok(output) if output.success => output,
            _ => {
                warn!("Cannot list snapshots of VM {}", job.vm_id);
                return;
            }
        };

        let snapshots = parse_listsnapshot(&output.stdout);
        let victims = select_prune_victims(&snapshots, job.keep_snapshots as usize);

        if victims.is_empty() {
            return;
        }

        info!(
            "Pruning {} migration snapshot(s) of VM {} (keep={})",
            victims.len(),
            job.vm_id,
            job.keep_snapshots
        );

        for snapshot in victims {
            let del_cmd = format!("{} delsnapshot {} {}", tool, job.vm_id, snapshot);
            match self.executor.execute(source, &del_cmd, SNAPSHOT_TIMEOUT).await {
                Ok(result) if result.success => info!("Deleted snapshot {}", snapshot),
                _ => warn!("Failed to delete snapshot {}", snapshot),
            }
        }
    }

    async fn start_guest(&self, job: &MigrationJob, dest: &SshTarget, vm_id: u32) {
        let command = format!("{} start {}", job.vm_type.tool(), vm_id);
        match self.executor.execute(dest, &command, Duration::from_secs(60)).await {
            Ok(result) if result.success => info!("Started VM {}", vm_id),
            Ok(result) => warn!("Failed to start VM {}: {}", vm_id, result.stderr.trim()),
            Err(e) => warn!("Failed to start VM {}: {}", vm_id, e),
        }
    }

    async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
        phase: &'static str,
    ) -> std::result::Result<crate::ssh::CommandOutput, PhaseError> {
        self.executor
            .execute(target, command, timeout)
            .await
            .map_err(|e| PhaseError::new(phase, e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        job: &MigrationJob,
        source: &NodeRecord,
        dest: &NodeRecord,
        status: &str,
        duration: i64,
        error: Option<String>,
        transferred: Option<String>,
        is_scheduled: bool,
    ) {
        self.notifier.send_job_notification(&JobNotification {
            job_name: job.name.clone(),
            job_type: "migration".to_string(),
            job_id: job.id,
            status: status.to_string(),
            source: format!("{}:vm/{}", source.name, job.vm_id),
            destination: format!("{}:vm/{}", dest.name, job.dest_vm_id.unwrap_or(job.vm_id)),
            duration_seconds: duration,
            error,
            transferred: transferred.clone(),
            details: transferred.map(|t| format!("Transferred: {}", t)),
            is_scheduled,
            notify_mode: job.notify_mode,
        });
    }
}

/// `user@host[:port]` target of `qm migrate`
fn migrate_target(dest: &NodeRecord) -> String {
    if dest.ssh_port != 22 {
        format!("{}@{}:{}", dest.ssh_user, dest.hostname, dest.ssh_port)
    } else {
        format!("{}@{}", dest.ssh_user, dest.hostname)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Substring match against the recoverable-error allowlist
pub fn is_recoverable_error(output: &str) -> bool {
    let lowered = output.to_lowercase();
    RECOVERABLE_ERRORS.iter().any(|err| lowered.contains(err))
}

/// Prefer ERROR-marked lines as the user-visible explanation
fn specific_error(merged: &str, stderr: &str) -> String {
    let error_lines: Vec<&str> = merged
        .lines()
        .filter(|line| line.contains("ERROR") || line.to_lowercase().contains("error"))
        .collect();

    let message = if error_lines.is_empty() {
        stderr.trim().to_string()
    } else {
        error_lines.join("\n")
    };

    if message.len() > 500 {
        message[..500].to_string()
    } else {
        message
    }
}

/// Sum the disk sizes declared in a guest config, in GB. Falls back to a
/// conservative default when no size is parseable.
pub fn estimate_disk_size_gb(config: &str) -> u64 {
    let mut total = 0.0f64;

    for caps in DISK_SIZE_REGEX.captures_iter(config) {
        let (value, unit) = if let (Some(v), Some(u)) = (caps.get(1), caps.get(2)) {
            (v.as_str(), u.as_str())
        } else if let (Some(v), Some(u)) = (caps.get(3), caps.get(4)) {
            (v.as_str(), u.as_str())
        } else {
            continue;
        };

        let value: f64 = value.parse().unwrap_or(0.0);
        total += match unit {
            "M" => value / 1024.0,
            "T" => value * 1024.0,
            _ => value,
        };
    }

    if total <= 0.0 {
        50
    } else {
        total.ceil() as u64
    }
}

/// First candidate with free space >= headroom * estimate
pub fn choose_staging_dir(estimate_gb: u64, candidates: &[(String, u64)]) -> Option<String> {
    let required = (estimate_gb as f64 * STAGING_HEADROOM).ceil() as u64;

    candidates
        .iter()
        .find(|(_, avail)| *avail >= required)
        .map(|(dir, _)| dir.clone())
}

/// Snapshot names from `qm listsnapshot` / `pct listsnapshot`, excluding
/// the literal `current` row.
pub fn parse_listsnapshot(output: &str) -> Vec<String> {
    let mut snapshots = Vec::new();

    for raw in output.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.to_lowercase().starts_with("current") {
            continue;
        }

        if let Some(idx) = line.find("`->") {
            line = line[idx + 3..].trim();
        }

        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        if name.eq_ignore_ascii_case("current") {
            continue;
        }

        snapshots.push(name.to_string());
    }

    snapshots
}

/// Pick the `migration-*` snapshots to delete: order by the numeric
/// timestamp suffix descending, keep the first N.
pub fn select_prune_victims(snapshots: &[String], keep: usize) -> Vec<String> {
    let mut migration_snaps: Vec<&String> = snapshots
        .iter()
        .filter(|name| name.starts_with("migration-"))
        .collect();

    migration_snaps.sort_by_key(|name| {
        std::cmp::Reverse(
            name.strip_prefix("migration-")
                .and_then(|ts| ts.parse::<i64>().ok())
                .unwrap_or(0),
        )
    });

    migration_snaps
        .into_iter()
        .skip(keep)
        .cloned()
        .collect()
}

/// Merge a requested bridge into an existing `netN` spec, preserving every
/// other field. Accepts `"vmbr1"`, `"bridge=vmbr1"` (repeated prefixes
/// stripped) or `{"bridge": "vmbr1"}`.
pub fn merge_bridge_config(current: &str, requested: &serde_json::Value) -> Option<String> {
    let raw = match requested {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map.get("bridge")?.as_str()?.to_string(),
        _ => return None,
    };

    let mut bridge = raw.trim().to_string();
    while let Some(stripped) = bridge.strip_prefix("bridge=") {
        bridge = stripped.to_string();
    }

    // The value may still be a full spec fragment; pull the bridge field out
    if let Some(caps) = BRIDGE_FIELD_REGEX.find(&bridge) {
        bridge = bridge[caps.start() + "bridge=".len()..caps.end()].to_string();
    } else {
        bridge = bridge
            .split(',')
            .next()
            .unwrap_or(&bridge)
            .trim()
            .to_string();
    }

    if bridge.is_empty() || crate::validation::validate_bridge(&bridge).is_err() {
        return None;
    }

    let replacement = format!("bridge={}", bridge);
    let merged = if BRIDGE_FIELD_REGEX.is_match(current) {
        BRIDGE_FIELD_REGEX.replace(current, replacement.as_str()).to_string()
    } else {
        format!("{},{}", current, replacement)
    };

    Some(merged)
}

/// `transferred 10.5 GiB` style figure from migrate/restore output
pub fn parse_transfer_size(output: &str) -> Option<String> {
    TRANSFER_SIZE_REGEX
        .captures(output)
        .map(|caps| format!("{} {}", caps.get(1).unwrap().as_str(), caps.get(2).unwrap().as_str()))
}

pub fn human_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.2} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_recoverable_error() {
        assert!(is_recoverable_error("ERROR: bridge 'vmbr99' does not exist"));
        assert!(is_recoverable_error("guest is NOT RUNNING"));
        assert!(is_recoverable_error("snapshot feature is not available"));
        assert!(is_recoverable_error("unable to activate storage"));
        assert!(!is_recoverable_error("permission denied"));
        assert!(!is_recoverable_error("disk is full"));
    }

    #[test]
    fn test_estimate_disk_size_sum() {
        let config = "scsi0: local-zfs:vm-100-disk-0,size=32G\n\
                      scsi1: local-zfs:vm-100-disk-1,size=512M\n\
                      virtio2: local-zfs:vm-100-disk-2,size=1T\n";
        // 32 + 0.5 + 1024 = 1056.5, rounded up
        assert_eq!(estimate_disk_size_gb(config), 1057);
    }

    #[test]
    fn test_estimate_disk_size_default() {
        assert_eq!(estimate_disk_size_gb("cores: 4\nmemory: 2048\n"), 50);
        assert_eq!(estimate_disk_size_gb(""), 50);
    }

    #[test]
    fn test_choose_staging_dir_headroom() {
        let candidates = vec![
            ("/var/lib/vz/dump".to_string(), 40u64),
            ("/var/tmp".to_string(), 80u64),
            ("/tmp".to_string(), 10u64),
        ];

        // 50 GB estimate needs 75 GB free: only /var/tmp qualifies
        assert_eq!(choose_staging_dir(50, &candidates), Some("/var/tmp".to_string()));
        // 20 GB estimate needs 30 GB: the preferred dump dir wins
        assert_eq!(choose_staging_dir(20, &candidates), Some("/var/lib/vz/dump".to_string()));
        // Nothing fits a 100 GB estimate
        assert_eq!(choose_staging_dir(100, &candidates), None);
    }

    #[test]
    fn test_parse_listsnapshot() {
        let output = "`-> migration-1735689600   2025-01-01 00:00:00   Pre-migration snapshot\n\
                      \t`-> migration-1735776000   2025-01-02 00:00:00   Pre-migration snapshot\n\
                      `-> manual-snap            2025-01-03 00:00:00   by hand\n\
                      `-> current                                      You are here!\n";

        let snapshots = parse_listsnapshot(output);
        assert_eq!(
            snapshots,
            vec!["migration-1735689600", "migration-1735776000", "manual-snap"]
        );
    }

    #[test]
    fn test_select_prune_victims() {
        let snapshots = vec![
            "migration-100".to_string(),
            "migration-300".to_string(),
            "manual".to_string(),
            "migration-200".to_string(),
        ];

        // Keep one: the newest (300) stays, the others go oldest-last order
        let victims = select_prune_victims(&snapshots, 1);
        assert_eq!(victims, vec!["migration-200".to_string(), "migration-100".to_string()]);

        assert!(select_prune_victims(&snapshots, 3).is_empty());
        // Non-migration snapshots are never victims
        assert!(!select_prune_victims(&snapshots, 0).contains(&"manual".to_string()));
    }

    #[test]
    fn test_merge_bridge_config_string() {
        let current = "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,firewall=1";
        let merged = merge_bridge_config(current, &serde_json::json!("bridge=vmbr1")).unwrap();
        assert_eq!(merged, "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr1,firewall=1");
    }

    #[test]
    fn test_merge_bridge_config_repeated_prefix() {
        let current = "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0";
        let merged =
            merge_bridge_config(current, &serde_json::json!("bridge=bridge=vmbr2")).unwrap();
        assert_eq!(merged, "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr2");
    }

    #[test]
    fn test_merge_bridge_config_object_and_missing_bridge() {
        let current = "virtio=AA:BB:CC:DD:EE:FF";
        let merged =
            merge_bridge_config(current, &serde_json::json!({"bridge": "vmbr3"})).unwrap();
        assert_eq!(merged, "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr3");

        assert!(merge_bridge_config(current, &serde_json::json!({"mtu": 1500})).is_none());
        assert!(merge_bridge_config(current, &serde_json::json!(42)).is_none());
    }

    #[test]
    fn test_parse_transfer_size() {
        assert_eq!(
            parse_transfer_size("migration finished, transferred 10.5 GiB"),
            Some("10.5 GiB".to_string())
        );
        assert_eq!(parse_transfer_size("523 MB copied"), Some("523 MB".to_string()));
        assert_eq!(parse_transfer_size("nothing here"), None);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.00 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_hw_config_parsing() {
        let raw = r#"{"memory": 4096, "cores": 4, "network": {"net0": "bridge=vmbr1"}, "storage": {"scsi0": "local-zfs:vm-200-disk-0"}}"#;
        let hw: HwConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(hw.memory, Some(4096));
        assert_eq!(hw.cores, Some(4));
        assert_eq!(hw.first_storage(), Some("local-zfs".to_string()));
        assert!(hw.network.unwrap().contains_key("net0"));
    }

    #[test]
    fn test_migrate_target_port_handling() {
        let mut node = crate::db::nodes::NodeRecord {
            id: 1,
            name: "pve2".to_string(),
            hostname: "10.0.0.12".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_key_path: "/k".to_string(),
            node_type: proxrepl_common::NodeKind::Pve,
            is_active: true,
            pbs_datastore: None,
            pbs_username: None,
            pbs_password: None,
            pbs_fingerprint: None,
            btrfs_mount: None,
            btrfs_snapshot_dir: None,
            has_sanoid: false,
            has_btrfs: false,
            has_pbs_client: false,
            has_pbs_server: false,
            is_online: true,
            last_check: None,
        };

        assert_eq!(migrate_target(&node), "root@10.0.0.12");
        node.ssh_port = 2222;
        assert_eq!(migrate_target(&node), "root@10.0.0.12:2222");
    }
}
