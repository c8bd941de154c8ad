//! Recovery pipeline (PBS-mediated backup/restore)
//!
//! Copies a guest between PVE nodes through a PBS datastore in three named
//! phases; each phase is a separate job log row pointing at the same run,
//! and the parent log summarises them. Only a job in a non-transient state
//! may start a run.

use crate::db::job_logs::{self, LogCompletion, NewJobLog};
use crate::db::nodes::{self, NodeRecord};
use crate::db::recovery_jobs::{self, RecoveryJob};
use crate::db::settings;
use crate::notify::{JobNotification, NotificationTrigger};
use crate::ssh::{SshExecutor, SshTarget, INVENTORY_TIMEOUT};
use proxrepl_common::{GuestType, RecoveryStatus, Result, RunStatus};
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{error, info};

static BACKUP_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"backup '(.+?)' successful").unwrap(),
        Regex::new(r"creating vzdump archive '(.+?)'").unwrap(),
        Regex::new(r"(?m)backup-id: '?([^'\n]+?)'?\s*$").unwrap(),
        Regex::new(r"\b(vm/\d+/\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)").unwrap(),
    ]
});

/// Which part of the pipeline a trigger wants; the independent backup and
/// restore cron schedules dispatch partial runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryScope {
    Full,
    BackupOnly,
    RestoreOnly,
}

/// Result of one phase
#[derive(Debug, Clone, Default)]
struct PhaseOutcome {
    success: bool,
    output: String,
    error: Option<String>,
    command: Option<String>,
    exit_code: Option<i64>,
    backup_id: Option<String>,
}

/// Final report of a recovery run
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub success: bool,
    pub failed_phase: Option<String>,
    pub backup_id: Option<String>,
    pub error: Option<String>,
    pub duration_seconds: i64,
}

pub struct RecoveryPipeline {
    executor: Arc<SshExecutor>,
    notifier: Arc<NotificationTrigger>,
}

impl RecoveryPipeline {
    pub fn new(executor: Arc<SshExecutor>, notifier: Arc<NotificationTrigger>) -> Self {
        Self { executor, notifier }
    }

    /// Execute a recovery run. Returns `Error::Conflict` when the job is in
    /// a transient state ("already in execution").
    pub async fn run(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        scope: RecoveryScope,
        triggered_by: Option<&str>,
        is_scheduled: bool,
    ) -> Result<RecoveryReport> {
        let job = recovery_jobs::get_recovery_job(pool, job_id).await?;
        let source = nodes::get_node(pool, job.source_node_id).await?;
        let pbs = nodes::get_node(pool, job.pbs_node_id).await?;
        let dest = nodes::get_node(pool, job.dest_node_id).await?;

        recovery_jobs::try_begin(pool, job_id).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let parent_log = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id: run_id.clone(),
                job_type: "recovery".to_string(),
                job_id,
                phase: "main".to_string(),
                node_name: Some(format!("{} -> {} -> {}", source.name, pbs.name, dest.name)),
                dataset: Some(format!("vm/{}", job.vm_id)),
                message: Some("Recovery started".to_string()),
                triggered_by: triggered_by.map(|t| t.to_string()),
            },
        )
        .await?;

        let started = std::time::Instant::now();
        let mut report = RecoveryReport::default();
        let mut backup_id = job.last_backup_id.clone();

        // Phase BACKUP
        if scope != RecoveryScope::RestoreOnly {
            let phase_log = self.open_phase(pool, &run_id, &job, "backup").await?;
            let outcome = self.phase_backup(pool, &job, &source, &pbs).await;
            self.close_phase(pool, phase_log, "backup", &outcome).await?;

            if !outcome.success {
                report.failed_phase = Some("backup".to_string());
                report.error = outcome.error.clone();
                return self
                    .finalize(pool, job_id, &job, parent_log, report, started, is_scheduled)
                    .await;
            }
            backup_id = outcome.backup_id.or(backup_id);
            report.backup_id = backup_id.clone();
        }

        // Phase RESTORE
        if scope != RecoveryScope::BackupOnly {
            recovery_jobs::set_status(pool, job_id, RecoveryStatus::Restoring).await?;

            let phase_log = self.open_phase(pool, &run_id, &job, "restore").await?;
            let outcome = self
                .phase_restore(pool, &job, &pbs, &dest, backup_id.clone())
                .await;
            self.close_phase(pool, phase_log, "restore", &outcome).await?;

            if !outcome.success {
                report.failed_phase = Some("restore".to_string());
                report.error = outcome.error.clone();
                report.backup_id = backup_id;
                return self
                    .finalize(pool, job_id, &job, parent_log, report, started, is_scheduled)
                    .await;
            }
        }

        // Phase REGISTERING: reached only when the earlier phases succeeded
        recovery_jobs::set_status(pool, job_id, RecoveryStatus::Registering).await?;
        let register_log = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id: run_id.clone(),
                job_type: "recovery".to_string(),
                job_id,
                phase: "registering".to_string(),
                node_name: Some(dest.name.clone()),
                dataset: Some(format!("vm/{}", job.dest_vm_id.unwrap_or(job.vm_id))),
                message: Some("Finalizing recovery".to_string()),
                triggered_by: None,
            },
        )
        .await?;
        job_logs::complete_log(
            pool,
            register_log,
            RunStatus::Success,
            &LogCompletion {
                message: Some("Recovery registered".to_string()),
                backup_id: backup_id.clone(),
                ..Default::default()
            },
        )
        .await?;

        report.success = true;
        report.backup_id = backup_id;
        self.finalize(pool, job_id, &job, parent_log, report, started, is_scheduled)
            .await
    }

    /// Restore from an explicit PBS backup id instead of the job's most
    /// recent one; the operation handle for direct restores.
    pub async fn restore_from_backup(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        backup_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<RecoveryReport> {
        recovery_jobs::set_last_backup_id(pool, job_id, backup_id).await?;
        self.run(pool, job_id, RecoveryScope::RestoreOnly, triggered_by, false)
            .await
    }

    /// Open the log row bracketing one phase
    async fn open_phase(
        &self,
        pool: &SqlitePool,
        run_id: &str,
        job: &RecoveryJob,
        phase: &str,
    ) -> Result<i64> {
        job_logs::start_log(
            pool,
            &NewJobLog {
                run_id: run_id.to_string(),
                job_type: "recovery".to_string(),
                job_id: job.id,
                phase: phase.to_string(),
                dataset: Some(format!("vm/{}", job.vm_id)),
                ..Default::default()
            },
        )
        .await
    }

    /// Close a phase log row with the captured outcome
    async fn close_phase(
        &self,
        pool: &SqlitePool,
        log_id: i64,
        phase: &str,
        outcome: &PhaseOutcome,
    ) -> Result<()> {
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
                message: Some(format!(
                    "{} {}",
                    phase,
                    if outcome.success { "completed" } else { "failed" }
                )),
                output: Some(crate::sync::tail(&outcome.output, 200)),
                error: outcome.error.clone(),
                command: outcome.command.clone(),
                exit_code: outcome.exit_code,
                backup_id: outcome.backup_id.clone(),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }

    /// Guarantee the PBS storage alias, then `vzdump` the guest into it
    async fn phase_backup(
        &self,
        pool: &SqlitePool,
        job: &RecoveryJob,
        source: &NodeRecord,
        pbs: &NodeRecord,
    ) -> PhaseOutcome {
        let target = source.ssh_target();

        let alias = match self.resolve_storage_alias(job, pbs, &target).await {
            Ok(alias) => alias,
            Err(e) => return phase_failure(e),
        };

        let command = format!(
            "vzdump {} --mode {} --compress {} --storage {} --remove 0",
            job.vm_id,
            job.backup_mode.as_str(),
            job.backup_compress.as_str(),
            alias
        );

        let timeout = settings::get_int(pool, "pbs_backup_timeout", 7200).await;
        info!("Recovery backup for job '{}': {}", job.name, command);

        let result = match self
            .executor
            .execute(&target, &command, Duration::from_secs(timeout.max(60) as u64))
            .await
        {
            Ok(result) => result,
            Err(e) => return phase_failure(e.to_string()),
        };

        let merged = result.merged();
        let success = result.success || merged.contains("Backup job finished successfully");

        if success {
            PhaseOutcome {
                success: true,
                backup_id: parse_backup_id(&merged),
                output: merged,
                command: Some(command),
                exit_code: Some(result.exit_code as i64),
                error: None,
            }
        } else {
            PhaseOutcome {
                success: false,
                output: merged,
                error: Some(result.stderr.trim().to_string()),
                command: Some(command),
                exit_code: Some(result.exit_code as i64),
                backup_id: None,
            }
        }
    }

    /// Ensure the alias on the destination, clear a pre-existing guest when
    /// overwrite is requested, then `qmrestore`/`pct restore`.
    async fn phase_restore(
        &self,
        pool: &SqlitePool,
        job: &RecoveryJob,
        pbs: &NodeRecord,
        dest: &NodeRecord,
        backup_id: Option<String>,
    ) -> PhaseOutcome {
        let target = dest.ssh_target();
        let target_vmid = job.dest_vm_id.unwrap_or(job.vm_id);
        let tool = job.vm_type.tool();

        let alias = match self.resolve_storage_alias(job, pbs, &target).await {
            Ok(alias) => alias,
            Err(e) => return phase_failure(e),
        };

        // A full volume id carries the storage prefix (`<alias>:backup/...`);
        // anything else means "look the latest one up on the alias".
        let volid = match backup_id.filter(|id| id.contains(":backup/")) {
            Some(volid) => volid,
            None => match self.locate_latest_volid(&target, &alias, job.vm_id).await {
                Some(volid) => volid,
                None => {
                    return phase_failure(format!(
                        "No backup found for VM {} on storage {}",
                        job.vm_id, alias
                    ))
                }
            },
        };

        if job.overwrite_existing {
            let check = self
                .executor
                .execute(
                    &target,
                    &format!("{} status {} 2>/dev/null", tool, target_vmid),
                    INVENTORY_TIMEOUT,
                )
                .await;

            if matches!(&check, Ok(output) if output.success) {
                info!("Overwriting existing guest {} on {}", target_vmid, dest.name);
                let destroy = format!(
                    "{tool} stop {id} 2>/dev/null || true\nsleep 2\n{tool} destroy {id} --purge 2>/dev/null || true",
                    tool = tool,
                    id = target_vmid
                );
                let _ = self
                    .executor
                    .execute(&target, &destroy, Duration::from_secs(120))
                    .await;
            }
        }

        let mut command = match job.vm_type {
            GuestType::Qemu => format!("qmrestore {} {}", volid, target_vmid),
            GuestType::Lxc => format!("pct restore {} {}", target_vmid, volid),
        };
        if let Some(storage) = job.dest_storage.as_deref() {
            command.push_str(&format!(" --storage {}", storage));
        }
        if job.unique_ids {
            command.push_str(" --unique");
        }
        if job.start_after {
            command.push_str(" --start");
        }

        let timeout = settings::get_int(pool, "pbs_restore_timeout", 7200).await;
        info!("Recovery restore for job '{}': {}", job.name, command);

        let result = match self
            .executor
            .execute(&target, &command, Duration::from_secs(timeout.max(60) as u64))
            .await
        {
            Ok(result) => result,
            Err(e) => return phase_failure(e.to_string()),
        };

        if !result.success && !result.stdout.to_lowercase().contains("successfully") {
            return PhaseOutcome {
                success: false,
                output: result.merged(),
                error: Some(result.stderr.trim().to_string()),
                command: Some(command),
                exit_code: Some(result.exit_code as i64),
                backup_id: Some(volid),
            };
        }

        if let Some(suffix) = job.dest_vm_name_suffix.as_deref() {
            self.apply_name_suffix(&target, job.vm_type, target_vmid, suffix)
                .await;
        }

        PhaseOutcome {
            success: true,
            output: result.merged(),
            error: None,
            command: Some(command),
            exit_code: Some(result.exit_code as i64),
            backup_id: Some(volid),
        }
    }

    /// A pre-configured alias must exist; otherwise `pbs-<datastore>` is
    /// created on demand with the PBS node's credentials.
    async fn resolve_storage_alias(
        &self,
        job: &RecoveryJob,
        pbs: &NodeRecord,
        node: &SshTarget,
    ) -> std::result::Result<String, String> {
        if let Some(alias) = job.pbs_storage_id.as_deref() {
            let check = format!("pvesm status 2>/dev/null | grep -q '^{} '", alias);
            match self.executor.execute(node, &check, INVENTORY_TIMEOUT).await {
                Ok(output) if output.exit_code == 0 => return Ok(alias.to_string()),
                Ok(_) => {
                    return Err(format!("PBS storage '{}' not found on {}", alias, node.host))
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        let alias = format!("pbs-{}", job.datastore);
        let check = format!("pvesm status 2>/dev/null | grep -q '^{} '", alias);
        match self.executor.execute(node, &check, INVENTORY_TIMEOUT).await {
            Ok(output) if output.exit_code == 0 => return Ok(alias),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }

        info!("Creating PBS storage {} on {}", alias, node.host);
        let username = pbs.pbs_username.as_deref().unwrap_or("root@pam");
        let mut add = format!(
            "pvesm add pbs {} --server {} --datastore {} --username {} --content backup",
            alias, pbs.hostname, job.datastore, username
        );
        if let Some(fingerprint) = pbs.pbs_fingerprint.as_deref() {
            add.push_str(&format!(" --fingerprint {}", fingerprint));
        }
        if let Some(password) = pbs.pbs_password.as_deref() {
            add.push_str(&format!(" --password {}", password));
        }

        match self
            .executor
            .execute(node, &add, Duration::from_secs(60))
            .await
        {
            Ok(output) if output.success => Ok(alias),
            Ok(output) => Err(format!(
                "Failed to create PBS storage {}: {}",
                alias,
                output.stderr.trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Newest backup volume of a VM on the alias, via `pvesm list`
    async fn locate_latest_volid(
        &self,
        node: &SshTarget,
        alias: &str,
        vm_id: u32,
    ) -> Option<String> {
        let cmd = format!(
            "pvesm list {} --vmid {} 2>/dev/null | tail -n +2 | sort -k5 -r | head -1",
            alias, vm_id
        );

        match self.executor.execute(node, &cmd, INVENTORY_TIMEOUT).await {
            Ok(output) if output.success => output
                .stdout
                .split_whitespace()
                .next()
                .map(|v| v.to_string()),
            _ => None,
        }
    }

    /// Rename the restored guest unless the suffix is already present
    async fn apply_name_suffix(
        &self,
        node: &SshTarget,
        vm_type: GuestType,
        vm_id: u32,
        suffix: &str,
    ) {
        let tool = vm_type.tool();
        let key = match vm_type {
            GuestType::Qemu => "name",
            GuestType::Lxc => "hostname",
        };

        let get = format!(
            "{} config {} 2>/dev/null | grep '^{}:' | cut -d' ' -f2",
            tool, vm_id, key
        );
        let current = match self.executor.execute(node, &get, INVENTORY_TIMEOUT).await {
            Ok(output) if output.success => output.stdout.trim().to_string(),
            _ => return,
        };

        if current.is_empty() || current.contains(suffix) {
            return;
        }

        let new_name = format!("{}{}", current, suffix);
        let set = format!("{} set {} --{} '{}'", tool, vm_id, key, new_name);
        if let Ok(output) = self.executor.execute(node, &set, INVENTORY_TIMEOUT).await {
            if output.success {
                info!("Guest {} renamed to {}", vm_id, new_name);
            }
        }
    }

    /// Close the run: final state, statistics, parent log and notification
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        job: &RecoveryJob,
        parent_log: i64,
        mut report: RecoveryReport,
        started: std::time::Instant,
        is_scheduled: bool,
    ) -> Result<RecoveryReport> {
        report.duration_seconds = started.elapsed().as_secs() as i64;

        recovery_jobs::finish_run(
            pool,
            job_id,
            report.success,
            report.duration_seconds,
            report.backup_id.as_deref(),
        )
        .await?;

        let status = if report.success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let message = match (&report.failed_phase, report.success) {
            (_, true) => "Recovery completed".to_string(),
            (Some(phase), false) => format!("Recovery failed in phase {}", phase),
            (None, false) => "Recovery failed".to_string(),
        };

        job_logs::complete_log(
            pool,
            parent_log,
            status,
            &LogCompletion {
                message: Some(message.clone()),
                error: report.error.clone(),
                backup_id: report.backup_id.clone(),
                ..Default::default()
            },
        )
        .await?;

        if !report.success {
            error!("Recovery job {} failed: {}", job.name, message);
        }

        let source_label = format!("node {} vm {}", job.source_node_id, job.vm_id);
        let dest_label = format!(
            "node {} vm {}",
            job.dest_node_id,
            job.dest_vm_id.unwrap_or(job.vm_id)
        );
        self.notifier.send_job_notification(&JobNotification {
            job_name: job.name.clone(),
            job_type: "recovery".to_string(),
            job_id,
            status: status.as_str().to_string(),
            source: source_label,
            destination: dest_label,
            duration_seconds: report.duration_seconds,
            error: report.error.clone(),
            transferred: None,
            details: report.backup_id.as_ref().map(|id| format!("Backup: {}", id)),
            is_scheduled,
            notify_mode: job.notify_mode,
        });

        Ok(report)
    }
}

fn phase_failure(error: impl Into<String>) -> PhaseOutcome {
    PhaseOutcome {
        success: false,
        error: Some(error.into()),
        ..Default::default()
    }
}

/// Extract the backup identifier from vzdump output. Absence is tolerated;
/// the restore phase can fall back to a `pvesm list` lookup.
pub fn parse_backup_id(output: &str) -> Option<String> {
    BACKUP_ID_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(output))
        .map(|caps| caps.get(1).unwrap().as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backup_id_pbs_style() {
        let output = "INFO: starting new backup job\n\
                      INFO: creating Proxmox Backup Server archive 'vm/110/2025-01-01T00:00:00Z'\n\
                      INFO: backup 'vm/110/2025-01-01T00:00:00Z' successful\n";
        assert_eq!(
            parse_backup_id(output),
            Some("vm/110/2025-01-01T00:00:00Z".to_string())
        );
    }

    #[test]
    fn test_parse_backup_id_archive_style() {
        let output =
            "INFO: creating vzdump archive '/var/lib/vz/dump/vzdump-qemu-110-2025_01_01.vma.zst'\n";
        assert_eq!(
            parse_backup_id(output),
            Some("/var/lib/vz/dump/vzdump-qemu-110-2025_01_01.vma.zst".to_string())
        );
    }

    #[test]
    fn test_parse_backup_id_bare_timestamp_path() {
        let output = "INFO: Starting Backup of VM 110\nINFO: vm/110/2025-06-30T23:59:59Z created\n";
        assert_eq!(
            parse_backup_id(output),
            Some("vm/110/2025-06-30T23:59:59Z".to_string())
        );
    }

    #[test]
    fn test_parse_backup_id_none() {
        assert_eq!(parse_backup_id("INFO: nothing to see"), None);
        assert_eq!(parse_backup_id(""), None);
    }
}
