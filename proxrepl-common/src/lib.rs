//! Common types and error taxonomy shared between the proxrepl engine and
//! any frontends built on top of it.

use serde::{Deserialize, Serialize};

/// Kind of managed remote node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Proxmox Virtual Environment hypervisor
    Pve,
    /// Proxmox Backup Server
    Pbs,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Pve => "pve",
            NodeKind::Pbs => "pbs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pve" => Some(NodeKind::Pve),
            "pbs" => Some(NodeKind::Pbs),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest type on a PVE node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    /// The CLI tool managing this guest type (`qm` or `pct`)
    pub fn tool(&self) -> &'static str {
        match self {
            GuestType::Qemu => "qm",
            GuestType::Lxc => "pct",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestType::Qemu => "qemu",
            GuestType::Lxc => "lxc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qemu" => Some(GuestType::Qemu),
            "lxc" => Some(GuestType::Lxc),
            _ => None,
        }
    }
}

impl std::fmt::Display for GuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication method of a sync job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    ZfsSyncoid,
    BtrfsSend,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::ZfsSyncoid => "zfs_syncoid",
            SyncMethod::BtrfsSend => "btrfs_send",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zfs_syncoid" => Some(SyncMethod::ZfsSyncoid),
            "btrfs_send" => Some(SyncMethod::BtrfsSend),
            _ => None,
        }
    }
}

/// Migration job sub-mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// vzdump + transfer + restore; the source guest is left in place
    Copy,
    /// Cluster-native `qm migrate` / `pct migrate`
    Move,
}

impl MigrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationMode::Copy => "copy",
            MigrationMode::Move => "move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "copy" => Some(MigrationMode::Copy),
            "move" => Some(MigrationMode::Move),
            _ => None,
        }
    }
}

/// vzdump backup mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Snapshot,
    Stop,
    Suspend,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Snapshot => "snapshot",
            BackupMode::Stop => "stop",
            BackupMode::Suspend => "suspend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot" => Some(BackupMode::Snapshot),
            "stop" => Some(BackupMode::Stop),
            "suspend" => Some(BackupMode::Suspend),
            _ => None,
        }
    }
}

/// vzdump compression algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupCompression {
    None,
    Lzo,
    Gzip,
    Zstd,
}

impl BackupCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCompression::None => "none",
            BackupCompression::Lzo => "lzo",
            BackupCompression::Gzip => "gzip",
            BackupCompression::Zstd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" | "0" => Some(BackupCompression::None),
            "lzo" => Some(BackupCompression::Lzo),
            "gzip" | "1" => Some(BackupCompression::Gzip),
            "zstd" => Some(BackupCompression::Zstd),
            _ => None,
        }
    }
}

/// When a completed run produces a notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    Always,
    Failure,
    #[default]
    Daily,
    Never,
}

impl NotifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyMode::Always => "always",
            NotifyMode::Failure => "failure",
            NotifyMode::Daily => "daily",
            NotifyMode::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(NotifyMode::Always),
            "failure" => Some(NotifyMode::Failure),
            "daily" => Some(NotifyMode::Daily),
            "never" => Some(NotifyMode::Never),
            _ => None,
        }
    }
}

/// Live state of a PBS recovery job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    #[default]
    Pending,
    BackingUp,
    Restoring,
    Registering,
    Completed,
    Failed,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Pending => "pending",
            RecoveryStatus::BackingUp => "backing_up",
            RecoveryStatus::Restoring => "restoring",
            RecoveryStatus::Registering => "registering",
            RecoveryStatus::Completed => "completed",
            RecoveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecoveryStatus::Pending),
            "backing_up" => Some(RecoveryStatus::BackingUp),
            "restoring" => Some(RecoveryStatus::Restoring),
            "registering" => Some(RecoveryStatus::Registering),
            "completed" => Some(RecoveryStatus::Completed),
            "failed" => Some(RecoveryStatus::Failed),
            _ => None,
        }
    }

    /// Only `pending`, `completed` and `failed` allow starting a new run
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecoveryStatus::BackingUp | RecoveryStatus::Restoring | RecoveryStatus::Registering
        )
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status attached to a job log row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Running,
    Success,
    Failed,
    PendingConfirmation,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::PendingConfirmation => "pending_confirmation",
        }
    }
}

/// Engine error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote command failed: {0}")]
    RemoteTool(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for (s, k) in [("pve", NodeKind::Pve), ("pbs", NodeKind::Pbs)] {
            assert_eq!(NodeKind::parse(s), Some(k));
            assert_eq!(k.as_str(), s);
        }

        for s in ["zfs_syncoid", "btrfs_send"] {
            assert_eq!(SyncMethod::parse(s).unwrap().as_str(), s);
        }

        for s in ["pending", "backing_up", "restoring", "registering", "completed", "failed"] {
            assert_eq!(RecoveryStatus::parse(s).unwrap().as_str(), s);
        }

        for s in ["always", "failure", "daily", "never"] {
            assert_eq!(NotifyMode::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_guest_type_tool() {
        assert_eq!(GuestType::Qemu.tool(), "qm");
        assert_eq!(GuestType::Lxc.tool(), "pct");
    }

    #[test]
    fn test_recovery_transient_states() {
        assert!(!RecoveryStatus::Pending.is_transient());
        assert!(RecoveryStatus::BackingUp.is_transient());
        assert!(RecoveryStatus::Restoring.is_transient());
        assert!(RecoveryStatus::Registering.is_transient());
        assert!(!RecoveryStatus::Completed.is_transient());
        assert!(!RecoveryStatus::Failed.is_transient());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&NodeKind::Pve).unwrap();
        assert_eq!(json, "\"pve\"");
        let json = serde_json::to_string(&RecoveryStatus::BackingUp).unwrap();
        assert_eq!(json, "\"backing_up\"");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Conflict("job already running".to_string());
        assert_eq!(err.to_string(), "Conflict: job already running");
        let err = Error::Validation("invalid cron".to_string());
        assert!(err.to_string().contains("invalid cron"));
    }
}
