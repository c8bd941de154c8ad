//! Node probe
//!
//! Classifies a node (PVE vs PBS), detects installed tooling and tracks
//! online state. Probing never fails the operation that triggered it; a
//! connection failure only records `is_online = false`.

use crate::db::nodes::{self, NodeRecord, ProbeUpdate};
use crate::ssh::{SshExecutor, PROBE_TIMEOUT};
use proxrepl_common::{NodeKind, Result};
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::LazyLock;
use tracing::{debug, warn};

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").unwrap());

/// One capability script, one round-trip: each line is `key=value` with an
/// empty value when the tool is absent.
const CAPABILITY_SCRIPT: &str = r#"echo "pve=$(pveversion 2>/dev/null | head -1)"
echo "pbs_server=$(proxmox-backup-manager version 2>/dev/null | head -1)"
echo "pbs_client=$(proxmox-backup-client version 2>/dev/null | head -1)"
echo "sanoid=$(sanoid --version 2>/dev/null | head -1)"
echo "btrfs=$(btrfs --version 2>/dev/null | head -1)""#;

/// What the probe observed on a node
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub is_online: bool,
    pub detected_type: Option<NodeKind>,
    pub has_sanoid: bool,
    pub has_btrfs: bool,
    pub has_pbs_client: bool,
    pub has_pbs_server: bool,
    pub pve_version: Option<String>,
    pub pbs_version: Option<String>,
    pub btrfs_mount_ok: Option<bool>,
    pub error: Option<String>,
}

/// Probes nodes and writes capability flags back to the store
pub struct NodeProbe {
    executor: std::sync::Arc<SshExecutor>,
}

impl NodeProbe {
    pub fn new(executor: std::sync::Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Probe a node and persist the result. Last-writer-wins on the
    /// capability fields; every field is re-derived by the next probe.
    pub async fn probe_and_record(&self, pool: &SqlitePool, node: &NodeRecord) -> Result<ProbeReport> {
        let report = self.probe(node).await;

        nodes::update_probe_result(
            pool,
            node.id,
            &ProbeUpdate {
                is_online: report.is_online,
                node_type: report.detected_type,
                has_sanoid: report.has_sanoid,
                has_btrfs: report.has_btrfs,
                has_pbs_client: report.has_pbs_client,
                has_pbs_server: report.has_pbs_server,
            },
        )
        .await?;

        Ok(report)
    }

    /// Run the connectivity test and the capability script
    pub async fn probe(&self, node: &NodeRecord) -> ProbeReport {
        let target = node.ssh_target();

        let output = match self.executor.execute(&target, CAPABILITY_SCRIPT, PROBE_TIMEOUT).await {
            Ok(output) if output.success => output,
            Ok(output) => {
                warn!("Probe of {} failed: {}", node.name, output.stderr.trim());
                return ProbeReport {
                    is_online: false,
                    error: Some(output.stderr.trim().to_string()),
                    ..Default::default()
                };
            }
            Err(e) => {
                warn!("Probe of {} failed: {}", node.name, e);
                return ProbeReport {
                    is_online: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let mut report = parse_capability_output(&output.stdout);
        report.is_online = true;

        // A configured BTRFS mount must actually be btrfs
        if report.has_btrfs {
            if let Some(mount) = node.btrfs_mount.as_deref() {
                let mount_ok = self.check_btrfs_mount(node, mount).await;
                report.btrfs_mount_ok = Some(mount_ok);
                if !mount_ok {
                    report.has_btrfs = false;
                }
            }
        }

        debug!(
            "Probe of {}: type={:?} sanoid={} btrfs={} pbs_client={} pbs_server={}",
            node.name,
            report.detected_type,
            report.has_sanoid,
            report.has_btrfs,
            report.has_pbs_client,
            report.has_pbs_server
        );

        report
    }

    async fn check_btrfs_mount(&self, node: &NodeRecord, mount: &str) -> bool {
        if crate::validation::validate_subvolume_path(mount).is_err() {
            return false;
        }

        let cmd = format!("df -T '{}' 2>/dev/null | tail -1 | awk '{{print $2}}'", mount);
        match self
            .executor
            .execute(&node.ssh_target(), &cmd, PROBE_TIMEOUT)
            .await
        {
            Ok(output) if output.success => output.stdout.trim() == "btrfs",
            _ => false,
        }
    }
}

/// Parse the `key=value` lines of the capability script
pub fn parse_capability_output(stdout: &str) -> ProbeReport {
    let mut report = ProbeReport::default();

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let present = !value.is_empty();

        match key {
            "pve" => {
                if present {
                    report.pve_version = extract_version(value);
                    report.detected_type = Some(NodeKind::Pve);
                }
            }
            "pbs_server" => {
                report.has_pbs_server = present;
                if present {
                    report.pbs_version = extract_version(value);
                    if report.detected_type.is_none() {
                        report.detected_type = Some(NodeKind::Pbs);
                    }
                }
            }
            "pbs_client" => report.has_pbs_client = present,
            "sanoid" => report.has_sanoid = present,
            "btrfs" => report.has_btrfs = present,
            _ => {}
        }
    }

    report
}

fn extract_version(text: &str) -> Option<String> {
    VERSION_REGEX
        .captures(text)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}
