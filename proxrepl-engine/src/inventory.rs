//! Remote inventory
//!
//! Read-only observation of datasets, snapshots, guests, storages and host
//! metrics, composed on top of the SSH executor. Every parser tolerates
//! locale variance and empty output; batch queries run as a single remote
//! pipeline per node, not one round-trip per guest.

use crate::db::nodes::NodeRecord;
use crate::ssh::{SshExecutor, INVENTORY_TIMEOUT};
use proxrepl_common::{Error, GuestType, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Storage types that are shared between cluster nodes; global roll-ups
/// count their capacity once.
pub const SHARED_STORAGE_TYPES: &[&str] = &["nfs", "cifs", "pbs", "glusterfs", "cephfs", "rbd"];

/// Fallback when `pvesh get /cluster/nextid` is unavailable
pub const FALLBACK_VMID: u32 = 100;

static DISK_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^((?:scsi|sata|virtio|ide)\d+|rootfs|mp\d+):\s*(.+)$").unwrap()
});

static SIZE_FIELD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"size=(\d+(?:\.\d+)?)([MGT]?)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub mountpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub dataset: String,
    pub name: String,
    pub full_name: String,
    pub used_bytes: u64,
    pub creation: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestInfo {
    pub vm_id: u32,
    pub name: String,
    pub status: String,
    pub guest_type: GuestType,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmDetails {
    pub vm_id: u32,
    pub status: Option<String>,
    pub name: Option<String>,
    pub config: Option<String>,
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub name: String,
    pub storage_type: String,
    pub status: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: Option<f64>,
    pub content: String,
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDiskInfo {
    pub disk: String,
    pub storage: Option<String>,
    pub size_gb: Option<f64>,
    pub spec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmidAvailability {
    pub vm_id: u32,
    pub available: bool,
    pub in_use_by: Option<GuestInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostMetrics {
    pub hostname: String,
    pub kernel: String,
    pub cpu_count: u32,
    pub load_1m: f64,
    pub memory_total_kb: u64,
    pub memory_available_kb: u64,
    pub uptime_seconds: u64,
}

/// Read-only observation operations against a node
pub struct RemoteInventory {
    executor: Arc<SshExecutor>,
}

impl RemoteInventory {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// `zfs list -H -p -o name,used,avail,mountpoint`
    pub async fn list_datasets(&self, node: &NodeRecord) -> Result<Vec<DatasetInfo>> {
        let output = self
            .executor
            .execute(
                &node.ssh_target(),
                "zfs list -H -p -o name,used,avail,mountpoint 2>/dev/null",
                INVENTORY_TIMEOUT,
            )
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "zfs list failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(parse_zfs_list(&output.stdout))
    }

    /// `zfs list -t snapshot -H -p -o name,used,creation`, sorted by
    /// creation ascending.
    pub async fn list_snapshots(
        &self,
        node: &NodeRecord,
        dataset: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>> {
        let cmd = match dataset {
            Some(dataset) => {
                crate::validation::validate_dataset(dataset)?;
                format!(
                    "zfs list -t snapshot -H -p -o name,used,creation -r '{}' 2>/dev/null",
                    dataset
                )
            }
            None => "zfs list -t snapshot -H -p -o name,used,creation 2>/dev/null".to_string(),
        };

        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, INVENTORY_TIMEOUT)
            .await?;

        // An empty snapshot list exits zero with no output; a missing dataset
        // is a real error.
        if !output.success && !output.stdout.trim().is_empty() {
            return Err(Error::RemoteTool(format!(
                "zfs snapshot list failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(parse_zfs_snapshots(&output.stdout))
    }

    /// Combine `qm list` and `pct list`, annotating each guest with its type
    pub async fn list_guests(&self, node: &NodeRecord) -> Result<Vec<GuestInfo>> {
        let output = self
            .executor
            .execute(
                &node.ssh_target(),
                "qm list 2>/dev/null; echo '---PCT---'; pct list 2>/dev/null",
                INVENTORY_TIMEOUT,
            )
            .await?;

        let (qm_part, pct_part) = output
            .stdout
            .split_once("---PCT---")
            .unwrap_or((output.stdout.as_str(), ""));

        let mut guests = parse_qm_list(qm_part);
        guests.extend(parse_pct_list(pct_part));
        guests.sort_by_key(|g| g.vm_id);

        Ok(guests)
    }

    /// Aggregate status, config and (for QEMU guests with a running agent)
    /// IP addresses. Inner failures collapse to "no data for that field".
    pub async fn get_vm_full_details(
        &self,
        node: &NodeRecord,
        vm_id: u32,
        guest_type: GuestType,
    ) -> Result<VmDetails> {
        crate::validation::validate_vmid(vm_id)?;
        let tool = guest_type.tool();
        let target = node.ssh_target();

        let mut details = VmDetails {
            vm_id,
            ..Default::default()
        };

        if let Ok(output) = self
            .executor
            .execute(&target, &format!("{} status {} 2>/dev/null", tool, vm_id), INVENTORY_TIMEOUT)
            .await
        {
            if output.success {
                details.status = parse_guest_status(&output.stdout);
            }
        }

        if let Ok(output) = self
            .executor
            .execute(&target, &format!("{} config {} 2>/dev/null", tool, vm_id), INVENTORY_TIMEOUT)
            .await
        {
            if output.success && !output.stdout.trim().is_empty() {
                details.name = parse_guest_name(&output.stdout, guest_type);
                details.config = Some(output.stdout);
            }
        }

        if guest_type == GuestType::Qemu {
            if let Ok(output) = self
                .executor
                .execute(
                    &target,
                    &format!("qm agent {} network-get-interfaces 2>/dev/null", vm_id),
                    INVENTORY_TIMEOUT,
                )
                .await
            {
                if output.success {
                    details.ip_addresses = parse_agent_interfaces(&output.stdout);
                }
            }
        }

        Ok(details)
    }

    /// `pvesm status --output-format json` with textual fallback
    pub async fn list_storages(&self, node: &NodeRecord) -> Result<Vec<StorageInfo>> {
        let target = node.ssh_target();

        let output = self
            .executor
            .execute(
                &target,
                "pvesm status --output-format json 2>/dev/null",
                INVENTORY_TIMEOUT,
            )
            .await?;

        if output.success && !output.stdout.trim().is_empty() {
            if let Some(storages) = parse_pvesm_json(&output.stdout) {
                return Ok(storages);
            }
            debug!("pvesm JSON parse failed on {}, falling back to text", node.name);
        }

        let output = self
            .executor
            .execute(&target, "pvesm status 2>/dev/null", INVENTORY_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "pvesm status failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(parse_pvesm_text(&output.stdout))
    }

    /// Disk lines of a guest config: `scsiN | sataN | virtioN | ideN | rootfs | mpN`
    pub async fn list_vm_disks(
        &self,
        node: &NodeRecord,
        vm_id: u32,
        guest_type: GuestType,
    ) -> Result<Vec<VmDiskInfo>> {
        crate::validation::validate_vmid(vm_id)?;

        let output = self
            .executor
            .execute(
                &node.ssh_target(),
                &format!("{} config {} 2>/dev/null", guest_type.tool(), vm_id),
                INVENTORY_TIMEOUT,
            )
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Guest {} config not readable on {}",
                vm_id, node.name
            )));
        }

        Ok(parse_vm_disks(&output.stdout))
    }

    /// `pvesh get /cluster/nextid`; falls back to a constant when the
    /// cluster API is unavailable.
    pub async fn next_vmid(&self, node: &NodeRecord) -> u32 {
        let result = self
            .executor
            .execute(
                &node.ssh_target(),
                "pvesh get /cluster/nextid 2>/dev/null",
                INVENTORY_TIMEOUT,
            )
            .await;

        match result {
            Ok(output) if output.success => output
                .stdout
                .trim()
                .trim_matches('"')
                .parse()
                .unwrap_or(FALLBACK_VMID),
            _ => FALLBACK_VMID,
        }
    }

    /// Check both guest families for an occupied VMID
    pub async fn check_vmid_available(
        &self,
        node: &NodeRecord,
        vm_id: u32,
    ) -> Result<VmidAvailability> {
        crate::validation::validate_vmid(vm_id)?;
        let target = node.ssh_target();

        for guest_type in [GuestType::Qemu, GuestType::Lxc] {
            let cmd = format!("{} status {} 2>/dev/null", guest_type.tool(), vm_id);
            let output = self.executor.execute(&target, &cmd, INVENTORY_TIMEOUT).await?;

            if output.success {
                let status = parse_guest_status(&output.stdout).unwrap_or_else(|| "unknown".to_string());
                let name = self
                    .get_vm_name(node, vm_id, guest_type)
                    .await
                    .unwrap_or_else(|_| format!("vm-{}", vm_id));

                return Ok(VmidAvailability {
                    vm_id,
                    available: false,
                    in_use_by: Some(GuestInfo {
                        vm_id,
                        name,
                        status,
                        guest_type,
                    }),
                });
            }
        }

        Ok(VmidAvailability {
            vm_id,
            available: true,
            in_use_by: None,
        })
    }

    /// Guest display name from its config; falls back to `vm-<id>`
    pub async fn get_vm_name(
        &self,
        node: &NodeRecord,
        vm_id: u32,
        guest_type: GuestType,
    ) -> Result<String> {
        let output = self
            .executor
            .execute(
                &node.ssh_target(),
                &format!("{} config {} 2>/dev/null", guest_type.tool(), vm_id),
                INVENTORY_TIMEOUT,
            )
            .await?;

        if output.success {
            if let Some(name) = parse_guest_name(&output.stdout, guest_type) {
                return Ok(name);
            }
        }

        Ok(format!("vm-{}", vm_id))
    }

    /// Batch host metrics: one remote pipeline emitting a single
    /// pipe-delimited line, parsed locally.
    pub async fn get_host_metrics(&self, node: &NodeRecord) -> Result<HostMetrics> {
        let script = "echo \"$(hostname)|$(uname -r)|$(nproc)|$(cut -d' ' -f1 /proc/loadavg)|\
$(awk '/MemTotal/ {print $2}' /proc/meminfo)|$(awk '/MemAvailable/ {print $2}' /proc/meminfo)|\
$(cut -d. -f1 /proc/uptime)\"";

        let output = self
            .executor
            .execute(&node.ssh_target(), script, INVENTORY_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Metrics collection failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        parse_host_metrics(&output.stdout).ok_or_else(|| {
            Error::RemoteTool(format!("Unparseable metrics line from {}", node.name))
        })
    }
}

pub fn parse_zfs_list(stdout: &str) -> Vec<DatasetInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split('\t').collect();
            if parts.len() < 4 {
                return None;
            }
            Some(DatasetInfo {
                name: parts[0].to_string(),
                used_bytes: parts[1].parse().unwrap_or(0),
                available_bytes: parts[2].parse().unwrap_or(0),
                mountpoint: match parts[3] {
                    "-" | "none" => None,
                    other => Some(other.to_string()),
                },
            })
        })
        .collect()
}

pub fn parse_zfs_snapshots(stdout: &str) -> Vec<SnapshotInfo> {
    let mut snapshots: Vec<SnapshotInfo> = stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split('\t').collect();
            if parts.len() < 3 {
                return None;
            }

            let full_name = parts[0].to_string();
            let (dataset, name) = full_name.split_once('@')?;

            Some(SnapshotInfo {
                dataset: dataset.to_string(),
                name: name.to_string(),
                full_name: full_name.clone(),
                used_bytes: parts[1].parse().unwrap_or(0),
                creation: parse_creation(parts[2]),
            })
        })
        .collect();

    snapshots.sort_by(|a, b| a.creation.cmp(&b.creation).then(a.full_name.cmp(&b.full_name)));
    snapshots
}

/// Creation is epoch seconds under `-p`; tolerate the locale-formatted
/// variant as well.
fn parse_creation(value: &str) -> i64 {
    if let Ok(epoch) = value.trim().parse::<i64>() {
        return epoch;
    }

    chrono::NaiveDateTime::parse_from_str(value.trim(), "%a %b %e %H:%M %Y")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

pub fn parse_qm_list(stdout: &str) -> Vec<GuestInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            let vm_id: u32 = parts[0].parse().ok()?;

            Some(GuestInfo {
                vm_id,
                name: parts[1].to_string(),
                status: parts[2].to_lowercase(),
                guest_type: GuestType::Qemu,
            })
        })
        .collect()
}

pub fn parse_pct_list(stdout: &str) -> Vec<GuestInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split_whitespace().collect();
            if parts.len() < 2 {
                return None;
            }
            let vm_id: u32 = parts[0].parse().ok()?;

            // Columns are VMID, Status, [Lock,] Name; the name is last
            Some(GuestInfo {
                vm_id,
                name: parts.last().unwrap().to_string(),
                status: parts[1].to_lowercase(),
                guest_type: GuestType::Lxc,
            })
        })
        .collect()
}

pub fn parse_guest_status(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("status:"))
        .map(|s| s.trim().to_string())
}

pub fn parse_guest_name(config: &str, guest_type: GuestType) -> Option<String> {
    let key = match guest_type {
        GuestType::Qemu => "name:",
        GuestType::Lxc => "hostname:",
    };

    config
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Guest-agent interface dump -> non-loopback IPv4/IPv6 addresses
pub fn parse_agent_interfaces(stdout: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return Vec::new();
    };

    // Either a bare array or {"result": [...]}
    let interfaces = value
        .get("result")
        .and_then(|r| r.as_array())
        .or_else(|| value.as_array())
        .cloned()
        .unwrap_or_default();

    let mut addresses = Vec::new();
    for iface in interfaces {
        let name = iface.get("name").and_then(|n| n.as_str()).unwrap_or("");
        if name == "lo" {
            continue;
        }
        let Some(ips) = iface.get("ip-addresses").and_then(|a| a.as_array()) else {
            continue;
        };
        for ip in ips {
            if let Some(addr) = ip.get("ip-address").and_then(|a| a.as_str()) {
                if addr != "127.0.0.1" && addr != "::1" {
                    addresses.push(addr.to_string());
                }
            }
        }
    }

    addresses
}

pub fn parse_pvesm_json(stdout: &str) -> Option<Vec<StorageInfo>> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let list = value.as_array()?;

    let storages = list
        .iter()
        .filter_map(|entry| {
            let name = entry.get("storage").or_else(|| entry.get("name"))?.as_str()?;
            let storage_type = entry.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let total = entry.get("total").and_then(json_u64).unwrap_or(0);
            let used = entry.get("used").and_then(json_u64).unwrap_or(0);
            let available = entry
                .get("avail")
                .and_then(json_u64)
                .unwrap_or_else(|| total.saturating_sub(used));

            Some(StorageInfo {
                name: name.to_string(),
                storage_type: storage_type.to_string(),
                status: entry
                    .get("active")
                    .and_then(|a| a.as_i64())
                    .map(|a| if a == 1 { "active" } else { "inactive" })
                    .unwrap_or("unknown")
                    .to_string(),
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                used_percent: if total > 0 {
                    Some((used as f64 / total as f64) * 100.0)
                } else {
                    None
                },
                content: entry
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
                shared: SHARED_STORAGE_TYPES.contains(&storage_type),
            })
        })
        .collect();

    Some(storages)
}

pub fn parse_pvesm_text(stdout: &str) -> Vec<StorageInfo> {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

    // Skip header
    lines
        .iter()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<_> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }

            let storage_type = parts[1].to_string();
            let total: u64 = parts[3].parse().unwrap_or(0);
            let used: u64 = parts[4].parse().unwrap_or(0);
            let available: u64 = parts[5].parse().unwrap_or(0);

            Some(StorageInfo {
                name: parts[0].to_string(),
                shared: SHARED_STORAGE_TYPES.contains(&storage_type.as_str()),
                storage_type,
                status: parts[2].to_lowercase(),
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                used_percent: if total > 0 {
                    Some((used as f64 / total as f64) * 100.0)
                } else {
                    None
                },
                content: String::new(),
            })
        })
        .collect()
}

fn json_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

pub fn parse_vm_disks(config: &str) -> Vec<VmDiskInfo> {
    DISK_LINE_REGEX
        .captures_iter(config)
        .filter_map(|caps| {
            let disk = caps.get(1).unwrap().as_str().to_string();
            let spec = caps.get(2).unwrap().as_str().trim().to_string();

            // Skip optical drives
            if spec.contains("media=cdrom") {
                return None;
            }

            let storage = spec
                .split(',')
                .next()
                .and_then(|volume| volume.split(':').next())
                .filter(|s| !s.is_empty() && !s.starts_with('/'))
                .map(|s| s.to_string());

            let size_gb = SIZE_FIELD_REGEX.captures(&spec).and_then(|size_caps| {
                let value: f64 = size_caps.get(1).unwrap().as_str().parse().ok()?;
                Some(match size_caps.get(2).unwrap().as_str() {
                    "M" => value / 1024.0,
                    "T" => value * 1024.0,
                    _ => value,
                })
            });

            Some(VmDiskInfo {
                disk,
                storage,
                size_gb,
                spec,
            })
        })
        .collect()
}

pub fn parse_host_metrics(stdout: &str) -> Option<HostMetrics> {
    let line = stdout.lines().find(|l| l.contains('|'))?;
    let parts: Vec<_> = line.split('|').collect();
    if parts.len() < 7 {
        return None;
    }

    Some(HostMetrics {
        hostname: parts[0].trim().to_string(),
        kernel: parts[1].trim().to_string(),
        cpu_count: parts[2].trim().parse().unwrap_or(0),
        load_1m: parts[3].trim().parse().unwrap_or(0.0),
        memory_total_kb: parts[4].trim().parse().unwrap_or(0),
        memory_available_kb: parts[5].trim().parse().unwrap_or(0),
        uptime_seconds: parts[6].trim().parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zfs_list() {
        let stdout = "rpool\t10737418240\t96636764160\t/rpool\n\
                      rpool/data\t5368709120\t96636764160\t/rpool/data\n\
                      rpool/swap\t1073741824\t96636764160\t-\n";

        let datasets = parse_zfs_list(stdout);
        assert_eq!(datasets.len(), 3);
        assert_eq!(datasets[0].name, "rpool");
        assert_eq!(datasets[1].used_bytes, 5368709120);
        assert!(datasets[2].mountpoint.is_none());
    }

    #[test]
    fn test_parse_zfs_snapshots_sorted_ascending() {
        let stdout = "rpool/data/vm-100-disk-0@syncoid_pve1_2025-01-02\t8192\t1735776000\n\
                      rpool/data/vm-100-disk-0@syncoid_pve1_2025-01-01\t8192\t1735689600\n\
                      rpool/data/vm-100-disk-0@autosnap_2025-01-03\t0\t1735862400\n";

        let snapshots = parse_zfs_snapshots(stdout);
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].name, "syncoid_pve1_2025-01-01");
        assert_eq!(snapshots[2].name, "autosnap_2025-01-03");
        assert_eq!(snapshots[0].dataset, "rpool/data/vm-100-disk-0");
        assert!(snapshots.windows(2).all(|w| w[0].creation <= w[1].creation));
    }

    #[test]
    fn test_parse_zfs_snapshots_empty_and_garbage() {
        assert!(parse_zfs_snapshots("").is_empty());
        assert!(parse_zfs_snapshots("no snapshots here\n").is_empty());
        // A row without '@' is dropped
        assert!(parse_zfs_snapshots("rpool/data\t0\t1735689600\n").is_empty());
    }

    #[test]
    fn test_parse_creation_locale_fallback() {
        assert_eq!(parse_creation("1735689600"), 1735689600);
        assert!(parse_creation("Wed Jan  1 00:00 2025") > 0);
        assert_eq!(parse_creation("garbage"), 0);
    }

    #[test]
    fn test_parse_qm_list() {
        let stdout = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n\
                      100 web-server           running    4096              32.00 1234\n\
                      101 db-server            stopped    8192              64.00 0\n";

        let guests = parse_qm_list(stdout);
        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].vm_id, 100);
        assert_eq!(guests[0].name, "web-server");
        assert_eq!(guests[0].status, "running");
        assert_eq!(guests[0].guest_type, GuestType::Qemu);
    }

    #[test]
    fn test_parse_pct_list() {
        let stdout = "VMID       Status     Lock         Name\n\
                      200        running                 ct-proxy\n\
                      201        stopped    backup       ct-cache\n";

        let guests = parse_pct_list(stdout);
        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].name, "ct-proxy");
        assert_eq!(guests[1].vm_id, 201);
        assert_eq!(guests[1].name, "ct-cache");
        assert_eq!(guests[1].guest_type, GuestType::Lxc);
    }

    #[test]
    fn test_parse_guest_status_and_name() {
        assert_eq!(
            parse_guest_status("status: running\n"),
            Some("running".to_string())
        );
        assert_eq!(parse_guest_status("garbage"), None);

        let config = "boot: order=scsi0\ncores: 4\nname: web-server\nmemory: 4096\n";
        assert_eq!(
            parse_guest_name(config, GuestType::Qemu),
            Some("web-server".to_string())
        );
        let lxc_config = "arch: amd64\nhostname: ct-proxy\n";
        assert_eq!(
            parse_guest_name(lxc_config, GuestType::Lxc),
            Some("ct-proxy".to_string())
        );
    }

    #[test]
    fn test_parse_agent_interfaces() {
        let stdout = r#"{"result": [
            {"name": "lo", "ip-addresses": [{"ip-address": "127.0.0.1", "ip-address-type": "ipv4"}]},
            {"name": "eth0", "ip-addresses": [
                {"ip-address": "10.0.0.50", "ip-address-type": "ipv4"},
                {"ip-address": "fe80::1", "ip-address-type": "ipv6"}
            ]}
        ]}"#;

        let ips = parse_agent_interfaces(stdout);
        assert_eq!(ips, vec!["10.0.0.50", "fe80::1"]);

        assert!(parse_agent_interfaces("not json").is_empty());
    }

    #[test]
    fn test_parse_pvesm_json() {
        let stdout = r#"[
            {"storage": "local", "type": "dir", "active": 1, "total": 100000000000, "used": 20000000000, "avail": 80000000000, "content": "iso,vztmpl"},
            {"storage": "pbs-ds0", "type": "pbs", "active": 1, "total": 500000000000, "used": 100000000000, "avail": 400000000000, "content": "backup"}
        ]"#;

        let storages = parse_pvesm_json(stdout).unwrap();
        assert_eq!(storages.len(), 2);
        assert_eq!(storages[0].name, "local");
        assert!(!storages[0].shared);
        assert!(storages[1].shared);
        assert_eq!(storages[1].storage_type, "pbs");
        assert!(storages[0].used_percent.unwrap() > 19.0);
    }

    #[test]
    fn test_parse_pvesm_text_fallback() {
        let stdout = "Name             Type     Status           Total            Used       Available        %\n\
                      local             dir     active       100000000        20000000        80000000   20.00%\n\
                      ceph-pool         rbd     active       900000000       450000000       450000000   50.00%\n";

        let storages = parse_pvesm_text(stdout);
        assert_eq!(storages.len(), 2);
        assert_eq!(storages[0].name, "local");
        assert_eq!(storages[0].total_bytes, 100000000);
        assert!(storages[1].shared);
    }

    #[test]
    fn test_parse_pvesm_json_rejects_garbage() {
        assert!(parse_pvesm_json("Name Type Status").is_none());
        assert!(parse_pvesm_json("{\"no\": \"array\"}").is_none());
    }

    #[test]
    fn test_parse_vm_disks() {
        let config = "boot: order=scsi0\n\
                      cores: 4\n\
                      ide2: local:iso/debian.iso,media=cdrom\n\
                      scsi0: local-zfs:vm-100-disk-0,iothread=1,size=32G\n\
                      virtio1: local-lvm:vm-100-disk-1,size=512M\n\
                      net0: virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0\n";

        let disks = parse_vm_disks(config);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].disk, "scsi0");
        assert_eq!(disks[0].storage.as_deref(), Some("local-zfs"));
        assert_eq!(disks[0].size_gb, Some(32.0));
        assert_eq!(disks[1].size_gb, Some(0.5));
    }

    #[test]
    fn test_parse_vm_disks_rootfs() {
        let config = "arch: amd64\nrootfs: local-zfs:subvol-200-disk-0,size=8G\n";
        let disks = parse_vm_disks(config);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].disk, "rootfs");
        assert_eq!(disks[0].size_gb, Some(8.0));
    }

    #[test]
    fn test_parse_host_metrics() {
        let stdout = "pve1|6.5.11-8-pve|16|0.42|65861812|32183400|864000\n";
        let metrics = parse_host_metrics(stdout).unwrap();
        assert_eq!(metrics.hostname, "pve1");
        assert_eq!(metrics.cpu_count, 16);
        assert!((metrics.load_1m - 0.42).abs() < f64::EPSILON);
        assert_eq!(metrics.uptime_seconds, 864000);

        assert!(parse_host_metrics("short|line").is_none());
    }
}
