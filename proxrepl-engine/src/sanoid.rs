//! Sanoid management
//!
//! Installs and configures sanoid on remote nodes and drives manual runs.
//! The generated config is fully owned by the engine; manual edits on the
//! node are overwritten.

use crate::db::nodes::{DatasetRecord, NodeRecord};
use crate::ssh::{SshExecutor, PROBE_TIMEOUT, SNAPSHOT_TIMEOUT};
use proxrepl_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const SANOID_CONF_PATH: &str = "/etc/sanoid/sanoid.conf";

/// Built-in retention template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanoidTemplate {
    pub name: &'static str,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
    pub autosnap: bool,
    pub autoprune: bool,
}

/// The five built-in templates, in the order they are written to the config
pub fn default_templates() -> Vec<SanoidTemplate> {
    let tpl = |name, hourly, daily, weekly, monthly, yearly| SanoidTemplate {
        name,
        hourly,
        daily,
        weekly,
        monthly,
        yearly,
        autosnap: true,
        autoprune: true,
    };

    vec![
        tpl("production", 48, 90, 12, 24, 5),
        tpl("default", 24, 30, 4, 12, 0),
        tpl("minimal", 12, 7, 0, 0, 0),
        tpl("backup", 0, 30, 8, 12, 2),
        tpl("vm", 24, 14, 4, 6, 0),
    ]
}

/// Observed sanoid state on a node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SanoidStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub timer_active: bool,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
}

/// Sanoid operations against remote nodes
pub struct SanoidManager {
    executor: Arc<SshExecutor>,
}

impl SanoidManager {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Install sanoid: apt package when available, then a git build, then a
    /// direct copy of the scripts as last resort.
    pub async fn install(&self, node: &NodeRecord) -> Result<String> {
        let target = node.ssh_target();

        // Fast path: already installed
        let check = self
            .executor
            .execute(&target, "command -v sanoid && sanoid --version 2>/dev/null", PROBE_TIMEOUT)
            .await?;
        if check.success && check.stdout.to_lowercase().contains("sanoid") {
            return Ok(format!("Sanoid already installed: {}", check.stdout.trim()));
        }

        let output = self
            .executor
            .execute(&target, INSTALL_SCRIPT, Duration::from_secs(300))
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Sanoid installation failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    /// Read the current sanoid.conf; empty string when absent
    pub async fn get_config(&self, node: &NodeRecord) -> Result<String> {
        let output = self
            .executor
            .execute(
                &node.ssh_target(),
                &format!("cat {} 2>/dev/null || echo ''", SANOID_CONF_PATH),
                PROBE_TIMEOUT,
            )
            .await?;

        Ok(output.stdout)
    }

    /// Write a generated sanoid.conf, keeping a `.bak` of the previous one
    pub async fn set_config(&self, node: &NodeRecord, config: &str) -> Result<()> {
        let cmd = format!(
            "mkdir -p /etc/sanoid\n\
             cp {path} {path}.bak 2>/dev/null || true\n\
             cat > {path} << 'SANOID_EOF'\n{config}\nSANOID_EOF\n\
             echo 'Configuration saved'",
            path = SANOID_CONF_PATH,
            config = config
        );

        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, PROBE_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "Failed to write sanoid config on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    /// Regenerate the config from the stored dataset policies and push it
    pub async fn apply_policies(&self, node: &NodeRecord, datasets: &[DatasetRecord]) -> Result<()> {
        let config = generate_config(datasets);
        self.set_config(node, &config).await
    }

    /// Run sanoid manually
    pub async fn run(&self, node: &NodeRecord, cron: bool, prune: bool, verbose: bool) -> Result<String> {
        let mut flags = Vec::new();
        if cron {
            flags.push("--cron");
        }
        if prune {
            flags.push("--prune-snapshots");
        }
        if verbose {
            flags.push("--verbose");
        }

        let cmd = format!("sanoid {}", flags.join(" "));
        let output = self
            .executor
            .execute(&node.ssh_target(), &cmd, SNAPSHOT_TIMEOUT)
            .await?;

        if !output.success {
            return Err(Error::RemoteTool(format!(
                "sanoid run failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        Ok(output.merged())
    }

    /// Installation, version and systemd timer state
    pub async fn status(&self, node: &NodeRecord) -> Result<SanoidStatus> {
        let target = node.ssh_target();
        let mut status = SanoidStatus::default();

        let version = self
            .executor
            .execute(&target, "sanoid --version 2>&1", PROBE_TIMEOUT)
            .await?;
        if version.success {
            status.installed = true;
            status.version = Some(version.stdout.trim().to_string());
        }

        let timer = self
            .executor
            .execute(
                &target,
                "systemctl is-active sanoid.timer 2>/dev/null && \
                 systemctl show sanoid.timer --property=LastTriggerUSec,NextElapseUSecRealtime --value",
                PROBE_TIMEOUT,
            )
            .await?;

        if timer.success && timer.stdout.contains("active") {
            status.timer_active = true;
            let lines: Vec<&str> = timer.stdout.lines().collect();
            if lines.len() >= 3 {
                status.last_run = non_na(lines[1]);
                status.next_run = non_na(lines[2]);
            }
        }

        Ok(status)
    }
}

fn non_na(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "n/a" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Generate the sanoid.conf content from per-dataset policies
pub fn generate_config(datasets: &[DatasetRecord]) -> String {
    let mut lines = vec![
        "# Sanoid configuration".to_string(),
        "# Managed by proxrepl".to_string(),
        "# Do not edit manually".to_string(),
        String::new(),
        "# Templates".to_string(),
    ];

    for tpl in default_templates() {
        lines.push(format!("[template_{}]", tpl.name));
        lines.push(format!("  hourly = {}", tpl.hourly));
        lines.push(format!("  daily = {}", tpl.daily));
        lines.push(format!("  weekly = {}", tpl.weekly));
        lines.push(format!("  monthly = {}", tpl.monthly));
        lines.push(format!("  yearly = {}", tpl.yearly));
        lines.push(format!("  autosnap = {}", yes_no(tpl.autosnap)));
        lines.push(format!("  autoprune = {}", yes_no(tpl.autoprune)));
        lines.push(String::new());
    }

    lines.push("# Datasets".to_string());
    lines.push(String::new());

    let template_names: Vec<&str> = default_templates().iter().map(|t| t.name).collect();

    for ds in datasets {
        if !ds.sanoid_enabled {
            continue;
        }

        lines.push(format!("[{}]", ds.name));

        match ds.sanoid_template.as_deref() {
            Some(template) if template_names.contains(&template) => {
                lines.push(format!("  use_template = {}", template));
            }
            _ => {
                lines.push(format!("  hourly = {}", ds.hourly));
                lines.push(format!("  daily = {}", ds.daily));
                lines.push(format!("  weekly = {}", ds.weekly));
                lines.push(format!("  monthly = {}", ds.monthly));
                lines.push(format!("  yearly = {}", ds.yearly));
            }
        }

        lines.push(format!("  autosnap = {}", yes_no(ds.autosnap)));
        lines.push(format!("  autoprune = {}", yes_no(ds.autoprune)));
        lines.push(String::new());
    }

    lines.join("\n")
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

const INSTALL_SCRIPT: &str = r#"#!/bin/bash
set -e

if ! ping -c 1 github.com &>/dev/null; then
    echo "ERROR: no internet connectivity"
    exit 1
fi

export DEBIAN_FRONTEND=noninteractive
apt-get update -qq

if apt-cache show sanoid &>/dev/null; then
    apt-get install -y -qq sanoid
    if command -v sanoid &>/dev/null; then
        sanoid --version
        mkdir -p /etc/sanoid
        touch /etc/sanoid/sanoid.conf
        exit 0
    fi
fi

apt-get install -y -qq debhelper libcapture-tiny-perl libconfig-inifiles-perl pv lzop mbuffer git build-essential 2>/dev/null || true

cd /tmp
rm -rf sanoid sanoid_*.deb 2>/dev/null || true
timeout 120 git clone --depth 1 https://github.com/jimsalterjrs/sanoid.git || {
    echo "ERROR: git clone failed"
    exit 1
}
cd sanoid

if [ -d "packages/debian" ]; then
    ln -sf packages/debian . 2>/dev/null || true
    if dpkg-buildpackage -uc -us -b 2>/dev/null; then
        apt-get install -y ../sanoid_*.deb 2>/dev/null && {
            sanoid --version
            mkdir -p /etc/sanoid
            touch /etc/sanoid/sanoid.conf
            rm -rf /tmp/sanoid /tmp/sanoid_*.deb 2>/dev/null || true
            exit 0
        }
    fi
fi

mkdir -p /usr/local/sbin /etc/sanoid
cp sanoid syncoid findoid sleepymutex /usr/local/sbin/ 2>/dev/null || cp sanoid syncoid /usr/local/sbin/
chmod +x /usr/local/sbin/sanoid /usr/local/sbin/syncoid
[ -f sanoid.defaults.conf ] && cp sanoid.defaults.conf /etc/sanoid/
touch /etc/sanoid/sanoid.conf
ln -sf /usr/local/sbin/sanoid /usr/sbin/sanoid 2>/dev/null || true
ln -sf /usr/local/sbin/syncoid /usr/sbin/syncoid 2>/dev/null || true

cd /
rm -rf /tmp/sanoid /tmp/sanoid_*.deb 2>/dev/null || true

if command -v sanoid &>/dev/null; then
    sanoid --version 2>/dev/null || echo "Version: manual install"
    exit 0
else
    echo "ERROR: installation failed"
    exit 1
fi
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str, enabled: bool, template: Option<&str>) -> DatasetRecord {
        DatasetRecord {
            id: 1,
            node_id: 1,
            name: name.to_string(),
            used: None,
            available: None,
            mountpoint: None,
            snapshot_count: 0,
            last_snapshot: None,
            sanoid_enabled: enabled,
            sanoid_template: template.map(|t| t.to_string()),
            hourly: 6,
            daily: 10,
            weekly: 2,
            monthly: 3,
            yearly: 1,
            autosnap: true,
            autoprune: false,
        }
    }

    #[test]
    fn test_generate_config_templates() {
        let config = generate_config(&[]);
        assert!(config.contains("[template_production]"));
        assert!(config.contains("[template_default]"));
        assert!(config.contains("[template_minimal]"));
        assert!(config.contains("[template_backup]"));
        assert!(config.contains("[template_vm]"));
        assert!(config.contains("hourly = 48"));
        assert!(config.contains("# Managed by proxrepl"));
    }

    #[test]
    fn test_generate_config_dataset_with_template() {
        let config = generate_config(&[dataset("rpool/data", true, Some("vm"))]);
        assert!(config.contains("[rpool/data]"));
        assert!(config.contains("  use_template = vm"));
        assert!(config.contains("  autoprune = no"));
    }

    #[test]
    fn test_generate_config_dataset_custom_retention() {
        let config = generate_config(&[dataset("tank/vms", true, None)]);
        assert!(config.contains("[tank/vms]"));
        assert!(config.contains("  hourly = 6"));
        assert!(config.contains("  daily = 10"));
        assert!(!config.contains("use_template"));
    }

    #[test]
    fn test_generate_config_skips_disabled_and_unknown_template() {
        let config = generate_config(&[
            dataset("tank/skip", false, None),
            dataset("tank/custom", true, Some("nonexistent")),
        ]);
        assert!(!config.contains("[tank/skip]"));
        // Unknown template falls back to explicit retention
        assert!(config.contains("[tank/custom]"));
        assert!(config.contains("  hourly = 6"));
    }

    #[test]
    fn test_default_templates_shape() {
        let templates = default_templates();
        assert_eq!(templates.len(), 5);
        let production = &templates[0];
        assert_eq!(production.name, "production");
        assert_eq!(production.daily, 90);
        assert!(production.autosnap && production.autoprune);
    }
}
