//! SSH command executor
//!
//! Sole way to touch a remote host. Every other component composes shell
//! pipelines and hands them to [`SshExecutor::execute`]. Host-key checking
//! is intentionally relaxed: node identity is established by explicit
//! registration, not trust-on-first-use.

use proxrepl_common::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Per-command wall-clock budgets
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const INVENTORY_TIMEOUT: Duration = Duration::from_secs(60);
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(300);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(3600);
pub const BACKUP_TIMEOUT: Duration = Duration::from_secs(7200);

/// Connection parameters of a managed node
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            key_path: key_path.into(),
        }
    }

    /// `user@host` spec used by syncoid, rsync and scp targets
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
}

impl CommandOutput {
    /// stdout and stderr merged, for pattern matching across both streams
    pub fn merged(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Outcome of a public-key bootstrap
#[derive(Debug, Clone)]
pub struct KeyInstallOutcome {
    pub success: bool,
    pub already_present: bool,
}

/// Stateless executor for remote commands over SSH key auth
#[derive(Debug, Default)]
pub struct SshExecutor {}

impl SshExecutor {
    pub fn new() -> Self {
        Self {}
    }

    /// Run a shell command on a remote host, capturing stdout/stderr/exit.
    ///
    /// The timeout fires a hard kill; output read up to that point is
    /// returned with `timed_out` set.
    pub async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let args = build_ssh_args(target);
        debug!("ssh {}@{} (timeout {}s): {}", target.user, target.host, timeout.as_secs(), command);

        let mut child = Command::new("ssh")
            .args(&args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn ssh: {}", e)))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let (status, timed_out) = tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| Error::Transport(format!("Failed to wait for ssh: {}", e)))?;
                (Some(status), false)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("Command timed out after {}s on {}: {}", timeout.as_secs(), target.host, command);
                let _ = child.kill().await;
                (None, true)
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let success = !timed_out && exit_code == 0;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            success,
            timed_out,
        })
    }

    /// Install the control plane's public key into the remote
    /// `authorized_keys` using one-shot password authentication.
    ///
    /// Idempotent: an already-installed key is detected and reported.
    pub async fn distribute_key(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        pubkey: &str,
    ) -> Result<KeyInstallOutcome> {
        let pubkey = pubkey.trim();
        let install_script = build_key_install_script(pubkey);

        let mut child = Command::new("sshpass")
            .arg("-p")
            .arg(password)
            .arg("ssh")
            .arg("-p")
            .arg(port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("PubkeyAuthentication=no")
            .arg(format!("{}@{}", user, host))
            .arg(&install_script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn sshpass: {}", e)))?;

        let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Transport(format!("Key distribution to {} timed out", host)))?
            .map_err(|e| Error::Transport(format!("Key distribution failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transport(format!(
                "Key distribution to {} failed: {}",
                host,
                stderr.trim()
            )));
        }

        Ok(KeyInstallOutcome {
            success: true,
            already_present: stdout.contains("ALREADY_PRESENT"),
        })
    }

    /// Generate the control plane's key pair if missing; return the public key
    pub async fn ensure_keypair(&self, key_path: &Path) -> Result<String> {
        let pub_path = key_path.with_extension("pub");

        if !key_path.exists() {
            if let Some(parent) = key_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let output = Command::new("ssh-keygen")
                .arg("-t")
                .arg("ed25519")
                .arg("-N")
                .arg("")
                .arg("-C")
                .arg("proxrepl-engine")
                .arg("-f")
                .arg(key_path)
                .output()
                .await
                .map_err(|e| Error::System(format!("Failed to run ssh-keygen: {}", e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::System(format!("ssh-keygen failed: {}", stderr)));
            }

            tracing::info!("Generated SSH key pair at {}", key_path.display());
        }

        let pubkey = tokio::fs::read_to_string(&pub_path).await?;
        Ok(pubkey.trim().to_string())
    }
}

/// SSH client arguments up to, but excluding, the remote command
fn build_ssh_args(target: &SshTarget) -> Vec<String> {
    vec![
        "-p".to_string(),
        target.port.to_string(),
        "-i".to_string(),
        target.key_path.clone(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
        target.user_at_host(),
    ]
}

/// The `ssh ... user@host` prefix usable inside a composed shell pipeline,
/// e.g. `btrfs send ... | ssh <prefix> "btrfs receive ..."`.
pub fn ssh_pipe_prefix(target: &SshTarget) -> String {
    format!(
        "ssh -p {} -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null {}",
        target.port,
        target.key_path,
        target.user_at_host()
    )
}

fn build_key_install_script(pubkey: &str) -> String {
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && chmod 600 ~/.ssh/authorized_keys && \
         if grep -qxF '{key}' ~/.ssh/authorized_keys; then echo ALREADY_PRESENT; else echo '{key}' >> ~/.ssh/authorized_keys && echo INSTALLED; fi",
        key = pubkey
    )
}
