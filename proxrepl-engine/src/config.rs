//! Engine configuration
//!
//! Resolves the data directory, database URL and SSH identity paths from
//! environment variables with platform-dependent defaults.

use std::path::{Path, PathBuf};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base directory for the database, SSH identity and file logs
    pub data_dir: PathBuf,
    /// sqlx database URL
    pub database_url: String,
    /// Private key used to reach managed nodes
    pub ssh_key_path: PathBuf,
    /// Public key distributed to nodes during bootstrap
    pub ssh_pubkey_path: PathBuf,
    /// Optional directory for rotated file logs
    pub log_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Build the configuration from the environment.
    ///
    /// `PROXREPL_DATA` overrides the data directory; otherwise
    /// `/var/lib/proxrepl` is used when writable, falling back to
    /// `~/.proxrepl`.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("PROXREPL_DATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_data_dir());

        Self::with_data_dir(data_dir)
    }

    /// Build a configuration rooted at an explicit data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let database_url = format!("sqlite://{}", data_dir.join("proxrepl.db").display());
        let ssh_key_path = data_dir.join("ssh").join("id_ed25519");
        let ssh_pubkey_path = data_dir.join("ssh").join("id_ed25519.pub");
        let log_dir = std::env::var("PROXREPL_LOG_DIR").ok().map(PathBuf::from);

        Self {
            data_dir,
            database_url,
            ssh_key_path,
            ssh_pubkey_path,
            log_dir,
        }
    }

    fn default_data_dir() -> PathBuf {
        if cfg!(target_os = "linux") && is_writable("/var/lib") {
            return PathBuf::from("/var/lib/proxrepl");
        }

        home_dir().join(".proxrepl")
    }

    /// Create the data directory tree if it does not exist yet
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        if let Some(parent) = self.ssh_key_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(log_dir) = &self.log_dir {
            tokio::fs::create_dir_all(log_dir).await?;
        }
        Ok(())
    }
}

fn is_writable(path: &str) -> bool {
    Path::new(path)
        .metadata()
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_data_dir() {
        let config = EngineConfig::with_data_dir(PathBuf::from("/tmp/proxrepl-test"));
        assert_eq!(
            config.database_url,
            "sqlite:///tmp/proxrepl-test/proxrepl.db"
        );
        assert_eq!(
            config.ssh_key_path,
            PathBuf::from("/tmp/proxrepl-test/ssh/id_ed25519")
        );
        assert!(config.ssh_pubkey_path.to_string_lossy().ends_with(".pub"));
    }

    #[test]
    fn test_default_data_dir_is_absolute_or_home_relative() {
        let dir = EngineConfig::default_data_dir();
        assert!(dir.to_string_lossy().contains("proxrepl"));
    }
}
