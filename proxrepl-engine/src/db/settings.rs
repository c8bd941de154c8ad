//! System configuration key/value store
//!
//! Every recognised key carries a declared value type; unknown keys are
//! rejected at write time so typos do not silently create dead settings.

use proxrepl_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Declared value type of a configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Bool,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Bool => "bool",
            ValueType::Json => "json",
        }
    }
}

/// Recognised configuration keys with type and default value
pub const CONFIG_KEYS: &[(&str, ValueType, &str)] = &[
    ("auth_method", ValueType::String, "local"),
    ("auth_proxmox_node", ValueType::String, ""),
    ("auth_proxmox_port", ValueType::Int, "8006"),
    ("auth_proxmox_verify_ssl", ValueType::Bool, "false"),
    ("auth_session_timeout", ValueType::Int, "3600"),
    ("auth_allow_local_fallback", ValueType::Bool, "true"),
    ("syncoid_default_compress", ValueType::String, "lz4"),
    ("syncoid_default_mbuffer", ValueType::String, "128M"),
    ("syncoid_timeout", ValueType::Int, "3600"),
    ("btrfs_default_mount", ValueType::String, "/mnt/btrfs-storage"),
    ("btrfs_default_snapshot_dir", ValueType::String, "/mnt/btrfs-storage/.snapshots"),
    ("btrfs_max_snapshots", ValueType::Int, "5"),
    ("btrfs_sync_timeout", ValueType::Int, "3600"),
    ("pbs_default_datastore", ValueType::String, ""),
    ("pbs_backup_mode", ValueType::String, "snapshot"),
    ("pbs_backup_compress", ValueType::String, "zstd"),
    ("pbs_restore_timeout", ValueType::Int, "7200"),
    ("pbs_backup_timeout", ValueType::Int, "7200"),
    ("log_retention_days", ValueType::Int, "30"),
    ("audit_retention_days", ValueType::Int, "90"),
    ("daily_summary_hour", ValueType::Int, "8"),
    ("daily_summary_enabled", ValueType::Bool, "true"),
    ("ui_theme", ValueType::String, "dark"),
    ("ui_refresh_interval", ValueType::Int, "30"),
];

fn key_type(key: &str) -> Option<ValueType> {
    CONFIG_KEYS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, t, _)| *t)
}

/// Seed missing keys with their defaults; existing values are untouched.
pub async fn init_defaults(pool: &SqlitePool) -> Result<()> {
    for &(key, value_type, default) in CONFIG_KEYS {
        sqlx::query(
            "INSERT INTO system_config (key, value, value_type) VALUES (?, ?, ?)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(default)
        .bind(value_type.as_str())
        .execute(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to seed config key {}: {}", key, e)))?;
    }

    Ok(())
}

pub async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::System(format!("Failed to read config key {}: {}", key, e)))?;

    Ok(row.map(|r| r.get("value")))
}

pub async fn set_value(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    let value_type =
        key_type(key).ok_or_else(|| Error::Validation(format!("Unknown config key: {}", key)))?;

    // Type-check before persisting
    match value_type {
        ValueType::Int => {
            value
                .parse::<i64>()
                .map_err(|_| Error::Validation(format!("Config key {} expects an integer", key)))?;
        }
        ValueType::Bool => {
            if !matches!(value, "true" | "false" | "1" | "0" | "yes" | "no") {
                return Err(Error::Validation(format!(
                    "Config key {} expects a boolean",
                    key
                )));
            }
        }
        ValueType::Json => {
            serde_json::from_str::<serde_json::Value>(value)
                .map_err(|_| Error::Validation(format!("Config key {} expects JSON", key)))?;
        }
        ValueType::String => {}
    }

    sqlx::query(
        "INSERT INTO system_config (key, value, value_type) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .bind(value_type.as_str())
    .execute(pool)
    .await
    .map_err(|e| Error::System(format!("Failed to write config key {}: {}", key, e)))?;

    Ok(())
}

pub async fn get_int(pool: &SqlitePool, key: &str, default: i64) -> i64 {
    match get_value(pool, key).await {
        Ok(Some(value)) => value.parse().unwrap_or(default),
        _ => default,
    }
}

pub async fn get_bool(pool: &SqlitePool, key: &str, default: bool) -> bool {
    match get_value(pool, key).await {
        Ok(Some(value)) => matches!(value.as_str(), "true" | "1" | "yes"),
        _ => default,
    }
}

pub async fn get_string(pool: &SqlitePool, key: &str, default: &str) -> String {
    match get_value(pool, key).await {
        Ok(Some(value)) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}
