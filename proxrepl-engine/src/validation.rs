//! Input validation and sanitization module
//!
//! Every user-supplied fragment that ends up interpolated into a remote
//! shell command must pass one of these narrow allowlists first.

use proxrepl_common::Error;
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

/// Maximum allowed lengths for various fields
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_PATH_LENGTH: usize = 4096;

/// Proxmox guest identifier range
pub const MIN_VMID: u32 = 100;
pub const MAX_VMID: u32 = 999_999_999;

static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$").unwrap()
});

static JOB_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9 ._-]*$").unwrap()
});

static DATASET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.:/-]*$").unwrap()
});

static SUBVOLUME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/[a-zA-Z0-9_./-]+$").unwrap()
});

static STORAGE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap()
});

static BRIDGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap()
});

static SNAPSHOT_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap()
});

/// Validation result type
pub type ValidationResult<T> = Result<T, Error>;

/// Hostname or IPv4 address of a managed node
pub fn validate_hostname(hostname: &str) -> ValidationResult<()> {
    if hostname.is_empty() {
        return Err(Error::Validation("Hostname cannot be empty".to_string()));
    }
    if hostname.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Hostname too long (max {} characters)",
            MAX_NAME_LENGTH
        )));
    }
    if !HOSTNAME_REGEX.is_match(hostname) {
        return Err(Error::Validation(format!(
            "Invalid hostname: {}",
            hostname
        )));
    }
    Ok(())
}

/// Job and node display names
pub fn validate_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(Error::Validation("Name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Name too long (max {} characters)",
            MAX_NAME_LENGTH
        )));
    }
    if !JOB_NAME_REGEX.is_match(name) {
        return Err(Error::Validation(
            "Name can only contain alphanumeric characters, spaces, dots, hyphens and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

/// ZFS dataset path (`rpool/data/vm-100-disk-0`)
pub fn validate_dataset(dataset: &str) -> ValidationResult<()> {
    if dataset.is_empty() {
        return Err(Error::Validation("Dataset cannot be empty".to_string()));
    }
    if dataset.len() > MAX_PATH_LENGTH {
        return Err(Error::Validation("Dataset path too long".to_string()));
    }
    if dataset.contains("..") || dataset.contains(' ') {
        return Err(Error::Validation(format!(
            "Invalid dataset path: {}",
            dataset
        )));
    }
    if !DATASET_REGEX.is_match(dataset) {
        return Err(Error::Validation(format!(
            "Invalid dataset path: {}",
            dataset
        )));
    }
    Ok(())
}

/// Absolute BTRFS subvolume or mount path
pub fn validate_subvolume_path(path: &str) -> ValidationResult<()> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(Error::Validation("Path too long".to_string()));
    }
    if path.contains("..") || !SUBVOLUME_REGEX.is_match(path) {
        return Err(Error::Validation(format!("Invalid subvolume path: {}", path)));
    }
    Ok(())
}

/// Proxmox storage identifier
pub fn validate_storage_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() || !STORAGE_NAME_REGEX.is_match(name) {
        return Err(Error::Validation(format!("Invalid storage name: {}", name)));
    }
    Ok(())
}

/// Network bridge identifier (`vmbr0`, `br-lan`)
pub fn validate_bridge(name: &str) -> ValidationResult<()> {
    if name.is_empty() || !BRIDGE_REGEX.is_match(name) {
        return Err(Error::Validation(format!("Invalid bridge name: {}", name)));
    }
    Ok(())
}

/// Snapshot names used in shell pipelines
pub fn validate_snapshot_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() || !SNAPSHOT_NAME_REGEX.is_match(name) {
        return Err(Error::Validation(format!("Invalid snapshot name: {}", name)));
    }
    Ok(())
}

/// Proxmox guest identifier
pub fn validate_vmid(vmid: u32) -> ValidationResult<()> {
    if !(MIN_VMID..=MAX_VMID).contains(&vmid) {
        return Err(Error::Validation(format!(
            "VMID {} out of range ({}-{})",
            vmid, MIN_VMID, MAX_VMID
        )));
    }
    Ok(())
}

/// Standard 5-field crontab expression
pub fn validate_cron(expr: &str) -> ValidationResult<()> {
    parse_cron(expr).map(|_| ())
}

/// Parse a 5-field crontab expression into a [`cron::Schedule`].
///
/// The `cron` crate expects a seconds field, which the crontab grammar does
/// not carry; a literal `0` is prepended. Numeric days of week are shifted
/// from crontab numbering (0 or 7 = Sunday) to the crate's (1 = Sunday).
pub fn parse_cron(expr: &str) -> ValidationResult<cron::Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::Validation(format!(
            "Cron expression must have 5 fields: {}",
            expr
        )));
    }

    let dow = normalize_dow_field(fields[4]);
    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );
    cron::Schedule::from_str(&with_seconds)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Shift numeric day-of-week tokens by one, preserving lists, ranges and
/// step suffixes. Named days pass through untouched.
fn normalize_dow_field(field: &str) -> String {
    let shift = |token: &str| -> String {
        match token.parse::<u8>() {
            Ok(n) if n <= 7 => ((n % 7) + 1).to_string(),
            _ => token.to_string(),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };

            let mapped = if range == "*" {
                range.to_string()
            } else {
                range.split('-').map(&shift).collect::<Vec<_>>().join("-")
            };

            match step {
                Some(step) => format!("{}/{}", mapped, step),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Extra arguments appended verbatim to syncoid; reject shell metacharacters
pub fn validate_extra_args(args: &str) -> ValidationResult<()> {
    const FORBIDDEN: &[char] = &[';', '|', '&', '`', '$', '>', '<', '\n', '(', ')'];
    if args.chars().any(|c| FORBIDDEN.contains(&c)) {
        return Err(Error::Validation(
            "Extra arguments contain forbidden shell characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("pve1").is_ok());
        assert!(validate_hostname("10.0.0.11").is_ok());
        assert!(validate_hostname("node-1.example.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("bad host").is_err());
        assert!(validate_hostname("host;rm -rf /").is_err());
    }

    #[test]
    fn test_validate_dataset() {
        assert!(validate_dataset("rpool/data/vm-100-disk-0").is_ok());
        assert!(validate_dataset("tank").is_ok());
        assert!(validate_dataset("rpool/../etc").is_err());
        assert!(validate_dataset("rpool/data; rm -rf /").is_err());
        assert!(validate_dataset("").is_err());
    }

    #[test]
    fn test_validate_subvolume_path() {
        assert!(validate_subvolume_path("/mnt/btrfs-storage/images/100").is_ok());
        assert!(validate_subvolume_path("relative/path").is_err());
        assert!(validate_subvolume_path("/mnt/../etc").is_err());
        assert!(validate_subvolume_path("/mnt/with space").is_err());
    }

    #[test]
    fn test_validate_storage_name() {
        assert!(validate_storage_name("local-lvm").is_ok());
        assert!(validate_storage_name("pbs_ds0").is_ok());
        assert!(validate_storage_name("bad name").is_err());
        assert!(validate_storage_name("").is_err());
    }

    #[test]
    fn test_validate_vmid() {
        assert!(validate_vmid(100).is_ok());
        assert!(validate_vmid(999_999_999).is_ok());
        assert!(validate_vmid(99).is_err());
        assert!(validate_vmid(1_000_000_000).is_err());
    }

    #[test]
    fn test_validate_cron() {
        assert!(validate_cron("*/5 * * * *").is_ok());
        assert!(validate_cron("0 2 * * *").is_ok());
        assert!(validate_cron("0 0 * * 0").is_ok());
        assert!(validate_cron("0 0 * * 7").is_ok());
        assert!(validate_cron("30 6 * * 1-5").is_ok());
        assert!(validate_cron("not a cron").is_err());
        assert!(validate_cron("* * * *").is_err());
        assert!(validate_cron("0 0 * * * *").is_err());
    }

    #[test]
    fn test_normalize_dow_field() {
        // Crontab Sunday (0 or 7) becomes the crate's 1
        assert_eq!(normalize_dow_field("0"), "1");
        assert_eq!(normalize_dow_field("7"), "1");
        // Monday-Friday shifts to 2-6
        assert_eq!(normalize_dow_field("1-5"), "2-6");
        assert_eq!(normalize_dow_field("0,3,6"), "1,4,7");
        assert_eq!(normalize_dow_field("*"), "*");
        assert_eq!(normalize_dow_field("*/2"), "*/2");
        assert_eq!(normalize_dow_field("Mon-Fri"), "Mon-Fri");
    }

    #[test]
    fn test_validate_extra_args() {
        assert!(validate_extra_args("--quiet --identifier=replica").is_ok());
        assert!(validate_extra_args("--foo; rm -rf /").is_err());
        assert!(validate_extra_args("$(reboot)").is_err());
    }

    #[test]
    fn test_validate_bridge() {
        assert!(validate_bridge("vmbr0").is_ok());
        assert!(validate_bridge("vmbr1").is_ok());
        assert!(validate_bridge("bridge=vmbr0").is_err());
        assert!(validate_bridge("").is_err());
    }
}
