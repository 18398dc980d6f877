//! Diagnostics for the terminal driver.
//!
//! Provides:
//! - **About info**: version, git SHA, protocol version, platform
//! - **Log location and retention**: used by `init_logging` to place and
//!   prune the rolling log files.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::ecr::protocol::PROTOCOL_VERSION;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "ecr-driver";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, git SHA, protocol version and platform info.
pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": env!("DRIVER_GIT_SHA"),
        "protocolVersion": PROTOCOL_VERSION,
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Default log directory: the platform data dir + `pos-terminal-driver/logs`.
pub fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pos-terminal-driver").join("logs")
}

/// Delete the oldest driver log files in `log_dir`, keeping `keep`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry.path().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert_eq!(info["name"], "pos-terminal-driver");
        assert_eq!(info["protocolVersion"], PROTOCOL_VERSION);
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = get_log_dir();
        assert_eq!(d1, get_log_dir());
        assert!(d1.ends_with("pos-terminal-driver/logs"));
    }

    #[test]
    fn test_prune_keeps_newest_driver_logs() {
        let dir = std::env::temp_dir().join(format!("ecr-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let now = SystemTime::now();
        for age in 0..4u64 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-01-0{}", age + 1));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(now - Duration::from_secs(3600 * age)).unwrap();
        }
        fs::write(dir.join("other.log"), b"keep").unwrap();

        assert_eq!(prune_old_logs(&dir, 2), 2);
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-01")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-02")).exists());
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-01-04")).exists());
        assert!(dir.join("other.log").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        assert_eq!(prune_old_logs(Path::new("/nonexistent/ecr/logs"), 1), 0);
    }
}
