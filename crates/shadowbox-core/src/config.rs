//! Core configuration. Filled by an external loader and handed to
//! `shadowbox::Shadowbox::init`.

use std::path::PathBuf;

use serde::Deserialize;

/// Default idle period before a box is auto-locked.
pub const DEFAULT_AUTO_LOCK_MINUTES: u64 = 15;
/// Default per-file size ceiling (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Runtime configuration for the whole core.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for blob files (`<root>/storage` in a default layout).
    pub storage_root: PathBuf,
    /// Path of the metadata index database file.
    pub db_path: PathBuf,
    /// Idle minutes before a box is auto-locked.
    #[serde(default = "default_auto_lock")]
    pub auto_lock_minutes: u64,
    /// Largest accepted plaintext, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// TCP port for the share server; 0 picks an ephemeral port.
    #[serde(default)]
    pub share_port: u16,
}

fn default_auto_lock() -> u64 {
    DEFAULT_AUTO_LOCK_MINUTES
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Config {
    /// Conventional layout under a single root: `<root>/shadowbox.db` and
    /// `<root>/storage/`.
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            storage_root: root.join("storage"),
            db_path: root.join("shadowbox.db"),
            auto_lock_minutes: DEFAULT_AUTO_LOCK_MINUTES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            share_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_from_partial_input() {
        let cfg: Config = serde_json::from_str(
            r#"{"storage_root": "/tmp/sb/storage", "db_path": "/tmp/sb/shadowbox.db"}"#,
        )
        .unwrap();
        assert_eq!(cfg.auto_lock_minutes, DEFAULT_AUTO_LOCK_MINUTES);
        assert_eq!(cfg.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(cfg.share_port, 0);
    }

    #[test]
    fn under_root_layout() {
        let cfg = Config::under_root("/data/sb");
        assert!(cfg.db_path.ends_with("shadowbox.db"));
        assert!(cfg.storage_root.ends_with("storage"));
    }
}
