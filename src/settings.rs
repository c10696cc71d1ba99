/// Settings and configuration management
/// Handles environment variable loading and validation

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Feed Constants
// ============================================================================

/// Blockchain.com coin feed carrying the pending transaction stream
pub const WS_ADDR: &str = "wss://ws.blockchain.info/coins";

/// Subscription request sent once per connection.
/// `pending_transaction` gives a steady stream; `confirmed_transaction` arrives in bursts.
pub const SUBSCRIPTION_MSG: &str =
    r#"{"coin":"eth","command":"subscribe","entity":"pending_transaction"}"#;

/// Log a progress line every this many extracted senders
pub const PROGRESS_LOG_EVERY: u64 = 1000;

// ============================================================================
// Timeouts
// ============================================================================

/// Pause before reconnecting after either side closes the websocket cleanly
pub const WS_RECONNECT_PAUSE: Duration = Duration::from_secs(2);

/// Longest single wait on the socket before the shutdown flag is re-checked
pub const WS_INTERMSG_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on a single handoff queue put/get
pub const QUEUE_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot scheduler sleep granularity
pub const SNAPSHOT_TICK: Duration = Duration::from_secs(1);

/// Pause between setting the shutdown flag and joining the workers
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How often main re-checks the shutdown flag while the workers run
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DB_PATH: &str = "./data/chainmapper.sqlite3";
pub const DEFAULT_EXPORT_PATH: &str = "./data/export.json";
pub const DEFAULT_EXPORT_INTERVAL_SECS: u64 = 10800;

// ============================================================================
// Runtime Configuration (loaded from environment)
// ============================================================================

/// Run mode; only affects log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Mode::Production),
            "development" | "dev" => Some(Mode::Development),
            _ => None,
        }
    }

    /// Default log filter when RUST_LOG is not set
    pub fn log_level(self) -> log::LevelFilter {
        match self {
            Mode::Production => log::LevelFilter::Info,
            Mode::Development => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,

    // WebSocket
    pub wss_url: String,

    // Storage
    pub db_path: PathBuf,

    // Snapshot export
    pub export_enabled: bool,
    pub export_interval: Duration,
    pub export_path: PathBuf,

    /// None keeps the handoff queue unbounded
    pub queue_capacity: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns errors with helpful messages if a value is present but invalid.
    /// Every variable is optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup("MODE") {
            Some(raw) => Mode::parse(&raw).with_context(|| {
                format!(
                    "MODE must be 'production' or 'development' (found '{}').\n\
                    Remove MODE from your .env file to use the default (production).",
                    raw
                )
            })?,
            None => Mode::Production,
        };

        let export_interval_secs = match lookup("EXPORT_INTERVAL") {
            Some(raw) => raw.trim().parse::<u64>().with_context(|| {
                format!(
                    "EXPORT_INTERVAL must be a whole number of seconds (found '{}')",
                    raw
                )
            })?,
            None => DEFAULT_EXPORT_INTERVAL_SECS,
        };
        if export_interval_secs == 0 {
            anyhow::bail!(
                "EXPORT_INTERVAL must be greater than zero.\n\
                Set IS_EXPORT=false to disable snapshots instead."
            );
        }

        let queue_capacity = match lookup("QUEUE_CAPACITY") {
            Some(raw) => {
                let cap = raw.trim().parse::<usize>().with_context(|| {
                    format!("QUEUE_CAPACITY must be a positive integer (found '{}')", raw)
                })?;
                if cap == 0 {
                    anyhow::bail!("QUEUE_CAPACITY must be at least 1; unset it for an unbounded queue");
                }
                Some(cap)
            }
            None => None,
        };

        Ok(Self {
            mode,
            wss_url: lookup("WS_ADDR")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| WS_ADDR.to_string()),
            db_path: lookup("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            export_enabled: lookup("IS_EXPORT")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            export_interval: Duration::from_secs(export_interval_secs),
            export_path: lookup("EXPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_PATH)),
            queue_capacity,
        })
    }

    /// Create parent directories for the database and the export file
    pub fn ensure_data_dirs(&self) -> Result<()> {
        for path in [&self.db_path, &self.export_path] {
            ensure_parent_dir(path)?;
        }
        Ok(())
    }
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Parse boolean env value: "true"/"1" (any case) are true, everything else false
fn parse_bool(value: &str) -> bool {
    let v = value.trim();
    v.eq_ignore_ascii_case("true") || v == "1"
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.mode, Mode::Production);
        assert_eq!(cfg.wss_url, WS_ADDR);
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cfg.export_path, PathBuf::from(DEFAULT_EXPORT_PATH));
        assert_eq!(cfg.export_interval, Duration::from_secs(10800));
        assert!(!cfg.export_enabled);
        assert_eq!(cfg.queue_capacity, None);
    }

    #[test]
    fn test_all_values_overridden() {
        let cfg = config_from(&[
            ("MODE", "development"),
            ("EXPORT_INTERVAL", "60"),
            ("IS_EXPORT", "True"),
            ("DB_PATH", "/tmp/x.sqlite3"),
            ("EXPORT_PATH", "/tmp/x.json"),
            ("WS_ADDR", "ws://127.0.0.1:9000"),
            ("QUEUE_CAPACITY", "128"),
        ])
        .unwrap();
        assert_eq!(cfg.mode, Mode::Development);
        assert_eq!(cfg.export_interval, Duration::from_secs(60));
        assert!(cfg.export_enabled);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.sqlite3"));
        assert_eq!(cfg.export_path, PathBuf::from("/tmp/x.json"));
        assert_eq!(cfg.wss_url, "ws://127.0.0.1:9000");
        assert_eq!(cfg.queue_capacity, Some(128));
    }

    #[test]
    fn test_is_export_accepts_one_and_rejects_other_values() {
        assert!(config_from(&[("IS_EXPORT", "1")]).unwrap().export_enabled);
        assert!(!config_from(&[("IS_EXPORT", "False")]).unwrap().export_enabled);
        assert!(!config_from(&[("IS_EXPORT", "yes")]).unwrap().export_enabled);
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let err = config_from(&[("MODE", "staging")]).unwrap_err();
        assert!(err.to_string().contains("MODE"));
    }

    #[test]
    fn test_invalid_export_interval_is_rejected() {
        assert!(config_from(&[("EXPORT_INTERVAL", "soon")]).is_err());
        let err = config_from(&[("EXPORT_INTERVAL", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_zero_queue_capacity_is_rejected() {
        assert!(config_from(&[("QUEUE_CAPACITY", "0")]).is_err());
        assert!(config_from(&[("QUEUE_CAPACITY", "-5")]).is_err());
    }

    #[test]
    fn test_blank_ws_addr_falls_back_to_default() {
        let cfg = config_from(&[("WS_ADDR", "  ")]).unwrap();
        assert_eq!(cfg.wss_url, WS_ADDR);
    }

    #[test]
    fn test_mode_log_levels() {
        assert_eq!(Mode::Production.log_level(), log::LevelFilter::Info);
        assert_eq!(Mode::Development.log_level(), log::LevelFilter::Debug);
        assert_eq!(Mode::parse(" DEV "), Some(Mode::Development));
    }

    #[test]
    fn test_ensure_data_dirs_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_from(&[
            ("DB_PATH", dir.path().join("a/b/db.sqlite3").to_str().unwrap()),
            ("EXPORT_PATH", dir.path().join("c/export.json").to_str().unwrap()),
        ])
        .unwrap();
        cfg.ensure_data_dirs().unwrap();
        assert!(dir.path().join("a/b").is_dir());
        assert!(dir.path().join("c").is_dir());
    }
}
