use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::account::GenesisAccount;
use crate::lock::RetryPolicy;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize json: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Environment variables understood by [`Settings::from_env`].
pub mod env {
    pub const BIN_PATH: &str = "NEAR_SANDBOX_BIN_PATH";
    pub const DOWNLOAD_DIR: &str = "NEAR_SANDBOX_DOWNLOAD_DIR";
    pub const ARTIFACT_URL: &str = "SANDBOX_ARTIFACT_URL";
    pub const ENABLE_LOG: &str = "NEAR_ENABLE_SANDBOX_LOG";
    pub const RPC_TIMEOUT_SECS: &str = "NEAR_RPC_TIMEOUT_SECS";
    pub const MAX_PAYLOAD_SIZE: &str = "NEAR_SANDBOX_MAX_PAYLOAD_SIZE";
    pub const MAX_OPEN_FILES: &str = "NEAR_SANDBOX_MAX_OPEN_FILES";
    pub const LOCK_DIR: &str = "NEAR_SANDBOX_LOCK_DIR";
    /// Parent of the default download directory (`$HOME/.near`).
    pub const HOME: &str = "HOME";
    /// Default lock directory, and the download fallback without `HOME`.
    pub const TMPDIR: &str = "TMPDIR";
}

const FALLBACK_TMPDIR: &str = "/tmp";

/// Process-level knobs. Built once at the entry point and passed down; the
/// library never reads the environment on its own. `Default` assumes no
/// variables are set.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Use this executable instead of a downloaded one.
    pub bin_path: Option<PathBuf>,
    /// Base directory for versioned installs.
    pub download_dir: PathBuf,
    /// Replaces the platform artifact URL.
    pub artifact_url: Option<String>,
    /// Inherit node stdio instead of forwarding stderr to the log.
    pub debug_logs: bool,
    pub rpc_timeout: Duration,
    /// Directory shared by every process for port lock files.
    pub lock_dir: PathBuf,
    pub max_payload_size: Option<u64>,
    pub max_open_files: Option<u64>,
    pub install_retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self::base(None, None)
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Unset or blank values
    /// keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::base(get(env::HOME), get(env::TMPDIR));

        if let Some(path) = get(env::BIN_PATH) {
            settings.bin_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = get(env::DOWNLOAD_DIR) {
            settings.download_dir = PathBuf::from(dir);
        }
        settings.artifact_url = get(env::ARTIFACT_URL);
        settings.debug_logs = get(env::ENABLE_LOG).as_deref() == Some("1");
        if let Some(secs) = get(env::RPC_TIMEOUT_SECS) {
            settings.rpc_timeout = Duration::from_secs(parse_number(env::RPC_TIMEOUT_SECS, &secs)?);
        }
        if let Some(dir) = get(env::LOCK_DIR) {
            settings.lock_dir = PathBuf::from(dir);
        }
        if let Some(size) = get(env::MAX_PAYLOAD_SIZE) {
            settings.max_payload_size = Some(parse_number(env::MAX_PAYLOAD_SIZE, &size)?);
        }
        if let Some(files) = get(env::MAX_OPEN_FILES) {
            settings.max_open_files = Some(parse_number(env::MAX_OPEN_FILES, &files)?);
        }
        Ok(settings)
    }

    fn base(home: Option<String>, tmpdir: Option<String>) -> Self {
        let tmpdir = PathBuf::from(tmpdir.as_deref().unwrap_or(FALLBACK_TMPDIR));
        let download_dir = home
            .map(PathBuf::from)
            .unwrap_or_else(|| tmpdir.clone())
            .join(".near");
        Self {
            bin_path: None,
            download_dir,
            artifact_url: None,
            debug_logs: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lock_dir: tmpdir,
            max_payload_size: None,
            max_open_files: None,
            install_retry: RetryPolicy::install(),
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value:?}: {e}")))
}

/// Per-sandbox overrides. A port of `Some(0)` behaves like `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxConfig {
    pub rpc_port: Option<u16>,
    pub net_port: Option<u16>,
    pub max_payload_size: Option<u64>,
    pub max_open_files: Option<u64>,
    /// RFC 7396 merge patch applied to `config.json`.
    pub additional_config: Option<Value>,
    /// RFC 7396 merge patch applied to `genesis.json`.
    pub additional_genesis: Option<Value>,
    pub additional_accounts: Vec<GenesisAccount>,
    pub node_key: Option<Value>,
    pub validator_key: Option<Value>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.rpc_timeout, Duration::from_secs(10));
        assert_eq!(settings.download_dir, PathBuf::from("/tmp/.near"));
        assert_eq!(settings.lock_dir, PathBuf::from("/tmp"));
        assert!(!settings.debug_logs);
    }

    #[test]
    fn directories_follow_injected_home_and_tmpdir() {
        let vars = [(env::HOME, "/home/dev"), (env::TMPDIR, "/scratch")];
        let settings = Settings::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(settings.download_dir, PathBuf::from("/home/dev/.near"));
        assert_eq!(settings.lock_dir, PathBuf::from("/scratch"));

        let settings = Settings::from_lookup(lookup(&[(env::TMPDIR, "/scratch")])).unwrap();
        assert_eq!(settings.download_dir, PathBuf::from("/scratch/.near"));
    }

    #[test]
    fn environment_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            (env::BIN_PATH, "/usr/local/bin/near-sandbox"),
            (env::DOWNLOAD_DIR, "/var/cache/near"),
            (env::ARTIFACT_URL, "http://mirror/near.tar.gz"),
            (env::ENABLE_LOG, "1"),
            (env::RPC_TIMEOUT_SECS, "30"),
            (env::MAX_PAYLOAD_SIZE, "2048"),
            (env::MAX_OPEN_FILES, "10000"),
            (env::LOCK_DIR, "/run/locks"),
        ]))
        .unwrap();

        assert_eq!(
            settings.bin_path,
            Some(PathBuf::from("/usr/local/bin/near-sandbox"))
        );
        assert_eq!(settings.download_dir, PathBuf::from("/var/cache/near"));
        assert_eq!(
            settings.artifact_url.as_deref(),
            Some("http://mirror/near.tar.gz")
        );
        assert!(settings.debug_logs);
        assert_eq!(settings.rpc_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_payload_size, Some(2048));
        assert_eq!(settings.max_open_files, Some(10000));
        assert_eq!(settings.lock_dir, PathBuf::from("/run/locks"));
    }

    #[test]
    fn log_flag_requires_exactly_one() {
        let settings = Settings::from_lookup(lookup(&[(env::ENABLE_LOG, "true")])).unwrap();
        assert!(!settings.debug_logs);
    }

    #[test]
    fn blank_values_are_ignored() {
        let settings = Settings::from_lookup(lookup(&[
            (env::BIN_PATH, "  "),
            (env::RPC_TIMEOUT_SECS, ""),
        ]))
        .unwrap();
        assert_eq!(settings.bin_path, None);
        assert_eq!(settings.rpc_timeout, Duration::from_secs(10));
    }

    #[test]
    fn malformed_number_is_invalid() {
        let err = Settings::from_lookup(lookup(&[(env::MAX_OPEN_FILES, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
        assert!(err.to_string().contains(env::MAX_OPEN_FILES));
    }
}
