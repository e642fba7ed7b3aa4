use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_VIEWPORT_CAPACITY: u64 = 1024;
pub const DEFAULT_STARTUP_ATTEMPTS: u32 = 30;
pub const DEFAULT_STARTUP_RETRY_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Client configuration, layered defaults → file → environment → CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReefConfig {
    /// Editing service host (defaults to "127.0.0.1")
    pub host: String,
    pub port: u16,
    /// Heartbeat cadence for a single open session; scaled by session count.
    pub heartbeat_interval_ms: u64,
    pub viewport_capacity: u64,
    pub startup_attempts: u32,
    pub startup_retry_ms: u64,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for ReefConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            viewport_capacity: DEFAULT_VIEWPORT_CAPACITY,
            startup_attempts: DEFAULT_STARTUP_ATTEMPTS,
            startup_retry_ms: DEFAULT_STARTUP_RETRY_MS,
            checkpoint_dir: None,
        }
    }
}

impl ReefConfig {
    /// `<config dir>/reef/config.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        BaseDirs::new().map(|dirs| dirs.config_dir().join("reef").join("config.toml"))
    }

    /// Loads the explicit file (which must exist) or else the default file (which
    /// may be missing), then applies `REEF_*` environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_from(|var| env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read = |var: &'static str| normalize(lookup(var));

        if let Some(host) = read("REEF_HOST") {
            self.host = host;
        }
        if let Some(port) = read("REEF_PORT") {
            self.port = parse_env("REEF_PORT", port)?;
        }
        if let Some(value) = read("REEF_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_env("REEF_HEARTBEAT_INTERVAL_MS", value)?;
        }
        if let Some(value) = read("REEF_VIEWPORT_CAPACITY") {
            self.viewport_capacity = parse_env("REEF_VIEWPORT_CAPACITY", value)?;
        }
        if let Some(value) = read("REEF_STARTUP_ATTEMPTS") {
            self.startup_attempts = parse_env("REEF_STARTUP_ATTEMPTS", value)?;
        }
        if let Some(value) = read("REEF_STARTUP_RETRY_MS") {
            self.startup_retry_ms = parse_env("REEF_STARTUP_RETRY_MS", value)?;
        }
        if let Some(dir) = read("REEF_CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn startup_retry(&self) -> Duration {
        Duration::from_millis(self.startup_retry_ms)
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        var,
        reason: err.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-global.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_documented_values() {
        let config = ReefConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.viewport_capacity, 1024);
        assert_eq!(config.startup_attempts, 30);
        assert_eq!(config.checkpoint_dir, None);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 9100\nheartbeat_interval_ms = 250\n").unwrap();
        let config = ReefConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"not a number\"\n").unwrap();
        assert!(matches!(
            ReefConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ReefConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn env_overrides_and_blank_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REEF_HOST", "  "),
            ("REEF_PORT", "9200"),
            ("REEF_CHECKPOINT_DIR", "/tmp/reef-checkpoints"),
        ]);
        let mut config = ReefConfig::default();
        config
            .apply_env_from(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 9200);
        assert_eq!(
            config.checkpoint_dir.as_deref(),
            Some(Path::new("/tmp/reef-checkpoints"))
        );
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut config = ReefConfig::default();
        let err = config
            .apply_env_from(|var| (var == "REEF_STARTUP_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "REEF_STARTUP_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn load_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 9300\n").unwrap();

        let original = env::var("REEF_PORT").ok();
        unsafe {
            env::set_var("REEF_PORT", "9400");
        }
        let config = ReefConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9400);

        unsafe {
            if let Some(orig) = original {
                env::set_var("REEF_PORT", orig);
            } else {
                env::remove_var("REEF_PORT");
            }
        }
    }
}
