//! # Application Configuration
//!
//! Read once at startup from a JSON file, then overridden by environment
//! variables. Everything has a default, so a missing file is not an error.
//!
//! | Setting                         | Default                      | Env override                       |
//! |---------------------------------|------------------------------|------------------------------------|
//! | `daemon.directory`              | `$HOME/apisense/daemon`      | `APISENSE_DAEMON_DIR`              |
//! | `daemon.interval_secs`          | 300                          | `APISENSE_INTERVAL_SECS`           |
//! | `daemon.run_on_start`           | true                         |                                    |
//! | `validation.definitions_dir`    | `$HOME/apisense/definitions` | `APISENSE_DEFINITIONS_DIR`         |
//! | `validation.reports_dir`        | `$HOME/apisense/reports`     | `APISENSE_REPORTS_DIR`             |
//! | `validation.max_parallel`       | 8                            | `APISENSE_MAX_PARALLEL`            |
//! | `validation.request_timeout_secs` | 30                         | `APISENSE_REQUEST_TIMEOUT_SECS`    |
//! | `validation.validator_timeout_secs` | none                     | `APISENSE_VALIDATOR_TIMEOUT_SECS`  |
//!
//! `validation.external_validators` is kept as raw JSON here and parsed
//! strictly by the loader.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_PARALLEL: usize = 8;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "APISENSE_CONFIG";

/// Root directory for all daemon state: `$HOME/apisense`.
pub fn base_directory() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("apisense")
}

/// Config file location: `APISENSE_CONFIG`, else `$HOME/apisense/config.json`.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_directory().join("config.json"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub directory: PathBuf,
    pub interval_secs: u64,
    pub run_on_start: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            directory: base_directory().join("daemon"),
            interval_secs: DEFAULT_INTERVAL_SECS,
            run_on_start: true,
        }
    }
}

impl DaemonConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub definitions_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub max_parallel: usize,
    pub request_timeout_secs: u64,
    pub validator_timeout_secs: Option<u64>,
    pub external_validators: Value,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let base = base_directory();
        Self {
            definitions_dir: base.join("definitions"),
            reports_dir: base.join("reports"),
            max_parallel: DEFAULT_MAX_PARALLEL,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            validator_timeout_secs: None,
            external_validators: Value::Null,
        }
    }
}

impl ValidationConfig {
    pub fn limits(&self) -> PipelineLimits {
        PipelineLimits {
            max_parallel: self.max_parallel,
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            validator_timeout: self.validator_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Execution bounds handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineLimits {
    /// Endpoints evaluated concurrently; 0 means one per endpoint.
    pub max_parallel: usize,
    pub request_timeout: Duration,
    /// Kill an external validator after this long; `None` waits forever.
    pub validator_timeout: Option<Duration>,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        ValidationConfig::default().limits()
    }
}

impl AppConfig {
    /// Applies `APISENSE_*` overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os("APISENSE_DAEMON_DIR") {
            self.daemon.directory = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("APISENSE_DEFINITIONS_DIR") {
            self.validation.definitions_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("APISENSE_REPORTS_DIR") {
            self.validation.reports_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_parse("APISENSE_INTERVAL_SECS") {
            self.daemon.interval_secs = n;
        }
        if let Some(n) = env_parse("APISENSE_MAX_PARALLEL") {
            self.validation.max_parallel = n;
        }
        if let Some(n) = env_parse("APISENSE_REQUEST_TIMEOUT_SECS") {
            self.validation.request_timeout_secs = n;
        }
        if let Some(n) = env_parse("APISENSE_VALIDATOR_TIMEOUT_SECS") {
            self.validation.validator_timeout_secs = Some(n);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.interval_secs, 300);
        assert!(config.daemon.run_on_start);
        assert_eq!(config.validation.max_parallel, 8);
        assert!(config.validation.validator_timeout_secs.is_none());
        assert!(config.validation.external_validators.is_null());
        assert!(config.daemon.directory.ends_with("apisense/daemon"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = serde_json::from_value(json!({
            "daemon": { "interval_secs": 60 },
            "validation": { "validator_timeout_secs": 5 }
        }))
        .unwrap();

        assert_eq!(config.daemon.interval(), Duration::from_secs(60));
        assert!(config.daemon.run_on_start);
        let limits = config.validation.limits();
        assert_eq!(limits.validator_timeout, Some(Duration::from_secs(5)));
        assert_eq!(limits.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = DaemonConfig {
            interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("APISENSE_MAX_PARALLEL", "3");
        std::env::set_var("APISENSE_REQUEST_TIMEOUT_SECS", "not-a-number");

        let mut config = AppConfig::default();
        config.apply_env();

        assert_eq!(config.validation.max_parallel, 3);
        assert_eq!(config.validation.request_timeout_secs, 30);

        std::env::remove_var("APISENSE_MAX_PARALLEL");
        std::env::remove_var("APISENSE_REQUEST_TIMEOUT_SECS");
    }
}
