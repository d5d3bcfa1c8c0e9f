//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{ConfigError, FloodgateError, Result};
use crate::ratelimit::EndpointRule;

/// Prefix of environment variables that override file settings, e.g.
/// `FLOODGATE__ENGINE__FAIL_OPEN_LIMIT=500`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Metrics reporting configuration
    #[serde(default)]
    pub reporting: ReportingSettings,

    /// Endpoints registered at startup
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,
}

/// Engine-wide settings shared by every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How often the adjustment controller wakes, in milliseconds
    #[serde(default = "default_adjustment_tick_ms")]
    pub adjustment_tick_ms: u64,

    /// How often the cleaner wakes, in milliseconds
    #[serde(default = "default_cleanup_tick_ms")]
    pub cleanup_tick_ms: u64,

    /// Age after which window entries are discarded, in milliseconds
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Limit reported for endpoints that were never registered
    #[serde(default = "default_fail_open_limit")]
    pub fail_open_limit: u64,

    /// Window used for the reset time of unregistered endpoints
    #[serde(default = "default_fail_open_window_ms")]
    pub fail_open_window_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            adjustment_tick_ms: default_adjustment_tick_ms(),
            cleanup_tick_ms: default_cleanup_tick_ms(),
            retention_ms: default_retention_ms(),
            fail_open_limit: default_fail_open_limit(),
            fail_open_window_ms: default_fail_open_window_ms(),
        }
    }
}

fn default_adjustment_tick_ms() -> u64 {
    5_000
}

fn default_cleanup_tick_ms() -> u64 {
    60 * 60 * 1000
}

fn default_retention_ms() -> u64 {
    crate::ratelimit::DEFAULT_RETENTION_MS
}

fn default_fail_open_limit() -> u64 {
    1000
}

fn default_fail_open_window_ms() -> u64 {
    60_000
}

impl EngineSettings {
    /// Reject zero ticks, horizons and fail-open values.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let checks = [
            ("adjustment_tick_ms", self.adjustment_tick_ms),
            ("cleanup_tick_ms", self.cleanup_tick_ms),
            ("retention_ms", self.retention_ms),
            ("fail_open_limit", self.fail_open_limit),
            ("fail_open_window_ms", self.fail_open_window_ms),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((setting, _)) => Err(ConfigError::InvalidEngineSetting { setting: *setting }),
            None => Ok(()),
        }
    }
}

/// Metrics reporting configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingSettings {
    /// Seconds between metrics snapshots
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

impl FloodgateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `FLOODGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(FloodgateError::Source(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.engine.adjustment_tick_ms, 5_000);
        assert_eq!(config.engine.cleanup_tick_ms, 3_600_000);
        assert_eq!(config.engine.retention_ms, 86_400_000);
        assert_eq!(config.engine.fail_open_limit, 1000);
        assert_eq!(config.reporting.metrics_interval_secs, 60);
        assert!(config.endpoints.is_empty());
        assert!(config.engine.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
engine:
  adjustment_tick_ms: 1000
  retention_ms: 3600000
reporting:
  metrics_interval_secs: 15
endpoints:
  - key: /api/login
    base_limit: 5
    window_ms: 60000
    max_increase_factor: 1.5
    max_decrease_factor: 0.25
    adjustment_interval_ms: 30000
  - key: /api/search
    base_limit: 200
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.engine.adjustment_tick_ms, 1000);
        assert_eq!(config.engine.cleanup_tick_ms, 3_600_000);
        assert_eq!(config.engine.retention_ms, 3_600_000);
        assert_eq!(config.reporting.metrics_interval_secs, 15);
        assert_eq!(config.endpoints.len(), 2);

        let login = &config.endpoints[0];
        assert_eq!(login.key, "/api/login");
        assert_eq!(login.config.base_limit, 5);
        assert_eq!(login.config.max_increase_factor, 1.5);
        assert_eq!(login.config.max_decrease_factor, 0.25);
        assert_eq!(login.config.adjustment_interval_ms, 30_000);

        let search = &config.endpoints[1];
        assert_eq!(search.config.base_limit, 200);
        assert_eq!(search.config.window_ms, 60_000);
    }

    #[test]
    fn test_rejects_zero_engine_setting() {
        let yaml = r#"
engine:
  cleanup_tick_ms: 0
"#;
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            FloodgateError::Config(ConfigError::InvalidEngineSetting {
                setting: "cleanup_tick_ms"
            })
        ));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = FloodgateConfig::from_yaml("engine: [not, a, map]").unwrap_err();
        assert!(matches!(err, FloodgateError::Source(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("floodgate-test-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "endpoints:\n  - key: /api/upload\n    base_limit: 3\n",
        )
        .unwrap();

        let config = FloodgateConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].key, "/api/upload");
        assert_eq!(config.endpoints[0].config.base_limit, 3);
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let path = std::env::temp_dir().join(format!("floodgate-env-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "engine:\n  fail_open_limit: 2000\nendpoints:\n  - key: /api/report\n    base_limit: 4\n    max_increase_factor: 2\n",
        )
        .unwrap();

        std::env::set_var("FLOODGATE__ENGINE__FAIL_OPEN_LIMIT", "500");
        let result = FloodgateConfig::load(Some(&path));
        std::env::remove_var("FLOODGATE__ENGINE__FAIL_OPEN_LIMIT");
        std::fs::remove_file(&path).unwrap();

        let config = result.unwrap();
        assert_eq!(config.engine.fail_open_limit, 500);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].config.base_limit, 4);
        assert_eq!(config.endpoints[0].config.max_increase_factor, 2.0);
    }

    #[test]
    fn test_load_missing_file() {
        let err = FloodgateConfig::load(Some(Path::new("/nonexistent/floodgate.yaml"))).unwrap_err();
        assert!(matches!(err, FloodgateError::Source(_)));
    }
}
