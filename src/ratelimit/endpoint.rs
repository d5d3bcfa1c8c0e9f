//! Endpoint configuration and the registry that holds it.
//!
//! An endpoint's configuration is validated once, at registration, and is
//! immutable afterwards. Everything on the request path reads it through
//! [`ConfigStore::get`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::error::ConfigError;

/// Per-endpoint admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Requests admitted per identifier per window at `adjustment_factor = 1.0`
    pub base_limit: u64,
    /// Sliding window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Upper bound for the adjustment factor (>= 1.0)
    #[serde(default = "default_max_increase_factor")]
    pub max_increase_factor: f64,
    /// Lower bound for the adjustment factor, in (0, 1)
    #[serde(default = "default_max_decrease_factor")]
    pub max_decrease_factor: f64,
    /// Minimum time between two limit recalculations, in milliseconds
    #[serde(default = "default_adjustment_interval_ms")]
    pub adjustment_interval_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_increase_factor() -> f64 {
    2.0
}

fn default_max_decrease_factor() -> f64 {
    0.5
}

fn default_adjustment_interval_ms() -> u64 {
    60_000
}

impl EndpointConfig {
    /// Create a configuration with the given base limit and window, using
    /// default factor bounds and adjustment interval.
    pub fn new(base_limit: u64, window_ms: u64) -> Self {
        Self {
            base_limit,
            window_ms,
            max_increase_factor: default_max_increase_factor(),
            max_decrease_factor: default_max_decrease_factor(),
            adjustment_interval_ms: default_adjustment_interval_ms(),
        }
    }

    /// Set the factor bounds.
    pub fn with_factors(mut self, max_decrease_factor: f64, max_increase_factor: f64) -> Self {
        self.max_decrease_factor = max_decrease_factor;
        self.max_increase_factor = max_increase_factor;
        self
    }

    /// Set the adjustment interval.
    pub fn with_adjustment_interval(mut self, adjustment_interval_ms: u64) -> Self {
        self.adjustment_interval_ms = adjustment_interval_ms;
        self
    }

    /// Check every invariant of the configuration.
    pub fn validate(&self, endpoint: &str) -> Result<(), ConfigError> {
        if endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpointKey);
        }
        if self.base_limit == 0 {
            return Err(ConfigError::ZeroBaseLimit {
                endpoint: endpoint.to_string(),
            });
        }
        if self.window_ms == 0 {
            return Err(ConfigError::ZeroWindow {
                endpoint: endpoint.to_string(),
            });
        }
        if self.adjustment_interval_ms == 0 {
            return Err(ConfigError::ZeroAdjustmentInterval {
                endpoint: endpoint.to_string(),
            });
        }

        let decrease = self.max_decrease_factor;
        let increase = self.max_increase_factor;
        let factors_ok = decrease.is_finite()
            && increase.is_finite()
            && decrease > 0.0
            && decrease < 1.0
            && increase >= 1.0;
        if !factors_ok {
            return Err(ConfigError::InvalidFactors {
                endpoint: endpoint.to_string(),
                decrease,
                increase,
            });
        }

        Ok(())
    }

    /// The limit corresponding to an adjustment factor, never below 1.
    pub fn limit_for_factor(&self, factor: f64) -> u64 {
        let limit = (self.base_limit as f64 * factor).round();
        if limit < 1.0 {
            1
        } else {
            limit as u64
        }
    }
}

/// An endpoint key paired with its configuration, as it appears in a
/// configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// The endpoint key (for example a route name)
    pub key: String,
    /// The admission policy for the endpoint
    #[serde(flatten)]
    pub config: EndpointConfig,
}

/// Registry of immutable endpoint configurations.
#[derive(Debug, Default)]
pub struct ConfigStore {
    endpoints: RwLock<HashMap<String, EndpointConfig>>,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register an endpoint.
    ///
    /// Registering the same key twice is rejected; configurations never
    /// change after registration.
    pub fn register(&self, endpoint: &str, config: EndpointConfig) -> Result<(), ConfigError> {
        config.validate(endpoint)?;

        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(endpoint) {
            return Err(ConfigError::DuplicateEndpoint {
                endpoint: endpoint.to_string(),
            });
        }
        endpoints.insert(endpoint.to_string(), config);

        info!(
            endpoint = %endpoint,
            base_limit = config.base_limit,
            window_ms = config.window_ms,
            max_decrease_factor = config.max_decrease_factor,
            max_increase_factor = config.max_increase_factor,
            adjustment_interval_ms = config.adjustment_interval_ms,
            "Registered endpoint"
        );
        Ok(())
    }

    /// Get the configuration for an endpoint.
    pub fn get(&self, endpoint: &str) -> Option<EndpointConfig> {
        self.endpoints.read().get(endpoint).copied()
    }

    /// Keys of every registered endpoint, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.endpoints.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Whether no endpoint has been registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}
