//! Error types for the Floodgate engine.

use thiserror::Error;

/// Reasons an endpoint registration is rejected.
///
/// These are only ever produced at registration time. The request path
/// never fails.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The endpoint key is empty or only whitespace
    #[error("endpoint key must not be empty")]
    EmptyEndpointKey,

    /// `base_limit` must admit at least one request per window
    #[error("endpoint '{endpoint}': base_limit must be greater than zero")]
    ZeroBaseLimit { endpoint: String },

    /// `window_ms` must be a positive duration
    #[error("endpoint '{endpoint}': window_ms must be greater than zero")]
    ZeroWindow { endpoint: String },

    /// `adjustment_interval_ms` must be a positive duration
    #[error("endpoint '{endpoint}': adjustment_interval_ms must be greater than zero")]
    ZeroAdjustmentInterval { endpoint: String },

    /// Factor bounds violate `0 < max_decrease_factor < 1 <= max_increase_factor`
    #[error(
        "endpoint '{endpoint}': factors must satisfy 0 < max_decrease_factor ({decrease}) < 1 <= max_increase_factor ({increase})"
    )]
    InvalidFactors {
        endpoint: String,
        decrease: f64,
        increase: f64,
    },

    /// The endpoint key was already registered
    #[error("endpoint '{endpoint}' is already registered")]
    DuplicateEndpoint { endpoint: String },

    /// Engine-wide settings are out of range
    #[error("engine setting '{setting}' must be greater than zero")]
    InvalidEngineSetting { setting: &'static str },
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Endpoint or engine configuration was rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The configuration source could not be read or parsed
    #[error("Configuration source error: {0}")]
    Source(String),

    /// Background tasks could not be started
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for FloodgateError {
    fn from(e: serde_yaml::Error) -> Self {
        FloodgateError::Source(e.to_string())
    }
}

impl From<::config::ConfigError> for FloodgateError {
    fn from(e: ::config::ConfigError) -> Self {
        FloodgateError::Source(e.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
