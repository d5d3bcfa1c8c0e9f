//! Feedback loop that rewrites each endpoint's current limit.
//!
//! Increases need every health signal to be good and move by +10%.
//! Decreases need any one signal to be bad and move by -20%. Limits only
//! change here, never on the request path.

use std::sync::Arc;
use tracing::{debug, info};

use super::clock::Timestamp;
use super::endpoint::{ConfigStore, EndpointConfig};
use super::metrics::MetricsTracker;
use super::window::WindowCounter;

/// Increase requires an error rate below this.
pub const HEALTHY_ERROR_RATE: f64 = 0.05;
/// Increase requires an average response time below this.
pub const HEALTHY_RESPONSE_TIME_MS: f64 = 1_000.0;
/// Increase requires a load factor strictly between these bounds.
pub const HEALTHY_LOAD_RANGE: (f64, f64) = (0.7, 0.95);
/// An error rate above this forces a decrease.
pub const UNHEALTHY_ERROR_RATE: f64 = 0.15;
/// An average response time above this forces a decrease.
pub const UNHEALTHY_RESPONSE_TIME_MS: f64 = 3_000.0;
/// A load factor above this forces a decrease.
pub const OVERLOAD_FACTOR: f64 = 1.0;

const INCREASE_STEP: f64 = 1.1;
const DECREASE_STEP: f64 = 0.8;

/// Inputs to one adjustment decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSignals {
    /// Errors per checked request over the last interval
    pub error_rate: f64,
    /// Response time moving average
    pub average_response_time_ms: f64,
    /// Accepted requests in the window across all identifiers, over the
    /// current limit
    pub load_factor: f64,
}

/// Which way the limit moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
    Hold,
}

impl HealthSignals {
    /// Pick a direction. Decrease wins over increase.
    pub fn direction(&self) -> Direction {
        if self.error_rate > UNHEALTHY_ERROR_RATE
            || self.average_response_time_ms > UNHEALTHY_RESPONSE_TIME_MS
            || self.load_factor > OVERLOAD_FACTOR
        {
            return Direction::Decrease;
        }

        let (low, high) = HEALTHY_LOAD_RANGE;
        if self.error_rate < HEALTHY_ERROR_RATE
            && self.average_response_time_ms < HEALTHY_RESPONSE_TIME_MS
            && self.load_factor > low
            && self.load_factor < high
        {
            return Direction::Increase;
        }

        Direction::Hold
    }
}

impl Direction {
    /// Apply this direction to a factor, clamped to the endpoint's bounds.
    pub fn apply(self, factor: f64, config: &EndpointConfig) -> f64 {
        match self {
            Direction::Increase => (factor * INCREASE_STEP).min(config.max_increase_factor),
            Direction::Decrease => (factor * DECREASE_STEP).max(config.max_decrease_factor),
            Direction::Hold => factor,
        }
    }
}

/// Record of one endpoint evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    /// Endpoint key
    pub endpoint: String,
    /// Health signals observed for the interval
    pub signals: HealthSignals,
    /// Direction the factor moved, or `Hold`
    pub direction: Direction,
    /// Adjustment factor before this pass
    pub previous_factor: f64,
    /// Adjustment factor after clamping to the configured bounds
    pub new_factor: f64,
    /// Limit before this pass
    pub previous_limit: u64,
    /// Limit now enforced by checks
    pub new_limit: u64,
}

/// Evaluates every endpoint whose adjustment interval has elapsed.
pub struct AdjustmentController {
    configs: Arc<ConfigStore>,
    metrics: Arc<MetricsTracker>,
    windows: Arc<WindowCounter>,
}

impl AdjustmentController {
    /// Create a controller over the shared registry, metrics and windows.
    pub fn new(
        configs: Arc<ConfigStore>,
        metrics: Arc<MetricsTracker>,
        windows: Arc<WindowCounter>,
    ) -> Self {
        Self {
            configs,
            metrics,
            windows,
        }
    }

    /// Run one controller pass at `now`.
    ///
    /// Returns one [`Adjustment`] per endpoint that was due, whether or not
    /// its limit changed.
    pub fn run_once(&self, now: Timestamp) -> Vec<Adjustment> {
        self.configs
            .keys()
            .into_iter()
            .filter_map(|endpoint| {
                let config = self.configs.get(&endpoint)?;
                self.adjust_endpoint(&endpoint, &config, now)
            })
            .collect()
    }

    fn adjust_endpoint(
        &self,
        endpoint: &str,
        config: &EndpointConfig,
        now: Timestamp,
    ) -> Option<Adjustment> {
        let last = self.metrics.get(endpoint)?.last_adjustment_at;
        if !is_due(last, now, config.adjustment_interval_ms) {
            return None;
        }

        // Read the windows before taking the metrics lock; the two are
        // never held together.
        let recent_activity = self.windows.recent_activity(endpoint, now, config.window_ms);

        let adjustment = self.metrics.update(endpoint, |m| {
            if !is_due(m.last_adjustment_at, now, config.adjustment_interval_ms) {
                return None;
            }

            let signals = HealthSignals {
                error_rate: m.error_rate(),
                average_response_time_ms: m.average_response_time_ms,
                load_factor: recent_activity as f64 / m.current_limit.max(1) as f64,
            };
            let direction = signals.direction();
            let previous_factor = m.adjustment_factor;
            let previous_limit = m.current_limit;

            m.adjustment_factor = direction.apply(previous_factor, config);
            m.current_limit = config.limit_for_factor(m.adjustment_factor);
            m.request_count = 0;
            m.error_count = 0;
            m.last_adjustment_at = now;

            Some(Adjustment {
                endpoint: endpoint.to_string(),
                signals,
                direction,
                previous_factor,
                new_factor: m.adjustment_factor,
                previous_limit,
                new_limit: m.current_limit,
            })
        })??;

        if adjustment.new_limit != adjustment.previous_limit {
            info!(
                endpoint = %endpoint,
                direction = ?adjustment.direction,
                previous_limit = adjustment.previous_limit,
                new_limit = adjustment.new_limit,
                factor = adjustment.new_factor,
                error_rate = adjustment.signals.error_rate,
                avg_response_ms = adjustment.signals.average_response_time_ms,
                load_factor = adjustment.signals.load_factor,
                "Adjusted endpoint limit"
            );
        } else {
            debug!(
                endpoint = %endpoint,
                direction = ?adjustment.direction,
                limit = adjustment.new_limit,
                load_factor = adjustment.signals.load_factor,
                "Endpoint limit unchanged"
            );
        }

        Some(adjustment)
    }
}

/// A `last` in the future (clock stepped back) is never due.
fn is_due(last: Timestamp, now: Timestamp, interval_ms: u64) -> bool {
    now.saturating_sub(last) >= interval_ms
}
