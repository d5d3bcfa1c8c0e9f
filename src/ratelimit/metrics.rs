//! Live health metrics per endpoint.
//!
//! Metrics are the input to the adjustment controller and the output of
//! [`get_metrics`](super::AdaptiveRateLimiter::get_metrics). They live for the
//! lifetime of the process and are never persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::clock::Timestamp;
use super::endpoint::EndpointConfig;

/// Smoothing factor for the response time moving average.
pub const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Where an endpoint's limit currently sits relative to its base limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitState {
    /// Factor is exactly 1.0
    Nominal,
    /// Factor is above 1.0
    Relaxed,
    /// Factor is below 1.0
    Throttled,
}

impl LimitState {
    /// Classify an adjustment factor.
    pub fn from_factor(factor: f64) -> Self {
        if factor > 1.0 {
            LimitState::Relaxed
        } else if factor < 1.0 {
            LimitState::Throttled
        } else {
            LimitState::Nominal
        }
    }
}

/// Mutable health state of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointMetrics {
    /// Multiplier applied to the base limit
    pub adjustment_factor: f64,
    /// `round(base_limit * adjustment_factor)`, at least 1
    pub current_limit: u64,
    /// Checks seen since the last adjustment, including denied ones
    pub request_count: u64,
    /// Errors reported since the last adjustment
    pub error_count: u64,
    /// Exponential moving average of reported response times
    pub average_response_time_ms: f64,
    /// When the controller last evaluated this endpoint
    pub last_adjustment_at: Timestamp,
}

impl EndpointMetrics {
    /// Fresh metrics for a newly registered endpoint.
    pub fn new(config: &EndpointConfig, now: Timestamp) -> Self {
        Self {
            adjustment_factor: 1.0,
            current_limit: config.base_limit,
            request_count: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
            last_adjustment_at: now,
        }
    }

    /// Errors per request over the current interval, 0 with no requests.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

/// Tracks [`EndpointMetrics`] for every registered endpoint.
///
/// Each endpoint's metrics sit behind their own map entry lock, so the
/// request path, the controller and snapshot readers all see whole values.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    endpoints: DashMap<String, EndpointMetrics>,
}

impl MetricsTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize metrics for an endpoint at registration.
    pub fn init(&self, endpoint: &str, config: &EndpointConfig, now: Timestamp) {
        self.endpoints
            .insert(endpoint.to_string(), EndpointMetrics::new(config, now));
    }

    /// Count an admission check and return the limit to check it against.
    ///
    /// Both happen under the same lock, so a concurrent adjustment either
    /// precedes or follows the check entirely.
    pub fn record_request(&self, endpoint: &str) -> Option<u64> {
        let mut metrics = self.endpoints.get_mut(endpoint)?;
        metrics.request_count = metrics.request_count.saturating_add(1);
        Some(metrics.current_limit)
    }

    /// Count an error. Returns `false` if the endpoint is unknown.
    pub fn record_error(&self, endpoint: &str) -> bool {
        match self.endpoints.get_mut(endpoint) {
            Some(mut metrics) => {
                metrics.error_count = metrics.error_count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Fold a response time sample into the moving average.
    ///
    /// Returns `false` if the endpoint is unknown or the sample is not a
    /// finite, non-negative number.
    pub fn record_response_time(&self, endpoint: &str, duration_ms: f64) -> bool {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return false;
        }
        match self.endpoints.get_mut(endpoint) {
            Some(mut metrics) => {
                metrics.average_response_time_ms = metrics.average_response_time_ms
                    * (1.0 - RESPONSE_TIME_ALPHA)
                    + duration_ms * RESPONSE_TIME_ALPHA;
                true
            }
            None => false,
        }
    }

    /// The current limit of an endpoint.
    pub fn current_limit(&self, endpoint: &str) -> Option<u64> {
        self.endpoints.get(endpoint).map(|m| m.current_limit)
    }

    /// A copy of an endpoint's metrics.
    pub fn get(&self, endpoint: &str) -> Option<EndpointMetrics> {
        self.endpoints.get(endpoint).map(|m| m.value().clone())
    }

    /// Mutate an endpoint's metrics under its lock.
    pub fn update<R>(&self, endpoint: &str, f: impl FnOnce(&mut EndpointMetrics) -> R) -> Option<R> {
        self.endpoints.get_mut(endpoint).map(|mut m| f(m.value_mut()))
    }
}

/// Engine-wide counters for degraded behavior that is never surfaced as an
/// error to callers.
#[derive(Debug, Default)]
pub struct EngineCounters {
    unknown_endpoint_checks: AtomicU64,
    clock_anomalies: AtomicU64,
    rejected_samples: AtomicU64,
    internal_failures: AtomicU64,
}

impl EngineCounters {
    /// A check against an unregistered endpoint was failed open.
    pub fn unknown_endpoint_check(&self) {
        self.unknown_endpoint_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// A timestamp earlier than already recorded state was observed.
    pub fn clock_anomaly(&self) {
        self.clock_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    /// An error or response time report was dropped.
    pub fn rejected_sample(&self) {
        self.rejected_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Engine state was inconsistent and a check was failed open.
    pub fn internal_failure(&self) {
        self.internal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_endpoint_checks(&self) -> u64 {
        self.unknown_endpoint_checks.load(Ordering::Relaxed)
    }

    pub fn clock_anomalies(&self) -> u64 {
        self.clock_anomalies.load(Ordering::Relaxed)
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples.load(Ordering::Relaxed)
    }

    pub fn internal_failures(&self) -> u64 {
        self.internal_failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one endpoint, for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointMetricsSnapshot {
    pub endpoint: String,
    pub base_limit: u64,
    pub current_limit: u64,
    pub adjustment_factor: f64,
    pub state: LimitState,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub last_adjustment_at: Timestamp,
    /// Identifiers with a live window entry set
    pub tracked_identifiers: usize,
}

impl EndpointMetricsSnapshot {
    pub(crate) fn new(
        endpoint: &str,
        config: &EndpointConfig,
        metrics: &EndpointMetrics,
        tracked_identifiers: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            base_limit: config.base_limit,
            current_limit: metrics.current_limit,
            adjustment_factor: metrics.adjustment_factor,
            state: LimitState::from_factor(metrics.adjustment_factor),
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            error_rate: metrics.error_rate(),
            average_response_time_ms: metrics.average_response_time_ms,
            last_adjustment_at: metrics.last_adjustment_at,
            tracked_identifiers,
        }
    }
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub endpoints: Vec<EndpointMetricsSnapshot>,
    pub unknown_endpoint_checks: u64,
    pub clock_anomalies: u64,
    pub rejected_samples: u64,
    pub internal_failures: u64,
}

impl MetricsSnapshot {
    /// Find an endpoint's entry.
    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointMetricsSnapshot> {
        self.endpoints.iter().find(|e| e.endpoint == endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(endpoint: &str, base_limit: u64) -> MetricsTracker {
        let tracker = MetricsTracker::new();
        tracker.init(endpoint, &EndpointConfig::new(base_limit, 60_000), 0);
        tracker
    }

    #[test]
    fn test_init_defaults() {
        let tracker = tracker_with("/api", 25);
        let metrics = tracker.get("/api").unwrap();

        assert_eq!(metrics.adjustment_factor, 1.0);
        assert_eq!(metrics.current_limit, 25);
        assert_eq!(metrics.request_count, 0);
        assert_eq!(metrics.error_count, 0);
        assert_eq!(metrics.average_response_time_ms, 0.0);
    }

    #[test]
    fn test_record_request_returns_limit() {
        let tracker = tracker_with("/api", 25);

        assert_eq!(tracker.record_request("/api"), Some(25));
        assert_eq!(tracker.record_request("/api"), Some(25));
        assert_eq!(tracker.get("/api").unwrap().request_count, 2);
        assert_eq!(tracker.record_request("/missing"), None);
    }

    #[test]
    fn test_record_error_unknown_endpoint_is_noop() {
        let tracker = tracker_with("/api", 10);

        assert!(tracker.record_error("/api"));
        assert!(!tracker.record_error("/missing"));
        assert_eq!(tracker.get("/api").unwrap().error_count, 1);
    }

    #[test]
    fn test_response_time_ema() {
        let tracker = tracker_with("/api", 10);

        assert!(tracker.record_response_time("/api", 1000.0));
        let avg = tracker.get("/api").unwrap().average_response_time_ms;
        assert!((avg - 100.0).abs() < 1e-9);

        assert!(tracker.record_response_time("/api", 1000.0));
        let avg = tracker.get("/api").unwrap().average_response_time_ms;
        assert!((avg - 190.0).abs() < 1e-9);
    }

    #[test]
    fn test_response_time_rejects_bad_samples() {
        let tracker = tracker_with("/api", 10);

        assert!(!tracker.record_response_time("/api", f64::NAN));
        assert!(!tracker.record_response_time("/api", -5.0));
        assert!(!tracker.record_response_time("/missing", 5.0));
        assert_eq!(tracker.get("/api").unwrap().average_response_time_ms, 0.0);
    }

    #[test]
    fn test_error_rate() {
        let tracker = tracker_with("/api", 10);
        assert_eq!(tracker.get("/api").unwrap().error_rate(), 0.0);

        for _ in 0..4 {
            tracker.record_request("/api");
        }
        tracker.record_error("/api");
        assert!((tracker.get("/api").unwrap().error_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_limit_state() {
        assert_eq!(LimitState::from_factor(1.0), LimitState::Nominal);
        assert_eq!(LimitState::from_factor(1.1), LimitState::Relaxed);
        assert_eq!(LimitState::from_factor(0.8), LimitState::Throttled);
    }

    #[test]
    fn test_engine_counters() {
        let counters = EngineCounters::default();
        counters.unknown_endpoint_check();
        counters.clock_anomaly();
        counters.clock_anomaly();
        counters.rejected_sample();
        counters.internal_failure();

        assert_eq!(counters.unknown_endpoint_checks(), 1);
        assert_eq!(counters.internal_failures(), 1);
        assert_eq!(counters.clock_anomalies(), 2);
        assert_eq!(counters.rejected_samples(), 1);
    }
}
