//! The adaptive rate limiter service object.
//!
//! [`AdaptiveRateLimiter`] ties the components together and owns the
//! background tasks. Construct one per application (or per test), register
//! endpoints, call [`start`](AdaptiveRateLimiter::start), and call
//! [`shutdown`](AdaptiveRateLimiter::shutdown) before exiting.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::cleaner::Cleaner;
use super::clock::{Clock, SystemClock, Timestamp};
use super::controller::{Adjustment, AdjustmentController};
use super::endpoint::{ConfigStore, EndpointConfig, EndpointRule};
use super::metrics::{EndpointMetricsSnapshot, EngineCounters, MetricsSnapshot, MetricsTracker};
use super::window::{SweepStats, WindowCounter};
use crate::config::EngineSettings;
use crate::error::{ConfigError, FloodgateError, Result};

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests this identifier may still make in the current window
    pub remaining: u64,
    /// When the window ends, counted from this check (ms since epoch)
    pub reset_at: Timestamp,
    /// The limit the request was checked against
    pub current_limit: u64,
}

impl LimitDecision {
    /// Time left until `reset_at`, for a retry-after hint.
    pub fn retry_after(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.reset_at.saturating_sub(now))
    }

    /// Rate limit response headers. The reset value is in epoch seconds.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.current_limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.div_ceil(1000).to_string()),
        ]
    }
}

/// Adaptive admission control over a set of registered endpoints.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct AdaptiveRateLimiter {
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    configs: Arc<ConfigStore>,
    metrics: Arc<MetricsTracker>,
    windows: Arc<WindowCounter>,
    counters: EngineCounters,
    controller: Arc<AdjustmentController>,
    cleaner: Arc<Cleaner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdaptiveRateLimiter {
    /// Create a limiter that reads the wall clock.
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        let configs = Arc::new(ConfigStore::new());
        let metrics = Arc::new(MetricsTracker::new());
        let windows = Arc::new(WindowCounter::new());
        let controller = Arc::new(AdjustmentController::new(
            configs.clone(),
            metrics.clone(),
            windows.clone(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            configs.clone(),
            windows.clone(),
            settings.retention_ms,
        ));

        Self {
            settings,
            clock,
            configs,
            metrics,
            windows,
            counters: EngineCounters::default(),
            controller,
            cleaner,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The engine settings this limiter was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register an endpoint. Fails if the configuration is invalid or the
    /// key is already registered.
    pub fn register_endpoint(
        &self,
        endpoint: &str,
        config: EndpointConfig,
    ) -> std::result::Result<(), ConfigError> {
        self.configs.register(endpoint, config)?;
        self.windows.register_endpoint(endpoint);
        self.metrics.init(endpoint, &config, self.clock.now_ms());
        Ok(())
    }

    /// Register every rule, stopping at the first one that is rejected.
    pub fn register_all(&self, rules: &[EndpointRule]) -> std::result::Result<(), ConfigError> {
        rules
            .iter()
            .try_for_each(|rule| self.register_endpoint(&rule.key, rule.config))
    }

    /// Decide whether a request from `identifier` to `endpoint` at `now` is
    /// admitted, recording it if so.
    ///
    /// Never fails: unknown endpoints and internal inconsistencies are
    /// admitted. A registered endpoint's request counter is incremented
    /// before the window lookup, so a check that fails open because the
    /// endpoint has no window map is still counted as a request.
    pub fn check_limit(&self, endpoint: &str, identifier: &str, now: Timestamp) -> LimitDecision {
        let Some(config) = self.configs.get(endpoint) else {
            self.counters.unknown_endpoint_check();
            warn!(
                endpoint = %endpoint,
                identifier = %identifier,
                "Unknown endpoint, failing open"
            );
            return self.fail_open(now);
        };

        // Counted before the decision so denials feed the health signal too.
        let Some(current_limit) = self.metrics.record_request(endpoint) else {
            self.counters.internal_failure();
            error!(endpoint = %endpoint, "Endpoint has no metrics, failing open");
            return self.fail_open(now);
        };

        let Some(outcome) = self.windows.check_and_record(
            endpoint,
            identifier,
            now,
            config.window_ms,
            current_limit,
        ) else {
            self.counters.internal_failure();
            error!(endpoint = %endpoint, "Endpoint has no window map, failing open");
            return self.fail_open(now);
        };

        if outcome.clock_anomaly {
            self.counters.clock_anomaly();
            warn!(
                endpoint = %endpoint,
                identifier = %identifier,
                now = now,
                "Check time is earlier than the newest window entry"
            );
        }

        let decision = LimitDecision {
            allowed: outcome.allowed,
            remaining: current_limit.saturating_sub(outcome.count),
            reset_at: now.saturating_add(config.window_ms),
            current_limit,
        };

        if decision.allowed {
            trace!(
                endpoint = %endpoint,
                identifier = %identifier,
                remaining = decision.remaining,
                limit = current_limit,
                "Request admitted"
            );
        } else {
            debug!(
                endpoint = %endpoint,
                identifier = %identifier,
                limit = current_limit,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// [`check_limit`](Self::check_limit) at the limiter's current time.
    pub fn check(&self, endpoint: &str, identifier: &str) -> LimitDecision {
        self.check_limit(endpoint, identifier, self.clock.now_ms())
    }

    fn fail_open(&self, now: Timestamp) -> LimitDecision {
        LimitDecision {
            allowed: true,
            remaining: self.settings.fail_open_limit,
            reset_at: now.saturating_add(self.settings.fail_open_window_ms),
            current_limit: self.settings.fail_open_limit,
        }
    }

    /// Count a failed request against an endpoint. Never fails.
    pub fn record_error(&self, endpoint: &str) {
        if !self.metrics.record_error(endpoint) {
            self.counters.rejected_sample();
            debug!(endpoint = %endpoint, "Dropped error report for unknown endpoint");
        }
    }

    /// Fold a response time into an endpoint's moving average. Never fails.
    pub fn record_response_time(&self, endpoint: &str, duration_ms: f64) {
        if !self.metrics.record_response_time(endpoint, duration_ms) {
            self.counters.rejected_sample();
            debug!(
                endpoint = %endpoint,
                duration_ms = duration_ms,
                "Dropped response time sample"
            );
        }
    }

    /// Snapshot metrics for one endpoint, or for all of them with `None`.
    pub fn get_metrics(&self, endpoint: Option<&str>) -> MetricsSnapshot {
        let keys = match endpoint {
            Some(endpoint) => vec![endpoint.to_string()],
            None => self.configs.keys(),
        };

        let endpoints = keys
            .iter()
            .filter_map(|key| {
                let config = self.configs.get(key)?;
                let metrics = self.metrics.get(key)?;
                Some(EndpointMetricsSnapshot::new(
                    key,
                    &config,
                    &metrics,
                    self.windows.tracked_identifiers(key),
                ))
            })
            .collect();

        MetricsSnapshot {
            generated_at: chrono::Utc::now(),
            endpoints,
            unknown_endpoint_checks: self.counters.unknown_endpoint_checks(),
            clock_anomalies: self.counters.clock_anomalies(),
            rejected_samples: self.counters.rejected_samples(),
            internal_failures: self.counters.internal_failures(),
        }
    }

    /// Run one adjustment pass at `now`.
    pub fn run_adjustment(&self, now: Timestamp) -> Vec<Adjustment> {
        self.controller.run_once(now)
    }

    /// Run one retention sweep at `now`.
    pub fn run_cleanup(&self, now: Timestamp) -> SweepStats {
        self.cleaner.run_once(now)
    }

    /// Spawn the adjustment controller and cleaner on the current tokio
    /// runtime. Calling this while already running does nothing.
    ///
    /// Fails if the engine settings are invalid, the limiter has been shut
    /// down, or there is no runtime.
    pub fn start(&self) -> Result<()> {
        self.settings.validate()?;
        if self.cancel.is_cancelled() {
            return Err(FloodgateError::Lifecycle(
                "limiter has been shut down".to_string(),
            ));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(FloodgateError::Lifecycle(
                "start must be called from within a tokio runtime".to_string(),
            ));
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Background tasks already running");
            return Ok(());
        }

        let controller = self.controller.clone();
        tasks.push(spawn_periodic(
            "adjustment controller",
            Duration::from_millis(self.settings.adjustment_tick_ms),
            self.clock.clone(),
            self.cancel.clone(),
            move |now| {
                controller.run_once(now);
            },
        ));

        let cleaner = self.cleaner.clone();
        tasks.push(spawn_periodic(
            "cleaner",
            Duration::from_millis(self.settings.cleanup_tick_ms),
            self.clock.clone(),
            self.cancel.clone(),
            move |now| {
                cleaner.run_once(now);
            },
        ));

        info!(
            adjustment_tick_ms = self.settings.adjustment_tick_ms,
            cleanup_tick_ms = self.settings.cleanup_tick_ms,
            retention_ms = self.settings.retention_ms,
            "Background tasks started"
        );
        Ok(())
    }

    /// Stop the background tasks and wait for them to exit. In-flight checks
    /// are unaffected. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }

        info!("Rate limiter shut down");
    }

    /// Whether background tasks are currently running.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.lock().is_empty()
    }
}

impl Drop for AdaptiveRateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `f` every `period` until `cancel` fires. The first run happens one
/// period after spawning.
fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    f: F,
) -> JoinHandle<()>
where
    F: Fn(Timestamp) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "Background task cancelled");
                    return;
                }
                _ = interval.tick() => {
                    f(clock.now_ms());
                }
            }
        }
    })
}
