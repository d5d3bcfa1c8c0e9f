//! Adaptive admission control: sliding windows, health metrics, and the
//! feedback loop that tunes per-endpoint limits.

mod cleaner;
mod clock;
mod controller;
mod endpoint;
mod limiter;
mod metrics;
mod window;

pub use cleaner::{Cleaner, DEFAULT_RETENTION_MS};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use controller::{Adjustment, AdjustmentController, Direction, HealthSignals};
pub use endpoint::{ConfigStore, EndpointConfig, EndpointRule};
pub use limiter::{AdaptiveRateLimiter, LimitDecision};
pub use metrics::{
    EndpointMetrics, EndpointMetricsSnapshot, EngineCounters, LimitState, MetricsSnapshot,
    MetricsTracker,
};
pub use window::{SweepStats, WindowCounter, WindowOutcome};
