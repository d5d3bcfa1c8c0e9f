//! Retention sweep for window entries.

use std::sync::Arc;
use tracing::{debug, info};

use super::clock::Timestamp;
use super::endpoint::ConfigStore;
use super::window::{SweepStats, WindowCounter};

/// Default retention horizon: 24 hours.
pub const DEFAULT_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

/// Removes window entries older than the retention horizon so rotating or
/// abandoned identifiers do not grow memory without bound.
///
/// An endpoint whose window is longer than the retention horizon is swept
/// with its window instead, so live entries are never dropped.
pub struct Cleaner {
    configs: Arc<ConfigStore>,
    windows: Arc<WindowCounter>,
    retention_ms: u64,
}

impl Cleaner {
    /// Create a cleaner over `windows` with a global retention horizon.
    pub fn new(configs: Arc<ConfigStore>, windows: Arc<WindowCounter>, retention_ms: u64) -> Self {
        Self {
            configs,
            windows,
            retention_ms,
        }
    }

    /// Retention horizon applied to one endpoint.
    fn horizon_ms(&self, endpoint: &str) -> u64 {
        self.configs
            .get(endpoint)
            .map_or(self.retention_ms, |config| config.window_ms.max(self.retention_ms))
    }

    /// Run one sweep at `now`.
    pub fn run_once(&self, now: Timestamp) -> SweepStats {
        let stats = self.windows.sweep(now, |endpoint| self.horizon_ms(endpoint));

        if stats.identifiers_removed > 0 {
            info!(
                entries_removed = stats.entries_removed,
                identifiers_removed = stats.identifiers_removed,
                identifiers_remaining = self.windows.total_identifiers(),
                "Swept stale window entries"
            );
        } else {
            debug!(
                entries_removed = stats.entries_removed,
                "Window sweep found nothing to delete"
            );
        }

        stats
    }
}
