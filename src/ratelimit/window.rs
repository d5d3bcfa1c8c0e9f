//! Sliding window counters.
//!
//! Every `(endpoint, identifier)` pair owns an ordered deque of the
//! timestamps of its accepted requests. Storage is two-level: endpoint key,
//! then identifier, so no composite string key is ever built and an
//! endpoint's identifiers can be aggregated without scanning the others.

use dashmap::DashMap;
use std::collections::VecDeque;

use super::clock::Timestamp;

type Entries = VecDeque<Timestamp>;

/// The result of one admission attempt against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was admitted and recorded
    pub allowed: bool,
    /// Live entries in the window after the attempt
    pub count: u64,
    /// `now` was earlier than the newest recorded entry
    pub clock_anomaly: bool,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Timestamps dropped across all identifiers
    pub entries_removed: usize,
    /// Identifiers whose entry set became empty and was deleted
    pub identifiers_removed: usize,
}

/// Per-identifier sliding windows for every registered endpoint.
///
/// The check-then-append step runs while holding the identifier's map
/// entry lock, so concurrent checks on one key are serialized and can never
/// admit more than the limit.
#[derive(Debug, Default)]
pub struct WindowCounter {
    endpoints: DashMap<String, DashMap<String, Entries>>,
}

impl WindowCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the identifier map for an endpoint.
    pub fn register_endpoint(&self, endpoint: &str) {
        self.endpoints.entry(endpoint.to_string()).or_default();
    }

    /// Prune the window for `(endpoint, identifier)` and admit the request
    /// if fewer than `limit` entries remain.
    ///
    /// Returns `None` if the endpoint was never registered with this counter.
    pub fn check_and_record(
        &self,
        endpoint: &str,
        identifier: &str,
        now: Timestamp,
        window_ms: u64,
        limit: u64,
    ) -> Option<WindowOutcome> {
        let identifiers = self.endpoints.get(endpoint)?;

        let outcome = match identifiers.get_mut(identifier) {
            Some(mut entries) => admit(entries.value_mut(), now, window_ms, limit),
            None => {
                let mut entries = identifiers.entry(identifier.to_string()).or_default();
                admit(entries.value_mut(), now, window_ms, limit)
            }
        };
        Some(outcome)
    }

    /// Accepted requests newer than `now - window_ms`, summed across every
    /// identifier of an endpoint.
    pub fn recent_activity(&self, endpoint: &str, now: Timestamp, window_ms: u64) -> u64 {
        let Some(identifiers) = self.endpoints.get(endpoint) else {
            return 0;
        };
        let cutoff = now.checked_sub(window_ms);

        let total: u64 = identifiers
            .iter()
            .map(|entries| match cutoff {
                Some(cutoff) => entries.iter().rev().take_while(|&&t| t > cutoff).count() as u64,
                None => entries.len() as u64,
            })
            .sum();
        total
    }

    /// Drop entries at or before `now - horizon_ms` and delete identifiers
    /// left with no entries. `horizon_ms` is looked up per endpoint key.
    pub fn sweep<H>(&self, now: Timestamp, horizon_ms: H) -> SweepStats
    where
        H: Fn(&str) -> u64,
    {
        let mut stats = SweepStats::default();

        for identifiers in self.endpoints.iter() {
            let horizon = horizon_ms(identifiers.key().as_str());
            identifiers.retain(|_, entries| {
                let before = entries.len();
                prune(entries, now, horizon);
                stats.entries_removed += before - entries.len();

                let keep = !entries.is_empty();
                if !keep {
                    stats.identifiers_removed += 1;
                }
                keep
            });
        }

        stats
    }

    /// Identifiers currently holding an entry set for an endpoint.
    pub fn tracked_identifiers(&self, endpoint: &str) -> usize {
        self.endpoints.get(endpoint).map_or(0, |ids| ids.len())
    }

    /// Identifiers holding an entry set, across all endpoints.
    pub fn total_identifiers(&self) -> usize {
        self.endpoints.iter().map(|ids| ids.len()).sum()
    }

    /// Recorded entries for one key, including ones not yet pruned.
    pub fn entry_count(&self, endpoint: &str, identifier: &str) -> usize {
        let Some(identifiers) = self.endpoints.get(endpoint) else {
            return 0;
        };
        let count = identifiers.get(identifier).map_or(0, |entries| entries.len());
        count
    }
}

fn admit(entries: &mut Entries, now: Timestamp, window_ms: u64, limit: u64) -> WindowOutcome {
    prune(entries, now, window_ms);

    let newest = entries.back().copied();
    let clock_anomaly = newest.is_some_and(|newest| newest > now);
    let count = entries.len() as u64;

    if count < limit {
        // Keep the deque ordered even if the clock stepped backwards.
        let stamp = newest.map_or(now, |newest| newest.max(now));
        entries.push_back(stamp);
        WindowOutcome {
            allowed: true,
            count: count + 1,
            clock_anomaly,
        }
    } else {
        WindowOutcome {
            allowed: false,
            count,
            clock_anomaly,
        }
    }
}

/// Remove entries at or before `now - horizon_ms`. While `now` is still
/// inside the first horizon nothing has expired.
fn prune(entries: &mut Entries, now: Timestamp, horizon_ms: u64) {
    let Some(cutoff) = now.checked_sub(horizon_ms) else {
        return;
    };
    while entries.front().is_some_and(|&t| t <= cutoff) {
        entries.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const WINDOW: u64 = 60_000;

    fn counter() -> WindowCounter {
        let counter = WindowCounter::new();
        counter.register_endpoint("/api");
        counter
    }

    #[test]
    fn test_admits_up_to_limit() {
        let counter = counter();

        for i in 1..=5 {
            let outcome = counter.check_and_record("/api", "ip1", 0, WINDOW, 5).unwrap();
            assert!(outcome.allowed, "request {} should be admitted", i);
            assert_eq!(outcome.count, i);
        }

        let outcome = counter.check_and_record("/api", "ip1", 0, WINDOW, 5).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 5);
        assert_eq!(counter.entry_count("/api", "ip1"), 5);
    }

    #[test]
    fn test_window_slides() {
        let counter = counter();

        for _ in 0..5 {
            counter.check_and_record("/api", "ip1", 0, WINDOW, 5);
        }
        let outcome = counter.check_and_record("/api", "ip1", WINDOW, WINDOW, 5).unwrap();
        assert!(outcome.allowed, "entries at exactly the cutoff have expired");
        assert_eq!(counter.entry_count("/api", "ip1"), 1);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let counter = counter();

        assert!(counter.check_and_record("/api", "a", 0, WINDOW, 1).unwrap().allowed);
        assert!(!counter.check_and_record("/api", "a", 0, WINDOW, 1).unwrap().allowed);
        assert!(counter.check_and_record("/api", "b", 0, WINDOW, 1).unwrap().allowed);
    }

    #[test]
    fn test_identifier_containing_separator_does_not_collide() {
        let counter = WindowCounter::new();
        counter.register_endpoint("a");
        counter.register_endpoint("a:b");

        assert!(counter.check_and_record("a", "b:c", 0, WINDOW, 1).unwrap().allowed);
        assert!(counter.check_and_record("a:b", "c", 0, WINDOW, 1).unwrap().allowed);
        assert_eq!(counter.entry_count("a", "b:c"), 1);
        assert_eq!(counter.entry_count("a:b", "c"), 1);
    }

    #[test]
    fn test_unregistered_endpoint() {
        let counter = WindowCounter::new();
        assert!(counter.check_and_record("/nope", "ip1", 0, WINDOW, 5).is_none());
        assert_eq!(counter.recent_activity("/nope", 0, WINDOW), 0);
    }

    #[test]
    fn test_backward_clock_keeps_order() {
        let counter = counter();

        let first = counter.check_and_record("/api", "ip1", 10_000, WINDOW, 5).unwrap();
        assert!(!first.clock_anomaly);

        let second = counter.check_and_record("/api", "ip1", 4_000, WINDOW, 5).unwrap();
        assert!(second.allowed);
        assert!(second.clock_anomaly);

        // The clamped entry expires together with the newest one.
        let later = counter
            .check_and_record("/api", "ip1", 10_000 + WINDOW, WINDOW, 5)
            .unwrap();
        assert_eq!(later.count, 1);
    }

    #[test]
    fn test_recent_activity_sums_identifiers() {
        let counter = counter();

        for id in ["a", "b", "c"] {
            counter.check_and_record("/api", id, 1_000, WINDOW, 10);
            counter.check_and_record("/api", id, 30_000, WINDOW, 10);
        }

        assert_eq!(counter.recent_activity("/api", 30_000, WINDOW), 6);
        // At 61_000 the entries stamped 1_000 fall out of the window.
        assert_eq!(counter.recent_activity("/api", 61_000, WINDOW), 3);
    }

    #[test]
    fn test_sweep_removes_stale_identifiers() {
        let counter = counter();
        let retention = 86_400_000;

        counter.check_and_record("/api", "old", 0, WINDOW, 10);
        counter.check_and_record("/api", "new", retention, WINDOW, 10);
        assert_eq!(counter.tracked_identifiers("/api"), 2);

        let stats = counter.sweep(retention + 1, |_| retention);
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.identifiers_removed, 1);
        assert_eq!(counter.tracked_identifiers("/api"), 1);
        assert_eq!(counter.entry_count("/api", "old"), 0);
        assert_eq!(counter.entry_count("/api", "new"), 1);
    }

    #[test]
    fn test_sweep_uses_per_endpoint_horizon() {
        let counter = counter();
        counter.register_endpoint("/slow");

        counter.check_and_record("/api", "ip1", 0, WINDOW, 10);
        counter.check_and_record("/slow", "ip1", 0, WINDOW, 10);

        let stats = counter.sweep(10_000, |endpoint| match endpoint {
            "/slow" => 20_000,
            _ => 5_000,
        });
        assert_eq!(stats.identifiers_removed, 1);
        assert_eq!(counter.entry_count("/api", "ip1"), 0);
        assert_eq!(counter.entry_count("/slow", "ip1"), 1);
    }

    #[test]
    fn test_sweep_with_clock_behind_entries_removes_nothing() {
        let counter = counter();
        counter.check_and_record("/api", "ip1", 100_000, WINDOW, 10);

        let stats = counter.sweep(50, |_| 1_000);
        assert_eq!(stats, SweepStats::default());
        assert_eq!(counter.total_identifiers(), 1);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let counter = Arc::new(counter());
        let admitted = Arc::new(AtomicU64::new(0));
        let limit = 50;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let outcome = counter
                            .check_and_record("/api", "shared", 1_000, WINDOW, limit)
                            .unwrap();
                        if outcome.allowed {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), limit);
        assert_eq!(counter.entry_count("/api", "shared"), limit as usize);
    }
}
