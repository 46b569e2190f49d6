//! Bounded per-entity sample history.
//!
//! Each entity owns a time-ordered ring guarded by its own mutex, so an
//! append on one entity never waits on a reader of another. The outer map
//! is only write-locked when a new entity appears.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{EntityKey, Horizon, Sample, SampleError};

/// Capacity and retention of the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePolicy {
    /// Most recent samples kept per entity.
    pub raw_capacity: usize,
    /// Samples older than this (relative to the newest one) are evicted.
    pub retention_secs: i64,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            raw_capacity: 50_000,
            retention_secs: Horizon::largest().seconds(),
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Series version after the append; bumps on every write.
    pub version: u64,
    /// Samples evicted by this write.
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<Sample>,
    version: u64,
}

impl Series {
    fn insert(&mut self, sample: Sample) {
        match self.samples.back() {
            Some(last) if sample.at < last.at => {
                // Late arrival: place it after any samples sharing its timestamp.
                let idx = self.samples.partition_point(|s| s.at <= sample.at);
                self.samples.insert(idx, sample);
            }
            _ => self.samples.push_back(sample),
        }
    }

    fn evict(&mut self, capacity: usize, retention: ChronoDuration) -> usize {
        let before = self.samples.len();

        while self.samples.len() > capacity {
            self.samples.pop_front();
        }

        if let Some(newest) = self.samples.back().map(|s| s.at) {
            let cutoff = newest - retention;
            while self.samples.front().is_some_and(|s| s.at < cutoff) {
                self.samples.pop_front();
            }
        }

        before - self.samples.len()
    }

    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Sample> {
        let from = self.samples.partition_point(|s| s.at < start);
        let to = self.samples.partition_point(|s| s.at <= end);
        self.samples.range(from..to.max(from)).cloned().collect()
    }
}

/// Thread-safe rollup store.
pub struct RollupStore {
    series: RwLock<HashMap<EntityKey, Arc<Mutex<Series>>>>,
    capacity: usize,
    retention: ChronoDuration,
}

impl RollupStore {
    pub fn new(policy: &StorePolicy) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            capacity: policy.raw_capacity.max(1),
            retention: ChronoDuration::seconds(policy.retention_secs.max(1)),
        }
    }

    fn series_for(&self, key: &EntityKey) -> Arc<Mutex<Series>> {
        if let Some(series) = self.series.read().get(key) {
            return series.clone();
        }
        self.series.write().entry(key.clone()).or_default().clone()
    }

    fn existing(&self, key: &EntityKey) -> Option<Arc<Mutex<Series>>> {
        self.series.read().get(key).cloned()
    }

    /// Validate and insert a sample in timestamp order, evicting lazily.
    pub fn append(&self, key: &EntityKey, sample: Sample) -> Result<Appended, SampleError> {
        sample.validate()?;

        let series = self.series_for(key);
        let mut series = series.lock();
        series.insert(sample);
        let evicted = series.evict(self.capacity, self.retention);
        series.version += 1;

        Ok(Appended {
            version: series.version,
            evicted,
        })
    }

    /// Samples within `[now - horizon, now]`, oldest first.
    pub fn window(&self, key: &EntityKey, horizon: Horizon) -> Vec<Sample> {
        self.window_at(key, horizon, Utc::now())
    }

    pub fn window_at(&self, key: &EntityKey, horizon: Horizon, now: DateTime<Utc>) -> Vec<Sample> {
        match self.existing(key) {
            Some(series) => series.lock().range(now - horizon.duration(), now),
            None => Vec::new(),
        }
    }

    /// Current version of an entity's series; 0 when unknown.
    pub fn version(&self, key: &EntityKey) -> u64 {
        self.existing(key).map(|s| s.lock().version).unwrap_or(0)
    }

    pub fn latest(&self, key: &EntityKey) -> Option<Sample> {
        self.existing(key).and_then(|s| s.lock().samples.back().cloned())
    }

    /// Number of samples strictly newer than `after`.
    pub fn count_after(&self, key: &EntityKey, after: DateTime<Utc>) -> usize {
        match self.existing(key) {
            Some(series) => {
                let series = series.lock();
                series.samples.len() - series.samples.partition_point(|s| s.at <= after)
            }
            None => 0,
        }
    }

    /// Outages within the window: samples with total loss whose predecessor
    /// was not a total loss.
    pub fn down_events_at(&self, key: &EntityKey, horizon: Horizon, now: DateTime<Utc>) -> usize {
        let mut events = 0;
        let mut was_down = false;
        for sample in self.window_at(key, horizon, now) {
            let Some(ping) = sample.ping else { continue };
            let down = ping.loss_pct >= 100.0;
            if down && !was_down {
                events += 1;
            }
            was_down = down;
        }
        events
    }

    pub fn len(&self, key: &EntityKey) -> usize {
        self.existing(key).map(|s| s.lock().samples.len()).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.series.read().keys().cloned().collect()
    }

    /// Rebuild windows from durable history after a restart.
    ///
    /// Invalid rows are skipped. Returns the number of samples loaded.
    pub fn restore(&self, samples: impl IntoIterator<Item = (EntityKey, Sample)>) -> usize {
        let mut loaded = 0;
        for (key, sample) in samples {
            match self.append(&key, sample) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!("RollupStore: skipping stored sample for {}: {}", key, e),
            }
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn key(s: &str) -> EntityKey {
        EntityKey::new(s).unwrap()
    }

    fn store(capacity: usize, retention_secs: i64) -> RollupStore {
        RollupStore::new(&StorePolicy {
            raw_capacity: capacity,
            retention_secs,
        })
    }

    #[test]
    fn test_out_of_order_appends_are_sorted() {
        let store = store(100, 86400);
        let a = key("a");
        for secs in [30, 10, 50, 20, 40, 0] {
            store.append(&a, Sample::ping(t(secs), 0.0, Some(secs as f64))).unwrap();
        }

        let window = store.window_at(&a, Horizon::SixHours, t(60));
        let times: Vec<_> = window.iter().map(|s| s.at).collect();
        assert_eq!(times, vec![t(0), t(10), t(20), t(30), t(40), t(50)]);
    }

    #[test]
    fn test_append_then_window_contains_sample() {
        let store = store(100, 86400);
        let a = key("a");
        store.append(&a, Sample::ping(t(100), 0.0, Some(1.0))).unwrap();
        store.append(&a, Sample::ping(t(300), 0.0, Some(3.0))).unwrap();
        store.append(&a, Sample::ping(t(200), 50.0, Some(2.0))).unwrap();

        let window = store.window_at(&a, Horizon::SixHours, t(300));
        assert_eq!(window.len(), 3);
        assert_eq!(window[1].at, t(200));
        assert_eq!(window[1].ping.unwrap().loss_pct, 50.0);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let store = store(3, 86400);
        let a = key("a");
        for secs in 0..5 {
            store.append(&a, Sample::ping(t(secs), 0.0, None)).unwrap();
        }
        let window = store.window_at(&a, Horizon::SixHours, t(10));
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].at, t(2));
    }

    #[test]
    fn test_retention_evicts_relative_to_newest() {
        let store = store(100, 3600);
        let a = key("a");
        store.append(&a, Sample::ping(t(0), 0.0, None)).unwrap();
        store.append(&a, Sample::ping(t(1800), 0.0, None)).unwrap();
        let appended = store.append(&a, Sample::ping(t(4000), 0.0, None)).unwrap();

        assert_eq!(appended.evicted, 1);
        assert_eq!(appended.version, 3);
        assert_eq!(store.len(&a), 2);
    }

    #[test]
    fn test_invalid_sample_leaves_history_intact() {
        let store = store(100, 86400);
        let a = key("a");
        store.append(&a, Sample::ping(t(0), 10.0, None)).unwrap();
        assert!(store.append(&a, Sample::ping(t(10), 150.0, None)).is_err());

        assert_eq!(store.len(&a), 1);
        assert_eq!(store.version(&a), 1);
    }

    #[test]
    fn test_unknown_entity_is_empty() {
        let store = store(100, 86400);
        assert!(store.window(&key("ghost"), Horizon::Day).is_empty());
        assert_eq!(store.version(&key("ghost")), 0);
        assert!(store.latest(&key("ghost")).is_none());
    }

    #[test]
    fn test_window_bounds_and_count_after() {
        let store = store(100, 86400 * 30);
        let a = key("a");
        for hours in 0..10 {
            store.append(&a, Sample::ping(t(hours * 3600), 0.0, None)).unwrap();
        }
        let window = store.window_at(&a, Horizon::SixHours, t(9 * 3600));
        assert_eq!(window.len(), 7);
        assert_eq!(window[0].at, t(3 * 3600));
        assert_eq!(store.count_after(&a, t(7 * 3600)), 2);
    }

    #[test]
    fn test_down_events_count_outage_starts() {
        let store = store(100, 86400);
        let a = key("a");
        for (i, loss) in [0.0, 100.0, 100.0, 0.0, 100.0, 50.0, 100.0].into_iter().enumerate() {
            store.append(&a, Sample::ping(t(i as i64 * 60), loss, None)).unwrap();
        }
        store.append(&a, Sample::optical(t(500), Some(-20.0), None)).unwrap();
        assert_eq!(store.down_events_at(&a, Horizon::SixHours, t(600)), 3);
        assert_eq!(store.down_events_at(&key("ghost"), Horizon::SixHours, t(600)), 0);
    }

    #[test]
    fn test_concurrent_appends() {
        let store = Arc::new(store(10_000, 86400));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let k = key("shared");
                    for i in 0..250 {
                        let secs = (i * 4 + worker) as i64;
                        store.append(&k, Sample::ping(t(secs), 0.0, None)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let window = store.window_at(&key("shared"), Horizon::Day, t(2000));
        assert_eq!(window.len(), 1000);
        assert!(window.windows(2).all(|w| w[0].at <= w[1].at));
    }
}
