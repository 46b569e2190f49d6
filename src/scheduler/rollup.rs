//! Rollup manager for aggregating ping samples into latency buckets.

use crate::db::{
    deserialize_tdigest, digest_from_values, merge_digests, serialize_tdigest, RollupBucket, Store,
};
use crate::telemetry::{EntityKey, Sample};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Samples newer than this are still arriving through the batch writer.
const SETTLE_SECS: i64 = 5;

/// A retention policy for a data window. Window 0 is raw samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub window: i32,
    pub retention: i64,
}

/// Default retention policies.
pub fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy { window: 0, retention: 2592000 },     // Raw: 30 days
        RetentionPolicy { window: 60, retention: 7776000 },    // 1m: 90 days
        RetentionPolicy { window: 300, retention: 31536000 },  // 5m: 1 year
        RetentionPolicy { window: 3600, retention: 157680000 }, // 1h: 5 years
    ]
}

/// Validate retention policies.
pub fn validate_retention_policies(policies: &[RetentionPolicy]) -> Result<(), String> {
    let mut sorted = policies.to_vec();
    sorted.sort_by_key(|p| p.window);

    for (i, p) in sorted.iter().enumerate() {
        if p.window < 0 {
            return Err("retention window cannot be negative".to_string());
        }
        if p.retention <= 0 {
            return Err(format!("window {} needs a positive retention", p.window));
        }
        if i > 0 {
            let prev_window = sorted[i - 1].window;
            if prev_window == p.window {
                return Err(format!("window {} is listed twice", p.window));
            }
            if prev_window > 0 && p.window % prev_window != 0 {
                return Err(format!(
                    "window {} is not a multiple of smaller window {}",
                    p.window, prev_window
                ));
            }
        }
    }

    Ok(())
}

/// Manager for rolling up raw samples into time windows.
pub struct RollupManager {
    store: Store,
    policies: Vec<RetentionPolicy>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RollupManager {
    pub fn new(store: Store, policies: Vec<RetentionPolicy>) -> Self {
        Self {
            store,
            policies,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the rollup manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let policies = self.policies.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(10));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_rollups(&store, &policies, Utc::now());
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Advance every entity's rollups up to `now`.
pub fn process_rollups(store: &Store, policies: &[RetentionPolicy], now: DateTime<Utc>) {
    let entities = match store.get_entities() {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("RollupManager: Failed to get entities: {}", e);
            return;
        }
    };

    let mut windows: Vec<i32> = policies.iter().map(|p| p.window).filter(|w| *w > 0).collect();
    windows.sort_unstable();

    for entity in entities {
        let mut source_window = 0;
        for &window in &windows {
            process_entity_window(store, &entity.key, window, source_window, now);
            source_window = window;
        }
    }
}

/// Roll up every complete `window_seconds` bucket for one entity.
///
/// Buckets are built from raw samples when `source_window` is 0, otherwise
/// from the next-smaller bucket size.
pub fn process_entity_window(
    store: &Store,
    entity: &EntityKey,
    window_seconds: i32,
    source_window: i32,
    now: DateTime<Utc>,
) {
    let window = ChronoDuration::seconds(window_seconds as i64);

    let mut next_window_start = match store.get_last_rollup_time(entity, window_seconds) {
        Ok(Some(last_time)) => last_time + window,
        Ok(None) => match store.get_earliest_sample_time(entity) {
            Ok(Some(earliest)) => truncate_to_window(earliest, window_seconds),
            Ok(None) => return,
            Err(e) => {
                tracing::error!("RollupManager: Error getting earliest time for {}: {}", entity, e);
                return;
            }
        },
        Err(e) => {
            tracing::error!("RollupManager: Failed to get last rollup time for {}: {}", entity, e);
            return;
        }
    };

    let cutoff = now - ChronoDuration::seconds(SETTLE_SECS);
    let mut buckets = Vec::new();

    loop {
        let window_end = next_window_start + window;
        if window_end > cutoff {
            break;
        }

        match aggregate_window(store, entity, window_seconds, source_window, next_window_start, window_end) {
            Some(bucket) => buckets.push(bucket),
            None => break,
        }

        next_window_start = window_end;
    }

    if buckets.is_empty() {
        return;
    }

    let count = buckets.len();
    if let Err(e) = store.add_rollups(&buckets) {
        tracing::error!(
            "RollupManager: Failed to save batch for {} (w={}s): {}",
            entity,
            window_seconds,
            e
        );
    } else {
        tracing::debug!(
            "RollupManager: Saved {} rollups for {} (w={}s)",
            count,
            entity,
            window_seconds
        );
    }
}

/// Latency, timeouts and loss for a set of ping samples.
pub fn summarize_pings(samples: &[Sample]) -> (Vec<f64>, i64, Option<f64>, i64) {
    let mut latencies = Vec::new();
    let mut timeouts = 0;
    let mut loss_sum = 0.0;
    let mut count = 0;

    for ping in samples.iter().filter_map(|s| s.ping.as_ref()) {
        count += 1;
        loss_sum += ping.loss_pct;
        match ping.rtt_ms {
            Some(rtt) => latencies.push(rtt),
            None => timeouts += 1,
        }
    }

    let loss_avg = (count > 0).then(|| loss_sum / count as f64);
    (latencies, timeouts, loss_avg, count)
}

/// Aggregate one bucket. Returns `None` only when the source could not be read,
/// so the caller retries on the next pass.
fn aggregate_window(
    store: &Store,
    entity: &EntityKey,
    window_seconds: i32,
    source_window: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<RollupBucket> {
    let mut bucket = RollupBucket {
        time: start,
        entity: entity.clone(),
        window_seconds,
        tdigest_data: Vec::new(),
        loss_avg: None,
        timeout_count: 0,
        sample_count: 0,
    };

    if source_window == 0 {
        let samples = match store.get_samples(entity, start, end) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("RollupManager: Error fetching samples for {}: {}", entity, e);
                return None;
            }
        };

        let (latencies, timeouts, loss_avg, count) = summarize_pings(&samples);
        bucket.timeout_count = timeouts;
        bucket.loss_avg = loss_avg;
        bucket.sample_count = count;
        if let Some(td) = digest_from_values(latencies) {
            bucket.tdigest_data = serialize_tdigest(&td);
        }
    } else {
        let subs = match store.get_rollups(entity, source_window, start, end) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("RollupManager: Error fetching rollups for {}: {}", entity, e);
                return None;
            }
        };

        let mut loss_weighted = 0.0;
        let mut loss_weight = 0;
        for sub in &subs {
            bucket.timeout_count += sub.timeout_count;
            bucket.sample_count += sub.sample_count;
            if let Some(loss) = sub.loss_avg {
                loss_weighted += loss * sub.sample_count as f64;
                loss_weight += sub.sample_count;
            }
        }
        bucket.loss_avg = (loss_weight > 0).then(|| loss_weighted / loss_weight as f64);

        let digests = subs.iter().filter_map(|sub| {
            let td = deserialize_tdigest(&sub.tdigest_data);
            if td.is_none() && !sub.tdigest_data.is_empty() {
                tracing::warn!(
                    "RollupManager: Skipping undecodable digest for {} at {}",
                    entity,
                    sub.time
                );
            }
            td
        });
        if let Some(td) = merge_digests(digests.collect::<Vec<_>>()) {
            bucket.tdigest_data = serialize_tdigest(&td);
        }
    }

    if bucket.sample_count > 0 {
        tracing::debug!(
            "RollupManager: Aggregated {} (w={}s) at {}: {} samples, {} timeouts",
            entity,
            window_seconds,
            start.format("%H:%M:%S"),
            bucket.sample_count,
            bucket.timeout_count
        );
    }

    Some(bucket)
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i32) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds as i64);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_tdigest_stats, StoredSample};
    use crate::telemetry::{EntityInfo, EntityKind};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_window(dt, 60), Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 300), Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap());
        assert_eq!(truncate_to_window(dt, 3600), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_validate_retention_policies() {
        assert!(validate_retention_policies(&default_policies()).is_ok());

        let invalid = vec![
            RetentionPolicy { window: 60, retention: 86400 },
            RetentionPolicy { window: 90, retention: 86400 },
        ];
        assert!(validate_retention_policies(&invalid).is_err());

        let negative = vec![RetentionPolicy { window: -1, retention: 86400 }];
        assert!(validate_retention_policies(&negative).is_err());

        let duplicate = vec![
            RetentionPolicy { window: 60, retention: 86400 },
            RetentionPolicy { window: 60, retention: 3600 },
        ];
        assert!(validate_retention_policies(&duplicate).is_err());
    }

    #[test]
    fn test_summarize_pings_skips_other_families() {
        let samples = vec![
            Sample::ping(t(0), 0.0, Some(10.0)),
            Sample::ping(t(1), 100.0, None),
            Sample::optical(t(2), Some(-20.0), None),
            Sample::ping(t(3), 50.0, Some(30.0)),
        ];
        let (latencies, timeouts, loss_avg, count) = summarize_pings(&samples);
        assert_eq!(latencies, vec![10.0, 30.0]);
        assert_eq!(timeouts, 1);
        assert_eq!(loss_avg, Some(50.0));
        assert_eq!(count, 3);
    }

    #[test]
    fn test_rollups_cascade_from_raw() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let a = EntityKey::new("a").unwrap();
        store.upsert_entity(&EntityInfo::new(a.clone(), EntityKind::AccountPing)).unwrap();

        let samples: Vec<StoredSample> = (0..600)
            .map(|i| StoredSample {
                entity: a.clone(),
                sample: if i % 10 == 0 {
                    Sample::ping(t(i), 100.0, None)
                } else {
                    Sample::ping(t(i), 0.0, Some((i % 50) as f64))
                },
            })
            .collect();
        store.add_samples(&samples).unwrap();

        process_rollups(&store, &default_policies(), t(700));

        let minutes = store.get_rollups(&a, 60, t(0), t(600)).unwrap();
        assert_eq!(minutes.len(), 10);
        assert_eq!(minutes[0].sample_count, 60);
        assert_eq!(minutes[0].timeout_count, 6);
        assert!((minutes[0].loss_avg.unwrap() - 10.0).abs() < 1e-9);

        let fives = store.get_rollups(&a, 300, t(0), t(600)).unwrap();
        assert_eq!(fives.len(), 2);
        assert_eq!(fives[0].sample_count, 300);
        assert_eq!(fives[0].timeout_count, 30);
        let td = deserialize_tdigest(&fives[0].tdigest_data).unwrap();
        let (_, _, _, weight) = get_tdigest_stats(&td);
        assert!((weight - 270.0).abs() < 1e-6);

        // The hour bucket is not complete yet.
        assert!(store.get_rollups(&a, 3600, t(0), t(3600)).unwrap().is_empty());

        // A second pass does not duplicate buckets.
        process_rollups(&store, &default_policies(), t(700));
        assert_eq!(store.get_rollups(&a, 60, t(0), t(600)).unwrap().len(), 10);
    }
}
