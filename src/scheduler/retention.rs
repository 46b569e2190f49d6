//! Retention manager for cleaning up old data.

use crate::db::Store;

use super::rollup::RetentionPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Store,
    policies: Vec<RetentionPolicy>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Store, policies: Vec<RetentionPolicy>) -> Self {
        Self {
            store,
            policies,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
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
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, &policies, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete raw samples and rollup buckets older than their retention.
pub fn process_retention(store: &Store, policies: &[RetentionPolicy], now: DateTime<Utc>) {
    for policy in policies {
        let cutoff = now - ChronoDuration::seconds(policy.retention);

        let result = if policy.window == 0 {
            store.delete_samples_before(cutoff)
        } else {
            store.delete_rollups_before(policy.window, cutoff)
        };

        match result {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(
                "RetentionManager: Deleted {} rows (w={}s) older than {}",
                deleted,
                policy.window,
                cutoff.format("%Y-%m-%d %H:%M:%S")
            ),
            Err(e) => tracing::error!(
                "RetentionManager: Failed to delete rows (w={}s): {}",
                policy.window,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RollupBucket, StoredSample};
    use crate::telemetry::{EntityKey, Sample};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_retention_per_window() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let a = EntityKey::new("a").unwrap();

        store
            .add_samples(&[
                StoredSample { entity: a.clone(), sample: Sample::ping(t(0), 0.0, Some(1.0)) },
                StoredSample { entity: a.clone(), sample: Sample::ping(t(5000), 0.0, Some(1.0)) },
            ])
            .unwrap();
        let bucket = |secs: i64, window: i32| RollupBucket {
            time: t(secs),
            entity: a.clone(),
            window_seconds: window,
            tdigest_data: Vec::new(),
            loss_avg: None,
            timeout_count: 0,
            sample_count: 0,
        };
        store.add_rollups(&[bucket(0, 60), bucket(0, 300), bucket(4800, 60)]).unwrap();

        let policies = vec![
            RetentionPolicy { window: 0, retention: 3600 },
            RetentionPolicy { window: 60, retention: 3600 },
            RetentionPolicy { window: 300, retention: 86400 },
        ];
        process_retention(&store, &policies, t(6000));

        assert_eq!(store.get_samples_since(t(0)).unwrap().len(), 1);
        assert_eq!(store.get_rollups(&a, 60, t(0), t(6000)).unwrap().len(), 1);
        assert_eq!(store.get_rollups(&a, 300, t(0), t(6000)).unwrap().len(), 1);
    }
}
