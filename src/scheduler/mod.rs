//! Scheduler module: sample ingest, periodic evaluation and data upkeep.

mod retention;
mod rollup;

pub use retention::*;
pub use rollup::*;

use crate::db::{DbError, Store, StoredSample};
use crate::surveillance::{SurveillanceManager, TickReport};
use crate::telemetry::{Appended, EntityInfo, EntityKey, EntityRegistry, RollupStore, Sample, SampleError};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Orchestrates ingest, the evaluation tick and the storage managers.
pub struct Scheduler {
    store: Store,
    registry: Arc<EntityRegistry>,
    rollups: Arc<RollupStore>,
    surveillance: Arc<SurveillanceManager>,
    sample_tx: parking_lot::Mutex<Option<mpsc::Sender<StoredSample>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ticks: AtomicU64,
    eval_interval: Duration,
    rollup_manager: RollupManager,
    retention_manager: RetentionManager,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    /// Create a scheduler and start its batch writer. Must run inside a tokio runtime.
    pub fn new(
        store: Store,
        registry: Arc<EntityRegistry>,
        rollups: Arc<RollupStore>,
        surveillance: Arc<SurveillanceManager>,
        retention: Vec<RetentionPolicy>,
        eval_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));

        Self {
            rollup_manager: RollupManager::new(store.clone(), retention.clone()),
            retention_manager: RetentionManager::new(store.clone(), retention),
            store,
            registry,
            rollups,
            surveillance,
            sample_tx: parking_lot::Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            ticks: AtomicU64::new(0),
            eval_interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the evaluation loop and the rollup/retention managers.
    pub async fn start(self: &Arc<Self>) {
        tracing::info!(
            "Starting scheduler with {} entities, evaluating every {:?}",
            self.registry.len(),
            self.eval_interval
        );

        let (tx, _) = tokio::sync::broadcast::channel(1);
        *self.stop.lock().await = Some(tx.clone());

        let scheduler = self.clone();
        let mut rx = tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.eval_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let evaluator = scheduler.clone();
                        let result = tokio::task::spawn_blocking(move || evaluator.tick(Utc::now())).await;
                        if let Err(e) = result {
                            tracing::error!("Scheduler: evaluation task failed: {}", e);
                        }
                    }
                }
            }
        });

        self.rollup_manager.start();
        self.retention_manager.start();
    }

    /// Stop background loops, then close the batch writer and wait until
    /// its buffer is on disk.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.as_ref() {
            let _ = tx.send(());
        }
        self.rollup_manager.stop().await;
        self.retention_manager.stop().await;

        drop(self.sample_tx.lock().take());
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                tracing::error!("Scheduler: batch writer failed: {}", e);
            }
        }
    }

    /// Accept one sample: validate, register the entity, update the live
    /// window and queue it for persistence.
    pub async fn submit(&self, key: &EntityKey, sample: Sample) -> Result<Appended, SampleError> {
        sample.validate()?;

        if let Some(info) = self.registry.ensure(key, &sample) {
            tracing::info!("Scheduler: registered {} as {}", key, info.kind.as_str());
            if let Err(e) = self.store.upsert_entity(&info) {
                tracing::error!("Scheduler: failed to persist entity {}: {}", key, e);
            }
        }

        let appended = self.rollups.append(key, sample.clone())?;

        let stored = StoredSample {
            entity: key.clone(),
            sample,
        };
        let tx = self.sample_tx.lock().clone();
        let sent = match tx {
            Some(tx) => tx.send(stored).await.is_ok(),
            None => false,
        };
        if !sent {
            tracing::error!("Scheduler: batch writer is gone, sample for {} not persisted", key);
        }

        Ok(appended)
    }

    /// Insert or update entity metadata. Returns true when it changed.
    pub fn register(&self, info: EntityInfo) -> Result<bool, DbError> {
        if self.registry.get(&info.key).as_ref() == Some(&info) {
            return Ok(false);
        }
        self.store.upsert_entity(&info)?;
        Ok(self.registry.upsert(info))
    }

    /// Run one surveillance evaluation with the next tick id.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let id = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let report = self.surveillance.tick(id, now);
        tracing::debug!(
            "Scheduler: tick {} evaluated {} entities ({} failures)",
            id,
            report.evaluated,
            report.failures
        );
        report
    }

    /// Last issued tick id.
    pub fn last_tick(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Run the batch writer that accumulates and flushes samples.
async fn run_batch_writer(mut rx: mpsc::Receiver<StoredSample>, store: Store) {
    let mut buffer: Vec<StoredSample> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<StoredSample>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_samples(buffer) {
        tracing::error!("Failed to flush {} samples: {}", buffer.len(), e);
    }

    buffer.clear();
}
