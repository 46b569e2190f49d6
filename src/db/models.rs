//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::surveillance::{AddedMode, EndReason, Level};
use crate::telemetry::{EntityKey, Sample};

/// A persisted sample row.
#[derive(Debug, Clone)]
pub struct StoredSample {
    pub entity: EntityKey,
    pub sample: Sample,
}

/// Aggregated latency and loss for one entity over a fixed bucket.
#[derive(Debug, Clone)]
pub struct RollupBucket {
    pub time: DateTime<Utc>,
    pub entity: EntityKey,
    pub window_seconds: i32,
    /// Serialized latency digest; empty when every ping in the bucket timed out.
    pub tdigest_data: Vec<u8>,
    pub loss_avg: Option<f64>,
    pub timeout_count: i64,
    pub sample_count: i64,
}

/// One surveillance episode for an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub key: EntityKey,
    pub source: AddedMode,
    pub mode: AddedMode,
    pub level: Level,
    pub started_at: DateTime<Utc>,
    pub level2_at: Option<DateTime<Utc>>,
    pub issue_since: Option<DateTime<Utc>>,
    pub counted_through: DateTime<Utc>,
    pub observed_samples: u64,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Fix reason or removal note.
    pub end_note: Option<String>,
}
