//! Health classification for monitored entities.
//!
//! A classification is always derived from the rollup window plus policy;
//! nothing here is a source of truth. Results are cached briefly and the
//! cache is keyed on the series version, so a new sample invalidates it.

mod hysteresis;
mod policy;

pub use hysteresis::*;
pub use policy::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::telemetry::{EntityKey, EntityRegistry, Horizon, MetricFamily, RollupStore, Vocabulary};

/// Health state of one entity over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Stable,
    Monitor,
    Issue,
    Up,
    Down,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Stable => "stable",
            Status::Monitor => "monitor",
            Status::Issue => "issue",
            Status::Up => "up",
            Status::Down => "down",
        }
    }

    /// Ordering used when sorting by status: healthy first, failing last.
    pub fn rank(self) -> u8 {
        match self {
            Status::Stable | Status::Up => 0,
            Status::Pending => 1,
            Status::Monitor => 2,
            Status::Issue | Status::Down => 3,
        }
    }

    pub fn is_failing(self) -> bool {
        matches!(self, Status::Issue | Status::Down)
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, Status::Stable | Status::Up)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A condition that contributed to a non-healthy status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    Loss { pct: f64, threshold: f64 },
    Latency { ms: f64, threshold: f64 },
    LowRx { dbm: f64, threshold: f64 },
    LowTx { dbm: f64, threshold: f64 },
    NoUsage { bps: f64, ceiling: f64 },
    InsufficientData { samples: usize, required: usize },
    Stale { last_seen: DateTime<Utc> },
}

impl Reason {
    pub fn label(&self) -> &'static str {
        match self {
            Reason::Loss { .. } => "loss",
            Reason::Latency { .. } => "latency",
            Reason::LowRx { .. } => "low_rx",
            Reason::LowTx { .. } => "low_tx",
            Reason::NoUsage { .. } => "no_usage",
            Reason::InsufficientData { .. } => "insufficient_data",
            Reason::Stale { .. } => "stale",
        }
    }
}

/// Optical reading quality, independent of the health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpticalFlags {
    pub rx_missing: bool,
    pub rx_invalid: bool,
    pub tx_missing: bool,
    pub tx_invalid: bool,
}

/// Aggregates over the evaluated window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub samples: usize,
    pub uptime_pct: Option<f64>,
    pub loss_avg: Option<f64>,
    pub avg_ms: Option<f64>,
    pub rto_pct: Option<f64>,
    /// Transitions into a full outage within the window.
    pub down_events: usize,
    pub down_seconds: i64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub rx_dbm: Option<f64>,
    pub tx_dbm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub status: Status,
    /// Trailing run of samples agreeing with the current status.
    pub streak: u32,
    /// When the current status began.
    pub since: Option<DateTime<Utc>>,
    /// The current status already held at the start of the window, so
    /// `since` is bounded by the window rather than by a transition.
    pub since_clipped: bool,
    pub reasons: Vec<Reason>,
    pub flags: OpticalFlags,
    pub stats: WindowStats,
    pub evaluated_at: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn primary_reason(&self) -> Option<&Reason> {
        self.reasons.first()
    }
}

/// Which metric families participate in a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScope {
    #[default]
    All,
    Ping,
    Optical,
    Usage,
}

impl MetricScope {
    pub fn includes(self, family: MetricFamily) -> bool {
        match self {
            MetricScope::All => true,
            MetricScope::Ping => family == MetricFamily::Ping,
            MetricScope::Optical => family == MetricFamily::Optical,
            MetricScope::Usage => family == MetricFamily::Usage,
        }
    }
}

type CacheKey = (EntityKey, Horizon, MetricScope);

struct Cached {
    version: u64,
    now_secs: i64,
    stored: Instant,
    record: ClassificationRecord,
}

/// Classifies entities from the rollup store on demand.
pub struct Classifier {
    policy: ClassifierPolicy,
    rollups: Arc<RollupStore>,
    registry: Arc<EntityRegistry>,
    cache: Mutex<HashMap<CacheKey, Cached>>,
}

impl Classifier {
    pub fn new(policy: ClassifierPolicy, rollups: Arc<RollupStore>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            policy,
            rollups,
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ClassifierPolicy {
        &self.policy
    }

    pub fn classify(&self, key: &EntityKey, horizon: Horizon) -> ClassificationRecord {
        self.classify_at(key, horizon, MetricScope::All, Utc::now())
    }

    pub fn classify_at(
        &self,
        key: &EntityKey,
        horizon: Horizon,
        scope: MetricScope,
        now: DateTime<Utc>,
    ) -> ClassificationRecord {
        let ttl = Duration::from_millis(self.policy.cache_ttl_ms);
        let version = self.rollups.version(key);
        let cache_key = (key.clone(), horizon, scope);

        if !ttl.is_zero() {
            if let Some(hit) = self.cache.lock().get(&cache_key) {
                if hit.version == version
                    && hit.now_secs == now.timestamp()
                    && hit.stored.elapsed() < ttl
                {
                    return hit.record.clone();
                }
            }
        }

        let info = self.registry.get(key);
        let subject = Subject {
            vocabulary: info
                .as_ref()
                .map(|i| i.kind.vocabulary())
                .unwrap_or(Vocabulary::Health),
            device_class: info.as_ref().and_then(|i| i.device_class.as_deref()),
            scope,
        };
        let samples = self.rollups.window_at(key, horizon, now);
        let record = classify_samples(&self.policy, &subject, &samples, now);

        if !ttl.is_zero() {
            self.cache.lock().insert(
                cache_key,
                Cached {
                    version,
                    now_secs: now.timestamp(),
                    stored: Instant::now(),
                    record: record.clone(),
                },
            );
        }

        record
    }
}
