//! Surveillance watch list.
//!
//! Every entity has one slot guarded by its own mutex; all transitions for
//! that entity (evaluation ticks and operator commands) pass through it, so
//! they are applied one at a time. A transition is persisted before memory
//! changes, so a failed write leaves the previous state intact.

mod lifecycle;

pub use lifecycle::*;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, MetricScope};
use crate::db::{DbError, HistoryRecord, Store};
use crate::telemetry::{EntityKey, RollupStore};

#[derive(Error, Debug)]
pub enum SurveillanceError {
    #[error("a non-empty reason is required to mark an entity fixed")]
    FixReasonRequired,
    #[error("entity is not under surveillance")]
    NotWatched,
    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddedMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    #[serde(rename = "level1")]
    Under,
    #[serde(rename = "level2")]
    Level2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    AutoRecovered,
    Removed,
    Fixed,
    AutoFixed,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

string_enum!(AddedMode { Auto => "auto", Manual => "manual" });
string_enum!(Level { Under => "level1", Level2 => "level2" });
string_enum!(EndReason {
    AutoRecovered => "auto_recovered",
    Removed => "removed",
    Fixed => "fixed",
    AutoFixed => "auto_fixed",
});

/// A live watch-list entry. Backed by one open history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub key: EntityKey,
    pub history_id: i64,
    /// Mode that opened the record.
    pub source: AddedMode,
    pub added_mode: AddedMode,
    pub added_at: DateTime<Utc>,
    pub level: Level,
    pub level2_at: Option<DateTime<Utc>>,
    /// Start of the uninterrupted issue run observed while watched.
    pub issue_since: Option<DateTime<Utc>>,
    pub observed_samples: u64,
    /// Samples at or before this instant are already counted.
    pub counted_through: DateTime<Utc>,
}

impl From<HistoryRecord> for WatchEntry {
    fn from(r: HistoryRecord) -> Self {
        Self {
            key: r.key,
            history_id: r.id,
            source: r.source,
            added_mode: r.mode,
            added_at: r.started_at,
            level: r.level,
            level2_at: r.level2_at,
            issue_since: r.issue_since,
            observed_samples: r.observed_samples,
            counted_through: r.counted_through,
        }
    }
}

/// Outcome of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub transition: Transition,
    /// Entry after the transition; `None` when not (or no longer) watched.
    pub entry: Option<WatchEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub evaluated: usize,
    pub opened: usize,
    pub escalated: usize,
    pub closed: usize,
    pub duplicates: usize,
    pub failures: usize,
}

#[derive(Default)]
struct Slot {
    entry: Option<WatchEntry>,
    last_tick: u64,
}

/// Owns the watch list and its durable history.
pub struct SurveillanceManager {
    policy: SurveillancePolicy,
    store: Store,
    classifier: Arc<Classifier>,
    rollups: Arc<RollupStore>,
    slots: Mutex<HashMap<EntityKey, Arc<Mutex<Slot>>>>,
}

impl SurveillanceManager {
    pub fn new(
        policy: SurveillancePolicy,
        store: Store,
        classifier: Arc<Classifier>,
        rollups: Arc<RollupStore>,
    ) -> Self {
        Self {
            policy,
            store,
            classifier,
            rollups,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SurveillancePolicy {
        &self.policy
    }

    fn slot(&self, key: &EntityKey) -> Arc<Mutex<Slot>> {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    /// Reload open watch entries from history. Returns the number restored.
    pub fn restore(&self) -> Result<usize, DbError> {
        let open = self.store.get_open_history()?;
        let mut slots = self.slots.lock();
        for record in open {
            let entry = WatchEntry::from(record);
            let slot = slots.entry(entry.key.clone()).or_default().clone();
            let mut slot = slot.lock();
            if let Some(existing) = &slot.entry {
                warn!(
                    "SurveillanceManager: {} has more than one open record ({} and {}), keeping the newest",
                    entry.key, existing.history_id, entry.history_id
                );
                if existing.history_id > entry.history_id {
                    continue;
                }
            }
            slot.entry = Some(entry);
        }
        let restored = slots.values().filter(|s| s.lock().entry.is_some()).count();
        Ok(restored)
    }

    pub fn entry(&self, key: &EntityKey) -> Option<WatchEntry> {
        let slot = self.slots.lock().get(key).cloned()?;
        let entry = slot.lock().entry.clone();
        entry
    }

    /// Snapshot of the watch list, ordered by key.
    pub fn entries(&self) -> Vec<WatchEntry> {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        let mut entries: Vec<WatchEntry> = slots
            .iter()
            .filter_map(|slot| slot.lock().entry.clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn is_watched(&self, key: &EntityKey) -> bool {
        self.entry(key).is_some()
    }

    pub fn history(&self, key: Option<&EntityKey>, limit: usize) -> Result<Vec<HistoryRecord>, DbError> {
        self.store.get_history(key, limit)
    }

    pub fn add_manual(
        &self,
        key: &EntityKey,
        level: Option<Level>,
        now: DateTime<Utc>,
    ) -> Result<Applied, SurveillanceError> {
        self.apply(key, Command::AddManual { level }, now, true)
    }

    pub fn remove(
        &self,
        key: &EntityKey,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Applied, SurveillanceError> {
        self.apply(key, Command::Remove { note }, now, true)
    }

    pub fn fix(&self, key: &EntityKey, reason: &str, now: DateTime<Utc>) -> Result<Applied, SurveillanceError> {
        self.apply(
            key,
            Command::Fix {
                reason: reason.to_string(),
            },
            now,
            true,
        )
    }

    fn observe(&self, key: &EntityKey, entry: Option<&WatchEntry>, now: DateTime<Utc>) -> Observation {
        let horizon = self.policy.evaluation_horizon;
        let record = self.classifier.classify_at(key, horizon, MetricScope::All, now);
        let recovery = match self.policy.recovery_rule {
            RecoveryRule::AllMetrics => record.clone(),
            RecoveryRule::PrimaryOnly => self.classifier.classify_at(key, horizon, MetricScope::Ping, now),
        };
        let down_events = self.rollups.down_events_at(key, self.policy.down_events_horizon, now);
        let (new_samples, latest_sample_at) = match entry {
            Some(entry) => (
                self.rollups.count_after(key, entry.counted_through) as u64,
                self.rollups.latest(key).map(|s| s.at),
            ),
            None => (0, None),
        };

        Observation {
            status: record.status,
            since: record.since,
            since_clipped: record.since_clipped,
            recovery_status: recovery.status,
            recovery_since: recovery.since,
            down_events,
            new_samples,
            latest_sample_at,
        }
    }

    /// Run one evaluation pass over every known entity.
    ///
    /// Tick ids are monotonic; an entity that already saw `tick` skips it,
    /// so a redelivered tick is never applied twice.
    pub fn tick(&self, tick: u64, now: DateTime<Utc>) -> TickReport {
        let mut keys = self.rollups.keys();
        keys.extend(self.slots.lock().keys().cloned());
        keys.sort();
        keys.dedup();

        let mut report = TickReport {
            tick,
            ..Default::default()
        };
        let mut budget = match self.policy.max_add_per_eval {
            0 => usize::MAX,
            n => n,
        };

        for key in keys {
            match self.apply_tick(&key, tick, now, budget > 0) {
                Ok(Some(applied)) => {
                    report.evaluated += 1;
                    match applied.transition {
                        Transition::Open { .. } => {
                            report.opened += 1;
                            budget = budget.saturating_sub(1);
                        }
                        Transition::Escalate => report.escalated += 1,
                        Transition::Close { .. } => report.closed += 1,
                        Transition::Noop | Transition::Update { .. } => {}
                    }
                }
                Ok(None) => report.duplicates += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!("SurveillanceManager: tick {} failed for {}: {}", tick, key, e);
                }
            }
        }

        if report.opened + report.escalated + report.closed > 0 {
            info!(
                "SurveillanceManager: tick {} opened {}, escalated {}, closed {}",
                tick, report.opened, report.escalated, report.closed
            );
        }
        report
    }

    fn apply_tick(
        &self,
        key: &EntityKey,
        tick: u64,
        now: DateTime<Utc>,
        auto_add_allowed: bool,
    ) -> Result<Option<Applied>, SurveillanceError> {
        let slot = self.slot(key);
        let mut slot = slot.lock();
        if tick <= slot.last_tick {
            debug!("SurveillanceManager: {} already saw tick {}", key, tick);
            return Ok(None);
        }
        if slot.entry.is_none() && !(self.policy.auto_add_enabled && auto_add_allowed) {
            slot.last_tick = tick;
            return Ok(Some(Applied {
                transition: Transition::Noop,
                entry: None,
            }));
        }

        let observation = self.observe(key, slot.entry.as_ref(), now);
        let applied = self.commit(
            key,
            &mut slot,
            Command::Tick { tick, observation },
            now,
            auto_add_allowed,
        )?;
        slot.last_tick = tick;
        Ok(Some(applied))
    }

    fn apply(
        &self,
        key: &EntityKey,
        command: Command,
        now: DateTime<Utc>,
        auto_add_allowed: bool,
    ) -> Result<Applied, SurveillanceError> {
        let slot = self.slot(key);
        let mut slot = slot.lock();
        self.commit(key, &mut slot, command, now, auto_add_allowed)
    }

    /// Decide, persist, then update the slot. Caller holds the slot lock.
    fn commit(
        &self,
        key: &EntityKey,
        slot: &mut Slot,
        command: Command,
        now: DateTime<Utc>,
        auto_add_allowed: bool,
    ) -> Result<Applied, SurveillanceError> {
        let mut working = slot.entry.clone();
        let mut bookkeeping = false;
        if let (Command::Tick { observation, .. }, Some(entry)) = (&command, working.as_mut()) {
            let issue_since = next_issue_since(entry, observation);
            let counted_through = observation
                .latest_sample_at
                .map_or(entry.counted_through, |latest| latest.max(entry.counted_through));
            bookkeeping = issue_since != entry.issue_since
                || observation.new_samples > 0
                || counted_through != entry.counted_through;
            entry.issue_since = issue_since;
            entry.observed_samples += observation.new_samples;
            entry.counted_through = counted_through;
        }

        let transition = decide(&self.policy, working.as_ref(), &command, now, auto_add_allowed)?;

        let next = match (&transition, working) {
            (Transition::Open { mode, level }, _) => {
                let mut entry = WatchEntry {
                    key: key.clone(),
                    history_id: 0,
                    source: *mode,
                    added_mode: *mode,
                    added_at: now,
                    level: *level,
                    level2_at: (*level == Level::Level2).then_some(now),
                    issue_since: None,
                    observed_samples: 0,
                    counted_through: now,
                };
                entry.history_id = self.store.open_history(&entry)?;
                info!(
                    "SurveillanceManager: {} added ({}, {})",
                    key,
                    entry.added_mode,
                    entry.level
                );
                Some(entry)
            }
            (Transition::Update { mode, level }, Some(mut entry)) => {
                if entry.level != *level {
                    entry.level2_at = (*level == Level::Level2).then_some(now);
                }
                entry.added_mode = *mode;
                entry.level = *level;
                self.store.update_open_history(&entry)?;
                Some(entry)
            }
            (Transition::Escalate, Some(mut entry)) => {
                entry.level = Level::Level2;
                entry.level2_at = Some(now);
                self.store.update_open_history(&entry)?;
                info!("SurveillanceManager: {} escalated to level2", key);
                Some(entry)
            }
            (Transition::Close { reason, note }, Some(entry)) => {
                self.store
                    .close_history(entry.history_id, now, *reason, note.as_deref(), entry.observed_samples)?;
                info!("SurveillanceManager: {} closed ({})", key, reason);
                None
            }
            (Transition::Noop, entry) => {
                if bookkeeping {
                    if let Some(entry) = &entry {
                        self.store.update_open_history(entry)?;
                    }
                }
                entry
            }
            (_, None) => return Err(SurveillanceError::NotWatched),
        };

        slot.entry = next.clone();
        Ok(Applied {
            transition,
            entry: next,
        })
    }
}
