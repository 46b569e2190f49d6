//! Watch-list transition rules.
//!
//! `decide` is pure: it sees the current entry (if any), one command and the
//! clock, and names the transition. The manager persists and applies it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::{AddedMode, EndReason, Level, SurveillanceError, WatchEntry};
use crate::classify::Status;
use crate::telemetry::Horizon;

/// Which metrics must be healthy before an auto entry is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRule {
    /// Only the ping metric decides recovery.
    PrimaryOnly,
    /// Every metric family the entity reports must be healthy.
    #[default]
    AllMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveillancePolicy {
    pub auto_add_enabled: bool,
    /// Issue must persist this long before an automatic add.
    pub auto_escalation_window_secs: i64,
    /// Continuous issue this long after being added escalates to level 2.
    pub stable_window_days: f64,
    /// Auto entries are released after being stable this long.
    pub auto_recovery_window_secs: i64,
    pub recovery_rule: RecoveryRule,
    /// Flapping criterion: this many outages in `down_events_horizon` also auto-adds.
    pub min_down_events: Option<usize>,
    pub down_events_horizon: Horizon,
    /// Auto-add cap per evaluation tick; 0 means unlimited.
    pub max_add_per_eval: usize,
    /// Level 2 entries stable this long are closed as auto-fixed.
    pub level2_autofix_secs: Option<i64>,
    /// Window classified on every tick.
    pub evaluation_horizon: Horizon,
}

impl Default for SurveillancePolicy {
    fn default() -> Self {
        Self {
            auto_add_enabled: true,
            auto_escalation_window_secs: 3600,
            stable_window_days: 1.0,
            auto_recovery_window_secs: 3600,
            recovery_rule: RecoveryRule::AllMetrics,
            min_down_events: Some(5),
            down_events_horizon: Horizon::Day,
            max_add_per_eval: 3,
            level2_autofix_secs: None,
            evaluation_horizon: Horizon::Day,
        }
    }
}

impl SurveillancePolicy {
    pub fn stable_window(&self) -> ChronoDuration {
        ChronoDuration::seconds((self.stable_window_days * 86400.0).round() as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.auto_escalation_window_secs < 0 || self.auto_recovery_window_secs < 0 {
            return Err("surveillance windows cannot be negative".to_string());
        }
        if !self.stable_window_days.is_finite() || self.stable_window_days < 0.0 {
            return Err("stable_window_days must be a non-negative number".to_string());
        }
        if self.level2_autofix_secs.is_some_and(|s| s < 0) {
            return Err("level2_autofix_secs cannot be negative".to_string());
        }
        Ok(())
    }
}

/// What the classifier reported for an entity on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: Status,
    pub since: Option<DateTime<Utc>>,
    /// The status may predate the classification window.
    pub since_clipped: bool,
    /// Status under the recovery rule's metric scope.
    pub recovery_status: Status,
    pub recovery_since: Option<DateTime<Utc>>,
    pub down_events: usize,
    /// Samples seen since the previous tick.
    pub new_samples: u64,
    pub latest_sample_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Tick { tick: u64, observation: Observation },
    AddManual { level: Option<Level> },
    Remove { note: Option<String> },
    Fix { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Noop,
    /// none → level1 (auto or manual), or straight to a requested level.
    Open { mode: AddedMode, level: Level },
    /// Re-add of a watched entity: mode/level rewritten, record kept open.
    Update { mode: AddedMode, level: Level },
    /// level1 → level2.
    Escalate,
    Close { reason: EndReason, note: Option<String> },
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        matches!(self, Transition::Noop)
    }
}

fn held_for(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window: ChronoDuration) -> bool {
    since.is_some_and(|s| now - s >= window)
}

/// Start of the current uninterrupted issue run since the entity was added.
pub fn next_issue_since(entry: &WatchEntry, observation: &Observation) -> Option<DateTime<Utc>> {
    if !observation.status.is_failing() {
        return None;
    }
    let current = observation.since.unwrap_or(entry.added_at).max(entry.added_at);
    match entry.issue_since {
        // A run that began before the window cannot be dated from it.
        Some(start) if observation.since_clipped || current <= start => Some(start),
        _ => Some(current),
    }
}

/// Decide the transition for one command.
pub fn decide(
    policy: &SurveillancePolicy,
    entry: Option<&WatchEntry>,
    command: &Command,
    now: DateTime<Utc>,
    auto_add_allowed: bool,
) -> Result<Transition, SurveillanceError> {
    match (command, entry) {
        (Command::Tick { observation, .. }, None) => {
            if !policy.auto_add_enabled || !auto_add_allowed {
                return Ok(Transition::Noop);
            }
            let sustained = observation.status.is_failing()
                && held_for(
                    observation.since,
                    now,
                    ChronoDuration::seconds(policy.auto_escalation_window_secs),
                );
            let flapping = policy
                .min_down_events
                .is_some_and(|min| min > 0 && observation.down_events >= min);
            if sustained || flapping {
                Ok(Transition::Open {
                    mode: AddedMode::Auto,
                    level: Level::Under,
                })
            } else {
                Ok(Transition::Noop)
            }
        }
        (Command::Tick { observation, .. }, Some(entry)) => match entry.level {
            Level::Under => {
                if held_for(entry.issue_since, now, policy.stable_window()) {
                    return Ok(Transition::Escalate);
                }
                let recovered = entry.added_mode == AddedMode::Auto
                    && observation.recovery_status.is_healthy()
                    && held_for(
                        observation.recovery_since,
                        now,
                        ChronoDuration::seconds(policy.auto_recovery_window_secs),
                    );
                if recovered {
                    Ok(Transition::Close {
                        reason: EndReason::AutoRecovered,
                        note: None,
                    })
                } else {
                    Ok(Transition::Noop)
                }
            }
            Level::Level2 => {
                let autofixed = policy.level2_autofix_secs.is_some_and(|secs| {
                    observation.recovery_status.is_healthy()
                        && held_for(observation.recovery_since, now, ChronoDuration::seconds(secs))
                });
                if autofixed {
                    Ok(Transition::Close {
                        reason: EndReason::AutoFixed,
                        note: None,
                    })
                } else {
                    Ok(Transition::Noop)
                }
            }
        },
        (Command::AddManual { level }, None) => Ok(Transition::Open {
            mode: AddedMode::Manual,
            level: level.unwrap_or(Level::Under),
        }),
        (Command::AddManual { level }, Some(entry)) => {
            let level = level.unwrap_or(entry.level);
            if entry.added_mode == AddedMode::Manual && entry.level == level {
                Ok(Transition::Noop)
            } else {
                Ok(Transition::Update {
                    mode: AddedMode::Manual,
                    level,
                })
            }
        }
        (Command::Remove { note }, Some(_)) => Ok(Transition::Close {
            reason: EndReason::Removed,
            note: note
                .as_ref()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        }),
        (Command::Fix { reason }, Some(_)) => {
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(SurveillanceError::FixReasonRequired);
            }
            Ok(Transition::Close {
                reason: EndReason::Fixed,
                note: Some(reason.to_string()),
            })
        }
        (Command::Remove { .. } | Command::Fix { .. }, None) => Err(SurveillanceError::NotWatched),
    }
}
