//! Classification thresholds.
//!
//! Every number here is operator configuration; the defaults are the
//! portal's shipped settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inclusive dBm range considered a real reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DbmRange {
    pub min: f64,
    pub max: f64,
}

impl DbmRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Valid reading ranges for one transceiver class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpticalRanges {
    pub rx: DbmRange,
    pub tx: DbmRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalPolicy {
    /// RX at or below this is a failing sample.
    pub issue_rx_dbm: f64,
    /// TX at or below this is a failing sample.
    pub issue_tx_dbm: f64,
    /// Ranges for devices without a class override.
    pub ranges: OpticalRanges,
    /// Per `device_class` overrides.
    pub classes: HashMap<String, OpticalRanges>,
}

impl Default for OpticalPolicy {
    fn default() -> Self {
        Self {
            issue_rx_dbm: -27.0,
            issue_tx_dbm: -2.0,
            ranges: OpticalRanges {
                rx: DbmRange { min: -40.0, max: 5.0 },
                tx: DbmRange { min: -10.0, max: 10.0 },
            },
            classes: HashMap::new(),
        }
    }
}

impl OpticalPolicy {
    pub fn ranges_for(&self, device_class: Option<&str>) -> OpticalRanges {
        device_class
            .and_then(|class| self.classes.get(class))
            .copied()
            .unwrap_or(self.ranges)
    }
}

/// "Connected but idle" detection for PPPoE usage samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsagePolicy {
    /// Combined in+out rate at or below this is "no usage". Disabled when unset.
    pub no_usage_max_bps: Option<f64>,
    /// Only flag no-usage when at least this many LAN devices are attached.
    pub min_connected_devices: u32,
}

impl Default for UsagePolicy {
    fn default() -> Self {
        Self {
            no_usage_max_bps: None,
            min_connected_devices: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierPolicy {
    pub loss_threshold_pct: f64,
    pub latency_threshold_ms: f64,
    /// Loss at or above this counts as a full outage (RTO / down).
    pub down_loss_pct: f64,
    pub min_consecutive_fail: u32,
    pub min_consecutive_pass: u32,
    pub pending_sample_floor: usize,
    /// Latest sample older than this reports `pending`. Disabled when unset.
    pub stale_after_secs: Option<i64>,
    pub cache_ttl_ms: u64,
    pub optical: OpticalPolicy,
    pub usage: UsagePolicy,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            loss_threshold_pct: 20.0,
            latency_threshold_ms: 200.0,
            down_loss_pct: 100.0,
            min_consecutive_fail: 2,
            min_consecutive_pass: 2,
            pending_sample_floor: 3,
            stale_after_secs: Some(7200),
            cache_ttl_ms: 1000,
            optical: OpticalPolicy::default(),
            usage: UsagePolicy::default(),
        }
    }
}

impl ClassifierPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.loss_threshold_pct) {
            return Err("loss_threshold_pct must be within 0..=100".to_string());
        }
        if !(0.0..=100.0).contains(&self.down_loss_pct) {
            return Err("down_loss_pct must be within 0..=100".to_string());
        }
        if self.latency_threshold_ms < 0.0 {
            return Err("latency_threshold_ms cannot be negative".to_string());
        }
        if self.min_consecutive_fail == 0 || self.min_consecutive_pass == 0 {
            return Err("consecutive sample requirements must be at least 1".to_string());
        }
        let ranges = std::iter::once(&self.optical.ranges).chain(self.optical.classes.values());
        for r in ranges {
            if r.rx.min > r.rx.max || r.tx.min > r.tx.max {
                return Err("optical range min exceeds max".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ClassifierPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_zero_streak_rejected() {
        let policy = ClassifierPolicy {
            min_consecutive_fail: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_class_override() {
        let mut optical = OpticalPolicy::default();
        let narrow = OpticalRanges {
            rx: DbmRange { min: -30.0, max: -8.0 },
            tx: DbmRange { min: 0.5, max: 5.0 },
        };
        optical.classes.insert("gpon-c+".to_string(), narrow);

        assert_eq!(optical.ranges_for(Some("gpon-c+")), narrow);
        assert_eq!(optical.ranges_for(Some("epon")), optical.ranges);
        assert_eq!(optical.ranges_for(None), optical.ranges);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy: ClassifierPolicy =
            serde_json::from_str(r#"{"loss_threshold_pct": 10, "optical": {"issue_rx_dbm": -25}}"#)
                .unwrap();
        assert_eq!(policy.loss_threshold_pct, 10.0);
        assert_eq!(policy.latency_threshold_ms, 200.0);
        assert_eq!(policy.optical.issue_rx_dbm, -25.0);
        assert_eq!(policy.optical.issue_tx_dbm, -2.0);
    }
}
