//! Sample and entity key types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::SampleError;

const LOSS_MIN_PCT: f64 = 0.0;
const LOSS_MAX_PCT: f64 = 100.0;
const RTT_MAX_MS: f64 = 600_000.0;
/// Physically plausible optical power for any transceiver class.
const DBM_MIN: f64 = -80.0;
const DBM_MAX: f64 = 30.0;

/// Stable identity of a monitored entity (account name, device id, row id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    /// Build a key, trimming whitespace. Empty keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self, SampleError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(SampleError::EmptyKey);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityKey {
    type Error = SampleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The metric families a sample can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Ping,
    Optical,
    Usage,
}

/// ICMP reachability result. `rtt_ms` is absent when every request timed out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingMetrics {
    pub loss_pct: f64,
    #[serde(default)]
    pub rtt_ms: Option<f64>,
}

/// Transceiver power readings. Either side may be missing on the device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OpticalMetrics {
    #[serde(default)]
    pub rx_dbm: Option<f64>,
    #[serde(default)]
    pub tx_dbm: Option<f64>,
}

/// Bandwidth counters and rates for a PPPoE session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default)]
    pub bps_in: f64,
    #[serde(default)]
    pub bps_out: f64,
    #[serde(default)]
    pub connected_devices: Option<u32>,
}

/// One observation of one entity. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optical: Option<OpticalMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetrics>,
}

impl Sample {
    /// An empty sample at `at`; attach metric families with the builders.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            ping: None,
            optical: None,
            usage: None,
        }
    }

    pub fn ping(at: DateTime<Utc>, loss_pct: f64, rtt_ms: Option<f64>) -> Self {
        Self::at(at).with_ping(loss_pct, rtt_ms)
    }

    pub fn optical(at: DateTime<Utc>, rx_dbm: Option<f64>, tx_dbm: Option<f64>) -> Self {
        Self::at(at).with_optical(rx_dbm, tx_dbm)
    }

    pub fn with_ping(mut self, loss_pct: f64, rtt_ms: Option<f64>) -> Self {
        self.ping = Some(PingMetrics { loss_pct, rtt_ms });
        self
    }

    pub fn with_optical(mut self, rx_dbm: Option<f64>, tx_dbm: Option<f64>) -> Self {
        self.optical = Some(OpticalMetrics { rx_dbm, tx_dbm });
        self
    }

    pub fn with_usage(mut self, usage: UsageMetrics) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn has_family(&self, family: MetricFamily) -> bool {
        match family {
            MetricFamily::Ping => self.ping.is_some(),
            MetricFamily::Optical => self.optical.is_some(),
            MetricFamily::Usage => self.usage.is_some(),
        }
    }

    /// Check required fields and physical sanity bounds.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.ping.is_none() && self.optical.is_none() && self.usage.is_none() {
            return Err(SampleError::Empty);
        }

        if let Some(ping) = &self.ping {
            check_range("loss_pct", ping.loss_pct, LOSS_MIN_PCT, LOSS_MAX_PCT)?;
            if let Some(rtt) = ping.rtt_ms {
                check_range("rtt_ms", rtt, 0.0, RTT_MAX_MS)?;
            }
        }

        if let Some(optical) = &self.optical {
            if let Some(rx) = optical.rx_dbm {
                check_range("rx_dbm", rx, DBM_MIN, DBM_MAX)?;
            }
            if let Some(tx) = optical.tx_dbm {
                check_range("tx_dbm", tx, DBM_MIN, DBM_MAX)?;
            }
        }

        if let Some(usage) = &self.usage {
            check_range("bps_in", usage.bps_in, 0.0, f64::MAX)?;
            check_range("bps_out", usage.bps_out, 0.0, f64::MAX)?;
        }

        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), SampleError> {
    if !value.is_finite() {
        return Err(SampleError::NonFinite { field });
    }
    if value < min || value > max {
        return Err(SampleError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_entity_key_trims_and_rejects_empty() {
        assert_eq!(EntityKey::new("  juan ").unwrap().as_str(), "juan");
        assert_eq!(EntityKey::new("   "), Err(SampleError::EmptyKey));

        let parsed: Result<EntityKey, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_samples() {
        assert_eq!(Sample::at(t0()).validate(), Err(SampleError::Empty));

        let negative_loss = Sample::ping(t0(), -1.0, None);
        assert!(matches!(
            negative_loss.validate(),
            Err(SampleError::OutOfRange { field: "loss_pct", .. })
        ));

        let nan_rtt = Sample::ping(t0(), 0.0, Some(f64::NAN));
        assert_eq!(
            nan_rtt.validate(),
            Err(SampleError::NonFinite { field: "rtt_ms" })
        );

        let hot_laser = Sample::optical(t0(), Some(-20.0), Some(45.0));
        assert!(matches!(
            hot_laser.validate(),
            Err(SampleError::OutOfRange { field: "tx_dbm", .. })
        ));
    }

    #[test]
    fn test_validate_accepts_partial_optical() {
        let sample = Sample::optical(t0(), Some(-18.5), None).with_ping(0.0, Some(3.2));
        assert!(sample.validate().is_ok());
        assert!(sample.has_family(MetricFamily::Ping));
        assert!(sample.has_family(MetricFamily::Optical));
        assert!(!sample.has_family(MetricFamily::Usage));
    }

    #[test]
    fn test_sample_json_shape() {
        let json = r#"{"at":"2024-01-01T00:00:00Z","ping":{"loss_pct":40.0,"rtt_ms":12.5}}"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.at, t0());
        assert_eq!(sample.ping.unwrap().loss_pct, 40.0);
        assert!(sample.optical.is_none());
    }
}
