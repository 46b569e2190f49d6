//! Sparkline summaries of recent history.
//!
//! Series are thinned by uniform stride (never averaged) and projected into
//! a fixed pixel box so the presentation layer can draw them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::classify::OpticalPolicy;
use crate::telemetry::{EntityKey, EntityKind, EntityRegistry, Horizon, RollupStore, Sample};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendPolicy {
    pub width: f64,
    pub height: f64,
    pub point_budget: usize,
}

impl Default for TrendPolicy {
    fn default() -> Self {
        Self {
            width: 120.0,
            height: 28.0,
            point_budget: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    Loss,
    Latency,
    Rx,
    Tx,
    BpsIn,
    BpsOut,
}

impl TrendMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendMetric::Loss => "loss",
            TrendMetric::Latency => "latency",
            TrendMetric::Rx => "rx",
            TrendMetric::Tx => "tx",
            TrendMetric::BpsIn => "bps_in",
            TrendMetric::BpsOut => "bps_out",
        }
    }

    /// The metric shown in tables for an entity of this kind.
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Optical => TrendMetric::Rx,
            EntityKind::Account => TrendMetric::BpsIn,
            _ => TrendMetric::Latency,
        }
    }
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loss" => Ok(TrendMetric::Loss),
            "latency" | "rtt" => Ok(TrendMetric::Latency),
            "rx" => Ok(TrendMetric::Rx),
            "tx" => Ok(TrendMetric::Tx),
            "bps_in" => Ok(TrendMetric::BpsIn),
            "bps_out" => Ok(TrendMetric::BpsOut),
            other => Err(format!("unknown trend metric: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spark {
    pub metric: TrendMetric,
    pub horizon: Horizon,
    pub width: f64,
    pub height: f64,
    pub points: Vec<Point>,
    /// Raw values behind the selected points, for detail views.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<SeriesPoint>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Spark {
    /// Drop the raw series, keeping only what a table cell needs.
    pub fn points_only(mut self) -> Self {
        self.series.clear();
        self
    }
}

/// Indices kept when thinning `len` items to at most `budget`.
///
/// Uniform stride; the first and last index are always kept when the
/// budget allows two points.
pub fn downsample_indices(len: usize, budget: usize) -> Vec<usize> {
    if len == 0 || budget == 0 {
        return Vec::new();
    }
    if len <= budget {
        return (0..len).collect();
    }
    if budget == 1 {
        return vec![len - 1];
    }

    let last = (len - 1) as f64;
    let steps = (budget - 1) as f64;
    let mut indices: Vec<usize> = (0..budget)
        .map(|i| ((i as f64) * last / steps).round() as usize)
        .collect();
    indices.dedup();
    indices
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Map a time series into a `width` x `height` box with y growing downward.
pub fn project(series: &[SeriesPoint], width: f64, height: f64) -> Vec<Point> {
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        return Vec::new();
    };

    let span_ms = (last.at - first.at).num_milliseconds() as f64;
    let (min, max) = series.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        (lo.min(p.value), hi.max(p.value))
    });

    series
        .iter()
        .map(|p| {
            let x = if span_ms > 0.0 {
                (p.at - first.at).num_milliseconds() as f64 / span_ms * width
            } else {
                width / 2.0
            };
            let y = if max > min {
                height - (p.value - min) / (max - min) * height
            } else {
                height / 2.0
            };
            Point {
                x: round2(x),
                y: round2(y),
            }
        })
        .collect()
}

/// Builds sparklines from the rollup store.
pub struct TrendSummarizer {
    policy: TrendPolicy,
    optical: OpticalPolicy,
    rollups: Arc<RollupStore>,
    registry: Arc<EntityRegistry>,
}

impl TrendSummarizer {
    pub fn new(
        policy: TrendPolicy,
        optical: OpticalPolicy,
        rollups: Arc<RollupStore>,
        registry: Arc<EntityRegistry>,
    ) -> Self {
        Self {
            policy,
            optical,
            rollups,
            registry,
        }
    }

    pub fn policy(&self) -> &TrendPolicy {
        &self.policy
    }

    /// Default metric for `key`, based on its registered kind.
    pub fn metric_for(&self, key: &EntityKey) -> TrendMetric {
        self.registry
            .get(key)
            .map(|info| TrendMetric::default_for(info.kind))
            .unwrap_or(TrendMetric::Latency)
    }

    pub fn spark(
        &self,
        key: &EntityKey,
        horizon: Horizon,
        metric: TrendMetric,
        point_budget: Option<usize>,
    ) -> Spark {
        self.spark_at(key, horizon, metric, point_budget, Utc::now())
    }

    pub fn spark_at(
        &self,
        key: &EntityKey,
        horizon: Horizon,
        metric: TrendMetric,
        point_budget: Option<usize>,
        now: DateTime<Utc>,
    ) -> Spark {
        let device_class = self.registry.get(key).and_then(|info| info.device_class);
        let ranges = self.optical.ranges_for(device_class.as_deref());

        let values: Vec<SeriesPoint> = self
            .rollups
            .window_at(key, horizon, now)
            .iter()
            .filter_map(|sample| {
                let value = extract(sample, metric)?;
                let valid = match metric {
                    TrendMetric::Rx => ranges.rx.contains(value),
                    TrendMetric::Tx => ranges.tx.contains(value),
                    _ => true,
                };
                (valid && value.is_finite()).then_some(SeriesPoint {
                    at: sample.at,
                    value,
                })
            })
            .collect();

        let budget = point_budget.unwrap_or(self.policy.point_budget);
        let series: Vec<SeriesPoint> = downsample_indices(values.len(), budget)
            .into_iter()
            .map(|i| values[i])
            .collect();

        let min = series.iter().map(|p| p.value).reduce(f64::min);
        let max = series.iter().map(|p| p.value).reduce(f64::max);

        Spark {
            metric,
            horizon,
            width: self.policy.width,
            height: self.policy.height,
            points: project(&series, self.policy.width, self.policy.height),
            series,
            min,
            max,
        }
    }
}

fn extract(sample: &Sample, metric: TrendMetric) -> Option<f64> {
    match metric {
        TrendMetric::Loss => sample.ping.map(|p| p.loss_pct),
        TrendMetric::Latency => sample.ping.and_then(|p| p.rtt_ms),
        TrendMetric::Rx => sample.optical.and_then(|o| o.rx_dbm),
        TrendMetric::Tx => sample.optical.and_then(|o| o.tx_dbm),
        TrendMetric::BpsIn => sample.usage.map(|u| u.bps_in),
        TrendMetric::BpsOut => sample.usage.map(|u| u.bps_out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EntityInfo, StorePolicy};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn summarizer() -> (TrendSummarizer, Arc<RollupStore>, Arc<EntityRegistry>) {
        let rollups = Arc::new(RollupStore::new(&StorePolicy::default()));
        let registry = Arc::new(EntityRegistry::new());
        (
            TrendSummarizer::new(
                TrendPolicy::default(),
                OpticalPolicy::default(),
                rollups.clone(),
                registry.clone(),
            ),
            rollups,
            registry,
        )
    }

    #[test]
    fn test_downsample_keeps_endpoints() {
        let idx = downsample_indices(1000, 60);
        assert_eq!(idx.len(), 60);
        assert_eq!(idx[0], 0);
        assert_eq!(*idx.last().unwrap(), 999);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(downsample_indices(5, 60), vec![0, 1, 2, 3, 4]);
        assert!(downsample_indices(5, 0).is_empty());
        assert_eq!(downsample_indices(5, 1), vec![4]);
        assert_eq!(downsample_indices(5, 2), vec![0, 4]);
    }

    #[test]
    fn test_project_edges() {
        let single = [SeriesPoint { at: t(0), value: 3.0 }];
        assert_eq!(project(&single, 120.0, 28.0), vec![Point { x: 60.0, y: 14.0 }]);

        let ramp = [
            SeriesPoint { at: t(0), value: 0.0 },
            SeriesPoint { at: t(50), value: 5.0 },
            SeriesPoint { at: t(100), value: 10.0 },
        ];
        let points = project(&ramp, 100.0, 20.0);
        assert_eq!(points[0], Point { x: 0.0, y: 20.0 });
        assert_eq!(points[1], Point { x: 50.0, y: 10.0 });
        assert_eq!(points[2], Point { x: 100.0, y: 0.0 });

        assert!(project(&[], 100.0, 20.0).is_empty());
    }

    #[test]
    fn test_spark_excludes_missing_and_invalid() {
        let (trend, rollups, registry) = summarizer();
        let key = EntityKey::new("onu").unwrap();
        registry.upsert(EntityInfo::new(key.clone(), EntityKind::Optical));

        rollups.append(&key, Sample::optical(t(0), Some(-20.0), Some(2.0))).unwrap();
        rollups.append(&key, Sample::optical(t(60), None, Some(2.0))).unwrap();
        rollups.append(&key, Sample::optical(t(120), Some(-60.0), Some(2.0))).unwrap();
        rollups.append(&key, Sample::optical(t(180), Some(-22.0), Some(2.0))).unwrap();

        let metric = trend.metric_for(&key);
        assert_eq!(metric, TrendMetric::Rx);
        let spark = trend.spark_at(&key, Horizon::SixHours, metric, None, t(200));
        let values: Vec<f64> = spark.series.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![-20.0, -22.0]);
        assert_eq!(spark.points.len(), 2);
        assert_eq!(spark.min, Some(-22.0));
        assert_eq!(spark.max, Some(-20.0));
    }

    #[test]
    fn test_spark_respects_budget() {
        let (trend, rollups, _) = summarizer();
        let key = EntityKey::new("a").unwrap();
        for i in 0..500 {
            rollups.append(&key, Sample::ping(t(i * 10), 0.0, Some(i as f64))).unwrap();
        }
        let spark = trend.spark_at(&key, Horizon::SixHours, TrendMetric::Latency, Some(20), t(5000));
        assert_eq!(spark.points.len(), 20);
        assert_eq!(spark.series.first().unwrap().value, 0.0);
        assert_eq!(spark.series.last().unwrap().value, 499.0);

        let empty = trend.spark_at(&key, Horizon::SixHours, TrendMetric::Latency, Some(0), t(5000));
        assert!(empty.points.is_empty());
        assert!(empty.points_only().series.is_empty());
    }
}
