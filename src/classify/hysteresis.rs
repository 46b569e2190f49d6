//! Per-sample verdicts and the hysteresis walk that turns them into a status.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::{ClassificationRecord, ClassifierPolicy, MetricScope, OpticalFlags, Reason, Status, WindowStats};
use crate::telemetry::{MetricFamily, Sample, Vocabulary};

/// How bad a single sample is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Pass,
    Degraded,
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleVerdict {
    pub severity: Severity,
    /// Ordered: loss, latency, rx, tx, usage.
    pub reasons: Vec<Reason>,
}

/// What is being classified.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub vocabulary: Vocabulary,
    pub device_class: Option<&'a str>,
    pub scope: MetricScope,
}

impl Default for Subject<'_> {
    fn default() -> Self {
        Self {
            vocabulary: Vocabulary::Health,
            device_class: None,
            scope: MetricScope::All,
        }
    }
}

/// Judge one sample. `None` when it carries nothing within scope.
pub fn evaluate_sample(policy: &ClassifierPolicy, subject: &Subject<'_>, sample: &Sample) -> Option<SampleVerdict> {
    let mut severity = Severity::Pass;
    let mut reasons = Vec::new();
    let mut evaluated = false;

    if let Some(ping) = sample.ping.filter(|_| subject.scope.includes(MetricFamily::Ping)) {
        evaluated = true;
        match subject.vocabulary {
            Vocabulary::Reachability => {
                if ping.loss_pct >= policy.down_loss_pct {
                    severity = Severity::Fail;
                    reasons.push(Reason::Loss {
                        pct: ping.loss_pct,
                        threshold: policy.down_loss_pct,
                    });
                }
            }
            Vocabulary::Health => {
                if ping.loss_pct > policy.loss_threshold_pct {
                    severity = Severity::Fail;
                    reasons.push(Reason::Loss {
                        pct: ping.loss_pct,
                        threshold: policy.loss_threshold_pct,
                    });
                }
                if let Some(rtt) = ping.rtt_ms.filter(|ms| *ms > policy.latency_threshold_ms) {
                    severity = severity.max(Severity::Degraded);
                    reasons.push(Reason::Latency {
                        ms: rtt,
                        threshold: policy.latency_threshold_ms,
                    });
                }
            }
        }
    }

    if let Some(optical) = sample.optical.filter(|_| subject.scope.includes(MetricFamily::Optical)) {
        evaluated = true;
        let ranges = policy.optical.ranges_for(subject.device_class);
        // Missing or unrealistic readings are flagged elsewhere, never failed.
        if let Some(rx) = optical.rx_dbm.filter(|v| ranges.rx.contains(*v)) {
            if rx <= policy.optical.issue_rx_dbm {
                severity = Severity::Fail;
                reasons.push(Reason::LowRx {
                    dbm: rx,
                    threshold: policy.optical.issue_rx_dbm,
                });
            }
        }
        if let Some(tx) = optical.tx_dbm.filter(|v| ranges.tx.contains(*v)) {
            if tx <= policy.optical.issue_tx_dbm {
                severity = Severity::Fail;
                reasons.push(Reason::LowTx {
                    dbm: tx,
                    threshold: policy.optical.issue_tx_dbm,
                });
            }
        }
    }

    if let Some(usage) = sample.usage.filter(|_| subject.scope.includes(MetricFamily::Usage)) {
        evaluated = true;
        if let Some(ceiling) = policy.usage.no_usage_max_bps {
            let total = usage.bps_in + usage.bps_out;
            let devices = usage.connected_devices.unwrap_or(0);
            if devices >= policy.usage.min_connected_devices && total <= ceiling {
                severity = Severity::Fail;
                reasons.push(Reason::NoUsage { bps: total, ceiling });
            }
        }
    }

    evaluated.then_some(SampleVerdict { severity, reasons })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Healthy,
    Watch,
    Failing,
}

#[derive(Debug, Default)]
struct Runs {
    fail: u32,
    bad: u32,
    degraded: u32,
    pass: u32,
}

impl Runs {
    fn push(&mut self, severity: Severity) {
        match severity {
            Severity::Fail => {
                self.fail += 1;
                self.bad += 1;
                self.degraded = 0;
                self.pass = 0;
            }
            Severity::Degraded => {
                self.fail = 0;
                self.bad += 1;
                self.degraded += 1;
                self.pass = 0;
            }
            Severity::Pass => {
                self.fail = 0;
                self.bad = 0;
                self.degraded = 0;
                self.pass += 1;
            }
        }
    }

    fn streak(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Healthy => self.pass,
            Phase::Watch => self.bad,
            Phase::Failing => self.fail,
        }
    }
}

fn step(phase: Phase, runs: &Runs, min_fail: u32, min_pass: u32) -> Phase {
    match phase {
        Phase::Healthy if runs.fail >= min_fail => Phase::Failing,
        Phase::Healthy if runs.bad >= min_fail => Phase::Watch,
        Phase::Watch if runs.fail >= min_fail => Phase::Failing,
        Phase::Watch if runs.pass >= min_pass => Phase::Healthy,
        Phase::Failing if runs.pass >= min_pass => Phase::Healthy,
        Phase::Failing if runs.degraded >= min_pass => Phase::Watch,
        unchanged => unchanged,
    }
}

fn status_for(phase: Phase, vocabulary: Vocabulary) -> Status {
    match (vocabulary, phase) {
        (Vocabulary::Health, Phase::Healthy) => Status::Stable,
        (Vocabulary::Health, Phase::Watch) => Status::Monitor,
        (Vocabulary::Health, Phase::Failing) => Status::Issue,
        (Vocabulary::Reachability, Phase::Healthy) => Status::Up,
        (Vocabulary::Reachability, Phase::Watch | Phase::Failing) => Status::Down,
    }
}

#[derive(Default)]
struct Tally {
    non_failing: usize,
    loss_sum: f64,
    loss_n: usize,
    rtt_sum: f64,
    rtt_n: usize,
    rto: usize,
    down_events: usize,
    was_down: bool,
}

fn mean(sum: f64, n: usize) -> Option<f64> {
    (n > 0).then(|| sum / n as f64)
}

/// Classify an ordered window of samples.
pub fn classify_samples(
    policy: &ClassifierPolicy,
    subject: &Subject<'_>,
    samples: &[Sample],
    now: DateTime<Utc>,
) -> ClassificationRecord {
    let min_fail = policy.min_consecutive_fail.max(1);
    let min_pass = policy.min_consecutive_pass.max(1);

    let mut phase = Phase::Healthy;
    let mut since: Option<DateTime<Utc>> = None;
    let mut runs = Runs::default();
    let mut bad_reasons: Vec<Reason> = Vec::new();
    let mut fail_reasons: Vec<Reason> = Vec::new();
    let mut healthy_seen = false;
    let mut since_clipped = true;
    let mut tally = Tally::default();
    let mut flags = OpticalFlags::default();
    let mut stats = WindowStats::default();

    for sample in samples {
        let Some(verdict) = evaluate_sample(policy, subject, sample) else {
            continue;
        };

        stats.samples += 1;
        stats.last_check_at = Some(sample.at);
        since.get_or_insert(sample.at);

        if verdict.severity != Severity::Fail {
            tally.non_failing += 1;
        }
        if let Some(ping) = sample.ping.filter(|_| subject.scope.includes(MetricFamily::Ping)) {
            tally.loss_sum += ping.loss_pct;
            tally.loss_n += 1;
            if let Some(rtt) = ping.rtt_ms {
                tally.rtt_sum += rtt;
                tally.rtt_n += 1;
            }
            let down = ping.loss_pct >= policy.down_loss_pct;
            if down {
                tally.rto += 1;
                if !tally.was_down {
                    tally.down_events += 1;
                }
            }
            tally.was_down = down;
        }
        if let Some(optical) = sample.optical.filter(|_| subject.scope.includes(MetricFamily::Optical)) {
            let ranges = policy.optical.ranges_for(subject.device_class);
            flags = OpticalFlags {
                rx_missing: optical.rx_dbm.is_none(),
                rx_invalid: optical.rx_dbm.is_some_and(|v| !ranges.rx.contains(v)),
                tx_missing: optical.tx_dbm.is_none(),
                tx_invalid: optical.tx_dbm.is_some_and(|v| !ranges.tx.contains(v)),
            };
            if let Some(rx) = optical.rx_dbm.filter(|v| ranges.rx.contains(*v)) {
                stats.rx_dbm = Some(rx);
            }
            if let Some(tx) = optical.tx_dbm.filter(|v| ranges.tx.contains(*v)) {
                stats.tx_dbm = Some(tx);
            }
        }

        runs.push(verdict.severity);
        match verdict.severity {
            Severity::Pass => {}
            Severity::Fail => {
                fail_reasons = verdict.reasons.clone();
                bad_reasons = verdict.reasons;
            }
            Severity::Degraded => bad_reasons = verdict.reasons,
        }

        let next = step(phase, &runs, min_fail, min_pass);
        if next != phase {
            phase = next;
            since = Some(sample.at);
            // Until a passing sample was seen in a healthy phase, the
            // problem may have started before the window.
            since_clipped = !healthy_seen;
        }
        if phase == Phase::Healthy && verdict.severity == Severity::Pass {
            healthy_seen = true;
        }
    }

    if stats.samples > 0 {
        stats.uptime_pct = Some(tally.non_failing as f64 * 100.0 / stats.samples as f64);
    }
    stats.loss_avg = mean(tally.loss_sum, tally.loss_n);
    stats.avg_ms = mean(tally.rtt_sum, tally.rtt_n);
    stats.rto_pct = (tally.loss_n > 0).then(|| tally.rto as f64 * 100.0 / tally.loss_n as f64);
    stats.down_events = tally.down_events;

    let stale = match (policy.stale_after_secs, stats.last_check_at) {
        (Some(limit), Some(last)) if now - last > ChronoDuration::seconds(limit) => Some(last),
        _ => None,
    };

    let (status, streak, reasons) = if stats.samples < policy.pending_sample_floor {
        let reason = Reason::InsufficientData {
            samples: stats.samples,
            required: policy.pending_sample_floor,
        };
        (Status::Pending, 0, vec![reason])
    } else if let Some(last_seen) = stale {
        (Status::Pending, 0, vec![Reason::Stale { last_seen }])
    } else {
        let reasons = match phase {
            Phase::Healthy => Vec::new(),
            Phase::Watch => bad_reasons,
            Phase::Failing => fail_reasons,
        };
        (status_for(phase, subject.vocabulary), runs.streak(phase), reasons)
    };

    if status.is_failing() {
        stats.down_seconds = since.map(|s| (now - s).num_seconds().max(0)).unwrap_or(0);
    }

    ClassificationRecord {
        status,
        streak,
        since,
        since_clipped,
        reasons,
        flags,
        stats,
        evaluated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::UsageMetrics;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn policy() -> ClassifierPolicy {
        ClassifierPolicy {
            loss_threshold_pct: 20.0,
            latency_threshold_ms: 100.0,
            min_consecutive_fail: 3,
            min_consecutive_pass: 2,
            pending_sample_floor: 3,
            stale_after_secs: None,
            ..Default::default()
        }
    }

    fn pings(losses: &[f64]) -> Vec<Sample> {
        losses
            .iter()
            .enumerate()
            .map(|(i, loss)| Sample::ping(t(i as i64 * 60), *loss, Some(10.0)))
            .collect()
    }

    fn run(samples: &[Sample]) -> ClassificationRecord {
        let now = samples.last().map(|s| s.at).unwrap_or_else(|| t(0));
        classify_samples(&policy(), &Subject::default(), samples, now)
    }

    #[test]
    fn test_single_blip_does_not_flap() {
        let record = run(&pings(&[0.0, 0.0, 90.0, 0.0, 0.0]));
        assert_eq!(record.status, Status::Stable);
        assert_eq!(record.streak, 2);
        assert!(record.reasons.is_empty());
        assert_eq!(record.since, Some(t(0)));
    }

    #[test]
    fn test_recovery_needs_consecutive_passes() {
        let still_issue = run(&pings(&[80.0, 80.0, 80.0, 0.0]));
        assert_eq!(still_issue.status, Status::Issue);
        assert_eq!(still_issue.streak, 0);
        assert_eq!(still_issue.reasons[0].label(), "loss");

        let recovered = run(&pings(&[80.0, 80.0, 80.0, 0.0, 0.0]));
        assert_eq!(recovered.status, Status::Stable);
        assert_eq!(recovered.since, Some(t(240)));
        assert_eq!(recovered.streak, 2);
    }

    #[test]
    fn test_issue_keeps_loss_reason_through_latency_sample() {
        let mut samples = pings(&[80.0, 80.0, 80.0]);
        samples.push(Sample::ping(t(180), 0.0, Some(250.0)));
        let record = run(&samples);
        assert_eq!(record.status, Status::Issue);
        assert_eq!(record.reasons[0].label(), "loss");
    }

    #[test]
    fn test_since_clipped_when_problem_predates_window() {
        let record = run(&pings(&[80.0, 80.0, 80.0, 80.0]));
        assert_eq!(record.status, Status::Issue);
        assert!(record.since_clipped);

        let record = run(&pings(&[0.0, 0.0, 80.0, 80.0, 80.0]));
        assert_eq!(record.status, Status::Issue);
        assert_eq!(record.since, Some(t(240)));
        assert!(!record.since_clipped);
    }

    #[test]
    fn test_sustained_latency_is_monitor() {
        let samples: Vec<Sample> = (0..4)
            .map(|i| Sample::ping(t(i * 60), 0.0, Some(250.0)))
            .collect();
        let record = run(&samples);
        assert_eq!(record.status, Status::Monitor);
        assert_eq!(record.streak, 4);
        assert_eq!(record.reasons, vec![Reason::Latency { ms: 250.0, threshold: 100.0 }]);
    }

    #[test]
    fn test_loss_dominates_latency() {
        let sample = Sample::ping(t(0), 50.0, Some(400.0));
        let verdict = evaluate_sample(&policy(), &Subject::default(), &sample).unwrap();
        assert_eq!(verdict.severity, Severity::Fail);
        assert_eq!(verdict.reasons[0].label(), "loss");
        assert_eq!(verdict.reasons[1].label(), "latency");
    }

    #[test]
    fn test_pending_below_floor() {
        let record = run(&pings(&[100.0, 100.0]));
        assert_eq!(record.status, Status::Pending);
        assert_eq!(record.reasons, vec![Reason::InsufficientData { samples: 2, required: 3 }]);
        assert_eq!(record.stats.rto_pct, Some(100.0));
    }

    #[test]
    fn test_stale_window_is_pending() {
        let mut p = policy();
        p.stale_after_secs = Some(600);
        let samples = pings(&[0.0, 0.0, 0.0]);
        let record = classify_samples(&p, &Subject::default(), &samples, t(3600));
        assert_eq!(record.status, Status::Pending);
        assert_eq!(record.reasons, vec![Reason::Stale { last_seen: t(120) }]);
    }

    #[test]
    fn test_stats() {
        let samples = vec![
            Sample::ping(t(0), 0.0, Some(10.0)),
            Sample::ping(t(60), 100.0, None),
            Sample::ping(t(120), 0.0, Some(30.0)),
            Sample::ping(t(180), 100.0, None),
            Sample::ping(t(240), 100.0, None),
        ];
        let record = run(&samples);
        assert_eq!(record.stats.samples, 5);
        assert_eq!(record.stats.uptime_pct, Some(40.0));
        assert_eq!(record.stats.loss_avg, Some(60.0));
        assert_eq!(record.stats.avg_ms, Some(20.0));
        assert_eq!(record.stats.rto_pct, Some(60.0));
        assert_eq!(record.stats.down_events, 2);
        assert_eq!(record.stats.last_check_at, Some(t(240)));
    }

    #[test]
    fn test_optical_tx_missing_rx_valid() {
        let samples: Vec<Sample> = (0..3)
            .map(|i| Sample::optical(t(i * 60), Some(-18.5), None).with_ping(0.0, Some(4.0)))
            .collect();
        let record = run(&samples);

        assert_eq!(record.status, Status::Stable);
        assert!(record.flags.tx_missing);
        assert!(!record.flags.rx_missing);
        assert!(!record.flags.rx_invalid);
        assert_eq!(record.stats.rx_dbm, Some(-18.5));
        assert_eq!(record.stats.tx_dbm, None);
    }

    #[test]
    fn test_optical_valid_but_loss_issue() {
        let samples: Vec<Sample> = (0..3)
            .map(|i| Sample::optical(t(i * 60), Some(-18.5), None).with_ping(100.0, None))
            .collect();
        let record = run(&samples);
        assert_eq!(record.status, Status::Issue);
        assert!(record.flags.tx_missing);
        assert_eq!(record.reasons.len(), 1);
        assert_eq!(record.reasons[0].label(), "loss");
    }

    #[test]
    fn test_unrealistic_rx_is_flagged_not_failed() {
        let samples: Vec<Sample> = (0..3)
            .map(|i| Sample::optical(t(i * 60), Some(-55.0), Some(2.0)))
            .collect();
        let record = run(&samples);
        assert_eq!(record.status, Status::Stable);
        assert!(record.flags.rx_invalid);
        assert_eq!(record.stats.rx_dbm, None);
    }

    #[test]
    fn test_low_rx_fails_and_scope_filters() {
        let samples: Vec<Sample> = (0..3)
            .map(|i| Sample::optical(t(i * 60), Some(-29.0), Some(2.0)).with_ping(0.0, Some(3.0)))
            .collect();
        let all = run(&samples);
        assert_eq!(all.status, Status::Issue);
        assert_eq!(all.reasons[0].label(), "low_rx");

        let ping_only = Subject {
            scope: MetricScope::Ping,
            ..Default::default()
        };
        let record = classify_samples(&policy(), &ping_only, &samples, t(120));
        assert_eq!(record.status, Status::Stable);
        assert_eq!(record.flags, OpticalFlags::default());
    }

    #[test]
    fn test_no_usage_rule() {
        let mut p = policy();
        p.usage.no_usage_max_bps = Some(8000.0);
        let idle = UsageMetrics {
            bps_in: 1000.0,
            bps_out: 500.0,
            connected_devices: Some(3),
            ..Default::default()
        };
        let sample = Sample::at(t(0)).with_usage(idle);
        let verdict = evaluate_sample(&p, &Subject::default(), &sample).unwrap();
        assert_eq!(verdict.reasons, vec![Reason::NoUsage { bps: 1500.0, ceiling: 8000.0 }]);

        let lonely = Sample::at(t(0)).with_usage(UsageMetrics {
            connected_devices: Some(1),
            ..idle
        });
        let verdict = evaluate_sample(&p, &Subject::default(), &lonely).unwrap();
        assert_eq!(verdict.severity, Severity::Pass);
    }
}
