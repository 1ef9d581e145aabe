//! Network quality scoring.
//!
//! Turns a raw client network report into a composite 0-100 score and a
//! discrete [`QualityLevel`]. Every metric is scored independently with a
//! piecewise-linear curve over three breakpoints, then combined by a fixed
//! weighted sum:
//!
//! | Metric      | Weight | Excellent | Good   | Poor  |
//! |-------------|--------|-----------|--------|-------|
//! | RTT         | 30%    | ≤50ms     | ≤100ms | ≤200ms|
//! | Packet loss | 25%    | ≤1%       | ≤3%    | ≤10%  |
//! | Jitter      | 20%    | ≤10ms     | ≤20ms  | ≤50ms |
//! | Bandwidth   | 15%*   | ≥2000kbps | ≥1000  | ≥500  |
//! | Signal      | 10%    | ≥80%      | ≥60%   | ≥40%  |
//!
//! *Bandwidth carries 25% when the client does not report signal strength.
//!
//! The scorer holds only its thresholds, so one instance is shared by every
//! request without synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidecall_common::config::QualityConfig;
use tidecall_common::error::{CallError, CallResult};
use tidecall_common::snowflake::UserId;

const RTT_WEIGHT: f64 = 0.30;
const LOSS_WEIGHT: f64 = 0.25;
const JITTER_WEIGHT: f64 = 0.20;
const BANDWIDTH_WEIGHT: f64 = 0.15;
const BANDWIDTH_WEIGHT_NO_SIGNAL: f64 = 0.25;
const SIGNAL_WEIGHT: f64 = 0.10;

// Points lost per unit past the poor breakpoint.
const RTT_DECAY_PER_MS: f64 = 0.5;
const LOSS_DECAY_PER_PCT: f64 = 5.0;
const JITTER_DECAY_PER_MS: f64 = 2.0;
const BANDWIDTH_DECAY_PER_KBPS: f64 = 0.1;

/// Access network a client reports it is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Ethernet,
    #[serde(rename = "4g")]
    Cellular4g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[default]
    Unknown,
}

/// One client network report. Produced by the client, consumed by exactly one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Filled in by the transport from the authenticated connection.
    #[serde(default)]
    pub user_id: UserId,
    pub rtt_ms: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub bandwidth_kbps: f64,
    /// Radio signal strength; `None` for wired links or clients that cannot read it.
    #[serde(default)]
    pub signal_pct: Option<f64>,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl NetworkSample {
    /// Reject reports that cannot be scored (negative or non-finite metrics).
    pub fn validate(&self) -> CallResult<()> {
        let metrics = [
            ("rtt_ms", self.rtt_ms),
            ("packet_loss_pct", self.packet_loss_pct),
            ("jitter_ms", self.jitter_ms),
            ("bandwidth_kbps", self.bandwidth_kbps),
            ("signal_pct", self.signal_pct.unwrap_or(0.0)),
        ];
        for (name, value) in metrics {
            if !value.is_finite() || value < 0.0 {
                return Err(CallError::InvalidSample(format!("{name} = {value}")));
            }
        }
        if self.packet_loss_pct > 100.0 {
            return Err(CallError::InvalidSample(format!(
                "packet_loss_pct = {}",
                self.packet_loss_pct
            )));
        }
        Ok(())
    }
}

/// Discrete bucketing of the composite score, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    VeryPoor,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Bucket a composite score: ≥90 excellent, ≥75 good, ≥60 fair, ≥40 poor.
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 90.0 => Self::Excellent,
            s if s >= 75.0 => Self::Good,
            s if s >= 60.0 => Self::Fair,
            s if s >= 40.0 => Self::Poor,
            _ => Self::VeryPoor,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::VeryPoor => "very_poor",
        }
    }
}

/// Per-metric sub-scores alongside the weighted composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub rtt: f64,
    pub packet_loss: f64,
    pub jitter: f64,
    pub bandwidth: f64,
    pub signal: Option<f64>,
    pub total: f64,
    pub level: QualityLevel,
}

/// Pure network quality scorer.
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    thresholds: QualityConfig,
}

impl QualityScorer {
    pub fn new(thresholds: QualityConfig) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityConfig {
        &self.thresholds
    }

    /// Composite score in [0, 100] and its level.
    pub fn score(&self, sample: &NetworkSample) -> (f64, QualityLevel) {
        let breakdown = self.score_breakdown(sample);
        (breakdown.total, breakdown.level)
    }

    pub fn score_breakdown(&self, sample: &NetworkSample) -> ScoreBreakdown {
        let t = &self.thresholds;

        let rtt = lower_is_better(
            sample.rtt_ms,
            [t.rtt_excellent_ms, t.rtt_good_ms, t.rtt_poor_ms],
            RTT_DECAY_PER_MS,
        );
        let packet_loss = lower_is_better(
            sample.packet_loss_pct,
            [t.loss_excellent_pct, t.loss_good_pct, t.loss_poor_pct],
            LOSS_DECAY_PER_PCT,
        );
        let jitter = lower_is_better(
            sample.jitter_ms,
            [t.jitter_excellent_ms, t.jitter_good_ms, t.jitter_poor_ms],
            JITTER_DECAY_PER_MS,
        );
        let bandwidth = higher_is_better(
            sample.bandwidth_kbps,
            [
                t.bandwidth_excellent_kbps,
                t.bandwidth_good_kbps,
                t.bandwidth_poor_kbps,
            ],
        );
        let signal = sample.signal_pct.map(|s| {
            signal_score(s, [t.signal_excellent_pct, t.signal_good_pct, t.signal_poor_pct])
        });

        let weighted = rtt * RTT_WEIGHT + packet_loss * LOSS_WEIGHT + jitter * JITTER_WEIGHT;
        let total = match signal {
            Some(signal) => weighted + bandwidth * BANDWIDTH_WEIGHT + signal * SIGNAL_WEIGHT,
            None => weighted + bandwidth * BANDWIDTH_WEIGHT_NO_SIGNAL,
        }
        .clamp(0.0, 100.0);

        ScoreBreakdown {
            rtt,
            packet_loss,
            jitter,
            bandwidth,
            signal,
            total,
            level: QualityLevel::from_score(total),
        }
    }
}

/// Linear interpolation from `hi` at `from` to `lo` at `to`.
fn interpolate(value: f64, from: f64, to: f64, hi: f64, lo: f64) -> f64 {
    let span = to - from;
    if span.abs() < f64::EPSILON {
        return lo;
    }
    hi + (lo - hi) * (value - from) / span
}

/// Score a metric where smaller is better (RTT, loss, jitter).
fn lower_is_better(value: f64, [excellent, good, poor]: [f64; 3], decay: f64) -> f64 {
    let score = if value <= excellent {
        100.0
    } else if value <= good {
        interpolate(value, excellent, good, 100.0, 80.0)
    } else if value <= poor {
        interpolate(value, good, poor, 80.0, 60.0)
    } else {
        60.0 - (value - poor) * decay
    };
    score.clamp(0.0, 100.0)
}

/// Score a metric where larger is better (bandwidth).
fn higher_is_better(value: f64, [excellent, good, poor]: [f64; 3]) -> f64 {
    let score = if value >= excellent {
        100.0
    } else if value >= good {
        interpolate(value, excellent, good, 100.0, 80.0)
    } else if value >= poor {
        interpolate(value, good, poor, 80.0, 60.0)
    } else {
        60.0 - (poor - value) * BANDWIDTH_DECAY_PER_KBPS
    };
    score.clamp(0.0, 100.0)
}

/// Signal strength decays proportionally below the poor breakpoint instead of linearly.
fn signal_score(value: f64, [excellent, good, poor]: [f64; 3]) -> f64 {
    let score = if value >= excellent {
        100.0
    } else if value >= good {
        interpolate(value, excellent, good, 100.0, 80.0)
    } else if value >= poor {
        interpolate(value, good, poor, 80.0, 60.0)
    } else if value >= poor / 2.0 {
        interpolate(value, poor, poor / 2.0, 60.0, 40.0)
    } else if poor > 0.0 {
        value * 40.0 / (poor / 2.0)
    } else {
        0.0
    };
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
pub(crate) fn sample(rtt: f64, loss: f64, jitter: f64, bandwidth: f64, signal: Option<f64>) -> NetworkSample {
    NetworkSample {
        user_id: uuid::Uuid::nil(),
        rtt_ms: rtt,
        packet_loss_pct: loss,
        jitter_ms: jitter,
        bandwidth_kbps: bandwidth,
        signal_pct: signal,
        network_type: NetworkType::Wifi,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scorer() -> QualityScorer {
        QualityScorer::default()
    }

    #[test]
    fn nominal_network_is_excellent() {
        let (score, level) = scorer().score(&sample(30.0, 0.5, 5.0, 5000.0, Some(90.0)));
        assert!(score >= 90.0, "score was {score}");
        assert_eq!(level, QualityLevel::Excellent);
    }

    #[test]
    fn breakpoints_land_on_band_edges() {
        let s = scorer();
        let b = s.score_breakdown(&sample(100.0, 3.0, 20.0, 1000.0, Some(60.0)));
        assert_eq!(b.rtt, 80.0);
        assert_eq!(b.packet_loss, 80.0);
        assert_eq!(b.jitter, 80.0);
        assert_eq!(b.bandwidth, 80.0);
        assert_eq!(b.signal, Some(80.0));

        let b = s.score_breakdown(&sample(200.0, 10.0, 50.0, 500.0, Some(40.0)));
        assert_eq!(b.rtt, 60.0);
        assert_eq!(b.packet_loss, 60.0);
        assert_eq!(b.jitter, 60.0);
        assert_eq!(b.bandwidth, 60.0);
        assert_eq!(b.signal, Some(60.0));
    }

    #[test]
    fn below_poor_decays_to_zero() {
        let b = scorer().score_breakdown(&sample(350.0, 25.0, 90.0, 0.0, Some(0.0)));
        assert_eq!(b.rtt, 0.0);
        assert_eq!(b.packet_loss, 0.0);
        assert_eq!(b.jitter, 0.0);
        assert_eq!(b.bandwidth, 10.0);
        assert_eq!(b.signal, Some(0.0));
    }

    #[test]
    fn missing_signal_shifts_weight_to_bandwidth() {
        let s = scorer();
        let with_signal = s.score_breakdown(&sample(30.0, 0.5, 5.0, 750.0, Some(100.0)));
        let without = s.score_breakdown(&sample(30.0, 0.5, 5.0, 750.0, None));
        // bandwidth sub-score is 70 in both cases
        assert_eq!(with_signal.bandwidth, 70.0);
        assert!((with_signal.total - (75.0 + 70.0 * 0.15 + 10.0)).abs() < 1e-9);
        assert!((without.total - (75.0 + 70.0 * 0.25)).abs() < 1e-9);
    }

    #[test]
    fn high_rtt_alone_is_only_fair() {
        let (score, level) = scorer().score(&sample(350.0, 1.0, 5.0, 5000.0, Some(90.0)));
        assert!((score - 70.0).abs() < 1e-9);
        assert_eq!(level, QualityLevel::Fair);
    }

    #[test]
    fn levels_bucket_at_documented_breakpoints() {
        assert_eq!(QualityLevel::from_score(90.0), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(89.99), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(75.0), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(60.0), QualityLevel::Fair);
        assert_eq!(QualityLevel::from_score(40.0), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(39.9), QualityLevel::VeryPoor);
        assert!(QualityLevel::Excellent > QualityLevel::Good);
    }

    #[test]
    fn invalid_samples_are_rejected() {
        assert!(sample(-1.0, 0.0, 0.0, 0.0, None).validate().is_err());
        assert!(sample(10.0, f64::NAN, 0.0, 0.0, None).validate().is_err());
        assert!(sample(10.0, 120.0, 0.0, 0.0, None).validate().is_err());
        assert!(sample(10.0, 1.0, 1.0, 100.0, Some(50.0)).validate().is_ok());
    }

    #[test]
    fn network_type_uses_wire_names() {
        let json = serde_json::to_string(&NetworkType::Cellular4g).unwrap();
        assert_eq!(json, "\"4g\"");
        let parsed: NetworkType = serde_json::from_str("\"wifi\"").unwrap();
        assert_eq!(parsed, NetworkType::Wifi);
    }

    fn metric() -> impl Strategy<Value = f64> {
        0.0f64..5000.0
    }

    proptest! {
        #[test]
        fn score_stays_in_range(
            rtt in metric(), loss in 0.0f64..100.0, jitter in metric(),
            bw in 0.0f64..20000.0, signal in proptest::option::of(0.0f64..100.0),
        ) {
            let (score, _) = scorer().score(&sample(rtt, loss, jitter, bw, signal));
            prop_assert!((0.0..=100.0).contains(&score));
        }

        #[test]
        fn score_never_improves_as_latency_loss_or_jitter_grow(
            rtt in metric(), loss in 0.0f64..50.0, jitter in metric(), bw in 0.0f64..5000.0,
            delta in 0.0f64..500.0,
        ) {
            let s = scorer();
            let base = s.score(&sample(rtt, loss, jitter, bw, Some(70.0))).0;
            prop_assert!(s.score(&sample(rtt + delta, loss, jitter, bw, Some(70.0))).0 <= base + 1e-9);
            prop_assert!(s.score(&sample(rtt, loss + delta / 10.0, jitter, bw, Some(70.0))).0 <= base + 1e-9);
            prop_assert!(s.score(&sample(rtt, loss, jitter + delta, bw, Some(70.0))).0 <= base + 1e-9);
        }

        #[test]
        fn score_never_worsens_as_bandwidth_or_signal_grow(
            rtt in metric(), loss in 0.0f64..50.0, jitter in metric(), bw in 0.0f64..5000.0,
            signal in 0.0f64..90.0, delta in 0.0f64..1000.0,
        ) {
            let s = scorer();
            let base = s.score(&sample(rtt, loss, jitter, bw, Some(signal))).0;
            prop_assert!(s.score(&sample(rtt, loss, jitter, bw + delta, Some(signal))).0 >= base - 1e-9);
            let stronger = (signal + delta / 100.0).min(100.0);
            prop_assert!(s.score(&sample(rtt, loss, jitter, bw, Some(stronger))).0 >= base - 1e-9);
        }
    }
}
