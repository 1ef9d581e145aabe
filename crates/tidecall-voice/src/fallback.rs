//! Fallback controller: the per-call rung state machine.
//!
//! Each registered call owns a [`CallFallbackState`]. A network sample is
//! scored, mapped to a target rung, and applied with hysteresis:
//!
//! - **Downgrade** is immediate. The target is the more severe of the
//!   score-implied rung and any override threshold the sample trips.
//! - **Recovery** is gated (the call must have degraded before, and the
//!   sample must be Good or better or pass every recovery threshold) and
//!   climbs at most one rung per evaluation.
//!
//! The map lock is only held to look up or insert/remove a call's entry.
//! Each call's state sits behind its own mutex, so evaluations of different
//! calls never contend.

use crate::codec::{ClientProfile, CodecCatalog};
use crate::history::BoundedHistory;
use crate::ladder::{FallbackRung, MediaProfile, MediaProfileLadder};
use crate::quality::{NetworkSample, QualityLevel, QualityScorer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tidecall_common::config::FallbackConfig;
use tidecall_common::error::{CallError, CallResult};
use tidecall_common::snowflake::CallId;
use tokio::sync::{Mutex, RwLock};

// Downgrade reason classification thresholds.
const REASON_RTT_MS: f64 = 300.0;
const REASON_LOSS_PCT: f64 = 8.0;
const REASON_BANDWIDTH_KBPS: f64 = 800.0;
const REASON_JITTER_MS: f64 = 60.0;

/// Why a call changed rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    HighLatency,
    HighPacketLoss,
    LowBandwidth,
    HighJitter,
    NetworkUnstable,
    NetworkRecovery,
    UserRequest,
}

impl TransitionReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HighLatency => "high_latency",
            Self::HighPacketLoss => "high_packet_loss",
            Self::LowBandwidth => "low_bandwidth",
            Self::HighJitter => "high_jitter",
            Self::NetworkUnstable => "network_unstable",
            Self::NetworkRecovery => "network_recovery",
            Self::UserRequest => "user_request",
        }
    }

    /// Pick the most telling reason for a network-driven downgrade.
    fn classify(sample: &NetworkSample) -> Self {
        if sample.rtt_ms > REASON_RTT_MS {
            Self::HighLatency
        } else if sample.packet_loss_pct > REASON_LOSS_PCT {
            Self::HighPacketLoss
        } else if sample.bandwidth_kbps < REASON_BANDWIDTH_KBPS {
            Self::LowBandwidth
        } else if sample.jitter_ms > REASON_JITTER_MS {
            Self::HighJitter
        } else {
            Self::NetworkUnstable
        }
    }
}

/// One scored sample as recorded in a call's quality history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySnapshot {
    pub at: DateTime<Utc>,
    pub score: f64,
    pub level: QualityLevel,
    /// Rung in effect after this sample was applied.
    pub rung: FallbackRung,
    pub rtt_ms: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub bandwidth_kbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: FallbackRung,
    pub to: FallbackRung,
    pub reason: TransitionReason,
    /// Score of the sample that caused it; `None` for user requests.
    pub score: Option<f64>,
}

impl Transition {
    pub fn is_downgrade(&self) -> bool {
        self.to > self.from
    }
}

/// Per-call fallback state. Cloned out for reads; mutated only under the call's lock.
#[derive(Debug, Clone, Serialize)]
pub struct CallFallbackState {
    pub call_id: CallId,
    pub current_rung: FallbackRung,
    pub fallback_count: u32,
    /// Recovery steps taken since the last downgrade.
    pub recovery_attempts: u32,
    /// Set for the duration of a recovery attempt.
    pub is_recovering: bool,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_reason: Option<TransitionReason>,
    pub registered_at: DateTime<Utc>,
    pub quality_history: BoundedHistory<QualitySnapshot>,
    pub transition_history: BoundedHistory<Transition>,
    #[serde(skip)]
    closed: bool,
}

impl CallFallbackState {
    fn new(call_id: CallId, config: &FallbackConfig) -> Self {
        Self {
            call_id,
            current_rung: FallbackRung::HighQuality,
            fallback_count: 0,
            recovery_attempts: 0,
            is_recovering: false,
            last_transition_at: None,
            last_reason: None,
            registered_at: Utc::now(),
            quality_history: BoundedHistory::new(config.quality_history_capacity),
            transition_history: BoundedHistory::new(config.transition_history_capacity),
            closed: false,
        }
    }

    fn apply(&mut self, to: FallbackRung, reason: TransitionReason, score: Option<f64>) -> Transition {
        let transition = Transition {
            at: Utc::now(),
            from: self.current_rung,
            to,
            reason,
            score,
        };
        self.current_rung = to;
        self.last_transition_at = Some(transition.at);
        self.last_reason = Some(reason);
        self.transition_history.push(transition.clone());
        transition
    }
}

/// Result of applying one sample.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub call_id: CallId,
    pub rung: FallbackRung,
    /// `None` when the rung carries no media.
    pub profile: Option<MediaProfile>,
    pub score: f64,
    pub level: QualityLevel,
    pub transition: Option<Transition>,
}

/// Summary over a call's recent quality history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityTrend {
    pub samples: usize,
    pub average_score: f64,
    pub variance: f64,
    pub predicted_next: f64,
}

impl QualityTrend {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f64;
        let average_score = scores.iter().sum::<f64>() / n;
        let variance = scores
            .iter()
            .map(|s| (s - average_score).powi(2))
            .sum::<f64>()
            / n;
        Some(Self {
            samples: scores.len(),
            average_score,
            variance,
            predicted_next: predict_next(scores),
        })
    }

    /// Stable when score variance stays under `threshold`. Fewer than three
    /// samples are always stable.
    pub fn is_stable(&self, threshold: f64) -> bool {
        self.samples < 3 || self.variance < threshold
    }
}

/// Least-squares line through `(i, score_i)`, extrapolated one step.
fn predict_next(scores: &[f64]) -> f64 {
    let n = scores.len();
    if n < 2 {
        return scores.first().copied().unwrap_or(0.0);
    }
    let nf = n as f64;
    let (sum_x, sum_y, sum_xy, sum_xx) = scores.iter().enumerate().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(sx, sy, sxy, sxx), (i, y)| {
            let x = i as f64;
            (sx + x, sy + y, sxy + x * y, sxx + x * x)
        },
    );
    let denom = nf * sum_xx - sum_x * sum_x;
    let slope = if denom.abs() < f64::EPSILON {
        0.0
    } else {
        (nf * sum_xy - sum_x * sum_y) / denom
    };
    let intercept = (sum_y - slope * sum_x) / nf;
    (slope * nf + intercept).clamp(0.0, 100.0)
}

/// Hint for the client or operator about an ongoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    UnstableConnection,
    UseWiredNetwork,
    CheckPacketLoss,
    FreeUpBandwidth,
    ImproveNetworkForVideo,
    SwitchToStableNetwork,
    OptimizeNetwork,
    QualityGood,
}

impl Recommendation {
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnstableConnection => "Call quality is unstable; check your network connection",
            Self::UseWiredNetwork => "Latency is high; a wired connection may help",
            Self::CheckPacketLoss => "Packet loss is high; check your network connection",
            Self::FreeUpBandwidth => "Bandwidth is low; close other applications using the network",
            Self::ImproveNetworkForVideo => "Audio-only mode is active; improve the network to enable video",
            Self::SwitchToStableNetwork => "Very low quality mode is active; switch to a more stable network",
            Self::OptimizeNetwork => "Low quality mode is active; consider improving the network",
            Self::QualityGood => "Call quality is good",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStatistics {
    pub active_calls: usize,
    pub total_fallbacks: u64,
    pub total_recoveries: u64,
    pub rung_distribution: BTreeMap<&'static str, usize>,
    pub reason_distribution: BTreeMap<&'static str, usize>,
}

/// Owns every call's [`CallFallbackState`] and applies the rung policy.
#[derive(Clone)]
pub struct FallbackController {
    calls: Arc<RwLock<HashMap<CallId, Arc<Mutex<CallFallbackState>>>>>,
    scorer: Arc<QualityScorer>,
    catalog: CodecCatalog,
    config: Arc<FallbackConfig>,
}

impl FallbackController {
    pub fn new(scorer: QualityScorer, catalog: CodecCatalog, config: FallbackConfig) -> Self {
        Self {
            calls: Arc::new(RwLock::new(HashMap::new())),
            scorer: Arc::new(scorer),
            catalog,
            config: Arc::new(config),
        }
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    /// Start tracking a call at `HighQuality`. Re-registering resets its state.
    pub async fn register_call(&self, call_id: CallId) {
        let state = CallFallbackState::new(call_id, &self.config);
        let previous = self
            .calls
            .write()
            .await
            .insert(call_id, Arc::new(Mutex::new(state)));
        if let Some(previous) = previous {
            previous.lock().await.closed = true;
        }
        tracing::debug!(call = %call_id, "Fallback state registered");
    }

    /// Stop tracking a call. Returns whether it was tracked.
    pub async fn unregister_call(&self, call_id: CallId) -> bool {
        let removed = self.calls.write().await.remove(&call_id);
        match removed {
            Some(entry) => {
                // An evaluation that already cloned the Arc sees this and bails.
                entry.lock().await.closed = true;
                tracing::debug!(call = %call_id, "Fallback state unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, call_id: CallId) -> bool {
        self.calls.read().await.contains_key(&call_id)
    }

    async fn entry(&self, call_id: CallId) -> CallResult<Arc<Mutex<CallFallbackState>>> {
        self.calls
            .read()
            .await
            .get(&call_id)
            .cloned()
            .ok_or(CallError::CallNotFound(call_id))
    }

    /// Score `sample` and apply it to the call's rung.
    pub async fn evaluate(&self, call_id: CallId, sample: &NetworkSample) -> CallResult<Evaluation> {
        self.evaluate_inner(call_id, sample, None).await
    }

    /// Like [`evaluate`](Self::evaluate), with the returned profile's codecs
    /// refined for the client's device and browser.
    pub async fn evaluate_for_client(
        &self,
        call_id: CallId,
        sample: &NetworkSample,
        client: &ClientProfile,
    ) -> CallResult<Evaluation> {
        self.evaluate_inner(call_id, sample, Some(client)).await
    }

    async fn evaluate_inner(
        &self,
        call_id: CallId,
        sample: &NetworkSample,
        client: Option<&ClientProfile>,
    ) -> CallResult<Evaluation> {
        sample.validate()?;
        let (score, level) = self.scorer.score(sample);

        let entry = self.entry(call_id).await?;
        let mut state = entry.lock().await;
        if state.closed {
            return Err(CallError::CallNotFound(call_id));
        }

        let target = level_target(level).max(self.override_target(sample));
        let transition = if target > state.current_rung {
            let reason = TransitionReason::classify(sample);
            let t = state.apply(target, reason, Some(score));
            state.fallback_count += 1;
            state.is_recovering = false;
            state.recovery_attempts = 0;
            tracing::info!(
                call = %call_id,
                from = %t.from,
                to = %t.to,
                reason = reason.label(),
                score,
                fallback_count = state.fallback_count,
                "Call downgraded"
            );
            Some(t)
        } else if self.can_recover(&state, sample, level) {
            self.attempt_recovery(&mut state, sample, level, score)
        } else {
            None
        };

        let rung = state.current_rung;
        state.quality_history.push(QualitySnapshot {
            at: sample.timestamp,
            score,
            level,
            rung,
            rtt_ms: sample.rtt_ms,
            packet_loss_pct: sample.packet_loss_pct,
            jitter_ms: sample.jitter_ms,
            bandwidth_kbps: sample.bandwidth_kbps,
        });
        drop(state);

        tracing::debug!(call = %call_id, score, level = level.label(), rung = %rung, "Sample evaluated");

        let profile = match client {
            Some(client) => self.catalog.select_for(rung, sample, client),
            None => MediaProfileLadder::profile_for(rung).cloned(),
        };

        Ok(Evaluation {
            call_id,
            rung,
            profile,
            score,
            level,
            transition,
        })
    }

    /// Most severe rung forced by a single metric, regardless of the composite score.
    fn override_target(&self, sample: &NetworkSample) -> FallbackRung {
        let c = &self.config;
        [
            (sample.rtt_ms > c.override_rtt_ms, FallbackRung::AudioOnly),
            (sample.packet_loss_pct > c.override_loss_pct, FallbackRung::VeryLowQuality),
            (sample.bandwidth_kbps < c.override_bandwidth_kbps, FallbackRung::LowQuality),
            (sample.jitter_ms > c.override_jitter_ms, FallbackRung::LowQuality),
        ]
        .into_iter()
        .filter_map(|(tripped, rung)| tripped.then_some(rung))
        .max()
        .unwrap_or(FallbackRung::HighQuality)
    }

    fn can_recover(&self, state: &CallFallbackState, sample: &NetworkSample, level: QualityLevel) -> bool {
        if state.is_recovering || state.fallback_count == 0 {
            return false;
        }
        let c = &self.config;
        level >= QualityLevel::Good
            || (sample.rtt_ms < c.recovery_rtt_ms
                && sample.packet_loss_pct < c.recovery_loss_pct
                && sample.bandwidth_kbps > c.recovery_bandwidth_kbps)
    }

    /// Climb one rung toward the level's recovery target. Leaves state
    /// untouched when the level has no target, the call is already there,
    /// or the next rung would sit above the floor a metric override forces.
    fn attempt_recovery(
        &self,
        state: &mut CallFallbackState,
        sample: &NetworkSample,
        level: QualityLevel,
        score: f64,
    ) -> Option<Transition> {
        let target = recovery_target(level)?;
        if target >= state.current_rung {
            return None;
        }
        let next = state.current_rung.step_up()?;
        if next < self.override_target(sample) {
            return None;
        }

        state.is_recovering = true;
        state.recovery_attempts += 1;
        let t = state.apply(next, TransitionReason::NetworkRecovery, Some(score));
        state.is_recovering = false;

        tracing::info!(
            call = %state.call_id,
            from = %t.from,
            to = %t.to,
            target = %target,
            attempt = state.recovery_attempts,
            "Call recovering"
        );
        Some(t)
    }

    /// Move a call to `rung` on the user's request. Returns `None` when it is already there.
    pub async fn request_rung(&self, call_id: CallId, rung: FallbackRung) -> CallResult<Option<Transition>> {
        let entry = self.entry(call_id).await?;
        let mut state = entry.lock().await;
        if state.closed {
            return Err(CallError::CallNotFound(call_id));
        }
        if state.current_rung == rung {
            return Ok(None);
        }
        let t = state.apply(rung, TransitionReason::UserRequest, None);
        tracing::info!(call = %call_id, from = %t.from, to = %t.to, "Rung changed on request");
        Ok(Some(t))
    }

    pub async fn get_state(&self, call_id: CallId) -> CallResult<CallFallbackState> {
        let entry = self.entry(call_id).await?;
        let state = entry.lock().await;
        if state.closed {
            return Err(CallError::CallNotFound(call_id));
        }
        Ok(state.clone())
    }

    /// Trend over the call's quality history.
    pub async fn quality_trend(&self, call_id: CallId) -> CallResult<QualityTrend> {
        let scores: Vec<f64> = {
            let state = self.get_state(call_id).await?;
            state.quality_history.iter().map(|s| s.score).collect()
        };
        QualityTrend::from_scores(&scores).ok_or(CallError::QualityStateNotFound(call_id))
    }

    pub async fn recommendations(&self, call_id: CallId) -> CallResult<Vec<Recommendation>> {
        let state = self.get_state(call_id).await?;
        let mut out = Vec::new();

        if state.fallback_count > 3 {
            out.push(Recommendation::UnstableConnection);
        }
        if let Some(latest) = state.quality_history.latest() {
            if latest.rtt_ms > 200.0 {
                out.push(Recommendation::UseWiredNetwork);
            }
            if latest.packet_loss_pct > 5.0 {
                out.push(Recommendation::CheckPacketLoss);
            }
            if latest.bandwidth_kbps < 1000.0 {
                out.push(Recommendation::FreeUpBandwidth);
            }
        }
        match state.current_rung {
            FallbackRung::AudioOnly => out.push(Recommendation::ImproveNetworkForVideo),
            FallbackRung::VeryLowQuality => out.push(Recommendation::SwitchToStableNetwork),
            FallbackRung::LowQuality => out.push(Recommendation::OptimizeNetwork),
            _ => {}
        }
        if out.is_empty() {
            out.push(Recommendation::QualityGood);
        }
        Ok(out)
    }

    pub async fn statistics(&self) -> FallbackStatistics {
        let entries: Vec<_> = self.calls.read().await.values().cloned().collect();
        let mut stats = FallbackStatistics {
            active_calls: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let state = entry.lock().await;
            if state.closed {
                stats.active_calls -= 1;
                continue;
            }
            stats.total_fallbacks += u64::from(state.fallback_count);
            stats.total_recoveries += u64::from(state.recovery_attempts);
            *stats
                .rung_distribution
                .entry(state.current_rung.label())
                .or_default() += 1;
            if let Some(reason) = state.last_reason {
                *stats.reason_distribution.entry(reason.label()).or_default() += 1;
            }
        }
        stats
    }

    /// Drop history entries older than `cutoff` from every tracked call.
    /// Call state itself is never removed here.
    pub async fn prune_history(&self, cutoff: DateTime<Utc>) -> usize {
        let entries: Vec<_> = self.calls.read().await.values().cloned().collect();
        let mut pruned = 0;
        for entry in entries {
            let mut state = entry.lock().await;
            let before = state.quality_history.len() + state.transition_history.len();
            state.quality_history.retain(|s| s.at >= cutoff);
            state.transition_history.retain(|t| t.at >= cutoff);
            pruned += before - state.quality_history.len() - state.transition_history.len();
        }
        pruned
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.read().await.len()
    }
}

/// Rung implied by a quality level for downgrade purposes.
fn level_target(level: QualityLevel) -> FallbackRung {
    match level {
        QualityLevel::Excellent | QualityLevel::Good => FallbackRung::HighQuality,
        QualityLevel::Fair => FallbackRung::MediumQuality,
        QualityLevel::Poor => FallbackRung::LowQuality,
        QualityLevel::VeryPoor => FallbackRung::AudioOnly,
    }
}

/// Rung a recovery climbs toward; `None` aborts the attempt.
fn recovery_target(level: QualityLevel) -> Option<FallbackRung> {
    match level {
        QualityLevel::Excellent => Some(FallbackRung::HighQuality),
        QualityLevel::Good => Some(FallbackRung::MediumQuality),
        QualityLevel::Fair => Some(FallbackRung::LowQuality),
        QualityLevel::Poor | QualityLevel::VeryPoor => None,
    }
}
