//! # tidecall-voice
//!
//! Real-time call quality control for one-to-one audio/video calls.
//!
//! Architecture: peer to peer media, server-side control
//! - Media flows directly between participants; the server relays signaling
//! - Each call has a session (membership, toggles, screen share) and a
//!   fallback state (quality rung, histories), with a shared lifecycle
//! - Clients report network samples; each one is scored and may move the call
//!   down the ladder immediately, or back up one rung at a time
//! - Screen-share quality follows its own, simpler speed/CPU policy
//!
//! [`CallServer`] is the composition object. It owns one
//! [`registry::CallSessionRegistry`] and one [`fallback::FallbackController`],
//! keeps their per-call lifecycles paired, and publishes [`CallEvent`]s.

pub mod cleanup;
pub mod codec;
pub mod fallback;
pub mod handler;
pub mod history;
pub mod ladder;
pub mod peer;
pub mod quality;
pub mod registry;
pub mod screen_share;
pub mod signaling;

use chrono::Utc;
use codec::{ClientProfile, CodecCatalog};
use fallback::{
    CallFallbackState, Evaluation, FallbackController, FallbackStatistics, QualityTrend,
    Recommendation, Transition,
};
use ladder::FallbackRung;
use quality::{NetworkSample, QualityScorer};
use registry::{
    CallSessionRegistry, CallSnapshot, CallSummary, CallType, PeerConnectionState, PeerTx,
    RegistryStats, ScreenShareEnded, ScreenShareState,
};
use screen_share::ScreenShareQuality;
use signaling::{IceServer, Signal};
use std::sync::Arc;
use tidecall_common::call_event::CallEvent;
use tidecall_common::config::AppConfig;
use tidecall_common::error::{CallError, CallResult};
use tidecall_common::snowflake::{CallId, UserId};
use tokio::sync::broadcast;

/// Depth of the lifecycle event channel. Slow subscribers lag and skip.
const EVENT_BUFFER: usize = 1024;

/// Call server state.
#[derive(Clone)]
pub struct CallServer {
    registry: CallSessionRegistry,
    fallback: FallbackController,
    /// Lifecycle events for statistics/archival collaborators
    events: broadcast::Sender<CallEvent>,
    ice_servers: Arc<Vec<IceServer>>,
    outbound_buffer: usize,
}

impl CallServer {
    pub fn new(
        registry: CallSessionRegistry,
        fallback: FallbackController,
        ice_servers: Vec<IceServer>,
        outbound_buffer: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            fallback,
            events,
            ice_servers: Arc::new(ice_servers),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Build every component from loaded configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let scorer = QualityScorer::new(config.quality.clone());
        let fallback = FallbackController::new(scorer, CodecCatalog::builtin(), config.fallback.clone());
        Self::new(
            CallSessionRegistry::new(),
            fallback,
            IceServer::from_urls(&config.signaling.ice_servers),
            config.signaling.outbound_buffer,
        )
    }

    pub fn registry(&self) -> &CallSessionRegistry {
        &self.registry
    }

    pub fn fallback(&self) -> &FallbackController {
        &self.fallback
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Depth to use for each connected participant's outbound channel.
    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }

    /// Subscribe to call lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        let call_id = event.call_id();
        if self.events.send(event).is_err() {
            tracing::trace!(call = %call_id, "Call event dropped, no subscribers");
        }
    }

    // ========================================================================
    // Call lifecycle
    // ========================================================================

    /// Create a ringing call and start tracking its quality at `HighQuality`.
    pub async fn create_call(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
    ) -> CallResult<CallSnapshot> {
        let call = self.registry.create_call(caller_id, callee_id, call_type).await?;
        self.fallback.register_call(call.call_id).await;

        // Ended before its fallback state existed.
        if !self.registry.contains(call.call_id).await {
            self.fallback.unregister_call(call.call_id).await;
            return Err(CallError::CallNotFound(call.call_id));
        }

        self.emit(CallEvent::CallStarted {
            call_id: call.call_id,
            caller_id,
            callee_id,
            call_type: call_type.as_str().to_string(),
            at: call.started_at,
        });
        Ok(call)
    }

    pub async fn join_call(
        &self,
        call_id: CallId,
        user_id: UserId,
        tx: Option<PeerTx>,
    ) -> CallResult<CallSnapshot> {
        self.registry.join_call(call_id, user_id, tx).await
    }

    pub async fn answer_call(&self, call_id: CallId, user_id: UserId) -> CallResult<CallSnapshot> {
        let call = self.registry.answer_call(call_id, user_id).await?;
        self.emit(CallEvent::CallAnswered {
            call_id,
            user_id,
            at: Utc::now(),
        });
        Ok(call)
    }

    pub async fn reject_call(&self, call_id: CallId, user_id: UserId) -> CallResult<CallSummary> {
        let summary = self.registry.reject_call(call_id, user_id).await?;
        self.finish(&summary).await;
        Ok(summary)
    }

    pub async fn leave_call(&self, call_id: CallId, user_id: UserId) -> CallResult<()> {
        if let Some(stopped) = self.registry.leave_call(call_id, user_id).await? {
            self.emit_share_stopped(call_id, &stopped);
        }
        Ok(())
    }

    /// End a call and evict both halves of its state.
    ///
    /// Fallback state is dropped even when the session is already gone, so a
    /// racing `end_call` never leaves an orphan behind.
    pub async fn end_call(&self, call_id: CallId, reason: &str) -> CallResult<CallSummary> {
        match self.registry.end_call(call_id, reason).await {
            Ok(summary) => {
                self.finish(&summary).await;
                Ok(summary)
            }
            Err(e) => {
                self.fallback.unregister_call(call_id).await;
                Err(e)
            }
        }
    }

    async fn finish(&self, summary: &CallSummary) {
        self.fallback.unregister_call(summary.call_id).await;
        if let Some(stopped) = &summary.screen_share {
            self.emit_share_stopped(summary.call_id, stopped);
        }
        self.emit(CallEvent::CallEnded {
            call_id: summary.call_id,
            duration_secs: summary.duration_secs,
            reason: summary.reason.clone(),
            at: summary.ended_at,
        });
    }

    pub async fn snapshot(&self, call_id: CallId) -> CallResult<CallSnapshot> {
        self.registry.snapshot(call_id).await
    }

    // ========================================================================
    // Signaling and peer toggles
    // ========================================================================

    pub async fn signal(&self, call_id: CallId, user_id: UserId, signal: Signal) -> CallResult<usize> {
        self.registry.signal(call_id, user_id, signal).await
    }

    pub async fn signal_raw(
        &self,
        call_id: CallId,
        user_id: UserId,
        signal_type: &str,
        payload: serde_json::Value,
    ) -> CallResult<usize> {
        self.registry.signal_raw(call_id, user_id, signal_type, payload).await
    }

    pub async fn toggle_mute(&self, call_id: CallId, user_id: UserId) -> CallResult<PeerConnectionState> {
        self.registry.toggle_mute(call_id, user_id).await
    }

    pub async fn toggle_video(&self, call_id: CallId, user_id: UserId) -> CallResult<PeerConnectionState> {
        self.registry.toggle_video(call_id, user_id).await
    }

    // ========================================================================
    // Quality control
    // ========================================================================

    /// Apply one network sample to the call's rung.
    pub async fn evaluate(
        &self,
        call_id: CallId,
        sample: &NetworkSample,
        client: &ClientProfile,
    ) -> CallResult<Evaluation> {
        self.registry.touch(call_id).await?;
        let evaluation = self.fallback.evaluate_for_client(call_id, sample, client).await?;
        if let Some(t) = &evaluation.transition {
            self.emit_rung_changed(call_id, t);
        }
        Ok(evaluation)
    }

    pub async fn request_rung(&self, call_id: CallId, rung: FallbackRung) -> CallResult<Option<Transition>> {
        self.registry.touch(call_id).await?;
        let transition = self.fallback.request_rung(call_id, rung).await?;
        if let Some(t) = &transition {
            self.emit_rung_changed(call_id, t);
        }
        Ok(transition)
    }

    pub async fn fallback_state(&self, call_id: CallId) -> CallResult<CallFallbackState> {
        self.fallback.get_state(call_id).await
    }

    pub async fn quality_trend(&self, call_id: CallId) -> CallResult<QualityTrend> {
        self.fallback.quality_trend(call_id).await
    }

    pub async fn recommendations(&self, call_id: CallId) -> CallResult<Vec<Recommendation>> {
        self.fallback.recommendations(call_id).await
    }

    fn emit_rung_changed(&self, call_id: CallId, t: &Transition) {
        self.emit(CallEvent::RungChanged {
            call_id,
            from: t.from.label().to_string(),
            to: t.to.label().to_string(),
            reason: t.reason.label().to_string(),
            at: t.at,
        });
    }

    // ========================================================================
    // Screen share
    // ========================================================================

    pub async fn start_screen_share(
        &self,
        call_id: CallId,
        user_id: UserId,
        name: &str,
        quality: &str,
        with_audio: bool,
    ) -> CallResult<ScreenShareState> {
        let share = self
            .registry
            .start_screen_share(call_id, user_id, name, quality, with_audio)
            .await?;
        self.emit(CallEvent::ScreenShareStarted {
            call_id,
            sharer_id: user_id,
            quality: share.quality.as_str().to_string(),
            with_audio,
            at: share.started_at,
        });
        Ok(share)
    }

    pub async fn stop_screen_share(&self, call_id: CallId, user_id: UserId) -> CallResult<ScreenShareEnded> {
        let stopped = self.registry.stop_screen_share(call_id, user_id).await?;
        self.emit_share_stopped(call_id, &stopped);
        Ok(stopped)
    }

    pub async fn change_screen_share_quality(
        &self,
        call_id: CallId,
        user_id: UserId,
        quality: &str,
    ) -> CallResult<ScreenShareState> {
        let (from, to) = self
            .registry
            .change_screen_share_quality(call_id, user_id, quality)
            .await?;
        if from != to {
            self.emit(CallEvent::ScreenShareQualityChanged {
                call_id,
                sharer_id: user_id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                at: Utc::now(),
            });
        }
        self.registry
            .screen_share_status(call_id)
            .await?
            .ok_or(CallError::NotScreenSharer)
    }

    pub async fn screen_share_status(&self, call_id: CallId) -> CallResult<Option<ScreenShareState>> {
        self.registry.screen_share_status(call_id).await
    }

    /// Recommend a quality for the live share from the sharer's upload speed
    /// and CPU load. Returns `(current, recommended)`; nothing is changed.
    pub async fn recommend_screen_share(
        &self,
        call_id: CallId,
        user_id: UserId,
        speed_kbps: f64,
        cpu_pct: f64,
    ) -> CallResult<(ScreenShareQuality, ScreenShareQuality)> {
        let share = self
            .registry
            .screen_share_status(call_id)
            .await?
            .filter(|s| s.sharer_id == user_id)
            .ok_or(CallError::NotScreenSharer)?;
        let recommended = screen_share::check_adjustment(share.quality, speed_kbps, cpu_pct)
            .unwrap_or(share.quality);
        Ok((share.quality, recommended))
    }

    fn emit_share_stopped(&self, call_id: CallId, stopped: &ScreenShareEnded) {
        self.emit(CallEvent::ScreenShareStopped {
            call_id,
            sharer_id: stopped.sharer_id,
            duration_secs: stopped.duration_secs,
            at: Utc::now(),
        });
    }

    /// Get stats about active calls.
    pub async fn stats(&self) -> CallStats {
        CallStats {
            calls: self.registry.stats().await,
            fallback: self.fallback.statistics().await,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CallStats {
    pub calls: RegistryStats,
    pub fallback: FallbackStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidecall_common::config::FallbackConfig;
    use tidecall_common::config::QualityConfig;
    use uuid::Uuid;

    fn server() -> CallServer {
        let fallback = FallbackController::new(
            QualityScorer::new(QualityConfig::default()),
            CodecCatalog::builtin(),
            FallbackConfig::default(),
        );
        CallServer::new(CallSessionRegistry::new(), fallback, Vec::new(), 8)
    }

    #[tokio::test]
    async fn create_call_pairs_both_states() {
        let server = server();
        let call = server
            .create_call(Uuid::now_v7(), Uuid::now_v7(), CallType::Video)
            .await
            .unwrap();
        assert!(server.registry().contains(call.call_id).await);
        assert!(server.fallback().is_registered(call.call_id).await);

        server.end_call(call.call_id, "hangup").await.unwrap();
        assert!(!server.registry().contains(call.call_id).await);
        assert!(!server.fallback().is_registered(call.call_id).await);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let server = server();
        let mut events = server.subscribe();
        let (caller, callee) = (Uuid::now_v7(), Uuid::now_v7());

        let call = server.create_call(caller, callee, CallType::Audio).await.unwrap();
        server.answer_call(call.call_id, callee).await.unwrap();
        server.end_call(call.call_id, "hangup").await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), CallEvent::CallStarted { call_type, .. } if call_type == "audio"));
        assert!(matches!(events.recv().await.unwrap(), CallEvent::CallAnswered { user_id, .. } if user_id == callee));
        match events.recv().await.unwrap() {
            CallEvent::CallEnded { call_id, reason, .. } => {
                assert_eq!(call_id, call.call_id);
                assert_eq!(reason, "hangup");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ending_twice_reports_not_found() {
        let server = server();
        let call = server
            .create_call(Uuid::now_v7(), Uuid::now_v7(), CallType::Video)
            .await
            .unwrap();
        server.end_call(call.call_id, "hangup").await.unwrap();
        assert_eq!(
            server.end_call(call.call_id, "hangup").await.unwrap_err(),
            CallError::CallNotFound(call.call_id)
        );
    }

    #[tokio::test]
    async fn screen_share_recommendation_only_for_the_sharer() {
        let server = server();
        let (caller, callee) = (Uuid::now_v7(), Uuid::now_v7());
        let call = server.create_call(caller, callee, CallType::Video).await.unwrap();
        server.join_call(call.call_id, caller, None).await.unwrap();
        server.join_call(call.call_id, callee, None).await.unwrap();
        server
            .start_screen_share(call.call_id, caller, "Desk", "high", false)
            .await
            .unwrap();

        let (current, recommended) = server
            .recommend_screen_share(call.call_id, caller, 600.0, 30.0)
            .await
            .unwrap();
        assert_eq!(current, ScreenShareQuality::High);
        assert_eq!(recommended, ScreenShareQuality::Low);

        assert_eq!(
            server
                .recommend_screen_share(call.call_id, callee, 600.0, 30.0)
                .await
                .unwrap_err(),
            CallError::NotScreenSharer
        );
    }
}
