//! Call session registry: who is in which call, and what they are doing.
//!
//! Two lock levels:
//! - the registry map (`calls`), held only to look up, insert or remove a
//!   session, and to maintain the caller/callee busy index;
//! - one mutex per [`CallSession`], held for membership, toggles,
//!   screen-share arbitration and negotiation bookkeeping.
//!
//! Locks are always taken map first, then session, and never across a send to
//! a participant's outbound channel. `end_call` removes the session from the
//! map before marking it ended, so anything that looks the call up afterwards
//! gets `CallNotFound`, and anything that already held the `Arc` sees
//! `Ended` once it gets the session lock.

use crate::peer::{self, PeerLink};
use crate::screen_share::ScreenShareQuality;
use crate::signaling::{ConnectionKind, ServerMessage, Signal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tidecall_common::error::{CallError, CallResult};
use tidecall_common::snowflake::{generate_id, CallId, UserId};
use tokio::sync::{mpsc, Mutex, RwLock};

/// Outbound channel to one connected participant.
pub type PeerTx = mpsc::Sender<ServerMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    #[default]
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        })
    }
}

/// Public view of one participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerConnectionState {
    pub user_id: UserId,
    pub muted: bool,
    pub video_disabled: bool,
    pub is_screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenShareState {
    pub sharer_id: UserId,
    pub sharer_name: String,
    pub quality: ScreenShareQuality,
    pub with_audio: bool,
    pub started_at: DateTime<Utc>,
}

/// What `stop_screen_share` (or a departure/teardown) ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenShareEnded {
    pub sharer_id: UserId,
    pub duration_secs: i64,
}

struct Participant {
    state: PeerConnectionState,
    primary: PeerLink,
    screen_share: Option<PeerLink>,
    tx: Option<PeerTx>,
}

impl Participant {
    fn new(user_id: UserId, tx: Option<PeerTx>) -> Self {
        Self {
            state: PeerConnectionState {
                user_id,
                muted: false,
                video_disabled: false,
                is_screen_sharing: false,
                joined_at: Utc::now(),
            },
            primary: PeerLink::new(ConnectionKind::Primary),
            screen_share: None,
            tx,
        }
    }

    /// Close every link this participant holds.
    fn close(&mut self) -> usize {
        let mut closed = 0;
        if !self.primary.is_closed() {
            self.primary.close();
            closed += 1;
        }
        if let Some(link) = self.screen_share.as_mut() {
            if !link.is_closed() {
                link.close();
                closed += 1;
            }
        }
        closed
    }
}

/// One call's mutable state. Only reachable through its session mutex.
pub struct CallSession {
    call_id: CallId,
    caller_id: UserId,
    callee_id: UserId,
    call_type: CallType,
    status: CallStatus,
    participants: HashMap<UserId, Participant>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    screen_share: Option<ScreenShareState>,
    last_activity: DateTime<Utc>,
}

impl CallSession {
    fn new(caller_id: UserId, callee_id: UserId, call_type: CallType) -> Self {
        let now = Utc::now();
        Self {
            call_id: generate_id(),
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Ringing,
            participants: HashMap::new(),
            started_at: now,
            ended_at: None,
            screen_share: None,
            last_activity: now,
        }
    }

    /// Fail with `CallNotFound` once the call has ended.
    fn live(&mut self) -> CallResult<&mut Self> {
        if self.status == CallStatus::Ended {
            return Err(CallError::CallNotFound(self.call_id));
        }
        self.last_activity = Utc::now();
        Ok(self)
    }

    fn participant(&mut self, user_id: UserId) -> CallResult<&mut Participant> {
        let call_id = self.call_id;
        self.participants
            .get_mut(&user_id)
            .ok_or(CallError::UserNotInCall { call_id, user_id })
    }

    /// Clear the active share and close every screen-share link.
    fn clear_screen_share(&mut self) -> Option<ScreenShareEnded> {
        let share = self.screen_share.take()?;
        for p in self.participants.values_mut() {
            p.state.is_screen_sharing = false;
            if let Some(link) = p.screen_share.as_mut() {
                link.close();
            }
            p.screen_share = None;
        }
        Some(ScreenShareEnded {
            sharer_id: share.sharer_id,
            duration_secs: (Utc::now() - share.started_at).num_seconds(),
        })
    }

    /// Outbound channels of everyone except `except`.
    fn others(&self, except: Option<UserId>) -> Vec<PeerTx> {
        self.participants
            .values()
            .filter(|p| Some(p.state.user_id) != except)
            .filter_map(|p| p.tx.clone())
            .collect()
    }

    fn snapshot(&self) -> CallSnapshot {
        let mut participants: Vec<_> = self.participants.values().map(|p| p.state.clone()).collect();
        participants.sort_by_key(|p| p.joined_at);
        CallSnapshot {
            call_id: self.call_id,
            caller_id: self.caller_id,
            callee_id: self.callee_id,
            call_type: self.call_type,
            status: self.status,
            participants,
            started_at: self.started_at,
            ended_at: self.ended_at,
            screen_share: self.screen_share.clone(),
            last_activity: self.last_activity,
        }
    }

    fn debug_check(&self) {
        debug_assert!(self.screen_share.as_ref().is_none_or(|s| self
            .participants
            .get(&s.sharer_id)
            .is_some_and(|p| p.state.is_screen_sharing)));
    }
}

/// Read-only copy of a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub participants: Vec<PeerConnectionState>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub screen_share: Option<ScreenShareState>,
    pub last_activity: DateTime<Utc>,
}

/// Returned by `end_call`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub duration_secs: i64,
    pub reason: String,
    pub ended_at: DateTime<Utc>,
    pub connections_closed: usize,
    pub screen_share: Option<ScreenShareEnded>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_calls: usize,
    pub ringing: usize,
    pub connecting: usize,
    pub connected: usize,
    pub participants: usize,
    pub screen_shares: usize,
}

#[derive(Default)]
struct Calls {
    sessions: HashMap<CallId, Arc<Mutex<CallSession>>>,
    /// Caller and callee of every live call.
    busy: HashMap<UserId, CallId>,
}

/// Owns every active [`CallSession`].
#[derive(Clone, Default)]
pub struct CallSessionRegistry {
    calls: Arc<RwLock<Calls>>,
}

impl CallSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&self, call_id: CallId) -> CallResult<Arc<Mutex<CallSession>>> {
        self.calls
            .read()
            .await
            .sessions
            .get(&call_id)
            .cloned()
            .ok_or(CallError::CallNotFound(call_id))
    }

    /// Create a ringing call between two users.
    pub async fn create_call(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
    ) -> CallResult<CallSnapshot> {
        let session = CallSession::new(caller_id, callee_id, call_type);
        let call_id = session.call_id;
        let snapshot = session.snapshot();

        {
            let mut calls = self.calls.write().await;
            for user in [caller_id, callee_id] {
                if calls.busy.contains_key(&user) {
                    return Err(CallError::UserBusy(user));
                }
            }
            calls.busy.insert(caller_id, call_id);
            calls.busy.insert(callee_id, call_id);
            calls.sessions.insert(call_id, Arc::new(Mutex::new(session)));
        }

        tracing::info!(
            call = %call_id,
            caller = %caller_id,
            callee = %callee_id,
            call_type = call_type.as_str(),
            "Call created"
        );
        Ok(snapshot)
    }

    /// Add or re-activate a participant and mark the call connected.
    pub async fn join_call(
        &self,
        call_id: CallId,
        user_id: UserId,
        tx: Option<PeerTx>,
    ) -> CallResult<CallSnapshot> {
        let entry = self.session(call_id).await?;
        let (snapshot, notify, rejoined) = {
            let mut guard = entry.lock().await;
            let session = guard.live()?;
            let rejoined = match session.participants.get_mut(&user_id) {
                Some(existing) => {
                    existing.tx = tx;
                    if existing.primary.is_closed() {
                        existing.primary = PeerLink::new(ConnectionKind::Primary);
                    }
                    true
                }
                None => {
                    session.participants.insert(user_id, Participant::new(user_id, tx));
                    false
                }
            };
            session.status = CallStatus::Connected;
            (session.snapshot(), session.others(Some(user_id)), rejoined)
        };

        tracing::info!(call = %call_id, user = %user_id, rejoined, "User joined call");
        broadcast(&notify, ServerMessage::ParticipantJoined { call_id, user_id });
        Ok(snapshot)
    }

    /// Callee accepts a ringing call.
    pub async fn answer_call(&self, call_id: CallId, user_id: UserId) -> CallResult<CallSnapshot> {
        let entry = self.session(call_id).await?;
        let (snapshot, notify) = {
            let mut guard = entry.lock().await;
            let session = guard.live()?;
            if session.callee_id != user_id {
                return Err(CallError::UserNotInCall { call_id, user_id });
            }
            if session.status != CallStatus::Ringing {
                return Err(CallError::InvalidCallState {
                    status: session.status.to_string(),
                    action: "answer".into(),
                });
            }
            session.status = CallStatus::Connecting;
            (session.snapshot(), session.others(Some(user_id)))
        };

        tracing::info!(call = %call_id, user = %user_id, "Call answered");
        broadcast(&notify, ServerMessage::CallAnswered { call_id, user_id });
        Ok(snapshot)
    }

    /// Callee declines a ringing call, which ends it.
    pub async fn reject_call(&self, call_id: CallId, user_id: UserId) -> CallResult<CallSummary> {
        {
            let entry = self.session(call_id).await?;
            let mut guard = entry.lock().await;
            let session = guard.live()?;
            if session.callee_id != user_id {
                return Err(CallError::UserNotInCall { call_id, user_id });
            }
            if session.status != CallStatus::Ringing {
                return Err(CallError::InvalidCallState {
                    status: session.status.to_string(),
                    action: "reject".into(),
                });
            }
        }
        self.end_call(call_id, "rejected").await
    }

    /// Remove a participant. Stops their screen share if they were sharing.
    pub async fn leave_call(&self, call_id: CallId, user_id: UserId) -> CallResult<Option<ScreenShareEnded>> {
        let entry = self.session(call_id).await?;
        let (stopped, notify) = {
            let mut guard = entry.lock().await;
            let session = guard.live()?;
            if !session.participants.contains_key(&user_id) {
                return Err(CallError::UserNotInCall { call_id, user_id });
            }
            let sharing = session
                .screen_share
                .as_ref()
                .is_some_and(|s| s.sharer_id == user_id);
            let stopped = if sharing { session.clear_screen_share() } else { None };
            if let Some(mut participant) = session.participants.remove(&user_id) {
                participant.close();
            }
            session.debug_check();
            (stopped, session.others(None))
        };

        tracing::info!(call = %call_id, user = %user_id, "User left call");
        broadcast(&notify, ServerMessage::ParticipantLeft { call_id, user_id });
        Ok(stopped)
    }

    /// Decode and route a raw client signal.
    pub async fn signal_raw(
        &self,
        call_id: CallId,
        user_id: UserId,
        signal_type: &str,
        payload: serde_json::Value,
    ) -> CallResult<usize> {
        let signal = Signal::decode(signal_type, payload)?;
        self.signal(call_id, user_id, signal).await
    }

    /// Route a signal to the sender's primary or screen-share link and relay it
    /// to every other participant. Returns how many peers it was queued for.
    pub async fn signal(&self, call_id: CallId, user_id: UserId, signal: Signal) -> CallResult<usize> {
        let entry = self.session(call_id).await?;
        let recipients = {
            let mut guard = entry.lock().await;
            let session = guard.live()?;
            let share_live = session.screen_share.is_some();
            let participant = session.participant(user_id)?;

            let link = match signal.connection() {
                ConnectionKind::Primary => &mut participant.primary,
                ConnectionKind::ScreenShare if share_live => participant
                    .screen_share
                    .get_or_insert_with(|| PeerLink::new(ConnectionKind::ScreenShare)),
                ConnectionKind::ScreenShare => {
                    return Err(CallError::PeerSetupFailure("no screen share in progress".into()));
                }
            };
            // Syntax is checked before state so a bad payload never advances the link.
            if let Err(e) = peer::validate(&signal) {
                tracing::warn!(call = %call_id, user = %user_id, error = %e, "Rejected signal");
                return Err(e);
            }
            link.apply(&signal)?;

            let kind = signal.connection();
            for other in session.participants.values_mut() {
                if other.state.user_id == user_id {
                    continue;
                }
                let remote = match kind {
                    ConnectionKind::Primary => Some(&mut other.primary),
                    ConnectionKind::ScreenShare => other.screen_share.as_mut(),
                };
                if let Some(remote) = remote {
                    remote.observe_remote(&signal);
                }
            }
            session.others(Some(user_id))
        };

        let relayed = broadcast(
            &recipients,
            ServerMessage::Signal {
                call_id,
                from_user_id: user_id,
                signal: signal.clone(),
            },
        );
        tracing::debug!(
            call = %call_id,
            user = %user_id,
            signal = %signal.signal_type(),
            relayed,
            "Signal routed"
        );
        Ok(relayed)
    }

    pub async fn toggle_mute(&self, call_id: CallId, user_id: UserId) -> CallResult<PeerConnectionState> {
        self.update_peer(call_id, user_id, |s| s.muted = !s.muted).await
    }

    pub async fn toggle_video(&self, call_id: CallId, user_id: UserId) -> CallResult<PeerConnectionState> {
        self.update_peer(call_id, user_id, |s| s.video_disabled = !s.video_disabled)
            .await
    }

    async fn update_peer(
        &self,
        call_id: CallId,
        user_id: UserId,
        update: impl FnOnce(&mut PeerConnectionState),
    ) -> CallResult<PeerConnectionState> {
        let entry = self.session(call_id).await?;
        let mut guard = entry.lock().await;
        let participant = guard.live()?.participant(user_id)?;
        update(&mut participant.state);
        Ok(participant.state.clone())
    }

    /// Install `user_id` as the call's only screen sharer.
    ///
    /// The conflict check and the install happen under one hold of the
    /// session lock, so of two concurrent starts exactly one wins.
    pub async fn start_screen_share(
        &self,
        call_id: CallId,
        user_id: UserId,
        name: &str,
        quality: &str,
        with_audio: bool,
    ) -> CallResult<ScreenShareState> {
        let quality: ScreenShareQuality = quality.parse()?;
        let entry = self.session(call_id).await?;
        let mut guard = entry.lock().await;
        let session = guard.live()?;

        if let Some(active) = session.screen_share.as_ref() {
            tracing::warn!(
                call = %call_id,
                user = %user_id,
                sharer = %active.sharer_id,
                "Screen share already active"
            );
            return Err(CallError::ScreenShareConflict {
                sharer_id: active.sharer_id,
            });
        }

        let participant = session.participant(user_id)?;
        participant.state.is_screen_sharing = true;
        participant.screen_share = Some(PeerLink::new(ConnectionKind::ScreenShare));

        let share = ScreenShareState {
            sharer_id: user_id,
            sharer_name: name.to_string(),
            quality,
            with_audio,
            started_at: Utc::now(),
        };
        session.screen_share = Some(share.clone());
        session.debug_check();

        tracing::info!(
            call = %call_id,
            user = %user_id,
            quality = %quality,
            with_audio,
            "Screen share started"
        );
        Ok(share)
    }

    pub async fn stop_screen_share(&self, call_id: CallId, user_id: UserId) -> CallResult<ScreenShareEnded> {
        let entry = self.session(call_id).await?;
        let mut guard = entry.lock().await;
        let session = guard.live()?;
        match session.screen_share.as_ref() {
            Some(share) if share.sharer_id == user_id => {}
            _ => return Err(CallError::NotScreenSharer),
        }
        let ended = session
            .clear_screen_share()
            .ok_or(CallError::NotScreenSharer)?;
        session.debug_check();

        tracing::info!(
            call = %call_id,
            user = %user_id,
            duration_secs = ended.duration_secs,
            "Screen share stopped"
        );
        Ok(ended)
    }

    /// Change the live share's quality. Returns `(from, to)`.
    pub async fn change_screen_share_quality(
        &self,
        call_id: CallId,
        user_id: UserId,
        quality: &str,
    ) -> CallResult<(ScreenShareQuality, ScreenShareQuality)> {
        let quality: ScreenShareQuality = quality.parse()?;
        let entry = self.session(call_id).await?;
        let mut guard = entry.lock().await;
        let share = guard
            .live()?
            .screen_share
            .as_mut()
            .filter(|s| s.sharer_id == user_id)
            .ok_or(CallError::NotScreenSharer)?;
        let from = std::mem::replace(&mut share.quality, quality);

        tracing::info!(call = %call_id, user = %user_id, from = %from, to = %quality, "Screen share quality changed");
        Ok((from, quality))
    }

    /// Tear the call down: close every connection, evict the session, and
    /// report its duration. `CallNotFound` if it already ended.
    pub async fn end_call(&self, call_id: CallId, reason: &str) -> CallResult<CallSummary> {
        let entry = {
            let mut calls = self.calls.write().await;
            let entry = calls
                .sessions
                .remove(&call_id)
                .ok_or(CallError::CallNotFound(call_id))?;
            calls.busy.retain(|_, c| *c != call_id);
            entry
        };

        let (summary, notify) = {
            let mut session = entry.lock().await;
            if session.status == CallStatus::Ended {
                return Err(CallError::CallNotFound(call_id));
            }
            let screen_share = session.clear_screen_share();
            let connections_closed = session.participants.values_mut().map(Participant::close).sum();
            let ended_at = Utc::now();
            session.status = CallStatus::Ended;
            session.ended_at = Some(ended_at);

            let summary = CallSummary {
                call_id,
                caller_id: session.caller_id,
                callee_id: session.callee_id,
                duration_secs: (ended_at - session.started_at).num_seconds(),
                reason: reason.to_string(),
                ended_at,
                connections_closed,
                screen_share,
            };
            (summary, session.others(None))
        };

        tracing::info!(
            call = %call_id,
            duration_secs = summary.duration_secs,
            reason,
            connections = summary.connections_closed,
            "Call ended"
        );
        broadcast(
            &notify,
            ServerMessage::CallEnded {
                call_id,
                duration_secs: summary.duration_secs,
                reason: summary.reason.clone(),
            },
        );
        Ok(summary)
    }

    pub async fn snapshot(&self, call_id: CallId) -> CallResult<CallSnapshot> {
        let entry = self.session(call_id).await?;
        let session = entry.lock().await;
        if session.status == CallStatus::Ended {
            return Err(CallError::CallNotFound(call_id));
        }
        Ok(session.snapshot())
    }

    pub async fn screen_share_status(&self, call_id: CallId) -> CallResult<Option<ScreenShareState>> {
        Ok(self.snapshot(call_id).await?.screen_share)
    }

    /// Record activity on a call without changing it.
    pub async fn touch(&self, call_id: CallId) -> CallResult<()> {
        let entry = self.session(call_id).await?;
        let mut session = entry.lock().await;
        session.live()?;
        Ok(())
    }

    /// Calls with no activity since `cutoff`.
    pub async fn idle_calls(&self, cutoff: DateTime<Utc>) -> Vec<CallId> {
        let entries: Vec<_> = self.calls.read().await.sessions.values().cloned().collect();
        let mut idle = Vec::new();
        for entry in entries {
            let session = entry.lock().await;
            if session.status != CallStatus::Ended && session.last_activity < cutoff {
                idle.push(session.call_id);
            }
        }
        idle
    }

    pub async fn contains(&self, call_id: CallId) -> bool {
        self.calls.read().await.sessions.contains_key(&call_id)
    }

    pub async fn stats(&self) -> RegistryStats {
        let entries: Vec<_> = self.calls.read().await.sessions.values().cloned().collect();
        let mut stats = RegistryStats::default();
        for entry in entries {
            let session = entry.lock().await;
            match session.status {
                CallStatus::Ringing => stats.ringing += 1,
                CallStatus::Connecting => stats.connecting += 1,
                CallStatus::Connected => stats.connected += 1,
                CallStatus::Ended => continue,
            }
            stats.active_calls += 1;
            stats.participants += session.participants.len();
            stats.screen_shares += usize::from(session.screen_share.is_some());
        }
        stats
    }
}

/// Queue `msg` for every channel without waiting. Full or closed channels
/// are skipped. Returns how many accepted it.
fn broadcast(targets: &[PeerTx], msg: ServerMessage) -> usize {
    targets
        .iter()
        .filter(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Dropped outbound message");
                false
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{fixtures, NegotiationState};

    async fn connected_call(registry: &CallSessionRegistry) -> (CallId, UserId, UserId) {
        let (a, b) = (generate_id(), generate_id());
        let call = registry.create_call(a, b, CallType::Video).await.unwrap();
        registry.join_call(call.call_id, a, None).await.unwrap();
        registry.join_call(call.call_id, b, None).await.unwrap();
        (call.call_id, a, b)
    }

    #[tokio::test]
    async fn create_then_join() {
        let registry = CallSessionRegistry::new();
        let (a, b) = (generate_id(), generate_id());
        let call = registry.create_call(a, b, CallType::Audio).await.unwrap();
        assert_eq!(call.status, CallStatus::Ringing);

        let joined = registry.join_call(call.call_id, a, None).await.unwrap();
        assert_eq!(joined.status, CallStatus::Connected);
        assert_eq!(joined.participants.len(), 1);

        let missing = generate_id();
        assert_eq!(
            registry.join_call(missing, a, None).await.unwrap_err(),
            CallError::CallNotFound(missing)
        );
    }

    #[tokio::test]
    async fn busy_users_cannot_start_another_call() {
        let registry = CallSessionRegistry::new();
        let (a, b, c) = (generate_id(), generate_id(), generate_id());
        let call = registry.create_call(a, b, CallType::Video).await.unwrap();
        assert_eq!(
            registry.create_call(c, b, CallType::Video).await.unwrap_err(),
            CallError::UserBusy(b)
        );
        registry.end_call(call.call_id, "hangup").await.unwrap();
        assert!(registry.create_call(c, b, CallType::Video).await.is_ok());
    }

    #[tokio::test]
    async fn answer_and_reject_are_callee_only() {
        let registry = CallSessionRegistry::new();
        let (a, b) = (generate_id(), generate_id());
        let call = registry.create_call(a, b, CallType::Video).await.unwrap();

        assert!(matches!(
            registry.answer_call(call.call_id, a).await,
            Err(CallError::UserNotInCall { .. })
        ));
        let answered = registry.answer_call(call.call_id, b).await.unwrap();
        assert_eq!(answered.status, CallStatus::Connecting);
        assert!(matches!(
            registry.reject_call(call.call_id, b).await,
            Err(CallError::InvalidCallState { .. })
        ));

        let other = registry.create_call(generate_id(), generate_id(), CallType::Audio).await.unwrap();
        let summary = registry.reject_call(other.call_id, other.callee_id).await.unwrap();
        assert_eq!(summary.reason, "rejected");
        assert!(!registry.contains(other.call_id).await);
    }

    #[tokio::test]
    async fn toggles_flip_flags() {
        let registry = CallSessionRegistry::new();
        let (call, a, _) = connected_call(&registry).await;

        assert!(registry.toggle_mute(call, a).await.unwrap().muted);
        assert!(!registry.toggle_mute(call, a).await.unwrap().muted);
        assert!(registry.toggle_video(call, a).await.unwrap().video_disabled);

        let stranger = generate_id();
        assert_eq!(
            registry.toggle_mute(call, stranger).await.unwrap_err(),
            CallError::UserNotInCall { call_id: call, user_id: stranger }
        );
    }

    #[tokio::test]
    async fn screen_share_is_exclusive() {
        let registry = CallSessionRegistry::new();
        let (call, a, b) = connected_call(&registry).await;

        let share = registry.start_screen_share(call, a, "Ada", "high", true).await.unwrap();
        assert_eq!(share.quality, ScreenShareQuality::High);
        assert_eq!(
            registry.start_screen_share(call, b, "Bo", "low", false).await.unwrap_err(),
            CallError::ScreenShareConflict { sharer_id: a }
        );

        let snap = registry.snapshot(call).await.unwrap();
        let sharer = snap.participants.iter().find(|p| p.user_id == a).unwrap();
        assert!(sharer.is_screen_sharing);

        assert_eq!(
            registry.stop_screen_share(call, b).await.unwrap_err(),
            CallError::NotScreenSharer
        );
        registry.stop_screen_share(call, a).await.unwrap();
        assert!(registry.screen_share_status(call).await.unwrap().is_none());
        assert!(registry.start_screen_share(call, b, "Bo", "low", false).await.is_ok());
    }

    #[tokio::test]
    async fn screen_share_quality_changes() {
        let registry = CallSessionRegistry::new();
        let (call, a, b) = connected_call(&registry).await;
        assert!(matches!(
            registry.start_screen_share(call, a, "Ada", "4k", false).await,
            Err(CallError::InvalidScreenShareQuality(_))
        ));
        registry.start_screen_share(call, a, "Ada", "medium", false).await.unwrap();

        assert!(matches!(
            registry.change_screen_share_quality(call, a, "ultra").await,
            Err(CallError::InvalidScreenShareQuality(_))
        ));
        assert_eq!(
            registry.change_screen_share_quality(call, b, "low").await.unwrap_err(),
            CallError::NotScreenSharer
        );
        let (from, to) = registry.change_screen_share_quality(call, a, "low").await.unwrap();
        assert_eq!((from, to), (ScreenShareQuality::Medium, ScreenShareQuality::Low));
    }

    #[tokio::test]
    async fn leaving_sharer_clears_the_share() {
        let registry = CallSessionRegistry::new();
        let (call, a, _) = connected_call(&registry).await;
        registry.start_screen_share(call, a, "Ada", "high", false).await.unwrap();

        let stopped = registry.leave_call(call, a).await.unwrap();
        assert_eq!(stopped.map(|s| s.sharer_id), Some(a));
        let snap = registry.snapshot(call).await.unwrap();
        assert!(snap.screen_share.is_none());
        assert_eq!(snap.participants.len(), 1);
    }

    #[tokio::test]
    async fn signals_are_relayed_to_other_participants() {
        let registry = CallSessionRegistry::new();
        let (a, b) = (generate_id(), generate_id());
        let call = registry.create_call(a, b, CallType::Video).await.unwrap().call_id;
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.join_call(call, a, Some(tx_a)).await.unwrap();
        registry.join_call(call, b, Some(tx_b)).await.unwrap();

        // a hears about b joining
        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::ParticipantJoined { .. })));

        let relayed = registry.signal(call, a, fixtures::offer()).await.unwrap();
        assert_eq!(relayed, 1);
        match rx_b.try_recv() {
            Ok(ServerMessage::Signal { from_user_id, signal, .. }) => {
                assert_eq!(from_user_id, a);
                assert_eq!(signal, fixtures::offer());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn signal_errors() {
        let registry = CallSessionRegistry::new();
        let (call, a, _) = connected_call(&registry).await;

        assert!(matches!(
            registry.signal_raw(call, a, "bogus", serde_json::json!({})).await,
            Err(CallError::InvalidSignalType(_))
        ));
        let stranger = generate_id();
        assert!(matches!(
            registry.signal(call, stranger, fixtures::offer()).await,
            Err(CallError::UserNotInCall { .. })
        ));
        // candidate before any description
        assert!(matches!(
            registry.signal(call, a, fixtures::candidate()).await,
            Err(CallError::PeerSetupFailure(_))
        ));
        // the failure leaves the call usable
        assert!(registry.signal(call, a, fixtures::offer()).await.is_ok());
        assert!(registry.signal(call, a, fixtures::candidate()).await.is_ok());
    }

    #[tokio::test]
    async fn either_side_can_renegotiate() {
        let registry = CallSessionRegistry::new();
        let (call, a, b) = connected_call(&registry).await;

        registry.signal(call, a, fixtures::offer()).await.unwrap();
        registry.signal(call, b, fixtures::answer()).await.unwrap();
        registry.signal(call, b, fixtures::offer()).await.unwrap();
        registry.signal(call, a, fixtures::answer()).await.unwrap();

        let entry = registry.session(call).await.unwrap();
        let mut session = entry.lock().await;
        for user in [a, b] {
            let link = &session.participant(user).unwrap().primary;
            assert_eq!(link.state, NegotiationState::Stable);
            assert_eq!(link.offers, 1);
        }
    }

    #[tokio::test]
    async fn screen_share_signals_need_an_active_share() {
        let registry = CallSessionRegistry::new();
        let (call, a, b) = connected_call(&registry).await;
        let Signal::Offer(desc) = fixtures::offer() else {
            unreachable!()
        };
        let share_offer = Signal::ScreenShareOffer(desc);

        assert!(matches!(
            registry.signal(call, a, share_offer.clone()).await,
            Err(CallError::PeerSetupFailure(_))
        ));
        registry.start_screen_share(call, a, "Ada", "high", false).await.unwrap();
        assert!(registry.signal(call, a, share_offer).await.is_ok());

        let Signal::Answer(desc) = fixtures::answer() else {
            unreachable!()
        };
        assert!(registry.signal(call, b, Signal::ScreenShareAnswer(desc)).await.is_ok());
    }

    #[tokio::test]
    async fn end_call_evicts_and_reports() {
        let registry = CallSessionRegistry::new();
        let (call, a, b) = connected_call(&registry).await;
        registry.start_screen_share(call, b, "Bo", "low", true).await.unwrap();

        let summary = registry.end_call(call, "hangup").await.unwrap();
        assert_eq!(summary.connections_closed, 2);
        assert_eq!(summary.screen_share.map(|s| s.sharer_id), Some(b));
        assert!(summary.duration_secs >= 0);

        assert_eq!(registry.end_call(call, "hangup").await.unwrap_err(), CallError::CallNotFound(call));
        assert_eq!(registry.toggle_mute(call, a).await.unwrap_err(), CallError::CallNotFound(call));
        assert_eq!(registry.stats().await, RegistryStats::default());
    }

    #[tokio::test]
    async fn idle_calls_are_reported() {
        let registry = CallSessionRegistry::new();
        let (call, _, _) = connected_call(&registry).await;
        assert!(registry.idle_calls(Utc::now() - chrono::Duration::minutes(5)).await.is_empty());
        assert_eq!(
            registry.idle_calls(Utc::now() + chrono::Duration::seconds(1)).await,
            vec![call]
        );
    }
}
