//! Per-participant connection negotiation state.
//!
//! Media is peer to peer, so the server never terminates a WebRTC session.
//! It does track each participant's side of every negotiation (a primary
//! link, plus a screen-share link while a share is live) so it can reject
//! signals that are malformed or arrive out of order before relaying them.
//!
//! SDP and candidate syntax is checked with `str0m`'s parsers.

use crate::signaling::{ConnectionKind, IceCandidateInit, SessionDescription, Signal};
use chrono::{DateTime, Utc};
use serde::Serialize;
use str0m::change::{SdpAnswer, SdpOffer};
use str0m::Candidate;
use tidecall_common::error::{CallError, CallResult};

/// This participant's side of one offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    New,
    /// The participant sent an offer and waits for the remote answer.
    HaveLocalOffer,
    /// The participant answered; ICE may still be trickling.
    Stable,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerLink {
    pub kind: ConnectionKind,
    pub state: NegotiationState,
    pub offers: u32,
    pub candidates: u32,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PeerLink {
    pub fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            state: NegotiationState::New,
            offers: 0,
            candidates: 0,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Advance negotiation for an already-validated signal.
    ///
    /// A failure resets the link to `New` so the client can start over.
    pub fn apply(&mut self, signal: &Signal) -> CallResult<()> {
        debug_assert_eq!(signal.connection(), self.kind);
        let result = self.transition(signal);
        if result.is_err() && !self.is_closed() {
            self.state = NegotiationState::New;
        }
        result
    }

    fn transition(&mut self, signal: &Signal) -> CallResult<()> {
        use NegotiationState::*;

        match (self.state, signal) {
            (Closed, _) => Err(CallError::PeerSetupFailure(format!(
                "{:?} connection is closed",
                self.kind
            ))),
            (_, Signal::Offer(_) | Signal::ScreenShareOffer(_)) => {
                // A fresh offer on a stable link is a renegotiation.
                self.offers += 1;
                self.state = HaveLocalOffer;
                Ok(())
            }
            (HaveLocalOffer, Signal::Answer(_) | Signal::ScreenShareAnswer(_)) => Err(
                CallError::PeerSetupFailure("answer sent while own offer is pending".into()),
            ),
            (_, Signal::Answer(_) | Signal::ScreenShareAnswer(_)) => {
                self.state = Stable;
                Ok(())
            }
            (New, Signal::IceCandidate(_) | Signal::ScreenShareIceCandidate(_)) => Err(
                CallError::PeerSetupFailure("ICE candidate before any session description".into()),
            ),
            (_, Signal::IceCandidate(_) | Signal::ScreenShareIceCandidate(_)) => {
                self.candidates += 1;
                Ok(())
            }
        }
    }

    /// Track a signal the remote side sent on this link's connection.
    ///
    /// A remote answer settles a pending local offer. A remote offer
    /// supersedes one, so the participant may answer it.
    pub fn observe_remote(&mut self, signal: &Signal) {
        use NegotiationState::*;

        if self.state != HaveLocalOffer {
            return;
        }
        match signal {
            Signal::Answer(_) | Signal::ScreenShareAnswer(_) => self.state = Stable,
            Signal::Offer(_) | Signal::ScreenShareOffer(_) => self.state = New,
            Signal::IceCandidate(_) | Signal::ScreenShareIceCandidate(_) => {}
        }
    }

    pub fn close(&mut self) {
        if !self.is_closed() {
            self.state = NegotiationState::Closed;
            self.closed_at = Some(Utc::now());
        }
    }
}

/// Syntax-check a signal's SDP or candidate.
pub fn validate(signal: &Signal) -> CallResult<()> {
    match signal {
        Signal::Offer(desc) | Signal::ScreenShareOffer(desc) => validate_offer(desc),
        Signal::Answer(desc) | Signal::ScreenShareAnswer(desc) => validate_answer(desc),
        Signal::IceCandidate(c) | Signal::ScreenShareIceCandidate(c) => validate_candidate(c),
    }
}

fn check_kind(desc: &SessionDescription, expected: &str) -> CallResult<()> {
    match desc.kind.as_deref() {
        Some(kind) if kind != expected => Err(CallError::PeerSetupFailure(format!(
            "description type {kind} sent as {expected}"
        ))),
        _ => Ok(()),
    }
}

fn validate_offer(desc: &SessionDescription) -> CallResult<()> {
    check_kind(desc, "offer")?;
    SdpOffer::from_sdp_string(&desc.sdp)
        .map(|_| ())
        .map_err(|e| CallError::PeerSetupFailure(format!("invalid offer SDP: {e}")))
}

fn validate_answer(desc: &SessionDescription) -> CallResult<()> {
    check_kind(desc, "answer")?;
    SdpAnswer::from_sdp_string(&desc.sdp)
        .map(|_| ())
        .map_err(|e| CallError::PeerSetupFailure(format!("invalid answer SDP: {e}")))
}

fn validate_candidate(init: &IceCandidateInit) -> CallResult<()> {
    // End-of-candidates marker.
    if init.candidate.is_empty() {
        return Ok(());
    }
    Candidate::from_sdp_string(&init.candidate)
        .map(|_| ())
        .map_err(|e| CallError::PeerSetupFailure(format!("invalid ICE candidate: {e}")))
}
