//! Call signaling: typed WebRTC signals and the WebSocket wire protocol.
//!
//! A client sends a signal as `(signal_type, payload)`. It is decoded once,
//! here, into [`Signal`]; everything past this module works with the typed
//! union. SDP and ICE contents stay opaque apart from the syntax check in
//! [`crate::peer`].
//!
//! Media never flows over this channel. It carries negotiation, membership
//! and control messages only.

use crate::codec::ClientProfile;
use crate::fallback::{Evaluation, Recommendation, Transition};
use crate::ladder::FallbackRung;
use crate::quality::NetworkSample;
use crate::registry::{CallSnapshot, CallType, PeerConnectionState, ScreenShareState};
use crate::screen_share::{ScreenShareParams, ScreenShareQuality};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tidecall_common::error::{CallError, CallResult, ErrorBody};
use tidecall_common::snowflake::{CallId, UserId};

/// The finite set of signal types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    ScreenShareOffer,
    ScreenShareAnswer,
    ScreenShareIceCandidate,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::ScreenShareOffer => "screen_share_offer",
            Self::ScreenShareAnswer => "screen_share_answer",
            Self::ScreenShareIceCandidate => "screen_share_ice_candidate",
        }
    }

    /// Which of the user's connections the signal belongs to.
    pub fn connection(&self) -> ConnectionKind {
        match self {
            Self::Offer | Self::Answer | Self::IceCandidate => ConnectionKind::Primary,
            Self::ScreenShareOffer | Self::ScreenShareAnswer | Self::ScreenShareIceCandidate => {
                ConnectionKind::ScreenShare
            }
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice_candidate" => Ok(Self::IceCandidate),
            "screen_share_offer" => Ok(Self::ScreenShareOffer),
            "screen_share_answer" => Ok(Self::ScreenShareAnswer),
            "screen_share_ice_candidate" => Ok(Self::ScreenShareIceCandidate),
            other => Err(CallError::InvalidSignalType(other.to_string())),
        }
    }
}

/// A participant's two possible connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Primary,
    ScreenShare,
}

/// WebRTC `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub sdp: String,
}

/// WebRTC `RTCIceCandidateInit`. An empty `candidate` marks end of candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// A decoded signal. Serializes as `{"signal_type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal_type", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidateInit),
    ScreenShareOffer(SessionDescription),
    ScreenShareAnswer(SessionDescription),
    ScreenShareIceCandidate(IceCandidateInit),
}

impl Signal {
    /// Decode a client signal. Unknown types fail with `InvalidSignalType`,
    /// payloads that don't match the type with `PeerSetupFailure`.
    pub fn decode(signal_type: &str, payload: serde_json::Value) -> CallResult<Self> {
        let kind: SignalType = signal_type.parse()?;
        let malformed =
            |e: serde_json::Error| CallError::PeerSetupFailure(format!("malformed {kind} payload: {e}"));

        let signal = match kind {
            SignalType::Offer => Self::Offer(serde_json::from_value(payload).map_err(malformed)?),
            SignalType::Answer => Self::Answer(serde_json::from_value(payload).map_err(malformed)?),
            SignalType::IceCandidate => {
                Self::IceCandidate(serde_json::from_value(payload).map_err(malformed)?)
            }
            SignalType::ScreenShareOffer => {
                Self::ScreenShareOffer(serde_json::from_value(payload).map_err(malformed)?)
            }
            SignalType::ScreenShareAnswer => {
                Self::ScreenShareAnswer(serde_json::from_value(payload).map_err(malformed)?)
            }
            SignalType::ScreenShareIceCandidate => {
                Self::ScreenShareIceCandidate(serde_json::from_value(payload).map_err(malformed)?)
            }
        };
        Ok(signal)
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Offer(_) => SignalType::Offer,
            Self::Answer(_) => SignalType::Answer,
            Self::IceCandidate(_) => SignalType::IceCandidate,
            Self::ScreenShareOffer(_) => SignalType::ScreenShareOffer,
            Self::ScreenShareAnswer(_) => SignalType::ScreenShareAnswer,
            Self::ScreenShareIceCandidate(_) => SignalType::ScreenShareIceCandidate,
        }
    }

    pub fn connection(&self) -> ConnectionKind {
        self.signal_type().connection()
    }
}

/// ICE server configuration (STUN/TURN) handed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// One credential-less server entry per configured URL.
    pub fn from_urls(urls: &[String]) -> Vec<Self> {
        urls.iter()
            .map(|url| Self {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect()
    }
}

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on a connection. The id comes from the auth layer.
    Identify {
        user_id: UserId,
        #[serde(default)]
        client: ClientProfile,
    },
    CreateCall {
        callee_id: UserId,
        #[serde(default)]
        call_type: CallType,
    },
    JoinCall {
        call_id: CallId,
    },
    AnswerCall {
        call_id: CallId,
    },
    RejectCall {
        call_id: CallId,
    },
    LeaveCall {
        call_id: CallId,
    },
    Signal {
        call_id: CallId,
        signal_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    NetworkSample {
        call_id: CallId,
        sample: NetworkSample,
    },
    RequestRung {
        call_id: CallId,
        rung: FallbackRung,
    },
    ToggleMute {
        call_id: CallId,
    },
    ToggleVideo {
        call_id: CallId,
    },
    StartScreenShare {
        call_id: CallId,
        #[serde(default)]
        name: String,
        #[serde(default = "default_share_quality")]
        quality: String,
        #[serde(default)]
        with_audio: bool,
    },
    StopScreenShare {
        call_id: CallId,
    },
    ChangeScreenShareQuality {
        call_id: CallId,
        quality: String,
    },
    /// Sharer-side measurements for the screen-share quality policy.
    ScreenShareStats {
        call_id: CallId,
        speed_kbps: f64,
        cpu_pct: f64,
    },
    Recommendations {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },
}

fn default_share_quality() -> String {
    ScreenShareQuality::default().as_str().to_string()
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Identified {
        user_id: UserId,
        ice_servers: Vec<IceServer>,
    },
    CallCreated {
        call: CallSnapshot,
    },
    /// Sent to a callee that is connected when a call for them is created.
    IncomingCall {
        call: CallSnapshot,
    },
    Joined {
        call: CallSnapshot,
    },
    CallAnswered {
        call_id: CallId,
        user_id: UserId,
    },
    ParticipantJoined {
        call_id: CallId,
        user_id: UserId,
    },
    ParticipantLeft {
        call_id: CallId,
        user_id: UserId,
    },
    /// A signal relayed from another participant.
    Signal {
        call_id: CallId,
        from_user_id: UserId,
        #[serde(flatten)]
        signal: Signal,
    },
    SignalAccepted {
        call_id: CallId,
        signal_type: SignalType,
        relayed_to: usize,
    },
    ProfileApplied {
        evaluation: Evaluation,
    },
    /// Reply to a user-requested rung; `transition` is `None` if it was already there.
    RungChanged {
        call_id: CallId,
        rung: FallbackRung,
        transition: Option<Transition>,
    },
    PeerState {
        call_id: CallId,
        peer: PeerConnectionState,
    },
    /// Current share, with the encode parameters its quality implies.
    ScreenShareUpdated {
        call_id: CallId,
        screen_share: Option<ScreenShareState>,
        params: Option<ScreenShareParams>,
    },
    ScreenShareRecommendation {
        call_id: CallId,
        current: ScreenShareQuality,
        recommended: ScreenShareQuality,
        change: bool,
    },
    Recommendations {
        call_id: CallId,
        items: Vec<RecommendationItem>,
    },
    CallEnded {
        call_id: CallId,
        duration_secs: i64,
        reason: String,
    },
    Error(ErrorBody),
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationItem {
    pub kind: Recommendation,
    pub message: &'static str,
}

impl From<Recommendation> for RecommendationItem {
    fn from(kind: Recommendation) -> Self {
        Self {
            kind,
            message: kind.message(),
        }
    }
}

impl ServerMessage {
    pub fn screen_share_updated(call_id: CallId, screen_share: Option<ScreenShareState>) -> Self {
        let params = screen_share.as_ref().map(|s| s.quality.params());
        Self::ScreenShareUpdated {
            call_id,
            screen_share,
            params,
        }
    }
}

impl From<&CallError> for ServerMessage {
    fn from(e: &CallError) -> Self {
        Self::Error(e.to_body())
    }
}
