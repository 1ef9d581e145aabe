//! Call lifecycle events, shared between the call core and its consumers.
//!
//! The core emits these when a call or screen share starts, changes, or ends,
//! and downstream collaborators (statistics, archival, notifications)
//! subscribe to them. This module lives in `tidecall-common` so consumers can
//! depend on it without pulling in the call core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events broadcast to collaborators outside the call core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallEvent {
    CallStarted {
        call_id: Uuid,
        caller_id: Uuid,
        callee_id: Uuid,
        call_type: String,
        at: DateTime<Utc>,
    },
    CallAnswered {
        call_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    },
    CallEnded {
        call_id: Uuid,
        duration_secs: i64,
        reason: String,
        at: DateTime<Utc>,
    },
    ScreenShareStarted {
        call_id: Uuid,
        sharer_id: Uuid,
        quality: String,
        with_audio: bool,
        at: DateTime<Utc>,
    },
    ScreenShareStopped {
        call_id: Uuid,
        sharer_id: Uuid,
        duration_secs: i64,
        at: DateTime<Utc>,
    },
    ScreenShareQualityChanged {
        call_id: Uuid,
        sharer_id: Uuid,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// The call's media rung moved (downgrade, recovery, or user request).
    RungChanged {
        call_id: Uuid,
        from: String,
        to: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl CallEvent {
    /// The call this event belongs to.
    pub fn call_id(&self) -> Uuid {
        match self {
            Self::CallStarted { call_id, .. }
            | Self::CallAnswered { call_id, .. }
            | Self::CallEnded { call_id, .. }
            | Self::ScreenShareStarted { call_id, .. }
            | Self::ScreenShareStopped { call_id, .. }
            | Self::ScreenShareQualityChanged { call_id, .. }
            | Self::RungChanged { call_id, .. } => *call_id,
        }
    }
}
