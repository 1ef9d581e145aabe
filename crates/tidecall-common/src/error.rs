//! Centralized error types for the call core.
//!
//! Uses `thiserror` for ergonomic error definitions. Every variant is an
//! expected, recoverable condition that is returned to the caller; none of
//! them is fatal to the process.

use serde::Serialize;
use uuid::Uuid;

/// Errors surfaced by call sessions, signaling, and quality control.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    // === Lookup errors ===
    #[error("Call {0} not found")]
    CallNotFound(Uuid),

    #[error("User {user_id} has not joined call {call_id}")]
    UserNotInCall { call_id: Uuid, user_id: Uuid },

    #[error("No quality state for call {0}")]
    QualityStateNotFound(Uuid),

    // === Screen share ===
    #[error("User {sharer_id} is already sharing their screen")]
    ScreenShareConflict { sharer_id: Uuid },

    #[error("Only the current screen sharer can do that")]
    NotScreenSharer,

    #[error("Invalid screen share quality: {0} (expected high, medium or low)")]
    InvalidScreenShareQuality(String),

    // === Signaling ===
    #[error("Invalid signal type: {0}")]
    InvalidSignalType(String),

    #[error("Peer setup failed: {0}")]
    PeerSetupFailure(String),

    // === Call lifecycle ===
    #[error("Call is {status}, cannot {action}")]
    InvalidCallState { status: String, action: String },

    #[error("User {0} is already in another call")]
    UserBusy(Uuid),

    #[error("Invalid network sample: {0}")]
    InvalidSample(String),
}

/// JSON error body sent to signaling clients.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl CallError {
    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CallNotFound(_) => "CALL_NOT_FOUND",
            Self::UserNotInCall { .. } => "USER_NOT_IN_CALL",
            Self::QualityStateNotFound(_) => "QUALITY_STATE_NOT_FOUND",
            Self::ScreenShareConflict { .. } => "SCREEN_SHARE_CONFLICT",
            Self::NotScreenSharer => "NOT_SCREEN_SHARER",
            Self::InvalidScreenShareQuality(_) => "INVALID_SCREEN_SHARE_QUALITY",
            Self::InvalidSignalType(_) => "INVALID_SIGNAL_TYPE",
            Self::PeerSetupFailure(_) => "PEER_SETUP_FAILURE",
            Self::InvalidCallState { .. } => "INVALID_CALL_STATE",
            Self::UserBusy(_) => "USER_BUSY",
            Self::InvalidSample(_) => "INVALID_SAMPLE",
        }
    }

    /// Numeric code carried in signaling error frames.
    pub fn numeric_code(&self) -> u32 {
        match self {
            Self::CallNotFound(_) => 4004,
            Self::UserNotInCall { .. } => 4003,
            Self::QualityStateNotFound(_) => 4005,
            Self::ScreenShareConflict { .. } => 4009,
            Self::NotScreenSharer => 4013,
            Self::InvalidScreenShareQuality(_) => 4000,
            Self::InvalidSignalType(_) => 4001,
            Self::PeerSetupFailure(_) => 4010,
            Self::InvalidCallState { .. } => 4012,
            Self::UserBusy(_) => 4029,
            Self::InvalidSample(_) => 4002,
        }
    }

    /// Whether the call itself is gone (the client should drop its call state).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CallNotFound(_) | Self::QualityStateNotFound(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.numeric_code(),
            error: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Convenience type alias for Results using CallError.
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_carries_code_and_message() {
        let id = Uuid::nil();
        let body = CallError::CallNotFound(id).to_body();
        assert_eq!(body.code, 4004);
        assert_eq!(body.error, "CALL_NOT_FOUND");
        assert!(body.message.contains(&id.to_string()));
    }

    #[test]
    fn not_found_covers_both_lookups() {
        assert!(CallError::CallNotFound(Uuid::nil()).is_not_found());
        assert!(CallError::QualityStateNotFound(Uuid::nil()).is_not_found());
        assert!(!CallError::NotScreenSharer.is_not_found());
    }
}
