//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("camera/microphone unavailable: {0}")]
    MediaUnavailable(String),

    #[error("signaling relay unavailable")]
    RelayUnavailable,

    #[error("a call session is already live")]
    Busy,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("identifier assignment failed: {0}")]
    Identity(String),

    #[error("media negotiation failed: {0}")]
    Negotiation(String),

    #[error("media negotiation timed out")]
    NegotiationTimeout,

    #[error("result belongs to a finished session")]
    StaleResolution,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call worker has shut down")]
    Shutdown,
}

impl CallError {
    /// Failures that return the session to idle with a notice rather than
    /// propagating further.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MediaUnavailable(_) | Self::RelayUnavailable | Self::Busy
        )
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
