//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::media::CaptureHandle;
use crate::peer::IncomingOffer;

/// Phase of the (single) call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallPhase {
    /// No live session.
    #[default]
    Idle,
    /// We started a call and are waiting for the remote party.
    Outgoing,
    /// The remote party is calling us (ringing or accepting).
    Incoming,
    /// Both parties agreed to connect; media is negotiated or flowing.
    Active,
    /// Tearing down an active call.
    Ending,
}

impl CallPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// A session is live in every phase except idle.
    pub fn is_live(&self) -> bool {
        !self.is_idle()
    }

    /// Validate a transition against the phase table.
    pub fn next(self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        use CallPhase::*;
        use CallTransition::*;

        let next = match (self, transition) {
            (Idle, LocalStart) => Outgoing,
            (Idle, OfferReceived) => Incoming,

            (Outgoing, RemoteAccepted) => Active,
            (Outgoing, LocalCancel | RemoteEnded | MediaFailed | TimedOut) => Idle,

            (Incoming, LocalAccept) => Incoming,
            (Incoming, OfferAnswered) => Active,
            (Incoming, LocalReject | RemoteEnded | MediaFailed | TimedOut) => Idle,

            (Active, LocalEnd | RemoteEnded | NegotiationFailed | TimedOut) => Ending,
            (Active, MediaFailed) => Idle,

            (Ending, CleanupComplete) => Idle,

            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{attempted:?}"),
                });
            }
        };
        Ok(next)
    }
}

/// Inputs to the phase table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    LocalStart,
    OfferReceived,
    RemoteAccepted,
    LocalAccept,
    OfferAnswered,
    LocalCancel,
    LocalReject,
    LocalEnd,
    RemoteEnded,
    MediaFailed,
    NegotiationFailed,
    TimedOut,
    CleanupComplete,
}

/// Who placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// The other party of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Live session data. Owned exclusively by the call worker.
#[derive(Debug, Default)]
pub struct Session {
    pub epoch: u64,
    pub phase: CallPhase,
    pub direction: Option<CallDirection>,
    pub remote: Option<Participant>,
    pub remote_identifier: Option<PeerId>,
    /// Incoming only: local accept issued, media acquisition or answer pending.
    pub accepting: bool,
    pub local_stream: Option<CaptureHandle>,
    pub remote_stream: Option<CaptureHandle>,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Outgoing: `call:start` was emitted.
    pub(crate) start_signaled: bool,
    /// Outgoing: `call:accepted` that arrived before local media was ready.
    pub(crate) pending_accept: Option<PeerId>,
    /// Incoming: peer offer that arrived before local media was ready.
    pub(crate) pending_offer: Option<IncomingOffer>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session from idle. Bumps the epoch so results of earlier
    /// sessions can be told apart.
    pub fn begin(
        &mut self,
        direction: CallDirection,
        remote: Participant,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let next = self.phase.next(transition)?;
        self.epoch += 1;
        self.phase = next;
        self.direction = Some(direction);
        self.remote = Some(remote);
        self.mic_enabled = true;
        self.cam_enabled = true;
        Ok(())
    }

    /// Apply a state transition. Returns the previous phase.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<CallPhase, InvalidTransition> {
        match transition {
            CallTransition::LocalAccept if self.accepting => {
                return Err(self.invalid(transition));
            }
            CallTransition::OfferAnswered if !self.accepting => {
                return Err(self.invalid(transition));
            }
            _ => {}
        }

        let previous = self.phase;
        self.phase = self.phase.next(transition)?;

        match transition {
            CallTransition::LocalAccept => self.accepting = true,
            CallTransition::RemoteAccepted | CallTransition::OfferAnswered => {
                self.accepting = false;
                self.started_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(previous)
    }

    /// Clear per-session fields after the phase returned to idle. Streams must
    /// already have been released by the caller.
    pub fn reset(&mut self) {
        debug_assert!(self.phase.is_idle());
        let epoch = self.epoch;
        *self = Self {
            epoch,
            ..Self::default()
        };
    }

    pub fn has_local_stream(&self) -> bool {
        self.local_stream.is_some()
    }

    pub fn snapshot(&self, local_identifier: Option<PeerId>) -> SessionSnapshot {
        SessionSnapshot {
            epoch: self.epoch,
            phase: self.phase,
            direction: self.direction,
            accepting: self.accepting,
            local_identifier,
            remote_participant: self.remote.clone(),
            remote_identifier: self.remote_identifier.clone(),
            has_local_stream: self.local_stream.is_some(),
            has_remote_stream: self.remote_stream.is_some(),
            mic_enabled: self.mic_enabled,
            cam_enabled: self.cam_enabled,
            started_at: self.started_at,
        }
    }

    fn invalid(&self, transition: CallTransition) -> InvalidTransition {
        InvalidTransition {
            current_state: if self.accepting {
                format!("{:?}(accepting)", self.phase)
            } else {
                format!("{:?}", self.phase)
            },
            attempted: format!("{transition:?}"),
        }
    }
}

/// Immutable view of the session handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub phase: CallPhase,
    pub direction: Option<CallDirection>,
    pub accepting: bool,
    pub local_identifier: Option<PeerId>,
    pub remote_participant: Option<Participant>,
    pub remote_identifier: Option<PeerId>,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> Participant {
        Participant::new("bob", "Bob")
    }

    fn outgoing_session() -> Session {
        let mut session = Session::new();
        session
            .begin(CallDirection::Outgoing, bob(), CallTransition::LocalStart)
            .unwrap();
        session
    }

    fn incoming_session() -> Session {
        let mut session = Session::new();
        session
            .begin(CallDirection::Incoming, bob(), CallTransition::OfferReceived)
            .unwrap();
        session
    }

    /// Flow: Idle → Outgoing → Active → Ending → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut session = outgoing_session();
        assert_eq!(session.phase, CallPhase::Outgoing);
        assert_eq!(session.epoch, 1);
        assert!(session.mic_enabled && session.cam_enabled);

        session
            .apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert_eq!(session.phase, CallPhase::Active);
        assert!(session.started_at.is_some());

        session.apply_transition(CallTransition::LocalEnd).unwrap();
        assert_eq!(session.phase, CallPhase::Ending);

        session
            .apply_transition(CallTransition::CleanupComplete)
            .unwrap();
        assert!(session.phase.is_idle());
    }

    /// Flow: Idle → Incoming → Incoming(accepting) → Active
    #[test]
    fn test_incoming_call_flow() {
        let mut session = incoming_session();
        assert_eq!(session.phase, CallPhase::Incoming);
        assert!(!session.accepting);

        session.apply_transition(CallTransition::LocalAccept).unwrap();
        assert_eq!(session.phase, CallPhase::Incoming);
        assert!(session.accepting);

        session
            .apply_transition(CallTransition::OfferAnswered)
            .unwrap();
        assert_eq!(session.phase, CallPhase::Active);
        assert!(!session.accepting);
    }

    #[test]
    fn test_answer_requires_accepting() {
        let mut session = incoming_session();
        let err = session
            .apply_transition(CallTransition::OfferAnswered)
            .unwrap_err();
        assert_eq!(err.attempted, "OfferAnswered");
        assert_eq!(session.phase, CallPhase::Incoming);
    }

    #[test]
    fn test_double_accept_rejected() {
        let mut session = incoming_session();
        session.apply_transition(CallTransition::LocalAccept).unwrap();
        let err = session
            .apply_transition(CallTransition::LocalAccept)
            .unwrap_err();
        assert_eq!(err.current_state, "Incoming(accepting)");
    }

    #[test]
    fn test_terminal_transitions_from_ringing_phases() {
        for transition in [
            CallTransition::LocalCancel,
            CallTransition::RemoteEnded,
            CallTransition::MediaFailed,
            CallTransition::TimedOut,
        ] {
            assert_eq!(CallPhase::Outgoing.next(transition), Ok(CallPhase::Idle));
        }
        for transition in [
            CallTransition::LocalReject,
            CallTransition::RemoteEnded,
            CallTransition::MediaFailed,
            CallTransition::TimedOut,
        ] {
            assert_eq!(CallPhase::Incoming.next(transition), Ok(CallPhase::Idle));
        }
    }

    #[test]
    fn test_active_ends_through_ending() {
        for transition in [
            CallTransition::LocalEnd,
            CallTransition::RemoteEnded,
            CallTransition::NegotiationFailed,
        ] {
            assert_eq!(CallPhase::Active.next(transition), Ok(CallPhase::Ending));
        }
    }

    #[test]
    fn test_invalid_transitions() {
        // Nothing to accept, cancel or end while idle
        assert!(CallPhase::Idle.next(CallTransition::LocalAccept).is_err());
        assert!(CallPhase::Idle.next(CallTransition::LocalCancel).is_err());
        assert!(CallPhase::Idle.next(CallTransition::RemoteEnded).is_err());

        // Late accept after the outgoing session moved on
        assert!(CallPhase::Active.next(CallTransition::RemoteAccepted).is_err());
        assert!(CallPhase::Incoming.next(CallTransition::RemoteAccepted).is_err());

        // Cancel is outgoing-only, reject is incoming-only
        assert!(CallPhase::Incoming.next(CallTransition::LocalCancel).is_err());
        assert!(CallPhase::Outgoing.next(CallTransition::LocalReject).is_err());

        // A second session cannot start while one is live
        assert!(CallPhase::Outgoing.next(CallTransition::LocalStart).is_err());
        assert!(CallPhase::Active.next(CallTransition::OfferReceived).is_err());
    }

    #[test]
    fn test_begin_while_live_keeps_session() {
        let mut session = outgoing_session();
        let err = session
            .begin(
                CallDirection::Outgoing,
                Participant::new("carol", "Carol"),
                CallTransition::LocalStart,
            )
            .unwrap_err();
        assert_eq!(err.current_state, "Outgoing");
        assert_eq!(session.epoch, 1);
        assert_eq!(session.remote.as_ref().map(|p| p.id.as_str()), Some("bob"));
    }

    #[test]
    fn test_reset_keeps_epoch() {
        let mut session = outgoing_session();
        session.apply_transition(CallTransition::LocalCancel).unwrap();
        session.reset();

        assert_eq!(session.epoch, 1);
        assert!(session.remote.is_none());
        assert!(session.direction.is_none());

        session
            .begin(CallDirection::Incoming, bob(), CallTransition::OfferReceived)
            .unwrap();
        assert_eq!(session.epoch, 2);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let session = incoming_session();
        let snapshot = session.snapshot(Some(PeerId::from("peer-b")));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["phase"], "Incoming");
        assert_eq!(json["localIdentifier"], "peer-b");
        assert_eq!(json["remoteParticipant"]["displayName"], "Bob");
        assert_eq!(json["hasLocalStream"], false);
    }
}
