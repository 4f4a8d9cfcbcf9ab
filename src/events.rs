use serde::Serialize;
use tokio::sync::broadcast;

use crate::calls::{CallError, CallPhase, Participant};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (phase_changed, PhaseChanged),
    (notice, CallNotice),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Broadcast a notice. Having no subscribers is fine.
    pub fn notify(&self, notice: CallNotice) {
        let _ = self.notice.send(notice);
    }

    pub fn phase(&self, epoch: u64, from: CallPhase, to: CallPhase) {
        let _ = self.phase_changed.send(PhaseChanged { epoch, from, to });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChanged {
    pub epoch: u64,
    pub from: CallPhase,
    pub to: CallPhase,
}

/// User-visible outcomes the presentation layer may want to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// Camera or microphone could not be opened; the session went back to idle.
    MediaUnavailable { reason: String },
    /// The relay was not reachable when an intent needed it.
    RelayUnavailable,
    /// A second caller was turned away while a session was live.
    Busy { caller_id: String },
    /// The session returned to idle.
    CallEnded {
        remote: Participant,
        by_remote: bool,
    },
    /// Ringing expired without an answer.
    NoAnswer { remote: Participant },
    /// The peer channel could not be established.
    NegotiationFailed { error: CallError },
    /// The relay connection dropped. The live session, if any, is kept.
    RelayDisconnected,
}
