//! Two-party audio/video call sessions.
//!
//! A call is negotiated over a signaling relay and carried over a direct
//! peer channel. This module owns the session state machine and the worker
//! that drives it.
//!
//! # Architecture
//!
//! - [`CallManager`]: cloneable handle; sends intents to the worker and
//!   exposes snapshots and events
//! - [`CallPhase`] & [`Session`]: the session and its phase table
//! - [`SignalKind`], [`OutboundSignal`], [`InboundSignal`]: relay messages
//! - [`SignalHandler`]: acknowledges relay frames and feeds them to the worker
//!
//! # Protocol Overview
//!
//! The caller acquires media, then sends `call:start`. The callee rings,
//! acquires media on accept, then answers with `call:accept` carrying its peer
//! identifier. The caller opens the peer channel to that identifier and the
//! callee answers the offer. Either side ends with `call:end`; the relay
//! delivers it to the other as `call:ended`.

mod error;
mod handler;
mod manager;
mod signaling;
mod state;
mod worker;

pub use error::CallError;
pub use handler::SignalHandler;
pub use manager::{CallManager, CallManagerBuilder};
pub use signaling::{
    AcceptPayload, AcceptedPayload, AckPayload, EndPayload, InboundSignal, IncomingPayload,
    OutboundSignal, ParsedSignal, SignalKind, StartPayload,
};
pub use state::{
    CallDirection, CallPhase, CallTransition, InvalidTransition, Participant, Session,
    SessionSnapshot,
};
