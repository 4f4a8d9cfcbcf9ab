//! Peer media channel seam.
//!
//! Once both parties know each other's identifier, one side initiates a
//! direct media channel and the other answers it. The substrate behind the
//! trait owns the actual transport; the call worker only sees capture handles.

mod loopback;

pub use loopback::{LoopbackNetwork, LoopbackPeer};

use async_trait::async_trait;

use crate::calls::CallError;
use crate::identity::PeerId;
use crate::media::CaptureHandle;

/// A connection request from a remote peer, waiting for `answer` or `decline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub from: PeerId,
    pub offer_id: u64,
}

/// Receives every offer addressed to the local identifier.
pub type OfferHandler = Box<dyn Fn(IncomingOffer) + Send + Sync>;

#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Caller-side negotiation. Resolves with the remote stream once the
    /// remote answers; does not time out on its own.
    async fn initiate(
        &self,
        remote: &PeerId,
        local: CaptureHandle,
    ) -> Result<CaptureHandle, CallError>;

    /// Install the offer handler. A later registration replaces the earlier
    /// one.
    fn on_incoming_offer(&self, handler: OfferHandler);

    /// Callee-side negotiation for an offer delivered to the handler.
    async fn answer(
        &self,
        offer: IncomingOffer,
        local: CaptureHandle,
    ) -> Result<CaptureHandle, CallError>;

    /// Drop an offer that will not be answered. The initiator's negotiation
    /// fails.
    fn decline(&self, offer: IncomingOffer);
}
