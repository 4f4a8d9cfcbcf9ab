//! In-process peer substrate: assigns identifiers and connects peers that
//! live in the same [`LoopbackNetwork`].

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tokio::sync::oneshot;

use super::{IncomingOffer, OfferHandler, PeerChannel};
use crate::calls::CallError;
use crate::identity::{IdentityProvider, PeerId};
use crate::media::{CaptureHandle, MediaTrack};

/// Registry of reachable loopback peers, keyed by assigned identifier.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: DashMap<PeerId, Arc<PeerShared>>,
    next_offer: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a peer. It becomes reachable once it has requested an
    /// identifier.
    pub fn peer(self: &Arc<Self>, label: impl Into<String>) -> Arc<LoopbackPeer> {
        Arc::new(LoopbackPeer {
            network: Arc::downgrade(self),
            label: label.into(),
            id: OnceLock::new(),
            shared: Arc::new(PeerShared::default()),
        })
    }

    /// Make a peer unreachable, declining everything it had pending.
    pub fn disconnect(&self, id: &PeerId) {
        if let Some((_, peer)) = self.peers.remove(id) {
            peer.pending.clear();
            info!(target: "Call/Loopback", "Peer {id} left the network");
        }
    }

    pub fn is_reachable(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    fn lookup(&self, id: &PeerId) -> Option<Arc<PeerShared>> {
        self.peers.get(id).map(|p| p.value().clone())
    }
}

struct PendingOffer {
    caller_stream: CaptureHandle,
    reply: oneshot::Sender<CaptureHandle>,
}

/// The part of a peer other peers reach through the network.
#[derive(Default)]
struct PeerShared {
    handler: RwLock<Option<OfferHandler>>,
    pending: DashMap<u64, PendingOffer>,
}

impl PeerShared {
    fn deliver(&self, offer: IncomingOffer) -> bool {
        let handler = self.handler.read().unwrap_or_else(|e| e.into_inner());
        match handler.as_ref() {
            Some(handler) => {
                handler(offer);
                true
            }
            None => false,
        }
    }
}

pub struct LoopbackPeer {
    network: Weak<LoopbackNetwork>,
    label: String,
    id: OnceLock<PeerId>,
    shared: Arc<PeerShared>,
}

impl LoopbackPeer {
    pub fn id(&self) -> Option<&PeerId> {
        self.id.get()
    }

    /// Offers delivered to this peer and not yet answered or declined.
    pub fn pending_offers(&self) -> usize {
        self.shared.pending.len()
    }

    fn network(&self) -> Result<Arc<LoopbackNetwork>, CallError> {
        self.network
            .upgrade()
            .ok_or_else(|| CallError::Negotiation("loopback network is gone".into()))
    }
}

/// The stream the other side sees: same track layout, independent lifetime.
fn mirror(stream: &CaptureHandle) -> CaptureHandle {
    let tracks = stream
        .tracks()
        .iter()
        .map(|t| MediaTrack::new(format!("remote-{}", t.id()), t.kind()))
        .collect();
    CaptureHandle::new(format!("remote-{}", stream.id()), tracks)
}

#[async_trait]
impl IdentityProvider for LoopbackPeer {
    async fn request_identifier(&self) -> Result<PeerId, CallError> {
        let network = self.network()?;
        let id = self
            .id
            .get_or_init(|| PeerId::new(format!("{}-{:08x}", self.label, rand::random::<u32>())))
            .clone();
        network
            .peers
            .entry(id.clone())
            .or_insert_with(|| self.shared.clone());
        debug!(target: "Call/Loopback", "Peer {id} is reachable");
        Ok(id)
    }
}

#[async_trait]
impl PeerChannel for LoopbackPeer {
    async fn initiate(
        &self,
        remote: &PeerId,
        local: CaptureHandle,
    ) -> Result<CaptureHandle, CallError> {
        let network = self.network()?;
        let from = self
            .id
            .get()
            .cloned()
            .ok_or_else(|| CallError::Negotiation("local peer has no identifier".into()))?;
        let target = network
            .lookup(remote)
            .ok_or_else(|| CallError::Negotiation(format!("peer {remote} is unreachable")))?;

        let offer_id = network.next_offer.fetch_add(1, Ordering::SeqCst);
        let (reply, answered) = oneshot::channel();
        target.pending.insert(
            offer_id,
            PendingOffer {
                caller_stream: mirror(&local),
                reply,
            },
        );

        debug!(target: "Call/Loopback", "Offer {offer_id} from {from} to {remote}");
        if !target.deliver(IncomingOffer { from, offer_id }) {
            target.pending.remove(&offer_id);
            return Err(CallError::Negotiation(format!(
                "peer {remote} does not accept offers"
            )));
        }

        answered
            .await
            .map_err(|_| CallError::Negotiation(format!("offer {offer_id} was declined")))
    }

    fn on_incoming_offer(&self, handler: OfferHandler) {
        let mut slot = self.shared.handler.write().unwrap_or_else(|e| e.into_inner());
        if slot.replace(handler).is_some() {
            warn!(target: "Call/Loopback", "Replacing the incoming offer handler of {}", self.label);
        }
    }

    async fn answer(
        &self,
        offer: IncomingOffer,
        local: CaptureHandle,
    ) -> Result<CaptureHandle, CallError> {
        let (_, pending) = self.shared.pending.remove(&offer.offer_id).ok_or_else(|| {
            CallError::Negotiation(format!("offer {} is no longer pending", offer.offer_id))
        })?;

        pending
            .reply
            .send(mirror(&local))
            .map_err(|_| CallError::Negotiation(format!("{} stopped waiting", offer.from)))?;

        debug!(target: "Call/Loopback", "Answered offer {} from {}", offer.offer_id, offer.from);
        Ok(pending.caller_stream)
    }

    fn decline(&self, offer: IncomingOffer) {
        if self.shared.pending.remove(&offer.offer_id).is_some() {
            debug!(target: "Call/Loopback", "Declined offer {} from {}", offer.offer_id, offer.from);
        }
    }
}
