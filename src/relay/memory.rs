//! In-process signaling relay.
//!
//! Behaves like the relay service: a stateless fan-out keyed by user id. It
//! stamps the sender on `call:start`, routes accepts to the caller and ends to
//! the other user, tags every delivery with an `ackId`, and records what each
//! client sent so callers can inspect the traffic.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::calls::{
    AcceptedPayload, InboundSignal, IncomingPayload, OutboundSignal, SignalKind,
};
use crate::transport::{Transport, TransportEvent, TransportFactory};

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Default)]
pub struct MemoryRelay {
    users: DashMap<String, mpsc::Sender<TransportEvent>>,
    next_ack: AtomicU64,
    outstanding: Mutex<BTreeSet<u64>>,
    sent: Mutex<Vec<(String, OutboundSignal)>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport factory that connects as `user_id`.
    pub fn factory(self: &Arc<Self>, user_id: impl Into<String>) -> MemoryTransportFactory {
        MemoryTransportFactory {
            relay: self.clone(),
            user_id: user_id.into(),
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Drop a user's connection from the relay side.
    pub async fn kick(&self, user_id: &str) {
        if let Some((_, tx)) = self.users.remove(user_id) {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }

    /// Every signal `user_id` sent, acknowledgements included, in order.
    pub fn sent_by(&self, user_id: &str) -> Vec<OutboundSignal> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter(|(from, _)| from == user_id)
                    .map(|(_, signal)| signal.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_sent(&self, user_id: &str, kind: SignalKind) -> usize {
        self.sent_by(user_id)
            .iter()
            .filter(|s| s.kind() == kind)
            .count()
    }

    /// Deliveries not acknowledged yet.
    pub fn unacknowledged(&self) -> Vec<u64> {
        self.outstanding
            .lock()
            .map(|o| o.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn route(&self, sender: &str, signal: OutboundSignal) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((sender.to_string(), signal.clone()));
        }

        let (recipient, delivery) = match signal {
            OutboundSignal::Start(p) => (
                p.recipient_id,
                InboundSignal::Incoming(IncomingPayload {
                    sender_id: sender.to_string(),
                    sender_name: p.sender_name,
                    peer_id: p.peer_id,
                }),
            ),
            OutboundSignal::Accept(p) => (
                p.caller_id,
                InboundSignal::Accepted(AcceptedPayload { peer_id: p.peer_id }),
            ),
            OutboundSignal::End(p) => (p.other_user_id, InboundSignal::Ended),
            OutboundSignal::Ack(ack) => {
                if let Ok(mut outstanding) = self.outstanding.lock() {
                    outstanding.remove(&ack.id);
                }
                trace!(target: "Relay/Memory", "{sender} acknowledged {}", ack.id);
                return;
            }
        };

        let Some(tx) = self.users.get(&recipient).map(|tx| tx.value().clone()) else {
            debug!(target: "Relay/Memory", "{recipient} is offline, dropping {}", delivery.kind());
            return;
        };

        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = match delivery.encode(Some(ack_id)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Relay/Memory", "Failed to encode {}: {e}", delivery.kind());
                return;
            }
        };
        if let Ok(mut outstanding) = self.outstanding.lock() {
            outstanding.insert(ack_id);
        }

        debug!(target: "Relay/Memory", "{sender} -> {recipient}: {}", delivery.kind());
        if tx
            .send(TransportEvent::FrameReceived(Bytes::from(frame)))
            .await
            .is_err()
        {
            debug!(target: "Relay/Memory", "{recipient} stopped reading");
        }
    }
}

pub struct MemoryTransportFactory {
    relay: Arc<MemoryRelay>,
    user_id: String,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))?;

        // A second connection for the same user replaces the first
        if let Some(previous) = self.relay.users.insert(self.user_id.clone(), tx) {
            let _ = previous.send(TransportEvent::Disconnected).await;
        }

        let transport = Arc::new(MemoryTransport {
            relay: self.relay.clone(),
            user_id: self.user_id.clone(),
            connected: AtomicBool::new(true),
        });
        Ok((transport, rx))
    }
}

struct MemoryTransport {
    relay: Arc<MemoryRelay>,
    user_id: String,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        if !self.connected.load(Ordering::SeqCst) || !self.relay.is_online(&self.user_id) {
            return Err(anyhow::anyhow!("Socket is closed"));
        }
        let signal = OutboundSignal::decode(frame)?;
        self.relay.route(&self.user_id, signal).await;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.kick(&self.user_id).await;
        }
    }
}
