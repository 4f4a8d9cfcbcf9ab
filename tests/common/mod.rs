#![allow(dead_code)]

use peer_call::calls::{CallManager, CallPhase, OutboundSignal, SessionSnapshot, SignalKind};
use peer_call::events::CallNotice;
use peer_call::identity::{IdentityProvider, PeerId};
use peer_call::media::{CaptureHandle, MediaTrack, SyntheticDevices, TrackKind};
use peer_call::peer::{LoopbackNetwork, LoopbackPeer, PeerChannel};
use peer_call::relay::{MemoryRelay, RelayClient};
use peer_call::CallConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(30);

/// One relay and one peer network shared by every party of a test.
pub struct World {
    pub relay: Arc<MemoryRelay>,
    pub network: Arc<LoopbackNetwork>,
}

pub struct Party {
    pub user: &'static str,
    pub devices: Arc<SyntheticDevices>,
    pub peer: Arc<LoopbackPeer>,
    pub manager: CallManager,
    pub notices: broadcast::Receiver<CallNotice>,
}

impl World {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    pub async fn join(&self, user: &'static str) -> Party {
        self.join_with(user, CallConfig::default()).await
    }

    /// Start a call manager for `user` and wait for its identifier.
    pub async fn join_with(&self, user: &'static str, config: CallConfig) -> Party {
        let devices = SyntheticDevices::new(user);
        let peer = self.network.peer(user);
        let manager = CallManager::builder()
            .with_config(CallConfig {
                display_name: display_name(user),
                ..config
            })
            .with_media_devices(devices.clone())
            .with_loopback_peer(peer.clone())
            .with_transport_factory(self.relay.factory(user))
            .build()
            .await
            .expect("call manager should start");
        let notices = manager.events().notice.subscribe();

        let party = Party {
            user,
            devices,
            peer,
            manager,
            notices,
        };
        party.wait(|s| s.local_identifier.is_some()).await;
        party
    }

    /// A bare relay connection, for injecting signals by hand.
    pub async fn raw_client(&self, user: &str) -> Arc<RelayClient> {
        let (client, events) = RelayClient::connect(&self.relay.factory(user))
            .await
            .expect("raw relay client should connect");
        // Keep the event queue drained
        tokio::spawn(drain(events));
        client
    }

    pub fn sent(&self, user: &str, kind: SignalKind) -> usize {
        self.relay.count_sent(user, kind)
    }

    /// Peer ids carried by every `call:start` / `call:accept` `user` sent.
    pub fn announced_ids(&self, user: &str) -> Vec<PeerId> {
        self.relay
            .sent_by(user)
            .into_iter()
            .filter_map(|signal| match signal {
                OutboundSignal::Start(p) => Some(p.peer_id),
                OutboundSignal::Accept(p) => Some(p.peer_id),
                _ => None,
            })
            .collect()
    }

    /// A loopback peer outside any call manager. Offers it receives are
    /// answered automatically when `answer` is set and left pending otherwise.
    pub async fn ghost(&self, label: &str, answer: bool) -> Arc<LoopbackPeer> {
        let ghost = self.network.peer(label);
        ghost
            .request_identifier()
            .await
            .expect("ghost should get an identifier");

        let weak = Arc::downgrade(&ghost);
        ghost.on_incoming_offer(Box::new(move |offer| {
            if !answer {
                return;
            }
            let Some(ghost) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let _ = ghost.answer(offer, stream("ghost")).await;
            });
        }));
        ghost
    }
}

impl Party {
    pub fn id(&self) -> PeerId {
        self.manager
            .local_identifier()
            .expect("identifier assigned at join")
    }

    pub async fn wait(&self, predicate: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        tokio::time::timeout(WAIT, self.manager.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for the session", self.user))
            .expect("call worker stopped")
    }

    pub async fn wait_phase(&self, phase: CallPhase) -> SessionSnapshot {
        self.wait(|s| s.phase == phase).await
    }

    pub async fn wait_connected(&self) -> SessionSnapshot {
        self.wait(|s| s.phase == CallPhase::Active && s.has_remote_stream)
            .await
    }

    /// Wait for a notice matching `predicate`, skipping others.
    pub async fn expect_notice(&mut self, predicate: impl Fn(&CallNotice) -> bool) -> CallNotice {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.notices.recv().await {
                    Ok(notice) if predicate(&notice) => return notice,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never got the expected notice", self.user))
    }
}

/// Ring `callee` from `caller` and let the callee accept.
pub async fn connect(caller: &Party, callee: &Party) {
    caller
        .manager
        .start(peer_call::Participant::new(
            callee.user,
            display_name(callee.user),
        ))
        .await
        .expect("start should be accepted");
    callee.wait_phase(CallPhase::Incoming).await;
    callee.manager.accept().await.expect("accept should be valid");
    caller.wait_connected().await;
    callee.wait_connected().await;
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub fn stream(label: &str) -> CaptureHandle {
    CaptureHandle::new(
        label,
        vec![
            MediaTrack::new(format!("{label}-audio"), TrackKind::Audio),
            MediaTrack::new(format!("{label}-video"), TrackKind::Video),
        ],
    )
}

pub fn display_name(user: &str) -> String {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn drain<T>(mut events: mpsc::Receiver<T>) {
    while events.recv().await.is_some() {}
}
