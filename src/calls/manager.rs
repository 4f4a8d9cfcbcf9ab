//! Call manager: the public handle to the call worker.

use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::CallError;
use super::handler::SignalHandler;
use super::state::{Participant, SessionSnapshot};
use super::worker::{CallWorker, Command, Reply};
use crate::config::CallConfig;
use crate::events::EventBus;
use crate::identity::{IdentityProvider, IdentityRegistry, PeerId};
use crate::media::{MediaDevices, MediaGuard, MediaStats};
use crate::peer::{LoopbackPeer, PeerChannel};
use crate::relay::RelayClient;
use crate::transport::TransportFactory;

/// Handle to one call worker. Cheap to clone; every clone drives the same
/// session.
///
/// Intents are queued to the worker and answered once their effects have
/// settled. Session changes are observed through [`subscribe`] and the
/// [`EventBus`].
///
/// [`subscribe`]: CallManager::subscribe
#[derive(Clone)]
pub struct CallManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: Arc<EventBus>,
    identity: Arc<IdentityRegistry>,
    media: Arc<MediaGuard>,
    relay: Arc<RelayClient>,
}

impl CallManager {
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::default()
    }

    /// Ring `remote`. Local media is acquired in the background and
    /// `call:start` goes out once it is ready.
    pub async fn start(&self, remote: Participant) -> Result<(), CallError> {
        self.request(|reply| Command::Start { remote, reply }).await
    }

    /// Accept the ringing incoming call.
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the incoming call.
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Abandon the outgoing call before it is answered.
    pub async fn cancel(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Hang up the active call.
    pub async fn end(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Cancel, reject or end, whichever fits the current phase.
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    /// Flip the microphone. Returns whether it is now enabled.
    pub async fn toggle_mic(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMic { reply }).await
    }

    /// Flip the camera. Returns whether it is now enabled.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, CallError> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::Shutdown)?;
        Ok(snapshot.clone())
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn local_identifier(&self) -> Option<PeerId> {
        self.identity.current()
    }

    pub fn media_stats(&self) -> MediaStats {
        self.media.stats()
    }

    pub fn is_relay_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// End any live session, disconnect from the relay and stop the worker.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .map_err(|_| CallError::Shutdown)?;
        done.await.map_err(|_| CallError::Shutdown)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| CallError::Shutdown)?;
        result.await.map_err(|_| CallError::Shutdown)?
    }
}

#[derive(Default)]
pub struct CallManagerBuilder {
    config: CallConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    peer_channel: Option<Arc<dyn PeerChannel>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
}

impl CallManagerBuilder {
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    pub fn with_peer_channel(mut self, channel: Arc<dyn PeerChannel>) -> Self {
        self.peer_channel = Some(channel);
        self
    }

    /// Use one loopback peer as both identifier source and peer channel.
    pub fn with_loopback_peer(self, peer: Arc<LoopbackPeer>) -> Self {
        self.with_identity_provider(peer.clone())
            .with_peer_channel(peer)
    }

    pub fn with_transport_factory<F>(mut self, factory: F) -> Self
    where
        F: TransportFactory + 'static,
    {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    /// Connect to the relay and spawn the call worker.
    pub async fn build(self) -> Result<CallManager, anyhow::Error> {
        let devices = self
            .devices
            .ok_or_else(|| anyhow::anyhow!("Media devices are required"))?;
        let provider = self
            .identity_provider
            .ok_or_else(|| anyhow::anyhow!("An identity provider is required"))?;
        let peer = self
            .peer_channel
            .ok_or_else(|| anyhow::anyhow!("A peer channel is required"))?;
        let factory = self
            .transport_factory
            .ok_or_else(|| anyhow::anyhow!("A relay transport factory is required"))?;

        let (relay, transport_events) = RelayClient::connect(factory.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to relay: {}", e))?;

        let media = MediaGuard::new(devices);
        let identity = IdentityRegistry::new(provider);
        let events = Arc::new(EventBus::new());
        let (snapshots_tx, snapshots) = watch::channel(SessionSnapshot::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let worker = CallWorker::new(
            self.config,
            media.clone(),
            identity.clone(),
            relay.clone(),
            peer,
            events.clone(),
            snapshots_tx,
            commands.downgrade(),
        );
        tokio::spawn(worker.run(commands_rx));
        tokio::spawn(SignalHandler::new(relay.clone()).run(transport_events, commands.downgrade()));

        info!(target: "Call/Manager", "Call manager ready");
        debug!(target: "Call/Manager", "Relay connected: {}", relay.is_connected());

        Ok(CallManager {
            commands,
            snapshots,
            events,
            identity,
            media,
            relay,
        })
    }
}
