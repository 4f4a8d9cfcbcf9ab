//! The call worker.
//!
//! A single task owns the [`Session`] and drains one command queue. Local
//! intents, relay signals, peer offers and the results of background work all
//! arrive as commands and are handled strictly in order; a command's side
//! effects (media release, relay emission) finish before the next one is taken.
//!
//! Acquisition, negotiation and timers run in spawned tasks that report back
//! with the session epoch they were launched for. A report whose epoch or
//! sub-state no longer matches is stale: it is dropped, but any capture handle
//! it carries is stopped first.
//!
//! Those tasks hold only a weak handle to the queue, so the worker winds down
//! as soon as the last [`CallManager`](super::CallManager) is dropped.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use super::error::CallError;
use super::signaling::{InboundSignal, IncomingPayload, OutboundSignal};
use super::state::{
    CallDirection, CallPhase, CallTransition, Participant, Session, SessionSnapshot,
};
use crate::config::CallConfig;
use crate::events::{CallNotice, EventBus};
use crate::identity::{IdentityRegistry, PeerId};
use crate::media::{CaptureHandle, MediaConstraints, MediaGuard, TrackKind};
use crate::peer::{IncomingOffer, PeerChannel};
use crate::relay::RelayClient;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Start {
        remote: Participant,
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    Hangup {
        reply: Reply<()>,
    },
    ToggleMic {
        reply: Reply<bool>,
    },
    ToggleCamera {
        reply: Reply<bool>,
    },
    Relay(InboundSignal),
    RelayDisconnected,
    PeerOffer(IncomingOffer),
    IdentityAssigned(PeerId),
    Prepared {
        epoch: u64,
        result: Result<(CaptureHandle, PeerId), CallError>,
    },
    Negotiated {
        epoch: u64,
        result: Result<CaptureHandle, CallError>,
    },
    TimerFired {
        epoch: u64,
        timer: Timer,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Ring,
    Negotiation,
}

pub(crate) struct CallWorker {
    config: CallConfig,
    session: Session,
    media: Arc<MediaGuard>,
    identity: Arc<IdentityRegistry>,
    relay: Arc<RelayClient>,
    peer: Arc<dyn PeerChannel>,
    events: Arc<EventBus>,
    snapshots: watch::Sender<SessionSnapshot>,
    commands: mpsc::WeakUnboundedSender<Command>,
    ring_timer: Option<AbortHandle>,
    negotiation_timer: Option<AbortHandle>,
    negotiation: Option<AbortHandle>,
}

impl CallWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CallConfig,
        media: Arc<MediaGuard>,
        identity: Arc<IdentityRegistry>,
        relay: Arc<RelayClient>,
        peer: Arc<dyn PeerChannel>,
        events: Arc<EventBus>,
        snapshots: watch::Sender<SessionSnapshot>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let offers = commands.clone();
        peer.on_incoming_offer(Box::new(move |offer| {
            if let Some(commands) = offers.upgrade() {
                let _ = commands.send(Command::PeerOffer(offer));
            }
        }));

        Self {
            config,
            session: Session::new(),
            media,
            identity,
            relay,
            peer,
            events,
            snapshots,
            commands,
            ring_timer: None,
            negotiation_timer: None,
            negotiation: None,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(target: "Call/Worker", "Call worker started");
        self.initialize_identity();

        while let Some(command) = commands.recv().await {
            let running = self.handle(command).await;
            if !running {
                info!(target: "Call/Worker", "Call worker stopped");
                return;
            }
            self.publish();
        }

        debug!(target: "Call/Worker", "All call handles dropped");
        self.shutdown().await;
        self.publish();
    }

    /// Process one command. Returns `false` once the worker should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start { remote, reply } => {
                let result = self.start(remote);
                self.respond(reply, result);
            }
            Command::Accept { reply } => {
                let result = self.accept();
                self.respond(reply, result);
            }
            Command::Reject { reply } => {
                let result = self.finish(CallTransition::LocalReject, true, None).await;
                self.respond(reply, result);
            }
            Command::Cancel { reply } => {
                let result = self.finish(CallTransition::LocalCancel, true, None).await;
                self.respond(reply, result);
            }
            Command::End { reply } => {
                let result = self.finish(CallTransition::LocalEnd, true, None).await;
                self.respond(reply, result);
            }
            Command::Hangup { reply } => {
                let transition = match self.session.phase {
                    CallPhase::Outgoing => CallTransition::LocalCancel,
                    CallPhase::Incoming => CallTransition::LocalReject,
                    _ => CallTransition::LocalEnd,
                };
                let result = self.finish(transition, true, None).await;
                self.respond(reply, result);
            }
            Command::ToggleMic { reply } => {
                let enabled = self.toggle(TrackKind::Audio);
                self.respond(reply, Ok(enabled));
            }
            Command::ToggleCamera { reply } => {
                let enabled = self.toggle(TrackKind::Video);
                self.respond(reply, Ok(enabled));
            }
            Command::Relay(signal) => self.on_relay_signal(signal).await,
            Command::RelayDisconnected => {
                warn!(target: "Call/Worker", "Relay connection lost");
                self.events.notify(CallNotice::RelayDisconnected);
            }
            Command::PeerOffer(offer) => self.on_peer_offer(offer),
            Command::IdentityAssigned(id) => {
                debug!(target: "Call/Worker", "Local identifier {id} is ready");
            }
            Command::Prepared { epoch, result } => self.on_prepared(epoch, result).await,
            Command::Negotiated { epoch, result } => self.on_negotiated(epoch, result).await,
            Command::TimerFired { epoch, timer } => self.on_timer(epoch, timer).await,
            Command::Shutdown { reply } => {
                self.shutdown().await;
                self.publish();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // Intents

    fn start(&mut self, remote: Participant) -> Result<(), CallError> {
        if self.session.phase.is_live() {
            debug!(target: "Call/Worker", "Rejecting start for {}: session is live", remote.id);
            return Err(CallError::Busy);
        }
        if !self.relay.is_connected() {
            self.events.notify(CallNotice::RelayUnavailable);
            return Err(CallError::RelayUnavailable);
        }

        self.begin(CallDirection::Outgoing, remote, CallTransition::LocalStart)?;
        self.prepare();
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CallError> {
        if self.session.phase == CallPhase::Incoming && !self.relay.is_connected() {
            self.events.notify(CallNotice::RelayUnavailable);
            return Err(CallError::RelayUnavailable);
        }

        self.transition(CallTransition::LocalAccept)?;
        abort(&mut self.ring_timer);
        self.prepare();
        Ok(())
    }

    /// Mic/camera toggles only flip track flags, and are no-ops without a
    /// local stream. Returns the resulting flag.
    fn toggle(&mut self, kind: TrackKind) -> bool {
        let Some(stream) = self.session.local_stream.clone() else {
            debug!(target: "Call/Worker", "No local stream, ignoring {kind:?} toggle");
            return match kind {
                TrackKind::Audio => self.session.mic_enabled,
                TrackKind::Video => self.session.cam_enabled,
            };
        };

        let flag = match kind {
            TrackKind::Audio => &mut self.session.mic_enabled,
            TrackKind::Video => &mut self.session.cam_enabled,
        };
        *flag = !*flag;
        let enabled = *flag;
        self.media.set_track_enabled(&stream, kind, enabled);
        enabled
    }

    // Relay signals

    async fn on_relay_signal(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::Incoming(payload) => self.on_incoming(payload).await,
            InboundSignal::Accepted(payload) => self.on_accepted(payload.peer_id),
            InboundSignal::Ended => {
                if self.session.phase.is_idle() {
                    debug!(target: "Call/Worker", "Ignoring call:ended with no live session");
                    return;
                }
                if let Err(e) = self.finish(CallTransition::RemoteEnded, false, None).await {
                    warn!(target: "Call/Worker", "Failed to end session: {e}");
                }
            }
        }
    }

    async fn on_incoming(&mut self, payload: IncomingPayload) {
        let from_remote = self
            .session
            .remote
            .as_ref()
            .is_some_and(|remote| remote.id == payload.sender_id);
        if self.session.phase.is_live() && from_remote {
            // A busy reply would end the caller's side of this very session
            debug!(
                target: "Call/Worker",
                "Ignoring repeated call:incoming from {}", payload.sender_id
            );
            return;
        }

        if self.session.phase.is_live() {
            info!(
                target: "Call/Worker",
                "Busy, turning away call from {}", payload.sender_id
            );
            if let Err(e) = self
                .relay
                .emit(OutboundSignal::end(&payload.sender_id))
                .await
            {
                warn!(target: "Call/Worker", "Failed to send busy reply: {e}");
            }
            self.events.notify(CallNotice::Busy {
                caller_id: payload.sender_id,
            });
            return;
        }

        let remote = Participant::new(payload.sender_id, payload.sender_name);
        if let Err(e) = self.begin(CallDirection::Incoming, remote, CallTransition::OfferReceived) {
            warn!(target: "Call/Worker", "Cannot ring: {e}");
            return;
        }
        self.session.remote_identifier = Some(payload.peer_id);
        self.arm_timer(Timer::Ring);
    }

    fn on_accepted(&mut self, peer_id: PeerId) {
        if self.session.phase != CallPhase::Outgoing {
            debug!(
                target: "Call/Worker",
                "Ignoring call:accepted in {:?}", self.session.phase
            );
            return;
        }

        self.session.remote_identifier = Some(peer_id.clone());
        if !self.session.has_local_stream() || !self.session.start_signaled {
            debug!(target: "Call/Worker", "Local media not ready, holding call:accepted");
            self.session.pending_accept = Some(peer_id);
            return;
        }
        self.connect_outgoing(peer_id);
    }

    fn on_peer_offer(&mut self, offer: IncomingOffer) {
        let expected = self.session.phase == CallPhase::Incoming
            && self.session.remote_identifier.as_ref() == Some(&offer.from);
        if !expected {
            debug!(
                target: "Call/Worker",
                "Declining offer {} from {} in {:?}", offer.offer_id, offer.from, self.session.phase
            );
            self.peer.decline(offer);
            return;
        }

        if self.session.accepting && self.session.has_local_stream() {
            self.answer(offer);
        } else if let Some(previous) = self.session.pending_offer.replace(offer) {
            self.peer.decline(previous);
        }
    }

    // Background work

    fn initialize_identity(&self) {
        let commands = self.commands.clone();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            match identity.initialize().await {
                Ok(id) => {
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::IdentityAssigned(id));
                    }
                }
                Err(e) => {
                    warn!(target: "Call/Identity", "Eager identifier request failed: {e}");
                }
            }
        });
    }

    /// Acquire local media and make sure the identifier is assigned.
    fn prepare(&self) {
        let commands = self.commands.clone();
        let epoch = self.session.epoch;
        let media = self.media.clone();
        let identity = self.identity.clone();
        let constraints = self.config.constraints;

        tokio::spawn(async move {
            let result = prepare_local(&media, &identity, constraints).await;
            let Some(commands) = commands.upgrade() else {
                if let Ok((stream, _)) = result {
                    media.release(Some(&stream));
                }
                return;
            };
            if let Err(SendError(Command::Prepared {
                result: Ok((stream, _)),
                ..
            })) = commands.send(Command::Prepared { epoch, result })
            {
                media.release(Some(&stream));
            }
        });
    }

    async fn on_prepared(
        &mut self,
        epoch: u64,
        result: Result<(CaptureHandle, PeerId), CallError>,
    ) {
        let awaiting = epoch == self.session.epoch
            && !self.session.has_local_stream()
            && match self.session.phase {
                CallPhase::Outgoing => true,
                CallPhase::Incoming => self.session.accepting,
                _ => false,
            };
        if !awaiting {
            debug!(target: "Call/Worker", "Discarding stale media for epoch {epoch}");
            if let Ok((stream, _)) = result {
                self.media.release(Some(&stream));
            }
            return;
        }

        let (stream, local_id) = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                self.on_prepare_failed(e).await;
                return;
            }
        };
        self.session.local_stream = Some(stream);

        let Some(remote) = self.session.remote.clone() else {
            return;
        };
        let signal = match self.session.phase {
            CallPhase::Outgoing => {
                OutboundSignal::start(&remote.id, &self.config.display_name, &local_id)
            }
            _ => OutboundSignal::accept(&remote.id, &local_id),
        };

        if let Err(e) = self.relay.emit(signal).await {
            warn!(target: "Call/Worker", "Could not reach {}: {e}", remote.id);
            let transition = match self.session.phase {
                CallPhase::Outgoing => CallTransition::LocalCancel,
                _ => CallTransition::LocalReject,
            };
            let _ = self
                .finish(transition, false, Some(CallNotice::RelayUnavailable))
                .await;
            return;
        }

        if self.session.phase == CallPhase::Outgoing {
            self.session.start_signaled = true;
            self.arm_timer(Timer::Ring);
            if let Some(peer_id) = self.session.pending_accept.take() {
                self.connect_outgoing(peer_id);
            }
        } else if let Some(offer) = self.session.pending_offer.take() {
            self.answer(offer);
        }
    }

    async fn on_prepare_failed(&mut self, error: CallError) {
        let notice = match &error {
            CallError::MediaUnavailable(reason) => CallNotice::MediaUnavailable {
                reason: reason.clone(),
            },
            other => CallNotice::NegotiationFailed {
                error: other.clone(),
            },
        };

        // The remote only needs telling if it already knows about us
        let notify_remote = match self.session.phase {
            CallPhase::Outgoing => self.session.pending_accept.is_some(),
            _ => true,
        };

        if let Err(e) = self
            .finish(CallTransition::MediaFailed, notify_remote, Some(notice))
            .await
        {
            warn!(target: "Call/Worker", "Failed to abort session: {e}");
        }
    }

    fn connect_outgoing(&mut self, remote_id: PeerId) {
        if let Err(e) = self.transition(CallTransition::RemoteAccepted) {
            warn!(target: "Call/Worker", "Cannot connect: {e}");
            return;
        }
        abort(&mut self.ring_timer);

        let Some(local) = self.session.local_stream.clone() else {
            return;
        };
        let peer = self.peer.clone();
        self.negotiate(async move { peer.initiate(&remote_id, local).await });
    }

    fn answer(&mut self, offer: IncomingOffer) {
        if let Err(e) = self.transition(CallTransition::OfferAnswered) {
            warn!(target: "Call/Worker", "Cannot answer offer {}: {e}", offer.offer_id);
            self.peer.decline(offer);
            return;
        }

        let Some(local) = self.session.local_stream.clone() else {
            return;
        };
        let peer = self.peer.clone();
        self.negotiate(async move { peer.answer(offer, local).await });
    }

    fn negotiate<F>(&mut self, negotiation: F)
    where
        F: Future<Output = Result<CaptureHandle, CallError>> + Send + 'static,
    {
        let commands = self.commands.clone();
        let epoch = self.session.epoch;
        let task = tokio::spawn(async move {
            let result = negotiation.await;
            let Some(commands) = commands.upgrade() else {
                if let Ok(remote) = result {
                    remote.stop();
                }
                return;
            };
            if let Err(SendError(Command::Negotiated {
                result: Ok(remote), ..
            })) = commands.send(Command::Negotiated { epoch, result })
            {
                remote.stop();
            }
        });
        self.negotiation = Some(task.abort_handle());
        self.arm_timer(Timer::Negotiation);
    }

    async fn on_negotiated(&mut self, epoch: u64, result: Result<CaptureHandle, CallError>) {
        let awaiting = epoch == self.session.epoch
            && self.session.phase == CallPhase::Active
            && self.session.remote_stream.is_none();
        if !awaiting {
            debug!(target: "Call/Worker", "Discarding stale negotiation for epoch {epoch}");
            if let Ok(remote) = result {
                remote.stop();
            }
            return;
        }

        self.negotiation = None;
        abort(&mut self.negotiation_timer);

        match result {
            Ok(remote) => {
                info!(target: "Call/Worker", "Remote stream {} connected", remote.id());
                self.session.remote_stream = Some(remote);
            }
            Err(e) => {
                warn!(target: "Call/Worker", "Peer channel failed: {e}");
                let notice = CallNotice::NegotiationFailed { error: e };
                if let Err(e) = self
                    .finish(CallTransition::NegotiationFailed, true, Some(notice))
                    .await
                {
                    warn!(target: "Call/Worker", "Failed to end session: {e}");
                }
            }
        }
    }

    fn arm_timer(&mut self, timer: Timer) {
        let timeout = match timer {
            Timer::Ring => self.config.ring_timeout,
            Timer::Negotiation => self.config.negotiation_timeout,
        };
        let Some(timeout) = timeout else {
            return;
        };
        let commands = self.commands.clone();
        let epoch = self.session.epoch;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimerFired { epoch, timer });
            }
        });

        let slot = match timer {
            Timer::Ring => &mut self.ring_timer,
            Timer::Negotiation => &mut self.negotiation_timer,
        };
        if let Some(previous) = slot.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn on_timer(&mut self, epoch: u64, timer: Timer) {
        if epoch != self.session.epoch {
            return;
        }

        let (armed, notice) = match timer {
            Timer::Ring => {
                let ringing = match self.session.phase {
                    CallPhase::Outgoing => self.session.start_signaled,
                    CallPhase::Incoming => !self.session.accepting,
                    _ => false,
                };
                let notice = self
                    .session
                    .remote
                    .clone()
                    .map(|remote| CallNotice::NoAnswer { remote });
                (ringing, notice)
            }
            Timer::Negotiation => (
                self.session.phase == CallPhase::Active && self.session.remote_stream.is_none(),
                Some(CallNotice::NegotiationFailed {
                    error: CallError::NegotiationTimeout,
                }),
            ),
        };
        if !armed {
            return;
        }

        info!(target: "Call/Worker", "{timer:?} timer expired");
        if let Err(e) = self.finish(CallTransition::TimedOut, true, notice).await {
            warn!(target: "Call/Worker", "Failed to end session: {e}");
        }
    }

    // Session bookkeeping

    fn begin(
        &mut self,
        direction: CallDirection,
        remote: Participant,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let from = self.session.phase;
        let remote_id = remote.id.clone();
        self.session.begin(direction, remote, transition)?;
        info!(
            target: "Call/Worker",
            "Session {} {:?} with {remote_id}", self.session.epoch, direction
        );
        self.events.phase(self.session.epoch, from, self.session.phase);
        Ok(())
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let from = self.session.apply_transition(transition)?;
        if from != self.session.phase {
            debug!(
                target: "Call/Worker",
                "{from:?} -> {:?} on {transition:?}", self.session.phase
            );
            self.events.phase(self.session.epoch, from, self.session.phase);
        }
        Ok(())
    }

    /// End the live session through `transition`.
    ///
    /// Resources are released first, then `call:end` is sent when
    /// `notify_remote` is set, then notices go out and the session resets.
    async fn finish(
        &mut self,
        transition: CallTransition,
        notify_remote: bool,
        notice: Option<CallNotice>,
    ) -> Result<(), CallError> {
        self.session.phase.next(transition)?;
        let remote = self.session.remote.clone();

        self.release_resources();
        self.transition(transition)?;

        if notify_remote
            && let Some(remote) = &remote
            && let Err(e) = self.relay.emit(OutboundSignal::end(&remote.id)).await
        {
            warn!(target: "Call/Worker", "Failed to send call:end to {}: {e}", remote.id);
        }

        if self.session.phase == CallPhase::Ending {
            self.transition(CallTransition::CleanupComplete)?;
        }

        if let Some(notice) = notice {
            self.events.notify(notice);
        }
        if let Some(remote) = remote {
            info!(target: "Call/Worker", "Session {} with {} ended", self.session.epoch, remote.id);
            self.events.notify(CallNotice::CallEnded {
                remote,
                by_remote: transition == CallTransition::RemoteEnded,
            });
        }

        self.session.reset();
        Ok(())
    }

    fn release_resources(&mut self) {
        abort(&mut self.ring_timer);
        abort(&mut self.negotiation_timer);
        abort(&mut self.negotiation);

        self.media.release(self.session.local_stream.take().as_ref());
        if let Some(remote) = self.session.remote_stream.take() {
            remote.stop();
        }
        if let Some(offer) = self.session.pending_offer.take() {
            self.peer.decline(offer);
        }
        self.session.pending_accept = None;
    }

    async fn shutdown(&mut self) {
        let transition = match self.session.phase {
            CallPhase::Outgoing => Some(CallTransition::LocalCancel),
            CallPhase::Incoming => Some(CallTransition::LocalReject),
            CallPhase::Active => Some(CallTransition::LocalEnd),
            CallPhase::Idle | CallPhase::Ending => None,
        };
        if let Some(transition) = transition
            && let Err(e) = self.finish(transition, true, None).await
        {
            warn!(target: "Call/Worker", "Failed to end session on shutdown: {e}");
        }
        self.relay.disconnect().await;
    }

    /// Publish the settled session before answering, so the caller observes
    /// the intent's effects.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T, CallError>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot(self.identity.current());
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn abort(slot: &mut Option<AbortHandle>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

async fn prepare_local(
    media: &MediaGuard,
    identity: &IdentityRegistry,
    constraints: MediaConstraints,
) -> Result<(CaptureHandle, PeerId), CallError> {
    let (stream, id) = tokio::join!(media.acquire(constraints), identity.initialize());
    let stream = scopeguard::guard(stream?, |stream| media.release(Some(&stream)));
    let id = id?;
    Ok((scopeguard::ScopeGuard::into_inner(stream), id))
}
