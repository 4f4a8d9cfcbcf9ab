//! Relay frame handler.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::signaling::{AckPayload, InboundSignal, OutboundSignal, ParsedSignal};
use super::worker::Command;
use crate::relay::RelayClient;
use crate::transport::TransportEvent;

/// Reads the relay transport's events, acknowledges delivered frames and
/// forwards the parsed signals to the call worker.
pub struct SignalHandler {
    relay: Arc<RelayClient>,
}

impl SignalHandler {
    pub fn new(relay: Arc<RelayClient>) -> Self {
        Self { relay }
    }

    pub(crate) async fn run(
        self,
        mut events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) {
        let mut reported = false;
        while let Some(event) = events.recv().await {
            self.relay.observe(&event);

            let command = match event {
                TransportEvent::Connected => {
                    debug!(target: "Call/Relay", "Relay connected");
                    continue;
                }
                TransportEvent::FrameReceived(frame) => match self.handle_frame(&frame).await {
                    Some(signal) => Command::Relay(signal),
                    None => continue,
                },
                TransportEvent::Disconnected => {
                    reported = true;
                    Command::RelayDisconnected
                }
            };

            let Some(commands) = commands.upgrade() else {
                debug!(target: "Call/Relay", "Call worker is gone, closing relay handler");
                return;
            };
            if commands.send(command).is_err() || reported {
                return;
            }
        }

        // Event stream closed without a disconnect event
        self.relay.observe(&TransportEvent::Disconnected);
        if !reported && let Some(commands) = commands.upgrade() {
            let _ = commands.send(Command::RelayDisconnected);
        }
    }

    /// Parse one frame and acknowledge it. Malformed frames are dropped.
    async fn handle_frame(&self, frame: &[u8]) -> Option<InboundSignal> {
        let parsed = match ParsedSignal::parse(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "Call/Relay", "Failed to parse relay frame: {e}");
                return None;
            }
        };

        debug!(target: "Call/Relay", "<-- {}", parsed.signal.kind());

        // Acknowledge before dispatch so the relay sees delivery even if the
        // worker turns the signal away
        if let Some(id) = parsed.ack_id
            && let Err(e) = self.relay.emit(OutboundSignal::Ack(AckPayload { id })).await
        {
            warn!(target: "Call/Relay", "Failed to acknowledge frame {id}: {e}");
        }

        Some(parsed.signal)
    }
}
