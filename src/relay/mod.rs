//! Signaling relay client.
//!
//! A thin handle over one relay transport. Outbound signals are encoded and
//! written as single frames; inbound frames are handed to
//! [`SignalHandler`](crate::calls::SignalHandler) through the transport's
//! event receiver.

mod memory;

pub use memory::{MemoryRelay, MemoryTransportFactory};

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::calls::{CallError, OutboundSignal};
use crate::transport::{Transport, TransportEvent, TransportFactory};

pub struct RelayClient {
    transport: Arc<dyn Transport>,
    connected: AtomicBool,
}

impl RelayClient {
    /// Open a relay connection through `factory`.
    pub async fn connect(
        factory: &dyn TransportFactory,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), CallError> {
        let (transport, events) = factory.create_transport().await.map_err(|e| {
            warn!(target: "Call/Relay", "Relay connection failed: {e}");
            CallError::Transport(e.to_string())
        })?;
        info!(target: "Call/Relay", "Relay transport created");

        let client = Arc::new(Self {
            transport,
            connected: AtomicBool::new(true),
        });
        Ok((client, events))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Track connectivity from the transport's event stream.
    pub(crate) fn observe(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            TransportEvent::Disconnected => self.connected.store(false, Ordering::SeqCst),
            TransportEvent::FrameReceived(_) => {}
        }
    }

    /// Send one signal. Fails without retrying when the relay is unreachable.
    pub async fn emit(&self, signal: OutboundSignal) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::RelayUnavailable);
        }

        let frame = signal.encode()?;
        debug!(target: "Call/Relay", "--> {}", signal.kind());
        if let Err(e) = self.transport.send_frame(&frame).await {
            warn!(target: "Call/Relay", "Failed to send {}: {e}", signal.kind());
            return Err(CallError::RelayUnavailable);
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(target: "Call/Relay", "Disconnecting from relay");
        }
        self.transport.disconnect().await;
    }
}
