/// Tokio-based WebSocket transport for the peer-call signaling relay
///
/// This crate provides the relay byte-transport seam (`Transport`,
/// `TransportFactory`) and a concrete implementation over tokio-tungstenite.
/// One relay message travels in one WebSocket text frame.
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A complete frame has been received from the relay.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active relay connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame to the relay.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const FRAME_MAX_SIZE: usize = 64 * 1024;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
    is_connected: AtomicBool,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
            is_connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        if frame.len() >= FRAME_MAX_SIZE {
            return Err(anyhow::anyhow!(
                "Frame is too large (max: {}, got: {})",
                FRAME_MAX_SIZE,
                frame.len()
            ));
        }

        let text = std::str::from_utf8(frame)
            .map_err(|e| anyhow::anyhow!("Relay frames must be UTF-8 JSON: {}", e))?;

        debug!("--> Sending relay frame: {} bytes", frame.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.is_connected.swap(false, Ordering::SeqCst) {
            if let Some(mut sink) = self.ws_sink.lock().await.take() {
                let _ = sink.close().await;
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports to one relay URL.
///
/// The URL identifies the authenticated user to the relay (for example a
/// `?token=` query); authentication itself happens outside this crate.
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    /// Create a new factory for the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing relay {}", self.url);

        let (client, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() || msg.is_binary() {
                    let data = msg.into_data();
                    debug!("<-- Received relay frame: {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::FrameReceived(data))
                        .await
                        .is_err()
                    {
                        warn!("Event receiver dropped, closing read pump");
                        break;
                    }
                } else if msg.is_close() {
                    trace!("Received close frame");
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
                if ws.send(msg).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_frames_round_trip_through_relay() {
        let url = spawn_echo_server().await;
        let factory = TokioWebSocketTransportFactory::new(url);
        let (transport, mut events) = factory.create_transport().await.unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Connected)));

        let frame = br#"{"event":"call:end","data":{"otherUserId":"bob"}}"#;
        transport.send_frame(frame).await.unwrap();

        match events.recv().await {
            Some(TransportEvent::FrameReceived(data)) => assert_eq!(&data[..], &frame[..]),
            other => panic!("expected echoed frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let url = spawn_echo_server().await;
        let factory = TokioWebSocketTransportFactory::new(url);
        let (transport, _events) = factory.create_transport().await.unwrap();

        transport.disconnect().await;
        assert!(transport.send_frame(b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_non_utf8_frames_are_rejected() {
        let url = spawn_echo_server().await;
        let factory = TokioWebSocketTransportFactory::new(url);
        let (transport, _events) = factory.create_transport().await.unwrap();

        assert!(transport.send_frame(&[0xff, 0xfe]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = TokioWebSocketTransportFactory::new(format!("ws://{addr}"));
        assert!(factory.create_transport().await.is_err());
    }
}
