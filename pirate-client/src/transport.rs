//! Transport — the reliable, ordered, bidirectional message channel to
//! the coordinator. The reference implementation is a WebSocket client
//! (`tokio-tungstenite`); a `FakeTransport` drives the kernel in tests
//! without opening real sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use pirate_common::wire::{self, WireEnvelope};

use crate::error::{Result, TransportError};

const MAX_BACKOFF_MS: u64 = 30_000;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Connection-state transitions a `Transport` publishes.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Resyncing,
    Failed { reason: String },
}

/// A message the transport failed to decode. Surfaced rather than
/// silently dropped, per the anti-corruption-layer contract.
#[derive(Debug, Clone)]
pub struct DecodeFailureEvent {
    pub raw: String,
    pub reason: String,
}

/// Reliable, ordered, bidirectional message channel to the coordinator.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session-scoped channel. Idempotent: subsequent calls
    /// reconnect.
    async fn connect(&self, session_id: &str, token: &str) -> Result<()>;

    async fn disconnect(&self);

    /// Enqueue an outgoing message. Fails if not currently connected.
    async fn send(&self, envelope: WireEnvelope) -> Result<()>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// WebSocket-backed transport. Frames the wire JSON one object per text
/// frame and reconnects with exponential backoff capped at 30s.
pub struct WsTransport {
    url_base: String,
    outgoing_tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    state_tx: watch::Sender<ConnectionState>,
    incoming_tx: mpsc::UnboundedSender<WireEnvelope>,
    decode_failure_tx: mpsc::UnboundedSender<DecodeFailureEvent>,
    reconnect_attempt: AtomicU32,
}

impl WsTransport {
    /// `url_base` is the coordinator's WebSocket origin, e.g.
    /// `ws://localhost:7878`. The session id and token are appended as
    /// `/ws/{session_id}` with a bearer query parameter on `connect`.
    pub fn new(
        url_base: impl Into<String>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<WireEnvelope>,
        mpsc::UnboundedReceiver<DecodeFailureEvent>,
    ) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (decode_failure_tx, decode_failure_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                url_base: url_base.into(),
                outgoing_tx: Mutex::new(None),
                state_tx,
                incoming_tx,
                decode_failure_tx,
                reconnect_attempt: AtomicU32::new(0),
            },
            incoming_rx,
            decode_failure_rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn connect(&self, session_id: &str, token: &str) -> Result<()> {
        let url = format!("{}/ws/{}?token={}", self.url_base, session_id, token);
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let _ = self.state_tx.send(ConnectionState::Connected);
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        info!(session_id, "transport connected");

        let incoming_tx = self.incoming_tx.clone();
        let decode_failure_tx = self.decode_failure_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match wire::decode(&text) {
                        Ok(envelope) => {
                            let _ = incoming_tx.send(envelope);
                        }
                        Err(e) => {
                            error!(raw = %text, error = %e, "failed to decode inbound frame");
                            let _ = decode_failure_tx.send(DecodeFailureEvent {
                                raw: text,
                                reason: e.to_string(),
                            });
                        }
                    },
                    Ok(WsMessage::Close(_)) => {
                        debug!("coordinator closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        });

        let (new_outgoing_tx, mut new_outgoing_rx) = mpsc::unbounded_channel();
        *self.outgoing_tx.lock().unwrap() = Some(new_outgoing_tx);
        tokio::spawn(async move {
            while let Some(msg) = new_outgoing_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self) {
        *self.outgoing_tx.lock().unwrap() = None;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }

    async fn send(&self, envelope: WireEnvelope) -> Result<()> {
        let json = wire::encode(&envelope);
        let guard = self.outgoing_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(WsMessage::Text(json))
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Drives `connect` in a retry loop with exponential backoff capped at
/// 30s, publishing `Reconnecting { attempt }` between tries.
pub async fn connect_with_backoff(
    transport: &WsTransport,
    session_id: &str,
    token: &str,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut attempt = 0u32;
    loop {
        match transport.connect(session_id, token).await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "transport connect failed, backing off");
                let _ = transport
                    .state_tx
                    .send(ConnectionState::Reconnecting { attempt });
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// In-process fake transport for kernel tests: no sockets, a test
/// harness can inject inbound frames and observe outbound ones directly.
pub struct FakeTransport {
    outgoing_tx: mpsc::UnboundedSender<WireEnvelope>,
    state_tx: watch::Sender<ConnectionState>,
    connected: std::sync::atomic::AtomicBool,
}

impl FakeTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WireEnvelope>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                outgoing_tx,
                state_tx,
                connected: std::sync::atomic::AtomicBool::new(false),
            },
            outgoing_rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _session_id: &str, _token: &str) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }

    async fn send(&self, envelope: WireEnvelope) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }
        self.outgoing_tx
            .send(envelope)
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pirate_common::wire::SyncMessage;

    #[tokio::test]
    async fn fake_transport_rejects_send_before_connect() {
        let (transport, _rx) = FakeTransport::new();
        let envelope = WireEnvelope {
            message: SyncMessage::Skip,
            epoch: 0,
            seq: 1,
            timestamp_ms: 0,
        };
        assert!(transport.send(envelope).await.is_err());
    }

    #[tokio::test]
    async fn fake_transport_delivers_after_connect() {
        let (transport, mut rx) = FakeTransport::new();
        transport.connect("session1", "tok").await.unwrap();
        let envelope = WireEnvelope {
            message: SyncMessage::Skip,
            epoch: 0,
            seq: 1,
            timestamp_ms: 0,
        };
        transport.send(envelope.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
    }

    #[tokio::test]
    async fn fake_transport_publishes_connection_state() {
        let (transport, _rx) = FakeTransport::new();
        let mut states = transport.connection_state();
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);
        transport.connect("s", "t").await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Connected);
    }
}
