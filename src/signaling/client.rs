//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Registrierung mit der eigenen Peer-ID
//! - Heartbeat-Keeping
//! - Weiterleitung eingehender Frames als `SignalingEvent`

use super::channel::{SignalingChannel, SignalingError, SignalingEvent};
use super::messages::*;
use crate::config::CallConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    config: CallConfig,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: CallConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt die aktuelle Peer-ID zurück (falls registriert)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    /// Verbindet mit dem Signaling-Server und registriert die Peer-ID
    pub async fn connect_and_register(&mut self, peer_id: String) -> Result<String, SignalingError> {
        let ws_url = self
            .config
            .websocket_url()
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(self.config.event_capacity);
        self.tx = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                        Ok(frame) => Self::handle_frame(frame, &state, &event_tx, &reg_tx).await,
                        Err(e) => tracing::warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let payload = RegisterPayload::new(peer_id, Utc::now().timestamp_millis());
        self.send_payload(&payload).await?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(self.config.registration_timeout) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet einen Heartbeat synchron (non-blocking)
    pub fn send_heartbeat_sync(&self) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload = HeartbeatPayload::new(peer_id, Utc::now().timestamp_millis());
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;

        tx.try_send(Self::encode(&payload)?)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Startet einen Heartbeat-Task, der bis zum Verbindungsende läuft
    pub fn start_heartbeat(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                if !self.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = self.send_heartbeat_sync() {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    fn encode<T: serde::Serialize>(payload: &T) -> Result<String, SignalingError> {
        serde_json::to_string(payload).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    async fn send_payload<T: serde::Serialize>(&self, payload: &T) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        tx.send(Self::encode(payload)?)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Frames
    async fn handle_frame(
        frame: InboundFrame,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match frame {
            InboundFrame::Signal(message) => {
                tracing::debug!(
                    "Received {} from {} (call {})",
                    message.event_name(),
                    message.from(),
                    message.call_id()
                );
                let _ = event_tx.send(SignalingEvent::Message(message));
            }

            InboundFrame::Server(ServerMessage::Registered { peer_id }) => {
                tracing::info!("Registered with peer_id {}", peer_id);
                state.write().peer_id = Some(peer_id.clone());
                let _ = reg_tx.send(Ok(peer_id.clone())).await;
                let _ = event_tx.send(SignalingEvent::Registered { peer_id });
            }

            InboundFrame::Server(ServerMessage::Error { code, message }) => {
                tracing::error!("Server error {}: {}", code, message);
                // Bei Registrierungs-Fehlern auch dem reg_tx melden
                let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            InboundFrame::Server(ServerMessage::Pong) => {}
        }
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending {} to {}", message.event_name(), message.target());
        self.send_payload(&message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("signaling_url", &self.config.signaling_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
