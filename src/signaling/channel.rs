//! Abstraktion des Signaling-Kanals
//!
//! Eine Call-Session braucht nur `send` und einen Empfänger für
//! eingehende Nachrichten. Der Kanal gehört der Anwendung und wird
//! von mehreren Anrufen nacheinander genutzt.

use super::messages::SignalMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("Failed to encode message: {0}")]
    Serialization(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events, die ein Signaling-Kanal auslöst
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung erfolgreich
    Registered { peer_id: String },

    /// Nachricht eines anderen Teilnehmers
    Message(SignalMessage),

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Bidirektionaler Transport für Signaling-Nachrichten
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sendet eine Nachricht an `message.target()`
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Empfänger für alle eingehenden Events
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    fn is_connected(&self) -> bool;
}
