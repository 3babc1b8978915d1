//! In-Process Relay
//!
//! Verbindet mehrere Teilnehmer ohne Netzwerk. Nachrichten werden wie
//! beim echten Relay anhand von `target` zugestellt.

use super::channel::{SignalingChannel, SignalingError, SignalingEvent};
use super::messages::SignalMessage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

struct Endpoint {
    event_tx: broadcast::Sender<SignalingEvent>,
    online: Arc<AtomicBool>,
}

/// Gemeinsamer Relay für alle Loopback-Kanäle
#[derive(Clone, Default)]
pub struct LoopbackHub {
    peers: Arc<RwLock<HashMap<String, Endpoint>>>,
    capacity: usize,
}

impl LoopbackHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Registriert einen Teilnehmer und gibt seinen Kanal zurück
    pub fn connect(&self, peer_id: &str) -> LoopbackChannel {
        let (event_tx, _) = broadcast::channel(self.capacity.max(1));
        let online = Arc::new(AtomicBool::new(true));

        self.peers.write().insert(
            peer_id.to_string(),
            Endpoint {
                event_tx: event_tx.clone(),
                online: Arc::clone(&online),
            },
        );

        LoopbackChannel {
            peer_id: peer_id.to_string(),
            hub: self.clone(),
            event_tx,
            online,
        }
    }

    fn deliver(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let peers = self.peers.read();
        let endpoint = peers
            .get(message.target())
            .filter(|e| e.online.load(Ordering::SeqCst))
            .ok_or_else(|| SignalingError::UnknownPeer(message.target().to_string()))?;

        // Ohne Empfänger geht die Nachricht verloren, wie beim echten Relay
        let _ = endpoint.event_tx.send(SignalingEvent::Message(message));
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackHub")
            .field("peers", &self.peers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Kanal eines Teilnehmers am `LoopbackHub`
pub struct LoopbackChannel {
    peer_id: String,
    hub: LoopbackHub,
    event_tx: broadcast::Sender<SignalingEvent>,
    online: Arc<AtomicBool>,
}

impl LoopbackChannel {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Simuliert Verbindungsabbruch bzw. Wiederverbindung
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            let event = if online {
                SignalingEvent::Connected
            } else {
                SignalingEvent::Disconnected
            };
            let _ = self.event_tx.send(event);
        }
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.hub.deliver(message)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn hangup(from: &str, target: &str) -> SignalMessage {
        SignalMessage::Hangup {
            from: from.to_string(),
            target: target.to_string(),
            call_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_target() {
        let hub = LoopbackHub::new(16);
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let carol = hub.connect("carol");

        let mut bob_rx = bob.subscribe();
        let mut carol_rx = carol.subscribe();

        let msg = hangup("alice", "bob");
        alice.send(msg.clone()).await.unwrap();

        assert_eq!(bob_rx.recv().await.unwrap(), SignalingEvent::Message(msg));
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_offline_peers() {
        let hub = LoopbackHub::new(16);
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");

        assert_eq!(
            alice.send(hangup("alice", "dave")).await,
            Err(SignalingError::UnknownPeer("dave".to_string()))
        );

        let mut alice_rx = alice.subscribe();
        alice.set_online(false);
        assert_eq!(alice_rx.recv().await.unwrap(), SignalingEvent::Disconnected);
        assert_eq!(
            alice.send(hangup("alice", "bob")).await,
            Err(SignalingError::NotConnected)
        );

        bob.set_online(false);
        alice.set_online(true);
        assert!(matches!(
            alice.send(hangup("alice", "bob")).await,
            Err(SignalingError::UnknownPeer(_))
        ));
    }
}
