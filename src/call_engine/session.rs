//! WebRTC Call Session
//!
//! Eine `CallSession` gehört zu genau einem Anrufversuch. Sie besitzt
//! die lokale Aufnahme, genau eine Peer Connection und den Austausch
//! von Offer, Answer und ICE Candidates über den Signaling-Kanal.
//!
//! Zustände: `Idle → Negotiating → Active → Ended`. `stop_call()`
//! führt aus jedem Zustand zurück nach `Idle` und gibt dabei alle
//! Ressourcen frei.
//!
//! Callbacks der Peer Connection halten nur eine `Weak`-Referenz auf
//! den Session-State und vergleichen die Generation. Nach einem
//! Teardown laufen Callbacks der alten Verbindung dadurch ins Leere.

use super::candidates::CandidateQueue;
use super::media::{
    CallType, LocalMediaStream, MediaConstraints, MediaDevices, MediaError, RemoteMediaStream,
    RemoteTrack, TrackKind,
};
use crate::config::CallConfig;
use crate::signaling::{SignalMessage, SignalingChannel, SignalingError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Peer connection already initialized")]
    AlreadyInitialized,

    #[error("Peer connection not initialized")]
    NotInitialized,

    #[error("Local media has not been acquired")]
    NoLocalMedia,

    #[error("Remote description has not been applied")]
    NoRemoteDescription,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session was closed")]
    SessionClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,
}

impl CallEngineError {
    /// Ein fehlgeschlagener Candidate beendet den Anruf nicht
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CallEngineError::Candidate(_))
    }
}

impl From<MediaError> for CallEngineError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => CallEngineError::PermissionDenied(msg),
            MediaError::DeviceUnavailable(msg) => CallEngineError::DeviceUnavailable(msg),
        }
    }
}

impl From<SignalingError> for CallEngineError {
    fn from(err: SignalingError) -> Self {
        CallEngineError::SignalingUnavailable(err.to_string())
    }
}

fn negotiation_error(err: webrtc::Error) -> CallEngineError {
    CallEngineError::Negotiation(err.to_string())
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Keine lokale Media, keine Verhandlung
    Idle,
    /// Lokale Media angehängt, Offer/Answer läuft
    Negotiating,
    /// Verbindung steht, Media fließt
    Active,
    /// Verbindung von außen abgebrochen, Teardown steht aus
    Ended,
}

/// Events die von der Session ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteTrack { track_id: String, kind: TrackKind },
    Error(String),
}

/// Identität eines Anrufversuchs auf dem geteilten Signaling-Kanal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: Uuid,
    pub local_peer: String,
    pub remote_peer: String,
    pub call_type: CallType,
}

impl CallInfo {
    pub fn new(local_peer: String, remote_peer: String, call_type: CallType) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            local_peer,
            remote_peer,
            call_type,
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

struct SessionInner {
    state: CallState,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    local_stream: Option<LocalMediaStream>,
    remote_stream: Option<RemoteMediaStream>,
    candidates: CandidateQueue,
    /// Wird bei jeder neuen Verbindung und jedem Teardown erhöht
    generation: u64,
}

impl SessionInner {
    fn transition(&mut self, new_state: CallState, event_tx: &broadcast::Sender<CallEvent>) {
        if self.state != new_state {
            self.state = new_state;
            let _ = event_tx.send(CallEvent::StateChanged(new_state));
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Media-Session für genau einen Anruf
pub struct CallSession {
    info: CallInfo,
    ice_servers: Vec<RTCIceServer>,
    signaling: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    inner: Arc<Mutex<SessionInner>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Erstellt eine Session. Der Signaling-Kanal muss bereits existieren,
    /// damit gefundene Candidates sofort verschickt werden können.
    pub fn new(
        config: &CallConfig,
        info: CallInfo,
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            info,
            ice_servers: config.ice_servers(),
            signaling,
            devices,
            inner: Arc::new(Mutex::new(SessionInner {
                state: CallState::Idle,
                peer_connection: None,
                local_stream: None,
                remote_stream: None,
                candidates: CandidateQueue::new(config.max_pending_candidates),
                generation: 0,
            })),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn call_id(&self) -> Uuid {
        self.info.call_id
    }

    pub fn call_type(&self) -> CallType {
        self.info.call_type
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    /// Lokale Media angehängt und Verhandlung gestartet
    pub fn is_call_active(&self) -> bool {
        matches!(self.state(), CallState::Negotiating | CallState::Active)
    }

    pub fn local_stream(&self) -> Option<LocalMediaStream> {
        self.inner.lock().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteMediaStream> {
        self.inner.lock().remote_stream.clone()
    }

    pub fn has_peer_connection(&self) -> bool {
        self.inner.lock().peer_connection.is_some()
    }

    pub fn has_remote_description(&self) -> bool {
        self.inner.lock().candidates.is_released()
    }

    /// Anzahl gepufferter Remote-Candidates
    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    pub async fn remote_description(&self) -> Option<RTCSessionDescription> {
        let pc = self.inner.lock().peer_connection.clone()?;
        pc.remote_description().await
    }

    /// Prüft, ob eine Nachricht zu diesem Anruf gehört
    pub fn is_addressed_by(&self, message: &SignalMessage) -> bool {
        message.call_id() == self.info.call_id
            && message.from() == self.info.remote_peer
            && message.target() == self.info.local_peer
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Erstellt die Peer Connection und registriert die Callbacks
    /// für Remote-Tracks, lokale Candidates und Verbindungsstatus.
    pub async fn initialize(&self) -> Result<(), CallEngineError> {
        if self.has_peer_connection() {
            tracing::error!("initialize() called twice for call {}", self.info.call_id);
            return Err(CallEngineError::AlreadyInitialized);
        }

        let pc = self.create_peer_connection().await?;

        let generation = {
            let mut inner = self.inner.lock();
            if inner.peer_connection.is_some() {
                None
            } else {
                inner.generation += 1;
                inner.candidates.reset();
                inner.peer_connection = Some(Arc::clone(&pc));
                Some(inner.generation)
            }
        };

        let Some(generation) = generation else {
            tracing::error!(
                "Concurrent initialize() for call {}, closing duplicate connection",
                self.info.call_id
            );
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close duplicate peer connection: {}", e);
            }
            return Err(CallEngineError::AlreadyInitialized);
        };

        self.setup_peer_connection_handlers(&pc, generation);

        tracing::info!(
            "Peer connection created for call {} ({} -> {})",
            self.info.call_id,
            self.info.local_peer,
            self.info.remote_peer
        );
        Ok(())
    }

    /// Fordert Kamera/Mikrofon an und hängt alle Tracks an die Verbindung
    ///
    /// Schlägt die Aufnahme fehl, bleibt die Session in `Idle` und es
    /// wird nichts signalisiert.
    pub async fn acquire_local_media(&self) -> Result<LocalMediaStream, CallEngineError> {
        let (pc, generation) = {
            let inner = self.inner.lock();
            let pc = inner
                .peer_connection
                .clone()
                .ok_or(CallEngineError::NotInitialized)?;
            if inner.local_stream.is_some() {
                return Err(CallEngineError::InvalidState(
                    "local media already acquired".to_string(),
                ));
            }
            (pc, inner.generation)
        };

        let constraints = MediaConstraints::for_call(self.info.call_type);
        let stream = self
            .devices
            .get_user_media(constraints)
            .await
            .map_err(|e| {
                tracing::warn!("Media acquisition failed for call {}: {}", self.info.call_id, e);
                CallEngineError::from(e)
            })?;

        for track in stream.tracks() {
            if let Err(e) = pc.add_track(track.rtp_track()).await {
                stream.stop();
                return Err(CallEngineError::WebRTC(e.to_string()));
            }
        }

        let committed = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.peer_connection.is_none() {
                Err(CallEngineError::SessionClosed)
            } else if inner.local_stream.is_some() {
                Err(CallEngineError::InvalidState(
                    "local media already acquired".to_string(),
                ))
            } else {
                inner.local_stream = Some(stream.clone());
                inner.transition(CallState::Negotiating, &self.event_tx);
                Ok(())
            }
        };

        if let Err(e) = committed {
            stream.stop();
            return Err(e);
        }

        tracing::info!(
            "Local media attached for call {}: {} track(s)",
            self.info.call_id,
            stream.tracks().len()
        );
        Ok(stream)
    }

    /// Anrufer: erstellt das Offer und setzt es als Local Description
    pub async fn create_offer(&self) -> Result<RTCSessionDescription, CallEngineError> {
        let (pc, generation) = self.negotiation_handle()?;

        let offer = pc.create_offer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;

        self.ensure_current(generation)?;
        Ok(offer)
    }

    /// Angerufener: erstellt das Answer nachdem das Offer gesetzt wurde
    pub async fn create_answer(&self) -> Result<RTCSessionDescription, CallEngineError> {
        let (pc, generation) = self.negotiation_handle()?;
        if !self.has_remote_description() {
            return Err(CallEngineError::NoRemoteDescription);
        }

        let answer = pc.create_answer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;

        self.ensure_current(generation)?;
        Ok(answer)
    }

    /// Setzt das Remote-Offer und gibt das passende Answer zurück
    pub async fn handle_offer(&self, sdp: String) -> Result<RTCSessionDescription, CallEngineError> {
        let (pc, generation) = self.negotiation_handle()?;

        let offer = RTCSessionDescription::offer(sdp).map_err(negotiation_error)?;
        pc.set_remote_description(offer)
            .await
            .map_err(negotiation_error)?;

        self.flush_candidates(&pc, generation).await?;
        self.create_answer().await
    }

    /// Setzt das Answer des Angerufenen als Remote Description
    pub async fn handle_answer(&self, sdp: String) -> Result<(), CallEngineError> {
        let (pc, generation) = {
            let inner = self.inner.lock();
            let pc = inner
                .peer_connection
                .clone()
                .ok_or(CallEngineError::NotInitialized)?;
            (pc, inner.generation)
        };

        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation_error)?;
        pc.set_remote_description(answer)
            .await
            .map_err(negotiation_error)?;

        self.flush_candidates(&pc, generation).await
    }

    /// Fügt einen Remote-Candidate hinzu
    ///
    /// Vor der Remote Description wird gepuffert. Ein Fehler betrifft
    /// nur diesen Candidate (`CallEngineError::Candidate`).
    pub async fn handle_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), CallEngineError> {
        let (pc, candidate) = {
            let mut inner = self.inner.lock();
            let pc = inner
                .peer_connection
                .clone()
                .ok_or(CallEngineError::NotInitialized)?;
            match inner.candidates.offer(candidate) {
                Some(candidate) => (pc, candidate),
                None => {
                    tracing::debug!(
                        "Buffered early ICE candidate for call {} ({} pending)",
                        self.info.call_id,
                        inner.candidates.len()
                    );
                    return Ok(());
                }
            }
        };

        pc.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!("Failed to add ICE candidate: {}", e);
            CallEngineError::Candidate(e.to_string())
        })
    }

    /// Beendet die Session und gibt alle Ressourcen frei
    ///
    /// Idempotent und ohne Fehler: Probleme beim Schließen werden geloggt.
    pub async fn stop_call(&self) {
        if let Some(pc) = self.teardown() {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }
    }

    // ========================================================================
    // LOCAL TRACK CONTROL
    // ========================================================================

    /// Aktiviert/deaktiviert lokale Tracks einer Art ohne Neuverhandlung
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), CallEngineError> {
        let inner = self.inner.lock();
        let stream = inner
            .local_stream
            .as_ref()
            .ok_or(CallEngineError::NoLocalMedia)?;

        let mut found = false;
        for track in stream.tracks().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }

        if !found {
            return Err(CallEngineError::InvalidState(format!(
                "no local {:?} track",
                kind
            )));
        }

        tracing::debug!("Local {:?} enabled: {}", kind, enabled);
        Ok(())
    }

    /// Schaltet lokale Tracks einer Art um und gibt den neuen Status zurück
    pub fn toggle_track(&self, kind: TrackKind) -> Result<bool, CallEngineError> {
        let enabled = {
            let inner = self.inner.lock();
            let stream = inner
                .local_stream
                .as_ref()
                .ok_or(CallEngineError::NoLocalMedia)?;
            stream
                .tracks()
                .iter()
                .find(|t| t.kind() == kind)
                .map(|t| t.is_enabled())
                .ok_or_else(|| CallEngineError::InvalidState(format!("no local {:?} track", kind)))?
        };

        self.set_track_enabled(kind, !enabled)?;
        Ok(!enabled)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallEngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        Ok(Arc::new(pc))
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(&self, pc: &Arc<RTCPeerConnection>, generation: u64) {
        // Connection State Handler
        let weak = Arc::downgrade(&self.inner);
        let event_tx = self.event_tx.clone();
        let call_id = self.info.call_id;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state for call {}: {:?}", call_id, s);

            if let Some(shared) = weak.upgrade() {
                let mut inner = shared.lock();
                if inner.generation == generation {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            if inner.state == CallState::Negotiating {
                                inner.transition(CallState::Active, &event_tx);
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if inner.state != CallState::Ended {
                                inner.transition(CallState::Ended, &event_tx);
                                let _ = event_tx
                                    .send(CallEvent::Error(format!("connection {}", s)));
                            }
                        }
                        RTCPeerConnectionState::Disconnected => {
                            tracing::warn!("Peer connection for call {} disconnected", call_id);
                        }
                        _ => {}
                    }
                }
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let weak = Arc::downgrade(&self.inner);
        let signaling = Arc::clone(&self.signaling);
        let info = self.info.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            let signaling = Arc::clone(&signaling);
            let info = info.clone();

            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!("ICE gathering complete for call {}", info.call_id);
                    return;
                };

                if !is_current(&weak, generation) {
                    return;
                }

                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };

                let message = SignalMessage::IceCandidate {
                    from: info.local_peer.clone(),
                    target: info.remote_peer.clone(),
                    call_id: info.call_id,
                    candidate: init,
                };

                if let Err(e) = signaling.send(message).await {
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
            })
        }));

        // Track Handler (eingehende Media)
        let weak = Arc::downgrade(&self.inner);
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let weak = weak.clone();
            let event_tx = event_tx.clone();

            Box::pin(async move {
                let Ok(kind) = TrackKind::try_from(track.kind()) else {
                    tracing::warn!("Ignoring remote track of unknown kind");
                    return;
                };
                let track_id = track.id().to_string();

                let Some(shared) = weak.upgrade() else {
                    return;
                };

                {
                    let mut inner = shared.lock();
                    if inner.generation != generation || inner.peer_connection.is_none() {
                        tracing::debug!("Ignoring remote track {} after teardown", track_id);
                        return;
                    }

                    inner
                        .remote_stream
                        .get_or_insert_with(RemoteMediaStream::default)
                        .push(RemoteTrack {
                            id: track_id.clone(),
                            kind,
                            track,
                        });
                }

                tracing::info!("Received remote {:?} track {}", kind, track_id);
                let _ = event_tx.send(CallEvent::RemoteTrack { track_id, kind });
            })
        }));
    }

    /// Verbindung für Offer/Answer: braucht Peer Connection und lokale Media
    fn negotiation_handle(&self) -> Result<(Arc<RTCPeerConnection>, u64), CallEngineError> {
        let inner = self.inner.lock();
        let pc = inner
            .peer_connection
            .clone()
            .ok_or(CallEngineError::NotInitialized)?;
        if inner.local_stream.is_none() {
            return Err(CallEngineError::NoLocalMedia);
        }
        Ok((pc, inner.generation))
    }

    fn ensure_current(&self, generation: u64) -> Result<(), CallEngineError> {
        if self.inner.lock().generation == generation {
            Ok(())
        } else {
            Err(CallEngineError::SessionClosed)
        }
    }

    /// Übernimmt gepufferte Candidates nach gesetzter Remote Description
    async fn flush_candidates(
        &self,
        pc: &Arc<RTCPeerConnection>,
        generation: u64,
    ) -> Result<(), CallEngineError> {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Err(CallEngineError::SessionClosed);
            }
            inner.candidates.release()
        };

        if !pending.is_empty() {
            tracing::debug!(
                "Applying {} buffered ICE candidate(s) for call {}",
                pending.len(),
                self.info.call_id
            );
        }

        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }

        Ok(())
    }

    /// Synchroner Teil des Teardowns. Gibt die Verbindung zum Schließen zurück.
    fn teardown(&self) -> Option<Arc<RTCPeerConnection>> {
        let (pc, stream) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.remote_stream = None;
            inner.candidates.reset();
            let pc = inner.peer_connection.take();
            let stream = inner.local_stream.take();
            inner.transition(CallState::Idle, &self.event_tx);
            (pc, stream)
        };

        if let Some(stream) = stream {
            stream.stop();
        }

        if pc.is_some() {
            tracing::info!("Call {} torn down", self.info.call_id);
        }

        pc
    }
}

fn is_current(weak: &Weak<Mutex<SessionInner>>, generation: u64) -> bool {
    weak.upgrade()
        .map(|shared| shared.lock().generation == generation)
        .unwrap_or(false)
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let Some(pc) = self.teardown() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::warn!("Failed to close peer connection: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime on drop, peer connection released without close");
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("info", &self.info)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::VirtualMediaDevices;
    use crate::signaling::LoopbackHub;

    fn test_config() -> CallConfig {
        CallConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        }
    }

    fn session_with(
        hub: &LoopbackHub,
        info: CallInfo,
        devices: VirtualMediaDevices,
    ) -> CallSession {
        let channel = hub.connect(&info.local_peer);
        CallSession::new(&test_config(), info, Arc::new(channel), Arc::new(devices))
    }

    /// Anrufer und Angerufener mit gleicher Call-ID
    fn pair(call_type: CallType) -> (CallSession, CallSession) {
        let hub = LoopbackHub::new(64);
        let caller_info = CallInfo::new("alice".to_string(), "bob".to_string(), call_type);
        let callee_info = CallInfo {
            call_id: caller_info.call_id,
            local_peer: "bob".to_string(),
            remote_peer: "alice".to_string(),
            call_type,
        };

        (
            session_with(&hub, caller_info, VirtualMediaDevices::new()),
            session_with(&hub, callee_info, VirtualMediaDevices::new()),
        )
    }

    fn host_candidate(n: u8) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected() {
        let (caller, _) = pair(CallType::Audio);

        caller.initialize().await.unwrap();
        assert_eq!(
            caller.initialize().await,
            Err(CallEngineError::AlreadyInitialized)
        );
        assert!(caller.has_peer_connection());

        // Nach Teardown ist eine neue Verbindung erlaubt
        caller.stop_call().await;
        assert!(caller.initialize().await.is_ok());
        caller.stop_call().await;
    }

    #[tokio::test]
    async fn test_offer_requires_local_media() {
        let (caller, _) = pair(CallType::Audio);

        assert_eq!(
            caller.create_offer().await.unwrap_err(),
            CallEngineError::NotInitialized
        );

        caller.initialize().await.unwrap();
        assert_eq!(
            caller.create_offer().await.unwrap_err(),
            CallEngineError::NoLocalMedia
        );
        assert_eq!(caller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_media_failure_aborts_setup() {
        let hub = LoopbackHub::new(16);
        let info = CallInfo::new("alice".to_string(), "bob".to_string(), CallType::Video);
        let session = session_with(
            &hub,
            info,
            VirtualMediaDevices::failing(MediaError::PermissionDenied("blocked".to_string())),
        );

        session.initialize().await.unwrap();
        let result = session.acquire_local_media().await;

        assert_eq!(
            result.unwrap_err(),
            CallEngineError::PermissionDenied("blocked".to_string())
        );
        assert_eq!(session.state(), CallState::Idle);
        assert!(!session.is_call_active());
        assert!(session.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_missing_camera_is_device_unavailable() {
        let hub = LoopbackHub::new(16);
        let info = CallInfo::new("alice".to_string(), "bob".to_string(), CallType::Video);
        let session = session_with(&hub, info, VirtualMediaDevices::without_camera());

        session.initialize().await.unwrap();
        assert!(matches!(
            session.acquire_local_media().await,
            Err(CallEngineError::DeviceUnavailable(_))
        ));
        assert_eq!(session.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_video_offer_contains_audio_and_video() {
        let (caller, _) = pair(CallType::Video);
        let mut events = caller.subscribe();

        caller.initialize().await.unwrap();
        let stream = caller.acquire_local_media().await.unwrap();

        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert_eq!(caller.state(), CallState::Negotiating);
        assert!(caller.is_call_active());
        assert_eq!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged(CallState::Negotiating)
        );

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        caller.stop_call().await;
    }

    #[tokio::test]
    async fn test_audio_only_answer_has_no_video() {
        let (caller, callee) = pair(CallType::Audio);

        caller.initialize().await.unwrap();
        caller.acquire_local_media().await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert!(!offer.sdp.contains("m=video"));

        callee.initialize().await.unwrap();
        let local = callee.acquire_local_media().await.unwrap();
        assert_eq!(local.video_tracks().count(), 0);

        let answer = callee.handle_offer(offer.sdp).await.unwrap();
        assert!(answer.sdp.contains("m=audio"));
        assert!(!answer.sdp.contains("m=video"));

        caller.stop_call().await;
        callee.stop_call().await;
    }

    #[tokio::test]
    async fn test_offer_answer_sets_remote_descriptions() {
        let (caller, callee) = pair(CallType::Video);

        caller.initialize().await.unwrap();
        caller.acquire_local_media().await.unwrap();
        callee.initialize().await.unwrap();
        callee.acquire_local_media().await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        let answer = callee.handle_offer(offer.sdp).await.unwrap();
        caller.handle_answer(answer.sdp).await.unwrap();

        assert!(caller.has_remote_description());
        assert!(callee.has_remote_description());
        assert!(caller.remote_description().await.is_some());
        assert!(callee.remote_description().await.is_some());
        assert!(caller.is_call_active());
        assert!(callee.is_call_active());

        caller.stop_call().await;
        callee.stop_call().await;
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered() {
        let (caller, callee) = pair(CallType::Audio);

        caller.initialize().await.unwrap();
        caller.acquire_local_media().await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.initialize().await.unwrap();
        callee.acquire_local_media().await.unwrap();

        for n in 1..=3 {
            callee.handle_ice_candidate(host_candidate(n)).await.unwrap();
        }
        assert_eq!(callee.pending_candidates(), 3);
        assert!(!callee.has_remote_description());

        callee.handle_offer(offer.sdp).await.unwrap();
        assert_eq!(callee.pending_candidates(), 0);
        assert!(callee.has_remote_description());

        caller.stop_call().await;
        callee.stop_call().await;
    }

    #[tokio::test]
    async fn test_candidate_before_initialize() {
        let (_, callee) = pair(CallType::Audio);
        assert_eq!(
            callee.handle_ice_candidate(host_candidate(1)).await,
            Err(CallEngineError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (_, callee) = pair(CallType::Audio);
        callee.initialize().await.unwrap();
        callee.acquire_local_media().await.unwrap();

        assert_eq!(
            callee.create_answer().await.unwrap_err(),
            CallEngineError::NoRemoteDescription
        );
    }

    #[tokio::test]
    async fn test_malformed_offer_is_negotiation_error() {
        let (_, callee) = pair(CallType::Audio);
        callee.initialize().await.unwrap();
        callee.acquire_local_media().await.unwrap();

        let result = callee.handle_offer("not an sdp".to_string()).await;
        assert!(matches!(result, Err(CallEngineError::Negotiation(_))));
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_stop_call_is_idempotent_and_releases_media() {
        let (caller, _) = pair(CallType::Video);

        caller.initialize().await.unwrap();
        let stream = caller.acquire_local_media().await.unwrap();
        caller.create_offer().await.unwrap();

        caller.stop_call().await;
        caller.stop_call().await;

        assert_eq!(caller.state(), CallState::Idle);
        assert!(!caller.has_peer_connection());
        assert!(caller.local_stream().is_none());
        assert!(stream.is_stopped());
        assert!(stream.tracks().iter().all(|t| t.is_ended()));
    }

    #[tokio::test]
    async fn test_hangup_mid_negotiation() {
        let (caller, callee) = pair(CallType::Audio);

        caller.initialize().await.unwrap();
        let stream = caller.acquire_local_media().await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.initialize().await.unwrap();
        callee.acquire_local_media().await.unwrap();
        let answer = callee.handle_offer(offer.sdp).await.unwrap();

        // Auflegen bevor das Answer ankommt
        caller.stop_call().await;

        assert!(stream.is_stopped());
        assert!(!caller.has_peer_connection());
        assert_eq!(
            caller.handle_answer(answer.sdp).await,
            Err(CallEngineError::NotInitialized)
        );
        assert!(caller.remote_stream().is_none());
        assert_eq!(caller.state(), CallState::Idle);

        callee.stop_call().await;
    }

    #[tokio::test]
    async fn test_drop_releases_media() {
        let (caller, _) = pair(CallType::Audio);
        caller.initialize().await.unwrap();
        let stream = caller.acquire_local_media().await.unwrap();

        drop(caller);
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn test_toggle_tracks_in_place() {
        let (caller, _) = pair(CallType::Audio);

        assert_eq!(
            caller.toggle_track(TrackKind::Audio),
            Err(CallEngineError::NoLocalMedia)
        );

        caller.initialize().await.unwrap();
        let stream = caller.acquire_local_media().await.unwrap();

        assert_eq!(caller.toggle_track(TrackKind::Audio), Ok(false));
        assert!(!stream.tracks()[0].is_enabled());
        assert_eq!(caller.toggle_track(TrackKind::Audio), Ok(true));
        assert!(stream.tracks()[0].is_enabled());

        assert!(matches!(
            caller.toggle_track(TrackKind::Video),
            Err(CallEngineError::InvalidState(_))
        ));
        assert!(caller.has_peer_connection());

        caller.stop_call().await;
    }

    #[tokio::test]
    async fn test_message_filtering() {
        let (caller, _) = pair(CallType::Audio);
        let call_id = caller.call_id();

        let answer = |from: &str, target: &str, call_id: Uuid| SignalMessage::Answer {
            from: from.to_string(),
            target: target.to_string(),
            call_id,
            sdp: String::new(),
        };

        assert!(caller.is_addressed_by(&answer("bob", "alice", call_id)));
        assert!(!caller.is_addressed_by(&answer("carol", "alice", call_id)));
        assert!(!caller.is_addressed_by(&answer("bob", "carol", call_id)));
        assert!(!caller.is_addressed_by(&answer("bob", "alice", Uuid::new_v4())));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            CallEngineError::from(MediaError::DeviceUnavailable("busy".to_string())),
            CallEngineError::DeviceUnavailable("busy".to_string())
        );
        assert!(matches!(
            CallEngineError::from(SignalingError::NotConnected),
            CallEngineError::SignalingUnavailable(_)
        ));
        assert!(!CallEngineError::Candidate("x".to_string()).is_fatal());
    }
}
