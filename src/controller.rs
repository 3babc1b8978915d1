//! Call Controller - Schnittstelle zur UI
//!
//! Die UI rendert anhand von `CallView` und schickt Intents
//! (`Accept`, `Reject`, `End`, `ToggleAudio`, `ToggleVideo`).
//! Der Controller leitet eingehende Signaling-Nachrichten an die
//! aktive `CallSession` weiter und meldet Änderungen als `UiEvent`.
//!
//! Es gibt höchstens einen Anruf gleichzeitig. Ein weiteres Offer
//! wird mit `reject {reason: "busy"}` beantwortet.

use crate::call_engine::{
    CallEngineError, CallEvent, CallInfo, CallSession, CallState, CallType, MediaDevices, TrackKind,
};
use crate::config::CallConfig;
use crate::signaling::{SignalMessage, SignalingChannel, SignalingEvent};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

// ============================================================================
// UI CONTRACT
// ============================================================================

/// Benutzeraktionen aus der UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIntent {
    Accept,
    Reject,
    End,
    ToggleAudio,
    ToggleVideo,
}

/// Was die UI zum Rendern braucht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallView {
    pub is_call_active: bool,
    pub is_incoming: bool,
    pub call_type: Option<CallType>,
}

/// Events für die UI
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    IncomingCall { from: String, call_type: CallType },
    StateChanged(CallState),
    /// Beide Seiten haben ihre Descriptions gesetzt
    Negotiated,
    RemoteTrack { kind: TrackKind },
    MediaToggled { kind: TrackKind, enabled: bool },
    CallRejected { by: String, reason: Option<String> },
    CallEnded { by_remote: bool },
    CallFailed { reason: String },
    SignalingLost,
}

// ============================================================================
// INCOMING CALL
// ============================================================================

/// Klingelnder Anruf, für den noch keine Session existiert
#[derive(Debug, Clone)]
struct IncomingCall {
    from: String,
    call_id: Uuid,
    call_type: CallType,
    sdp: String,
    early_candidates: Vec<RTCIceCandidateInit>,
    accepting: bool,
}

impl IncomingCall {
    fn matches(&self, message: &SignalMessage) -> bool {
        message.call_id() == self.call_id && message.from() == self.from
    }
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// Verbindet UI, Signaling-Kanal und Call-Session
pub struct CallController {
    config: CallConfig,
    local_peer: String,
    signaling: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    session: Mutex<Option<Arc<CallSession>>>,
    incoming: Mutex<Option<IncomingCall>>,
    event_tx: broadcast::Sender<UiEvent>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        local_peer: String,
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(Self {
            config,
            local_peer,
            signaling,
            devices,
            session: Mutex::new(None),
            incoming: Mutex::new(None),
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Aktive Session (falls vorhanden)
    pub fn session(&self) -> Option<Arc<CallSession>> {
        self.session.lock().clone()
    }

    pub fn view(&self) -> CallView {
        let session = self.session();
        let incoming_type = self.incoming.lock().as_ref().map(|c| c.call_type);

        CallView {
            is_call_active: session.as_ref().map(|s| s.is_call_active()).unwrap_or(false),
            is_incoming: incoming_type.is_some(),
            call_type: session.map(|s| s.call_type()).or(incoming_type),
        }
    }

    /// Startet die Verarbeitung eingehender Signaling-Events
    ///
    /// Der Task endet, wenn der Controller gedroppt wird oder der
    /// Kanal geschlossen ist.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.signaling.subscribe();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling receiver lagged, {} event(s) skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_signaling_event(event).await;
            }
            tracing::debug!("Signaling loop stopped");
        })
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    /// Führt eine Benutzeraktion aus
    pub async fn dispatch(self: &Arc<Self>, intent: CallIntent) -> Result<(), CallEngineError> {
        match intent {
            CallIntent::Accept => self.accept().await,
            CallIntent::Reject => self.reject().await,
            CallIntent::End => self.end().await,
            CallIntent::ToggleAudio => self.toggle(TrackKind::Audio),
            CallIntent::ToggleVideo => self.toggle(TrackKind::Video),
        }
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        self: &Arc<Self>,
        remote_peer: String,
        call_type: CallType,
    ) -> Result<CallInfo, CallEngineError> {
        tracing::info!("Starting {:?} call to {}", call_type, remote_peer);

        let info = CallInfo::new(self.local_peer.clone(), remote_peer, call_type);
        let session = Arc::new(self.new_session(info.clone()));

        {
            let mut slot = self.session.lock();
            if slot.is_some() || self.incoming.lock().is_some() {
                return Err(CallEngineError::AlreadyInCall);
            }
            *slot = Some(Arc::clone(&session));
        }
        self.watch_session(&session);

        match self.negotiate_outgoing(&session).await {
            Ok(()) => Ok(info),
            Err(e) => {
                tracing::error!("Failed to start call {}: {}", info.call_id, e);
                self.release_session(&session).await;
                let _ = self.event_tx.send(UiEvent::CallFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn negotiate_outgoing(&self, session: &CallSession) -> Result<(), CallEngineError> {
        session.initialize().await?;
        // Scheitert die Aufnahme, wurde noch nichts signalisiert
        session.acquire_local_media().await?;
        let offer = session.create_offer().await?;

        let info = session.info();
        self.signaling
            .send(SignalMessage::Offer {
                from: info.local_peer.clone(),
                target: info.remote_peer.clone(),
                call_id: info.call_id,
                call_type: info.call_type,
                sdp: offer.sdp,
            })
            .await?;

        Ok(())
    }

    /// Nimmt den klingelnden Anruf an
    async fn accept(self: &Arc<Self>) -> Result<(), CallEngineError> {
        let info = {
            let mut incoming = self.incoming.lock();
            let call = incoming
                .as_mut()
                .filter(|c| !c.accepting)
                .ok_or(CallEngineError::NoIncomingCall)?;
            call.accepting = true;
            CallInfo {
                call_id: call.call_id,
                local_peer: self.local_peer.clone(),
                remote_peer: call.from.clone(),
                call_type: call.call_type,
            }
        };

        tracing::info!("Accepting call {} from {}", info.call_id, info.remote_peer);

        let session = Arc::new(self.new_session(info.clone()));
        self.watch_session(&session);

        if let Err(e) = session.initialize().await {
            self.incoming.lock().take();
            return self.fail_incoming(&session, e).await;
        }

        // Ab hier gehen Nachrichten an die Session statt an den Puffer
        let call = {
            let mut slot = self.session.lock();
            let mut incoming = self.incoming.lock();
            match incoming.take() {
                Some(call) if call.call_id == info.call_id => {
                    *slot = Some(Arc::clone(&session));
                    Some(call)
                }
                other => {
                    *incoming = other;
                    None
                }
            }
        };
        let Some(call) = call else {
            tracing::info!("Call {} was cancelled before accept", info.call_id);
            session.stop_call().await;
            return Err(CallEngineError::NoIncomingCall);
        };

        match self.negotiate_incoming(&session, call).await {
            Ok(()) => {
                let _ = self.event_tx.send(UiEvent::Negotiated);
                Ok(())
            }
            Err(e) => self.fail_incoming(&session, e).await,
        }
    }

    async fn negotiate_incoming(
        &self,
        session: &CallSession,
        call: IncomingCall,
    ) -> Result<(), CallEngineError> {
        session.acquire_local_media().await?;

        for candidate in call.early_candidates {
            if let Err(e) = session.handle_ice_candidate(candidate).await {
                tracing::warn!("Dropping early ICE candidate: {}", e);
            }
        }

        let answer = session.handle_offer(call.sdp).await?;

        let info = session.info();
        self.signaling
            .send(SignalMessage::Answer {
                from: info.local_peer.clone(),
                target: info.remote_peer.clone(),
                call_id: info.call_id,
                sdp: answer.sdp,
            })
            .await?;

        Ok(())
    }

    /// Abbruch beim Annehmen: Session aufräumen, Anrufer informieren
    async fn fail_incoming(
        &self,
        session: &Arc<CallSession>,
        error: CallEngineError,
    ) -> Result<(), CallEngineError> {
        tracing::error!("Failed to accept call {}: {}", session.call_id(), error);
        self.release_session(session).await;

        let info = session.info();
        let reject = SignalMessage::Reject {
            from: info.local_peer.clone(),
            target: info.remote_peer.clone(),
            call_id: info.call_id,
            reason: Some(error.to_string()),
        };
        if let Err(e) = self.signaling.send(reject).await {
            tracing::warn!("Failed to notify caller: {}", e);
        }

        let _ = self.event_tx.send(UiEvent::CallFailed {
            reason: error.to_string(),
        });
        Err(error)
    }

    /// Lehnt den klingelnden Anruf ab
    async fn reject(&self) -> Result<(), CallEngineError> {
        let call = self
            .incoming
            .lock()
            .take()
            .ok_or(CallEngineError::NoIncomingCall)?;

        tracing::info!("Rejecting call {} from {}", call.call_id, call.from);

        let reject = SignalMessage::Reject {
            from: self.local_peer.clone(),
            target: call.from,
            call_id: call.call_id,
            reason: None,
        };
        if let Err(e) = self.signaling.send(reject).await {
            tracing::warn!("Failed to send reject: {}", e);
        }

        let _ = self.event_tx.send(UiEvent::CallEnded { by_remote: false });
        Ok(())
    }

    /// Legt auf (oder lehnt ab, wenn nur ein Anruf klingelt)
    async fn end(&self) -> Result<(), CallEngineError> {
        let Some(session) = self.session.lock().take() else {
            if self.incoming.lock().is_some() {
                return self.reject().await;
            }
            return Err(CallEngineError::NoActiveCall);
        };

        tracing::info!("Hanging up call {}", session.call_id());
        session.stop_call().await;

        let info = session.info();
        let hangup = SignalMessage::Hangup {
            from: info.local_peer.clone(),
            target: info.remote_peer.clone(),
            call_id: info.call_id,
        };
        if let Err(e) = self.signaling.send(hangup).await {
            tracing::warn!("Failed to send hangup: {}", e);
        }

        let _ = self.event_tx.send(UiEvent::CallEnded { by_remote: false });
        Ok(())
    }

    /// Mute/Unmute bzw. Kamera an/aus, ohne Neuverhandlung
    fn toggle(&self, kind: TrackKind) -> Result<(), CallEngineError> {
        let session = self.session().ok_or(CallEngineError::NoActiveCall)?;
        let enabled = session.toggle_track(kind)?;
        let _ = self.event_tx.send(UiEvent::MediaToggled { kind, enabled });
        Ok(())
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    /// Verarbeitet Signaling-Events
    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(message) => {
                if message.target() != self.local_peer {
                    tracing::debug!(
                        "Ignoring {} addressed to {}",
                        message.event_name(),
                        message.target()
                    );
                    return;
                }
                self.handle_message(message).await;
            }

            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling channel disconnected");
                let _ = self.event_tx.send(UiEvent::SignalingLost);
            }

            SignalingEvent::Error { code, message } => {
                tracing::error!("Signaling error {}: {}", code, message);
            }

            SignalingEvent::Connected | SignalingEvent::Registered { .. } => {}
        }
    }

    async fn handle_message(&self, message: SignalMessage) {
        let session = self.session().filter(|s| s.is_addressed_by(&message));

        match message {
            SignalMessage::Offer {
                from,
                call_id,
                call_type,
                sdp,
                ..
            } => self.on_offer(from, call_id, call_type, sdp).await,

            SignalMessage::Answer { sdp, .. } => {
                let Some(session) = session else {
                    tracing::debug!("Ignoring answer for unknown call");
                    return;
                };

                match session.handle_answer(sdp).await {
                    Ok(()) => {
                        tracing::info!("Answer applied for call {}", session.call_id());
                        let _ = self.event_tx.send(UiEvent::Negotiated);
                    }
                    Err(e) => self.fail_session(session.call_id(), e.to_string()).await,
                }
            }

            SignalMessage::IceCandidate {
                from,
                call_id,
                candidate,
                ..
            } => {
                if let Some(session) = session {
                    if let Err(e) = session.handle_ice_candidate(candidate).await {
                        tracing::warn!("ICE candidate for call {} rejected: {}", call_id, e);
                    }
                    return;
                }

                let mut incoming = self.incoming.lock();
                match incoming.as_mut() {
                    Some(call) if call.call_id == call_id && call.from == from => {
                        call.early_candidates.push(candidate);
                    }
                    _ => tracing::debug!("Ignoring ICE candidate for unknown call {}", call_id),
                }
            }

            SignalMessage::Reject { from, reason, .. } => {
                let Some(session) = session else {
                    return;
                };
                tracing::info!("Call rejected by {} (reason: {:?})", from, reason);
                self.release_session(&session).await;
                let _ = self
                    .event_tx
                    .send(UiEvent::CallRejected { by: from, reason });
            }

            ref hangup @ SignalMessage::Hangup { .. } => {
                if let Some(session) = session {
                    tracing::info!("Call {} ended by {}", session.call_id(), hangup.from());
                    self.release_session(&session).await;
                    let _ = self.event_tx.send(UiEvent::CallEnded { by_remote: true });
                    return;
                }

                let cancelled = {
                    let mut incoming = self.incoming.lock();
                    if incoming.as_ref().map(|c| c.matches(hangup)).unwrap_or(false) {
                        incoming.take()
                    } else {
                        None
                    }
                };
                if let Some(call) = cancelled {
                    tracing::info!("Incoming call {} cancelled by {}", call.call_id, call.from);
                    let _ = self.event_tx.send(UiEvent::CallEnded { by_remote: true });
                }
            }
        }
    }

    async fn on_offer(&self, from: String, call_id: Uuid, call_type: CallType, sdp: String) {
        let accepted = {
            let busy = self.session.lock().is_some();
            let mut incoming = self.incoming.lock();
            if busy || incoming.is_some() {
                false
            } else {
                *incoming = Some(IncomingCall {
                    from: from.clone(),
                    call_id,
                    call_type,
                    sdp,
                    early_candidates: Vec::new(),
                    accepting: false,
                });
                true
            }
        };

        if accepted {
            tracing::info!("Incoming {:?} call {} from {}", call_type, call_id, from);
            let _ = self.event_tx.send(UiEvent::IncomingCall { from, call_type });
            return;
        }

        tracing::info!("Busy, rejecting call {} from {}", call_id, from);
        let reject = SignalMessage::Reject {
            from: self.local_peer.clone(),
            target: from,
            call_id,
            reason: Some("busy".to_string()),
        };
        if let Err(e) = self.signaling.send(reject).await {
            tracing::warn!("Failed to send busy reject: {}", e);
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn new_session(&self, info: CallInfo) -> CallSession {
        CallSession::new(
            &self.config,
            info,
            Arc::clone(&self.signaling),
            Arc::clone(&self.devices),
        )
    }

    /// Leitet Session-Events an die UI weiter und reagiert auf
    /// abgebrochene Verbindungen
    fn watch_session(self: &Arc<Self>, session: &Arc<CallSession>) {
        let mut events = session.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let call_id = session.call_id();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(controller) = weak.upgrade() else {
                    break;
                };

                match event {
                    CallEvent::StateChanged(state) => {
                        let _ = controller.event_tx.send(UiEvent::StateChanged(state));
                        if state == CallState::Ended {
                            controller
                                .fail_session(call_id, "connection failed".to_string())
                                .await;
                        }
                    }
                    CallEvent::RemoteTrack { kind, .. } => {
                        let _ = controller.event_tx.send(UiEvent::RemoteTrack { kind });
                    }
                    CallEvent::Error(message) => {
                        tracing::warn!("Call {} reported: {}", call_id, message);
                    }
                }
            }
        });
    }

    /// Bricht die aktive Session ab und informiert Gegenüber und UI
    async fn fail_session(&self, call_id: Uuid, reason: String) {
        let session = {
            let mut slot = self.session.lock();
            if slot.as_ref().map(|s| s.call_id() == call_id).unwrap_or(false) {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        tracing::error!("Call {} failed: {}", call_id, reason);
        session.stop_call().await;

        let info = session.info();
        let hangup = SignalMessage::Hangup {
            from: info.local_peer.clone(),
            target: info.remote_peer.clone(),
            call_id,
        };
        if let Err(e) = self.signaling.send(hangup).await {
            tracing::warn!("Failed to send hangup: {}", e);
        }

        let _ = self.event_tx.send(UiEvent::CallFailed { reason });
    }

    /// Entfernt die Session aus dem Slot (falls noch aktiv) und beendet sie
    async fn release_session(&self, session: &Arc<CallSession>) {
        {
            let mut slot = self.session.lock();
            if slot.as_ref().map(|s| Arc::ptr_eq(s, session)).unwrap_or(false) {
                slot.take();
            }
        }
        session.stop_call().await;
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("local_peer", &self.local_peer)
            .field("view", &self.view())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
