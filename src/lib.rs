//! Pulse Call - P2P Call Session Core
//!
//! Eine Bibliothek für Eins-zu-eins-Anrufe mit:
//! - WebRTC für P2P Audio/Video
//! - WebSocket-Relay als Signaling-Server
//! - Call Controller als Schnittstelle zur UI

pub mod call_engine;
pub mod config;
pub mod controller;
pub mod signaling;

pub use call_engine::{
    CallEngineError, CallEvent, CallInfo, CallSession, CallState, CallType, MediaDevices,
    MediaError, TrackKind, VirtualMediaDevices,
};
pub use config::{CallConfig, ConfigError};
pub use controller::{CallController, CallIntent, CallView, UiEvent};
pub use signaling::{SignalMessage, SignalingChannel, SignalingClient, SignalingError};

use tracing_subscriber::EnvFilter;

/// Initialisiert das Logging
///
/// Ohne `RUST_LOG` gilt `pulse_call=debug,webrtc=warn`. Ein zweiter
/// Aufruf ist wirkungslos.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pulse_call=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
