//! Call Engine Module - WebRTC Session und Media
//!
//! Dieses Modul verwaltet:
//! - Die WebRTC Peer Connection eines Anrufs
//! - Lokale Aufnahme (Mikrofon/Kamera) und Remote-Tracks
//! - Puffer für früh eintreffende ICE Candidates

#[cfg(feature = "system-audio")]
mod audio;
mod candidates;
mod media;
mod session;

#[cfg(feature = "system-audio")]
pub use audio::{MicrophoneCapture, SystemMediaDevices};
pub use candidates::CandidateQueue;
pub use media::{
    CallType, CaptureHandle, LocalMediaStream, LocalTrack, MediaConstraints, MediaDevices,
    MediaError, RemoteMediaStream, RemoteTrack, TrackKind, VirtualMediaDevices, AUDIO_CLOCK_RATE,
    VIDEO_CLOCK_RATE,
};
pub use session::{CallEngineError, CallEvent, CallInfo, CallSession, CallState};
