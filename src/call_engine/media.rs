//! Lokale und entfernte Media-Streams
//!
//! Abstrahiert die Capture-API der Plattform: eine Anfrage mit
//! `{video, audio}` Constraints liefert entweder einen Stream mit
//! passenden Tracks oder schlägt mit `PermissionDenied` bzw.
//! `DeviceUnavailable` fehl.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Sample Rate für Opus
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

// ============================================================================
// CALL TYPE & CONSTRAINTS
// ============================================================================

/// Art des Anrufs, fest ab Session-Start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Video,
    Audio,
}

/// Track-Art eines lokalen oder entfernten Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        }
    }

    fn label(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl TryFrom<RTPCodecType> for TrackKind {
    type Error = RTPCodecType;

    fn try_from(value: RTPCodecType) -> Result<Self, Self::Error> {
        match value {
            RTPCodecType::Audio => Ok(TrackKind::Audio),
            RTPCodecType::Video => Ok(TrackKind::Video),
            other => Err(other),
        }
    }
}

/// Constraints für die Capture-API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    /// Audio ist immer dabei, Video nur bei Video-Calls
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            video: call_type == CallType::Video,
            audio: true,
        }
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Handle auf eine laufende Hardware-Aufnahme
///
/// Wird beim Stoppen des Streams freigegeben, damit Kamera und
/// Mikrofon nicht aktiv bleiben.
pub trait CaptureHandle: Send {
    fn stop(&mut self);

    /// Eingangspegel (0.0 - 1.0)
    fn input_level(&self) -> f32 {
        0.0
    }
}

/// Capture-API der Plattform
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError>;
}

// ============================================================================
// LOCAL TRACKS
// ============================================================================

#[derive(Debug, Default)]
struct TrackFlags {
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// Ein lokal aufgenommener Track
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    flags: Arc<TrackFlags>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind.label(), Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));

        let flags = TrackFlags::default();
        flags.enabled.store(true, Ordering::SeqCst);

        Self {
            id,
            kind,
            rtp,
            flags: Arc::new(flags),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// RTP-Track für `RTCPeerConnection::add_track`
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Schreibt einen encodierten Frame auf den RTP-Track
    ///
    /// Ist der Track stumm geschaltet oder beendet, wird der Frame
    /// verworfen und `Ok(false)` zurückgegeben.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, webrtc::Error> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtp.write_sample(sample).await?;
        Ok(true)
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst) && !self.is_ended()
    }

    /// Mute/Unmute ohne Neuverhandlung
    pub fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.flags.ended.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.flags.ended.store(true, Ordering::SeqCst);
        self.flags.enabled.store(false, Ordering::SeqCst);
    }

    /// Geteiltes Enabled-Flag für Capture-Callbacks
    #[cfg_attr(not(feature = "system-audio"), allow(dead_code))]
    pub(crate) fn enabled_flag(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let flags = Arc::clone(&self.flags);
        move || flags.enabled.load(Ordering::SeqCst) && !flags.ended.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

/// Lokaler Media-Stream (Handle, günstig klonbar)
#[derive(Clone)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
    capture: Arc<Mutex<Option<Box<dyn CaptureHandle>>>>,
}

impl LocalMediaStream {
    /// Erstellt leere Tracks passend zu den Constraints
    pub fn from_constraints(constraints: MediaConstraints) -> Self {
        let id = format!("stream-{}", Uuid::new_v4());
        let mut tracks = Vec::new();

        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &id));
        }

        Self {
            id,
            tracks,
            capture: Arc::new(Mutex::new(None)),
        }
    }

    /// Hängt ein Hardware-Handle an, das beim Stoppen freigegeben wird
    pub fn with_capture(self, capture: Box<dyn CaptureHandle>) -> Self {
        *self.capture.lock() = Some(capture);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    /// Stoppt alle Tracks und gibt die Hardware frei (idempotent)
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }

        if let Some(mut capture) = self.capture.lock().take() {
            capture.stop();
            tracing::info!("Capture for stream {} released", self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_ended)
    }

    pub fn input_level(&self) -> f32 {
        self.capture
            .lock()
            .as_ref()
            .map(|c| c.input_level())
            .unwrap_or(0.0)
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

// ============================================================================
// REMOTE STREAM
// ============================================================================

/// Ein empfangener Remote-Track
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub track: Arc<TrackRemote>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Media des Gegenübers, für die UI nur lesbar
#[derive(Debug, Clone, Default)]
pub struct RemoteMediaStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaStream {
    pub(crate) fn push(&mut self, track: RemoteTrack) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

// ============================================================================
// VIRTUAL DEVICES
// ============================================================================

/// Capture ohne Hardware: liefert Tracks, in die die Anwendung
/// selbst Samples schreibt (Tests, Headless-Betrieb)
#[derive(Debug, Clone)]
pub struct VirtualMediaDevices {
    has_camera: bool,
    failure: Option<MediaError>,
}

impl VirtualMediaDevices {
    pub fn new() -> Self {
        Self {
            has_camera: true,
            failure: None,
        }
    }

    /// Kamera fehlt, Video-Anfragen schlagen fehl
    pub fn without_camera() -> Self {
        Self {
            has_camera: false,
            failure: None,
        }
    }

    /// Jede Anfrage schlägt mit `error` fehl
    pub fn failing(error: MediaError) -> Self {
        Self {
            has_camera: true,
            failure: Some(error),
        }
    }
}

impl Default for VirtualMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for VirtualMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        if constraints.video && !self.has_camera {
            return Err(MediaError::DeviceUnavailable("no camera found".to_string()));
        }

        Ok(LocalMediaStream::from_constraints(constraints))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCapture {
        stopped: Arc<AtomicBool>,
    }

    impl CaptureHandle for FakeCapture {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn input_level(&self) -> f32 {
            0.5
        }
    }

    #[test]
    fn test_constraints_for_call() {
        assert_eq!(
            MediaConstraints::for_call(CallType::Video),
            MediaConstraints { video: true, audio: true }
        );
        assert_eq!(
            MediaConstraints::for_call(CallType::Audio),
            MediaConstraints { video: false, audio: true }
        );
    }

    #[tokio::test]
    async fn test_video_stream_has_audio_and_video() {
        let stream = VirtualMediaDevices::new()
            .get_user_media(MediaConstraints::for_call(CallType::Video))
            .await
            .unwrap();

        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(stream.tracks().iter().all(LocalTrack::is_enabled));
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let devices = VirtualMediaDevices::without_camera();

        let video = devices
            .get_user_media(MediaConstraints::for_call(CallType::Video))
            .await;
        assert!(matches!(video, Err(MediaError::DeviceUnavailable(_))));

        let audio = devices
            .get_user_media(MediaConstraints::for_call(CallType::Audio))
            .await
            .unwrap();
        assert_eq!(audio.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let devices =
            VirtualMediaDevices::failing(MediaError::PermissionDenied("blocked".to_string()));
        let result = devices
            .get_user_media(MediaConstraints::for_call(CallType::Audio))
            .await;
        assert_eq!(
            result.unwrap_err(),
            MediaError::PermissionDenied("blocked".to_string())
        );
    }

    #[test]
    fn test_stop_releases_capture() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stream = LocalMediaStream::from_constraints(MediaConstraints::for_call(CallType::Audio))
            .with_capture(Box::new(FakeCapture {
                stopped: Arc::clone(&stopped),
            }));

        assert_eq!(stream.input_level(), 0.5);
        assert!(!stream.is_stopped());

        let preview = stream.clone();
        stream.stop();
        stream.stop();

        assert!(stopped.load(Ordering::SeqCst));
        assert!(preview.is_stopped());
        assert!(preview.tracks().iter().all(|t| !t.is_enabled()));
        assert_eq!(preview.input_level(), 0.0);
    }

    #[test]
    fn test_toggle_does_not_end_track() {
        let stream = LocalMediaStream::from_constraints(MediaConstraints::for_call(CallType::Audio));
        let track = &stream.tracks()[0];
        let is_enabled = track.enabled_flag();

        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(!is_enabled());
        assert!(!track.is_ended());

        track.set_enabled(true);
        assert!(is_enabled());
    }

    fn opus_frame() -> Sample {
        Sample {
            data: vec![0xf8, 0xff, 0xfe].into(),
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let stream = LocalMediaStream::from_constraints(MediaConstraints::for_call(CallType::Audio));
        let track = &stream.tracks()[0];

        assert!(track.write_sample(&opus_frame()).await.unwrap());

        track.set_enabled(false);
        assert!(!track.write_sample(&opus_frame()).await.unwrap());

        track.set_enabled(true);
        assert!(track.write_sample(&opus_frame()).await.unwrap());

        stream.stop();
        assert!(!track.write_sample(&opus_frame()).await.unwrap());
    }
}
