//! System-Capture über cpal
//!
//! Öffnet das Standard-Mikrofon und hält den Stream, bis der lokale
//! Media-Stream gestoppt wird. Eine Kamera-Anbindung gibt es hier
//! nicht: Video-Anfragen schlagen mit `DeviceUnavailable` fehl.

use super::media::{
    CaptureHandle, LocalMediaStream, MediaConstraints, MediaDevices, MediaError, AUDIO_CLOCK_RATE,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
///
/// Die Samples selbst werden noch nicht encodiert; der Stream hält das
/// Gerät offen und liefert den Eingangspegel.
pub struct MicrophoneCapture {
    stream: Option<Stream>,
    input_level: Arc<Mutex<f32>>,
}

// Stream ist nicht Send. Er wird nur erzeugt, gehalten und gedroppt,
// nie von einem anderen Thread aus benutzt.
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Startet die Aufnahme. `is_enabled` entscheidet pro Callback,
    /// ob der Track gerade stumm geschaltet ist.
    fn start<F>(device: &Device, is_enabled: F) -> Result<Self, MediaError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let config = find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let input_level = Arc::new(Mutex::new(0.0f32));
        let level = Arc::clone(&input_level);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !is_enabled() || data.is_empty() {
                        *level.lock() = 0.0;
                        return;
                    }

                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level.lock() = rms.min(1.0);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| map_device_error(e.to_string()))?;

        stream.play().map_err(|e| map_device_error(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            input_level,
        })
    }
}

impl CaptureHandle for MicrophoneCapture {
    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
        *self.input_level.lock() = 0.0;
    }

    fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

// ============================================================================
// SYSTEM DEVICES
// ============================================================================

/// Capture-API auf Basis des Standard-Audio-Hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMediaDevices;

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        if constraints.video {
            return Err(MediaError::DeviceUnavailable(
                "no camera backend available".to_string(),
            ));
        }

        let stream = LocalMediaStream::from_constraints(constraints);
        if !constraints.audio {
            return Ok(stream);
        }

        let Some(track) = stream.audio_tracks().next() else {
            return Ok(stream);
        };
        let is_enabled = track.enabled_flag();

        // cpal blockiert beim Öffnen des Geräts
        let capture = tokio::task::spawn_blocking(move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".to_string()))?;
            MicrophoneCapture::start(&device, is_enabled)
        })
        .await
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))??;

        Ok(stream.with_capture(Box::new(capture)))
    }
}

// ============================================================================
// DEVICE CONFIG
// ============================================================================

/// Berechtigungsfehler melden die Backends nur als Text
fn map_device_error(message: String) -> MediaError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("not authorized") || lower.contains("denied") {
        MediaError::PermissionDenied(message)
    } else {
        MediaError::DeviceUnavailable(message)
    }
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| map_device_error(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz > andere, F32 > andere
    let target_rate = cpal::SampleRate(AUDIO_CLOCK_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(MediaError::DeviceUnavailable(
        "No suitable f32 audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
