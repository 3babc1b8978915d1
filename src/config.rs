//! Konfiguration für Call-Sessions und Signaling
//!
//! Alle Werte haben sinnvolle Defaults und können über
//! Umgebungsvariablen überschrieben werden:
//! - `SIGNALING_URL`
//! - `STUN_SERVERS` (komma-separiert)
//! - `HEARTBEAT_SECS`
//! - `REGISTRATION_TIMEOUT_SECS`
//! - `MAX_PENDING_CANDIDATES`

use std::time::Duration;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default Signaling-Server
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

/// Google STUN Server (kostenlos, für ~90% der Verbindungen)
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },

    #[error("Invalid ICE server '{0}': only stun: and stuns: URIs are supported")]
    InvalidIceServer(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Statische Konfiguration, die für alle Sessions gleich bleibt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub signaling_url: String,
    /// STUN URIs. TURN wird nicht unterstützt.
    pub stun_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub registration_timeout: Duration,
    /// Obergrenze für gepufferte Remote-Candidates pro Session
    pub max_pending_candidates: usize,
    /// Kapazität der broadcast-Channels
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(25),
            registration_timeout: Duration::from_secs(10),
            max_pending_candidates: 64,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Lädt die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url.trim().to_string();
        }

        if let Some(servers) = lookup("STUN_SERVERS") {
            config.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = lookup("HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse_number("HEARTBEAT_SECS", &value)?);
        }

        if let Some(value) = lookup("REGISTRATION_TIMEOUT_SECS") {
            config.registration_timeout =
                Duration::from_secs(parse_number("REGISTRATION_TIMEOUT_SECS", &value)?);
        }

        if let Some(value) = lookup("MAX_PENDING_CANDIDATES") {
            config.max_pending_candidates = parse_number("MAX_PENDING_CANDIDATES", &value)? as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft URL und ICE-Server
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket_url()?;

        for server in &self.stun_servers {
            if !(server.starts_with("stun:") || server.starts_with("stuns:")) {
                return Err(ConfigError::InvalidIceServer(server.clone()));
            }
        }

        Ok(())
    }

    /// WebSocket-Endpunkt des Signaling-Servers (`http` → `ws`, Pfad `/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSignalingUrl {
            url: self.signaling_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.signaling_url).map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot change scheme".to_string()))?;

        if !url.path().ends_with("/ws") {
            let path = format!("{}/ws", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }

        Ok(url)
    }

    /// ICE-Server im Format der WebRTC-Konfiguration
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.stun_servers.is_empty() {
            return Vec::new();
        }

        vec![RTCIceServer {
            urls: self.stun_servers.clone(),
            ..Default::default()
        }]
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
