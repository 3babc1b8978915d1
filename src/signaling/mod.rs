//! Signaling Module
//!
//! Dieses Modul verwaltet den Austausch von Verbindungsdaten:
//! - Nachrichtenformat für offer / answer / ice-candidate
//! - `SignalingChannel` als Schnittstelle für Call-Sessions
//! - WebSocket-Client für den Relay-Server
//! - In-Process Relay für Tests und lokale Demos
//!

mod channel;
mod client;
mod loopback;
mod messages;

pub use channel::{SignalingChannel, SignalingError, SignalingEvent};
pub use client::SignalingClient;
pub use loopback::{LoopbackChannel, LoopbackHub};
pub use messages::*;
