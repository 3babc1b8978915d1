//! Headless Call Agent
//!
//! Verbindet sich mit dem Signaling-Server und ruft entweder einen
//! Teilnehmer an oder nimmt eingehende Anrufe automatisch an.
//!
//! ```text
//! pulse-call <peer-id> [target-peer] [--video]
//! ```

use anyhow::{bail, Context};
use pulse_call::call_engine::MediaDevices;
use pulse_call::{
    init_tracing, CallConfig, CallController, CallIntent, CallType, SignalingChannel,
    SignalingClient, UiEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast;

struct Args {
    peer_id: String,
    target: Option<String>,
    call_type: CallType,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut call_type = CallType::Audio;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--video" => call_type = CallType::Video,
            flag if flag.starts_with("--") => bail!("unknown flag: {}", flag),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let Some(peer_id) = positional.next() else {
        bail!("usage: pulse-call <peer-id> [target-peer] [--video]");
    };

    Ok(Args {
        peer_id,
        target: positional.next(),
        call_type,
    })
}

#[cfg(feature = "system-audio")]
fn media_devices() -> Arc<dyn MediaDevices> {
    Arc::new(pulse_call::call_engine::SystemMediaDevices::new())
}

#[cfg(not(feature = "system-audio"))]
fn media_devices() -> Arc<dyn MediaDevices> {
    tracing::warn!("Built without system-audio, using virtual devices");
    Arc::new(pulse_call::VirtualMediaDevices::new())
}

/// Nächstes UI-Event, `None` erst wenn der Kanal geschlossen ist
async fn next_event(events: &mut broadcast::Receiver<UiEvent>) -> Option<UiEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("UI receiver lagged, {} event(s) skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = parse_args()?;
    let config = CallConfig::from_env().context("invalid configuration")?;

    tracing::info!("Connecting to {} as '{}'...", config.signaling_url, args.peer_id);

    let mut client = SignalingClient::new(config.clone());
    let peer_id = client
        .connect_and_register(args.peer_id)
        .await
        .context("signaling registration failed")?;
    let client = Arc::new(client);
    Arc::clone(&client).start_heartbeat();

    let controller = CallController::new(
        config,
        peer_id,
        Arc::clone(&client) as Arc<dyn SignalingChannel>,
        media_devices(),
    );
    controller.spawn();

    let mut events = controller.subscribe();

    if let Some(target) = args.target {
        let info = controller
            .start_call(target, args.call_type)
            .await
            .context("failed to start call")?;
        tracing::info!("Calling {} (call {})", info.remote_peer, info.call_id);
    } else {
        tracing::info!("Waiting for incoming calls");
    }

    loop {
        tokio::select! {
            event = next_event(&mut events) => {
                let Some(event) = event else {
                    break;
                };
                tracing::info!("{:?}", event);

                match event {
                    UiEvent::IncomingCall { .. } => {
                        if let Err(e) = controller.dispatch(CallIntent::Accept).await {
                            tracing::error!("Failed to accept call: {}", e);
                        }
                    }
                    UiEvent::SignalingLost => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    if controller.view().is_call_active {
        let _ = controller.dispatch(CallIntent::End).await;
    }

    Ok(())
}
