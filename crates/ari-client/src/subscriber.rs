//! ARI event subscription
//!
//! One long-lived WebSocket per process. The subscriber task decodes
//! events onto an mpsc channel and mirrors its connection state onto a
//! watch channel; readiness is false whenever the socket is down. On any
//! failure it reconnects with exponential back-off (2 s initial, 60 s
//! cap, unlimited attempts). Lost events are not replayed; the engine
//! treats a missed StasisEnd as a hangup after a grace window.

use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::client::AriConfig;
use crate::events::{parse_event, AriEvent};

/// Initial reconnect delay
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
/// Reconnect delay cap
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Handle to the running subscription
pub struct EventSubscription {
    /// Decoded events, in arrival order
    pub events: mpsc::Receiver<AriEvent>,
    /// True while the WebSocket is connected and subscribed
    pub connected: watch::Receiver<bool>,
}

/// Spawn the subscriber task and return its receiving ends
///
/// The task runs until the event receiver is dropped.
pub fn subscribe(config: AriConfig) -> EventSubscription {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (state_tx, state_rx) = watch::channel(false);
    tokio::spawn(run(config, event_tx, state_tx));
    EventSubscription {
        events: event_rx,
        connected: state_rx,
    }
}

async fn run(
    config: AriConfig,
    events: mpsc::Sender<AriEvent>,
    state: watch::Sender<bool>,
) {
    let url = config.events_url();
    let mut backoff = BACKOFF_INITIAL;

    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!(app = %config.app, "ARI event WebSocket connected");
                let _ = state.send(true);
                backoff = BACKOFF_INITIAL;

                let (_write, mut read) = stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => match parse_event(&text) {
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    // engine is gone, stop subscribing
                                    let _ = state.send(false);
                                    return;
                                }
                            }
                            Err(e) => warn!("undecodable ARI event: {e}"),
                        },
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(frame)) => {
                            warn!(?frame, "ARI WebSocket closed by peer");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("ARI WebSocket read error: {e}");
                            break;
                        }
                    }
                }
                let _ = state.send(false);
            }
            Err(e) => {
                let _ = state.send(false);
                warn!("ARI WebSocket connect failed: {e}");
            }
        }

        if events.is_closed() {
            return;
        }
        // jitter the delay so a restarted PBX is not hammered in lockstep
        let jitter = rand::thread_rng().gen_range(0..250);
        let delay = backoff + Duration::from_millis(jitter);
        debug!(?delay, "ARI reconnect back-off");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}
