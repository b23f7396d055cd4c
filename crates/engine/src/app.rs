//! Process bootstrap and the global ARI event router
//!
//! One `App` owns the global tasks: the ARI subscription, the transport
//! listeners, the admin server and the provider supervisors. The router
//! loop fans ARI events out to per-call coordinators; a `StasisStart`
//! for an unclaimed channel births a new session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use arivox_ari_client::{subscribe, AriClient, AriConfig, AriEvent};

use crate::admin::{self, AdminState};
use crate::config::{Config, ConfigStore, AudioTransportKind};
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::provider::supervisor::{spawn_supervisors, ProviderHealth};
use crate::session::events::ControlMsg;
use crate::session::registry::SessionRegistry;
use crate::session::{handle_call, SessionDeps};
use crate::tools::{ChannelWatch, ToolRegistry, TransferSignal};
use crate::transport::{AudioSocketServer, PortAllocator};

/// Fatal startup failures mapped to process exit codes
#[derive(Debug)]
pub enum FatalError {
    /// Exit 64: malformed document, unknown provider, missing secret
    Config(String),
    /// Exit 65: a listener could not bind
    Bind(String),
    /// Exit 66: the PBX rejected our credentials
    AriAuth(String),
    /// Exit 1: anything else
    Other(String),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 64,
            FatalError::Bind(_) => 65,
            FatalError::AriAuth(_) => 66,
            FatalError::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalError::Config(detail) => write!(f, "configuration error: {detail}"),
            FatalError::Bind(detail) => write!(f, "bind error: {detail}"),
            FatalError::AriAuth(detail) => write!(f, "ARI authorization error: {detail}"),
            FatalError::Other(detail) => write!(f, "fatal: {detail}"),
        }
    }
}

/// Load config, start every global task, run until shutdown
pub async fn run(config_path: PathBuf) -> Result<(), FatalError> {
    let (config, warnings) =
        Config::load(&config_path).map_err(|e| FatalError::Config(e.to_string()))?;
    for warning in &warnings {
        warn!("config: {warning}");
    }
    let store = Arc::new(ConfigStore::new(config_path, config));
    let config = store.snapshot();

    let metrics = Arc::new(Metrics::new());
    let registry = SessionRegistry::new();
    let watch_map = ChannelWatch::new();
    let tools = Arc::new(ToolRegistry::from_config(&config));
    let provider_health: ProviderHealth = Arc::new(dashmap::DashMap::new());

    // ARI client + credential check
    let ari = AriClient::new(AriConfig {
        base_url: config.asterisk.base_url.clone(),
        username: config.asterisk.username.clone(),
        password: config.asterisk.password.clone(),
        app: config.asterisk.app.clone(),
        request_timeout: Duration::from_millis(config.asterisk.request_timeout_ms),
    })
    .map_err(|e| FatalError::Other(e.to_string()))?;
    match ari.ping().await {
        Ok(()) => info!("ARI endpoint reachable"),
        Err(arivox_ari_client::AriError::Unauthorized(detail)) => {
            return Err(FatalError::AriAuth(detail))
        }
        Err(e) => {
            // a PBX that is briefly down is not fatal; the subscriber
            // will reconnect, but bad credentials would be
            warn!("ARI not reachable at startup: {e}");
        }
    }

    // transports
    let transport_bound = Arc::new(AtomicBool::new(false));
    let (audiosocket, rtp_ports) = match config.audio_transport {
        AudioTransportKind::Audiosocket => {
            let server = AudioSocketServer::bind(&config.audiosocket.listen_addr)
                .await
                .map_err(|e| FatalError::Bind(e.to_string()))?;
            transport_bound.store(true, Ordering::Relaxed);
            (Some(server), None)
        }
        AudioTransportKind::Externalmedia => {
            let ports = PortAllocator::new(config.external_media.clone());
            transport_bound.store(true, Ordering::Relaxed);
            (None, Some(ports))
        }
    };

    spawn_supervisors(&config, provider_health.clone());

    // ARI event subscription
    let subscription = subscribe(AriConfig {
        base_url: config.asterisk.base_url.clone(),
        username: config.asterisk.username.clone(),
        password: config.asterisk.password.clone(),
        app: config.asterisk.app.clone(),
        request_timeout: Duration::from_millis(config.asterisk.request_timeout_ms),
    });
    let ari_connected = subscription.connected.clone();

    // admin server
    let admin_state = Arc::new(AdminState {
        metrics: metrics.clone(),
        store: store.clone(),
        registry: registry.clone(),
        provider_health: provider_health.clone(),
        ari_connected: ari_connected.clone(),
        transport_bound: transport_bound.clone(),
    });
    let admin_bind = config.admin.bind.clone();
    {
        // bind before going async so a busy port is a startup failure
        let listener = tokio::net::TcpListener::bind(&admin_bind)
            .await
            .map_err(|e| FatalError::Bind(format!("admin {admin_bind}: {e}")))?;
        let state = admin_state.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, admin::router(state)).await {
                error!("admin server stopped: {e}");
            }
        });
        info!(addr = %admin_bind, "admin API listening");
    }

    info!("arivox engine up");
    router_loop(
        RouterDeps {
            ari,
            store,
            metrics,
            tools,
            watch_map,
            registry,
            audiosocket,
            rtp_ports,
        },
        subscription,
    )
    .await;
    Ok(())
}

struct RouterDeps {
    ari: AriClient,
    store: Arc<ConfigStore>,
    metrics: Arc<Metrics>,
    tools: Arc<ToolRegistry>,
    watch_map: ChannelWatch,
    registry: Arc<SessionRegistry>,
    audiosocket: Option<Arc<AudioSocketServer>>,
    rtp_ports: Option<Arc<PortAllocator>>,
}

/// Fan ARI events out to sessions until shutdown is requested
async fn router_loop(deps: RouterDeps, mut subscription: arivox_ari_client::EventSubscription) {
    let mut was_connected = *subscription.connected.borrow();
    let mut connected = subscription.connected.clone();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown requested; hanging up {} active calls", deps.registry.len());
                deps.registry.broadcast_with(|| ControlMsg::ForceHangup);
                // give coordinators a moment to tear down cleanly
                tokio::time::sleep(Duration::from_secs(2)).await;
                return;
            }

            changed = connected.changed() => {
                if changed.is_err() {
                    return;
                }
                let now_connected = *connected.borrow();
                if now_connected != was_connected {
                    was_connected = now_connected;
                    if now_connected {
                        info!("ARI reconnected");
                        deps.registry.broadcast_with(|| ControlMsg::AriUp);
                    } else {
                        warn!("ARI disconnected; new calls blocked until reconnect");
                        deps.registry.broadcast_with(|| ControlMsg::AriDown);
                    }
                }
            }

            event = subscription.events.recv() => {
                let Some(event) = event else { return };
                route_event(&deps, event);
            }
        }
    }
}

fn route_event(deps: &RouterDeps, event: AriEvent) {
    match &event {
        AriEvent::StasisStart { channel, .. } => {
            // transfer and media legs are claimed in the watch map and
            // must never spawn a session of their own
            if deps.watch_map.route(&channel.id, TransferSignal::Answered) {
                return;
            }
            if deps.registry.contains(&channel.id) {
                return;
            }
            info!(
                channel = %channel.id,
                caller = %channel.caller.number,
                "incoming call"
            );
            let session_deps = SessionDeps {
                ari: deps.ari.clone(),
                // the call pins the snapshot current at its start
                config: deps.store.snapshot(),
                metrics: deps.metrics.clone(),
                tools: deps.tools.clone(),
                watch: deps.watch_map.clone(),
                registry: deps.registry.clone(),
                audiosocket: deps.audiosocket.clone(),
                rtp_ports: deps.rtp_ports.clone(),
            };
            let channel = channel.clone();
            tokio::spawn(handle_call(session_deps, channel));
        }
        AriEvent::StasisEnd { channel } | AriEvent::ChannelDestroyed { channel, .. } => {
            let channel_id = channel.id.clone();
            if deps.watch_map.route(&channel_id, TransferSignal::Gone) {
                return;
            }
            deps.registry.send(&channel_id, ControlMsg::Ari(event));
        }
        AriEvent::ChannelDtmfReceived { channel, digit, .. } => {
            let channel_id = channel.id.clone();
            let digit_char = digit.chars().next().unwrap_or('?');
            if deps
                .watch_map
                .route(&channel_id, TransferSignal::Digit(digit_char))
            {
                return;
            }
            deps.registry.send(&channel_id, ControlMsg::Ari(event));
        }
        AriEvent::PlaybackFinished { playback } => {
            // target_uri is "channel:<id>" for the playbacks we start
            if let Some(channel_id) = playback.target_uri.strip_prefix("channel:") {
                let channel_id = channel_id.to_string();
                deps.registry.send(&channel_id, ControlMsg::Ari(event));
            }
        }
        other => {
            if let Some(channel_id) = other.channel_id() {
                let channel_id = channel_id.to_string();
                deps.registry.send(&channel_id, ControlMsg::Ari(event));
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

impl From<EngineError> for FatalError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Config(detail) => FatalError::Config(detail),
            EngineError::Transport(detail) if detail.contains("bind") => {
                FatalError::Bind(detail)
            }
            other => FatalError::Other(other.to_string()),
        }
    }
}
