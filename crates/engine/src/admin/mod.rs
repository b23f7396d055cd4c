//! Admin HTTP API
//!
//! Bound to localhost. Liveness, readiness, a JSON health snapshot,
//! Prometheus metrics, config reload and per-call force-hangup. This is
//! an operator surface; callers never touch it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::metrics::Metrics;
use crate::provider::supervisor::{default_provider_ready, ProviderHealth};
use crate::session::events::ControlMsg;
use crate::session::registry::SessionRegistry;

/// Shared state behind the admin router
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<ConfigStore>,
    pub registry: Arc<SessionRegistry>,
    pub provider_health: ProviderHealth,
    pub ari_connected: watch::Receiver<bool>,
    pub transport_bound: Arc<AtomicBool>,
}

impl AdminState {
    fn ready(&self) -> bool {
        let config = self.store.snapshot();
        *self.ari_connected.borrow()
            && self.transport_bound.load(Ordering::Relaxed)
            && default_provider_ready(&config, &self.provider_health)
    }
}

/// Build the admin router
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/config/reload", post(reload))
        .route("/calls/{id}/hangup", post(hangup_call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<AdminState>>) -> StatusCode {
    if state.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let config = state.store.snapshot();
    let providers: serde_json::Map<String, serde_json::Value> = state
        .provider_health
        .iter()
        .map(|entry| {
            (
                entry.key().clone(),
                serde_json::to_value(entry.value()).unwrap_or_default(),
            )
        })
        .collect();
    Json(json!({
        "ari_connected": *state.ari_connected.borrow(),
        "transport": match config.audio_transport {
            crate::config::AudioTransportKind::Audiosocket => "audiosocket",
            crate::config::AudioTransportKind::Externalmedia => "externalmedia",
        },
        "active_calls": state.registry.len(),
        "providers": providers,
    }))
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn reload(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.store.reload() {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => {
            warn!("config reload rejected: {e}");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "applied": false,
                    "restart_required": [],
                    "warnings": [e.to_string()],
                })),
            )
        }
    }
}

async fn hangup_call(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.registry.send(&id, ControlMsg::ForceHangup) {
        info!(channel = %id, "operator hangup");
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
