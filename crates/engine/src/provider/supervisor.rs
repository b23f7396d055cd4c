//! Provider health supervision
//!
//! Per-call sessions never reconnect: a mid-call provider failure tears
//! that call down. Between calls, one supervisor task per configured
//! provider probes reachability with back-off and keeps a shared status
//! map the readiness and health endpoints read.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{Config, ProviderConfig};

const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const PROBE_BACKOFF_MAX: Duration = Duration::from_secs(120);

/// Live status of one provider endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStatus {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared provider status map, keyed by provider name
pub type ProviderHealth = Arc<DashMap<String, ProviderStatus>>;

/// Extract `host:port` to probe from a provider URL
fn probe_target(url: &str) -> Option<(String, u16)> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default().or(match parsed.scheme() {
        "ws" => Some(80),
        "wss" => Some(443),
        _ => None,
    })?;
    Some((host, port))
}

async fn probe(config: &ProviderConfig, connect_timeout: Duration) -> Result<(), String> {
    let Some((host, port)) = probe_target(&config.url) else {
        return Err(format!("unprobeable url '{}'", config.url));
    };
    match timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    }
}

/// Spawn one probe task per enabled provider
pub fn spawn_supervisors(config: &Config, health: ProviderHealth) {
    let connect_timeout = Duration::from_millis(config.limits.connection_timeout_ms);
    for (name, provider) in &config.providers {
        if !provider.enabled {
            health.insert(
                name.clone(),
                ProviderStatus {
                    ready: false,
                    last_error: Some("disabled".into()),
                },
            );
            continue;
        }
        let name = name.clone();
        let provider = provider.clone();
        let health = health.clone();
        tokio::spawn(async move {
            let mut backoff = PROBE_INTERVAL;
            loop {
                match probe(&provider, connect_timeout).await {
                    Ok(()) => {
                        debug!(provider = %name, "provider probe ok");
                        health.insert(name.clone(), ProviderStatus { ready: true, last_error: None });
                        backoff = PROBE_INTERVAL;
                        tokio::time::sleep(PROBE_INTERVAL).await;
                    }
                    Err(detail) => {
                        warn!(provider = %name, "provider probe failed: {detail}");
                        health.insert(
                            name.clone(),
                            ProviderStatus {
                                ready: false,
                                last_error: Some(detail),
                            },
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(PROBE_BACKOFF_MAX);
                    }
                }
            }
        });
    }
}

/// Readiness contribution: is the default provider (or every member of
/// the default pipeline) currently reachable?
pub fn default_provider_ready(config: &Config, health: &ProviderHealth) -> bool {
    let ready = |name: &str| {
        health
            .get(name)
            .map(|status| status.ready)
            .unwrap_or(false)
    };
    if config.providers.contains_key(&config.default_provider) {
        return ready(&config.default_provider);
    }
    match config.pipelines.get(&config.default_provider) {
        Some(pipeline) => {
            ready(&pipeline.stt) && ready(&pipeline.llm) && ready(&pipeline.tts)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_targets_from_urls() {
        assert_eq!(
            probe_target("wss://realtime.example/v1"),
            Some(("realtime.example".into(), 443))
        );
        assert_eq!(
            probe_target("ws://10.0.0.5:8765/stt"),
            Some(("10.0.0.5".into(), 8765))
        );
        assert_eq!(
            probe_target("http://llm.local:8000/v1/chat/completions"),
            Some(("llm.local".into(), 8000))
        );
        assert_eq!(probe_target("not a url"), None);
    }

    #[test]
    fn default_provider_readiness_spans_pipelines() {
        let raw = crate::config::minimal_toml().replace(
            "default_provider = \"agent\"",
            "default_provider = \"hybrid\"",
        ) + r#"
            [providers.s]
            kind = "stt"
            url = "ws://s.local"
            [providers.l]
            kind = "llm"
            url = "http://l.local"
            [providers.t]
            kind = "tts"
            url = "http://t.local"
            [pipelines.hybrid]
            stt = "s"
            llm = "l"
            tts = "t"
        "#;
        let config = Config::from_str(&raw).unwrap().0;
        let health: ProviderHealth = Arc::new(DashMap::new());

        assert!(!default_provider_ready(&config, &health));
        for name in ["s", "l", "t"] {
            health.insert(name.into(), ProviderStatus { ready: true, last_error: None });
        }
        assert!(default_provider_ready(&config, &health));
        health.insert("l".into(), ProviderStatus { ready: false, last_error: None });
        assert!(!default_provider_ready(&config, &health));
    }
}
