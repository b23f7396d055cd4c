//! ARI command client
//!
//! Thin typed wrappers over the ARI HTTP verbs the engine uses. One
//! `AriClient` is shared by every call; reqwest pools the connections.
//! Every verb carries an explicit deadline so a wedged PBX can never
//! stall a coordinator.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::{AriError, Result};
use crate::models::{Bridge, Channel, Playback};

/// Connection settings for the ARI endpoint
#[derive(Debug, Clone)]
pub struct AriConfig {
    /// Base URL, e.g. `http://127.0.0.1:8088`
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name to subscribe as
    pub app: String,
    /// Per-verb deadline
    pub request_timeout: Duration,
}

impl AriConfig {
    /// URL of the events WebSocket for this configuration
    pub fn events_url(&self) -> String {
        let ws_base = self
            .base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!(
            "{}/ari/events?app={}&api_key={}:{}",
            ws_base, self.app, self.username, self.password
        )
    }
}

/// Shared ARI HTTP client
#[derive(Debug, Clone)]
pub struct AriClient {
    http: reqwest::Client,
    config: AriConfig,
}

impl AriClient {
    pub fn new(config: AriConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AriError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn app(&self) -> &str {
        &self.config.app
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ari{}", self.config.base_url, path)
    }

    async fn execute(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = req
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AriError::Timeout(self.config.request_timeout)
                } else {
                    AriError::Transport(format!("{what}: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, what, "ARI verb failed: {body}");
        Err(match status.as_u16() {
            401 | 403 => AriError::Unauthorized(format!("{what}: {body}")),
            404 => AriError::NotFound(format!("{what}: {body}")),
            409 | 412 | 422 => AriError::StateConflict(format!("{what}: {body}")),
            _ => AriError::Protocol(format!("{what}: {status} {body}")),
        })
    }

    /// Verify credentials and reachability (used at startup)
    pub async fn ping(&self) -> Result<()> {
        self.execute(self.http.get(self.url("/asterisk/info")), "info")
            .await?;
        Ok(())
    }

    pub async fn answer(&self, channel_id: &str) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/channels/{channel_id}/answer"))),
            "answer",
        )
        .await?;
        Ok(())
    }

    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        match self
            .execute(
                self.http.delete(self.url(&format!("/channels/{channel_id}"))),
                "hangup",
            )
            .await
        {
            // hanging up a channel that is already gone is a success
            Err(AriError::NotFound(_)) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Originate a channel that dials back into our AudioSocket listener
    pub async fn originate_audiosocket(
        &self,
        listen_addr: &str,
        connection_id: &str,
    ) -> Result<Channel> {
        let endpoint = format!("AudioSocket/{listen_addr}/{connection_id}");
        self.originate(&endpoint, &[("originator", "")]).await
    }

    /// Originate an ExternalMedia channel pointed at our RTP socket
    pub async fn originate_external_media(
        &self,
        external_host: &str,
        format: &str,
    ) -> Result<Channel> {
        let url = self.url("/channels/externalMedia");
        let response = self
            .execute(
                self.http.post(url).query(&[
                    ("app", self.config.app.as_str()),
                    ("external_host", external_host),
                    ("format", format),
                    ("encapsulation", "rtp"),
                    ("transport", "udp"),
                    ("direction", "both"),
                ]),
                "externalMedia",
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn originate(&self, endpoint: &str, extra: &[(&str, &str)]) -> Result<Channel> {
        let url = self.url("/channels");
        let mut query: Vec<(&str, &str)> =
            vec![("endpoint", endpoint), ("app", self.config.app.as_str())];
        for (k, v) in extra {
            if !v.is_empty() {
                query.push((k, v));
            }
        }
        let response = self
            .execute(self.http.post(url).query(&query), "originate")
            .await?;
        let channel: Channel = response.json().await?;
        debug!(channel = %channel.id, endpoint, "originated channel");
        Ok(channel)
    }

    pub async fn create_bridge(&self, bridge_type: &str) -> Result<Bridge> {
        let response = self
            .execute(
                self.http
                    .post(self.url("/bridges"))
                    .query(&[("type", bridge_type)]),
                "create_bridge",
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        match self
            .execute(
                self.http.delete(self.url(&format!("/bridges/{bridge_id}"))),
                "destroy_bridge",
            )
            .await
        {
            Err(AriError::NotFound(_)) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
                .query(&[("channel", channel_id)]),
            "add_to_bridge",
        )
        .await?;
        Ok(())
    }

    pub async fn remove_from_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/bridges/{bridge_id}/removeChannel")))
                .query(&[("channel", channel_id)]),
            "remove_from_bridge",
        )
        .await?;
        Ok(())
    }

    /// Start playback of a media URI; returns the playback id to watch
    /// for `PlaybackFinished`
    pub async fn play_media(&self, channel_id: &str, media_uri: &str) -> Result<Playback> {
        let response = self
            .execute(
                self.http
                    .post(self.url(&format!("/channels/{channel_id}/play")))
                    .query(&[("media", media_uri)]),
                "play_media",
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn stop_playback(&self, playback_id: &str) -> Result<()> {
        match self
            .execute(
                self.http
                    .delete(self.url(&format!("/playbacks/{playback_id}"))),
                "stop_playback",
            )
            .await
        {
            Err(AriError::NotFound(_)) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn start_moh(&self, channel_id: &str, moh_class: Option<&str>) -> Result<()> {
        let mut req = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/moh")));
        if let Some(class) = moh_class {
            req = req.query(&[("mohClass", class)]);
        }
        self.execute(req, "start_moh").await?;
        Ok(())
    }

    pub async fn stop_moh(&self, channel_id: &str) -> Result<()> {
        self.execute(
            self.http
                .delete(self.url(&format!("/channels/{channel_id}/moh"))),
            "stop_moh",
        )
        .await?;
        Ok(())
    }

    pub async fn get_variable(&self, channel_id: &str, name: &str) -> Result<Option<String>> {
        let response = self
            .execute(
                self.http
                    .get(self.url(&format!("/channels/{channel_id}/variable")))
                    .query(&[("variable", name)]),
                "get_variable",
            )
            .await;
        match response {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await?;
                Ok(body
                    .get("value")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from))
            }
            Err(AriError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_variable(&self, channel_id: &str, name: &str, value: &str) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/channels/{channel_id}/variable")))
                .query(&[("variable", name), ("value", value)]),
            "set_variable",
        )
        .await?;
        Ok(())
    }

    /// Blind-redirect a channel to a dialplan location via a Local channel
    pub async fn redirect(
        &self,
        channel_id: &str,
        context: &str,
        exten: &str,
        priority: i64,
    ) -> Result<()> {
        let endpoint = format!("Local/{exten}@{context}/n");
        let _ = priority; // Local channels always enter at priority 1
        self.execute(
            self.http
                .post(self.url(&format!("/channels/{channel_id}/redirect")))
                .query(&[("endpoint", endpoint.as_str())]),
            "redirect",
        )
        .await?;
        Ok(())
    }

    /// Hand the channel back to the dialplan at the given location
    pub async fn continue_in_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        exten: &str,
        priority: i64,
    ) -> Result<()> {
        let priority = priority.to_string();
        self.execute(
            self.http
                .post(self.url(&format!("/channels/{channel_id}/continue")))
                .query(&[
                    ("context", context),
                    ("extension", exten),
                    ("priority", priority.as_str()),
                ]),
            "continue_in_dialplan",
        )
        .await?;
        Ok(())
    }

    /// Send DTMF digits down a channel (announcement interactions)
    pub async fn send_dtmf(&self, channel_id: &str, digits: &str) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/channels/{channel_id}/dtmf")))
                .query(&[("dtmf", digits)]),
            "send_dtmf",
        )
        .await?;
        Ok(())
    }

    pub async fn channel_info(&self, channel_id: &str) -> Result<Channel> {
        let response = self
            .execute(
                self.http.get(self.url(&format!("/channels/{channel_id}"))),
                "channel_info",
            )
            .await?;
        Ok(response.json().await?)
    }

    /// Originate a plain dial to an endpoint (attended transfer leg)
    pub async fn originate_dial(
        &self,
        endpoint: &str,
        caller_id: &str,
        variables: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Channel> {
        let timeout = timeout_secs.to_string();
        let url = self.url("/channels");
        let response = self
            .execute(
                self.http
                    .post(url)
                    .query(&[
                        ("endpoint", endpoint),
                        ("app", self.config.app.as_str()),
                        ("callerId", caller_id),
                        ("timeout", timeout.as_str()),
                    ])
                    .json(&json!({ "variables": variables })),
                "originate_dial",
            )
            .await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AriConfig {
        AriConfig {
            base_url: "http://pbx.example:8088".into(),
            username: "arivox".into(),
            password: "secret".into(),
            app: "arivox".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn events_url_swaps_scheme_and_carries_auth() {
        let url = config().events_url();
        assert!(url.starts_with("ws://pbx.example:8088/ari/events?"));
        assert!(url.contains("app=arivox"));
        assert!(url.contains("api_key=arivox:secret"));
    }

    #[test]
    fn client_builds() {
        assert!(AriClient::new(config()).is_ok());
    }
}
