//! Streaming speech-to-text link for modular pipelines
//!
//! The STT peer is a WebSocket service: caller audio goes up as binary
//! PCM16 frames, transcripts come back as small JSON messages
//! (`{"type": "partial", "text": ...}` / `{"type": "final", ...}`).
//! A `finalize` control message forces the current utterance closed when
//! the engine's endpointer decides the turn is over.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use arivox_media_core::frame::pcm16_to_le_bytes;

use crate::config::ProviderConfig;
use crate::error::{EngineError, ProviderErrorKind, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Transcription output from the STT peer
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    Partial { text: String },
    Final { text: String },
    Error { detail: String },
    Closed,
}

#[derive(Deserialize)]
struct SttMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    message: String,
}

/// A connected STT stream for one call
pub struct SttLink {
    write: WsSink,
    staging: Vec<u8>,
}

impl SttLink {
    pub async fn connect(
        config: &ProviderConfig,
        sample_rate: u32,
        connect_timeout: std::time::Duration,
    ) -> Result<(Self, mpsc::Receiver<SttEvent>)> {
        let mut request = config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| EngineError::provider(ProviderErrorKind::Protocol, e.to_string()))?;
        if !config.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .map_err(|e| EngineError::provider(ProviderErrorKind::Auth, e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| EngineError::provider(ProviderErrorKind::Timeout, "stt connect timed out"))?
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;
        debug!(url = %config.url, "stt connected");

        let (mut write, mut read) = stream.split();
        let start = json!({
            "type": "start",
            "encoding": "pcm16",
            "sample_rate": sample_rate,
            "model": config.model,
        });
        write
            .send(Message::Text(start.to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(msg) = serde_json::from_str::<SttMessage>(&text) else {
                            warn!("undecodable stt message");
                            continue;
                        };
                        let event = match msg.kind.as_str() {
                            "partial" => SttEvent::Partial { text: msg.text },
                            "final" => SttEvent::Final { text: msg.text },
                            "error" => SttEvent::Error { detail: msg.message },
                            _ => continue,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = tx.send(SttEvent::Closed).await;
        });

        Ok((Self { write, staging: Vec::new() }, rx))
    }

    /// Send one frame of caller audio
    pub async fn push_audio(&mut self, samples: &[i16]) -> Result<()> {
        let mut staging = std::mem::take(&mut self.staging);
        pcm16_to_le_bytes(samples, &mut staging);
        let result = self
            .write
            .send(Message::Binary(staging.clone().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()));
        self.staging = staging;
        result
    }

    /// Force the in-progress utterance to finalize
    pub async fn finalize(&mut self) -> Result<()> {
        self.write
            .send(Message::Text(json!({ "type": "finalize" }).to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))
    }

    pub async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
