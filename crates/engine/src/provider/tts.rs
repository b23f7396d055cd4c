//! Text-to-speech link for modular pipelines
//!
//! Two service shapes exist in the wild and both are supported:
//!
//! - **streaming**: a WebSocket that accepts `speak` messages and
//!   returns raw PCM16 chunks as binary frames, flushed with an `end`
//!   marker per utterance;
//! - **file**: an HTTP service that renders one utterance per request
//!   and responds with a complete WAV body. The playback layer plays
//!   these through the PBX file-playback path.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
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

use arivox_media_core::frame::pcm16_from_le_bytes;

use crate::config::ProviderConfig;
use crate::error::{EngineError, ProviderErrorKind, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Audio produced by the TTS peer
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// A chunk of synthesized PCM16
    Audio { samples: Vec<i16> },
    /// The current utterance is fully synthesized
    UtteranceEnd,
    Error { detail: String },
    Closed,
}

/// A connected streaming TTS session
pub struct TtsStream {
    write: WsSink,
}

impl TtsStream {
    pub async fn connect(
        config: &ProviderConfig,
        sample_rate: u32,
        connect_timeout: std::time::Duration,
    ) -> Result<(Self, mpsc::Receiver<TtsEvent>)> {
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
            .map_err(|_| EngineError::provider(ProviderErrorKind::Timeout, "tts connect timed out"))?
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;
        debug!(url = %config.url, "tts connected");

        let (mut write, mut read) = stream.split();
        let start = json!({
            "type": "start",
            "encoding": "pcm16",
            "sample_rate": sample_rate,
            "voice": config.voice,
        });
        write
            .send(Message::Text(start.to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Binary(bytes)) => match pcm16_from_le_bytes(&bytes) {
                        Ok(samples) => {
                            if tx.send(TtsEvent::Audio { samples }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("bad tts audio payload: {e}"),
                    },
                    Ok(Message::Text(text)) => {
                        let value: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        match value.get("type").and_then(|t| t.as_str()) {
                            Some("end") => {
                                if tx.send(TtsEvent::UtteranceEnd).await.is_err() {
                                    return;
                                }
                            }
                            Some("error") => {
                                let detail = value
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("tts error")
                                    .to_string();
                                if tx.send(TtsEvent::Error { detail }).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = tx.send(TtsEvent::Closed).await;
        });

        Ok((Self { write }, rx))
    }

    /// Queue a piece of text for synthesis
    pub async fn speak(&mut self, text: &str) -> Result<()> {
        self.write
            .send(Message::Text(
                json!({ "type": "speak", "text": text }).to_string().into(),
            ))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))
    }

    /// Mark the end of the utterance so the peer flushes
    pub async fn flush(&mut self) -> Result<()> {
        self.write
            .send(Message::Text(json!({ "type": "flush" }).to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))
    }

    /// Abandon any queued synthesis (barge-in)
    pub async fn cancel(&mut self) -> Result<()> {
        self.write
            .send(Message::Text(json!({ "type": "cancel" }).to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))
    }

    pub async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}

/// One-shot file-mode synthesis over HTTP
///
/// Returns mono PCM16 samples decoded from the service's WAV response.
pub async fn synthesize_file(
    http: &reqwest::Client,
    config: &ProviderConfig,
    text: &str,
    sample_rate: u32,
) -> Result<Vec<i16>> {
    let mut request = http.post(&config.url).json(&json!({
        "text": text,
        "voice": config.voice,
        "sample_rate": sample_rate,
        "format": "wav",
    }));
    if !config.api_key.is_empty() {
        request = request.bearer_auth(&config.api_key);
    }
    let response = request.send().await.map_err(|e| {
        let kind = if e.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Disconnect
        };
        EngineError::provider(kind, e.to_string())
    })?;
    if !response.status().is_success() {
        return Err(EngineError::provider(
            ProviderErrorKind::Protocol,
            format!("tts render failed: {}", response.status()),
        ));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;
    decode_wav_pcm16(&body)
}

/// Minimal WAV reader: mono PCM16, returns the data chunk as samples
pub fn decode_wav_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() < 44 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(EngineError::provider(
            ProviderErrorKind::Protocol,
            "tts response is not a WAV file",
        ));
    }
    // walk the chunk list to find `data`
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size =
            u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().expect("4 bytes"))
                as usize;
        let body_start = offset + 8;
        if id == b"data" {
            let end = (body_start + size).min(bytes.len());
            let data = &bytes[body_start..end];
            return pcm16_from_le_bytes(data)
                .map_err(|e| EngineError::provider(ProviderErrorKind::Protocol, e.to_string()));
        }
        // chunks are word-aligned
        offset = body_start + size + (size & 1);
    }
    Err(EngineError::provider(
        ProviderErrorKind::Protocol,
        "WAV data chunk missing",
    ))
}
