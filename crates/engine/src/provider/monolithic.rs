//! Monolithic realtime provider
//!
//! One duplex WebSocket carries everything: caller audio up, agent audio,
//! transcripts and tool calls down. The protocol is the realtime-JSON
//! shape used by OpenAI-compatible speech agents: `session.update` to
//! configure, `input_audio_buffer.append` with base64 PCM16 frames,
//! `response.cancel` for barge-in, `conversation.item.create` with
//! `function_call_output` items for tool results.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
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
use tracing::{debug, trace, warn};

use arivox_media_core::frame::{pcm16_from_le_bytes, pcm16_to_le_bytes};

use super::{ProviderEvent, ProviderEvents, ProviderSession, SessionParams};
use crate::config::ProviderConfig;
use crate::error::{EngineError, ProviderErrorKind, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A connected monolithic session
pub struct MonolithicSession {
    write: WsSink,
    closed: bool,
    greeting: String,
    /// Reused base64 staging buffer for outbound audio
    pcm_buf: Vec<u8>,
}

impl MonolithicSession {
    /// Dial the provider and configure the session
    ///
    /// Emits `Ready` on the event channel once the peer acknowledges the
    /// session configuration.
    pub async fn connect(
        config: &ProviderConfig,
        params: &SessionParams,
        connect_timeout: std::time::Duration,
    ) -> Result<(Self, ProviderEvents)> {
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
            .map_err(|_| {
                EngineError::provider(ProviderErrorKind::Timeout, "connect timed out")
            })?
            .map_err(|e| {
                EngineError::provider(ProviderErrorKind::Disconnect, e.to_string())
            })?;
        debug!(url = %config.url, "monolithic provider connected");

        let (mut write, read) = stream.split();

        let turn_detection = if config.use_provider_vad {
            json!({ "type": "server_vad" })
        } else {
            serde_json::Value::Null
        };
        let session_update = json!({
            "type": "session.update",
            "session": {
                "type": "realtime",
                "model": config.model,
                "instructions": params.prompt,
                "audio": {
                    "input": {
                        "format": { "type": "audio/pcm", "rate": params.input_rate },
                        "turn_detection": turn_detection,
                        "transcription": { "enabled": true },
                    },
                    "output": {
                        "format": { "type": "audio/pcm", "rate": params.output_rate },
                        "voice": config.voice,
                    },
                },
                "tools": params.tools,
            },
        });
        write
            .send(Message::Text(session_update.to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(read_loop(read, events_tx));

        Ok((
            Self {
                write,
                closed: false,
                greeting: params.greeting.clone(),
                pcm_buf: Vec::new(),
            },
            events_rx,
        ))
    }

    async fn send_json(&mut self, value: serde_json::Value) -> Result<()> {
        if self.closed {
            return Err(EngineError::provider(
                ProviderErrorKind::Disconnect,
                "session is closed",
            ));
        }
        self.write
            .send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| EngineError::provider(ProviderErrorKind::Disconnect, e.to_string()))
    }
}

#[async_trait::async_trait]
impl ProviderSession for MonolithicSession {
    async fn push_caller_audio(&mut self, samples: &[i16]) -> Result<()> {
        let mut staging = std::mem::take(&mut self.pcm_buf);
        pcm16_to_le_bytes(samples, &mut staging);
        let audio = BASE64.encode(&staging);
        self.pcm_buf = staging;
        self.send_json(json!({
            "type": "input_audio_buffer.append",
            "audio": audio,
        }))
        .await
    }

    async fn end_utterance(&mut self) -> Result<()> {
        self.send_json(json!({ "type": "input_audio_buffer.commit" }))
            .await?;
        self.send_json(json!({ "type": "response.create" })).await
    }

    async fn speak_greeting(&mut self) -> Result<()> {
        // the model speaks the configured greeting rather than improvising
        let instructions = if self.greeting.is_empty() {
            "Greet the caller briefly and ask how you can help.".to_string()
        } else {
            format!("Greet the caller by saying exactly: \"{}\"", self.greeting)
        };
        self.send_json(json!({
            "type": "response.create",
            "response": { "instructions": instructions },
        }))
        .await
    }

    async fn cancel_current_response(&mut self) -> Result<()> {
        self.send_json(json!({ "type": "response.cancel" })).await
    }

    async fn submit_tool_result(
        &mut self,
        call_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.send_json(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": result.to_string(),
            },
        }))
        .await?;
        self.send_json(json!({ "type": "response.create" })).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.write.send(Message::Close(None)).await;
        Ok(())
    }
}

/// Map inbound realtime events onto the engine's provider events
async fn read_loop(mut read: WsSource, events: mpsc::Sender<ProviderEvent>) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                    warn!("undecodable provider event");
                    continue;
                };
                let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
                trace!(event_type, "provider event");
                let mapped = map_event(event_type, &value);
                for event in mapped {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    let _ = events.send(ProviderEvent::Closed).await;
}

fn map_event(event_type: &str, value: &serde_json::Value) -> Vec<ProviderEvent> {
    let text_field = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    match event_type {
        "session.created" | "session.updated" => vec![ProviderEvent::Ready],
        "response.created" => vec![ProviderEvent::ResponseStarted],
        "response.done" => vec![ProviderEvent::ResponseEnded],
        "response.audio.delta" | "response.output_audio.delta" => {
            let b64 = text_field("delta");
            match BASE64.decode(b64.as_bytes()) {
                Ok(bytes) => match pcm16_from_le_bytes(&bytes) {
                    Ok(samples) => vec![ProviderEvent::AgentAudioChunk { samples }],
                    Err(e) => {
                        warn!("bad provider audio payload: {e}");
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!("bad provider audio base64: {e}");
                    Vec::new()
                }
            }
        }
        "response.audio_transcript.delta" | "response.output_text.delta" => {
            vec![ProviderEvent::AgentTextChunk {
                text: text_field("delta"),
            }]
        }
        "conversation.item.input_audio_transcription.delta" => {
            vec![ProviderEvent::PartialTranscript {
                text: text_field("delta"),
            }]
        }
        "conversation.item.input_audio_transcription.completed" => {
            vec![ProviderEvent::FinalTranscript {
                text: text_field("transcript"),
            }]
        }
        "response.function_call_arguments.done" => {
            let args = value
                .get("arguments")
                .and_then(|a| a.as_str())
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(serde_json::Value::Null);
            vec![ProviderEvent::ToolCallRequest {
                id: text_field("call_id"),
                name: text_field("name"),
                args,
            }]
        }
        "error" => {
            let detail = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unspecified provider error")
                .to_string();
            let kind = classify_error(&detail);
            vec![ProviderEvent::Error { kind, detail }]
        }
        _ => Vec::new(),
    }
}

fn classify_error(detail: &str) -> ProviderErrorKind {
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("rate limit") || lowered.contains("too many") {
        ProviderErrorKind::RateLimit
    } else if lowered.contains("auth") || lowered.contains("api key") {
        ProviderErrorKind::Auth
    } else {
        ProviderErrorKind::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_audio_delta() {
        let samples = vec![100i16, -100, 0, 42];
        let mut bytes = Vec::new();
        pcm16_to_le_bytes(&samples, &mut bytes);
        let value = json!({
            "type": "response.audio.delta",
            "delta": BASE64.encode(&bytes),
        });
        let events = map_event("response.audio.delta", &value);
        assert_eq!(
            events,
            vec![ProviderEvent::AgentAudioChunk { samples }]
        );
    }

    #[test]
    fn maps_transcript_ordering_events() {
        let partial = json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "delta": "what are",
        });
        let done = json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "what are your hours?",
        });
        assert_eq!(
            map_event(
                "conversation.item.input_audio_transcription.delta",
                &partial
            ),
            vec![ProviderEvent::PartialTranscript { text: "what are".into() }]
        );
        assert_eq!(
            map_event(
                "conversation.item.input_audio_transcription.completed",
                &done
            ),
            vec![ProviderEvent::FinalTranscript {
                text: "what are your hours?".into()
            }]
        );
    }

    #[test]
    fn maps_tool_call_with_json_arguments() {
        let value = json!({
            "type": "response.function_call_arguments.done",
            "call_id": "call_1",
            "name": "transfer",
            "arguments": "{\"destination\": \"sales_team\"}",
        });
        let events = map_event("response.function_call_arguments.done", &value);
        match &events[0] {
            ProviderEvent::ToolCallRequest { id, name, args } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "transfer");
                assert_eq!(args["destination"], "sales_team");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn classifies_errors() {
        assert_eq!(classify_error("Rate limit reached"), ProviderErrorKind::RateLimit);
        assert_eq!(classify_error("Invalid API key"), ProviderErrorKind::Auth);
        assert_eq!(classify_error("boom"), ProviderErrorKind::Protocol);
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert!(map_event("rate_limits.updated", &json!({})).is_empty());
    }
}
