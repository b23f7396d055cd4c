//! Streaming LLM client for modular pipelines
//!
//! Speaks the OpenAI-compatible chat-completions protocol with
//! `stream: true`: the response body is a server-sent-event stream of
//! JSON chunks carrying text deltas and incremental tool calls.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ToolSchema;
use crate::config::{LlmConfig, ProviderConfig};
use crate::error::{EngineError, ProviderErrorKind, Result};

/// One message of conversation history
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
    pub fn tool_result(content: impl Into<String>) -> Self {
        Self { role: "tool", content: content.into() }
    }
}

/// Increments surfaced while a completion streams
#[derive(Debug, Clone, PartialEq)]
pub enum LlmDelta {
    /// A piece of assistant text
    Text(String),
    /// A completed tool call (arguments fully assembled)
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// The stream finished cleanly
    Done,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Client for one configured LLM provider
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: ProviderConfig,
    params: LlmConfig,
}

impl LlmClient {
    pub fn new(config: ProviderConfig, params: LlmConfig, timeout: std::time::Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| EngineError::provider(ProviderErrorKind::Protocol, e.to_string()))?;
        Ok(Self { http, config, params })
    }

    /// Start a streaming completion; deltas arrive on the returned channel
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> Result<mpsc::Receiver<LlmDelta>> {
        let tool_defs: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.params.temperature,
            "max_tokens": self.params.max_tokens,
            "stream": true,
        });
        if !tool_defs.is_empty() {
            body["tools"] = serde_json::Value::Array(tool_defs);
        }

        let mut request = self.http.post(&self.config.url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ProviderErrorKind::Timeout
            } else {
                ProviderErrorKind::Disconnect
            };
            EngineError::provider(kind, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let kind = match status.as_u16() {
                401 | 403 => ProviderErrorKind::Auth,
                429 => ProviderErrorKind::RateLimit,
                _ => ProviderErrorKind::Protocol,
            };
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(kind, format!("{status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(128);
        let mut byte_stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut carry = String::new();
            let mut pending_calls: Vec<ToolCallAccumulator> = Vec::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("llm stream read error: {e}");
                        break;
                    }
                };
                carry.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = carry.find('\n') {
                    let line = carry[..newline].trim().to_string();
                    carry.drain(..=newline);
                    if !process_sse_line(&line, &tx, &mut pending_calls).await {
                        return;
                    }
                }
            }
            flush_tool_calls(&tx, &mut pending_calls).await;
            let _ = tx.send(LlmDelta::Done).await;
        });
        Ok(rx)
    }
}

/// Handle one SSE line; returns false when the receiver hung up
async fn process_sse_line(
    line: &str,
    tx: &mpsc::Sender<LlmDelta>,
    pending: &mut Vec<ToolCallAccumulator>,
) -> bool {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return true;
    };
    if data.is_empty() {
        return true;
    }
    if data == "[DONE]" {
        flush_tool_calls(tx, pending).await;
        return tx.send(LlmDelta::Done).await.is_ok();
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            debug!("skipping undecodable llm chunk: {e}");
            return true;
        }
    };
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() && tx.send(LlmDelta::Text(text)).await.is_err() {
                return false;
            }
        }
        for call in choice.delta.tool_calls {
            while pending.len() <= call.index {
                pending.push(ToolCallAccumulator::default());
            }
            let acc = &mut pending[call.index];
            if let Some(id) = call.id {
                acc.id = id;
            }
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    acc.name = name;
                }
                if let Some(arguments) = function.arguments {
                    acc.arguments.push_str(&arguments);
                }
            }
        }
        if choice.finish_reason.as_deref() == Some("tool_calls") {
            flush_tool_calls(tx, pending).await;
        }
    }
    true
}

async fn flush_tool_calls(tx: &mpsc::Sender<LlmDelta>, pending: &mut Vec<ToolCallAccumulator>) {
    for acc in pending.drain(..) {
        if acc.name.is_empty() {
            continue;
        }
        let args = serde_json::from_str(&acc.arguments).unwrap_or(serde_json::Value::Null);
        let _ = tx
            .send(LlmDelta::ToolCall {
                id: if acc.id.is_empty() {
                    format!("call-{}", acc.name)
                } else {
                    acc.id
                },
                name: acc.name,
                args,
            })
            .await;
    }
}

/// Assemble the message list for one turn
pub fn build_messages(
    prompt: &str,
    history: &[ChatMessage],
    utterance: &str,
    max_turns: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(prompt));
    let keep = history.len().saturating_sub(max_turns * 2);
    messages.extend(history[keep..].iter().cloned());
    messages.push(ChatMessage::user(utterance));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sse_text_deltas_stream_through() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut pending = Vec::new();
        let lines = [
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ];
        for line in lines {
            process_sse_line(line, &tx, &mut pending).await;
        }
        assert_eq!(rx.recv().await, Some(LlmDelta::Text("Hel".into())));
        assert_eq!(rx.recv().await, Some(LlmDelta::Text("lo".into())));
        assert_eq!(rx.recv().await, Some(LlmDelta::Done));
    }

    #[tokio::test]
    async fn tool_calls_assemble_across_chunks() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut pending = Vec::new();
        let lines = [
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"transfer","arguments":"{\"dest"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ination\": \"sales_team\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for line in lines {
            process_sse_line(line, &tx, &mut pending).await;
        }
        match rx.recv().await {
            Some(LlmDelta::ToolCall { id, name, args }) => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "transfer");
                assert_eq!(args["destination"], "sales_team");
            }
            other => panic!("wrong delta: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_data_lines_are_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut pending = Vec::new();
        assert!(process_sse_line(": keepalive", &tx, &mut pending).await);
        assert!(process_sse_line("", &tx, &mut pending).await);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn history_is_bounded_by_max_turns() {
        let history: Vec<ChatMessage> = (0..20)
            .flat_map(|i| {
                vec![
                    ChatMessage::user(format!("u{i}")),
                    ChatMessage::assistant(format!("a{i}")),
                ]
            })
            .collect();
        let messages = build_messages("sys", &history, "latest", 3);
        // system + 3 turns (6 messages) + new user utterance
        assert_eq!(messages.len(), 8);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "u17");
        assert_eq!(messages.last().unwrap().content, "latest");
    }
}
