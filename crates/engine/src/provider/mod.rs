//! AI provider sessions
//!
//! A provider session is the conversational peer for one call. Two
//! realizations sit behind one capability surface:
//!
//! - [`monolithic`]: a single duplex WebSocket peer that does its own
//!   STT, reasoning, TTS and turn-taking (OpenAI-Realtime-style JSON
//!   protocol),
//! - [`modular`]: a composition of three independent peers (STT, LLM,
//!   TTS) wired together by the engine.
//!
//! Both emit [`ProviderEvent`]s over an mpsc channel consumed by the
//! call coordinator, and accept the same commands. A provider failure
//! mid-call is terminal for that call only; cross-call reconnection
//! lives in [`supervisor`].

pub mod llm;
pub mod modular;
pub mod monolithic;
pub mod stt;
pub mod supervisor;
pub mod tts;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ProviderErrorKind, Result};

/// A tool the model may call, in the shape LLM APIs expect
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub parameters: serde_json::Value,
}

/// Everything a provider session needs to start serving one call
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// System prompt (context prompt + persona)
    pub prompt: String,
    /// Greeting text to speak when asked
    pub greeting: String,
    /// Tools allowed for this context
    pub tools: Vec<ToolSchema>,
    /// Rate of caller audio pushed into the session
    pub input_rate: u32,
    /// Rate the provider's audio output is expected in
    pub output_rate: u32,
    /// Conversation shaping for modular pipelines
    pub llm: crate::config::LlmConfig,
}

/// Events observed from a provider session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Session is set up and ready for caller audio
    Ready,
    /// Interim caller transcript
    PartialTranscript { text: String },
    /// Finalized caller transcript; all partials already emitted
    FinalTranscript { text: String },
    /// Agent text as it is generated
    AgentTextChunk { text: String },
    /// Agent audio at the session's output rate
    AgentAudioChunk { samples: Vec<i16> },
    /// The provider began producing a response
    ResponseStarted,
    /// The provider finished producing the current response
    ResponseEnded,
    /// The model wants a tool executed
    ToolCallRequest {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Terminal session failure
    Error {
        kind: ProviderErrorKind,
        detail: String,
    },
    /// The session closed (peer or local)
    Closed,
}

/// Command surface shared by both realizations
#[async_trait]
pub trait ProviderSession: Send {
    /// Stream one frame of caller audio (PCM16 at `input_rate`)
    async fn push_caller_audio(&mut self, samples: &[i16]) -> Result<()>;

    /// The engine's endpointer decided the caller finished a turn
    async fn end_utterance(&mut self) -> Result<()>;

    /// Ask the session to speak the configured greeting
    async fn speak_greeting(&mut self) -> Result<()>;

    /// Cancel the in-flight response (barge-in)
    async fn cancel_current_response(&mut self) -> Result<()>;

    /// Hand a tool's structured result back to the model
    async fn submit_tool_result(
        &mut self,
        call_id: &str,
        result: serde_json::Value,
    ) -> Result<()>;

    /// Close the session; idempotent
    async fn close(&mut self) -> Result<()>;
}

/// Receiver half handed to the coordinator at session start
pub type ProviderEvents = tokio::sync::mpsc::Receiver<ProviderEvent>;
