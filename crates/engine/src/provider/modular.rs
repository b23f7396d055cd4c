//! Modular pipeline session
//!
//! Composes three independent peers into one provider session: STT turns
//! caller audio into transcripts, the LLM reasons over the conversation,
//! and TTS synthesizes the reply. The wiring runs in a single
//! orchestrator task so pipeline state has one writer; commands from the
//! coordinator and events from the three peers merge in one select loop.
//!
//! A turn:
//!
//! ```text
//! caller audio → STT ─final──► LLM request (prompt + history + tools)
//!                                 │ text deltas
//!                                 ├──► sentence buffer ──► TTS
//!                                 └──► tool calls ──► coordinator
//! ```
//!
//! Cancellation drops the in-flight LLM stream and tells TTS to abandon
//! queued synthesis; a stale turn id keeps late file renders from
//! leaking into the next response.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::llm::{build_messages, ChatMessage, LlmClient, LlmDelta};
use super::stt::{SttEvent, SttLink};
use super::tts::{synthesize_file, TtsEvent, TtsStream};
use super::{ProviderEvent, ProviderEvents, ProviderSession, SessionParams, ToolSchema};
use crate::config::{ProviderConfig, TtsMode};
use crate::error::{EngineError, ProviderErrorKind, Result};

/// Commands from the coordinator into the orchestrator task
enum PipelineCmd {
    Audio(Vec<i16>),
    EndUtterance,
    SpeakGreeting,
    Cancel,
    ToolResult {
        call_id: String,
        result: serde_json::Value,
    },
    Close,
}

/// Provider session backed by an STT+LLM+TTS composition
pub struct ModularSession {
    cmd_tx: mpsc::Sender<PipelineCmd>,
    closed: bool,
}

pub struct ModularConfig {
    pub stt: ProviderConfig,
    pub llm: ProviderConfig,
    pub tts: ProviderConfig,
}

impl ModularSession {
    pub async fn connect(
        config: ModularConfig,
        params: &SessionParams,
        connect_timeout: std::time::Duration,
    ) -> Result<(Self, ProviderEvents)> {
        let (stt, stt_rx) = SttLink::connect(&config.stt, params.input_rate, connect_timeout).await?;

        let tts_mode = config.tts.tts_mode.unwrap_or(TtsMode::Stream);
        let (tts_stream, tts_rx) = match tts_mode {
            TtsMode::Stream => {
                let (link, rx) =
                    TtsStream::connect(&config.tts, params.output_rate, connect_timeout).await?;
                (Some(link), Some(rx))
            }
            TtsMode::File => (None, None),
        };

        let llm = LlmClient::new(config.llm, params.llm.clone(), connect_timeout)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        let orchestrator = Orchestrator {
            stt,
            stt_rx,
            tts_stream,
            tts_rx,
            tts_config: config.tts,
            tts_mode,
            llm,
            http: reqwest::Client::new(),
            prompt: params.prompt.clone(),
            greeting: params.greeting.clone(),
            tools: params.tools.clone(),
            output_rate: params.output_rate,
            history_max_turns: params.llm.history_max_turns,
            events: events_tx.clone(),
            history: Vec::new(),
            llm_rx: None,
            render_rx: None,
            turn: 0,
            current_user: None,
            current_assistant: String::new(),
            response_open: false,
            sentence_buf: String::new(),
        };
        tokio::spawn(orchestrator.run(cmd_rx));

        // the composition is ready as soon as its links are up
        let _ = events_tx.send(ProviderEvent::Ready).await;

        Ok((Self { cmd_tx, closed: false }, events_rx))
    }

    async fn send(&mut self, cmd: PipelineCmd) -> Result<()> {
        if self.closed {
            return Err(EngineError::provider(
                ProviderErrorKind::Disconnect,
                "pipeline is closed",
            ));
        }
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::provider(ProviderErrorKind::Disconnect, "pipeline task gone"))
    }
}

#[async_trait::async_trait]
impl ProviderSession for ModularSession {
    async fn push_caller_audio(&mut self, samples: &[i16]) -> Result<()> {
        self.send(PipelineCmd::Audio(samples.to_vec())).await
    }

    async fn end_utterance(&mut self) -> Result<()> {
        self.send(PipelineCmd::EndUtterance).await
    }

    async fn speak_greeting(&mut self) -> Result<()> {
        self.send(PipelineCmd::SpeakGreeting).await
    }

    async fn cancel_current_response(&mut self) -> Result<()> {
        self.send(PipelineCmd::Cancel).await
    }

    async fn submit_tool_result(
        &mut self,
        call_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.send(PipelineCmd::ToolResult {
            call_id: call_id.to_string(),
            result,
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.cmd_tx.send(PipelineCmd::Close).await;
        Ok(())
    }
}

/// Result of a background file-mode render, tagged with its turn
struct RenderDone {
    turn: u64,
    samples: Result<Vec<i16>>,
}

struct Orchestrator {
    stt: SttLink,
    stt_rx: mpsc::Receiver<SttEvent>,
    tts_stream: Option<TtsStream>,
    tts_rx: Option<mpsc::Receiver<TtsEvent>>,
    tts_config: ProviderConfig,
    tts_mode: TtsMode,
    llm: LlmClient,
    http: reqwest::Client,
    prompt: String,
    greeting: String,
    tools: Vec<ToolSchema>,
    output_rate: u32,
    history_max_turns: usize,
    events: mpsc::Sender<ProviderEvent>,
    history: Vec<ChatMessage>,
    /// Live LLM stream for the current turn, if any
    llm_rx: Option<mpsc::Receiver<LlmDelta>>,
    /// Pending file-mode render for the current turn, if any
    render_rx: Option<mpsc::Receiver<RenderDone>>,
    /// Bumped per response; stale completions are ignored
    turn: u64,
    current_user: Option<String>,
    current_assistant: String,
    response_open: bool,
    sentence_buf: String,
}

impl Orchestrator {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PipelineCmd>) {
        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_cmd(cmd).await {
                        break;
                    }
                }

                stt_event = self.stt_rx.recv() => {
                    let Some(event) = stt_event else { break };
                    self.handle_stt(event).await;
                }

                tts_event = recv_opt(&mut self.tts_rx) => {
                    match tts_event {
                        Some(event) => self.handle_tts(event).await,
                        None => self.tts_rx = None,
                    }
                }

                delta = recv_opt(&mut self.llm_rx) => {
                    match delta {
                        Some(delta) => self.handle_llm(delta).await,
                        None => self.llm_rx = None,
                    }
                }

                render = recv_opt(&mut self.render_rx) => {
                    match render {
                        Some(done) => self.handle_render(done).await,
                        None => self.render_rx = None,
                    }
                }
            }
        }
        if let Some(tts) = self.tts_stream.as_mut() {
            tts.close().await;
        }
        self.stt.close().await;
        let _ = self.events.send(ProviderEvent::Closed).await;
        debug!("pipeline orchestrator stopped");
    }

    async fn handle_cmd(&mut self, cmd: PipelineCmd) -> bool {
        match cmd {
            PipelineCmd::Audio(samples) => {
                if let Err(e) = self.stt.push_audio(&samples).await {
                    self.fail(e).await;
                    return false;
                }
            }
            PipelineCmd::EndUtterance => {
                if let Err(e) = self.stt.finalize().await {
                    self.fail(e).await;
                    return false;
                }
            }
            PipelineCmd::SpeakGreeting => {
                let greeting = self.greeting.clone();
                self.begin_response().await;
                self.current_assistant = greeting.clone();
                self.speak_text(&greeting).await;
                self.finish_synthesis().await;
            }
            PipelineCmd::Cancel => {
                self.cancel_turn().await;
            }
            PipelineCmd::ToolResult { call_id, result } => {
                self.continue_after_tool(&call_id, result).await;
            }
            PipelineCmd::Close => return false,
        }
        true
    }

    async fn handle_stt(&mut self, event: SttEvent) {
        match event {
            SttEvent::Partial { text } => {
                let _ = self
                    .events
                    .send(ProviderEvent::PartialTranscript { text })
                    .await;
            }
            SttEvent::Final { text } => {
                let _ = self
                    .events
                    .send(ProviderEvent::FinalTranscript { text: text.clone() })
                    .await;
                if !text.trim().is_empty() {
                    self.start_turn(text).await;
                }
            }
            SttEvent::Error { detail } => {
                self.fail(EngineError::provider(ProviderErrorKind::Protocol, detail))
                    .await;
            }
            SttEvent::Closed => {
                self.fail(EngineError::provider(
                    ProviderErrorKind::Disconnect,
                    "stt stream closed",
                ))
                .await;
            }
        }
    }

    async fn handle_tts(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::Audio { samples } => {
                let _ = self
                    .events
                    .send(ProviderEvent::AgentAudioChunk { samples })
                    .await;
            }
            TtsEvent::UtteranceEnd => {
                self.close_response().await;
            }
            TtsEvent::Error { detail } => {
                self.fail(EngineError::provider(ProviderErrorKind::Protocol, detail))
                    .await;
            }
            TtsEvent::Closed => {
                self.fail(EngineError::provider(
                    ProviderErrorKind::Disconnect,
                    "tts stream closed",
                ))
                .await;
            }
        }
    }

    async fn handle_llm(&mut self, delta: LlmDelta) {
        match delta {
            LlmDelta::Text(text) => {
                self.begin_response().await;
                self.current_assistant.push_str(&text);
                let _ = self
                    .events
                    .send(ProviderEvent::AgentTextChunk { text: text.clone() })
                    .await;
                self.sentence_buf.push_str(&text);
                if let Some(sentence) = take_sentence(&mut self.sentence_buf) {
                    self.speak_text(&sentence).await;
                }
            }
            LlmDelta::ToolCall { id, name, args } => {
                self.begin_response().await;
                let _ = self
                    .events
                    .send(ProviderEvent::ToolCallRequest { id, name, args })
                    .await;
            }
            LlmDelta::Done => {
                self.llm_rx = None;
                let tail = std::mem::take(&mut self.sentence_buf);
                if !tail.trim().is_empty() {
                    self.speak_text(&tail).await;
                }
                self.finish_synthesis().await;
            }
        }
    }

    async fn handle_render(&mut self, done: RenderDone) {
        if done.turn != self.turn {
            debug!(turn = done.turn, current = self.turn, "stale render discarded");
            return;
        }
        self.render_rx = None;
        match done.samples {
            Ok(samples) => {
                let _ = self
                    .events
                    .send(ProviderEvent::AgentAudioChunk { samples })
                    .await;
                self.close_response().await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    /// Kick off one LLM turn for a finalized utterance
    async fn start_turn(&mut self, utterance: String) {
        self.cancel_turn().await;
        self.current_user = Some(utterance.clone());
        let messages = build_messages(
            &self.prompt,
            &self.history,
            &utterance,
            self.history_max_turns,
        );
        match self.llm.stream_chat(messages, &self.tools).await {
            Ok(rx) => self.llm_rx = Some(rx),
            Err(e) => self.fail(e).await,
        }
    }

    /// Resume generation after a tool executed
    async fn continue_after_tool(&mut self, call_id: &str, result: serde_json::Value) {
        if let Some(user) = self.current_user.take() {
            self.history.push(ChatMessage::user(user));
        }
        if !self.current_assistant.is_empty() {
            self.history
                .push(ChatMessage::assistant(std::mem::take(&mut self.current_assistant)));
        }
        self.history.push(ChatMessage::tool_result(
            json!({ "call_id": call_id, "result": result }).to_string(),
        ));

        let messages = build_messages(&self.prompt, &self.history, "", self.history_max_turns);
        // trailing empty user turn is dropped
        let messages: Vec<ChatMessage> =
            messages.into_iter().filter(|m| !m.content.is_empty() || m.role != "user").collect();
        match self.llm.stream_chat(messages, &self.tools).await {
            Ok(rx) => self.llm_rx = Some(rx),
            Err(e) => self.fail(e).await,
        }
    }

    async fn begin_response(&mut self) {
        if !self.response_open {
            self.response_open = true;
            self.turn += 1;
            let _ = self.events.send(ProviderEvent::ResponseStarted).await;
        }
    }

    /// Send text to the TTS leg (stream mode) or stash it (file mode)
    async fn speak_text(&mut self, text: &str) {
        match self.tts_mode {
            TtsMode::Stream => {
                if let Some(tts) = self.tts_stream.as_mut() {
                    if let Err(e) = tts.speak(text).await {
                        self.fail(e).await;
                    }
                }
            }
            TtsMode::File => {
                // file mode renders once per response in finish_synthesis
            }
        }
    }

    /// The response text is complete; drive synthesis to a close
    async fn finish_synthesis(&mut self) {
        match self.tts_mode {
            TtsMode::Stream => {
                if let Some(tts) = self.tts_stream.as_mut() {
                    if let Err(e) = tts.flush().await {
                        self.fail(e).await;
                    }
                }
                // close_response fires on TtsEvent::UtteranceEnd
            }
            TtsMode::File => {
                let text = self.current_assistant.clone();
                if text.trim().is_empty() {
                    self.close_response().await;
                    return;
                }
                let (tx, rx) = mpsc::channel(1);
                self.render_rx = Some(rx);
                let http = self.http.clone();
                let config = self.tts_config.clone();
                let rate = self.output_rate;
                let turn = self.turn;
                tokio::spawn(async move {
                    let samples = synthesize_file(&http, &config, &text, rate).await;
                    let _ = tx.send(RenderDone { turn, samples }).await;
                });
            }
        }
    }

    /// Book-keep the end of a response and emit the event
    async fn close_response(&mut self) {
        if !self.response_open {
            return;
        }
        self.response_open = false;
        if let Some(user) = self.current_user.take() {
            self.history.push(ChatMessage::user(user));
        }
        if !self.current_assistant.is_empty() {
            self.history
                .push(ChatMessage::assistant(std::mem::take(&mut self.current_assistant)));
        }
        let _ = self.events.send(ProviderEvent::ResponseEnded).await;
    }

    /// Abandon the in-flight turn (barge-in or new utterance)
    async fn cancel_turn(&mut self) {
        self.llm_rx = None;
        self.render_rx = None;
        self.turn += 1;
        self.sentence_buf.clear();
        self.current_assistant.clear();
        self.response_open = false;
        if self.tts_mode == TtsMode::Stream {
            if let Some(tts) = self.tts_stream.as_mut() {
                if let Err(e) = tts.cancel().await {
                    warn!("tts cancel failed: {e}");
                }
            }
        }
    }

    async fn fail(&mut self, error: EngineError) {
        warn!("pipeline failure: {error}");
        let (kind, detail) = match &error {
            EngineError::Provider { kind, detail } => (*kind, detail.clone()),
            other => (ProviderErrorKind::Protocol, other.to_string()),
        };
        let _ = self.events.send(ProviderEvent::Error { kind, detail }).await;
    }
}

/// Receive from an optional channel; pends forever when absent
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Split off a complete sentence once the buffer holds one
fn take_sentence(buf: &mut String) -> Option<String> {
    let boundary = buf
        .char_indices()
        .find(|(i, c)| {
            matches!(c, '.' | '!' | '?') && buf[i + c.len_utf8()..].starts_with(|n: char| n.is_whitespace())
        })
        .map(|(i, c)| i + c.len_utf8());
    let cut = boundary.or_else(|| {
        // very long clause with no punctuation: flush at a word break
        if buf.len() > 120 {
            buf[..120].rfind(' ')
        } else {
            None
        }
    })?;
    let sentence = buf[..cut].to_string();
    buf.drain(..cut);
    Some(sentence)
}
