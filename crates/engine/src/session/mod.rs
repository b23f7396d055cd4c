//! Per-call session coordination
//!
//! One coordinator task owns each call from `StasisStart` to teardown.
//! Every external input (ARI events, transport audio, provider events,
//! tool completions, the 20 ms pacing tick) arrives as a message on a
//! queue the coordinator drains, so session state has exactly one
//! writer. The select is biased: control beats tool results beats
//! provider events beats audio, so a caller hangup can never race a late
//! provider response into a surviving session.

pub mod events;
pub mod registry;
pub mod state;
pub mod transcript;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use arivox_ari_client::{AriClient, AriEvent, Channel};
use arivox_media_core::agc::{AgcConfig, GainNormalizer};
use arivox_media_core::frame::FRAME_MS;
use arivox_media_core::profile::{CodecSpec, Encoding};
use arivox_media_core::Resampler;

use crate::config::{
    resolve_call, AudioTransportKind, CallVars, Config, DownstreamMode, ResolvedCall,
    ResolvedProvider,
};
use crate::error::{EngineError, Result};
use crate::metrics::Metrics;
use crate::playback::{FilePlayback, PlaybackConfig, PlaybackQueue, RenderedUtterance, Tick};
use crate::provider::modular::{ModularConfig, ModularSession};
use crate::provider::monolithic::MonolithicSession;
use crate::provider::{ProviderEvent, ProviderEvents, ProviderSession};
use crate::tools::{
    self, ChannelWatch, ToolContext, ToolDispatcher, ToolDisposition, ToolInvocation,
    ToolRegistry,
};
use crate::transport::{
    AudioSocketServer, ExternalMediaTransport, PortAllocator, TransportEvent, TransportHandle,
};
use crate::vad::barge::BargeVerdict;
use crate::vad::{BargeGate, Endpointer, SpeechEvent, SuppressionWindow};

use events::{ControlMsg, ToolDone};
use registry::SessionRegistry;
use state::CallState;
use transcript::TranscriptLog;

/// Media played to the caller when the engine dies mid-call and cannot
/// stream its configured fallback phrase
const FALLBACK_MEDIA: &str = "sound:an-error-has-occurred";

/// Globals a session borrows for its lifetime
#[derive(Clone)]
pub struct SessionDeps {
    pub ari: AriClient,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub tools: Arc<ToolRegistry>,
    pub watch: ChannelWatch,
    pub registry: Arc<SessionRegistry>,
    pub audiosocket: Option<Arc<AudioSocketServer>>,
    pub rtp_ports: Option<Arc<PortAllocator>>,
}

/// Own one call end to end; returns only after full teardown
pub async fn handle_call(deps: SessionDeps, channel: Channel) {
    let channel_id = channel.id.clone();
    let (control_tx, control_rx) = mpsc::channel(64);
    deps.registry.insert(&channel_id, control_tx);
    deps.metrics.calls_total.inc();
    deps.metrics.active_calls.inc();
    let started = Instant::now();

    let disposition = match Session::setup(deps.clone(), channel, control_rx).await {
        Ok(session) => session.run().await,
        Err(e) => {
            warn!(channel = %channel_id, "call setup failed: {e}");
            let _ = deps.ari.hangup(&channel_id).await;
            "setup_failed"
        }
    };

    deps.registry.remove(&channel_id);
    deps.metrics.active_calls.dec();
    info!(
        channel = %channel_id,
        disposition,
        duration_s = started.elapsed().as_secs(),
        "call finished"
    );
}

struct Session {
    deps: SessionDeps,
    channel_id: String,
    caller_name: String,
    caller_number: String,
    resolved: ResolvedCall,
    state: CallState,

    control_rx: mpsc::Receiver<ControlMsg>,
    transport: TransportHandle,
    media_channel_id: String,
    bridge_id: String,
    rtp_lease: Option<crate::transport::external_media::PortLease>,

    provider: Box<dyn ProviderSession>,
    provider_rx: ProviderEvents,
    /// Keeps a replacement provider channel pending after the real one
    /// closes, so the select loop does not spin on a closed receiver
    _provider_keepalive: Option<mpsc::Sender<ProviderEvent>>,

    playback: PlaybackQueue,
    endpointer: Endpointer,
    barge: BargeGate,
    suppression: SuppressionWindow,
    transcript: TranscriptLog,

    dispatcher: ToolDispatcher,
    tool_tx: mpsc::Sender<ToolDone>,
    tool_rx: mpsc::Receiver<ToolDone>,
    tool_task: Option<tokio::task::JoinHandle<()>>,
    transfer_cancel: CancellationToken,
    emailed: Arc<parking_lot::Mutex<HashSet<String>>>,

    // media path converters, allocated once per call
    in_to_internal: Resampler,
    in_to_provider: Resampler,
    provider_to_internal: Resampler,
    internal_to_wire: Resampler,
    wire_spec: CodecSpec,

    file_mode: bool,
    file_playback: Option<FilePlayback>,
    /// Agent audio accumulating for a file-mode response (internal rate)
    file_accum: Vec<i16>,
    active_playback: Option<(String, RenderedUtterance)>,
    fallback_playback: Option<String>,

    response_gen: u64,
    greeting_active: bool,
    utterance_ended_at: Option<Instant>,
    await_first_frame: bool,
    /// Final transcript seen, waiting on the first agent text chunk
    llm_started_at: Option<Instant>,
    /// First agent text seen, waiting on the first audio chunk
    tts_started_at: Option<Instant>,
    provider_vad_deadline: Option<Instant>,
    pending_hangup_at: Option<Instant>,
    hangup_after_response: Option<Duration>,
    transfer_active: bool,
    supervising: bool,
    call_deadline: Instant,
    last_caller_audio: Instant,
    stasis_gone_deadline: Option<Instant>,
    torn_down: bool,
    disposition: &'static str,

    // reusable buffers for the per-frame paths
    scratch_internal: Vec<i16>,
    scratch_provider: Vec<i16>,
    scratch_wire: Vec<i16>,
    /// Agent speech frame the transport could not take last tick;
    /// retried before anything else is popped (padding may drop,
    /// begun speech may not)
    pending_wire_frame: Option<Vec<i16>>,
}

impl Session {
    /// Resolve, answer, attach media, attach provider
    async fn setup(
        deps: SessionDeps,
        channel: Channel,
        control_rx: mpsc::Receiver<ControlMsg>,
    ) -> Result<Self> {
        let channel_id = channel.id.clone();
        let config = deps.config.clone();
        let limits = &config.limits;
        let connect_timeout = Duration::from_millis(limits.connection_timeout_ms);

        // RESOLVING
        let vars = fetch_call_vars(&deps.ari, &channel).await;
        let resolved = resolve_call(&config, &vars)?;
        info!(
            channel = %channel_id,
            context = %resolved.context_name,
            provider = %resolved.provider.name(),
            profile = %resolved.profile.name,
            "call resolved"
        );

        deps.ari.answer(&channel_id).await?;

        // MEDIA_ATTACHING
        let profile = &resolved.profile;
        let (transport, media_channel_id, rtp_lease, wire_spec) = match config.audio_transport {
            AudioTransportKind::Audiosocket => {
                let server = deps.audiosocket.clone().ok_or_else(|| {
                    EngineError::Transport("audiosocket transport not initialized".into())
                })?;
                let conn_id = Uuid::new_v4();
                let waiter = server.expect(conn_id);
                let media_channel = match deps
                    .ari
                    .originate_audiosocket(
                        &config.audiosocket.advertise_addr,
                        &conn_id.to_string(),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        server.abandon(&conn_id);
                        return Err(e.into());
                    }
                };
                // keep the router from treating the media leg as a new call
                let _claim = deps.watch.register(&media_channel.id);
                let handle = match timeout(connect_timeout, waiter).await {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(_)) | Err(_) => {
                        server.abandon(&conn_id);
                        let _ = deps.ari.hangup(&media_channel.id).await;
                        return Err(EngineError::Transport(
                            "audiosocket connection never arrived".into(),
                        ));
                    }
                };
                // AudioSocket is PCM16 both ways at the caller rate
                let wire = CodecSpec::new(Encoding::Slin, profile.caller.rate);
                (handle, media_channel.id, None, wire)
            }
            AudioTransportKind::Externalmedia => {
                let ports = deps.rtp_ports.clone().ok_or_else(|| {
                    EngineError::Transport("externalmedia transport not initialized".into())
                })?;
                let lease = ports.acquire()?;
                let wire = profile.wire_out;
                let (handle, advertise) =
                    ExternalMediaTransport::bind(&ports, &lease, wire).await?;
                let format = asterisk_format(wire);
                let media_channel = match deps
                    .ari
                    .originate_external_media(&advertise, format)
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        ports.release(&lease);
                        return Err(e.into());
                    }
                };
                let _claim = deps.watch.register(&media_channel.id);
                (handle, media_channel.id, Some(lease), wire)
            }
        };

        // any failure past this point must release the media leg
        let release_media = |deps: SessionDeps, media_channel_id: String,
                             rtp_lease: Option<crate::transport::external_media::PortLease>| async move {
            deps.watch.release(&media_channel_id);
            let _ = deps.ari.hangup(&media_channel_id).await;
            if let (Some(ports), Some(lease)) = (&deps.rtp_ports, rtp_lease) {
                ports.release(&lease);
            }
        };

        // provider session
        let schemas = deps.tools.schemas_for(&resolved.context.tools);
        let params = crate::provider::SessionParams {
            prompt: resolved.prompt.clone(),
            greeting: resolved.greeting.clone(),
            tools: schemas,
            input_rate: profile.provider_in.rate,
            output_rate: profile.provider_out.rate,
            llm: config.llm.clone(),
        };
        let connected: Result<(Box<dyn ProviderSession>, ProviderEvents)> =
            match &resolved.provider {
                ResolvedProvider::Monolithic { provider, .. } => {
                    MonolithicSession::connect(provider, &params, connect_timeout)
                        .await
                        .map(|(session, rx)| (Box::new(session) as Box<dyn ProviderSession>, rx))
                }
                ResolvedProvider::Pipeline { stt, llm, tts, .. } => {
                    let modular = ModularConfig {
                        stt: stt.clone(),
                        llm: llm.clone(),
                        tts: tts.clone(),
                    };
                    ModularSession::connect(modular, &params, connect_timeout)
                        .await
                        .map(|(session, rx)| (Box::new(session) as Box<dyn ProviderSession>, rx))
                }
            };
        let (mut provider, mut provider_rx) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                release_media(deps.clone(), media_channel_id, rtp_lease).await;
                return Err(e);
            }
        };

        // wait for the provider to signal ready
        let grace = Duration::from_millis(limits.provider_grace_ms);
        let ready = match timeout(grace, provider_rx.recv()).await {
            Ok(Some(ProviderEvent::Ready)) => Ok(()),
            Ok(Some(ProviderEvent::Error { detail, .. })) => Err(EngineError::Transport(
                format!("provider refused: {detail}"),
            )),
            Ok(_) | Err(_) => Err(EngineError::Transport(
                "provider did not become ready in time".into(),
            )),
        };
        if let Err(e) = ready {
            let _ = provider.close().await;
            release_media(deps.clone(), media_channel_id, rtp_lease).await;
            return Err(e);
        }

        // bridge the caller with the media leg
        let bridge = match deps.ari.create_bridge("mixing").await {
            Ok(bridge) => bridge,
            Err(e) => {
                let _ = provider.close().await;
                release_media(deps.clone(), media_channel_id, rtp_lease).await;
                return Err(e.into());
            }
        };
        let joined = async {
            deps.ari.add_to_bridge(&bridge.id, &channel_id).await?;
            add_to_bridge_with_retry(&deps.ari, &bridge.id, &media_channel_id).await?;
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = joined {
            let _ = provider.close().await;
            let _ = deps.ari.destroy_bridge(&bridge.id).await;
            release_media(deps.clone(), media_channel_id, rtp_lease).await;
            return Err(e);
        }

        let file_mode = config.downstream_mode == DownstreamMode::File
            || (config.audio_transport == AudioTransportKind::Externalmedia
                && !resolved.provider.is_monolithic());
        let file_playback = if file_mode {
            Some(FilePlayback::new(&config.streaming.media_dir)?)
        } else {
            None
        };

        let playback_config = PlaybackConfig {
            sample_rate: profile.internal_rate,
            min_start_ms: profile.min_start_ms,
            greeting_min_start_ms: profile.greeting_min_start_ms,
            low_watermark_ms: profile.low_watermark_ms,
            empty_backoff_ticks_max: config.streaming.empty_backoff_ticks_max,
        };
        let mut playback = PlaybackQueue::new(playback_config);
        if config.streaming.agc_enabled {
            playback = playback.with_agc(GainNormalizer::new(AgcConfig {
                target_rms: config.streaming.target_rms,
                max_gain_db: config.streaming.max_gain_db,
                ..Default::default()
            }));
        }

        let now = Instant::now();
        let caller_rate = match config.audio_transport {
            AudioTransportKind::Audiosocket => profile.caller.rate,
            AudioTransportKind::Externalmedia => wire_spec.rate,
        };
        let session = Self {
            caller_name: channel.caller.name.clone(),
            caller_number: channel.caller.number.clone(),
            channel_id,
            state: CallState::MediaAttaching,
            control_rx,
            transport,
            media_channel_id,
            bridge_id: bridge.id,
            rtp_lease,
            provider,
            provider_rx,
            _provider_keepalive: None,
            playback,
            endpointer: Endpointer::new(config.vad.clone(), profile.internal_rate),
            barge: BargeGate::new(config.barge_in.clone()),
            suppression: SuppressionWindow::new(config.barge_in.clone()),
            transcript: TranscriptLog::new(),
            dispatcher: ToolDispatcher::new(deps.tools.clone()),
            tool_task: None,
            transfer_cancel: CancellationToken::new(),
            emailed: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            in_to_internal: Resampler::new(caller_rate, profile.internal_rate)?,
            in_to_provider: Resampler::new(caller_rate, profile.provider_in.rate)?,
            provider_to_internal: Resampler::new(
                profile.provider_out.rate,
                profile.internal_rate,
            )?,
            internal_to_wire: Resampler::new(profile.internal_rate, wire_spec.rate)?,
            wire_spec,
            file_mode,
            file_playback,
            file_accum: Vec::new(),
            active_playback: None,
            fallback_playback: None,
            response_gen: 0,
            greeting_active: false,
            utterance_ended_at: None,
            await_first_frame: false,
            llm_started_at: None,
            tts_started_at: None,
            provider_vad_deadline: None,
            pending_hangup_at: None,
            hangup_after_response: None,
            transfer_active: false,
            supervising: false,
            call_deadline: now + Duration::from_secs(config.limits.max_call_duration_sec),
            last_caller_audio: now,
            stasis_gone_deadline: None,
            torn_down: false,
            disposition: "completed",
            scratch_internal: Vec::new(),
            scratch_provider: Vec::new(),
            scratch_wire: Vec::new(),
            pending_wire_frame: None,
            tool_tx: {
                let (tx, _) = mpsc::channel(8);
                tx
            },
            tool_rx: {
                let (_, rx) = mpsc::channel(8);
                rx
            },
            resolved,
            deps,
        };
        Ok(session)
    }

    fn transition(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        if !self.state.may_transition(next) {
            warn!(
                channel = %self.channel_id,
                "illegal state transition {} -> {}", self.state, next
            );
        }
        debug!(channel = %self.channel_id, "state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Drive the call until it is done; returns the disposition label
    async fn run(mut self) -> &'static str {
        // wire the tool completion queue for real (setup used placeholders)
        let (tool_tx, tool_rx) = mpsc::channel(8);
        self.tool_tx = tool_tx;
        self.tool_rx = tool_rx;

        // GREETING
        self.transition(CallState::Greeting);
        self.greeting_active = true;
        if let Err(e) = self.provider.speak_greeting().await {
            warn!(channel = %self.channel_id, "greeting request failed: {e}");
            self.disposition = "provider_error";
            // the loop below drives the fallback phrase and teardown
            self.fail_call("provider failed before greeting").await;
        }

        let mut pace = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
        pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !matches!(self.state, CallState::Done) {
            tokio::select! {
                biased;

                msg = self.control_rx.recv() => match msg {
                    Some(msg) => self.on_control(msg).await,
                    None => self.teardown("engine shutdown").await,
                },

                Some(done) = self.tool_rx.recv() => {
                    self.on_tool_done(done).await;
                }

                event = self.provider_rx.recv() => match event {
                    Some(event) => self.on_provider(event).await,
                    None => {
                        // park the branch on a channel that stays open
                        let (tx, rx) = mpsc::channel(1);
                        self._provider_keepalive = Some(tx);
                        self.provider_rx = rx;
                        if !self.supervising && !self.state.is_terminal() {
                            self.disposition = "provider_error";
                            self.fail_call("provider stream ended").await;
                        }
                    }
                },

                event = self.transport.events.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => self.teardown("transport closed").await,
                },

                _ = pace.tick() => self.on_tick().await,
            }
        }
        self.disposition
    }

    // ----- control plane -----

    async fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Ari(event) => self.on_ari(event).await,
            ControlMsg::ForceHangup => {
                self.disposition = "admin_hangup";
                self.teardown("operator hangup").await;
            }
            ControlMsg::AriDown => {
                debug!(channel = %self.channel_id, "ARI connection lost mid-call");
            }
            ControlMsg::AriUp => {
                // events may have been lost; verify the channel is alive
                let grace =
                    Duration::from_millis(self.deps.config.limits.stasis_end_grace_ms);
                self.stasis_gone_deadline = Some(Instant::now() + grace);
            }
            ControlMsg::ChannelGone => {
                info!(channel = %self.channel_id, "channel gone during ARI outage");
                self.disposition = "caller_hangup";
                self.teardown("missed StasisEnd").await;
            }
        }
    }

    async fn on_ari(&mut self, event: AriEvent) {
        match event {
            AriEvent::StasisEnd { .. }
            | AriEvent::ChannelDestroyed { .. }
            | AriEvent::ChannelHangupRequest { .. } => {
                if self.transfer_active {
                    self.disposition = "transferred";
                } else if self.disposition == "completed" {
                    self.disposition = "caller_hangup";
                }
                self.teardown("caller hangup").await;
            }
            AriEvent::ChannelDtmfReceived { digit, .. } => {
                debug!(channel = %self.channel_id, digit, "caller DTMF");
            }
            AriEvent::ChannelVarset { variable, value, .. } => {
                debug!(channel = %self.channel_id, %variable, %value, "varset");
            }
            AriEvent::PlaybackFinished { playback } => {
                self.on_playback_finished(&playback.id).await;
            }
            AriEvent::StasisStart { .. }
            | AriEvent::ChannelEnteredBridge { .. }
            | AriEvent::ChannelLeftBridge { .. }
            | AriEvent::Unknown { .. } => {}
        }
    }

    async fn on_playback_finished(&mut self, playback_id: &str) {
        if let Some((id, utterance)) = self.active_playback.take() {
            if id == playback_id {
                if let Some(files) = &self.file_playback {
                    files.cleanup(&utterance);
                }
                self.response_finished(Instant::now());
                return;
            }
            self.active_playback = Some((id, utterance));
        }
        if self.fallback_playback.as_deref() == Some(playback_id) {
            self.fallback_playback = None;
            self.teardown("fallback phrase finished").await;
        }
    }

    // ----- caller audio -----

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::CallerAudio(samples) => self.on_caller_audio(samples).await,
            TransportEvent::SilenceHint => self.endpointer.note_silence_hint(),
            TransportEvent::Hangup => {
                if self.disposition == "completed" {
                    self.disposition = "caller_hangup";
                }
                self.teardown("media hangup").await;
            }
            TransportEvent::Error(detail) => {
                warn!(channel = %self.channel_id, "transport error: {detail}");
                self.disposition = "transport_error";
                self.teardown("transport error").await;
            }
        }
    }

    async fn on_caller_audio(&mut self, samples: Vec<i16>) {
        if self.supervising || !self.state.accepts_caller_audio() {
            return;
        }
        let now = Instant::now();
        self.last_caller_audio = now;

        // caller speech keeps the suppression window open
        let mut scratch = std::mem::take(&mut self.scratch_internal);
        self.in_to_internal.process_into(&samples, &mut scratch);
        let speech = self.endpointer.process_frame(&scratch, now);
        self.scratch_internal = scratch;

        if self.suppression.active(now)
            && self.endpointer.state() != crate::vad::SpeakingState::Quiet
        {
            self.suppression.extend_for_speech(now);
        }

        // forward to the provider at its input rate
        let mut provider_buf = std::mem::take(&mut self.scratch_provider);
        self.in_to_provider.process_into(&samples, &mut provider_buf);
        let push = self.provider.push_caller_audio(&provider_buf).await;
        self.scratch_provider = provider_buf;
        if let Err(e) = push {
            warn!(channel = %self.channel_id, "caller audio push failed: {e}");
            self.fail_call("provider rejected audio").await;
            return;
        }

        match speech {
            Some(SpeechEvent::Started) => self.on_speech_started(now).await,
            Some(SpeechEvent::Ended) => self.on_speech_ended(now).await,
            None => {}
        }
    }

    async fn on_speech_started(&mut self, now: Instant) {
        // cut the fallback phrase if the caller talks over it
        if let Some(playback_id) = self.fallback_playback.take() {
            let _ = self.deps.ari.stop_playback(&playback_id).await;
            self.teardown("fallback phrase cut").await;
            return;
        }

        if !matches!(self.state, CallState::Responding | CallState::Greeting) {
            return;
        }
        match self.barge.judge(now) {
            BargeVerdict::Allowed => {
                info!(channel = %self.channel_id, "barge-in");
                self.deps.metrics.barge_ins.inc();
                self.barge.barged(now);
                self.suppression.open(now);
                self.transition(CallState::BargedIn);

                if let Err(e) = self.provider.cancel_current_response().await {
                    warn!(channel = %self.channel_id, "cancel failed: {e}");
                }
                self.response_gen = self.playback.cancel();
                self.pending_wire_frame = None;
                self.transcript.agent_done(); // keep what was already spoken
                if let Some((playback_id, utterance)) = self.active_playback.take() {
                    let _ = self.deps.ari.stop_playback(&playback_id).await;
                    if let Some(files) = &self.file_playback {
                        files.cleanup(&utterance);
                    }
                }
                self.greeting_active = false;
                self.transition(CallState::Listening);
            }
            verdict => {
                debug!(channel = %self.channel_id, ?verdict, "speech start gated");
            }
        }
    }

    async fn on_speech_ended(&mut self, now: Instant) {
        if self.resolved.provider.use_provider_vad() {
            // provider owns endpointing; arm the watchdog
            if self.deps.config.vad.fallback_enabled {
                let interval =
                    Duration::from_millis(self.deps.config.vad.fallback_interval_ms);
                self.provider_vad_deadline = Some(now + interval);
            }
            return;
        }
        if !matches!(self.state, CallState::Listening) {
            return;
        }
        self.transition(CallState::Endpointed);
        self.utterance_ended_at = Some(now);
        self.await_first_frame = true;
        if let Err(e) = self.provider.end_utterance().await {
            warn!(channel = %self.channel_id, "end_utterance failed: {e}");
            self.fail_call("provider rejected utterance end").await;
            return;
        }
        // modular pipelines think before responding; monolithic providers
        // will emit ResponseStarted directly
        if self.resolved.provider.is_monolithic() {
            self.transition(CallState::Responding);
        } else {
            self.transition(CallState::Thinking);
        }
    }

    // ----- provider events -----

    async fn on_provider(&mut self, event: ProviderEvent) {
        if self.supervising {
            return;
        }
        self.provider_vad_deadline = None;
        let now = Instant::now();
        match event {
            ProviderEvent::Ready => {}
            ProviderEvent::PartialTranscript { text } => {
                self.transcript.caller_partial(&text);
            }
            ProviderEvent::FinalTranscript { text } => {
                if let Some(ended) = self.utterance_ended_at {
                    self.deps.metrics.stt_latency.observe(ended.elapsed().as_secs_f64());
                }
                self.llm_started_at = Some(now);
                self.transcript.caller_final(&text);
                if self.resolved.provider.use_provider_vad()
                    && matches!(self.state, CallState::Listening)
                {
                    // provider-side endpointing: this is the turn boundary
                    self.transition(CallState::Endpointed);
                    self.utterance_ended_at = Some(now);
                    self.await_first_frame = true;
                    self.transition(CallState::Responding);
                }
            }
            ProviderEvent::ResponseStarted => {
                self.response_gen = self.playback.generation();
                self.playback.begin_response(self.greeting_active);
                self.barge.response_started(now, self.greeting_active);
                match self.state {
                    CallState::Greeting => {}
                    CallState::Endpointed | CallState::Thinking | CallState::Listening
                    | CallState::ToolRunning => {
                        self.transition(CallState::Responding);
                    }
                    _ => {}
                }
            }
            ProviderEvent::AgentTextChunk { text } => {
                if let Some(asked) = self.llm_started_at.take() {
                    self.deps.metrics.llm_latency.observe(asked.elapsed().as_secs_f64());
                    self.tts_started_at = Some(now);
                }
                self.transcript.agent_chunk(&text);
            }
            ProviderEvent::AgentAudioChunk { samples } => {
                if let Some(spoken) = self.tts_started_at.take() {
                    self.deps.metrics.tts_latency.observe(spoken.elapsed().as_secs_f64());
                }
                self.on_agent_audio(samples, now).await;
            }
            ProviderEvent::ResponseEnded => {
                if self.file_mode {
                    self.render_file_response().await;
                } else {
                    self.playback.mark_end_of_response();
                }
            }
            ProviderEvent::ToolCallRequest { id, name, args } => {
                self.on_tool_call(id, name, args).await;
            }
            ProviderEvent::Error { kind, detail } => {
                warn!(channel = %self.channel_id, %kind, "provider error: {detail}");
                self.disposition = "provider_error";
                self.fail_call("provider error").await;
            }
            ProviderEvent::Closed => {
                if !self.state.is_terminal() {
                    self.disposition = "provider_error";
                    self.fail_call("provider disconnected").await;
                }
            }
        }
    }

    async fn on_agent_audio(&mut self, samples: Vec<i16>, now: Instant) {
        if self.suppression.active(now) {
            self.suppression.extend_for_chunk(now);
            self.deps.metrics.frames_dropped.inc();
            return;
        }
        let mut internal = std::mem::take(&mut self.scratch_internal);
        self.provider_to_internal.process_into(&samples, &mut internal);
        if self.file_mode {
            self.file_accum.extend_from_slice(&internal);
        } else {
            self.playback.enqueue(self.response_gen, internal.clone(), now);
        }
        self.scratch_internal = internal;
    }

    /// File-mode: render the accumulated response and play it via ARI
    async fn render_file_response(&mut self) {
        let samples = std::mem::take(&mut self.file_accum);
        if samples.is_empty() {
            self.response_finished(Instant::now());
            return;
        }
        let Some(files) = &self.file_playback else {
            self.response_finished(Instant::now());
            return;
        };
        let rate = self.resolved.profile.internal_rate;
        match files.render(&samples, rate) {
            Ok(utterance) => {
                match self
                    .deps
                    .ari
                    .play_media(&self.channel_id, &utterance.media_uri)
                    .await
                {
                    Ok(playback) => {
                        if let Some(ended) = self.utterance_ended_at.take() {
                            self.deps
                                .metrics
                                .turn_latency
                                .observe(ended.elapsed().as_secs_f64());
                        }
                        self.await_first_frame = false;
                        self.active_playback = Some((playback.id, utterance));
                    }
                    Err(e) => {
                        warn!(channel = %self.channel_id, "file playback failed: {e}");
                        files.cleanup(&utterance);
                        self.response_finished(Instant::now());
                    }
                }
            }
            Err(e) => {
                warn!(channel = %self.channel_id, "render failed: {e}");
                self.response_finished(Instant::now());
            }
        }
    }

    /// The response audio has fully left for the caller
    fn response_finished(&mut self, now: Instant) {
        self.barge.response_ended(now);
        self.transcript.agent_done();
        self.suppression.clear();
        self.greeting_active = false;
        if let Some(delay) = self.hangup_after_response.take() {
            self.pending_hangup_at = Some(now + delay);
        }
        match self.state {
            CallState::Greeting | CallState::Responding => {
                self.transition(CallState::Listening)
            }
            _ => {}
        }
    }

    // ----- tools -----

    async fn on_tool_call(&mut self, id: String, name: String, args: serde_json::Value) {
        let invocation = ToolInvocation::new(id.clone(), name.clone(), args);
        let descriptor = match self.dispatcher.begin(&invocation) {
            Ok(descriptor) => descriptor,
            Err(outcome) => {
                let _ = self.provider.submit_tool_result(&id, outcome.result).await;
                return;
            }
        };
        if !descriptor.concurrent {
            self.transition(CallState::ToolRunning);
        }
        if name == "attended_transfer" {
            self.transfer_cancel = CancellationToken::new();
        }

        let mut ctx = ToolContext {
            ari: self.deps.ari.clone(),
            config: self.deps.config.clone(),
            channel_id: self.channel_id.clone(),
            caller_name: self.caller_name.clone(),
            caller_number: self.caller_number.clone(),
            transcript: self.transcript.snapshot(),
            watch: self.deps.watch.clone(),
            cancel: self.transfer_cancel.clone(),
            emailed: self.emailed.clone(),
        };
        let done_tx = self.tool_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = tools::execute(&descriptor, &invocation, &mut ctx).await;
            let _ = done_tx
                .send(ToolDone {
                    invocation_id: invocation.id,
                    name: invocation.name,
                    outcome,
                })
                .await;
        });
        if !name.starts_with("cancel_") {
            self.tool_task = Some(task);
        }
    }

    async fn on_tool_done(&mut self, done: ToolDone) {
        self.dispatcher.finish(&done.name);
        self.tool_task = None;
        debug!(
            channel = %self.channel_id,
            tool = %done.name,
            result = %done.outcome.result,
            "tool finished"
        );

        match done.outcome.disposition {
            ToolDisposition::Continue => {
                let _ = self
                    .provider
                    .submit_tool_result(&done.invocation_id, done.outcome.result)
                    .await;
                if matches!(self.state, CallState::ToolRunning) {
                    self.transition(CallState::Responding);
                }
            }
            ToolDisposition::TransferCommitted => {
                self.transfer_active = true;
                self.disposition = "transferred";
                self.teardown("transfer committed").await;
            }
            ToolDisposition::Bridged { bridge_id, peer_channel } => {
                info!(
                    channel = %self.channel_id,
                    bridge = %bridge_id,
                    peer = %peer_channel,
                    "supervising bridged call"
                );
                self.disposition = "bridged";
                self.enter_supervision().await;
            }
            ToolDisposition::HangupAfter { farewell, delay } => {
                self.hangup_after_response = Some(delay);
                self.disposition = "agent_hangup";
                match farewell {
                    Some(_) => {
                        // the model verbalizes the goodbye; hangup follows
                        // once that response drains
                        let _ = self
                            .provider
                            .submit_tool_result(&done.invocation_id, done.outcome.result)
                            .await;
                        if matches!(self.state, CallState::ToolRunning) {
                            self.transition(CallState::Responding);
                        }
                    }
                    None => {
                        self.pending_hangup_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }

    /// Caller is now talking to a human; stay only as a silent supervisor
    async fn enter_supervision(&mut self) {
        self.supervising = true;
        let _ = self.provider.close().await;
        self.playback.cancel();
        self.suppression.clear();
    }

    // ----- pacing -----

    async fn on_tick(&mut self) {
        let now = Instant::now();

        if !self.file_mode && !self.supervising {
            // a speech frame the transport refused takes the slot first
            if let Some(frame) = self.pending_wire_frame.take() {
                if self.transport.frames_out.try_send(frame.clone()).is_err() {
                    self.pending_wire_frame = Some(frame);
                }
            } else {
                match self.playback.tick() {
                    Tick::Frame(frame) => {
                        if self.await_first_frame {
                            self.await_first_frame = false;
                            if let Some(ended) = self.utterance_ended_at.take() {
                                self.deps
                                    .metrics
                                    .turn_latency
                                    .observe(ended.elapsed().as_secs_f64());
                            }
                        }
                        self.send_wire_frame(&frame, true);
                    }
                    Tick::SilencePad => {
                        let silence = vec![
                            0i16;
                            arivox_media_core::samples_per_frame(
                                self.resolved.profile.internal_rate
                            )
                        ];
                        self.send_wire_frame(&silence, false);
                    }
                    Tick::Completed => self.response_finished(now),
                    Tick::Idle => {}
                }
            }
        }

        // deadline housekeeping
        if let Some(at) = self.pending_hangup_at {
            if now >= at {
                self.teardown("farewell complete").await;
                return;
            }
        }
        if now >= self.call_deadline {
            warn!(channel = %self.channel_id, "max call duration reached");
            self.disposition = "max_duration";
            self.teardown("max call duration").await;
            return;
        }
        if !self.supervising
            && matches!(self.state, CallState::Listening)
            && now.duration_since(self.last_caller_audio)
                > Duration::from_secs(self.deps.config.limits.idle_timeout_sec)
        {
            info!(channel = %self.channel_id, "caller idle too long");
            self.disposition = "idle_timeout";
            self.teardown("idle timeout").await;
            return;
        }
        if let Some(deadline) = self.provider_vad_deadline {
            if now >= deadline {
                // provider stayed silent past the watchdog; force the turn
                self.provider_vad_deadline = None;
                debug!(channel = %self.channel_id, "provider VAD watchdog fired");
                let _ = self.provider.end_utterance().await;
            }
        }
        if let Some(deadline) = self.stasis_gone_deadline {
            if now >= deadline {
                self.stasis_gone_deadline = None;
                // probe from a helper task; the coordinator never blocks
                // on an HTTP round-trip inside the frame tick
                let ari = self.deps.ari.clone();
                let registry = self.deps.registry.clone();
                let channel_id = self.channel_id.clone();
                tokio::spawn(async move {
                    if matches!(
                        ari.channel_info(&channel_id).await,
                        Err(arivox_ari_client::AriError::NotFound(_))
                    ) {
                        registry.send(&channel_id, ControlMsg::ChannelGone);
                    }
                });
            }
        }
    }

    fn send_wire_frame(&mut self, frame: &[i16], is_speech: bool) {
        let mut wire = std::mem::take(&mut self.scratch_wire);
        self.internal_to_wire.process_into(frame, &mut wire);
        if self.transport.frames_out.try_send(wire.clone()).is_err() {
            if is_speech {
                // back-pressure may swallow padding, never begun speech
                self.pending_wire_frame = Some(wire.clone());
            } else {
                self.deps.metrics.frames_dropped.inc();
            }
        }
        self.scratch_wire = wire;
    }

    // ----- failure & teardown -----

    /// Terminal mid-call failure: say something, then hang up
    async fn fail_call(&mut self, reason: &str) {
        if self.state.is_terminal() || self.fallback_playback.is_some() {
            return;
        }
        warn!(channel = %self.channel_id, "call failing: {reason}");
        // callers are never left in silence: play the canned phrase and
        // tear down when it finishes (or the caller talks over it)
        match self.deps.ari.play_media(&self.channel_id, FALLBACK_MEDIA).await {
            Ok(playback) => {
                self.fallback_playback = Some(playback.id);
                let fallback_deadline = Duration::from_millis(
                    self.deps.config.limits.fallback_timeout_ms,
                );
                self.pending_hangup_at = Some(Instant::now() + fallback_deadline);
                // playback.cancel() keeps any queued agent audio from
                // playing over the apology
                self.response_gen = self.playback.cancel();
            }
            Err(_) => self.teardown(reason).await,
        }
    }

    /// Idempotent, ordered resource release
    async fn teardown(&mut self, reason: &str) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.transition(CallState::TearingDown);
        info!(channel = %self.channel_id, "tearing down: {reason}");

        let deadline = Duration::from_millis(self.deps.config.limits.teardown_deadline_ms);
        let result = timeout(deadline, async {
            // order: provider, playback, transport, bridge, tool task
            let _ = self.provider.close().await;
            self.playback.cancel();
            if let Some((playback_id, utterance)) = self.active_playback.take() {
                let _ = self.deps.ari.stop_playback(&playback_id).await;
                if let Some(files) = &self.file_playback {
                    files.cleanup(&utterance);
                }
            }
            // dropping the writer makes the transport close its socket
            let (closed_tx, _closed_rx) = mpsc::channel(1);
            self.transport.frames_out = closed_tx;

            self.deps.watch.release(&self.media_channel_id);
            let _ = self.deps.ari.hangup(&self.media_channel_id).await;
            if !self.transfer_active && self.disposition != "bridged" {
                let _ = self.deps.ari.destroy_bridge(&self.bridge_id).await;
                let _ = self.deps.ari.hangup(&self.channel_id).await;
            }
            if let Some(task) = self.tool_task.take() {
                self.transfer_cancel.cancel();
                task.abort();
            }
        })
        .await;
        if result.is_err() {
            warn!(
                channel = %self.channel_id,
                "teardown exceeded {deadline:?}, forcing close"
            );
        }

        if let Some(ports) = &self.deps.rtp_ports {
            if let Some(lease) = self.rtp_lease.take() {
                ports.release(&lease);
            }
        }

        info!(
            channel = %self.channel_id,
            turns = self.transcript.turns(),
            partials = self.transcript.partials_seen(),
            frames_buffered_ms = self.playback.buffered_ms(),
            disposition = self.disposition,
            "call summary"
        );
        self.state = CallState::Done;
    }
}

/// Pull the AI_* channel variables, preferring the StasisStart snapshot
async fn fetch_call_vars(ari: &AriClient, channel: &Channel) -> CallVars {
    let mut vars = CallVars::from_channel_vars(&channel.channelvars);
    for (slot, name) in [
        (&mut vars.provider as &mut Option<String>, "AI_PROVIDER"),
        (&mut vars.context, "AI_CONTEXT"),
        (&mut vars.audio_profile, "AI_AUDIO_PROFILE"),
        (&mut vars.greeting, "AI_GREETING"),
        (&mut vars.persona, "AI_PERSONA"),
    ] {
        if slot.is_none() {
            if let Ok(value) = ari.get_variable(&channel.id, name).await {
                *slot = value;
            }
        }
    }
    vars
}

async fn add_to_bridge_with_retry(ari: &AriClient, bridge_id: &str, channel_id: &str) -> Result<()> {
    let mut last = None;
    for attempt in 0..5 {
        match ari.add_to_bridge(bridge_id, channel_id).await {
            Ok(()) => return Ok(()),
            Err(e @ arivox_ari_client::AriError::StateConflict(_)) => {
                // the media channel may still be coming up
                debug!(attempt, "bridge add conflict, retrying");
                last = Some(e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last.map(EngineError::from).unwrap_or_else(|| {
        EngineError::Transport("bridge add retries exhausted".into())
    }))
}

/// Asterisk format name for an externalMedia originate
fn asterisk_format(spec: CodecSpec) -> &'static str {
    match (spec.encoding, spec.rate) {
        (Encoding::Ulaw, _) => "ulaw",
        (Encoding::Alaw, _) => "alaw",
        (Encoding::Slin, 16_000) => "slin16",
        (Encoding::Slin, 24_000) => "slin24",
        (Encoding::Slin, _) => "slin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asterisk_format_mapping() {
        assert_eq!(asterisk_format(CodecSpec::new(Encoding::Ulaw, 8_000)), "ulaw");
        assert_eq!(asterisk_format(CodecSpec::new(Encoding::Slin, 8_000)), "slin");
        assert_eq!(asterisk_format(CodecSpec::new(Encoding::Slin, 16_000)), "slin16");
        assert_eq!(asterisk_format(CodecSpec::new(Encoding::Alaw, 8_000)), "alaw");
    }
}
