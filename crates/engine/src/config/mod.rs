//! Configuration document
//!
//! One TOML file describes the whole engine: the ARI endpoint, the two
//! media transports, providers and pipelines, per-call contexts, audio
//! profiles, endpointing tunables and the tool set. Secrets are pulled
//! from the environment with `${VAR}` syntax before parsing. Unknown keys
//! warn instead of erroring so an older engine can run a newer document.

mod reload;
mod resolver;

pub use reload::{classify_diff, ConfigStore, ReloadReport};
pub use resolver::{resolve_call, CallVars, ResolvedCall, ResolvedProvider};

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use arivox_media_core::profile::AudioProfile;

use crate::error::{EngineError, Result};

fn default_true() -> bool {
    true
}

/// ARI endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsteriskConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "AsteriskConfig::default_app")]
    pub app: String,
    #[serde(default = "AsteriskConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl AsteriskConfig {
    fn default_app() -> String {
        "arivox".into()
    }
    fn default_request_timeout_ms() -> u64 {
        5_000
    }
}

/// AudioSocket listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSocketConfig {
    /// Address the TCP listener binds
    #[serde(default = "AudioSocketConfig::default_listen")]
    pub listen_addr: String,
    /// Address the PBX is told to dial (differs behind NAT/containers)
    #[serde(default = "AudioSocketConfig::default_advertise")]
    pub advertise_addr: String,
}

impl AudioSocketConfig {
    fn default_listen() -> String {
        "0.0.0.0:9092".into()
    }
    fn default_advertise() -> String {
        "127.0.0.1:9092".into()
    }
}

impl Default for AudioSocketConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen(),
            advertise_addr: Self::default_advertise(),
        }
    }
}

/// ExternalMedia RTP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMediaConfig {
    #[serde(default = "ExternalMediaConfig::default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "ExternalMediaConfig::default_advertise_ip")]
    pub advertise_ip: String,
    #[serde(default = "ExternalMediaConfig::default_port_min")]
    pub port_min: u16,
    #[serde(default = "ExternalMediaConfig::default_port_max")]
    pub port_max: u16,
}

impl ExternalMediaConfig {
    fn default_listen_ip() -> String {
        "0.0.0.0".into()
    }
    fn default_advertise_ip() -> String {
        "127.0.0.1".into()
    }
    fn default_port_min() -> u16 {
        18_000
    }
    fn default_port_max() -> u16 {
        18_255
    }
}

impl Default for ExternalMediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: Self::default_listen_ip(),
            advertise_ip: Self::default_advertise_ip(),
            port_min: Self::default_port_min(),
            port_max: Self::default_port_max(),
        }
    }
}

/// Which media path the PBX uses to reach us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioTransportKind {
    Audiosocket,
    Externalmedia,
}

/// How agent audio reaches the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamMode {
    /// Frames paced directly onto the media transport
    Streaming,
    /// Rendered to WAV files played through ARI
    File,
}

/// What a provider entry actually is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    /// One duplex session covering STT+LLM+TTS
    Monolithic,
    /// Speech-to-text service for modular pipelines
    Stt,
    /// Language model for modular pipelines
    Llm,
    /// Text-to-speech service for modular pipelines
    Tts,
}

/// One provider endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderRole,
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Monolithic only: trust the provider's own turn detection
    #[serde(default)]
    pub use_provider_vad: bool,
    /// TTS only: `stream` or `file`
    #[serde(default)]
    pub tts_mode: Option<TtsMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsMode {
    Stream,
    File,
}

/// A modular STT+LLM+TTS composition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stt: String,
    pub llm: String,
    pub tts: String,
}

/// A named per-call behavior bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub persona: String,
    /// Tool allowlist; empty means no tools
    #[serde(default)]
    pub tools: Vec<String>,
    /// Audio profile override
    #[serde(default)]
    pub profile: Option<String>,
    /// Provider or pipeline override
    #[serde(default)]
    pub provider: Option<String>,
}

/// Endpointing tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "VadConfig::default_energy_threshold")]
    pub energy_threshold: f32,
    #[serde(default = "default_true")]
    pub adaptive_threshold_enabled: bool,
    /// Noise-floor tracking rate, fraction per second
    #[serde(default = "VadConfig::default_noise_adaptation_rate")]
    pub noise_adaptation_rate: f32,
    /// WebRTC-style classifier aggressiveness, 0..=3
    #[serde(default = "VadConfig::default_aggressiveness")]
    pub aggressiveness: u8,
    /// Consecutive voiced frames to confirm speech start
    #[serde(default = "VadConfig::default_start_frames")]
    pub webrtc_start_frames: u32,
    /// Consecutive unvoiced frames to confirm utterance end
    #[serde(default = "VadConfig::default_end_silence_frames")]
    pub webrtc_end_silence_frames: u32,
    /// Minimum voiced audio before a start can confirm
    #[serde(default = "VadConfig::default_min_ms")]
    pub min_ms: u32,
    /// Watchdog when the provider owns endpointing
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default = "VadConfig::default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,
}

impl VadConfig {
    fn default_energy_threshold() -> f32 {
        0.012
    }
    fn default_noise_adaptation_rate() -> f32 {
        0.1
    }
    fn default_aggressiveness() -> u8 {
        2
    }
    fn default_start_frames() -> u32 {
        3
    }
    fn default_end_silence_frames() -> u32 {
        25
    }
    fn default_min_ms() -> u32 {
        120
    }
    fn default_fallback_interval_ms() -> u64 {
        5_000
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty vad table deserializes")
    }
}

/// Barge-in gates and suppression windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BargeInConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "BargeInConfig::default_initial_protection_ms")]
    pub initial_protection_ms: u64,
    #[serde(default = "BargeInConfig::default_greeting_protection_ms")]
    pub greeting_protection_ms: u64,
    #[serde(default = "BargeInConfig::default_post_tts_end_protection_ms")]
    pub post_tts_end_protection_ms: u64,
    #[serde(default = "BargeInConfig::default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "BargeInConfig::default_provider_output_suppress_ms")]
    pub provider_output_suppress_ms: u64,
    #[serde(default = "BargeInConfig::default_provider_output_suppress_extend_ms")]
    pub provider_output_suppress_extend_ms: u64,
    #[serde(default = "BargeInConfig::default_chunk_extend_ms")]
    pub chunk_extend_ms: u64,
}

impl BargeInConfig {
    fn default_initial_protection_ms() -> u64 {
        800
    }
    fn default_greeting_protection_ms() -> u64 {
        1_500
    }
    fn default_post_tts_end_protection_ms() -> u64 {
        400
    }
    fn default_cooldown_ms() -> u64 {
        1_000
    }
    fn default_provider_output_suppress_ms() -> u64 {
        600
    }
    fn default_provider_output_suppress_extend_ms() -> u64 {
        300
    }
    fn default_chunk_extend_ms() -> u64 {
        100
    }
}

impl Default for BargeInConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty barge_in table deserializes")
    }
}

/// Playback scheduler tunables not carried by the audio profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Silence frames emitted on underrun before pausing
    #[serde(default = "StreamingConfig::default_empty_backoff_ticks_max")]
    pub empty_backoff_ticks_max: u32,
    #[serde(default)]
    pub agc_enabled: bool,
    #[serde(default = "StreamingConfig::default_target_rms")]
    pub target_rms: f32,
    #[serde(default = "StreamingConfig::default_max_gain_db")]
    pub max_gain_db: f32,
    /// Shared directory for file-playback fallback, visible to the PBX
    #[serde(default = "StreamingConfig::default_media_dir")]
    pub media_dir: String,
}

impl StreamingConfig {
    fn default_empty_backoff_ticks_max() -> u32 {
        10
    }
    fn default_target_rms() -> f32 {
        0.18
    }
    fn default_max_gain_db() -> f32 {
        12.0
    }
    fn default_media_dir() -> String {
        "/var/lib/arivox/media".into()
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty streaming table deserializes")
    }
}

/// One entry in the transfer destination map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub target: String,
    #[serde(default = "default_true")]
    pub attended_allowed: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Extension,
    Queue,
    RingGroup,
}

/// Transfer tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dialplan context blind extension transfers redirect into
    #[serde(default = "TransferConfig::default_ext_context")]
    pub ext_context: String,
    /// Dialplan context queue transfers continue into
    #[serde(default = "TransferConfig::default_queue_context")]
    pub queue_context: String,
    /// Dialplan context ring-group transfers continue into
    #[serde(default = "TransferConfig::default_ring_group_context")]
    pub ring_group_context: String,
    #[serde(default)]
    pub destinations: HashMap<String, Destination>,
}

impl TransferConfig {
    fn default_ext_context() -> String {
        "from-internal".into()
    }
    fn default_queue_context() -> String {
        "ext-queues".into()
    }
    fn default_ring_group_context() -> String {
        "ext-group".into()
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty transfer table deserializes")
    }
}

/// Attended (warm) transfer timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendedTransferConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "AttendedTransferConfig::default_dial_timeout_seconds")]
    pub dial_timeout_seconds: u64,
    #[serde(default = "AttendedTransferConfig::default_accept_timeout_seconds")]
    pub accept_timeout_seconds: u64,
    #[serde(default = "AttendedTransferConfig::default_tts_timeout_seconds")]
    pub tts_timeout_seconds: u64,
    #[serde(default)]
    pub moh_class: Option<String>,
}

impl AttendedTransferConfig {
    fn default_dial_timeout_seconds() -> u64 {
        25
    }
    fn default_accept_timeout_seconds() -> u64 {
        15
    }
    fn default_tts_timeout_seconds() -> u64 {
        10
    }
}

impl Default for AttendedTransferConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty attended_transfer table deserializes")
    }
}

/// Hangup/voicemail tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "HangupToolConfig::default_farewell_hangup_delay_sec")]
    pub farewell_hangup_delay_sec: u64,
    /// Dialplan extension `leave_voicemail` redirects into
    #[serde(default = "HangupToolConfig::default_voicemail_exten")]
    pub voicemail_exten: String,
    #[serde(default = "HangupToolConfig::default_voicemail_context")]
    pub voicemail_context: String,
}

impl HangupToolConfig {
    fn default_farewell_hangup_delay_sec() -> u64 {
        2
    }
    fn default_voicemail_exten() -> String {
        "*97".into()
    }
    fn default_voicemail_context() -> String {
        "from-internal".into()
    }
}

impl Default for HangupToolConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty hangup table deserializes")
    }
}

/// Email tools (summary + caller-requested transcript)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailToolConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Opaque mail relay accepting a JSON POST
    #[serde(default)]
    pub relay_url: String,
    #[serde(default)]
    pub relay_token: String,
    /// Recipient for `send_email_summary`
    #[serde(default)]
    pub summary_recipient: String,
    #[serde(default)]
    pub from_address: String,
    /// Verify recipient domains have MX records before sending
    #[serde(default)]
    pub mx_check: bool,
}

impl Default for EmailToolConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty email table deserializes")
    }
}

/// Tool group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub attended_transfer: AttendedTransferConfig,
    #[serde(default)]
    pub hangup: HangupToolConfig,
    #[serde(default)]
    pub email: EmailToolConfig,
}

/// LLM conversation shaping (modular pipelines)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_history_max_turns")]
    pub history_max_turns: usize,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "LlmConfig::default_max_tokens")]
    pub max_tokens: u32,
}

impl LlmConfig {
    fn default_history_max_turns() -> usize {
        12
    }
    fn default_temperature() -> f32 {
        0.6
    }
    fn default_max_tokens() -> u32 {
        512
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty llm table deserializes")
    }
}

/// Admin HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "AdminConfig::default_bind")]
    pub bind: String,
}

impl AdminConfig {
    fn default_bind() -> String {
        "127.0.0.1:8089".into()
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { bind: Self::default_bind() }
    }
}

/// Global deadlines and ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_max_call_duration_sec")]
    pub max_call_duration_sec: u64,
    /// Caller silent this long in LISTENING ends the call politely
    #[serde(default = "LimitsConfig::default_idle_timeout_sec")]
    pub idle_timeout_sec: u64,
    #[serde(default = "LimitsConfig::default_teardown_deadline_ms")]
    pub teardown_deadline_ms: u64,
    #[serde(default = "LimitsConfig::default_provider_grace_ms")]
    pub provider_grace_ms: u64,
    #[serde(default = "LimitsConfig::default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "LimitsConfig::default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    /// Grace after ARI reconnect before a missed StasisEnd counts as hangup
    #[serde(default = "LimitsConfig::default_stasis_end_grace_ms")]
    pub stasis_end_grace_ms: u64,
    /// Spoken to the caller when a call dies mid-flight
    #[serde(default = "LimitsConfig::default_fallback_phrase")]
    pub fallback_phrase: String,
}

impl LimitsConfig {
    fn default_max_call_duration_sec() -> u64 {
        3_600
    }
    fn default_idle_timeout_sec() -> u64 {
        90
    }
    fn default_teardown_deadline_ms() -> u64 {
        5_000
    }
    fn default_provider_grace_ms() -> u64 {
        2_000
    }
    fn default_connection_timeout_ms() -> u64 {
        5_000
    }
    fn default_fallback_timeout_ms() -> u64 {
        3_000
    }
    fn default_stasis_end_grace_ms() -> u64 {
        10_000
    }
    fn default_fallback_phrase() -> String {
        "I'm sorry, something went wrong on my end. Please call back in a moment.".into()
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty limits table deserializes")
    }
}

/// The whole document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub asterisk: AsteriskConfig,
    #[serde(default)]
    pub audiosocket: AudioSocketConfig,
    #[serde(default)]
    pub external_media: ExternalMediaConfig,
    pub audio_transport: AudioTransportKind,
    #[serde(default = "Config::default_downstream_mode")]
    pub downstream_mode: DownstreamMode,
    #[serde(default)]
    pub active_pipeline: Option<String>,
    pub default_provider: String,
    #[serde(default = "Config::default_context_name")]
    pub default_context: String,
    #[serde(default = "Config::default_profile_name")]
    pub default_profile: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineConfig>,
    #[serde(default)]
    pub contexts: HashMap<String, ContextConfig>,
    /// User-defined audio profiles, looked up before the built-ins
    #[serde(default)]
    pub profiles: HashMap<String, AudioProfile>,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub barge_in: BargeInConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    fn default_downstream_mode() -> DownstreamMode {
        DownstreamMode::Streaming
    }
    fn default_context_name() -> String {
        "default".into()
    }
    fn default_profile_name() -> String {
        "telephony_ulaw_8k".into()
    }

    /// Parse a document from text, after env substitution
    pub fn from_str(raw: &str) -> Result<(Self, Vec<String>)> {
        let substituted = substitute_env(raw)?;
        let value: toml::Value = toml::from_str(&substituted)
            .map_err(|e| EngineError::Config(format!("TOML parse: {e}")))?;
        let warnings = scan_unknown_keys(&value);
        let config: Config = value
            .try_into()
            .map_err(|e| EngineError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok((config, warnings))
    }

    /// Load and validate a document from disk
    pub fn load(path: &Path) -> Result<(Self, Vec<String>)> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_str(&raw)
    }

    /// Look up a profile by name: user-defined first, then built-in
    pub fn profile(&self, name: &str) -> Result<AudioProfile> {
        if let Some(profile) = self.profiles.get(name) {
            return Ok(profile.clone());
        }
        AudioProfile::builtin(name)
            .ok_or_else(|| EngineError::Config(format!("unknown audio profile '{name}'")))
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<()> {
        if !self.providers.contains_key(&self.default_provider)
            && !self.pipelines.contains_key(&self.default_provider)
        {
            return Err(EngineError::Config(format!(
                "default_provider '{}' is neither a provider nor a pipeline",
                self.default_provider
            )));
        }
        if let Some(pipeline) = &self.active_pipeline {
            if !self.pipelines.contains_key(pipeline) {
                return Err(EngineError::Config(format!(
                    "active_pipeline '{pipeline}' is not defined"
                )));
            }
        }
        for (name, pipeline) in &self.pipelines {
            for (role, member) in [
                (ProviderRole::Stt, &pipeline.stt),
                (ProviderRole::Llm, &pipeline.llm),
                (ProviderRole::Tts, &pipeline.tts),
            ] {
                match self.providers.get(member) {
                    None => {
                        return Err(EngineError::Config(format!(
                            "pipeline '{name}' references unknown provider '{member}'"
                        )))
                    }
                    Some(p) if p.kind != role => {
                        return Err(EngineError::Config(format!(
                            "pipeline '{name}': provider '{member}' is {:?}, expected {role:?}",
                            p.kind
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        for (name, context) in &self.contexts {
            if let Some(profile) = &context.profile {
                self.profile(profile).map_err(|_| {
                    EngineError::Config(format!(
                        "context '{name}' references unknown profile '{profile}'"
                    ))
                })?;
            }
            if let Some(provider) = &context.provider {
                if !self.providers.contains_key(provider)
                    && !self.pipelines.contains_key(provider)
                {
                    return Err(EngineError::Config(format!(
                        "context '{name}' references unknown provider '{provider}'"
                    )));
                }
            }
        }
        for profile in self.profiles.values() {
            profile
                .validate()
                .map_err(|e| EngineError::Config(e.to_string()))?;
        }
        if self.external_media.port_min > self.external_media.port_max {
            return Err(EngineError::Config(
                "external_media.port_min exceeds port_max".into(),
            ));
        }
        if self.vad.aggressiveness > 3 {
            return Err(EngineError::Config(
                "vad.aggressiveness must be 0..=3".into(),
            ));
        }
        Ok(())
    }
}

/// Replace `${VAR}` references with environment values
fn substitute_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            return Err(EngineError::Config("unterminated ${ in config".into()));
        };
        let var = &tail[..end];
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                return Err(EngineError::Config(format!(
                    "environment variable '{var}' referenced in config is not set"
                )))
            }
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "asterisk",
    "audiosocket",
    "external_media",
    "audio_transport",
    "downstream_mode",
    "active_pipeline",
    "default_provider",
    "default_context",
    "default_profile",
    "providers",
    "pipelines",
    "contexts",
    "profiles",
    "vad",
    "barge_in",
    "streaming",
    "tools",
    "llm",
    "admin",
    "limits",
];

const GROUP_KEYS: &[(&str, &[&str])] = &[
    (
        "asterisk",
        &["base_url", "username", "password", "app", "request_timeout_ms"],
    ),
    ("audiosocket", &["listen_addr", "advertise_addr"]),
    (
        "external_media",
        &["listen_ip", "advertise_ip", "port_min", "port_max"],
    ),
    (
        "vad",
        &[
            "energy_threshold",
            "adaptive_threshold_enabled",
            "noise_adaptation_rate",
            "aggressiveness",
            "webrtc_start_frames",
            "webrtc_end_silence_frames",
            "min_ms",
            "fallback_enabled",
            "fallback_interval_ms",
        ],
    ),
    (
        "barge_in",
        &[
            "enabled",
            "initial_protection_ms",
            "greeting_protection_ms",
            "post_tts_end_protection_ms",
            "cooldown_ms",
            "provider_output_suppress_ms",
            "provider_output_suppress_extend_ms",
            "chunk_extend_ms",
        ],
    ),
    (
        "streaming",
        &[
            "empty_backoff_ticks_max",
            "agc_enabled",
            "target_rms",
            "max_gain_db",
            "media_dir",
        ],
    ),
    (
        "llm",
        &["history_max_turns", "temperature", "max_tokens"],
    ),
    ("admin", &["bind"]),
    (
        "limits",
        &[
            "max_call_duration_sec",
            "idle_timeout_sec",
            "teardown_deadline_ms",
            "provider_grace_ms",
            "connection_timeout_ms",
            "fallback_timeout_ms",
            "stasis_end_grace_ms",
            "fallback_phrase",
        ],
    ),
];

/// Collect warnings for keys the engine does not recognize
fn scan_unknown_keys(value: &toml::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(table) = value.as_table() else {
        return warnings;
    };
    for key in table.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            warnings.push(format!("unknown top-level key '{key}'"));
        }
    }
    for (group, known) in GROUP_KEYS {
        if let Some(sub) = table.get(*group).and_then(|v| v.as_table()) {
            for key in sub.keys() {
                if !known.contains(&key.as_str()) {
                    warnings.push(format!("unknown key '{group}.{key}'"));
                }
            }
        }
    }
    warnings
}

#[cfg(test)]
pub(crate) fn minimal_toml() -> String {
    r#"
        audio_transport = "audiosocket"
        default_provider = "agent"

        [asterisk]
        base_url = "http://127.0.0.1:8088"
        username = "arivox"
        password = "secret"

        [providers.agent]
        kind = "monolithic"
        url = "wss://realtime.example/v1"
        api_key = "k"

        [contexts.default]
        greeting = "Hello, how can I help?"
        prompt = "You are a helpful receptionist."
    "#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_loads_with_defaults() {
        let (config, warnings) = Config::from_str(&minimal_toml()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.default_provider, "agent");
        assert_eq!(config.downstream_mode, DownstreamMode::Streaming);
        assert_eq!(config.vad.aggressiveness, 2);
        assert_eq!(config.barge_in.provider_output_suppress_ms, 600);
        assert_eq!(config.limits.teardown_deadline_ms, 5_000);
        assert_eq!(config.admin.bind, "127.0.0.1:8089");
    }

    #[test]
    fn unknown_keys_warn_but_load() {
        let mut raw = minimal_toml();
        raw.push_str("\n[vad]\nshiny_new_knob = 7\n");
        raw.push_str("\n[experimental]\nfoo = 1\n");
        let (_, warnings) = Config::from_str(&raw).unwrap();
        assert!(warnings.iter().any(|w| w.contains("vad.shiny_new_knob")));
        assert!(warnings.iter().any(|w| w.contains("experimental")));
    }

    #[test]
    fn missing_default_provider_is_fatal() {
        let raw = minimal_toml().replace("default_provider = \"agent\"",
                                         "default_provider = \"ghost\"");
        assert!(matches!(
            Config::from_str(&raw),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn pipeline_member_kinds_are_checked() {
        let mut raw = minimal_toml();
        raw.push_str(
            r#"
            [pipelines.local_hybrid]
            stt = "agent"
            llm = "agent"
            tts = "agent"
            "#,
        );
        let err = Config::from_str(&raw).unwrap_err();
        assert!(err.to_string().contains("expected Stt"), "{err}");
    }

    #[test]
    fn env_substitution_resolves_and_reports_missing() {
        std::env::set_var("ARIVOX_TEST_SECRET", "hunter2");
        let raw = minimal_toml().replace("password = \"secret\"",
                                         "password = \"${ARIVOX_TEST_SECRET}\"");
        let (config, _) = Config::from_str(&raw).unwrap();
        assert_eq!(config.asterisk.password, "hunter2");

        let raw = minimal_toml().replace("password = \"secret\"",
                                         "password = \"${ARIVOX_TEST_UNSET_VAR}\"");
        assert!(Config::from_str(&raw).is_err());
    }

    #[test]
    fn context_profile_references_are_validated() {
        let mut raw = minimal_toml();
        raw.push_str("\n[contexts.sales]\nprofile = \"no_such_profile\"\n");
        assert!(Config::from_str(&raw).is_err());

        let mut raw = minimal_toml();
        raw.push_str("\n[contexts.sales]\nprofile = \"wideband_pcm_16k\"\n");
        assert!(Config::from_str(&raw).is_ok());
    }

    #[test]
    fn port_range_is_validated() {
        let mut raw = minimal_toml();
        raw.push_str("\n[external_media]\nport_min = 2000\nport_max = 1000\n");
        assert!(Config::from_str(&raw).is_err());
    }
}
