//! AI-initiated tools
//!
//! The model acts on the call through a small tool set: transfers (blind
//! and attended), hangup, voicemail, and transcript email. Tools execute
//! with uniform semantics regardless of provider: each declares its
//! argument schema, whether it ends the call, whether it may run beside
//! agent speech, and a hard timeout. The dispatcher enforces
//! at-most-one running non-concurrent tool per session and always hands
//! a structured result back so the model can verbalize the outcome.

pub mod call_control;
pub mod email;
pub mod transfer;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use arivox_ari_client::AriClient;

use crate::config::Config;
use crate::error::{EngineError, ToolErrorKind};
use crate::provider::ToolSchema;
use crate::session::transcript::TranscriptEntry;

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One tool call as tracked by the session
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolStatus,
    pub result: Option<Value>,
}

impl ToolInvocation {
    pub fn new(id: String, name: String, args: Value) -> Self {
        Self {
            id,
            name,
            args,
            status: ToolStatus::Pending,
            result: None,
        }
    }
}

/// What the coordinator must do after a tool completes
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDisposition {
    /// Conversation continues normally
    Continue,
    /// Caller was handed off; end the session, leave the call up
    TransferCommitted,
    /// Caller bridged with a human; supervise silently until hangup
    Bridged { bridge_id: String, peer_channel: String },
    /// Speak a farewell, then hang up after the configured delay
    HangupAfter {
        farewell: Option<String>,
        delay: Duration,
    },
}

/// Structured completion handed back to the provider
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub disposition: ToolDisposition,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            disposition: ToolDisposition::Continue,
        }
    }

    pub fn with_disposition(result: Value, disposition: ToolDisposition) -> Self {
        Self { result, disposition }
    }

    /// Build the error-shaped result the model sees
    pub fn error(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            result: json!({
                "status": "error",
                "kind": kind.to_string(),
                "message": message.into(),
            }),
            disposition: ToolDisposition::Continue,
        }
    }
}

/// Signals routed to an attended transfer about its destination leg
#[derive(Debug, Clone, PartialEq)]
pub enum TransferSignal {
    /// The destination channel entered our application (answered)
    Answered,
    /// The destination channel went away (declined, failed, hung up)
    Gone,
    /// DTMF digit from the destination
    Digit(char),
}

/// Routes ARI events for transfer legs to the tool awaiting them
///
/// The global event router consults this map before per-session routing,
/// so an originated destination channel never spawns a new AI session.
#[derive(Debug, Default, Clone)]
pub struct ChannelWatch {
    inner: Arc<DashMap<String, mpsc::Sender<TransferSignal>>>,
}

impl ChannelWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a channel id; signals for it flow to the returned receiver
    pub fn register(&self, channel_id: &str) -> mpsc::Receiver<TransferSignal> {
        let (tx, rx) = mpsc::channel(16);
        self.inner.insert(channel_id.to_string(), tx);
        rx
    }

    pub fn release(&self, channel_id: &str) {
        self.inner.remove(channel_id);
    }

    /// True when the event was claimed by a watcher
    pub fn route(&self, channel_id: &str, signal: TransferSignal) -> bool {
        if let Some(tx) = self.inner.get(channel_id) {
            let _ = tx.try_send(signal);
            true
        } else {
            false
        }
    }
}

/// Everything a tool may act with
pub struct ToolContext {
    pub ari: AriClient,
    pub config: Arc<Config>,
    /// The caller's channel
    pub channel_id: String,
    pub caller_name: String,
    pub caller_number: String,
    /// Transcript snapshot for the email tools
    pub transcript: Vec<TranscriptEntry>,
    pub watch: ChannelWatch,
    /// Cooperative cancellation for `cancel_transfer`
    pub cancel: tokio_util::sync::CancellationToken,
    /// Addresses already emailed this call (request_transcript dedup)
    pub emailed: Arc<parking_lot::Mutex<HashSet<String>>>,
}

impl ToolContext {
    /// Record an address as emailed; false when it already was
    pub fn mark_emailed(&self, address: &str) -> bool {
        self.emailed.lock().insert(address.to_ascii_lowercase())
    }
}

/// Static description of one tool
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    /// Execution ends the AI session when it succeeds
    pub terminates_call: bool,
    /// May run while the agent is speaking
    pub concurrent: bool,
    pub timeout: Duration,
}

/// The tools this build knows, filtered by config and context allowlist
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut descriptors = Vec::new();
        if config.tools.transfer.enabled {
            descriptors.push(transfer::blind_descriptor(config));
            descriptors.push(transfer::cancel_descriptor());
        }
        if config.tools.attended_transfer.enabled {
            descriptors.push(transfer::attended_descriptor(config));
        }
        if config.tools.hangup.enabled {
            descriptors.push(call_control::hangup_descriptor());
            descriptors.push(call_control::voicemail_descriptor());
        }
        if config.tools.email.enabled {
            descriptors.push(email::summary_descriptor());
            descriptors.push(email::transcript_descriptor());
        }
        Self { descriptors }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Schemas offered to the model for one context
    pub fn schemas_for(&self, allowlist: &[String]) -> Vec<ToolSchema> {
        self.descriptors
            .iter()
            .filter(|d| allowlist.iter().any(|a| a == d.name))
            .map(|d| ToolSchema {
                name: d.name.to_string(),
                description: d.description.to_string(),
                parameters: d.parameters.clone(),
            })
            .collect()
    }
}

/// Per-session execution state
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    /// Name of the non-concurrent tool currently running, if any
    running: Option<String>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            running: None,
        }
    }

    pub fn running(&self) -> Option<&str> {
        self.running.as_deref()
    }

    /// Begin an invocation; rejects a second non-concurrent tool
    pub fn begin(&mut self, invocation: &ToolInvocation) -> Result<ToolDescriptor, ToolOutcome> {
        let Some(descriptor) = self.registry.descriptor(&invocation.name) else {
            return Err(ToolOutcome::error(
                ToolErrorKind::InvalidArgs,
                format!("unknown tool '{}'", invocation.name),
            ));
        };
        if !descriptor.concurrent {
            if let Some(active) = &self.running {
                return Err(ToolOutcome::error(
                    ToolErrorKind::InvalidArgs,
                    format!("tool '{active}' is still running"),
                ));
            }
            self.running = Some(invocation.name.clone());
        }
        Ok(descriptor.clone())
    }

    pub fn finish(&mut self, name: &str) {
        if self.running.as_deref() == Some(name) {
            self.running = None;
        }
    }
}

/// Run one tool to completion under its declared timeout
pub async fn execute(
    descriptor: &ToolDescriptor,
    invocation: &ToolInvocation,
    ctx: &mut ToolContext,
) -> ToolOutcome {
    info!(tool = %invocation.name, id = %invocation.id, "tool dispatch");
    let work = run_tool(invocation, ctx);
    match tokio::time::timeout(descriptor.timeout, work).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(tool = %invocation.name, "tool timed out after {:?}", descriptor.timeout);
            ToolOutcome::error(
                ToolErrorKind::Timeout,
                format!("{} did not finish within {:?}", invocation.name, descriptor.timeout),
            )
        }
    }
}

async fn run_tool(invocation: &ToolInvocation, ctx: &mut ToolContext) -> ToolOutcome {
    match invocation.name.as_str() {
        "transfer" => transfer::blind(&invocation.args, ctx).await,
        "attended_transfer" => transfer::attended(&invocation.args, ctx).await,
        "cancel_transfer" => transfer::cancel(ctx).await,
        "hangup_call" => call_control::hangup(&invocation.args, ctx).await,
        "leave_voicemail" => call_control::voicemail(ctx).await,
        "send_email_summary" => email::send_summary(ctx).await,
        "request_transcript" => email::request_transcript(&invocation.args, ctx).await,
        other => ToolOutcome::error(
            ToolErrorKind::InvalidArgs,
            format!("unknown tool '{other}'"),
        ),
    }
}

/// Convert an engine error into the structured tool result shape
pub fn outcome_from_error(error: EngineError) -> ToolOutcome {
    match error {
        EngineError::Tool { kind, detail } => ToolOutcome::error(kind, detail),
        other => ToolOutcome::error(ToolErrorKind::DestinationUnreachable, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ToolRegistry> {
        let config = Config::from_str(&crate::config::minimal_toml()).unwrap().0;
        Arc::new(ToolRegistry::from_config(&config))
    }

    #[test]
    fn registry_respects_allowlist() {
        let registry = registry();
        let schemas = registry.schemas_for(&["transfer".into(), "hangup_call".into()]);
        let names: Vec<_> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"transfer"));
        assert!(names.contains(&"hangup_call"));
        assert!(!names.contains(&"send_email_summary"), "email disabled by default");
        assert!(!names.contains(&"leave_voicemail"), "not in allowlist");
    }

    #[test]
    fn at_most_one_running_tool() {
        let mut dispatcher = ToolDispatcher::new(registry());
        let first = ToolInvocation::new("1".into(), "transfer".into(), json!({}));
        let second = ToolInvocation::new("2".into(), "hangup_call".into(), json!({}));

        assert!(dispatcher.begin(&first).is_ok());
        let rejected = dispatcher.begin(&second).unwrap_err();
        assert_eq!(rejected.result["kind"], "invalid_args");

        dispatcher.finish("transfer");
        assert!(dispatcher.begin(&second).is_ok());
    }

    #[test]
    fn unknown_tool_is_a_structured_error() {
        let mut dispatcher = ToolDispatcher::new(registry());
        let invocation = ToolInvocation::new("1".into(), "format_disk".into(), json!({}));
        let rejected = dispatcher.begin(&invocation).unwrap_err();
        assert_eq!(rejected.result["status"], "error");
    }

    fn test_context() -> ToolContext {
        let config = Config::from_str(&crate::config::minimal_toml()).unwrap().0;
        let ari = AriClient::new(arivox_ari_client::AriConfig {
            base_url: "http://127.0.0.1:1".into(),
            username: "u".into(),
            password: "p".into(),
            app: "arivox".into(),
            request_timeout: Duration::from_millis(100),
        })
        .unwrap();
        ToolContext {
            ari,
            config: Arc::new(config),
            channel_id: "ch-1".into(),
            caller_name: "Alice".into(),
            caller_number: "100".into(),
            transcript: Vec::new(),
            watch: ChannelWatch::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
            emailed: Arc::new(parking_lot::Mutex::new(HashSet::new())),
        }
    }

    #[test]
    fn email_dedup_is_case_insensitive() {
        let ctx = test_context();
        assert!(ctx.mark_emailed("Caller@Example.COM"));
        assert!(!ctx.mark_emailed("caller@example.com"));
        assert!(ctx.mark_emailed("other@example.com"));
    }

    #[test]
    fn channel_watch_routes_only_registered() {
        let watch = ChannelWatch::new();
        assert!(!watch.route("ch-1", TransferSignal::Answered));

        let mut rx = watch.register("ch-1");
        assert!(watch.route("ch-1", TransferSignal::Digit('1')));
        assert_eq!(rx.try_recv().unwrap(), TransferSignal::Digit('1'));

        watch.release("ch-1");
        assert!(!watch.route("ch-1", TransferSignal::Gone));
    }
}
