//! Transfer tools
//!
//! `transfer` is a blind handoff: extensions are redirected straight to
//! the dialplan, queues and ring groups continue into their configured
//! contexts. `attended_transfer` is the warm variant: the caller waits
//! on hold while the destination is dialed, briefed and asked to accept
//! with DTMF; any timeout or decline resumes the conversation.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{Config, Destination, DestinationKind};
use crate::error::ToolErrorKind;

use super::{ToolContext, ToolDescriptor, ToolDisposition, ToolOutcome, TransferSignal};

fn destination_schema(config: &Config) -> Value {
    let known: Vec<&String> = config.tools.transfer.destinations.keys().collect();
    json!({
        "type": "object",
        "properties": {
            "destination": {
                "type": "string",
                "description": format!("Named destination to route the caller to. One of: {known:?}"),
            },
        },
        "required": ["destination"],
    })
}

pub fn blind_descriptor(config: &Config) -> ToolDescriptor {
    ToolDescriptor {
        name: "transfer",
        description: "Route the caller to a named destination (extension, queue or ring group) and end this conversation.",
        parameters: destination_schema(config),
        terminates_call: true,
        concurrent: false,
        timeout: Duration::from_secs(10),
    }
}

pub fn attended_descriptor(config: &Config) -> ToolDescriptor {
    let timers = &config.tools.attended_transfer;
    ToolDescriptor {
        name: "attended_transfer",
        description: "Warm transfer: put the caller on hold, dial the destination, announce the caller and bridge only if the destination accepts.",
        parameters: destination_schema(config),
        terminates_call: false,
        concurrent: false,
        timeout: Duration::from_secs(
            timers.dial_timeout_seconds + timers.accept_timeout_seconds + timers.tts_timeout_seconds + 10,
        ),
    }
}

pub fn cancel_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "cancel_transfer",
        description: "Abort the transfer that is currently ringing and resume the conversation.",
        parameters: json!({ "type": "object", "properties": {} }),
        terminates_call: false,
        concurrent: true,
        timeout: Duration::from_secs(5),
    }
}

fn lookup<'a>(args: &Value, ctx: &'a ToolContext) -> Result<(String, &'a Destination), ToolOutcome> {
    let Some(name) = args.get("destination").and_then(|d| d.as_str()) else {
        return Err(ToolOutcome::error(
            ToolErrorKind::InvalidArgs,
            "missing required argument 'destination'",
        ));
    };
    match ctx.config.tools.transfer.destinations.get(name) {
        Some(dest) => Ok((name.to_string(), dest)),
        None => Err(ToolOutcome::error(
            ToolErrorKind::DestinationNotFound,
            format!("'{name}' is not a known destination"),
        )),
    }
}

/// Blind transfer
pub async fn blind(args: &Value, ctx: &mut ToolContext) -> ToolOutcome {
    let (name, dest) = match lookup(args, ctx) {
        Ok(found) => found,
        Err(outcome) => return outcome,
    };
    let transfer = &ctx.config.tools.transfer;

    let verb = match dest.kind {
        DestinationKind::Extension => {
            ctx.ari
                .redirect(&ctx.channel_id, &transfer.ext_context, &dest.target, 1)
                .await
        }
        DestinationKind::Queue => {
            ctx.ari
                .continue_in_dialplan(&ctx.channel_id, &transfer.queue_context, &dest.target, 1)
                .await
        }
        DestinationKind::RingGroup => {
            ctx.ari
                .continue_in_dialplan(&ctx.channel_id, &transfer.ring_group_context, &dest.target, 1)
                .await
        }
    };
    if let Err(e) = verb {
        warn!(destination = %name, "blind transfer failed: {e}");
        return ToolOutcome::error(ToolErrorKind::DestinationUnreachable, e.to_string());
    }
    info!(destination = %name, target = %dest.target, "caller transferred");
    ToolOutcome::with_disposition(
        json!({ "status": "transferred", "destination": name }),
        ToolDisposition::TransferCommitted,
    )
}

/// Attended (warm) transfer
///
/// `BRIEFING → DEST_ANSWERED → AWAITING_DTMF → BRIDGED | DECLINED`;
/// every timer expiry counts as a decline.
pub async fn attended(args: &Value, ctx: &mut ToolContext) -> ToolOutcome {
    let (name, dest) = match lookup(args, ctx) {
        Ok(found) => found,
        Err(outcome) => return outcome,
    };
    if !dest.attended_allowed {
        return ToolOutcome::error(
            ToolErrorKind::InvalidArgs,
            format!("'{name}' does not allow attended transfer"),
        );
    }
    let dest = dest.clone();
    let timers = ctx.config.tools.attended_transfer.clone();
    let transfer = ctx.config.tools.transfer.clone();

    // caller on hold for the duration
    if let Err(e) = ctx.ari.start_moh(&ctx.channel_id, timers.moh_class.as_deref()).await {
        return ToolOutcome::error(ToolErrorKind::DestinationUnreachable, e.to_string());
    }

    let outcome = attended_inner(&name, &dest, &timers, &transfer, ctx).await;

    // hold ends on both the declined and bridged paths; on the bridged
    // path the channel already left MOH when it joined the bridge
    if !matches!(outcome.disposition, ToolDisposition::Bridged { .. }) {
        if let Err(e) = ctx.ari.stop_moh(&ctx.channel_id).await {
            debug!("stop_moh after transfer: {e}");
        }
    }
    outcome
}

async fn attended_inner(
    name: &str,
    dest: &Destination,
    timers: &crate::config::AttendedTransferConfig,
    transfer: &crate::config::TransferConfig,
    ctx: &mut ToolContext,
) -> ToolOutcome {
    let endpoint = format!("Local/{}@{}/n", dest.target, transfer.ext_context);
    let caller_id = format!("\"{}\" <{}>", ctx.caller_name, ctx.caller_number);
    let variables = std::collections::HashMap::new();
    let dest_channel = match ctx
        .ari
        .originate_dial(&endpoint, &caller_id, &variables, timers.dial_timeout_seconds)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(destination = %name, "attended dial failed: {e}");
            return ToolOutcome::error(ToolErrorKind::DestinationUnreachable, e.to_string());
        }
    };
    let mut signals = ctx.watch.register(&dest_channel.id);
    // ensure the watch is released on every path out
    let result = attended_drive(name, &dest_channel.id, timers, ctx, &mut signals).await;
    ctx.watch.release(&dest_channel.id);
    if !matches!(result.disposition, ToolDisposition::Bridged { .. }) {
        let _ = ctx.ari.hangup(&dest_channel.id).await;
    }
    result
}

async fn attended_drive(
    name: &str,
    dest_channel: &str,
    timers: &crate::config::AttendedTransferConfig,
    ctx: &mut ToolContext,
    signals: &mut tokio::sync::mpsc::Receiver<TransferSignal>,
) -> ToolOutcome {
    let declined = |reason: &str| {
        ToolOutcome::with_disposition(
            json!({ "status": "declined", "destination": name, "reason": reason }),
            ToolDisposition::Continue,
        )
    };

    // BRIEFING: wait for the destination to answer into our app
    let answered = timeout(Duration::from_secs(timers.dial_timeout_seconds), async {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(TransferSignal::Answered) => return Some(true),
                    Some(TransferSignal::Gone) | None => return Some(false),
                    Some(TransferSignal::Digit(_)) => continue,
                },
                _ = ctx.cancel.cancelled() => return None,
            }
        }
    })
    .await;
    match answered {
        Ok(Some(true)) => {}
        Ok(Some(false)) => return declined("destination unavailable"),
        Ok(None) | Err(_) => {
            return if ctx.cancel.is_cancelled() {
                declined("cancelled")
            } else {
                declined("no answer")
            }
        }
    }

    // DEST_ANSWERED: brief the destination and prompt for a digit
    let briefing = ctx
        .announce(
            dest_channel,
            Duration::from_secs(timers.tts_timeout_seconds),
        )
        .await;
    if let Err(e) = briefing {
        warn!("briefing playback failed: {e}");
    }

    // AWAITING_DTMF
    let decision = timeout(Duration::from_secs(timers.accept_timeout_seconds), async {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(TransferSignal::Digit('1')) => return Some(true),
                    Some(TransferSignal::Digit('2')) => return Some(false),
                    // unknown digits are ignored until the timer runs out
                    Some(TransferSignal::Digit(_)) => continue,
                    Some(TransferSignal::Gone) | None => return Some(false),
                    Some(TransferSignal::Answered) => continue,
                },
                _ = ctx.cancel.cancelled() => return None,
            }
        }
    })
    .await;

    match decision {
        Ok(Some(true)) => {
            // BRIDGED: swap the caller into a direct bridge
            let bridge = match ctx.ari.create_bridge("mixing").await {
                Ok(bridge) => bridge,
                Err(e) => return ToolOutcome::error(ToolErrorKind::DestinationUnreachable, e.to_string()),
            };
            let _ = ctx.ari.stop_moh(&ctx.channel_id).await;
            for channel in [ctx.channel_id.as_str(), dest_channel] {
                if let Err(e) = ctx.ari.add_to_bridge(&bridge.id, channel).await {
                    warn!("bridge add failed: {e}");
                    let _ = ctx.ari.destroy_bridge(&bridge.id).await;
                    return ToolOutcome::error(
                        ToolErrorKind::DestinationUnreachable,
                        e.to_string(),
                    );
                }
            }
            info!(destination = %name, bridge = %bridge.id, "attended transfer bridged");
            ToolOutcome::with_disposition(
                json!({ "status": "bridged", "destination": name }),
                ToolDisposition::Bridged {
                    bridge_id: bridge.id,
                    peer_channel: dest_channel.to_string(),
                },
            )
        }
        Ok(Some(false)) => declined("declined"),
        Ok(None) => declined("cancelled"),
        Err(_) => declined("accept timeout"),
    }
}

/// Abort an in-progress transfer while it is still ringing
pub async fn cancel(ctx: &mut ToolContext) -> ToolOutcome {
    ctx.cancel.cancel();
    ToolOutcome::ok(json!({ "status": "cancelling" }))
}

/// Prompt sequence played to the destination before the accept digit.
/// Stock Asterisk sounds so the briefing works without a TTS renderer;
/// deployments with richer prompts override them in the dialplan.
const BRIEFING_MEDIA: &str = "sound:transfer";
const ACCEPT_PROMPT_MEDIA: &str = "sound:if-correct-press&digits/1";

impl ToolContext {
    /// Play the briefing and accept prompt to the destination leg
    async fn announce(&self, channel_id: &str, wait: Duration) -> crate::error::Result<()> {
        let playback = self.ari.play_media(channel_id, BRIEFING_MEDIA).await?;
        debug!(playback = %playback.id, "briefing playing");
        let prompt = self.ari.play_media(channel_id, ACCEPT_PROMPT_MEDIA).await?;
        debug!(playback = %prompt.id, "accept prompt playing");
        tokio::time::sleep(wait.min(Duration::from_secs(4))).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lists_known_destinations() {
        let mut raw = crate::config::minimal_toml();
        raw.push_str(
            "\n[tools.transfer.destinations.sales_team]\nkind = \"ring_group\"\ntarget = \"600\"\n",
        );
        let config = Config::from_str(&raw).unwrap().0;
        let descriptor = blind_descriptor(&config);
        let description = descriptor.parameters["properties"]["destination"]["description"]
            .as_str()
            .unwrap();
        assert!(description.contains("sales_team"));
        assert!(descriptor.terminates_call);
    }

    #[test]
    fn attended_timeout_covers_all_timers() {
        let config = Config::from_str(&crate::config::minimal_toml()).unwrap().0;
        let descriptor = attended_descriptor(&config);
        let timers = &config.tools.attended_transfer;
        assert!(
            descriptor.timeout
                >= Duration::from_secs(
                    timers.dial_timeout_seconds + timers.accept_timeout_seconds
                )
        );
    }
}
