//! Hangup and voicemail tools

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ToolErrorKind;

use super::{ToolContext, ToolDescriptor, ToolDisposition, ToolOutcome};

pub fn hangup_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "hangup_call",
        description: "End the call politely. Optionally speak a farewell message first.",
        parameters: json!({
            "type": "object",
            "properties": {
                "farewell_message": {
                    "type": "string",
                    "description": "Short goodbye to speak before hanging up",
                },
            },
        }),
        terminates_call: true,
        concurrent: false,
        timeout: Duration::from_secs(15),
    }
}

pub fn voicemail_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "leave_voicemail",
        description: "Send the caller to the voicemail system to leave a message.",
        parameters: json!({ "type": "object", "properties": {} }),
        terminates_call: true,
        concurrent: false,
        timeout: Duration::from_secs(10),
    }
}

/// `hangup_call`: the coordinator speaks the farewell and hangs up
/// after the configured delay; the tool just reports the plan
pub async fn hangup(args: &Value, ctx: &mut ToolContext) -> ToolOutcome {
    let farewell = args
        .get("farewell_message")
        .and_then(|f| f.as_str())
        .filter(|f| !f.trim().is_empty())
        .map(String::from);
    let delay = Duration::from_secs(ctx.config.tools.hangup.farewell_hangup_delay_sec);
    info!(farewell = farewell.is_some(), "hangup requested by agent");
    ToolOutcome::with_disposition(
        json!({ "status": "hanging_up" }),
        ToolDisposition::HangupAfter { farewell, delay },
    )
}

/// `leave_voicemail`: redirect the caller into the voicemail extension
pub async fn voicemail(ctx: &mut ToolContext) -> ToolOutcome {
    let hangup_cfg = &ctx.config.tools.hangup;
    match ctx
        .ari
        .redirect(
            &ctx.channel_id,
            &hangup_cfg.voicemail_context,
            &hangup_cfg.voicemail_exten,
            1,
        )
        .await
    {
        Ok(()) => {
            info!(exten = %hangup_cfg.voicemail_exten, "caller sent to voicemail");
            ToolOutcome::with_disposition(
                json!({ "status": "voicemail" }),
                ToolDisposition::TransferCommitted,
            )
        }
        Err(e) => {
            warn!("voicemail redirect failed: {e}");
            ToolOutcome::error(ToolErrorKind::DestinationUnreachable, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hangup_descriptor_terminates() {
        let descriptor = hangup_descriptor();
        assert!(descriptor.terminates_call);
        assert!(!descriptor.concurrent);
    }
}
