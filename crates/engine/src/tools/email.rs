//! Email tools
//!
//! `send_email_summary` posts the call transcript and metadata to the
//! configured mail relay (an opaque HTTP service). `request_transcript`
//! is caller-initiated: the model extracts an address from speech, the
//! engine validates it (syntax, optionally DNS MX), asks the model to
//! read it back for confirmation, and sends at most once per address
//! per call.

use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ToolErrorKind;
use crate::session::transcript::TranscriptEntry;

use super::{ToolContext, ToolDescriptor, ToolOutcome};

pub fn summary_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "send_email_summary",
        description: "Email a summary of this call to the configured recipient.",
        parameters: json!({ "type": "object", "properties": {} }),
        terminates_call: false,
        concurrent: true,
        timeout: Duration::from_secs(15),
    }
}

pub fn transcript_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "request_transcript",
        description: "Email the call transcript to an address the caller provided. Call once with the address to validate it, read the normalized address back to the caller, then call again with confirmed=true to send.",
        parameters: json!({
            "type": "object",
            "properties": {
                "email": {
                    "type": "string",
                    "description": "Email address as understood from the caller's speech",
                },
                "confirmed": {
                    "type": "boolean",
                    "description": "True once the caller has confirmed the read-back address",
                },
            },
            "required": ["email"],
        }),
        terminates_call: false,
        concurrent: true,
        timeout: Duration::from_secs(20),
    }
}

/// Normalize a spoken address and check its shape
pub fn normalize_address(raw: &str) -> Result<String, String> {
    // spoken addresses come through STT with spelled-out punctuation
    let candidate = raw
        .trim()
        .to_ascii_lowercase()
        .replace(" at ", "@")
        .replace(" dot ", ".")
        .replace(' ', "");

    let mut parts = candidate.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    if local.is_empty() || domain.is_empty() {
        return Err(format!("'{raw}' is missing the @ separator"));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(format!("domain '{domain}' does not look valid"));
    }
    let ok_local = local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let ok_domain = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || ".-".contains(c));
    if !ok_local || !ok_domain {
        return Err(format!("'{candidate}' contains invalid characters"));
    }
    Ok(candidate)
}

async fn domain_has_mx(domain: &str) -> Result<bool, String> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    match resolver.mx_lookup(domain).await {
        Ok(lookup) => Ok(lookup.iter().next().is_some()),
        Err(e) => Err(e.to_string()),
    }
}

fn transcript_text(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}: {}", e.role, e.text))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn post_email(
    ctx: &ToolContext,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<(), String> {
    let email_cfg = &ctx.config.tools.email;
    if email_cfg.relay_url.is_empty() {
        return Err("no mail relay configured".into());
    }
    let client = reqwest::Client::new();
    let mut request = client.post(&email_cfg.relay_url).json(&json!({
        "to": to,
        "from": email_cfg.from_address,
        "subject": subject,
        "body": body,
        "date": chrono::Utc::now().to_rfc3339(),
    }));
    if !email_cfg.relay_token.is_empty() {
        request = request.bearer_auth(&email_cfg.relay_token);
    }
    let response = request
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("relay answered {}", response.status()))
    }
}

/// `send_email_summary`
pub async fn send_summary(ctx: &mut ToolContext) -> ToolOutcome {
    let email_cfg = &ctx.config.tools.email;
    if email_cfg.summary_recipient.is_empty() {
        return ToolOutcome::error(ToolErrorKind::InvalidArgs, "no summary recipient configured");
    }
    let subject = format!(
        "Call summary: {} ({})",
        ctx.caller_name, ctx.caller_number
    );
    let body = transcript_text(&ctx.transcript);
    match post_email(ctx, &email_cfg.summary_recipient.clone(), &subject, &body).await {
        Ok(()) => {
            info!(to = %email_cfg.summary_recipient, "call summary emailed");
            ToolOutcome::ok(json!({ "status": "sent" }))
        }
        Err(detail) => {
            warn!("summary email failed: {detail}");
            ToolOutcome::error(ToolErrorKind::DestinationUnreachable, detail)
        }
    }
}

/// `request_transcript`
pub async fn request_transcript(args: &Value, ctx: &mut ToolContext) -> ToolOutcome {
    let Some(raw) = args.get("email").and_then(|e| e.as_str()) else {
        return ToolOutcome::error(ToolErrorKind::InvalidArgs, "missing required argument 'email'");
    };
    let confirmed = args
        .get("confirmed")
        .and_then(|c| c.as_bool())
        .unwrap_or(false);

    let address = match normalize_address(raw) {
        Ok(address) => address,
        Err(reason) => return ToolOutcome::error(ToolErrorKind::InvalidArgs, reason),
    };

    if ctx.config.tools.email.mx_check {
        let domain = address.split('@').nth(1).unwrap_or_default();
        match domain_has_mx(domain).await {
            Ok(true) => {}
            Ok(false) => {
                return ToolOutcome::error(
                    ToolErrorKind::InvalidArgs,
                    format!("domain '{domain}' has no mail server"),
                )
            }
            Err(detail) => warn!("mx lookup failed, proceeding without: {detail}"),
        }
    }

    if !confirmed {
        // first pass: hand the normalized address back for read-back
        return ToolOutcome::ok(json!({
            "status": "needs_confirmation",
            "normalized": address,
            "instruction": "Read this address back to the caller and call again with confirmed=true once they agree.",
        }));
    }

    if !ctx.mark_emailed(&address) {
        return ToolOutcome::ok(json!({
            "status": "already_sent",
            "normalized": address,
        }));
    }

    let body = transcript_text(&ctx.transcript);
    match post_email(ctx, &address, "Your call transcript", &body).await {
        Ok(()) => {
            info!(to = %address, "transcript emailed");
            ToolOutcome::ok(json!({ "status": "sent", "normalized": address }))
        }
        Err(detail) => {
            warn!("transcript email failed: {detail}");
            ToolOutcome::error(ToolErrorKind::DestinationUnreachable, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_spoken_addresses() {
        assert_eq!(
            normalize_address("alice at example dot com").unwrap(),
            "alice@example.com"
        );
        assert_eq!(
            normalize_address(" Bob.Smith@Mail.example.ORG ").unwrap(),
            "bob.smith@mail.example.org"
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(normalize_address("not-an-address").is_err());
        assert!(normalize_address("user@").is_err());
        assert!(normalize_address("@example.com").is_err());
        assert!(normalize_address("user@nodot").is_err());
        assert!(normalize_address("user@.leading.dot").is_err());
        assert!(normalize_address("us er@exa mple.com").is_ok(), "spaces are collapsed");
        assert!(normalize_address("user!@example.com").is_err());
    }

    #[test]
    fn transcript_rendering_is_role_tagged() {
        let entries = vec![
            TranscriptEntry {
                role: "caller".into(),
                text: "What are your hours?".into(),
            },
            TranscriptEntry {
                role: "agent".into(),
                text: "We are open nine to five.".into(),
            },
        ];
        let text = transcript_text(&entries);
        assert!(text.starts_with("caller: What are your hours?"));
        assert!(text.contains("agent: We are open nine to five."));
    }
}
