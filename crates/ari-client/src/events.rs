//! Typed ARI events
//!
//! Decoded from the JSON frames on the ARI WebSocket. Event types the
//! engine does not care about still parse, as `Unknown`, so a PBX upgrade
//! never kills the subscription.

use serde::Deserialize;

use crate::error::Result;
use crate::models::{Bridge, Channel, Playback};

/// Events delivered by the ARI WebSocket subscription
#[derive(Debug, Clone, PartialEq)]
pub enum AriEvent {
    /// A channel entered the Stasis application: a call for us
    StasisStart {
        channel: Channel,
        args: Vec<String>,
    },
    /// A channel left the Stasis application
    StasisEnd { channel: Channel },
    /// The far end asked to hang up
    ChannelHangupRequest {
        channel: Channel,
        cause: Option<i64>,
    },
    /// A DTMF digit arrived on a channel
    ChannelDtmfReceived {
        channel: Channel,
        digit: String,
        duration_ms: i64,
    },
    /// A channel variable changed
    ChannelVarset {
        channel: Option<Channel>,
        variable: String,
        value: String,
    },
    /// A channel was destroyed by the PBX
    ChannelDestroyed {
        channel: Channel,
        cause: Option<i64>,
    },
    /// A file playback we started has finished
    PlaybackFinished { playback: Playback },
    /// A channel joined a bridge
    ChannelEnteredBridge { bridge: Bridge, channel: Channel },
    /// A channel left a bridge
    ChannelLeftBridge { bridge: Bridge, channel: Channel },
    /// Any event type the engine does not interpret
    Unknown { event_type: String },
}

impl AriEvent {
    /// The channel id this event addresses, when it has one
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AriEvent::StasisStart { channel, .. }
            | AriEvent::StasisEnd { channel }
            | AriEvent::ChannelHangupRequest { channel, .. }
            | AriEvent::ChannelDtmfReceived { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. }
            | AriEvent::ChannelEnteredBridge { channel, .. }
            | AriEvent::ChannelLeftBridge { channel, .. } => Some(&channel.id),
            AriEvent::ChannelVarset { channel, .. } => {
                channel.as_ref().map(|c| c.id.as_str())
            }
            AriEvent::PlaybackFinished { .. } | AriEvent::Unknown { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct StasisStartBody {
    channel: Channel,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct ChannelBody {
    channel: Channel,
    #[serde(default)]
    cause: Option<i64>,
}

#[derive(Deserialize)]
struct DtmfBody {
    channel: Channel,
    digit: String,
    #[serde(default)]
    duration_ms: i64,
}

#[derive(Deserialize)]
struct VarsetBody {
    #[serde(default)]
    channel: Option<Channel>,
    variable: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct PlaybackBody {
    playback: Playback,
}

#[derive(Deserialize)]
struct BridgeBody {
    bridge: Bridge,
    channel: Channel,
}

/// Parse one WebSocket text frame into a typed event
pub fn parse_event(text: &str) -> Result<AriEvent> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let event = match event_type.as_str() {
        "StasisStart" => {
            let body: StasisStartBody = serde_json::from_value(value)?;
            AriEvent::StasisStart {
                channel: body.channel,
                args: body.args,
            }
        }
        "StasisEnd" => {
            let body: ChannelBody = serde_json::from_value(value)?;
            AriEvent::StasisEnd { channel: body.channel }
        }
        "ChannelHangupRequest" => {
            let body: ChannelBody = serde_json::from_value(value)?;
            AriEvent::ChannelHangupRequest {
                channel: body.channel,
                cause: body.cause,
            }
        }
        "ChannelDtmfReceived" => {
            let body: DtmfBody = serde_json::from_value(value)?;
            AriEvent::ChannelDtmfReceived {
                channel: body.channel,
                digit: body.digit,
                duration_ms: body.duration_ms,
            }
        }
        "ChannelVarset" => {
            let body: VarsetBody = serde_json::from_value(value)?;
            AriEvent::ChannelVarset {
                channel: body.channel,
                variable: body.variable,
                value: body.value,
            }
        }
        "ChannelDestroyed" => {
            let body: ChannelBody = serde_json::from_value(value)?;
            AriEvent::ChannelDestroyed {
                channel: body.channel,
                cause: body.cause,
            }
        }
        "PlaybackFinished" => {
            let body: PlaybackBody = serde_json::from_value(value)?;
            AriEvent::PlaybackFinished { playback: body.playback }
        }
        "ChannelEnteredBridge" => {
            let body: BridgeBody = serde_json::from_value(value)?;
            AriEvent::ChannelEnteredBridge {
                bridge: body.bridge,
                channel: body.channel,
            }
        }
        "ChannelLeftBridge" => {
            let body: BridgeBody = serde_json::from_value(value)?;
            AriEvent::ChannelLeftBridge {
                bridge: body.bridge,
                channel: body.channel,
            }
        }
        _ => AriEvent::Unknown { event_type },
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stasis_start() {
        let json = r#"{
            "type": "StasisStart",
            "application": "arivox",
            "args": ["inbound"],
            "channel": {
                "id": "1700000001.1",
                "name": "PJSIP/trunk-00000001",
                "state": "Ring",
                "caller": {"name": "Alice", "number": "+15550100"}
            }
        }"#;
        match parse_event(json).unwrap() {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "1700000001.1");
                assert_eq!(channel.caller.number, "+15550100");
                assert_eq!(args, vec!["inbound"]);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn parses_dtmf() {
        let json = r#"{
            "type": "ChannelDtmfReceived",
            "digit": "1",
            "duration_ms": 120,
            "channel": {"id": "abc"}
        }"#;
        match parse_event(json).unwrap() {
            AriEvent::ChannelDtmfReceived { digit, duration_ms, channel } => {
                assert_eq!(digit, "1");
                assert_eq!(duration_ms, 120);
                assert_eq!(channel.id, "abc");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn parses_playback_finished() {
        let json = r#"{
            "type": "PlaybackFinished",
            "playback": {
                "id": "pb-1",
                "media_uri": "sound:/var/lib/arivox/media/x",
                "target_uri": "channel:abc",
                "state": "done"
            }
        }"#;
        match parse_event(json).unwrap() {
            AriEvent::PlaybackFinished { playback } => assert_eq!(playback.id, "pb-1"),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_pass_through() {
        let json = r#"{"type": "ChannelTalkingStarted", "channel": {"id": "x"}}"#;
        match parse_event(json).unwrap() {
            AriEvent::Unknown { event_type } => {
                assert_eq!(event_type, "ChannelTalkingStarted")
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn channel_id_extraction() {
        let json = r#"{"type": "StasisEnd", "channel": {"id": "ch-9"}}"#;
        let event = parse_event(json).unwrap();
        assert_eq!(event.channel_id(), Some("ch-9"));
    }
}
