//! ARI resource models
//!
//! Only the fields the engine reads; ARI sends many more, serde drops the
//! rest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller identity attached to a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// Dialplan position of a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DialplanCep {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
    #[serde(default)]
    pub priority: i64,
}

/// A PBX channel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    #[serde(default)]
    pub dialplan: DialplanCep,
    /// Channel variables snapshotted by Asterisk, when configured
    #[serde(default)]
    pub channelvars: HashMap<String, String>,
}

/// A PBX mixing bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub bridge_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// A media playback operation started through `play_media`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub target_uri: String,
    #[serde(default)]
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_decodes_with_unknown_fields() {
        let json = r#"{
            "id": "1700000001.1",
            "name": "PJSIP/alice-00000001",
            "state": "Up",
            "caller": {"name": "Alice", "number": "100"},
            "dialplan": {"context": "from-internal", "exten": "s", "priority": 1, "app_name": "Stasis"},
            "creationtime": "2026-01-01T00:00:00.000+0000",
            "language": "en"
        }"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.id, "1700000001.1");
        assert_eq!(channel.caller.name, "Alice");
        assert_eq!(channel.dialplan.context, "from-internal");
        assert!(channel.channelvars.is_empty());
    }
}
