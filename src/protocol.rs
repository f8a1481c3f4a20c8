use crate::types::{Brightness, PluginId, RotateDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound WebSocket command envelope
///
/// Serialized as a JSON object whose `event` field names the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WsCommand {
    Rotate { direction: RotateDirection },
    PersistPlugin,
    Plugin { plugin: PluginId },
    Brightness { brightness: Brightness },
    Info,
}

impl WsCommand {
    /// JSON value of the envelope
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Frame received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Text frame parsed as JSON
    Json(Value),

    /// Raw pixel data
    Binary(Vec<u8>),
}

impl InboundMessage {
    /// Value of the `event` field, if this is a JSON envelope carrying one
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::Json(value) => value.get("event").and_then(Value::as_str),
            Self::Binary(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_use_event_discriminator() {
        let cases = [
            (
                WsCommand::Rotate { direction: RotateDirection::Right },
                json!({"event": "rotate", "direction": "right"}),
            ),
            (WsCommand::PersistPlugin, json!({"event": "persist-plugin"})),
            (WsCommand::Plugin { plugin: 4 }, json!({"event": "plugin", "plugin": 4})),
            (
                WsCommand::Brightness { brightness: 90 },
                json!({"event": "brightness", "brightness": 90}),
            ),
            (WsCommand::Info, json!({"event": "info"})),
        ];

        for (command, expected) in cases {
            assert_eq!(command.to_value().unwrap(), expected);
        }
    }

    #[test]
    fn inbound_event_name() {
        let msg = InboundMessage::Json(json!({"event": "info", "brightness": 3}));
        assert_eq!(msg.event(), Some("info"));
        assert_eq!(InboundMessage::Binary(vec![0; 4]).event(), None);
    }
}
