//! JSON text-frame codec for the live channel.
//!
//! Every frame is `{"event": "<name>", "data": <payload>}`. Inbound decoding
//! also accepts the legacy event names (`msg-recieve`, `typing`,
//! `stop-typing`) and payload spellings older servers still emit.

use chat_core::{LiveEvent, OutboundEvent};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::WireError;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Timestamp as either epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireTimestamp {
    Millis(u64),
    Text(String),
}

impl WireTimestamp {
    pub(crate) fn to_millis(&self) -> Option<u64> {
        match self {
            Self::Millis(ms) => Some(*ms),
            Self::Text(raw) => parse_timestamp(raw),
        }
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<u64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|parsed| u64::try_from(parsed.timestamp_millis()).ok())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    #[serde(default, alias = "from")]
    sender_id: Option<String>,
    #[serde(alias = "message", alias = "msg")]
    text: String,
    #[serde(default, alias = "timestamp")]
    sent_at: Option<WireTimestamp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundTyping {
    #[serde(default, alias = "from")]
    sender_id: Option<String>,
}

pub fn encode(event: &OutboundEvent) -> Result<String, WireError> {
    let data = match event {
        OutboundEvent::AnnounceIdentity { user_id } => json!(user_id),
        OutboundEvent::SendMessage { to, from, text } => json!({
            "to": to,
            "from": from,
            "text": text,
        }),
        OutboundEvent::TypingStart { to, from } | OutboundEvent::TypingStop { to, from } => {
            json!({ "to": to, "from": from })
        }
    };
    serde_json::to_string(&Frame {
        event: event.name().to_owned(),
        data,
    })
    .map_err(|err| WireError::Encode(err.to_string()))
}

/// Decode one inbound frame. Unknown event names yield `Ok(None)`.
pub fn decode(text: &str) -> Result<Option<LiveEvent>, WireError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|err| WireError::Malformed(err.to_string()))?;

    let event = match frame.event.as_str() {
        "message-received" | "msg-recieve" => {
            let message = match frame.data {
                Value::String(text) => InboundMessage {
                    sender_id: None,
                    text,
                    sent_at: None,
                },
                data => serde_json::from_value::<InboundMessage>(data)
                    .map_err(|err| WireError::Malformed(err.to_string()))?,
            };
            LiveEvent::MessageReceived {
                sender_id: message.sender_id,
                text: message.text,
                sent_at_ms: message.sent_at.as_ref().and_then(WireTimestamp::to_millis),
            }
        }
        "typing-start" | "typing" => LiveEvent::TypingStarted {
            sender_id: typing_sender(frame.data)?,
        },
        "typing-stop" | "stop-typing" => LiveEvent::TypingStopped {
            sender_id: typing_sender(frame.data)?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn typing_sender(data: Value) -> Result<Option<String>, WireError> {
    let typing = match data {
        Value::Null => InboundTyping::default(),
        Value::String(sender) => InboundTyping {
            sender_id: Some(sender),
        },
        data => serde_json::from_value(data).map_err(|err| WireError::Malformed(err.to_string()))?,
    };
    Ok(typing.sender_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_outbound_frames() {
        let send = encode(&OutboundEvent::SendMessage {
            to: "bob".into(),
            from: "alice".into(),
            text: "hi".into(),
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&send).expect("valid json");
        assert_eq!(
            value,
            json!({"event": "send-message", "data": {"to": "bob", "from": "alice", "text": "hi"}})
        );

        let announce = encode(&OutboundEvent::AnnounceIdentity {
            user_id: "alice".into(),
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&announce).expect("valid json");
        assert_eq!(value, json!({"event": "add-user", "data": "alice"}));
    }

    #[test]
    fn decodes_message_with_timestamp_variants() {
        let millis = decode(r#"{"event":"message-received","data":{"senderId":"bob","text":"yo","sentAt":150}}"#)
            .expect("decode");
        assert_eq!(
            millis,
            Some(LiveEvent::MessageReceived {
                sender_id: Some("bob".into()),
                text: "yo".into(),
                sent_at_ms: Some(150),
            })
        );

        let rfc3339 = decode(
            r#"{"event":"message-received","data":{"from":"bob","message":"yo","timestamp":"1970-01-01T00:00:01.500Z"}}"#,
        )
        .expect("decode");
        assert_eq!(
            rfc3339,
            Some(LiveEvent::MessageReceived {
                sender_id: Some("bob".into()),
                text: "yo".into(),
                sent_at_ms: Some(1_500),
            })
        );
    }

    #[test]
    fn accepts_legacy_event_names() {
        assert_eq!(
            decode(r#"{"event":"msg-recieve","data":"hello"}"#).expect("decode"),
            Some(LiveEvent::MessageReceived {
                sender_id: None,
                text: "hello".into(),
                sent_at_ms: None,
            })
        );
        assert_eq!(
            decode(r#"{"event":"typing"}"#).expect("decode"),
            Some(LiveEvent::TypingStarted { sender_id: None })
        );
        assert_eq!(
            decode(r#"{"event":"stop-typing","data":{"from":"bob"}}"#).expect("decode"),
            Some(LiveEvent::TypingStopped {
                sender_id: Some("bob".into())
            })
        );
    }

    #[test]
    fn ignores_unknown_events_and_rejects_garbage() {
        assert_eq!(decode(r#"{"event":"presence","data":{}}"#).expect("decode"), None);
        assert!(matches!(decode("not json"), Err(WireError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"event":"message-received","data":{"senderId":"bob"}}"#),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn parses_numeric_and_rfc3339_timestamps() {
        assert_eq!(parse_timestamp("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00+00:00"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
