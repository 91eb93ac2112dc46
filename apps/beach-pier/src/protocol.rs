use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionId;

/// Messages sent from client to gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Keepalive; answered with a single `PONG`
    Ping,
}

/// Messages sent from gateway to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Handshake carrying the identity assigned to this connection
    Hello {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// Response to ping
    Pong,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Both variants are plain structs of strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why an inbound frame produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not parseable as a JSON object
    Malformed,
    /// JSON object without a string `type` field
    MissingType,
    /// Well-formed but of a type this gateway does not handle
    UnknownType(String),
    /// Binary payload that is not UTF-8
    NotText,
    /// Frame arrived on a session that is not established
    NotEstablished,
    /// The session's writer has gone away; the connection is tearing down
    WriterClosed,
}

impl IgnoreReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IgnoreReason::Malformed => "malformed",
            IgnoreReason::MissingType => "missing_type",
            IgnoreReason::UnknownType(_) => "unknown_type",
            IgnoreReason::NotText => "not_text",
            IgnoreReason::NotEstablished => "not_established",
            IgnoreReason::WriterClosed => "writer_closed",
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    Ignored(IgnoreReason),
}

/// Decode a text frame. Never fails: anything unusable becomes `Inbound::Ignored`.
pub fn decode_frame(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value @ Value::Object(_)) => value,
        _ => return Inbound::Ignored(IgnoreReason::Malformed),
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Inbound::Ignored(IgnoreReason::MissingType);
    };

    match kind {
        "PING" => Inbound::Message(ClientMessage::Ping),
        other => Inbound::Ignored(IgnoreReason::UnknownType(truncate(other, 64))),
    }
}

/// Decode a binary frame; UTF-8 payloads are treated as text for compatibility.
pub fn decode_binary_frame(data: &[u8]) -> Inbound {
    match std::str::from_utf8(data) {
        Ok(text) => decode_frame(text),
        Err(_) => Inbound::Ignored(IgnoreReason::NotText),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ping_decodes() {
        assert_eq!(
            decode_frame(r#"{"type":"PING"}"#),
            Inbound::Message(ClientMessage::Ping)
        );
    }

    #[test_timeout::timeout]
    fn ping_with_extra_fields_decodes() {
        assert_eq!(
            decode_frame(r#"{"type":"PING","payload":{"ts":12}}"#),
            Inbound::Message(ClientMessage::Ping)
        );
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_ignored() {
        for frame in ["", "not json", "{", "[1,2]", "\"PING\"", "42", "null"] {
            assert_eq!(
                decode_frame(frame),
                Inbound::Ignored(IgnoreReason::Malformed),
                "frame {frame:?}"
            );
        }
    }

    #[test_timeout::timeout]
    fn missing_or_non_string_type_is_ignored() {
        assert_eq!(
            decode_frame(r#"{"kind":"PING"}"#),
            Inbound::Ignored(IgnoreReason::MissingType)
        );
        assert_eq!(
            decode_frame(r#"{"type":7}"#),
            Inbound::Ignored(IgnoreReason::MissingType)
        );
    }

    #[test_timeout::timeout]
    fn unknown_and_server_types_are_ignored() {
        assert_eq!(
            decode_frame(r#"{"type":"JOIN"}"#),
            Inbound::Ignored(IgnoreReason::UnknownType("JOIN".into()))
        );
        // Message types are case sensitive and server-only types are not accepted inbound.
        assert_eq!(
            decode_frame(r#"{"type":"ping"}"#),
            Inbound::Ignored(IgnoreReason::UnknownType("ping".into()))
        );
        assert_eq!(
            decode_frame(r#"{"type":"PONG"}"#),
            Inbound::Ignored(IgnoreReason::UnknownType("PONG".into()))
        );
    }

    #[test_timeout::timeout]
    fn binary_frames() {
        assert_eq!(
            decode_binary_frame(br#"{"type":"PING"}"#),
            Inbound::Message(ClientMessage::Ping)
        );
        assert_eq!(
            decode_binary_frame(&[0xff, 0xfe, 0x00]),
            Inbound::Ignored(IgnoreReason::NotText)
        );
    }

    #[test_timeout::timeout]
    fn server_messages_wire_format() {
        let id = SessionId::generate();
        let hello: Value = serde_json::from_str(&ServerMessage::Hello { session_id: id }.to_json())
            .expect("hello is json");
        assert_eq!(hello["type"], "HELLO");
        assert_eq!(hello["sessionId"], id.to_string());

        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"PONG"}"#);
    }
}
