// Wire protocol for the duplex client channel
//
// Frames are newline-delimited JSON objects tagged by a `type` field. The
// envelope tag owns the name `type`, so the text/image discriminator on
// messages travels as `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message content discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            _ => MessageKind::Text,
        }
    }
}

/// Events sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Present a session token issued by a prior login exchange.
    Auth { token: String },
    /// Authenticate with credentials directly on the channel.
    Login { username: String, password: String },
    /// Send a message to another user.
    SendMsg {
        receiver_id: i64,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },
    /// Fetch a page of conversation history (marks the peer's messages read).
    FetchHistory {
        conversation_id: i64,
        #[serde(default)]
        limit: Option<u32>,
    },
    /// Keep-alive.
    Ping,
}

/// A delivered message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry in a history page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender_id: i64,
    pub content: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Authentication accepted; the channel is now open.
    AuthOk { user_id: i64 },
    /// A message delivered to this connection (recipient copy or sender echo).
    ReceiveMsg(DeliveryPayload),
    /// A page of conversation history, oldest first.
    History {
        conversation_id: i64,
        messages: Vec<HistoryEntry>,
    },
    /// Keep-alive response.
    Pong,
    /// Operation failed; the connection stays open unless auth failed.
    Error { message: String },
}

impl ClientEvent {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl ServerEvent {
    /// Serialize to a newline-terminated JSON frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_msg_kind_defaults_to_text() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"send_msg","receiver_id":2,"content":"hi"}"#).unwrap();
        match event {
            ClientEvent::SendMsg { receiver_id, content, kind } => {
                assert_eq!(receiver_id, 2);
                assert_eq!(content, "hi");
                assert_eq!(kind, MessageKind::Text);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_receive_msg_timestamp_is_iso8601() {
        let event = ServerEvent::ReceiveMsg(DeliveryPayload {
            conversation_id: 1,
            sender_id: 1,
            content: "hi".to_string(),
            kind: "text".to_string(),
            timestamp: Utc::now(),
        });

        let bytes = event.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let value: serde_json::Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(value["type"], "receive_msg");
        // RFC 3339 timestamps parse back losslessly
        let raw = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(raw).is_ok());
    }

    #[test]
    fn test_garbage_frame_is_an_error() {
        assert!(ClientEvent::from_bytes(b"not json").is_err());
        assert!(ClientEvent::from_bytes(br#"{"type":"no_such_event"}"#).is_err());
    }
}
