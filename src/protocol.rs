// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! JSON frames over WebSocket text messages, tagged with a `type` field,
//! camelCase field names on the wire. Unknown frame types deserialize to
//! `Unknown` so the relay tolerates newer clients without closing on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::store::ChatMessage;

/// Protocol version, reported in the welcome frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Binds a session identity when the handshake did not establish one.
    Connect(ConnectRequest),
    /// A chat message to relay.
    Chat(ChatSend),
    /// Typing indicator for one receiver.
    Typing(TypingSend),
    /// Presence/status announcement.
    Presence(PresenceSend),
    /// Join/leave announcement.
    Join(JoinSend),
    /// Adds this connection to a topic.
    Subscribe(TopicRequest),
    /// Removes this connection from a topic.
    Unsubscribe(TopicRequest),
    /// Unrecognized frame types are ignored, not a protocol error.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSend {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "message")]
    pub body: String,
    /// Display name forwarded to the notification sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSend {
    pub sender_id: String,
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSend {
    pub user_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSend {
    pub user_id: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    pub topic: String,
}

/// Frames the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Session established; reports the identity the relay bound.
    Welcome(Welcome),
    /// Fan-out delivery of a persisted chat message.
    Message(ChatMessage),
    /// Typing indicator delivered to the receiver.
    Typing(TypingEvent),
    /// Presence/status/join event, published on the presence topic.
    Presence(PresenceEvent),
    /// Explicit rejection of a frame.
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub subject_id: String,
    pub anonymous: bool,
    pub server_version: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub sender_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: String,
    pub reason: String,
}

/// Creates a welcome frame for a freshly bound session.
pub fn create_welcome(subject_id: &str, anonymous: bool) -> ServerFrame {
    ServerFrame::Welcome(Welcome {
        subject_id: subject_id.to_string(),
        anonymous,
        server_version: PROTOCOL_VERSION,
    })
}

/// Creates a delivery frame carrying the full persisted message.
pub fn create_message(message: &ChatMessage) -> ServerFrame {
    ServerFrame::Message(message.clone())
}

/// Creates a typing indicator frame for the receiver.
pub fn create_typing(sender_id: &str, is_typing: bool) -> ServerFrame {
    ServerFrame::Typing(TypingEvent {
        sender_id: sender_id.to_string(),
        is_typing,
    })
}

/// Creates a presence event with a status field.
pub fn create_presence_status(user_id: &str, status: &str) -> ServerFrame {
    ServerFrame::Presence(PresenceEvent {
        user_id: user_id.to_string(),
        status: Some(status.to_string()),
        action: None,
        timestamp: Utc::now(),
    })
}

/// Creates a presence event with a join/leave action field.
pub fn create_presence_action(user_id: &str, action: &str) -> ServerFrame {
    ServerFrame::Presence(PresenceEvent {
        user_id: user_id.to_string(),
        status: None,
        action: Some(action.to_string()),
        timestamp: Utc::now(),
    })
}

/// Creates an error frame from a relay error.
pub fn create_error(error: &RelayError) -> ServerFrame {
    ServerFrame::Error(ErrorFrame {
        code: error.code().to_string(),
        reason: error.to_string(),
    })
}

/// Serializes a server frame to its wire form.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Parses a client frame from a text message.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat_frame() {
        let text = r#"{"type":"Chat","senderId":"u1","receiverId":"u2","message":"hello"}"#;
        let frame = decode_client_frame(text).unwrap();

        match frame {
            ClientFrame::Chat(chat) => {
                assert_eq!(chat.sender_id, "u1");
                assert_eq!(chat.receiver_id, "u2");
                assert_eq!(chat.body, "hello");
                assert!(chat.sender_name.is_none());
            }
            other => panic!("expected Chat frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_typing_frame() {
        let text = r#"{"type":"Typing","senderId":"u1","receiverId":"u2","isTyping":true}"#;
        let frame = decode_client_frame(text).unwrap();

        match frame {
            ClientFrame::Typing(typing) => {
                assert_eq!(typing.sender_id, "u1");
                assert!(typing.is_typing);
            }
            other => panic!("expected Typing frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_connect_without_credential() {
        let frame = decode_client_frame(r#"{"type":"Connect"}"#).unwrap();
        match frame {
            ClientFrame::Connect(connect) => assert!(connect.credential.is_none()),
            other => panic!("expected Connect frame, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let frame = decode_client_frame(r#"{"type":"Telepathy","strength":11}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Unknown));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(decode_client_frame("not json").is_err());
    }

    #[test]
    fn test_welcome_frame_wire_shape() {
        let encoded = encode_server_frame(&create_welcome("u1", false)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "Welcome");
        assert_eq!(value["subjectId"], "u1");
        assert_eq!(value["anonymous"], false);
        assert_eq!(value["serverVersion"], PROTOCOL_VERSION);
    }

    #[test]
    fn test_message_frame_carries_full_message() {
        let message = ChatMessage::new("u1", "u2", "hello");
        let encoded = encode_server_frame(&create_message(&message)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "Message");
        assert_eq!(value["senderId"], "u1");
        assert_eq!(value["receiverId"], "u2");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["id"], message.id.as_str());
    }

    #[test]
    fn test_error_frame_carries_stable_code() {
        let encoded =
            encode_server_frame(&create_error(&RelayError::InvalidPayload("empty body")))
                .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "Error");
        assert_eq!(value["code"], "INVALID_PAYLOAD");
    }

    #[test]
    fn test_presence_event_shapes() {
        let status = encode_server_frame(&create_presence_status("u1", "online")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["status"], "online");
        assert!(value.get("action").is_none());

        let action = encode_server_frame(&create_presence_action("u1", "leave")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&action).unwrap();
        assert_eq!(value["action"], "leave");
        assert!(value.get("status").is_none());
    }
}
