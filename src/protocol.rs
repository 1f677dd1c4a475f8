//! Wire-compatible protocol types for the Parlor chat protocol.
//!
//! Every type in this module produces the exact JSON the server speaks:
//! REST bodies for the session/room directory and text frames for the
//! realtime channel. Messages carry no server-assigned id — deduplication
//! and ordering are arrival-order concerns handled by the synchronizer.

use serde::{Deserialize, Serialize};

/// Opaque room identifier.
pub type RoomId = String;

// ── Messages ────────────────────────────────────────────────────────

/// Discriminates the three kinds of timeline entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A chat message authored by a user.
    Chat,
    /// System notice that a user joined the room.
    UserJoined,
    /// System notice that a user left the room.
    UserLeft,
}

/// One immutable timeline entry.
///
/// Serializes to the server's `{type, user, message, timestamp}` shape,
/// shared by the history endpoint and the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Author (or subject, for join/leave notices).
    #[serde(rename = "user", default)]
    pub author: String,
    /// Display text.
    #[serde(rename = "message", default)]
    pub body: String,
    /// Server timestamp, ISO 8601. Empty when the server omitted one.
    #[serde(default)]
    pub timestamp: String,
}

// ── REST payloads ───────────────────────────────────────────────────

/// Response body of `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    /// The session credential. Opaque; sent back as a bearer token.
    pub session_id: String,
    pub username: String,
    #[serde(default)]
    pub joined_rooms: Vec<RoomId>,
}

/// Response body of `GET /sessions/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub username: String,
    #[serde(default)]
    pub joined_rooms: Vec<RoomId>,
}

/// Response body of `POST /rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCreated {
    pub room_id: RoomId,
}

/// Response body of `GET /rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomList {
    #[serde(default)]
    pub rooms: Vec<RoomId>,
}

/// Response body of `GET /rooms/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistory {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Error body the server attaches to 4xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
}

// ── Realtime frames ─────────────────────────────────────────────────

/// Frames received from the server on the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A chat message broadcast to the room (including the local user's
    /// own messages, echoed back by the server).
    Chat {
        user: String,
        message: String,
        #[serde(default)]
        timestamp: String,
    },
    /// Another user is composing a message.
    Typing { user: String },
    /// A user joined the room.
    UserJoined {
        #[serde(default)]
        user: String,
        message: String,
        #[serde(default)]
        timestamp: String,
    },
    /// A user left the room.
    UserLeft {
        #[serde(default)]
        user: String,
        message: String,
        #[serde(default)]
        timestamp: String,
    },
}

/// Frames sent to the server on the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Send a chat message to the room.
    Chat { message: String },
    /// Announce that the local user is typing.
    Typing { user: String },
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_field_names() {
        let msg = Message {
            kind: MessageKind::Chat,
            author: "alice".into(),
            body: "hi".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "chat",
                "user": "alice",
                "message": "hi",
                "timestamp": "2024-01-01T00:00:00Z",
            })
        );
    }

    #[test]
    fn server_frame_chat_deserializes() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"chat","user":"bob","message":"hey","timestamp":"t1"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Chat {
                user: "bob".into(),
                message: "hey".into(),
                timestamp: "t1".into(),
            }
        );
    }

    #[test]
    fn server_frame_typing_has_no_message_field() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"typing","user":"bob"}"#).unwrap();
        assert_eq!(frame, ServerFrame::Typing { user: "bob".into() });
    }

    #[test]
    fn join_leave_frames_tolerate_missing_fields() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"user_joined","message":"bob entered"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::UserJoined {
                user: String::new(),
                message: "bob entered".into(),
                timestamp: String::new(),
            }
        );
    }

    #[test]
    fn client_frame_chat_wire_shape() {
        let json = serde_json::to_value(ClientFrame::Chat {
            message: "hello".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "chat", "message": "hello"}));
    }

    #[test]
    fn client_frame_typing_wire_shape() {
        let json = serde_json::to_value(ClientFrame::Typing {
            user: "alice".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "typing", "user": "alice"}));
    }

    #[test]
    fn session_created_parses_server_body() {
        let body = r#"{"session_id":"s-1","username":"alice","joined_rooms":["R1","R2"]}"#;
        let created: SessionCreated = serde_json::from_str(body).unwrap();
        assert_eq!(created.session_id, "s-1");
        assert_eq!(created.joined_rooms, vec!["R1".to_string(), "R2".to_string()]);
    }

    #[test]
    fn room_list_defaults_to_empty() {
        let list: RoomList = serde_json::from_str("{}").unwrap();
        assert!(list.rooms.is_empty());
    }
}
