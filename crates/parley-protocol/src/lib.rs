//! # parley-protocol
//!
//! Wire types for the Parley real-time chat channel.
//!
//! Every WebSocket text frame carries one JSON object. Frames sent by clients
//! decode into [`ClientFrame`]; frames produced by the server are built as
//! [`Envelope`] values and serialized once per broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Protocol version. Bump on breaking wire changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default liveness window: a connection silent for longer is evicted.
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 300;

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Prefix of the synthetic session id owned by an agent's multiplexed connection.
pub const AGENT_GLOBAL_PREFIX: &str = "agent-global-";

/// Session id for an agent's global connection.
pub fn agent_global_session_id(agent_id: &Uuid) -> String {
    format!("{AGENT_GLOBAL_PREFIX}{agent_id}")
}

/// Whether `session_id` is the synthetic id of an agent-global connection.
pub fn is_agent_global(session_id: &str) -> bool {
    session_id
        .strip_prefix(AGENT_GLOBAL_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Canonical form of a session id taken from a path or a frame.
///
/// UUIDs are normalized to lowercase hyphenated form so `ABC…` and `abc…`
/// address the same conversation; anything else is kept verbatim.
pub fn canonical_session_id(raw: &str) -> String {
    let raw = raw.trim();
    match Uuid::parse_str(raw) {
        Ok(id) => id.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Which side of a conversation a connection (or an author) is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Visitor,
    Agent,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Inbound ─────────────────────────────────────────────────

/// Payload of an inbound `chat_message`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatMessageData {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    /// Overrides the author name for agents sending through a shared console.
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Payload of an inbound `typing_start` / `typing_stop`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TypingData {
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Payload of an inbound `read_receipt`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReadReceiptData {
    #[serde(default)]
    pub message_id: Option<Uuid>,
}

/// A frame received from a client, decoded once at the socket boundary.
///
/// Unrecognised `type` values land in [`ClientFrame::Unknown`] so newer
/// clients never get disconnected by an older server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        data: ChatMessageData,
    },
    TypingStart {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        data: TypingData,
    },
    TypingStop {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        data: TypingData,
    },
    ReadReceipt {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        data: ReadReceiptData,
    },
    Ping,
    Pong,
    SessionSubscribe {
        #[serde(default)]
        session_id: String,
    },
    SessionUnsubscribe {
        #[serde(default)]
        session_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Wire name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::SessionSubscribe { .. } => "session_subscribe",
            Self::SessionUnsubscribe { .. } => "session_unsubscribe",
            Self::Unknown => "unknown",
        }
    }
}

// ─── Outbound ────────────────────────────────────────────────

/// Type tag of a server-originated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    ChatMessage,
    TypingStart,
    TypingStop,
    Pong,
    SessionUpdate,
    NewSession,
    Error,
    Connected,
    AgentConnected,
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: FrameType,
    /// Empty for connection-scoped frames.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_type: Option<ConnectionType>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: FrameType, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            data,
            from_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn sent_by(mut self, from_type: ConnectionType) -> Self {
        self.from_type = Some(from_type);
        self
    }

    /// A persisted chat message relayed to session recipients.
    pub fn chat_message(session_id: &str, message: Value, from_type: ConnectionType) -> Self {
        Self::new(FrameType::ChatMessage, session_id, message).sent_by(from_type)
    }

    pub fn typing(
        session_id: &str,
        is_typing: bool,
        author_name: &str,
        author_type: ConnectionType,
    ) -> Self {
        let kind = if is_typing {
            FrameType::TypingStart
        } else {
            FrameType::TypingStop
        };
        Self::new(
            kind,
            session_id,
            json!({
                "author_name": author_name,
                "author_type": author_type,
                "is_typing": is_typing,
            }),
        )
        .sent_by(author_type)
    }

    pub fn pong() -> Self {
        let now = Utc::now();
        Self::new(
            FrameType::Pong,
            "",
            json!({ "timestamp": now.to_rfc3339() }),
        )
    }

    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(FrameType::Error, session_id, json!({ "error": message.into() }))
    }

    pub fn new_session(session_id: &str, session: Value) -> Self {
        Self::new(FrameType::NewSession, session_id, session).sent_by(ConnectionType::Visitor)
    }

    /// Welcome frame sent immediately after a connection is registered.
    pub fn connected(
        kind: ConnectionType,
        session_id: &str,
        connection_id: &Uuid,
        display_name: &str,
        peer_ref: Option<&Uuid>,
    ) -> Self {
        match kind {
            ConnectionType::Visitor => Self::new(
                FrameType::Connected,
                session_id,
                json!({
                    "message": "Connected to chat session",
                    "connection_id": connection_id,
                }),
            )
            .sent_by(ConnectionType::Visitor),
            ConnectionType::Agent => Self::new(
                FrameType::AgentConnected,
                session_id,
                json!({
                    "message": format!("Connected to {display_name} console"),
                    "connection_id": connection_id,
                    "agent_id": peer_ref,
                }),
            )
            .sent_by(ConnectionType::Agent),
        }
    }

    pub fn to_json(&self) -> String {
        // Envelope only holds string keys and JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
