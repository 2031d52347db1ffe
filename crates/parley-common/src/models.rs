//! Chat domain models shared by the session stores and the transport.
//!
//! Rows are owned by the platform's persistence service; the transport only
//! reads sessions and appends messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_protocol::ConnectionType;

/// Author name used for visitors that never gave one.
pub const DEFAULT_VISITOR_NAME: &str = "Visitor";

/// A support conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// `initiated`, `active`, `assigned` or `ended`.
    pub status: String,
    pub assigned_agent_id: Option<Uuid>,
    pub customer_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    /// Name shown as the author of visitor messages.
    pub fn visitor_name(&self) -> &str {
        match self.customer_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => DEFAULT_VISITOR_NAME,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == "ended"
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub message_type: String,
    pub content: String,
    pub author_type: String,
    pub author_id: Option<Uuid>,
    pub author_name: String,
    pub is_private: bool,
    pub read_by_visitor: bool,
    pub read_by_agent: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to `SessionStore::send_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    pub message_type: String,
    pub actor_type: ConnectionType,
    pub actor_id: Option<Uuid>,
    pub actor_name: String,
}

impl NewChatMessage {
    /// Materialize the row as the store will insert it.
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            session_id: self.session_id,
            message_type: self.message_type,
            content: self.content,
            author_type: self.actor_type.as_str().to_string(),
            author_id: self.actor_id,
            author_name: self.actor_name,
            is_private: false,
            // An author has trivially read their own message.
            read_by_visitor: self.actor_type == ConnectionType::Visitor,
            read_by_agent: self.actor_type == ConnectionType::Agent,
            created_at: Utc::now(),
        }
    }
}
