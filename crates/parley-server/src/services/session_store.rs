//! Boundary to the platform's session persistence.
//!
//! The transport reads session metadata and appends messages through this
//! trait; lifecycle and assignment rules live behind it.

use async_trait::async_trait;
use uuid::Uuid;

use parley_common::models::{ChatMessage, ChatSession, NewChatMessage};
use parley_common::AppError;
use parley_protocol::ConnectionType;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Session `session_id` of `tenant_id`. Ids of other tenants are `NotFound`.
    async fn get_session_by_id(
        &self,
        tenant_id: Uuid,
        session_id: &str,
    ) -> Result<ChatSession, StoreError>;

    /// Durably store a message; the returned row is what gets relayed.
    async fn send_message(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError>;

    /// Mark messages written by the other side as read by `reader`.
    /// With `message_id`, only that message is marked.
    async fn mark_messages_read(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        reader: ConnectionType,
        message_id: Option<Uuid>,
    ) -> Result<(), StoreError>;
}

/// Session ids on the wire are strings; rows are keyed by UUID.
pub(crate) fn parse_session_id(session_id: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(session_id).map_err(|_| StoreError::NotFound(session_id.to_string()))
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("session {id}")),
            StoreError::Rejected(reason) => AppError::BadRequest(reason),
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}
