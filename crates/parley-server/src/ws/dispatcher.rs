//! Inbound frame dispatch.
//!
//! Each text frame is decoded once into a [`ClientFrame`] and matched
//! exhaustively. Chat messages are persisted before they are relayed; every
//! other frame is ephemeral or a registry mutation.

use std::sync::Arc;

use parley_common::models::NewChatMessage;
use parley_protocol::{
    canonical_session_id, is_agent_global, ChatMessageData, ClientFrame, ConnectionType, Envelope, ReadReceiptData,
    TypingData,
};

use super::registry::{Connection, ConnectionRegistry};
use super::session_router::SessionRouter;
use crate::services::{SessionStore, StoreError};

const DEFAULT_MESSAGE_TYPE: &str = "text";

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
    router: SessionRouter,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ConnectionRegistry>,
        router: SessionRouter,
    ) -> Self {
        Self {
            store,
            registry,
            router,
        }
    }

    /// Decode and handle one text frame. Malformed frames are dropped.
    pub async fn handle_text(&self, conn: &Connection, text: &str) {
        match ClientFrame::decode(text) {
            Ok(frame) => self.dispatch(conn, frame).await,
            Err(e) => {
                tracing::warn!(
                    connection_id = %conn.id,
                    error = %e,
                    "Dropping malformed frame"
                );
            }
        }
    }

    pub async fn dispatch(&self, conn: &Connection, frame: ClientFrame) {
        tracing::trace!(connection_id = %conn.id, kind = frame.kind(), "Frame received");

        match frame {
            ClientFrame::ChatMessage { session_id, data } => {
                if let Some(sid) = self.target_session(conn, &session_id) {
                    self.on_chat_message(conn, &sid, data).await;
                }
            }
            ClientFrame::TypingStart { session_id, data } => {
                if let Some(sid) = self.target_session(conn, &session_id) {
                    self.on_typing(conn, &sid, true, data);
                }
            }
            ClientFrame::TypingStop { session_id, data } => {
                if let Some(sid) = self.target_session(conn, &session_id) {
                    self.on_typing(conn, &sid, false, data);
                }
            }
            ClientFrame::ReadReceipt { session_id, data } => {
                if let Some(sid) = self.target_session(conn, &session_id) {
                    self.on_read_receipt(conn, &sid, data).await;
                }
            }
            ClientFrame::Ping => {
                self.registry.touch_last_seen(&conn.id);
                self.router.send_to_connection(conn, &Envelope::pong());
            }
            ClientFrame::Pong => {
                self.registry.touch_last_seen(&conn.id);
            }
            ClientFrame::SessionSubscribe { session_id } => {
                self.on_subscription(conn, &session_id, true);
            }
            ClientFrame::SessionUnsubscribe { session_id } => {
                self.on_subscription(conn, &session_id, false);
            }
            ClientFrame::Unknown => {
                tracing::debug!(connection_id = %conn.id, "Ignoring unknown frame type");
            }
        }
    }

    /// Session a session-scoped frame applies to.
    ///
    /// Visitors and session-scoped agents default to their own session; a
    /// visitor naming any other session is refused. Agent-global connections
    /// must name one. Reserved agent-global ids are never a session.
    fn target_session(&self, conn: &Connection, requested: &str) -> Option<String> {
        let requested = canonical_session_id(requested);
        if is_agent_global(&requested) {
            tracing::warn!(
                connection_id = %conn.id,
                requested = %requested,
                "Frame names a reserved agent-global id"
            );
            return None;
        }

        if conn.is_agent_global() {
            if requested.is_empty() {
                tracing::warn!(connection_id = %conn.id, "Agent-global frame without session_id");
                return None;
            }
            return Some(requested);
        }

        if requested.is_empty() || requested == conn.session_id {
            return Some(conn.session_id.clone());
        }

        match conn.kind {
            ConnectionType::Agent => Some(requested),
            ConnectionType::Visitor => {
                tracing::warn!(
                    connection_id = %conn.id,
                    session_id = %conn.session_id,
                    requested = %requested,
                    "Visitor frame names a foreign session"
                );
                None
            }
        }
    }

    async fn on_chat_message(&self, conn: &Connection, session_id: &str, data: ChatMessageData) {
        let content = data.content.trim();
        if content.is_empty() {
            tracing::debug!(connection_id = %conn.id, %session_id, "Dropping empty chat message");
            return;
        }

        let session = match self.store.get_session_by_id(conn.tenant_id, session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(
                    connection_id = %conn.id,
                    tenant_id = %conn.tenant_id,
                    %session_id,
                    "Chat message for unknown session"
                );
                return;
            }
            Err(e) => {
                tracing::error!(connection_id = %conn.id, %session_id, error = %e, "Session lookup failed");
                self.router
                    .send_to_connection(conn, &Envelope::error(session_id, "Failed to send message"));
                return;
            }
        };

        if session.is_ended() {
            tracing::debug!(connection_id = %conn.id, %session_id, "Chat message on ended session");
        }

        let actor_name = match conn.kind {
            ConnectionType::Visitor => session.visitor_name().to_string(),
            ConnectionType::Agent => agent_name(conn, data.agent_name.as_deref()),
        };
        let new_message = NewChatMessage {
            tenant_id: session.tenant_id,
            project_id: session.project_id,
            session_id: session.id,
            content: content.to_string(),
            message_type: data
                .message_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            actor_type: conn.kind,
            actor_id: conn.peer_ref,
            actor_name,
        };

        let stored = match self.store.send_message(new_message).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(
                    connection_id = %conn.id,
                    %session_id,
                    error = %e,
                    "Failed to persist chat message"
                );
                self.router
                    .send_to_connection(conn, &Envelope::error(session_id, "Failed to send message"));
                return;
            }
        };

        let payload = match serde_json::to_value(&stored) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(message_id = %stored.id, error = %e, "Failed to encode chat message");
                return;
            }
        };
        let envelope = Envelope::chat_message(session_id, payload, conn.kind);
        let delivered = self.router.broadcast(&conn.tenant_id, session_id, &envelope);

        tracing::info!(
            connection_id = %conn.id,
            %session_id,
            message_id = %stored.id,
            delivered,
            "Chat message relayed"
        );
    }

    fn on_typing(&self, conn: &Connection, session_id: &str, is_typing: bool, data: TypingData) {
        let author_name = match conn.kind {
            ConnectionType::Visitor => conn.display_name.clone(),
            ConnectionType::Agent => agent_name(conn, data.agent_name.as_deref()),
        };
        let envelope = Envelope::typing(session_id, is_typing, &author_name, conn.kind);
        self.router.broadcast(&conn.tenant_id, session_id, &envelope);
    }

    async fn on_read_receipt(&self, conn: &Connection, session_id: &str, data: ReadReceiptData) {
        match self
            .store
            .mark_messages_read(conn.tenant_id, session_id, conn.kind, data.message_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(connection_id = %conn.id, %session_id, "Read receipt for unknown session");
            }
            Err(e) => {
                tracing::error!(connection_id = %conn.id, %session_id, error = %e, "Failed to mark messages read");
                self.router.send_to_connection(
                    conn,
                    &Envelope::error(session_id, "Failed to mark messages as read"),
                );
            }
        }
    }

    fn on_subscription(&self, conn: &Connection, session_id: &str, subscribe: bool) {
        let session_id = canonical_session_id(session_id);
        if session_id.is_empty() {
            tracing::warn!(connection_id = %conn.id, "Subscription change without session_id");
            return;
        }
        if is_agent_global(&session_id) {
            tracing::warn!(connection_id = %conn.id, %session_id, "Refusing subscription to a reserved agent-global id");
            return;
        }

        let result = if subscribe {
            self.registry.subscribe(&conn.id, &session_id)
        } else {
            self.registry.unsubscribe(&conn.id, &session_id)
        };
        if let Err(e) = result {
            tracing::warn!(connection_id = %conn.id, %session_id, error = %e, "Subscription change refused");
        }
    }
}

fn agent_name(conn: &Connection, from_frame: Option<&str>) -> String {
    match from_frame.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => conn.display_name.clone(),
    }
}
