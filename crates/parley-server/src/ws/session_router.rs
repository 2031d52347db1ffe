//! Resolves who should receive a session-scoped frame and fans it out.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes};
use uuid::Uuid;

use parley_protocol::Envelope;

use super::registry::{CloseReason, Connection, ConnectionId, ConnectionRegistry, SendError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("connection {0} could not accept the frame")]
    Undeliverable(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct SessionRouter {
    registry: Arc<ConnectionRegistry>,
}

impl SessionRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Every connection that should see frames for `(tenant_id, session_id)`:
    /// connections opened on the session plus agent-global subscribers.
    /// Each connection appears at most once.
    pub fn resolve_recipients(&self, tenant_id: &Uuid, session_id: &str) -> Vec<Arc<Connection>> {
        let mut seen = HashSet::new();
        self.registry
            .session_members(tenant_id, session_id)
            .into_iter()
            .chain(self.registry.session_subscribers(tenant_id, session_id))
            .filter(|conn| seen.insert(conn.id))
            .collect()
    }

    /// Deliver `envelope` to every recipient of the session.
    ///
    /// The frame is serialized once. Recipients whose queue is full or
    /// closed are torn down; the rest still receive it. Returns how many
    /// connections accepted the frame.
    pub fn broadcast(&self, tenant_id: &Uuid, session_id: &str, envelope: &Envelope) -> usize {
        let recipients = self.resolve_recipients(tenant_id, session_id);
        if recipients.is_empty() {
            tracing::debug!(%tenant_id, %session_id, "No recipients for session frame");
            return 0;
        }

        let payload = Utf8Bytes::from(envelope.to_json());
        let delivered = recipients
            .iter()
            .filter(|conn| self.deliver(conn, Message::Text(payload.clone())))
            .count();

        tracing::debug!(
            %tenant_id,
            %session_id,
            recipients = recipients.len(),
            delivered,
            "Session frame broadcast"
        );
        delivered
    }

    /// Deliver `envelope` to a single connection.
    pub fn send_to_one(&self, id: &ConnectionId, envelope: &Envelope) -> Result<(), RouteError> {
        let conn = self.registry.get(id).map_err(|_| RouteError::NotFound(*id))?;
        if self.send_to_connection(&conn, envelope) {
            Ok(())
        } else {
            Err(RouteError::Undeliverable(*id))
        }
    }

    /// Deliver to a connection handle already in hand.
    pub(crate) fn send_to_connection(&self, conn: &Connection, envelope: &Envelope) -> bool {
        self.deliver(conn, Message::Text(envelope.to_json().into()))
    }

    fn deliver(&self, conn: &Connection, msg: Message) -> bool {
        match conn.send(msg) {
            Ok(()) => true,
            Err(SendError::Full) => {
                tracing::warn!(
                    connection_id = %conn.id,
                    session_id = %conn.session_id,
                    "Outbound queue full, dropping slow consumer"
                );
                self.registry.teardown(conn, CloseReason::SlowConsumer);
                false
            }
            Err(SendError::Closed) => {
                self.registry.teardown(conn, CloseReason::TransportError);
                false
            }
        }
    }
}
