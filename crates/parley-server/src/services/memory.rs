//! In-process session store for single-node deployments without a database
//! and for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use parley_common::models::{ChatMessage, ChatSession, NewChatMessage};
use parley_protocol::ConnectionType;

use super::session_store::{parse_session_id, SessionStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, ChatSession>>,
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a session.
    pub fn insert_session(&self, session: ChatSession) {
        self.sessions.write().insert(session.id, session);
    }

    /// Move a session to `ended`. Returns `false` for unknown ids.
    pub fn end_session(&self, session_id: &Uuid) -> bool {
        match self.sessions.write().get_mut(session_id) {
            Some(session) => {
                session.status = "ended".into();
                session.ended_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Messages of a session in insertion order.
    pub fn messages(&self, session_id: &Uuid) -> Vec<ChatMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.session_id == *session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session_by_id(
        &self,
        tenant_id: Uuid,
        session_id: &str,
    ) -> Result<ChatSession, StoreError> {
        let id = parse_session_id(session_id)?;
        self.sessions
            .read()
            .get(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn send_message(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        {
            let sessions = self.sessions.read();
            match sessions.get(&message.session_id) {
                Some(s) if s.tenant_id == message.tenant_id => {}
                Some(_) => {
                    return Err(StoreError::Rejected("session belongs to another tenant".into()))
                }
                None => return Err(StoreError::NotFound(message.session_id.to_string())),
            }
        }

        let row = message.into_message();
        self.messages.write().push(row.clone());
        Ok(row)
    }

    async fn mark_messages_read(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        reader: ConnectionType,
        message_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let id = parse_session_id(session_id)?;
        let author = match reader {
            ConnectionType::Visitor => ConnectionType::Agent,
            ConnectionType::Agent => ConnectionType::Visitor,
        };

        for msg in self.messages.write().iter_mut().filter(|m| {
            m.tenant_id == tenant_id
                && m.session_id == id
                && m.author_type == author.as_str()
                && message_id.is_none_or(|mid| m.id == mid)
        }) {
            match reader {
                ConnectionType::Visitor => msg.read_by_visitor = true,
                ConnectionType::Agent => msg.read_by_agent = true,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tenant_id: Uuid) -> ChatSession {
        ChatSession {
            id: Uuid::new_v4(),
            tenant_id,
            project_id: Uuid::new_v4(),
            status: "active".into(),
            assigned_agent_id: None,
            customer_name: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn new_message(session: &ChatSession, actor_type: ConnectionType) -> NewChatMessage {
        NewChatMessage {
            tenant_id: session.tenant_id,
            project_id: session.project_id,
            session_id: session.id,
            content: "hello".into(),
            message_type: "text".into(),
            actor_type,
            actor_id: None,
            actor_name: "Visitor".into(),
        }
    }

    #[tokio::test]
    async fn test_get_session_is_tenant_scoped() {
        let store = MemorySessionStore::new();
        let tenant = Uuid::new_v4();
        let s = session(tenant);
        store.insert_session(s.clone());

        let found = store.get_session_by_id(tenant, &s.id.to_string()).await.unwrap();
        assert_eq!(found.id, s.id);

        let other = store.get_session_by_id(Uuid::new_v4(), &s.id.to_string()).await;
        assert!(matches!(other, Err(StoreError::NotFound(_))));

        let bogus = store.get_session_by_id(tenant, "not-a-uuid").await;
        assert!(matches!(bogus, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_send_message_requires_session() {
        let store = MemorySessionStore::new();
        let s = session(Uuid::new_v4());

        let missing = store.send_message(new_message(&s, ConnectionType::Visitor)).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        store.insert_session(s.clone());
        let stored = store
            .send_message(new_message(&s, ConnectionType::Visitor))
            .await
            .unwrap();
        assert_eq!(store.messages(&s.id), vec![stored]);
    }

    #[tokio::test]
    async fn test_ended_session_still_accepts_messages() {
        let store = MemorySessionStore::new();
        let tenant = Uuid::new_v4();
        let s = session(tenant);
        store.insert_session(s.clone());

        assert!(store.end_session(&s.id));
        assert!(!store.end_session(&Uuid::new_v4()));

        let ended = store.get_session_by_id(tenant, &s.id.to_string()).await.unwrap();
        assert!(ended.is_ended());
        assert!(ended.ended_at.is_some());

        store
            .send_message(new_message(&s, ConnectionType::Visitor))
            .await
            .unwrap();
        assert_eq!(store.messages(&s.id).len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_other_side() {
        let store = MemorySessionStore::new();
        let s = session(Uuid::new_v4());
        store.insert_session(s.clone());
        let from_visitor = store
            .send_message(new_message(&s, ConnectionType::Visitor))
            .await
            .unwrap();
        let from_agent = store
            .send_message(new_message(&s, ConnectionType::Agent))
            .await
            .unwrap();

        store
            .mark_messages_read(s.tenant_id, &s.id.to_string(), ConnectionType::Visitor, None)
            .await
            .unwrap();

        let msgs = store.messages(&s.id);
        let visitor_msg = msgs.iter().find(|m| m.id == from_visitor.id).unwrap();
        let agent_msg = msgs.iter().find(|m| m.id == from_agent.id).unwrap();
        assert!(agent_msg.read_by_visitor);
        assert!(!visitor_msg.read_by_agent);
    }

    #[tokio::test]
    async fn test_mark_single_message_read() {
        let store = MemorySessionStore::new();
        let s = session(Uuid::new_v4());
        store.insert_session(s.clone());
        let first = store
            .send_message(new_message(&s, ConnectionType::Visitor))
            .await
            .unwrap();
        let second = store
            .send_message(new_message(&s, ConnectionType::Visitor))
            .await
            .unwrap();

        store
            .mark_messages_read(
                s.tenant_id,
                &s.id.to_string(),
                ConnectionType::Agent,
                Some(second.id),
            )
            .await
            .unwrap();

        let msgs = store.messages(&s.id);
        assert!(!msgs.iter().find(|m| m.id == first.id).unwrap().read_by_agent);
        assert!(msgs.iter().find(|m| m.id == second.id).unwrap().read_by_agent);
    }
}
