//! PostgreSQL-backed session store over the platform's chat tables.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use parley_common::models::{ChatMessage, ChatSession, NewChatMessage};
use parley_protocol::ConnectionType;

use super::session_store::{parse_session_id, SessionStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get_session_by_id(
        &self,
        tenant_id: Uuid,
        session_id: &str,
    ) -> Result<ChatSession, StoreError> {
        let id = parse_session_id(session_id)?;

        let session: Option<ChatSession> = sqlx::query_as(
            r#"
            SELECT cs.id, cs.tenant_id, cs.project_id, cs.status, cs.assigned_agent_id,
                   c.name AS customer_name, cs.started_at, cs.ended_at
            FROM chat_sessions cs
            LEFT JOIN customers c ON cs.customer_id = c.id
            WHERE cs.tenant_id = $1 AND cs.id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        session.ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn send_message(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let row = message.into_message();
        let mut tx = self.db.begin().await?;

        let owned: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM chat_sessions WHERE id = $1 AND tenant_id = $2")
                .bind(row.session_id)
                .bind(row.tenant_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(StoreError::NotFound(row.session_id.to_string()));
        }

        let stored: ChatMessage = sqlx::query_as(
            r#"
            INSERT INTO chat_messages (
                id, tenant_id, project_id, session_id, message_type, content,
                author_type, author_id, author_name, is_private,
                read_by_visitor, read_by_agent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, tenant_id, project_id, session_id, message_type, content,
                      author_type, author_id, author_name, is_private,
                      read_by_visitor, read_by_agent, created_at
            "#,
        )
        .bind(row.id)
        .bind(row.tenant_id)
        .bind(row.project_id)
        .bind(row.session_id)
        .bind(&row.message_type)
        .bind(&row.content)
        .bind(&row.author_type)
        .bind(row.author_id)
        .bind(&row.author_name)
        .bind(row.is_private)
        .bind(row.read_by_visitor)
        .bind(row.read_by_agent)
        .bind(row.created_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE chat_sessions SET last_activity_at = NOW() WHERE id = $1")
            .bind(row.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn mark_messages_read(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        reader: ConnectionType,
        message_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let id = parse_session_id(session_id)?;

        // A reader marks what the other side wrote.
        let query = match reader {
            ConnectionType::Visitor => {
                r#"
                UPDATE chat_messages SET read_by_visitor = true, read_at = NOW()
                WHERE tenant_id = $1 AND session_id = $2 AND author_type = 'agent'
                  AND read_by_visitor = false AND ($3::uuid IS NULL OR id = $3)
                "#
            }
            ConnectionType::Agent => {
                r#"
                UPDATE chat_messages SET read_by_agent = true, read_at = NOW()
                WHERE tenant_id = $1 AND session_id = $2 AND author_type = 'visitor'
                  AND read_by_agent = false AND ($3::uuid IS NULL OR id = $3)
                "#
            }
        };

        let result = sqlx::query(query)
            .bind(tenant_id)
            .bind(id)
            .bind(message_id)
            .execute(&self.db)
            .await?;

        tracing::debug!(
            %session_id,
            reader = %reader,
            marked = result.rows_affected(),
            "Messages marked read"
        );
        Ok(())
    }
}
