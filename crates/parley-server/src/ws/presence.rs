//! Per-tenant view of online agents.

use std::collections::BTreeSet;
use std::sync::Arc;

use uuid::Uuid;

use parley_common::models::ChatSession;
use parley_protocol::{ConnectionType, Envelope};

use super::registry::{Connection, ConnectionRegistry};
use super::session_router::SessionRouter;

#[derive(Debug, Clone)]
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    router: SessionRouter,
}

impl PresenceTracker {
    pub fn new(registry: Arc<ConnectionRegistry>, router: SessionRouter) -> Self {
        Self { registry, router }
    }

    /// Snapshot of every agent connection (global and session-scoped) of the tenant.
    pub fn active_agents(&self, tenant_id: &Uuid) -> Vec<Arc<Connection>> {
        self.registry.list_by_tenant(tenant_id, ConnectionType::Agent)
    }

    /// Distinct ids of agents with at least one open connection, sorted.
    pub fn online_agent_ids(&self, tenant_id: &Uuid) -> Vec<Uuid> {
        self.active_agents(tenant_id)
            .iter()
            .filter_map(|conn| conn.peer_ref)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Announce a freshly created session to every online agent of its tenant.
    /// Returns how many connections accepted the frame.
    pub fn notify_new_session(&self, session: &ChatSession) -> usize {
        let data = match serde_json::to_value(session) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Failed to encode session");
                return 0;
            }
        };
        let envelope = Envelope::new_session(&session.id.to_string(), data);

        let notified = self
            .active_agents(&session.tenant_id)
            .iter()
            .filter(|conn| self.router.send_to_connection(conn, &envelope))
            .count();

        tracing::info!(
            session_id = %session.id,
            tenant_id = %session.tenant_id,
            notified,
            "New session announced to agents"
        );
        notified
    }
}
