//! Live transport statistics for the caller's tenant.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::api::middleware::AuthUser;
use crate::ws::registry::TenantCounts;
use crate::AppState;
use parley_common::AppResult;
use parley_protocol::ConnectionType;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stats", get(realtime_stats))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct RealtimeStats {
    tenant_id: Uuid,
    #[serde(flatten)]
    connections: TenantCounts,
    online_agents: Vec<Uuid>,
}

async fn realtime_stats(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<RealtimeStats>> {
    auth.require_role(ConnectionType::Agent)?;
    let tenant_id = auth.tenant_id();

    Ok(Json(RealtimeStats {
        tenant_id,
        connections: state.registry.tenant_counts(&tenant_id),
        online_agents: state.presence.online_agent_ids(&tenant_id),
    }))
}
