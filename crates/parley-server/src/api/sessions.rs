//! Session announcements from the session-creation flow.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::api::middleware::AuthUser;
use crate::AppState;
use parley_common::AppResult;
use parley_protocol::{canonical_session_id, ConnectionType};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{id}/announce", post(announce_session))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct AnnounceResponse {
    session_id: Uuid,
    notified: usize,
}

/// Push a `new_session` frame to every online agent of the caller's tenant.
async fn announce_session(
    auth: AuthUser,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<AnnounceResponse>> {
    auth.require_role(ConnectionType::Agent)?;

    let session = state
        .store
        .get_session_by_id(auth.tenant_id(), &canonical_session_id(&id))
        .await?;
    let notified = state.presence.notify_new_session(&session);

    Ok(Json(AnnounceResponse {
        session_id: session.id,
        notified,
    }))
}
