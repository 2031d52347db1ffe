//! WebSocket gateway for real-time visitor ↔ agent chat.

pub mod dispatcher;
mod handler;
pub mod presence;
pub mod registry;
pub mod session_router;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/chat/{session_id}",
            axum::routing::get(handler::visitor_ws_handler),
        )
        .route("/agent", axum::routing::get(handler::agent_ws_handler))
        .route(
            "/agent/sessions/{session_id}",
            axum::routing::get(handler::agent_session_ws_handler),
        )
        .with_state(state)
}
