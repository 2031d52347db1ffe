//! Health check endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "parley-server",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": parley_protocol::PROTOCOL_VERSION,
        "connections": state.registry.len(),
    }))
}
