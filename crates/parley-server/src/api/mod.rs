//! API routes module.

mod health;
pub mod middleware;
mod realtime;
mod sessions;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

/// Build the API router with all sub-routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/realtime", realtime::router(state.clone()))
        .nest("/sessions", sessions::router(state.clone()))
        .merge(health::router(state))
}
