//! # Parley Server
//!
//! Real-time chat transport: WebSocket gateway for visitors and agents,
//! session routing, presence, and liveness, plus a small REST surface.

pub mod api;
pub mod services;
pub mod workers;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_common::AppConfig;
use services::SessionStore;
use ws::dispatcher::Dispatcher;
use ws::presence::PresenceTracker;
use ws::registry::ConnectionRegistry;
use ws::session_router::SessionRouter;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: SessionRouter,
    pub presence: PresenceTracker,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(
            config.realtime.outbound_queue_capacity,
            config.realtime.max_connections,
        ));
        let router = SessionRouter::new(Arc::clone(&registry));
        let presence = PresenceTracker::new(Arc::clone(&registry), router.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&registry), router.clone());

        Arc::new(Self {
            config,
            store,
            registry,
            router,
            presence,
            dispatcher,
        })
    }
}

/// Build the HTTP application: REST under `/api`, WebSockets under `/ws`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api::router(state.clone()))
        .nest("/ws", ws::router(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
