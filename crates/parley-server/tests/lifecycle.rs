//! Connection lifecycle: heartbeat eviction, shutdown, capacity limits.

mod common;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use common::*;
use parley_server::ws::registry::CloseReason;

#[tokio::test]
async fn test_silent_connection_is_evicted_with_going_away() {
    let config = test_config(json!({
        "heartbeat_interval_secs": 1,
        "liveness_timeout_secs": 1,
    }));
    let server = spawn_server_with(config).await;
    let tenant = Uuid::new_v4();

    let mut agent = connect(&server.url("/ws/agent", &agent_token(tenant, Uuid::new_v4(), "Ada"))).await;
    next_json(&mut agent).await;
    assert_eq!(server.state.registry.len(), 1);

    // Not reading means the server's pings go unanswered.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(server.state.registry.is_empty());
    assert_eq!(next_close_code(&mut agent).await, 1001);
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let server = spawn_server().await;
    let tenant = Uuid::new_v4();
    let session = server.create_session(tenant, None);

    let mut visitor = connect(&server.url(
        &format!("/ws/chat/{}", session.id),
        &visitor_token(tenant, &session.id),
    ))
    .await;
    next_json(&mut visitor).await;
    let mut agent = connect(&server.url("/ws/agent", &agent_token(tenant, Uuid::new_v4(), "Ada"))).await;
    next_json(&mut agent).await;

    assert_eq!(server.state.registry.close_all(CloseReason::ServerShutdown), 2);
    assert_eq!(next_close_code(&mut visitor).await, 1012);
    assert_eq!(next_close_code(&mut agent).await, 1012);

    // New upgrades are refused before the handshake completes.
    let status = connect_status(&server.url("/ws/agent", &agent_token(tenant, Uuid::new_v4(), "Bob"))).await;
    assert_eq!(status, 503);
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_connection_limit_refuses_registration() {
    let config = test_config(json!({ "max_connections": 1 }));
    let server = spawn_server_with(config).await;
    let tenant = Uuid::new_v4();

    let mut first = connect(&server.url("/ws/agent", &agent_token(tenant, Uuid::new_v4(), "Ada"))).await;
    assert_eq!(next_json(&mut first).await["type"], "agent_connected");

    let status = connect_status(&server.url("/ws/agent", &agent_token(tenant, Uuid::new_v4(), "Bob"))).await;
    assert_eq!(status, 503);

    sync(&mut first).await;
    assert_eq!(server.state.registry.len(), 1);
}
