//! REST surface, driven in-process with `tower::ServiceExt::oneshot`.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use common::*;
use parley_server::app;

async fn call(server: &TestServer, method: &str, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {token}"));
    }
    let resp = app(server.state.clone())
        .oneshot(req.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server().await;
    let (status, body) = call(&server, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_stats_require_agent_token() {
    let server = spawn_server().await;
    let tenant = Uuid::new_v4();
    let session = server.create_session(tenant, None);

    let (status, body) = call(&server, "GET", "/api/realtime/stats", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], 401);

    let visitor = visitor_token(tenant, &session.id);
    let (status, _) = call(&server, "GET", "/api/realtime/stats", Some(&visitor)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_stats_report_tenant_connections() {
    let server = spawn_server().await;
    let tenant = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    let session = server.create_session(tenant, None);

    let mut agent = connect(&server.url("/ws/agent", &agent_token(tenant, agent_id, "Ada"))).await;
    next_json(&mut agent).await;
    let mut visitor = connect(&server.url(
        &format!("/ws/chat/{}", session.id),
        &visitor_token(tenant, &session.id),
    ))
    .await;
    next_json(&mut visitor).await;
    // Another tenant's agent must not show up.
    let mut other = connect(&server.url("/ws/agent", &agent_token(Uuid::new_v4(), Uuid::new_v4(), "Eve"))).await;
    next_json(&mut other).await;

    let token = agent_token(tenant, agent_id, "Ada");
    let (status, body) = call(&server, "GET", "/api/realtime/stats", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["visitors"], 1);
    assert_eq!(body["agents"], 1);
    assert_eq!(body["agent_global"], 1);
    assert_eq!(body["online_agents"], serde_json::json!([agent_id.to_string()]));
}

#[tokio::test]
async fn test_announce_notifies_online_agents() {
    let server = spawn_server().await;
    let tenant = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    let token = agent_token(tenant, agent_id, "Ada");

    let mut agent = connect(&server.url("/ws/agent", &token)).await;
    next_json(&mut agent).await;

    let session = server.create_session(tenant, Some("Grace"));
    let uri = format!("/api/sessions/{}/announce", session.id);
    let (status, body) = call(&server, "POST", &uri, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notified"], 1);

    let frame = next_json(&mut agent).await;
    assert_eq!(frame["type"], "new_session");
    assert_eq!(frame["session_id"], session.id.to_string());
    assert_eq!(frame["data"]["customer_name"], "Grace");

    let missing = format!("/api/sessions/{}/announce", Uuid::new_v4());
    let (status, _) = call(&server, "POST", &missing, Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
