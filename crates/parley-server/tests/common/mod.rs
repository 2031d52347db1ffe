#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use parley_common::models::ChatSession;
use parley_common::AppConfig;
use parley_protocol::ConnectionType;
use parley_server::api::middleware::Claims;
use parley_server::services::MemorySessionStore;
use parley_server::{app, workers, AppState};

pub const SECRET: &str = "test-secret";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A server bound to an ephemeral port, backed by the in-memory store.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub store: Arc<MemorySessionStore>,
}

pub fn test_config(realtime: Value) -> AppConfig {
    serde_json::from_value(json!({
        "auth": { "jwt_secret": SECRET },
        "realtime": realtime,
    }))
    .expect("valid test config")
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(test_config(json!({}))).await
}

pub async fn spawn_server_with(config: AppConfig) -> TestServer {
    let store = Arc::new(MemorySessionStore::new());
    let state = AppState::new(config, store.clone());
    workers::start_all_workers(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer { addr, state, store }
}

impl TestServer {
    /// Insert an active session for `tenant_id` and return it.
    pub fn create_session(&self, tenant_id: Uuid, customer_name: Option<&str>) -> ChatSession {
        let session = ChatSession {
            id: Uuid::new_v4(),
            tenant_id,
            project_id: Uuid::new_v4(),
            status: "active".into(),
            assigned_agent_id: None,
            customer_name: customer_name.map(str::to_string),
            started_at: Utc::now(),
            ended_at: None,
        };
        self.store.insert_session(session.clone());
        session
    }

    pub fn url(&self, path: &str, token: &str) -> String {
        format!("ws://{}{}?token={}", self.addr, path, token)
    }
}

pub fn visitor_token(tenant_id: Uuid, session_id: &Uuid) -> String {
    let mut claims = Claims::new(Uuid::new_v4(), tenant_id, ConnectionType::Visitor, 3600);
    claims.session_id = Some(session_id.to_string());
    claims.sign(SECRET).unwrap()
}

pub fn agent_token(tenant_id: Uuid, agent_id: Uuid, name: &str) -> String {
    let mut claims = Claims::new(agent_id, tenant_id, ConnectionType::Agent, 3600);
    claims.name = Some(name.to_string());
    claims.sign(SECRET).unwrap()
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("websocket connect");
    ws
}

/// HTTP status of a refused upgrade.
pub async fn connect_status(url: &str) -> u16 {
    match connect_async(url).await {
        Ok(_) => 101,
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => resp.status().as_u16(),
        Err(e) => panic!("unexpected connect error: {e}"),
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(ws: &mut Ws) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Close code the server ends the connection with.
pub async fn next_close_code(ws: &mut Ws) -> u16 {
    let deadline = Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended before close frame")
            .expect("websocket error");
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

/// Assert that no text frame arrives within `window`.
pub async fn expect_silence(ws: &mut Ws, window: Duration) {
    let quiet = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    };
    if let Ok(Some(text)) = tokio::time::timeout(window, quiet).await {
        panic!("expected silence, got {text}");
    }
}

/// Round-trip a ping so everything sent before it has been dispatched.
pub async fn sync(ws: &mut Ws) {
    send_json(ws, json!({ "type": "ping" })).await;
    let pong = next_json(ws).await;
    assert_eq!(pong["type"], "pong");
}
