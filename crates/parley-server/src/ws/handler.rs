//! WebSocket handlers for visitor and agent connections.
//!
//! Identity and session checks happen before the upgrade; after it each
//! socket gets a read loop (this task) and a writer task draining the
//! connection's bounded outbound queue.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use parley_common::{AppError, AppResult};
use parley_protocol::{
    agent_global_session_id, canonical_session_id, ConnectionType, Envelope, MAX_FRAME_SIZE,
};

use super::registry::{CloseReason, Connection, ConnectionRegistry, Registration};
use crate::api::middleware::AuthUser;
use crate::AppState;

/// How long the writer gets to flush queued frames and the close frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_AGENT_NAME: &str = "Agent";

// ─── Upgrade handlers ────────────────────────────────────────

/// Visitor upgrade. The token must be bound to the session in the path.
pub async fn visitor_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    auth.require_role(ConnectionType::Visitor)?;
    let session_id = canonical_session_id(&session_id);

    let bound = auth.0.session_id.as_deref().map(canonical_session_id);
    if bound.as_deref() != Some(session_id.as_str()) {
        return Err(AppError::Forbidden("Token is not valid for this session".into()));
    }

    let session = state
        .store
        .get_session_by_id(auth.tenant_id(), &session_id)
        .await?;

    let registration = Registration {
        session_id,
        kind: ConnectionType::Visitor,
        tenant_id: auth.tenant_id(),
        peer_ref: None,
        display_name: session.visitor_name().to_string(),
    };
    upgrade(ws, state, registration)
}

/// Agent-global upgrade: one multiplexed connection per agent console.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    auth.require_role(ConnectionType::Agent)?;
    let agent_id = auth.0.sub;

    let registration = Registration {
        session_id: agent_global_session_id(&agent_id),
        kind: ConnectionType::Agent,
        tenant_id: auth.tenant_id(),
        peer_ref: Some(agent_id),
        display_name: agent_display_name(&auth),
    };
    upgrade(ws, state, registration)
}

/// Agent upgrade scoped to one session of the agent's tenant.
pub async fn agent_session_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    auth.require_role(ConnectionType::Agent)?;
    let session_id = canonical_session_id(&session_id);
    state
        .store
        .get_session_by_id(auth.tenant_id(), &session_id)
        .await?;

    let registration = Registration {
        session_id,
        kind: ConnectionType::Agent,
        tenant_id: auth.tenant_id(),
        peer_ref: Some(auth.0.sub),
        display_name: agent_display_name(&auth),
    };
    upgrade(ws, state, registration)
}

fn agent_display_name(auth: &AuthUser) -> String {
    auth.0
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_AGENT_NAME)
        .to_string()
}

/// Refuses with 503 while the registry is full or shutting down. A
/// registration that loses a race after the upgrade is closed with 1013.
fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    registration: Registration,
) -> AppResult<Response> {
    state
        .registry
        .admission()
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_connection(socket, state, registration))
        .into_response())
}

// ─── Connection lifecycle ────────────────────────────────────

/// Tears the connection down when dropped, so every exit path of the read
/// loop (including a panic in a handler) leaves the registry clean.
struct TeardownGuard {
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
    armed: bool,
}

impl TeardownGuard {
    fn new(registry: Arc<ConnectionRegistry>, conn: Arc<Connection>) -> Self {
        Self {
            registry,
            conn,
            armed: true,
        }
    }

    fn finish(mut self, reason: CloseReason) {
        self.armed = false;
        self.registry.teardown(&self.conn, reason);
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.teardown(&self.conn, CloseReason::TransportError);
        }
    }
}

async fn serve_connection(socket: WebSocket, state: Arc<AppState>, registration: Registration) {
    let (mut sink, mut stream) = socket.split();

    let (conn, rx) = match state.registry.register(registration) {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(error = %e, "Closing socket without registration");
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: "registration failed".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let guard = TeardownGuard::new(Arc::clone(&state.registry), Arc::clone(&conn));
    let writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&conn)));

    let welcome = Envelope::connected(
        conn.kind,
        &conn.session_id,
        &conn.id,
        &conn.display_name,
        conn.peer_ref.as_ref(),
    );
    state.router.send_to_connection(&conn, &welcome);

    let reason = loop {
        tokio::select! {
            // Torn down elsewhere, or the writer hit a socket error.
            _ = conn.cancelled() => break CloseReason::TransportError,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.dispatcher.handle_text(&conn, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    state.registry.touch_last_seen(&conn.id);
                }
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(connection_id = %conn.id, bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %conn.id, error = %e, "WebSocket read error");
                    break CloseReason::TransportError;
                }
            },
        }
    };

    guard.finish(reason);

    match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(connection_id = %conn.id, error = %e, "Writer task failed"),
        Err(_) => tracing::debug!(connection_id = %conn.id, "Writer did not finish in time"),
    }
}

/// Forward queued frames to the socket until the connection is torn down,
/// then flush what is left and send the close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<Connection>,
) {
    loop {
        tokio::select! {
            biased;
            _ = conn.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!(connection_id = %conn.id, error = %e, "WebSocket write error");
                        conn.abort();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::TransportError);
    let flush = async {
        // A slow consumer is dropped for not keeping up; don't keep feeding it.
        if reason != CloseReason::SlowConsumer {
            while let Ok(msg) = rx.try_recv() {
                sink.send(msg).await?;
            }
        }
        sink.send(Message::Close(Some(reason.close_frame()))).await?;
        sink.close().await?;
        Ok::<_, axum::Error>(())
    };
    let _ = tokio::time::timeout(WRITER_FLUSH_TIMEOUT, flush).await;
}
